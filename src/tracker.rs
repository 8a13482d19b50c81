//! In-memory command lifecycle and device failure/alarm store.
//!
//! Shared by the orchestrator, matchmaker, workers and monitor. Every
//! map is a concurrent hash map and every counter an atomic; there are
//! no compound transactions — each operation is independently atomic.
//!
//! ## State machine
//!
//! ```text
//! mark_pending ──► Pending ──mark_processing──► Processing ──mark_completed──► Completed
//!                     │
//!                     └──mark_removed──► Removed
//! ```
//!
//! `Completed` and `Removed` are terminal; `mark_completed` is
//! unconditional so a result arriving for an already-removed id still
//! lands (last-writer-wins, kept for observability).

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::types::{
    Command, CommandKind, CommandResult, CommandState, CommandStatus, DeviceAlarmEntry,
    DeviceFailureEntry, Location,
};

/// Everything the tracker knows about one command.
#[derive(Debug, Clone)]
pub struct TrackedCommand {
    pub command_id: String,
    pub kind: CommandKind,
    pub device_affinity: Option<String>,
    pub source: Option<Location>,
    pub destination: Option<Location>,
    pub state: CommandState,
    pub device_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: Option<CommandStatus>,
    pub last_error: Option<String>,
    pub pallet_available: Option<bool>,
    pub pallet_unavailable: Option<bool>,
    /// Submission order, monotonic across the tracker's lifetime.
    pub seq: u64,
}

/// Point-in-time totals for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerSnapshot {
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_errors: u64,
    pub pending: usize,
    pub processing: usize,
}

/// Per-device aggregate counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceAggregates {
    pub completed: u64,
    pub errors: u64,
}

/// Point-in-time rollup for one device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRollup {
    pub device_id: String,
    /// Pending commands pinned to this device.
    pub queue_depth: usize,
    pub completed: u64,
    pub errors: u64,
    /// Idle, not failed, not alarmed.
    pub available: bool,
}

/// Thread-safe command/device state store.
#[derive(Debug, Default)]
pub struct PendingTracker {
    commands: DashMap<String, TrackedCommand>,
    /// device_id → command_id currently executing there.
    active_by_device: DashMap<String, String>,
    alarms: DashMap<String, DeviceAlarmEntry>,
    failures: DashMap<String, DeviceFailureEntry>,
    device_totals: DashMap<String, DeviceAggregates>,
    total_submitted: AtomicU64,
    total_completed: AtomicU64,
    total_errors: AtomicU64,
    seq: AtomicU64,
}

impl PendingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Command lifecycle ───────────────────────────────────────────────────

    /// Record a freshly submitted command as `Pending`. Overwrites any
    /// previous entry with the same id.
    pub fn mark_pending(&self, command: &Command) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.total_submitted.fetch_add(1, Ordering::SeqCst);
        self.commands.insert(
            command.command_id.clone(),
            TrackedCommand {
                command_id: command.command_id.clone(),
                kind: command.kind,
                device_affinity: command.device_affinity.clone(),
                source: command.source,
                destination: command.destination,
                state: CommandState::Pending,
                device_id: None,
                submitted_at: command.submitted_at,
                started_at: None,
                completed_at: None,
                status: None,
                last_error: None,
                pallet_available: None,
                pallet_unavailable: None,
                seq,
            },
        );
    }

    /// `Pending → Processing`; records the executing device and start
    /// time. Returns false (and does nothing) from any other state.
    pub fn mark_processing(&self, command_id: &str, device_id: &str) -> bool {
        let Some(mut entry) = self.commands.get_mut(command_id) else {
            return false;
        };
        if entry.state != CommandState::Pending {
            return false;
        }
        entry.state = CommandState::Processing;
        entry.device_id = Some(device_id.to_string());
        entry.started_at = Some(Utc::now());
        drop(entry);
        self.active_by_device
            .insert(device_id.to_string(), command_id.to_string());
        true
    }

    /// Unconditional terminal transition driven by a result.
    pub fn mark_completed(&self, result: &CommandResult) {
        self.total_completed.fetch_add(1, Ordering::SeqCst);
        let failed = result.status != CommandStatus::Success;
        if failed {
            self.total_errors.fetch_add(1, Ordering::SeqCst);
        }
        {
            let mut totals = self
                .device_totals
                .entry(result.device_id.clone())
                .or_default();
            totals.completed += 1;
            if failed {
                totals.errors += 1;
            }
        }

        if let Some(mut entry) = self.commands.get_mut(result.command_id.as_str()) {
            entry.state = CommandState::Completed;
            entry.device_id = Some(result.device_id.clone());
            entry.completed_at = Some(result.completed_at);
            entry.status = Some(result.status);
            if failed {
                entry.last_error = Some(result.message.clone());
            }
            entry.pallet_available = result.pallet_available;
            entry.pallet_unavailable = result.pallet_unavailable;
        }

        // Only clear the in-flight slot if this command still owns it.
        self.active_by_device
            .remove_if(&result.device_id, |_, active| {
                active == &result.command_id
            });
    }

    /// `Pending → Removed`. Returns whether the transition happened.
    pub fn mark_removed(&self, command_id: &str) -> bool {
        let Some(mut entry) = self.commands.get_mut(command_id) else {
            return false;
        };
        if entry.state != CommandState::Pending {
            return false;
        }
        entry.state = CommandState::Removed;
        true
    }

    /// Put a dequeued-but-never-dispatched command back to `Pending`
    /// (matchmaker shutdown path). Does not touch the submission counter.
    pub fn restore_pending(&self, command_id: &str) {
        if let Some(mut entry) = self.commands.get_mut(command_id) {
            if entry.state == CommandState::Processing {
                entry.state = CommandState::Pending;
                entry.device_id = None;
                entry.started_at = None;
            }
            // Pending stays Pending; terminal states stay terminal.
        }
    }

    pub fn state(&self, command_id: &str) -> Option<CommandState> {
        self.commands.get(command_id).map(|e| e.state)
    }

    pub fn get(&self, command_id: &str) -> Option<TrackedCommand> {
        self.commands.get(command_id).map(|e| e.clone())
    }

    // ─── Device in-flight queries ────────────────────────────────────────────

    /// Command currently executing on a device, if any.
    pub fn active_command(&self, device_id: &str) -> Option<String> {
        self.active_by_device.get(device_id).map(|e| e.clone())
    }

    /// Kind of the command in flight on a device, if any.
    pub fn in_flight_kind(&self, device_id: &str) -> Option<CommandKind> {
        let command_id = self.active_command(device_id)?;
        self.commands.get(&command_id).map(|e| e.kind)
    }

    /// Kinds of every command in flight across all devices.
    pub fn in_flight_kinds(&self) -> Vec<CommandKind> {
        self.active_by_device
            .iter()
            .filter_map(|entry| self.commands.get(entry.value()).map(|e| e.kind))
            .collect()
    }

    // ─── Device alarm / failure tables ───────────────────────────────────────

    pub fn set_alarm(&self, device_id: &str, code: i16, message: impl Into<String>) {
        self.alarms.insert(
            device_id.to_string(),
            DeviceAlarmEntry {
                device_id: device_id.to_string(),
                error_code: code,
                error_message: message.into(),
                raised_at: Utc::now(),
            },
        );
    }

    pub fn clear_alarm(&self, device_id: &str) {
        self.alarms.remove(device_id);
    }

    pub fn has_alarm(&self, device_id: &str) -> bool {
        self.alarms.contains_key(device_id)
    }

    /// Admission gate predicate: any device with an unresolved alarm.
    pub fn has_any_active_alarm(&self) -> bool {
        !self.alarms.is_empty()
    }

    pub fn alarm(&self, device_id: &str) -> Option<DeviceAlarmEntry> {
        self.alarms.get(device_id).map(|e| e.clone())
    }

    pub fn set_failure(&self, device_id: &str, message: impl Into<String>) {
        self.failures.insert(
            device_id.to_string(),
            DeviceFailureEntry {
                device_id: device_id.to_string(),
                last_error_message: message.into(),
                failed_at: Utc::now(),
            },
        );
    }

    pub fn clear_failure(&self, device_id: &str) {
        self.failures.remove(device_id);
    }

    pub fn has_failure(&self, device_id: &str) -> bool {
        self.failures.contains_key(device_id)
    }

    pub fn failure(&self, device_id: &str) -> Option<DeviceFailureEntry> {
        self.failures.get(device_id).map(|e| e.clone())
    }

    // ─── Aggregates & listings ───────────────────────────────────────────────

    pub fn pending_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|e| e.state == CommandState::Pending)
            .count()
    }

    pub fn processing_count(&self) -> usize {
        self.active_by_device.len()
    }

    /// Pending commands ordered by submission.
    pub fn pending_commands(&self) -> Vec<TrackedCommand> {
        let mut pending: Vec<_> = self
            .commands
            .iter()
            .filter(|e| e.state == CommandState::Pending)
            .map(|e| e.clone())
            .collect();
        pending.sort_by_key(|e| e.seq);
        pending
    }

    /// Processing commands ordered by start time.
    pub fn processing_commands(&self) -> Vec<TrackedCommand> {
        let mut processing: Vec<_> = self
            .commands
            .iter()
            .filter(|e| e.state == CommandState::Processing)
            .map(|e| e.clone())
            .collect();
        processing.sort_by_key(|e| e.started_at);
        processing
    }

    pub fn device_aggregates(&self, device_id: &str) -> DeviceAggregates {
        self.device_totals
            .get(device_id)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn device_rollup(&self, device_id: &str) -> DeviceRollup {
        let totals = self.device_aggregates(device_id);
        let queue_depth = self
            .commands
            .iter()
            .filter(|e| {
                e.state == CommandState::Pending
                    && e.device_affinity.as_deref() == Some(device_id)
            })
            .count();
        DeviceRollup {
            device_id: device_id.to_string(),
            queue_depth,
            completed: totals.completed,
            errors: totals.errors,
            available: self.active_command(device_id).is_none()
                && !self.has_failure(device_id)
                && !self.has_alarm(device_id),
        }
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            total_submitted: self.total_submitted.load(Ordering::SeqCst),
            total_completed: self.total_completed.load(Ordering::SeqCst),
            total_errors: self.total_errors.load(Ordering::SeqCst),
            pending: self.pending_count(),
            processing: self.processing_count(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn command(id: &str, kind: CommandKind) -> Command {
        Command {
            command_id: id.to_string(),
            device_affinity: None,
            kind,
            source: None,
            destination: None,
            gate_number: 0,
            enter_direction: None,
            exit_direction: None,
            submitted_at: Utc::now(),
        }
    }

    fn result(id: &str, device: &str, status: CommandStatus) -> CommandResult {
        CommandResult {
            command_id: id.to_string(),
            device_id: device.to_string(),
            status,
            message: String::new(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            plc_error: None,
            pallet_available: None,
            pallet_unavailable: None,
        }
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let tracker = PendingTracker::new();
        tracker.mark_pending(&command("c1", CommandKind::Outbound));
        assert_eq!(tracker.state("c1"), Some(CommandState::Pending));

        assert!(tracker.mark_processing("c1", "D1"));
        assert_eq!(tracker.state("c1"), Some(CommandState::Processing));
        assert_eq!(tracker.active_command("D1").as_deref(), Some("c1"));
        assert_eq!(tracker.in_flight_kind("D1"), Some(CommandKind::Outbound));

        tracker.mark_completed(&result("c1", "D1", CommandStatus::Success));
        assert_eq!(tracker.state("c1"), Some(CommandState::Completed));
        assert!(tracker.active_command("D1").is_none());

        let snap = tracker.snapshot();
        assert_eq!(snap.total_submitted, 1);
        assert_eq!(snap.total_completed, 1);
        assert_eq!(snap.total_errors, 0);
        assert_eq!(snap.processing, 0);
    }

    #[test]
    fn test_mark_processing_requires_pending() {
        let tracker = PendingTracker::new();
        tracker.mark_pending(&command("c1", CommandKind::Inbound));
        assert!(tracker.mark_removed("c1"));
        // Removed commands can never become Processing (invariant 6).
        assert!(!tracker.mark_processing("c1", "D1"));
        assert_eq!(tracker.state("c1"), Some(CommandState::Removed));
    }

    #[test]
    fn test_mark_removed_only_from_pending() {
        let tracker = PendingTracker::new();
        tracker.mark_pending(&command("c1", CommandKind::Inbound));
        assert!(tracker.mark_processing("c1", "D1"));
        assert!(!tracker.mark_removed("c1"));
    }

    #[test]
    fn test_error_counters() {
        let tracker = PendingTracker::new();
        tracker.mark_pending(&command("c1", CommandKind::Transfer));
        tracker.mark_processing("c1", "D1");
        tracker.mark_completed(&result("c1", "D1", CommandStatus::Failed));

        assert_eq!(tracker.snapshot().total_errors, 1);
        let agg = tracker.device_aggregates("D1");
        assert_eq!(agg.completed, 1);
        assert_eq!(agg.errors, 1);
    }

    #[test]
    fn test_alarm_gate() {
        let tracker = PendingTracker::new();
        assert!(!tracker.has_any_active_alarm());
        tracker.set_alarm("D1", 17, "motor fault");
        assert!(tracker.has_alarm("D1"));
        assert!(tracker.has_any_active_alarm());
        tracker.clear_alarm("D1");
        assert!(!tracker.has_any_active_alarm());
    }

    #[test]
    fn test_pending_listing_ordered_by_submission() {
        let tracker = PendingTracker::new();
        tracker.mark_pending(&command("a", CommandKind::Inbound));
        tracker.mark_pending(&command("b", CommandKind::Inbound));
        tracker.mark_pending(&command("c", CommandKind::Inbound));
        let ids: Vec<_> = tracker
            .pending_commands()
            .into_iter()
            .map(|e| e.command_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_restore_pending_after_dispatch() {
        let tracker = PendingTracker::new();
        tracker.mark_pending(&command("c1", CommandKind::Outbound));
        tracker.mark_processing("c1", "D1");
        tracker.restore_pending("c1");
        assert_eq!(tracker.state("c1"), Some(CommandState::Pending));

        // Terminal states are not revived.
        tracker.mark_processing("c1", "D1");
        tracker.mark_completed(&result("c1", "D1", CommandStatus::Success));
        tracker.restore_pending("c1");
        assert_eq!(tracker.state("c1"), Some(CommandState::Completed));
    }

    #[test]
    fn test_device_rollup() {
        let tracker = PendingTracker::new();
        let mut pinned = command("c1", CommandKind::Outbound);
        pinned.device_affinity = Some("D1".to_string());
        tracker.mark_pending(&pinned);
        tracker.mark_pending(&command("c2", CommandKind::Outbound));

        let rollup = tracker.device_rollup("D1");
        assert_eq!(rollup.queue_depth, 1); // only the pinned command
        assert!(rollup.available);

        tracker.set_failure("D1", "stuck");
        assert!(!tracker.device_rollup("D1").available);
    }

    #[test]
    fn test_in_flight_kinds_across_devices() {
        let tracker = PendingTracker::new();
        tracker.mark_pending(&command("c1", CommandKind::Transfer));
        tracker.mark_pending(&command("c2", CommandKind::Inbound));
        tracker.mark_processing("c1", "D1");
        tracker.mark_processing("c2", "D2");
        let mut kinds = tracker.in_flight_kinds();
        kinds.sort_by_key(|k| k.as_str());
        assert_eq!(kinds, vec![CommandKind::Inbound, CommandKind::Transfer]);
    }
}
