//! Orchestrator — owns the channel set, tracker, pause gate and workers.
//!
//! ## Architecture
//!
//! ```text
//! submit ──► input (cap 20) ──► Matchmaker ──► per-device (cap 1) ──► DeviceWorker
//!                                   ▲                                     │
//!                                   └──── availability (ReadyTicket) ◄────┤
//!                                                                         │
//! observers ◄── broadcast ◄── ReplyHub ◄──────── result channel ◄─────────┘
//! ```
//!
//! The reply hub sits between the result channel and external observers
//! so workers never touch the tracker's completion bookkeeping or the
//! broadcast fan-out directly. A single shutdown token is cloned into
//! every task; cancellation is cooperative at each await point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::{DeviceCapabilities, PlcConnectionConfig};
use crate::connection::ConnectionManager;
use crate::error::{CommandRejection, ConfigError, CoreError};
use crate::events::GatewayEvent;
use crate::executor::{ExecutionContext, DEFAULT_BARCODE_TIMEOUT, DEFAULT_TRIGGER_PULSE_HOLD};
use crate::matchmaker::Matchmaker;
use crate::rendezvous::BarcodeRendezvous;
use crate::signal_map::{SignalMap, SignalName};
use crate::tracker::{DeviceRollup, PendingTracker, TrackerSnapshot};
use crate::types::{
    BarcodeValidationResponse, Command, CommandResult, Location, ReadyTicket,
};
use crate::worker::DeviceWorker;

/// Input channel capacity; submitters block when the matchmaker lags.
const INPUT_CAPACITY: usize = 20;

/// Broadcast ring size for result/event observers.
const BROADCAST_CAPACITY: usize = 1024;

/// How long `stop` waits for each task before abandoning it.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Device registration & status
// ---------------------------------------------------------------------------

/// Everything needed to bring one device under orchestration.
pub struct DeviceRegistration {
    pub config: PlcConnectionConfig,
    pub transport: Box<dyn crate::transport::PlcTransport>,
}

/// Live view of one device, assembled on request.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatusReport {
    pub device_id: String,
    pub is_connected: bool,
    /// The PLC-side `SoftwareConnected` flag.
    pub is_link_established: bool,
    pub is_ready: bool,
    pub current_command_id: Option<String>,
    pub current_location: Option<Location>,
    pub capabilities: DeviceCapabilities,
    pub timestamp: DateTime<Utc>,
}

/// Per-device state the orchestrator keeps after registration.
struct DeviceHandle {
    conn: Arc<ConnectionManager>,
    signals: Arc<SignalMap>,
    capabilities: DeviceCapabilities,
    recovery: Arc<Notify>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Single owner of the command pipeline.
///
/// Lifecycle: `new → register_device* → start → (serving) → stop`.
/// Registration is only legal before `start`.
pub struct Orchestrator {
    tracker: Arc<PendingTracker>,
    rendezvous: Arc<BarcodeRendezvous>,

    input_tx: mpsc::Sender<Command>,
    input_rx: Option<mpsc::Receiver<Command>>,
    avail_tx: mpsc::UnboundedSender<ReadyTicket>,
    avail_rx: Option<mpsc::UnboundedReceiver<ReadyTicket>>,
    /// Dropped at `start` so the reply hub drains until the last worker
    /// sender is gone, never before.
    result_tx: Option<mpsc::UnboundedSender<CommandResult>>,
    result_rx: Option<mpsc::UnboundedReceiver<CommandResult>>,
    broadcast_tx: broadcast::Sender<CommandResult>,
    events_tx: broadcast::Sender<GatewayEvent>,

    pause_tx: Arc<watch::Sender<bool>>,
    pause_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    devices: HashMap<String, DeviceHandle>,
    device_tx: HashMap<String, mpsc::Sender<Command>>,
    pending_workers: Vec<DeviceWorker>,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

impl Orchestrator {
    pub fn new() -> Self {
        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
        let (avail_tx, avail_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (events_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (pause_tx, pause_rx) = watch::channel(true);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            tracker: Arc::new(PendingTracker::new()),
            rendezvous: Arc::new(BarcodeRendezvous::new()),
            input_tx,
            input_rx: Some(input_rx),
            avail_tx,
            avail_rx: Some(avail_rx),
            result_tx: Some(result_tx),
            result_rx: Some(result_rx),
            broadcast_tx,
            events_tx,
            pause_tx: Arc::new(pause_tx),
            pause_rx,
            shutdown_tx,
            shutdown_rx,
            devices: HashMap::new(),
            device_tx: HashMap::new(),
            pending_workers: Vec::new(),
            tasks: Vec::new(),
            started: false,
        }
    }

    /// Bring a device under orchestration. Legal only before `start`.
    pub fn register_device(&mut self, registration: DeviceRegistration) -> Result<(), CoreError> {
        if self.started {
            return Err(CoreError::RegistrationClosed);
        }
        let device_id = registration.config.device_id.clone();
        if self.devices.contains_key(&device_id) {
            return Err(ConfigError::DuplicateDevice(device_id).into());
        }

        let signals = Arc::new(registration.config.build_signal_map()?);
        let conn = Arc::new(ConnectionManager::new(
            device_id.clone(),
            registration.transport,
            (&registration.config).into(),
            self.shutdown_rx.clone(),
        ));
        let recovery = Arc::new(Notify::new());
        let (cmd_tx, cmd_rx) = mpsc::channel(1);

        let result_tx = self
            .result_tx
            .as_ref()
            .ok_or(CoreError::RegistrationClosed)?
            .clone();
        let ctx = ExecutionContext {
            device_id: device_id.clone(),
            conn: Arc::clone(&conn),
            signals: Arc::clone(&signals),
            tracker: Arc::clone(&self.tracker),
            result_tx,
            events_tx: self.events_tx.clone(),
            rendezvous: Arc::clone(&self.rendezvous),
            fail_on_alarm: registration.config.stop_on_alarm,
            trigger_pulse_hold: DEFAULT_TRIGGER_PULSE_HOLD,
            barcode_timeout: DEFAULT_BARCODE_TIMEOUT,
            shutdown_rx: self.shutdown_rx.clone(),
        };
        let worker = DeviceWorker {
            ctx,
            command_rx: cmd_rx,
            avail_tx: self.avail_tx.clone(),
            recovery: Arc::clone(&recovery),
            tuning: (&registration.config).into(),
            shutdown_rx: self.shutdown_rx.clone(),
        };

        self.device_tx.insert(device_id.clone(), cmd_tx);
        self.pending_workers.push(worker);
        self.devices.insert(
            device_id.clone(),
            DeviceHandle {
                conn,
                signals,
                capabilities: registration.config.capabilities,
                recovery,
            },
        );
        tracing::info!(device_id = %device_id, "device registered");
        Ok(())
    }

    /// Spawn the matchmaker, reply hub and all device workers.
    pub fn start(&mut self) -> Result<(), CoreError> {
        if self.started {
            return Err(CoreError::AlreadyStarted);
        }
        let input_rx = self.input_rx.take().ok_or(CoreError::AlreadyStarted)?;
        let avail_rx = self.avail_rx.take().ok_or(CoreError::AlreadyStarted)?;
        let result_rx = self.result_rx.take().ok_or(CoreError::AlreadyStarted)?;

        let matchmaker = Matchmaker {
            input_rx,
            avail_rx,
            device_tx: self.device_tx.clone(),
            capabilities: self
                .devices
                .iter()
                .map(|(id, h)| (id.clone(), h.capabilities))
                .collect(),
            tracker: Arc::clone(&self.tracker),
            pause_tx: Arc::clone(&self.pause_tx),
            pause_rx: self.pause_rx.clone(),
            shutdown_rx: self.shutdown_rx.clone(),
            fifo: Default::default(),
            ready: Default::default(),
        };
        self.tasks.push(tokio::spawn(matchmaker.run()));

        let hub = ReplyHub {
            result_rx,
            tracker: Arc::clone(&self.tracker),
            broadcast_tx: self.broadcast_tx.clone(),
            events_tx: self.events_tx.clone(),
        };
        self.tasks.push(tokio::spawn(hub.run()));

        for worker in self.pending_workers.drain(..) {
            self.tasks.push(tokio::spawn(worker.run()));
        }

        // Only the workers hold result senders from here on; the hub's
        // loop ends exactly when the last of them exits.
        self.result_tx = None;
        self.started = true;
        tracing::info!(devices = self.devices.len(), "Orchestrator started");
        Ok(())
    }

    // ─── Command surface ─────────────────────────────────────────────────────

    /// Record a command as pending and enqueue it. Blocks for
    /// backpressure when the input channel is full.
    pub async fn submit(&self, mut command: Command) -> Result<(), CommandRejection> {
        if !self.started {
            return Err(CommandRejection::QueueClosed);
        }
        command.submitted_at = Utc::now();
        self.tracker.mark_pending(&command);
        let command_id = command.command_id.clone();
        if self.input_tx.send(command).await.is_err() {
            // Channel closed mid-shutdown: the envelope is gone, record it.
            self.tracker.mark_removed(&command_id);
            return Err(CommandRejection::QueueClosed);
        }
        // Wake the matchmaker's pause gate.
        let _ = self.pause_tx.send(true);
        Ok(())
    }

    /// Drop a command that has not been assigned yet.
    pub fn remove(&self, command_id: &str) -> bool {
        self.tracker.mark_removed(command_id)
    }

    pub fn pause_scheduling(&self) {
        let _ = self.pause_tx.send(false);
        tracing::info!("scheduling paused");
    }

    pub fn resume_scheduling(&self) {
        let _ = self.pause_tx.send(true);
        tracing::info!("scheduling resumed");
    }

    pub fn is_paused(&self) -> bool {
        !*self.pause_rx.borrow()
    }

    /// Resolve a parked barcode validation.
    pub fn send_validation_result(
        &self,
        command_id: &str,
        response: BarcodeValidationResponse,
    ) -> Result<(), CoreError> {
        self.rendezvous.resolve(command_id, response)
    }

    // ─── Observation ─────────────────────────────────────────────────────────

    /// Lazy, cancellable stream of every `CommandResult`. Each call gets
    /// an independent subscription; multiple observers are supported.
    pub fn observe_results(&self) -> BroadcastStream<CommandResult> {
        BroadcastStream::new(self.broadcast_tx.subscribe())
    }

    /// Event projection of the result stream plus barcode events.
    pub fn observe_events(&self) -> BroadcastStream<GatewayEvent> {
        BroadcastStream::new(self.events_tx.subscribe())
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        self.tracker.snapshot()
    }

    pub fn command_state(&self, command_id: &str) -> Option<crate::types::CommandState> {
        self.tracker.state(command_id)
    }

    pub fn device_rollup(&self, device_id: &str) -> DeviceRollup {
        self.tracker.device_rollup(device_id)
    }

    pub fn tracker(&self) -> &Arc<PendingTracker> {
        &self.tracker
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn has_device(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn device_capabilities(&self, device_id: &str) -> Option<DeviceCapabilities> {
        self.devices.get(device_id).map(|h| h.capabilities)
    }

    // ─── Device surface ──────────────────────────────────────────────────────

    /// Connect one device's PLC link.
    pub async fn connect_device(&self, device_id: &str) -> Result<(), CoreError> {
        let handle = self.device(device_id)?;
        handle.conn.connect().await?;
        Ok(())
    }

    pub async fn connect_all(&self) -> Result<(), CoreError> {
        for (device_id, handle) in &self.devices {
            handle.conn.connect().await.map_err(|e| {
                tracing::error!(device_id = %device_id, error = %e, "activation failed");
                CoreError::Transport(e)
            })?;
        }
        Ok(())
    }

    /// Wake a device parked in its recovery gate. No-op when the device
    /// is not waiting.
    pub fn trigger_device_recovery(&self, device_id: &str) -> Result<(), CoreError> {
        let handle = self.device(device_id)?;
        handle.recovery.notify_waiters();
        tracing::info!(device_id = %device_id, "manual recovery triggered");
        Ok(())
    }

    /// Live status, read from the PLC at call time.
    pub async fn device_status(&self, device_id: &str) -> Result<DeviceStatusReport, CoreError> {
        let handle = self.device(device_id)?;
        let is_connected = handle.conn.is_connected().await;

        // Flag reads are best-effort: a dead link reports false, not an
        // error, so status stays available while a device is down.
        let is_link_established = self
            .read_device_flag(handle, SignalName::SoftwareConnected)
            .await
            .unwrap_or(false);
        let is_ready = self
            .read_device_flag(handle, SignalName::DeviceReady)
            .await
            .unwrap_or(false);
        let current_location = self.read_location(handle).await.ok();

        Ok(DeviceStatusReport {
            device_id: device_id.to_string(),
            is_connected,
            is_link_established,
            is_ready,
            current_command_id: self.tracker.active_command(device_id),
            current_location,
            capabilities: handle.capabilities,
            timestamp: Utc::now(),
        })
    }

    /// Read the device's live `(floor, rail, block, depth)` registers.
    pub async fn actual_location(&self, device_id: &str) -> Result<Location, CoreError> {
        let handle = self.device(device_id)?;
        Ok(self.read_location(handle).await?)
    }

    // ─── Shutdown ────────────────────────────────────────────────────────────

    /// Cancel every task, join with a small drain grace, close the PLC
    /// links. In-flight commands surface as `Failed`/`Timeout` results
    /// before their workers exit; undispatched commands stay `Pending`.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        tracing::info!("Orchestrator stopping");
        let _ = self.shutdown_tx.send(true);

        for task in self.tasks.drain(..) {
            match tokio::time::timeout(DRAIN_GRACE, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => {
                    tracing::error!(error = %e, "task panicked during shutdown")
                }
                Ok(Err(_)) => {}
                Err(_) => tracing::warn!("task did not drain in time, abandoning"),
            }
        }

        for handle in self.devices.values() {
            handle.conn.disconnect().await;
        }
        self.started = false;
        tracing::info!("Orchestrator stopped");
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    fn device(&self, device_id: &str) -> Result<&DeviceHandle, CoreError> {
        self.devices
            .get(device_id)
            .ok_or_else(|| CoreError::UnknownDevice(device_id.to_string()))
    }

    async fn read_device_flag(
        &self,
        handle: &DeviceHandle,
        signal: SignalName,
    ) -> Result<bool, crate::error::TransportError> {
        let addr = handle.signals.addr(signal)?;
        handle.conn.read_bool(&addr).await
    }

    async fn read_location(
        &self,
        handle: &DeviceHandle,
    ) -> Result<Location, crate::error::TransportError> {
        let mut values = [0u16; 4];
        for (slot, signal) in values.iter_mut().zip([
            SignalName::CurrentFloor,
            SignalName::CurrentRail,
            SignalName::CurrentBlock,
            SignalName::CurrentDepth,
        ]) {
            let addr = handle.signals.addr(signal)?;
            *slot = handle.conn.read_word(&addr).await? as u16;
        }
        Ok(Location {
            floor: values[0],
            rail: values[1],
            block: values[2],
            depth: values[3],
        })
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ReplyHub
// ---------------------------------------------------------------------------

/// Drains the result channel: terminal results update the tracker, and
/// everything (terminal and intermediate alarms alike) is re-broadcast
/// to observers plus projected onto the event stream.
///
/// No shutdown arm on purpose: the channel closes when the last worker
/// drops its sender, so every result published during cancellation is
/// still delivered to observers.
struct ReplyHub {
    result_rx: mpsc::UnboundedReceiver<CommandResult>,
    tracker: Arc<PendingTracker>,
    broadcast_tx: broadcast::Sender<CommandResult>,
    events_tx: broadcast::Sender<GatewayEvent>,
}

impl ReplyHub {
    async fn run(mut self) {
        tracing::debug!("ReplyHub started");
        while let Some(result) = self.result_rx.recv().await {
            self.handle(result);
        }
        tracing::debug!("ReplyHub stopped");
    }

    fn handle(&self, result: CommandResult) {
        if result.status.is_terminal() {
            self.tracker.mark_completed(&result);
        }
        let _ = self.events_tx.send(GatewayEvent::from_result(&result));
        let _ = self.broadcast_tx.send(result);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests_support::emulated_device;

    fn registration(device_id: &str) -> DeviceRegistration {
        let (config, plc) = emulated_device(device_id);
        DeviceRegistration {
            config,
            transport: Box::new(plc),
        }
    }

    #[tokio::test]
    async fn test_registration_closed_after_start() {
        let mut orch = Orchestrator::new();
        orch.register_device(registration("D1")).unwrap();
        orch.start().unwrap();

        let err = orch.register_device(registration("D2")).unwrap_err();
        assert!(matches!(err, CoreError::RegistrationClosed));
        orch.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let mut orch = Orchestrator::new();
        orch.register_device(registration("D1")).unwrap();
        let err = orch.register_device(registration("D1")).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Config(ConfigError::DuplicateDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_before_start_rejected() {
        let orch = Orchestrator::new();
        let command = Command {
            command_id: "c1".to_string(),
            device_affinity: None,
            kind: crate::types::CommandKind::Outbound,
            source: None,
            destination: None,
            gate_number: 1,
            enter_direction: None,
            exit_direction: None,
            submitted_at: Utc::now(),
        };
        let err = orch.submit(command).await.unwrap_err();
        assert_eq!(err, CommandRejection::QueueClosed);
    }

    #[tokio::test]
    async fn test_pause_resume_gate() {
        let mut orch = Orchestrator::new();
        orch.register_device(registration("D1")).unwrap();
        orch.start().unwrap();

        assert!(!orch.is_paused());
        orch.pause_scheduling();
        assert!(orch.is_paused());
        orch.resume_scheduling();
        assert!(!orch.is_paused());
        orch.stop().await;
    }

    #[tokio::test]
    async fn test_recovery_trigger_unknown_device() {
        let orch = Orchestrator::new();
        assert!(matches!(
            orch.trigger_device_recovery("nope"),
            Err(CoreError::UnknownDevice(_))
        ));
    }
}
