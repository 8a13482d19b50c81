//! Matchmaker — correlates pending commands with device availability.
//!
//! ## Scheduling model
//!
//! Strict FIFO: the head-of-line command is never skipped in favour of a
//! later command whose device happens to be free. Before any dispatch
//! the admission gate is consulted — an unresolved alarm anywhere in the
//! fleet is a coordinated stop. Dispatch-pair compatibility is checked
//! against every in-flight command: shuttles share lifts and aisles, so
//! a Transfer or CheckPallet runs alone, and Inbound/Outbound only stack
//! with their own kind.
//!
//! Bursts are spread with a 2 s stagger between successive dispatches.
//! When the local queue drains the pause gate is reset; submitters set
//! it again as they enqueue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::config::DeviceCapabilities;
use crate::executor::flag_raised;
use crate::tracker::PendingTracker;
use crate::types::{Command, CommandKind, CommandState, ReadyTicket};

/// Delay between two successive dispatches within one pass.
const DISPATCH_STAGGER: Duration = Duration::from_secs(2);

/// Idle wake-up while commands wait for an eligible device.
const IDLE_TICK: Duration = Duration::from_millis(100);

/// May `new` be dispatched while a command of kind `in_flight` runs
/// somewhere in the fleet?
pub(crate) fn is_compatible(new: CommandKind, in_flight: Option<CommandKind>) -> bool {
    match in_flight {
        None => true,
        Some(CommandKind::Transfer) | Some(CommandKind::CheckPallet) => false,
        Some(_) if matches!(new, CommandKind::Transfer | CommandKind::CheckPallet) => false,
        Some(CommandKind::Inbound) => new == CommandKind::Inbound,
        Some(CommandKind::Outbound) => new == CommandKind::Outbound,
    }
}

/// Singleton scheduler task.
pub(crate) struct Matchmaker {
    pub(crate) input_rx: mpsc::Receiver<Command>,
    pub(crate) avail_rx: mpsc::UnboundedReceiver<ReadyTicket>,
    pub(crate) device_tx: HashMap<String, mpsc::Sender<Command>>,
    pub(crate) capabilities: HashMap<String, DeviceCapabilities>,
    pub(crate) tracker: Arc<PendingTracker>,
    pub(crate) pause_tx: Arc<watch::Sender<bool>>,
    pub(crate) pause_rx: watch::Receiver<bool>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
    pub(crate) fifo: VecDeque<Command>,
    pub(crate) ready: HashMap<String, ReadyTicket>,
}

impl Matchmaker {
    pub(crate) async fn run(mut self) {
        tracing::info!("Matchmaker started");

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            // Pause gate: manual pause and drained-queue auto-pause both
            // park here until a submitter or resume re-signals.
            if !*self.pause_rx.borrow() {
                let mut pause_rx = self.pause_rx.clone();
                tokio::select! {
                    _ = flag_raised(&mut pause_rx) => {}
                    _ = flag_raised(&mut self.shutdown_rx) => break,
                }
                continue;
            }

            self.drain_tickets();
            self.dispatch_pass().await;
            if *self.shutdown_rx.borrow() {
                break;
            }

            if self.fifo.is_empty() && self.input_rx.is_empty() {
                // Queue drained: reset the gate.
                let _ = self.pause_tx.send(false);
                continue;
            }

            // Blocked head (or admission gate closed): sleep on new
            // work. The input channel is only consumed while the local
            // queue is empty, so a blocked head backpressures
            // submitters at the channel bound.
            let head_free = self.fifo.is_empty();
            tokio::select! {
                cmd = self.input_rx.recv(), if head_free => match cmd {
                    Some(c) => self.fifo.push_back(c),
                    None => break,
                },
                ticket = self.avail_rx.recv() => {
                    if let Some(t) = ticket {
                        self.note_ticket(t);
                    }
                }
                _ = tokio::time::sleep(IDLE_TICK) => {}
                _ = flag_raised(&mut self.shutdown_rx) => break,
            }
        }

        // Dequeued but never dispatched: keep them Pending so a restart
        // can retry.
        let stranded = self.fifo.len();
        for cmd in &self.fifo {
            self.tracker.restore_pending(&cmd.command_id);
        }
        tracing::info!(stranded, "Matchmaker stopped");
    }

    fn drain_tickets(&mut self) {
        while let Ok(ticket) = self.avail_rx.try_recv() {
            self.note_ticket(ticket);
        }
    }

    fn note_ticket(&mut self, ticket: ReadyTicket) {
        self.ready.insert(ticket.device_id.clone(), ticket);
    }

    /// Dispatch from the head until it blocks or the queue empties.
    async fn dispatch_pass(&mut self) {
        let mut dispatched_any = false;

        loop {
            if *self.shutdown_rx.borrow() {
                return;
            }
            if self.tracker.has_any_active_alarm() {
                tracing::debug!("admission gate closed: active alarm in fleet");
                return;
            }

            // Refill the head lazily from the input channel so the
            // channel's bound stays meaningful.
            if self.fifo.is_empty() {
                match self.input_rx.try_recv() {
                    Ok(cmd) => self.fifo.push_back(cmd),
                    Err(_) => return,
                }
            }
            let Some(head) = self.fifo.front() else {
                return;
            };

            // Commands removed while queued are dropped, never dispatched.
            if self.tracker.state(&head.command_id) != Some(CommandState::Pending) {
                let dropped = self.fifo.pop_front().unwrap();
                tracing::debug!(
                    command_id = %dropped.command_id,
                    "dropping non-pending command from queue"
                );
                continue;
            }

            let Some(device_id) = self.eligible_device(head) else {
                // Strict FIFO: a blocked head stops the pass.
                return;
            };

            if dispatched_any {
                tokio::select! {
                    _ = tokio::time::sleep(DISPATCH_STAGGER) => {}
                    _ = flag_raised(&mut self.shutdown_rx) => return,
                }
                // A removal or alarm may have landed during the stagger;
                // loop back and re-evaluate from scratch. In-flight work
                // can only have finished meanwhile, so the head stays
                // eligible and is dispatched without a second stagger.
                if self.tracker.has_any_active_alarm() {
                    return;
                }
                if self
                    .fifo
                    .front()
                    .is_some_and(|c| self.tracker.state(&c.command_id) != Some(CommandState::Pending))
                {
                    continue;
                }
            }

            let command = self.fifo.pop_front().unwrap();
            let command_id = command.command_id.clone();
            self.ready.remove(&device_id);

            if !self.tracker.mark_processing(&command_id, &device_id) {
                // Lost a race with removal between the state check and
                // here; the ticket goes back so the device stays usable.
                self.note_ticket(ReadyTicket {
                    device_id: device_id.clone(),
                    ready_at: chrono::Utc::now(),
                    queue_depth_hint: self.fifo.len(),
                });
                continue;
            }

            let Some(tx) = self.device_tx.get(&device_id) else {
                self.tracker.restore_pending(&command_id);
                tracing::error!(device_id = %device_id, "no channel for matched device");
                return;
            };
            if let Err(e) = tx.send(command).await {
                // Worker gone; put the command back for a later pass.
                self.tracker.restore_pending(&e.0.command_id);
                self.fifo.push_front(e.0);
                tracing::warn!(device_id = %device_id, "device channel closed");
                return;
            }

            tracing::info!(
                device_id = %device_id,
                command_id = %command_id,
                "command dispatched"
            );
            dispatched_any = true;
        }
    }

    /// Pick a device for the head command, or None if it must wait.
    fn eligible_device(&self, command: &Command) -> Option<String> {
        // Pairwise compatibility against everything in flight.
        let in_flight = self.tracker.in_flight_kinds();
        if !in_flight
            .iter()
            .all(|k| is_compatible(command.kind, Some(*k)))
        {
            return None;
        }

        match &command.device_affinity {
            Some(device_id) => self
                .ready
                .contains_key(device_id)
                .then(|| device_id.clone()),
            None => self
                .ready
                .values()
                .filter(|t| {
                    self.capabilities
                        .get(&t.device_id)
                        .is_some_and(|caps| caps.supports(command.kind))
                })
                .min_by_key(|t| t.ready_at)
                .map(|t| t.device_id.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
