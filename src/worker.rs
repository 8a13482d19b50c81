//! Device worker — one serial command pipeline per device.
//!
//! ## Lifecycle
//!
//! ```text
//! DeviceWorker::run(shutdown) loop:
//!   1. Emit a ReadyTicket (availability channel)
//!   2. Receive one command from the per-device channel (capacity 1)
//!   3. Pre-flight: SoftwareConnected + DeviceReady must both read true
//!   4. Execute the kind's driver under shutdown ∪ command_timeout
//!   5. Publish the terminal CommandResult
//!   6. Success → 5 s stagger → new ticket
//!      anything else → recovery wait (auto-poll or manual trigger)
//! ```
//!
//! A failure parks only this device; the matchmaker keeps serving the
//! rest of the fleet. The recovery gate must pass before the worker
//! reads another command.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Notify};

use crate::config::PlcConnectionConfig;
use crate::executor::{self, flag_raised, ExecutionContext, ExecutionOutcome};
use crate::signal_map::SignalName;
use crate::types::{Command, CommandResult, CommandStatus, ReadyTicket};

/// Delay between a successful command and the next availability ticket.
const SUCCESS_STAGGER: Duration = Duration::from_secs(5);

/// Per-device execution tuning.
#[derive(Debug, Clone)]
pub struct DeviceTuning {
    pub command_timeout: Duration,
    pub auto_recovery: bool,
    pub recovery_poll_interval: Duration,
}

impl From<&PlcConnectionConfig> for DeviceTuning {
    fn from(cfg: &PlcConnectionConfig) -> Self {
        Self {
            command_timeout: cfg.command_timeout,
            auto_recovery: cfg.auto_recovery_enabled,
            recovery_poll_interval: cfg.recovery_poll_interval,
        }
    }
}

/// What woke the worker's idle loop.
enum Wake {
    Command(Command),
    AlarmProbe,
    Stop,
}

/// One worker task per device; owns that device's executors and serial
/// command stream.
pub(crate) struct DeviceWorker {
    pub(crate) ctx: ExecutionContext,
    pub(crate) command_rx: mpsc::Receiver<Command>,
    pub(crate) avail_tx: mpsc::UnboundedSender<ReadyTicket>,
    pub(crate) recovery: Arc<Notify>,
    pub(crate) tuning: DeviceTuning,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
}

impl DeviceWorker {
    pub(crate) async fn run(mut self) {
        tracing::info!(device_id = %self.ctx.device_id, "DeviceWorker started");
        self.emit_ticket();

        loop {
            let alarmed = self.ctx.tracker.has_alarm(&self.ctx.device_id);
            let wake: Wake = tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(c) => Wake::Command(c),
                    None => Wake::Stop,
                },
                _ = flag_raised(&mut self.shutdown_rx) => Wake::Stop,
                // While this device holds the admission gate closed, keep
                // probing so a PLC-side resolution is actually observed.
                _ = tokio::time::sleep(self.tuning.recovery_poll_interval), if alarmed => {
                    Wake::AlarmProbe
                }
            };
            let command = match wake {
                Wake::Command(c) => c,
                Wake::Stop => break,
                Wake::AlarmProbe => {
                    self.try_clear_stale_alarm().await;
                    continue;
                }
            };

            let started_at = Utc::now();
            let outcome = self.process(&command, started_at).await;
            let result = self.result_from(&command.command_id, started_at, outcome);

            tracing::info!(
                device_id = %self.ctx.device_id,
                command_id = %result.command_id,
                status = result.status.as_str(),
                "command finished"
            );
            if self.ctx.result_tx.send(result.clone()).is_err() {
                break; // reply hub is gone, shutdown under way
            }

            if result.status == CommandStatus::Success {
                tokio::select! {
                    _ = tokio::time::sleep(SUCCESS_STAGGER) => {}
                    _ = flag_raised(&mut self.shutdown_rx) => break,
                }
                self.emit_ticket();
            } else {
                self.ctx
                    .tracker
                    .set_failure(&self.ctx.device_id, result.message.as_str());
                if !self.recovery_wait().await {
                    break;
                }
                self.ctx.tracker.clear_failure(&self.ctx.device_id);
                self.emit_ticket();
            }
        }

        tracing::info!(device_id = %self.ctx.device_id, "DeviceWorker stopped");
    }

    /// Pre-flight + execution; never publishes, only resolves an outcome.
    async fn process(&self, command: &Command, started_at: DateTime<Utc>) -> ExecutionOutcome {
        if let Err(reason) = self.preflight().await {
            tracing::warn!(
                device_id = %self.ctx.device_id,
                command_id = %command.command_id,
                reason = %reason,
                "pre-flight check failed"
            );
            return ExecutionOutcome::failed(reason, None);
        }

        match tokio::time::timeout(
            self.tuning.command_timeout,
            executor::execute(&self.ctx, command, started_at),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                // The in-flight future was dropped mid-protocol; bring
                // the PLC control bits back down before reporting.
                executor::clear_control_bits(&self.ctx, command.kind).await;
                ExecutionOutcome::timeout(format!(
                    "command exceeded timeout of {:?}",
                    self.tuning.command_timeout
                ))
            }
        }
    }

    /// Both link flags must read true before a command is attempted.
    async fn preflight(&self) -> Result<(), String> {
        let connected = self
            .read_flag(SignalName::SoftwareConnected)
            .await
            .map_err(|e| format!("pre-flight read failed: {e}"))?;
        if !connected {
            return Err("PLC reports SoftwareConnected = false".to_string());
        }
        let ready = self
            .read_flag(SignalName::DeviceReady)
            .await
            .map_err(|e| format!("pre-flight read failed: {e}"))?;
        if !ready {
            return Err("PLC reports DeviceReady = false".to_string());
        }
        Ok(())
    }

    async fn read_flag(&self, signal: SignalName) -> Result<bool, crate::error::TransportError> {
        let addr = self.ctx.signals.addr(signal)?;
        self.ctx.conn.read_bool(&addr).await
    }

    /// Block until the device may take work again.
    ///
    /// Auto mode polls `DeviceReady` on an interval; manual mode waits
    /// for `trigger_device_recovery` and then re-verifies the flag. A
    /// stale alarm entry is lifted once the PLC reports its error code
    /// back at zero. Returns false on shutdown.
    async fn recovery_wait(&mut self) -> bool {
        tracing::info!(
            device_id = %self.ctx.device_id,
            auto = self.tuning.auto_recovery,
            "entering recovery wait"
        );

        loop {
            if self.tuning.auto_recovery {
                tokio::select! {
                    _ = tokio::time::sleep(self.tuning.recovery_poll_interval) => {}
                    _ = self.recovery.notified() => {}
                    _ = flag_raised(&mut self.shutdown_rx) => return false,
                }
            } else {
                tokio::select! {
                    _ = self.recovery.notified() => {}
                    _ = flag_raised(&mut self.shutdown_rx) => return false,
                }
            }

            match self.read_flag(SignalName::DeviceReady).await {
                Ok(true) => {
                    self.try_clear_stale_alarm().await;
                    if self.ctx.tracker.has_alarm(&self.ctx.device_id) {
                        tracing::debug!(
                            device_id = %self.ctx.device_id,
                            "device ready but alarm unresolved"
                        );
                        continue;
                    }
                    tracing::info!(
                        device_id = %self.ctx.device_id,
                        "device recovered"
                    );
                    return true;
                }
                Ok(false) => {
                    tracing::debug!(
                        device_id = %self.ctx.device_id,
                        "device still not ready"
                    );
                }
                Err(e) => {
                    tracing::debug!(
                        device_id = %self.ctx.device_id,
                        error = %e,
                        "recovery probe failed"
                    );
                }
            }
        }
    }

    /// The alarm table is cleared by observation of the PLC, not by the
    /// core's own judgement.
    async fn try_clear_stale_alarm(&self) {
        if !self.ctx.tracker.has_alarm(&self.ctx.device_id) {
            return;
        }
        if let Ok(addr) = self.ctx.signals.addr(SignalName::ErrorCode) {
            if let Ok(0) = self.ctx.conn.read_word(&addr).await {
                self.ctx.tracker.clear_alarm(&self.ctx.device_id);
                tracing::info!(
                    device_id = %self.ctx.device_id,
                    "alarm cleared during recovery"
                );
            }
        }
    }

    fn emit_ticket(&self) {
        let ticket = ReadyTicket {
            device_id: self.ctx.device_id.clone(),
            ready_at: Utc::now(),
            queue_depth_hint: self.ctx.tracker.pending_count(),
        };
        if self.avail_tx.send(ticket).is_err() {
            tracing::debug!(
                device_id = %self.ctx.device_id,
                "availability channel closed"
            );
        }
    }

    fn result_from(
        &self,
        command_id: &str,
        started_at: DateTime<Utc>,
        outcome: ExecutionOutcome,
    ) -> CommandResult {
        CommandResult {
            command_id: command_id.to_string(),
            device_id: self.ctx.device_id.clone(),
            status: outcome.status,
            message: outcome.message,
            started_at,
            completed_at: Utc::now(),
            plc_error: outcome.plc_error,
            pallet_available: outcome.pallet_available,
            pallet_unavailable: outcome.pallet_unavailable,
        }
    }
}
