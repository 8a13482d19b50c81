//! Signal monitor — concurrent observation of alarm/failed/completed.
//!
//! Runs during command execution and resolves to one verdict. Each tick
//! checks, in order: the PLC error code (alarm), the `CommandFailed`
//! flag, then the command-kind completion flag. An alarm is reported on
//! the result stream exactly once per session as an intermediate
//! `Alarm` result; with `fail_on_alarm` set it also ends the session.
//! An alarm that resolves (code back to zero) before completion is
//! downgraded to a warning on the final `Success`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use crate::connection::ConnectionManager;
use crate::error::TransportError;
use crate::signal_map::{SignalMap, SignalName};
use crate::tracker::PendingTracker;
use crate::types::{CommandResult, CommandStatus, PlcError};

/// Cadence of flag polling during execution.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Terminal observation of one monitoring session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorVerdict {
    /// Completion flag seen; carries alarm detail observed along the way.
    Success { warning: Option<PlcError> },
    /// `CommandFailed` flag seen.
    Failed { error: Option<PlcError> },
    /// Alarm seen with `fail_on_alarm` configured.
    Alarm(PlcError),
}

fn describe_error_code(code: i16) -> String {
    format!("PLC reported error code {code}")
}

/// Watches one device's flags for the duration of a command.
pub struct SignalMonitor<'a> {
    pub conn: &'a ConnectionManager,
    pub signals: &'a SignalMap,
    pub tracker: &'a PendingTracker,
    pub result_tx: &'a mpsc::UnboundedSender<CommandResult>,
    pub device_id: &'a str,
    pub fail_on_alarm: bool,
}

impl SignalMonitor<'_> {
    /// Poll until a verdict or cancellation.
    ///
    /// Session state (the "alarm already reported" latch) is local to
    /// this call. Returns `Ok(None)` when the shutdown token fires
    /// before any flag does.
    pub async fn watch(
        &self,
        command_id: &str,
        completion: SignalName,
        started_at: DateTime<Utc>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<Option<MonitorVerdict>, TransportError> {
        let error_code_addr = self.signals.addr(SignalName::ErrorCode)?;
        let failed_addr = self.signals.addr(SignalName::CommandFailed)?;
        let completion_addr = self.signals.addr(completion)?;

        let mut alarm_reported = false;
        let mut last_alarm: Option<PlcError> = None;

        loop {
            if *shutdown_rx.borrow() {
                return Ok(None);
            }

            // Alarm first.
            let code = self.conn.read_word(&error_code_addr).await?;
            if code != 0 {
                let alarm = PlcError {
                    code,
                    message: describe_error_code(code),
                };
                if !alarm_reported {
                    alarm_reported = true;
                    last_alarm = Some(alarm.clone());
                    self.tracker
                        .set_alarm(self.device_id, code, alarm.message.as_str());
                    tracing::warn!(
                        device_id = %self.device_id,
                        command_id,
                        error_code = code,
                        "PLC alarm raised during command"
                    );
                    let _ = self.result_tx.send(CommandResult {
                        command_id: command_id.to_string(),
                        device_id: self.device_id.to_string(),
                        status: CommandStatus::Alarm,
                        message: alarm.message.clone(),
                        started_at,
                        completed_at: Utc::now(),
                        plc_error: Some(alarm.clone()),
                        pallet_available: None,
                        pallet_unavailable: None,
                    });
                }
                if self.fail_on_alarm {
                    return Ok(Some(MonitorVerdict::Alarm(alarm)));
                }
            } else if alarm_reported && self.tracker.has_alarm(self.device_id) {
                // The PLC resolved the alarm itself; lift the admission gate.
                self.tracker.clear_alarm(self.device_id);
                tracing::info!(
                    device_id = %self.device_id,
                    command_id,
                    "PLC alarm cleared"
                );
            }

            // Failure flag second.
            if self.conn.read_bool(&failed_addr).await? {
                return Ok(Some(MonitorVerdict::Failed {
                    error: last_alarm.clone(),
                }));
            }

            // Completion flag last.
            if self.conn.read_bool(&completion_addr).await? {
                // An alarm seen along the way rides on the success result
                // as a warning, resolved or not.
                return Ok(Some(MonitorVerdict::Success {
                    warning: last_alarm.clone(),
                }));
            }

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests_support::emulated_device;
    use crate::transport::EmulatedPlc;

    struct Fixture {
        plc: EmulatedPlc,
        conn: ConnectionManager,
        signals: SignalMap,
        tracker: PendingTracker,
        result_tx: mpsc::UnboundedSender<CommandResult>,
        result_rx: mpsc::UnboundedReceiver<CommandResult>,
        shutdown_tx: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
    }

    async fn fixture() -> Fixture {
        let (config, plc) = emulated_device("D1");
        let signals = config.build_signal_map().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let conn = ConnectionManager::new(
            "D1",
            Box::new(plc.clone()),
            (&config).into(),
            shutdown_rx.clone(),
        );
        conn.connect().await.unwrap();
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        Fixture {
            plc,
            conn,
            signals,
            tracker: PendingTracker::new(),
            result_tx,
            result_rx,
            shutdown_tx,
            shutdown_rx,
        }
    }

    fn monitor(fx: &Fixture, fail_on_alarm: bool) -> SignalMonitor<'_> {
        SignalMonitor {
            conn: &fx.conn,
            signals: &fx.signals,
            tracker: &fx.tracker,
            result_tx: &fx.result_tx,
            device_id: "D1",
            fail_on_alarm,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_wins() {
        let mut fx = fixture().await;
        fx.plc.poke(
            &fx.signals.addr(SignalName::OutboundCompleted).unwrap(),
            1,
        );
        let verdict = monitor(&fx, false)
            .watch(
                "c1",
                SignalName::OutboundCompleted,
                Utc::now(),
                &mut fx.shutdown_rx.clone(),
            )
            .await
            .unwrap();
        assert_eq!(verdict, Some(MonitorVerdict::Success { warning: None }));
        assert!(fx.result_rx.try_recv().is_err()); // no intermediate results
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flag_wins_over_completion() {
        let fx = fixture().await;
        fx.plc
            .poke(&fx.signals.addr(SignalName::CommandFailed).unwrap(), 1);
        fx.plc.poke(
            &fx.signals.addr(SignalName::OutboundCompleted).unwrap(),
            1,
        );
        let verdict = monitor(&fx, false)
            .watch(
                "c1",
                SignalName::OutboundCompleted,
                Utc::now(),
                &mut fx.shutdown_rx.clone(),
            )
            .await
            .unwrap();
        assert_eq!(verdict, Some(MonitorVerdict::Failed { error: None }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_alarm_reported_once_then_success() {
        let mut fx = fixture().await;
        let code_addr = fx.signals.addr(SignalName::ErrorCode).unwrap();
        let done_addr = fx.signals.addr(SignalName::OutboundCompleted).unwrap();
        fx.plc.poke(&code_addr, 17);

        let watcher = monitor(&fx, false);
        let mut shutdown = fx.shutdown_rx.clone();
        let plc = fx.plc.clone();
        let task = async move {
            watcher
                .watch("c1", SignalName::OutboundCompleted, Utc::now(), &mut shutdown)
                .await
        };
        let driver = async move {
            // Let a few alarm ticks pass, then resolve and complete.
            tokio::time::sleep(Duration::from_millis(600)).await;
            plc.poke(&code_addr, 0);
            plc.poke(&done_addr, 1);
        };
        let (verdict, _) = tokio::join!(task, driver);
        let verdict = verdict.unwrap().unwrap();
        assert!(matches!(
            verdict,
            MonitorVerdict::Success { warning: Some(ref w) } if w.code == 17
        ));

        // Exactly one intermediate alarm result.
        let first = fx.result_rx.try_recv().unwrap();
        assert_eq!(first.status, CommandStatus::Alarm);
        assert!(fx.result_rx.try_recv().is_err());
        // Alarm entry cleared once the PLC resolved it.
        assert!(!fx.tracker.has_alarm("D1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_on_alarm_terminates() {
        let fx = fixture().await;
        fx.plc
            .poke(&fx.signals.addr(SignalName::ErrorCode).unwrap(), 9);
        let verdict = monitor(&fx, true)
            .watch(
                "c1",
                SignalName::OutboundCompleted,
                Utc::now(),
                &mut fx.shutdown_rx.clone(),
            )
            .await
            .unwrap();
        assert!(matches!(verdict, Some(MonitorVerdict::Alarm(ref e)) if e.code == 9));
        assert!(fx.tracker.has_alarm("D1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_returns_none() {
        let fx = fixture().await;
        let watcher = monitor(&fx, false);
        let mut shutdown = fx.shutdown_rx.clone();
        let task = async move {
            watcher
                .watch("c1", SignalName::OutboundCompleted, Utc::now(), &mut shutdown)
                .await
        };
        let trigger = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = fx.shutdown_tx.send(true);
        };
        let (verdict, _) = tokio::join!(task, trigger);
        assert_eq!(verdict.unwrap(), None);
    }
}
