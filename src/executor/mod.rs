//! Per-command-kind PLC protocol drivers.
//!
//! All four kinds share one handshake, pre-arranged with the PLC
//! firmware:
//!
//! ```text
//! 1. write input registers (source/target/gate/direction)
//! 2. pulse the kind trigger bit (high, hold, low)
//! 3. raise StartProcess — all inputs valid
//! 4. monitor alarm / failed / completed flags
//! 5. clear trigger + StartProcess, whatever the outcome
//! ```
//!
//! Dispatch is a match over `Command.kind`; the kind-specific drivers
//! share the protocol steps as free functions rather than a type
//! hierarchy. Step 5 runs centrally in [`execute`] so no driver exit
//! path can skip it; the device worker repeats it after a timeout
//! cancellation drops the in-flight future.

pub mod check_pallet;
pub mod inbound;
pub mod outbound;
pub mod transfer;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};

use crate::connection::ConnectionManager;
use crate::error::TransportError;
use crate::events::GatewayEvent;
use crate::monitor::{MonitorVerdict, SignalMonitor};
use crate::rendezvous::BarcodeRendezvous;
use crate::signal_map::{SignalMap, SignalName};
use crate::tracker::PendingTracker;
use crate::types::{Command, CommandKind, CommandResult, CommandStatus, Location, PlcError};

/// Default hold between raising a trigger bit and dropping it. The exact
/// handshake timing is firmware-dependent, so it stays a knob.
pub const DEFAULT_TRIGGER_PULSE_HOLD: Duration = Duration::from_millis(100);

/// Hard limit on the barcode validation rendezvous.
pub const DEFAULT_BARCODE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

// ---------------------------------------------------------------------------
// Context & outcome
// ---------------------------------------------------------------------------

/// Everything a driver needs for one device, assembled by the worker.
pub struct ExecutionContext {
    pub device_id: String,
    pub conn: Arc<ConnectionManager>,
    pub signals: Arc<SignalMap>,
    pub tracker: Arc<PendingTracker>,
    /// Intermediate alarm results go here.
    pub result_tx: mpsc::UnboundedSender<CommandResult>,
    /// `BarcodeReceived` events go here.
    pub events_tx: broadcast::Sender<GatewayEvent>,
    pub rendezvous: Arc<BarcodeRendezvous>,
    pub fail_on_alarm: bool,
    pub trigger_pulse_hold: Duration,
    pub barcode_timeout: Duration,
    pub shutdown_rx: watch::Receiver<bool>,
}

/// Driver resolution, before the worker stamps timestamps onto the
/// published `CommandResult`.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: CommandStatus,
    pub message: String,
    pub plc_error: Option<PlcError>,
    pub pallet_available: Option<bool>,
    pub pallet_unavailable: Option<bool>,
}

impl ExecutionOutcome {
    pub fn success(message: impl Into<String>, warning: Option<PlcError>) -> Self {
        Self {
            status: CommandStatus::Success,
            message: message.into(),
            plc_error: warning,
            pallet_available: None,
            pallet_unavailable: None,
        }
    }

    pub fn failed(message: impl Into<String>, error: Option<PlcError>) -> Self {
        Self {
            status: CommandStatus::Failed,
            message: message.into(),
            plc_error: error,
            pallet_available: None,
            pallet_unavailable: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Timeout,
            message: message.into(),
            plc_error: None,
            pallet_available: None,
            pallet_unavailable: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Run the driver for a command's kind and always clear the control bits
/// afterwards. Transport faults map to a `Failed` outcome here; the
/// health-check path picks up any lost connection on its own.
pub async fn execute(
    ctx: &ExecutionContext,
    command: &Command,
    started_at: DateTime<Utc>,
) -> ExecutionOutcome {
    let driven = match command.kind {
        CommandKind::Inbound => inbound::run(ctx, command, started_at).await,
        CommandKind::Outbound => outbound::run(ctx, command, started_at).await,
        CommandKind::Transfer => transfer::run(ctx, command, started_at).await,
        CommandKind::CheckPallet => check_pallet::run(ctx, command, started_at).await,
    };

    clear_control_bits(ctx, command.kind).await;

    match driven {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(
                device_id = %ctx.device_id,
                command_id = %command.command_id,
                error = %e,
                "command execution failed on transport fault"
            );
            ExecutionOutcome::failed(format!("transport fault: {e}"), None)
        }
    }
}

/// Drop the kind trigger and `StartProcess`. Idempotent; errors are
/// logged and swallowed because this runs on paths that already failed.
pub async fn clear_control_bits(ctx: &ExecutionContext, kind: CommandKind) {
    for signal in [SignalName::trigger_for(kind), SignalName::StartProcess] {
        if let Err(e) = write_flag(ctx, signal, false).await {
            tracing::warn!(
                device_id = %ctx.device_id,
                signal = %signal,
                error = %e,
                "failed to clear control bit"
            );
        }
    }
}

/// Resolve once a watched flag (shutdown token, pause gate) reads true,
/// or its sender is gone.
pub(crate) async fn flag_raised(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Shared protocol steps
// ---------------------------------------------------------------------------

pub(crate) async fn write_flag(
    ctx: &ExecutionContext,
    signal: SignalName,
    value: bool,
) -> Result<(), TransportError> {
    let addr = ctx.signals.addr(signal)?;
    ctx.conn.write_bool(&addr, value).await
}

/// Trigger-bit pulse: high, hold, low.
pub(crate) async fn pulse(ctx: &ExecutionContext, signal: SignalName) -> Result<(), TransportError> {
    write_flag(ctx, signal, true).await?;
    tokio::time::sleep(ctx.trigger_pulse_hold).await;
    write_flag(ctx, signal, false).await
}

/// Write a location into the Source* or Target* word registers.
pub(crate) async fn write_location(
    ctx: &ExecutionContext,
    registers: [SignalName; 4],
    loc: &Location,
) -> Result<(), TransportError> {
    let values = [loc.floor, loc.rail, loc.block, loc.depth];
    for (signal, value) in registers.iter().zip(values) {
        let addr = ctx.signals.addr(*signal)?;
        ctx.conn.write_word(&addr, value as i16).await?;
    }
    Ok(())
}

pub(crate) const SOURCE_REGISTERS: [SignalName; 4] = [
    SignalName::SourceFloor,
    SignalName::SourceRail,
    SignalName::SourceBlock,
    SignalName::SourceDepth,
];

pub(crate) const TARGET_REGISTERS: [SignalName; 4] = [
    SignalName::TargetFloor,
    SignalName::TargetRail,
    SignalName::TargetBlock,
    SignalName::TargetDepth,
];

/// Write gate number and the two direction bytes (0 = unset).
pub(crate) async fn write_gate_and_directions(
    ctx: &ExecutionContext,
    gate_number: u8,
    enter: Option<crate::types::GateDirection>,
    exit: Option<crate::types::GateDirection>,
) -> Result<(), TransportError> {
    let gate_addr = ctx.signals.addr(SignalName::GateNumber)?;
    ctx.conn.write_byte(&gate_addr, gate_number).await?;
    let enter_addr = ctx.signals.addr(SignalName::EnterDirection)?;
    ctx.conn
        .write_byte(&enter_addr, enter.map_or(0, |d| d.register_value()))
        .await?;
    let exit_addr = ctx.signals.addr(SignalName::ExitDirection)?;
    ctx.conn
        .write_byte(&exit_addr, exit.map_or(0, |d| d.register_value()))
        .await?;
    Ok(())
}

/// Steps 2–4 shared by every driver: pulse the trigger, raise
/// `StartProcess`, hand over to the signal monitor.
pub(crate) async fn handshake_and_monitor(
    ctx: &ExecutionContext,
    command: &Command,
    started_at: DateTime<Utc>,
) -> Result<Option<MonitorVerdict>, TransportError> {
    pulse(ctx, SignalName::trigger_for(command.kind)).await?;
    write_flag(ctx, SignalName::StartProcess, true).await?;
    monitor_only(ctx, command, started_at).await
}

/// Step 4 alone, for drivers that interleave extra work (Inbound).
pub(crate) async fn monitor_only(
    ctx: &ExecutionContext,
    command: &Command,
    started_at: DateTime<Utc>,
) -> Result<Option<MonitorVerdict>, TransportError> {
    let monitor = SignalMonitor {
        conn: &ctx.conn,
        signals: &ctx.signals,
        tracker: &ctx.tracker,
        result_tx: &ctx.result_tx,
        device_id: &ctx.device_id,
        fail_on_alarm: ctx.fail_on_alarm,
    };
    let mut shutdown_rx = ctx.shutdown_rx.clone();
    monitor
        .watch(
            &command.command_id,
            SignalName::completion_for(command.kind),
            started_at,
            &mut shutdown_rx,
        )
        .await
}

/// Map a monitor verdict onto the driver outcome.
pub(crate) fn outcome_from_verdict(
    kind: CommandKind,
    verdict: Option<MonitorVerdict>,
) -> ExecutionOutcome {
    match verdict {
        None => ExecutionOutcome::failed("command cancelled by shutdown", None),
        Some(MonitorVerdict::Success { warning }) => {
            let message = match &warning {
                Some(w) => format!("{} completed (with alarm warning: {})", kind.as_str(), w.message),
                None => format!("{} completed", kind.as_str()),
            };
            ExecutionOutcome::success(message, warning)
        }
        Some(MonitorVerdict::Failed { error }) => {
            ExecutionOutcome::failed("PLC reported command failure", error)
        }
        Some(MonitorVerdict::Alarm(alarm)) => ExecutionOutcome::failed(
            format!("command stopped on alarm: {}", alarm.message),
            Some(alarm),
        ),
    }
}
