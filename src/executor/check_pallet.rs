//! CheckPallet driver — probe a storage position for pallet presence.
//!
//! Identical handshake to the movement kinds, plus a read of the
//! `AvailablePallet`/`UnavailablePallet` outputs folded into the result.

use chrono::{DateTime, Utc};

use super::{
    handshake_and_monitor, outcome_from_verdict, write_location, ExecutionContext,
    ExecutionOutcome, SOURCE_REGISTERS,
};
use crate::error::TransportError;
use crate::signal_map::SignalName;
use crate::types::{Command, CommandStatus};

pub async fn run(
    ctx: &ExecutionContext,
    command: &Command,
    started_at: DateTime<Utc>,
) -> Result<ExecutionOutcome, TransportError> {
    let Some(source) = command.source else {
        return Ok(ExecutionOutcome::failed(
            "check-pallet command has no source location",
            None,
        ));
    };

    write_location(ctx, SOURCE_REGISTERS, &source).await?;

    let verdict = handshake_and_monitor(ctx, command, started_at).await?;
    let mut outcome = outcome_from_verdict(command.kind, verdict);

    if outcome.status == CommandStatus::Success {
        let available_addr = ctx.signals.addr(SignalName::AvailablePallet)?;
        let unavailable_addr = ctx.signals.addr(SignalName::UnavailablePallet)?;
        outcome.pallet_available = Some(ctx.conn.read_bool(&available_addr).await?);
        outcome.pallet_unavailable = Some(ctx.conn.read_bool(&unavailable_addr).await?);
        tracing::debug!(
            device_id = %ctx.device_id,
            command_id = %command.command_id,
            available = outcome.pallet_available,
            unavailable = outcome.pallet_unavailable,
            "pallet check outputs read"
        );
    }

    Ok(outcome)
}
