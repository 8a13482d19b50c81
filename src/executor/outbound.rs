//! Outbound driver — retrieve a pallet from storage to a gate.

use chrono::{DateTime, Utc};

use super::{
    handshake_and_monitor, outcome_from_verdict, write_gate_and_directions, write_location,
    ExecutionContext, ExecutionOutcome, SOURCE_REGISTERS,
};
use crate::error::TransportError;
use crate::types::Command;

pub async fn run(
    ctx: &ExecutionContext,
    command: &Command,
    started_at: DateTime<Utc>,
) -> Result<ExecutionOutcome, TransportError> {
    // The gateway guarantees `source` and `gate_number` for Outbound.
    let Some(source) = command.source else {
        return Ok(ExecutionOutcome::failed(
            "outbound command has no source location",
            None,
        ));
    };

    write_location(ctx, SOURCE_REGISTERS, &source).await?;
    write_gate_and_directions(
        ctx,
        command.gate_number,
        command.enter_direction,
        command.exit_direction,
    )
    .await?;

    tracing::debug!(
        device_id = %ctx.device_id,
        command_id = %command.command_id,
        source = %source,
        gate = command.gate_number,
        "outbound registers written, starting handshake"
    );

    let verdict = handshake_and_monitor(ctx, command, started_at).await?;
    Ok(outcome_from_verdict(command.kind, verdict))
}
