//! Transfer driver — move a pallet between two storage positions.

use chrono::{DateTime, Utc};

use super::{
    handshake_and_monitor, outcome_from_verdict, write_location, ExecutionContext,
    ExecutionOutcome, SOURCE_REGISTERS, TARGET_REGISTERS,
};
use crate::error::TransportError;
use crate::types::Command;

pub async fn run(
    ctx: &ExecutionContext,
    command: &Command,
    started_at: DateTime<Utc>,
) -> Result<ExecutionOutcome, TransportError> {
    let (Some(source), Some(destination)) = (command.source, command.destination) else {
        return Ok(ExecutionOutcome::failed(
            "transfer command requires source and destination",
            None,
        ));
    };

    write_location(ctx, SOURCE_REGISTERS, &source).await?;
    write_location(ctx, TARGET_REGISTERS, &destination).await?;

    tracing::debug!(
        device_id = %ctx.device_id,
        command_id = %command.command_id,
        source = %source,
        destination = %destination,
        "transfer registers written, starting handshake"
    );

    let verdict = handshake_and_monitor(ctx, command, started_at).await?;
    Ok(outcome_from_verdict(command.kind, verdict))
}
