//! Inbound driver — store a pallet arriving at a gate.
//!
//! Inbound is the one kind with a mid-protocol rendezvous: after the
//! handshake starts, the PLC publishes the scanned barcode in ten
//! character registers. The driver assembles it, raises
//! `BarcodeReceived`, and parks on a one-shot reply slot until the
//! caller validates the pallet (hard 5-minute limit). Only a positive
//! reply carries the destination that lets the movement proceed.

use chrono::{DateTime, Utc};

use super::{
    flag_raised, monitor_only, outcome_from_verdict, pulse, write_flag,
    write_gate_and_directions, write_location, ExecutionContext, ExecutionOutcome,
    TARGET_REGISTERS,
};
use crate::error::TransportError;
use crate::events::GatewayEvent;
use crate::monitor::POLL_INTERVAL;
use crate::signal_map::SignalName;
use crate::types::Command;

pub async fn run(
    ctx: &ExecutionContext,
    command: &Command,
    started_at: DateTime<Utc>,
) -> Result<ExecutionOutcome, TransportError> {
    pulse(ctx, SignalName::InboundTrigger).await?;
    write_flag(ctx, SignalName::StartProcess, true).await?;

    // Wait for the scanner to fill the character registers.
    let Some(barcode) = scan_barcode(ctx).await? else {
        return Ok(ExecutionOutcome::failed("command cancelled by shutdown", None));
    };

    tracing::info!(
        device_id = %ctx.device_id,
        command_id = %command.command_id,
        barcode = %barcode,
        "barcode scanned, awaiting validation"
    );

    // Slot first, event second: the caller may reply as soon as it sees
    // the event.
    let reply_rx = ctx.rendezvous.register(&command.command_id);
    let _ = ctx.events_tx.send(GatewayEvent::BarcodeReceived {
        device_id: ctx.device_id.clone(),
        command_id: command.command_id.clone(),
        barcode: barcode.clone(),
    });

    let mut shutdown_rx = ctx.shutdown_rx.clone();
    let reply = tokio::select! {
        r = tokio::time::timeout(ctx.barcode_timeout, reply_rx) => r,
        _ = flag_raised(&mut shutdown_rx) => {
            ctx.rendezvous.cancel(&command.command_id);
            return Ok(ExecutionOutcome::failed("command cancelled by shutdown", None));
        }
    };
    match reply {
        Err(_) => {
            // Caller never answered.
            ctx.rendezvous.cancel(&command.command_id);
            write_flag(ctx, SignalName::BarcodeInvalid, true).await?;
            tracing::warn!(
                device_id = %ctx.device_id,
                command_id = %command.command_id,
                "barcode validation timed out"
            );
            Ok(ExecutionOutcome::timeout("barcode validation timed out"))
        }
        Ok(Err(_)) => {
            // Sender dropped without answering (gateway went away).
            write_flag(ctx, SignalName::BarcodeInvalid, true).await?;
            Ok(ExecutionOutcome::failed(
                "barcode validation channel closed",
                None,
            ))
        }
        Ok(Ok(response)) if !response.valid => {
            write_flag(ctx, SignalName::BarcodeInvalid, true).await?;
            let reason = response
                .reason
                .unwrap_or_else(|| "barcode rejected by caller".to_string());
            Ok(ExecutionOutcome::failed(
                format!("barcode rejected: {reason}"),
                None,
            ))
        }
        Ok(Ok(response)) => {
            let Some(destination) = response.destination else {
                write_flag(ctx, SignalName::BarcodeInvalid, true).await?;
                return Ok(ExecutionOutcome::failed(
                    "validation accepted without a destination",
                    None,
                ));
            };
            write_location(ctx, TARGET_REGISTERS, &destination).await?;
            write_gate_and_directions(
                ctx,
                response.gate_number.unwrap_or(command.gate_number),
                response.enter_direction.or(command.enter_direction),
                response.exit_direction.or(command.exit_direction),
            )
            .await?;
            write_flag(ctx, SignalName::BarcodeValid, true).await?;

            tracing::debug!(
                device_id = %ctx.device_id,
                command_id = %command.command_id,
                destination = %destination,
                "barcode accepted, monitoring for completion"
            );

            let verdict = monitor_only(ctx, command, started_at).await?;
            Ok(outcome_from_verdict(command.kind, verdict))
        }
    }
}

/// Poll the ten `BarcodeChar*` registers until every one is non-zero,
/// then assemble the ASCII string. Returns `None` on shutdown.
async fn scan_barcode(ctx: &ExecutionContext) -> Result<Option<String>, TransportError> {
    let mut addrs = Vec::with_capacity(SignalName::BARCODE_CHARS as usize);
    for n in 1..=SignalName::BARCODE_CHARS {
        addrs.push(ctx.signals.addr(SignalName::BarcodeChar(n))?);
    }

    let mut shutdown_rx = ctx.shutdown_rx.clone();
    loop {
        if *shutdown_rx.borrow() {
            return Ok(None);
        }

        let mut chars = Vec::with_capacity(addrs.len());
        for addr in &addrs {
            chars.push(ctx.conn.read_byte(addr).await?);
        }
        if chars.iter().all(|c| *c != 0) {
            let barcode: String = chars.iter().map(|c| char::from(*c)).collect();
            return Ok(Some(barcode));
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
}
