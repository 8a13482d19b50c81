//! Core types for the command orchestration core.
//!
//! Typed structs with `Serialize`/`Deserialize` everywhere; status enums
//! carry `as_str`/`parse` pairs so log lines and external payloads agree
//! on the wire spelling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Locations & Directions ──────────────────────────────────────────────────

/// A storage position in the warehouse: `(floor, rail, block, depth)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub floor: u16,
    pub rail: u16,
    pub block: u16,
    pub depth: u16,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({},{},{},{})",
            self.floor, self.rail, self.block, self.depth
        )
    }
}

/// Direction a pallet enters or leaves a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDirection {
    Top,
    Bottom,
}

impl GateDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Top => "top",
            Self::Bottom => "bottom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "top" => Some(Self::Top),
            "bottom" => Some(Self::Bottom),
            _ => None,
        }
    }

    /// Register encoding written to the PLC (`0` means unset).
    pub fn register_value(&self) -> u8 {
        match self {
            Self::Top => 1,
            Self::Bottom => 2,
        }
    }
}

// ─── Commands ────────────────────────────────────────────────────────────────

/// The four transport operations a shuttle device can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Inbound,
    Outbound,
    Transfer,
    CheckPallet,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
            Self::Transfer => "transfer",
            Self::CheckPallet => "check_pallet",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            "transfer" => Some(Self::Transfer),
            "check_pallet" => Some(Self::CheckPallet),
            _ => None,
        }
    }
}

/// A transport command as accepted into the queue.
///
/// Immutable after submission. `command_id` uniqueness is caller-asserted
/// and trusted. Per-kind field requirements (Outbound needs `source` +
/// `gate_number`, Transfer needs `source` + `destination`, CheckPallet
/// needs `source`) are enforced by the gateway before submission; Inbound
/// receives its destination later through barcode validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Caller-supplied unique identifier.
    pub command_id: String,
    /// Restricts the command to one device when present.
    pub device_affinity: Option<String>,
    pub kind: CommandKind,
    pub source: Option<Location>,
    pub destination: Option<Location>,
    /// Pick/drop gate used by Inbound/Outbound.
    #[serde(default)]
    pub gate_number: u8,
    pub enter_direction: Option<GateDirection>,
    pub exit_direction: Option<GateDirection>,
    /// Stamped by the orchestrator on submission.
    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
}

// ─── Results ─────────────────────────────────────────────────────────────────

/// Outcome classification for a command execution.
///
/// `Alarm` is intermediate: it is broadcast for observation but does not
/// complete the command. Only `Success`, `Failed` and `Timeout` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    Alarm,
    Failed,
    Timeout,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Alarm => "alarm",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "alarm" => Some(Self::Alarm),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Alarm)
    }
}

/// Error detail decoded from the PLC alarm registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlcError {
    pub code: i16,
    pub message: String,
}

/// Result of one command execution, published on the result channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub device_id: String,
    pub status: CommandStatus,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub plc_error: Option<PlcError>,
    /// CheckPallet only: the `AvailablePallet` flag at completion.
    pub pallet_available: Option<bool>,
    /// CheckPallet only: the `UnavailablePallet` flag at completion.
    pub pallet_unavailable: Option<bool>,
}

// ─── Scheduling ──────────────────────────────────────────────────────────────

/// Single-use token advertising that a device worker is idle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyTicket {
    pub device_id: String,
    pub ready_at: DateTime<Utc>,
    /// Pending-queue depth observed when the ticket was emitted.
    pub queue_depth_hint: usize,
}

/// Lifecycle state of a command inside the tracker.
///
/// Transitions are monotonic forward; `Completed` and `Removed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Pending,
    Processing,
    Completed,
    Removed,
}

impl CommandState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Removed => "removed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Removed)
    }
}

// ─── Device state ────────────────────────────────────────────────────────────

/// Present iff the device requires recovery before accepting work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceFailureEntry {
    pub device_id: String,
    pub last_error_message: String,
    pub failed_at: DateTime<Utc>,
}

/// Present iff the PLC is currently reporting a non-zero error code.
///
/// Raised by the signal monitor; cleared when the PLC reports the code
/// back at zero, never by the core on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAlarmEntry {
    pub device_id: String,
    pub error_code: i16,
    pub error_message: String,
    pub raised_at: DateTime<Utc>,
}

// ─── Barcode validation ──────────────────────────────────────────────────────

/// Caller's reply to a `BarcodeReceived` event for an in-flight Inbound
/// command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarcodeValidationResponse {
    pub valid: bool,
    pub destination: Option<Location>,
    pub gate_number: Option<u8>,
    pub enter_direction: Option<GateDirection>,
    pub exit_direction: Option<GateDirection>,
    /// Caller-supplied rejection reason when `valid` is false.
    pub reason: Option<String>,
}

impl BarcodeValidationResponse {
    /// Shorthand for an accepting reply.
    pub fn accept(destination: Location, gate_number: u8) -> Self {
        Self {
            valid: true,
            destination: Some(destination),
            gate_number: Some(gate_number),
            enter_direction: None,
            exit_direction: None,
            reason: None,
        }
    }

    /// Shorthand for a rejecting reply.
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            destination: None,
            gate_number: None,
            enter_direction: None,
            exit_direction: None,
            reason: Some(reason.into()),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_kind_roundtrip() {
        for kind in [
            CommandKind::Inbound,
            CommandKind::Outbound,
            CommandKind::Transfer,
            CommandKind::CheckPallet,
        ] {
            assert_eq!(CommandKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CommandKind::parse("sideways"), None);
    }

    #[test]
    fn test_command_status_terminality() {
        assert!(CommandStatus::Success.is_terminal());
        assert!(CommandStatus::Failed.is_terminal());
        assert!(CommandStatus::Timeout.is_terminal());
        assert!(!CommandStatus::Alarm.is_terminal());
    }

    #[test]
    fn test_command_state_roundtrip() {
        for state in [
            CommandState::Pending,
            CommandState::Processing,
            CommandState::Completed,
            CommandState::Removed,
        ] {
            assert_eq!(CommandState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn test_gate_direction_register_values() {
        assert_eq!(GateDirection::Top.register_value(), 1);
        assert_eq!(GateDirection::Bottom.register_value(), 2);
    }

    #[test]
    fn test_command_serde_defaults() {
        let json = r#"{
            "command_id": "c-1",
            "device_affinity": null,
            "kind": "outbound",
            "source": {"floor": 1, "rail": 1, "block": 3, "depth": 1},
            "destination": null,
            "gate_number": 4,
            "enter_direction": null,
            "exit_direction": "top"
        }"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        assert_eq!(cmd.kind, CommandKind::Outbound);
        assert_eq!(cmd.exit_direction, Some(GateDirection::Top));
        assert_eq!(cmd.gate_number, 4);
    }

    #[test]
    fn test_validation_response_shorthands() {
        let loc = Location {
            floor: 2,
            rail: 5,
            block: 3,
            depth: 1,
        };
        let ok = BarcodeValidationResponse::accept(loc, 7);
        assert!(ok.valid);
        assert_eq!(ok.gate_number, Some(7));

        let no = BarcodeValidationResponse::reject("unknown pallet");
        assert!(!no.valid);
        assert_eq!(no.reason.as_deref(), Some("unknown pallet"));
    }
}
