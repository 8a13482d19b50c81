//! Error taxonomy for the orchestration core.
//!
//! Transport faults, configuration faults and synchronous command
//! rejections are separate types because they propagate differently:
//! transport errors surface as `Failed` results and trigger the
//! health-check reconnect path, configuration errors are fatal at
//! initialization, and rejections are returned to the caller inline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::CommandKind;

/// Faults raised by a `PlcTransport` implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("connection lost")]
    ConnectionLost,
    #[error("operation timed out")]
    Timeout,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("data format mismatch: {0}")]
    DataFormat(String),
}

/// Fatal faults raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// Covers malformed JSON and field-level failures raised inside
    /// deserialization, including `HH:mm:ss` duration strings (the
    /// `duration_hms` adapter reports those with their own message).
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid signal address '{address}' for {signal}: {detail}")]
    InvalidAddress {
        signal: String,
        address: String,
        detail: String,
    },
    #[error("unknown signal name '{0}' in signal map")]
    UnknownSignal(String),
    #[error("signal map for device '{device}' is missing '{signal}'")]
    MissingSignal { device: String, signal: String },
    #[error("duplicate device id '{0}'")]
    DuplicateDevice(String),
    #[error("device '{device}': {detail}")]
    InvalidDevice { device: String, detail: String },
}

/// Synchronous rejection of a submitted command.
///
/// Returned inline from `send_command`; the command never enters the
/// queue.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CommandRejection {
    #[error("unknown device '{device_id}'")]
    UnknownDevice { device_id: String },
    #[error("device '{device_id}' does not support {kind:?}")]
    CapabilityMismatch {
        device_id: String,
        kind: CommandKind,
    },
    #[error("no registered device supports {kind:?}")]
    NoCapableDevice { kind: CommandKind },
    #[error("malformed request: {detail}")]
    Malformed { detail: String },
    #[error("layout violation: {detail}")]
    LayoutViolation { detail: String },
    #[error("command queue is closed")]
    QueueClosed,
}

/// Faults raised by the orchestrator/gateway surface.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
    #[error("orchestrator is already started")]
    AlreadyStarted,
    #[error("device registration is only legal before start")]
    RegistrationClosed,
    #[error("no pending barcode validation for command '{0}'")]
    NoPendingValidation(String),
    #[error("barcode validation for command '{0}' expired")]
    ValidationExpired(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_serde_tagging() {
        let rej = CommandRejection::CapabilityMismatch {
            device_id: "D1".to_string(),
            kind: CommandKind::Transfer,
        };
        let json = serde_json::to_string(&rej).unwrap();
        assert!(json.contains("\"reason\":\"capability_mismatch\""));

        let back: CommandRejection = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rej);
    }

    #[test]
    fn test_transport_error_display() {
        let e = TransportError::ConnectionFailed("tcp refused".to_string());
        assert_eq!(e.to_string(), "connection failed: tcp refused");
        assert_eq!(TransportError::ConnectionLost.to_string(), "connection lost");
    }
}
