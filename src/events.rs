//! Gateway event model.
//!
//! External observers see lifecycle events rather than raw results:
//! terminal results project to `TaskSucceeded`/`TaskFailed`, intermediate
//! alarms to `TaskAlarm`, and the Inbound executor raises
//! `BarcodeReceived` directly while it waits for validation.

use serde::{Deserialize, Serialize};

use crate::types::{CommandResult, CommandStatus};

/// Lifecycle event published on the gateway's event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayEvent {
    TaskSucceeded {
        device_id: String,
        command_id: String,
    },
    TaskFailed {
        device_id: String,
        command_id: String,
        error: String,
    },
    TaskAlarm {
        device_id: String,
        command_id: String,
        error_code: i16,
        error_message: String,
    },
    BarcodeReceived {
        device_id: String,
        command_id: String,
        barcode: String,
    },
}

impl GatewayEvent {
    /// Project a command result onto the event stream.
    pub fn from_result(result: &CommandResult) -> Self {
        match result.status {
            CommandStatus::Success => Self::TaskSucceeded {
                device_id: result.device_id.clone(),
                command_id: result.command_id.clone(),
            },
            CommandStatus::Alarm => {
                let (code, message) = result
                    .plc_error
                    .as_ref()
                    .map(|e| (e.code, e.message.clone()))
                    .unwrap_or((0, result.message.clone()));
                Self::TaskAlarm {
                    device_id: result.device_id.clone(),
                    command_id: result.command_id.clone(),
                    error_code: code,
                    error_message: message,
                }
            }
            CommandStatus::Failed | CommandStatus::Timeout => Self::TaskFailed {
                device_id: result.device_id.clone(),
                command_id: result.command_id.clone(),
                error: result.message.clone(),
            },
        }
    }
}
