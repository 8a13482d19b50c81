//! Connector configuration — JSON root, `HH:mm:ss` durations, validation.
//!
//! One `PlcConnectionConfig` per device. Loading is strict: duplicate
//! device ids, malformed addresses, unknown signal names and missing
//! capability-implied signals all fail initialization.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::signal_map::SignalMap;
use crate::types::CommandKind;

/// Serde adapter for `HH:mm:ss` duration fields.
pub mod duration_hms {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn parse(s: &str) -> Option<Duration> {
        let mut parts = s.split(':');
        let hours: u64 = parts.next()?.parse().ok()?;
        let minutes: u64 = parts.next()?.parse().ok()?;
        let seconds: u64 = parts.next()?.parse().ok()?;
        if parts.next().is_some() || minutes > 59 || seconds > 59 {
            return None;
        }
        Some(Duration::from_secs(hours * 3600 + minutes * 60 + seconds))
    }

    pub fn format(d: &Duration) -> String {
        let total = d.as_secs();
        format!(
            "{:02}:{:02}:{:02}",
            total / 3600,
            (total % 3600) / 60,
            total % 60
        )
    }

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(de)?;
        parse(&s).ok_or_else(|| {
            de::Error::custom(format!("invalid duration '{s}', expected HH:mm:ss"))
        })
    }
}

// ---------------------------------------------------------------------------
// Device configuration
// ---------------------------------------------------------------------------

/// Whether the device talks to a real PLC or the in-memory emulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionMode {
    Real,
    Emulated,
}

/// Which command kinds a device accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceCapabilities {
    pub supports_inbound: bool,
    pub supports_outbound: bool,
    pub supports_transfer: bool,
    pub supports_pallet_check: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            supports_inbound: true,
            supports_outbound: true,
            supports_transfer: true,
            supports_pallet_check: true,
        }
    }
}

impl DeviceCapabilities {
    pub fn supports(&self, kind: CommandKind) -> bool {
        match kind {
            CommandKind::Inbound => self.supports_inbound,
            CommandKind::Outbound => self.supports_outbound,
            CommandKind::Transfer => self.supports_transfer,
            CommandKind::CheckPallet => self.supports_pallet_check,
        }
    }
}

/// Configuration for one PLC connection / device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlcConnectionConfig {
    pub device_id: String,
    pub ip_address: String,
    pub rack: u16,
    pub slot: u16,
    #[serde(default = "default_port")]
    pub port: u16,
    pub mode: ConnectionMode,
    #[serde(with = "duration_hms", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_hms", default = "default_operation_timeout")]
    pub operation_timeout: Duration,
    #[serde(with = "duration_hms", default = "default_health_check_interval")]
    pub health_check_interval: Duration,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(with = "duration_hms", default = "default_reconnect_base_delay")]
    pub reconnect_base_delay: Duration,
    /// Terminate the running command when the PLC raises an alarm.
    #[serde(default)]
    pub stop_on_alarm: bool,
    #[serde(with = "duration_hms", default = "default_command_timeout")]
    pub command_timeout: Duration,
    #[serde(default = "default_true")]
    pub auto_recovery_enabled: bool,
    #[serde(with = "duration_hms", default = "default_recovery_poll_interval")]
    pub recovery_poll_interval: Duration,
    pub signal_map: HashMap<String, String>,
    #[serde(default)]
    pub capabilities: DeviceCapabilities,
}

fn default_port() -> u16 {
    102
}
fn default_true() -> bool {
    true
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_operation_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_base_delay() -> Duration {
    Duration::from_secs(1)
}
fn default_command_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}
fn default_recovery_poll_interval() -> Duration {
    Duration::from_secs(5)
}

impl PlcConnectionConfig {
    /// Parse and validate this device's signal map.
    pub fn build_signal_map(&self) -> Result<SignalMap, ConfigError> {
        let map = SignalMap::from_raw(&self.device_id, &self.signal_map)?;
        map.validate_for(&self.device_id, &self.capabilities)?;
        Ok(map)
    }
}

// ---------------------------------------------------------------------------
// Root configuration
// ---------------------------------------------------------------------------

/// JSON configuration root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorConfig {
    pub plc_connections: Vec<PlcConnectionConfig>,
}

impl ConnectorConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for device in &self.plc_connections {
            if device.device_id.is_empty() {
                return Err(ConfigError::InvalidDevice {
                    device: "<empty>".to_string(),
                    detail: "deviceId must not be empty".to_string(),
                });
            }
            if !seen.insert(device.device_id.as_str()) {
                return Err(ConfigError::DuplicateDevice(device.device_id.clone()));
            }
            if device.port == 0 {
                return Err(ConfigError::InvalidDevice {
                    device: device.device_id.clone(),
                    detail: "port must be 1..=65535".to_string(),
                });
            }
            if device.ip_address.parse::<std::net::Ipv4Addr>().is_err() {
                return Err(ConfigError::InvalidDevice {
                    device: device.device_id.clone(),
                    detail: format!("invalid ipAddress '{}'", device.ip_address),
                });
            }
            // Signal map parse is fatal here, not at first use.
            device.build_signal_map()?;
        }
        Ok(())
    }

    pub fn device(&self, device_id: &str) -> Option<&PlcConnectionConfig> {
        self.plc_connections
            .iter()
            .find(|d| d.device_id == device_id)
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

/// Shared fixtures for unit tests across the crate.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::transport::EmulatedPlc;

    /// A complete signal table covering every capability.
    pub(crate) fn full_signal_map() -> HashMap<String, String> {
        let mut raw: HashMap<String, String> = [
            ("DeviceReady", "DB100.DBX0.0"),
            ("SoftwareConnected", "DB100.DBX0.1"),
            ("CommandFailed", "DB100.DBX0.2"),
            ("ErrorAlarm", "DB100.DBX0.3"),
            ("StartProcess", "DB100.DBX0.4"),
            ("InboundTrigger", "DB100.DBX1.0"),
            ("OutboundTrigger", "DB100.DBX1.1"),
            ("TransferTrigger", "DB100.DBX1.2"),
            ("PalletCheckTrigger", "DB100.DBX1.3"),
            ("InboundCompleted", "DB100.DBX2.0"),
            ("OutboundCompleted", "DB100.DBX2.1"),
            ("TransferCompleted", "DB100.DBX2.2"),
            ("PalletCheckCompleted", "DB100.DBX2.3"),
            ("BarcodeValid", "DB100.DBX3.0"),
            ("BarcodeInvalid", "DB100.DBX3.1"),
            ("AvailablePallet", "DB100.DBX3.2"),
            ("UnavailablePallet", "DB100.DBX3.3"),
            ("ErrorCode", "DB100.DBW4"),
            ("SourceFloor", "DB100.DBW6"),
            ("SourceRail", "DB100.DBW8"),
            ("SourceBlock", "DB100.DBW10"),
            ("SourceDepth", "DB100.DBW12"),
            ("TargetFloor", "DB100.DBW14"),
            ("TargetRail", "DB100.DBW16"),
            ("TargetBlock", "DB100.DBW18"),
            ("TargetDepth", "DB100.DBW20"),
            ("GateNumber", "DB100.DBB22"),
            ("EnterDirection", "DB100.DBB23"),
            ("ExitDirection", "DB100.DBB24"),
            ("CurrentFloor", "DB100.DBW26"),
            ("CurrentRail", "DB100.DBW28"),
            ("CurrentBlock", "DB100.DBW30"),
            ("CurrentDepth", "DB100.DBW32"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for n in 1..=10u32 {
            raw.insert(format!("BarcodeChar{n}"), format!("DB100.DBB{}", 33 + n));
        }
        raw
    }

    /// Device config tuned for fast tests, plus a fresh emulated PLC.
    pub(crate) fn emulated_device(device_id: &str) -> (PlcConnectionConfig, EmulatedPlc) {
        let config = PlcConnectionConfig {
            device_id: device_id.to_string(),
            ip_address: "127.0.0.1".to_string(),
            rack: 0,
            slot: 1,
            port: default_port(),
            mode: ConnectionMode::Emulated,
            connect_timeout: Duration::from_secs(1),
            operation_timeout: Duration::from_secs(1),
            health_check_interval: Duration::from_millis(100),
            max_reconnect_attempts: 3,
            reconnect_base_delay: Duration::from_millis(10),
            stop_on_alarm: false,
            command_timeout: Duration::from_secs(30),
            auto_recovery_enabled: true,
            recovery_poll_interval: Duration::from_millis(100),
            signal_map: full_signal_map(),
            capabilities: DeviceCapabilities::default(),
        };
        (config, EmulatedPlc::new())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
