//! Shared fixtures for the scenario tests: a full emulated device
//! configuration and helpers to drive PLC flags from the outside.

// Each test binary compiles this module separately and uses a subset.
#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio_stream::StreamExt;

use wcs_connector::config::{ConnectionMode, DeviceCapabilities, PlcConnectionConfig};
use wcs_connector::signal_map::{SignalAddress, SignalMap, SignalName};
use wcs_connector::transport::EmulatedPlc;
use wcs_connector::{
    Command, CommandKind, CommandResult, ConnectorConfig, Gateway, GateDirection, Location,
};

/// Route core tracing into the test harness (RUST_LOG controls detail).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn full_signal_map() -> HashMap<String, String> {
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

pub fn device_config(device_id: &str) -> PlcConnectionConfig {
    PlcConnectionConfig {
        device_id: device_id.to_string(),
        ip_address: "192.168.0.10".to_string(),
        rack: 0,
        slot: 1,
        port: 102,
        mode: ConnectionMode::Emulated,
        connect_timeout: Duration::from_secs(5),
        operation_timeout: Duration::from_secs(2),
        health_check_interval: Duration::from_secs(30),
        max_reconnect_attempts: 3,
        reconnect_base_delay: Duration::from_secs(1),
        stop_on_alarm: false,
        command_timeout: Duration::from_secs(15 * 60),
        auto_recovery_enabled: true,
        recovery_poll_interval: Duration::from_secs(5),
        signal_map: full_signal_map(),
        capabilities: DeviceCapabilities::default(),
    }
}

pub fn config_json(devices: Vec<PlcConnectionConfig>) -> String {
    serde_json::to_string(&ConnectorConfig {
        plc_connections: devices,
    })
    .unwrap()
}

/// Drives one emulated device's registers from the test side.
pub struct PlcHandle {
    pub plc: EmulatedPlc,
    pub signals: SignalMap,
}

impl PlcHandle {
    pub fn new(gateway: &Gateway, config: &PlcConnectionConfig) -> Self {
        Self {
            plc: gateway.emulated_handle(&config.device_id).unwrap(),
            signals: config.build_signal_map().unwrap(),
        }
    }

    pub fn addr(&self, signal: SignalName) -> SignalAddress {
        self.signals.addr(signal).unwrap()
    }

    pub fn set_flag(&self, signal: SignalName, value: bool) {
        self.plc.poke(&self.addr(signal), value as i64);
    }

    pub fn set_word(&self, signal: SignalName, value: i16) {
        self.plc.poke(&self.addr(signal), value as i64);
    }

    pub fn get(&self, signal: SignalName) -> i64 {
        self.plc.peek(&self.addr(signal))
    }

    /// Bring the device to the state a healthy idle PLC reports.
    pub fn make_ready(&self) {
        self.set_flag(SignalName::SoftwareConnected, true);
        self.set_flag(SignalName::DeviceReady, true);
    }

    pub fn set_barcode(&self, barcode: &str) {
        assert_eq!(barcode.len(), 10, "barcodes are ten characters");
        for (i, byte) in barcode.bytes().enumerate() {
            self.plc.poke(
                &self.addr(SignalName::BarcodeChar(i as u8 + 1)),
                byte as i64,
            );
        }
    }
}

pub fn loc(floor: u16, rail: u16, block: u16, depth: u16) -> Location {
    Location {
        floor,
        rail,
        block,
        depth,
    }
}

pub fn outbound(id: &str, device: Option<&str>) -> Command {
    Command {
        command_id: id.to_string(),
        device_affinity: device.map(str::to_string),
        kind: CommandKind::Outbound,
        source: Some(loc(1, 1, 3, 1)),
        destination: None,
        gate_number: 4,
        enter_direction: None,
        exit_direction: Some(GateDirection::Top),
        submitted_at: Utc::now(),
    }
}

pub fn inbound(id: &str) -> Command {
    Command {
        command_id: id.to_string(),
        device_affinity: None,
        kind: CommandKind::Inbound,
        source: None,
        destination: None,
        gate_number: 0,
        enter_direction: None,
        exit_direction: None,
        submitted_at: Utc::now(),
    }
}

pub fn transfer(id: &str, device: Option<&str>) -> Command {
    Command {
        command_id: id.to_string(),
        device_affinity: device.map(str::to_string),
        kind: CommandKind::Transfer,
        source: Some(loc(1, 2, 3, 1)),
        destination: Some(loc(2, 4, 3, 1)),
        gate_number: 0,
        enter_direction: None,
        exit_direction: None,
        submitted_at: Utc::now(),
    }
}

pub fn check_pallet(id: &str) -> Command {
    Command {
        command_id: id.to_string(),
        device_affinity: None,
        kind: CommandKind::CheckPallet,
        source: Some(loc(1, 1, 3, 1)),
        destination: None,
        gate_number: 0,
        enter_direction: None,
        exit_direction: None,
        submitted_at: Utc::now(),
    }
}

/// Next result for a specific command on an observer stream, skipping
/// everything else. Panics if the stream ends.
pub async fn next_result_for(
    stream: &mut tokio_stream::wrappers::BroadcastStream<CommandResult>,
    command_id: &str,
) -> CommandResult {
    loop {
        match stream.next().await {
            Some(Ok(result)) if result.command_id == command_id => return result,
            Some(_) => continue,
            None => panic!("result stream ended while waiting for {command_id}"),
        }
    }
}

/// Poll a predicate until it holds, with a generous virtual-time cap.
pub async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    let deadline = Duration::from_secs(60);
    let started = tokio::time::Instant::now();
    while !predicate() {
        if started.elapsed() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
