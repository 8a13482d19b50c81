//! Gateway — the connector's public surface.
//!
//! Builds the orchestrator from JSON configuration, applies synchronous
//! command validation (unknown device, capability mismatch, malformed
//! request, layout violation), fans lifecycle events out to observers
//! and resolves barcode validations. One gateway value per fleet; tests
//! instantiate as many independent gateways as they need.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::{ConnectionMode, ConnectorConfig};
use crate::error::{CommandRejection, ConfigError, CoreError};
use crate::events::GatewayEvent;
use crate::layout::WarehouseLayout;
use crate::orchestrator::{DeviceRegistration, DeviceStatusReport, Orchestrator};
use crate::tracker::TrackerSnapshot;
use crate::transport::{EmulatedPlc, PlcTransport, TransportFactory};
use crate::types::{
    BarcodeValidationResponse, Command, CommandKind, CommandResult, GateDirection, Location,
};

/// Outcome of a batched submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub submitted: Vec<String>,
    pub rejected: Vec<RejectedCommand>,
}

/// One rejected entry of a batched submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedCommand {
    pub command_id: String,
    pub reason: CommandRejection,
}

/// Public connector surface.
pub struct Gateway {
    orchestrator: Orchestrator,
    layout: Option<WarehouseLayout>,
    /// Register-bank handles for `mode: "Emulated"` devices, for
    /// bring-up harnesses and tests.
    emulated: HashMap<String, EmulatedPlc>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").finish_non_exhaustive()
    }
}

impl Gateway {
    /// Build and start a gateway from the JSON configuration root.
    ///
    /// Every device must be `mode: "Emulated"`; use
    /// [`Gateway::initialize_with_factory`] when real PLCs are present.
    /// Must be called within a tokio runtime.
    pub fn initialize(config_json: &str) -> Result<Self, CoreError> {
        Self::initialize_with_factory(config_json, None)
    }

    /// Build and start a gateway, constructing `mode: "Real"` transports
    /// through the supplied factory.
    pub fn initialize_with_factory(
        config_json: &str,
        factory: Option<&dyn TransportFactory>,
    ) -> Result<Self, CoreError> {
        let config = ConnectorConfig::from_json(config_json)?;
        let mut orchestrator = Orchestrator::new();
        let mut emulated = HashMap::new();

        for device in &config.plc_connections {
            let transport: Box<dyn PlcTransport> = match device.mode {
                ConnectionMode::Emulated => {
                    let plc = EmulatedPlc::new();
                    emulated.insert(device.device_id.clone(), plc.clone());
                    Box::new(plc)
                }
                ConnectionMode::Real => {
                    let factory = factory.ok_or_else(|| ConfigError::InvalidDevice {
                        device: device.device_id.clone(),
                        detail: "mode \"Real\" requires a transport factory".to_string(),
                    })?;
                    factory.build(device)?
                }
            };
            orchestrator.register_device(DeviceRegistration {
                config: device.clone(),
                transport,
            })?;
        }

        orchestrator.start()?;
        Ok(Self {
            orchestrator,
            layout: None,
            emulated,
        })
    }

    /// Install the warehouse layout used for location validation.
    pub fn set_layout(&mut self, layout_json: &str) -> Result<(), CoreError> {
        self.layout = Some(WarehouseLayout::from_json(layout_json)?);
        Ok(())
    }

    // ─── Activation ──────────────────────────────────────────────────────────

    pub async fn activate_device(&self, device_id: &str) -> Result<(), CoreError> {
        self.orchestrator.connect_device(device_id).await
    }

    pub async fn activate_all(&self) -> Result<(), CoreError> {
        self.orchestrator.connect_all().await
    }

    // ─── Command submission ──────────────────────────────────────────────────

    /// Validate and enqueue one command. Accept-or-reject is immediate;
    /// execution results arrive on the observer streams.
    pub async fn send_command(&self, command: Command) -> Result<(), CommandRejection> {
        self.validate(&command)?;
        self.orchestrator.submit(command).await
    }

    /// Submit a batch; rejections don't stop the rest.
    pub async fn send_multiple_commands(&self, commands: Vec<Command>) -> SubmissionResult {
        let mut submitted = Vec::new();
        let mut rejected = Vec::new();
        for command in commands {
            let command_id = command.command_id.clone();
            match self.send_command(command).await {
                Ok(()) => submitted.push(command_id),
                Err(reason) => rejected.push(RejectedCommand { command_id, reason }),
            }
        }
        SubmissionResult {
            submitted,
            rejected,
        }
    }

    /// Answer a `BarcodeReceived` event for an in-flight Inbound command.
    pub fn send_validation_result(
        &self,
        command_id: &str,
        valid: bool,
        destination: Option<Location>,
        gate_number: Option<u8>,
        enter_direction: Option<GateDirection>,
        reason: Option<String>,
    ) -> Result<(), CoreError> {
        self.orchestrator.send_validation_result(
            command_id,
            BarcodeValidationResponse {
                valid,
                destination,
                gate_number,
                enter_direction,
                exit_direction: None,
                reason,
            },
        )
    }

    /// Remove a command that is still pending. Returns whether it was.
    pub fn remove_command(&self, command_id: &str) -> bool {
        self.orchestrator.remove(command_id)
    }

    /// Remove several; returns the ids actually removed.
    pub fn remove_commands(&self, command_ids: &[String]) -> Vec<String> {
        command_ids
            .iter()
            .filter(|id| self.orchestrator.remove(id))
            .cloned()
            .collect()
    }

    // ─── Queue control ───────────────────────────────────────────────────────

    pub fn pause_queue(&self) {
        self.orchestrator.pause_scheduling();
    }

    pub fn resume_queue(&self) {
        self.orchestrator.resume_scheduling();
    }

    pub fn is_paused(&self) -> bool {
        self.orchestrator.is_paused()
    }

    // ─── Introspection ───────────────────────────────────────────────────────

    pub async fn get_device_status(
        &self,
        device_id: &str,
    ) -> Result<DeviceStatusReport, CoreError> {
        self.orchestrator.device_status(device_id).await
    }

    pub async fn get_actual_location(&self, device_id: &str) -> Result<Location, CoreError> {
        self.orchestrator.actual_location(device_id).await
    }

    pub fn trigger_device_recovery(&self, device_id: &str) -> Result<(), CoreError> {
        self.orchestrator.trigger_device_recovery(device_id)
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        self.orchestrator.snapshot()
    }

    /// Lifecycle state of a submitted command, if the tracker knows it.
    pub fn command_state(&self, command_id: &str) -> Option<crate::types::CommandState> {
        self.orchestrator.command_state(command_id)
    }

    /// Independent stream of lifecycle events
    /// (`TaskSucceeded`/`TaskFailed`/`TaskAlarm`/`BarcodeReceived`).
    pub fn observe_events(&self) -> tokio_stream::wrappers::BroadcastStream<GatewayEvent> {
        self.orchestrator.observe_events()
    }

    /// Independent stream of raw command results.
    pub fn observe_results(&self) -> tokio_stream::wrappers::BroadcastStream<CommandResult> {
        self.orchestrator.observe_results()
    }

    /// Register-bank handle of an emulated device.
    pub fn emulated_handle(&self, device_id: &str) -> Option<EmulatedPlc> {
        self.emulated.get(device_id).cloned()
    }

    /// Stop the orchestration core and close every PLC link.
    pub async fn shutdown(&mut self) {
        self.orchestrator.stop().await;
    }

    // ─── Validation ──────────────────────────────────────────────────────────

    fn validate(&self, command: &Command) -> Result<(), CommandRejection> {
        // Device checks first: an unknown device is an unambiguous caller
        // bug regardless of payload shape.
        if let Some(device_id) = &command.device_affinity {
            let Some(caps) = self.orchestrator.device_capabilities(device_id) else {
                return Err(CommandRejection::UnknownDevice {
                    device_id: device_id.clone(),
                });
            };
            if !caps.supports(command.kind) {
                return Err(CommandRejection::CapabilityMismatch {
                    device_id: device_id.clone(),
                    kind: command.kind,
                });
            }
        } else {
            let any_capable = self
                .orchestrator
                .device_ids()
                .iter()
                .filter_map(|id| self.orchestrator.device_capabilities(id))
                .any(|caps| caps.supports(command.kind));
            if !any_capable {
                return Err(CommandRejection::NoCapableDevice { kind: command.kind });
            }
        }

        if command.command_id.is_empty() {
            return Err(CommandRejection::Malformed {
                detail: "command_id must not be empty".to_string(),
            });
        }
        match command.kind {
            CommandKind::Outbound => {
                if command.source.is_none() {
                    return Err(CommandRejection::Malformed {
                        detail: "outbound requires a source location".to_string(),
                    });
                }
                if command.gate_number == 0 {
                    return Err(CommandRejection::Malformed {
                        detail: "outbound requires a gate number".to_string(),
                    });
                }
            }
            CommandKind::Transfer => {
                if command.source.is_none() || command.destination.is_none() {
                    return Err(CommandRejection::Malformed {
                        detail: "transfer requires source and destination".to_string(),
                    });
                }
            }
            CommandKind::CheckPallet => {
                if command.source.is_none() {
                    return Err(CommandRejection::Malformed {
                        detail: "check_pallet requires a source location".to_string(),
                    });
                }
            }
            // Inbound needs nothing up front; the destination arrives
            // with the barcode validation.
            CommandKind::Inbound => {}
        }

        if let Some(layout) = &self.layout {
            for loc in [command.source, command.destination].into_iter().flatten() {
                if !layout.is_valid(&loc) {
                    return Err(CommandRejection::LayoutViolation {
                        detail: format!("location {loc} is outside the configured layout"),
                    });
                }
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests_support::emulated_device;
    use chrono::Utc;

    async fn gateway() -> Gateway {
        let (config, _) = emulated_device("D1");
        let json = serde_json::to_string(&ConnectorConfig {
            plc_connections: vec![config],
        })
        .unwrap();
        Gateway::initialize(&json).unwrap()
    }

    fn outbound(id: &str, device: Option<&str>) -> Command {
        Command {
            command_id: id.to_string(),
            device_affinity: device.map(str::to_string),
            kind: CommandKind::Outbound,
            source: Some(Location {
                floor: 1,
                rail: 1,
                block: 3,
                depth: 1,
            }),
            destination: None,
            gate_number: 4,
            enter_direction: None,
            exit_direction: Some(GateDirection::Top),
            submitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_unknown_device_rejected() {
        let mut gw = gateway().await;
        let err = gw.send_command(outbound("c1", Some("D9"))).await.unwrap_err();
        assert!(matches!(err, CommandRejection::UnknownDevice { .. }));
        gw.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_source_rejected() {
        let mut gw = gateway().await;
        let mut cmd = outbound("c1", None);
        cmd.source = None;
        let err = gw.send_command(cmd).await.unwrap_err();
        assert!(matches!(err, CommandRejection::Malformed { .. }));
        gw.shutdown().await;
    }

    #[tokio::test]
    async fn test_layout_violation_rejected() {
        let mut gw = gateway().await;
        gw.set_layout(
            r#"{"blocks": [{"blockNumber": 1, "maxFloor": 2, "maxRail": 2, "maxDepth": 1}]}"#,
        )
        .unwrap();
        // Block 3 does not exist in this layout.
        let err = gw.send_command(outbound("c1", None)).await.unwrap_err();
        assert!(matches!(err, CommandRejection::LayoutViolation { .. }));
        gw.shutdown().await;
    }

    #[tokio::test]
    async fn test_capability_mismatch_rejected() {
        let (mut config, _) = emulated_device("D1");
        config.capabilities.supports_transfer = false;
        let json = serde_json::to_string(&ConnectorConfig {
            plc_connections: vec![config],
        })
        .unwrap();
        let mut gw = Gateway::initialize(&json).unwrap();

        let cmd = Command {
            command_id: "t1".to_string(),
            device_affinity: Some("D1".to_string()),
            kind: CommandKind::Transfer,
            source: Some(Location {
                floor: 1,
                rail: 1,
                block: 1,
                depth: 1,
            }),
            destination: Some(Location {
                floor: 2,
                rail: 1,
                block: 1,
                depth: 1,
            }),
            gate_number: 0,
            enter_direction: None,
            exit_direction: None,
            submitted_at: Utc::now(),
        };
        let err = gw.send_command(cmd).await.unwrap_err();
        assert!(matches!(err, CommandRejection::CapabilityMismatch { .. }));
        gw.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_submission_mixed() {
        let mut gw = gateway().await;
        let good = outbound("ok1", None);
        let mut bad = outbound("bad1", None);
        bad.gate_number = 0;

        let result = gw.send_multiple_commands(vec![good, bad]).await;
        assert_eq!(result.submitted, vec!["ok1"]);
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(result.rejected[0].command_id, "bad1");
        gw.shutdown().await;
    }

    #[tokio::test]
    async fn test_validation_result_without_scan() {
        let mut gw = gateway().await;
        let err = gw
            .send_validation_result("ghost", true, None, None, None, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::NoPendingValidation(_)));
        gw.shutdown().await;
    }

    #[tokio::test]
    async fn test_real_mode_requires_factory() {
        let (mut config, _) = emulated_device("D1");
        config.mode = ConnectionMode::Real;
        let json = serde_json::to_string(&ConnectorConfig {
            plc_connections: vec![config],
        })
        .unwrap();
        let err = Gateway::initialize(&json).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }
}
