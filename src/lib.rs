//! Command orchestration core for a shuttle warehouse control system
//! connector.
//!
//! Mediates between a management system and a fleet of PLC-driven
//! shuttle devices: accepts transport commands (Inbound, Outbound,
//! Transfer, CheckPallet), schedules them under fleet-wide compatibility
//! rules, drives each device through the PLC register handshake, and
//! reports lifecycle events to any number of observers.
//!
//! ## Architecture
//!
//! ```text
//! Gateway ── validate ──► Orchestrator ──► Matchmaker ──► DeviceWorker (×N)
//!    │                        │                │               │
//!    │                        │           ReadyTickets     Executor
//!    │                        │                             ├─ SignalMonitor
//!    │                        │                             └─ ConnectionManager ── PlcTransport
//!    │                        │
//!    └── events ◄── broadcast ┴── ReplyHub ◄── results
//! ```
//!
//! The PLC wire protocol stays outside the crate: hosts hand in a
//! [`transport::PlcTransport`] per real device, while `mode: "Emulated"`
//! devices run against the in-memory register bank.

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod executor;
pub mod gateway;
pub mod layout;
pub mod matchmaker;
pub mod monitor;
pub mod orchestrator;
pub mod rendezvous;
pub mod signal_map;
pub mod tracker;
pub mod transport;
pub mod types;
pub mod worker;

pub use config::{ConnectionMode, ConnectorConfig, DeviceCapabilities, PlcConnectionConfig};
pub use error::{CommandRejection, ConfigError, CoreError, TransportError};
pub use events::GatewayEvent;
pub use gateway::{Gateway, RejectedCommand, SubmissionResult};
pub use layout::WarehouseLayout;
pub use orchestrator::{DeviceRegistration, DeviceStatusReport, Orchestrator};
pub use tracker::{DeviceRollup, PendingTracker, TrackerSnapshot};
pub use transport::{EmulatedPlc, PlcTransport, TransportFactory};
pub use types::{
    BarcodeValidationResponse, Command, CommandKind, CommandResult, CommandState, CommandStatus,
    GateDirection, Location, PlcError, ReadyTicket,
};
