//! PLC transport contract.
//!
//! The wire protocol (S7 framing, TCP session management) lives outside
//! this crate; the core consumes this trait only. Each transport instance
//! is exclusive to one device — the connection manager serialises every
//! operation behind a single lock, so implementations may assume no
//! concurrent calls.

pub mod emulated;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::signal_map::SignalAddress;

pub use emulated::EmulatedPlc;

/// Typed read/write access to PLC memory addresses.
///
/// Reads during disconnection fail with `ConnectionLost`. Writes to
/// bit-offset addresses perform read-modify-write on the underlying
/// byte.
#[async_trait]
pub trait PlcTransport: Send {
    async fn connect(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Idempotent.
    async fn disconnect(&mut self);

    /// Cheap, no network round-trip.
    fn is_connected(&self) -> bool;

    async fn read_bool(&mut self, addr: &SignalAddress) -> Result<bool, TransportError>;
    async fn write_bool(&mut self, addr: &SignalAddress, value: bool)
        -> Result<(), TransportError>;

    async fn read_byte(&mut self, addr: &SignalAddress) -> Result<u8, TransportError>;
    async fn write_byte(&mut self, addr: &SignalAddress, value: u8) -> Result<(), TransportError>;

    async fn read_word(&mut self, addr: &SignalAddress) -> Result<i16, TransportError>;
    async fn write_word(&mut self, addr: &SignalAddress, value: i16)
        -> Result<(), TransportError>;

    async fn read_dword(&mut self, addr: &SignalAddress) -> Result<i32, TransportError>;
    async fn write_dword(&mut self, addr: &SignalAddress, value: i32)
        -> Result<(), TransportError>;
}

/// Builds transports for `mode: "Real"` devices.
///
/// The crate ships no real S7 codec; hosts supply one through this
/// factory at gateway initialization.
pub trait TransportFactory: Send + Sync {
    fn build(
        &self,
        config: &crate::config::PlcConnectionConfig,
    ) -> Result<Box<dyn PlcTransport>, TransportError>;
}
