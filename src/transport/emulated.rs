//! In-memory PLC emulation.
//!
//! Backs `mode: "Emulated"` devices and every scenario test. Registers
//! retain whatever was last written; there is no firmware logic behind
//! them, so a test (or bring-up harness) drives completion/alarm flags
//! through a cloned handle while the core runs the handshake against the
//! same shared state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::signal_map::{AddressWidth, SignalAddress};

#[derive(Debug, Default)]
struct EmulatedState {
    connected: bool,
    /// One cell per full address string (bit addresses keep their bit
    /// suffix, so read-modify-write on a shared byte is per-bit here).
    cells: HashMap<String, i64>,
    /// When true, `connect` fails until cleared (reconnect-path testing).
    refuse_connections: bool,
}

/// Cloneable in-memory transport; clones share one register bank.
#[derive(Debug, Clone, Default)]
pub struct EmulatedPlc {
    state: Arc<Mutex<EmulatedState>>,
}

impl EmulatedPlc {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_width(addr: &SignalAddress, expected: AddressWidth) -> Result<(), TransportError> {
        if addr.width == expected {
            Ok(())
        } else {
            Err(TransportError::DataFormat(format!(
                "address {addr} is not a {expected:?} cell"
            )))
        }
    }

    fn read_cell(&self, addr: &SignalAddress) -> Result<i64, TransportError> {
        let state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::ConnectionLost);
        }
        Ok(state.cells.get(&addr.to_string()).copied().unwrap_or(0))
    }

    fn write_cell(&self, addr: &SignalAddress, value: i64) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::ConnectionLost);
        }
        state.cells.insert(addr.to_string(), value);
        Ok(())
    }

    // ─── Test/bring-up handle methods (bypass the connection check) ──────────

    /// Force a register value from outside the core.
    pub fn poke(&self, addr: &SignalAddress, value: i64) {
        self.state
            .lock()
            .unwrap()
            .cells
            .insert(addr.to_string(), value);
    }

    /// Observe a register value from outside the core.
    pub fn peek(&self, addr: &SignalAddress) -> i64 {
        self.state
            .lock()
            .unwrap()
            .cells
            .get(&addr.to_string())
            .copied()
            .unwrap_or(0)
    }

    /// Drop the link as if the PLC went away; subsequent reads fail with
    /// `ConnectionLost` until `connect` succeeds again.
    pub fn sever(&self) {
        self.state.lock().unwrap().connected = false;
    }

    /// Make `connect` fail (or succeed again) for reconnect tests.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_connections = refuse;
    }
}

#[async_trait]
impl super::PlcTransport for EmulatedPlc {
    async fn connect(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_connections {
            return Err(TransportError::ConnectionFailed(
                "emulated endpoint refusing connections".to_string(),
            ));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.state.lock().unwrap().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    async fn read_bool(&mut self, addr: &SignalAddress) -> Result<bool, TransportError> {
        Self::check_width(addr, AddressWidth::Bit)?;
        Ok(self.read_cell(addr)? != 0)
    }

    async fn write_bool(
        &mut self,
        addr: &SignalAddress,
        value: bool,
    ) -> Result<(), TransportError> {
        Self::check_width(addr, AddressWidth::Bit)?;
        self.write_cell(addr, value as i64)
    }

    async fn read_byte(&mut self, addr: &SignalAddress) -> Result<u8, TransportError> {
        Self::check_width(addr, AddressWidth::Byte)?;
        Ok(self.read_cell(addr)? as u8)
    }

    async fn write_byte(&mut self, addr: &SignalAddress, value: u8) -> Result<(), TransportError> {
        Self::check_width(addr, AddressWidth::Byte)?;
        self.write_cell(addr, value as i64)
    }

    async fn read_word(&mut self, addr: &SignalAddress) -> Result<i16, TransportError> {
        Self::check_width(addr, AddressWidth::Word)?;
        Ok(self.read_cell(addr)? as i16)
    }

    async fn write_word(&mut self, addr: &SignalAddress, value: i16) -> Result<(), TransportError> {
        Self::check_width(addr, AddressWidth::Word)?;
        self.write_cell(addr, value as i64)
    }

    async fn read_dword(&mut self, addr: &SignalAddress) -> Result<i32, TransportError> {
        Self::check_width(addr, AddressWidth::DWord)?;
        Ok(self.read_cell(addr)? as i32)
    }

    async fn write_dword(
        &mut self,
        addr: &SignalAddress,
        value: i32,
    ) -> Result<(), TransportError> {
        Self::check_width(addr, AddressWidth::DWord)?;
        self.write_cell(addr, value as i64)
    }
}
