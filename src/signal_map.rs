//! Signal map — named PLC flags/registers and their S7-style addresses.
//!
//! Configuration maps a fixed set of signal names to addresses of the
//! form `DB<blk>.DB<T><offset>[.bit]` with `T ∈ {X, B, W, D}`. The core
//! parses that shape once at config load and treats the result as opaque
//! afterwards; the transport is the only consumer of the parsed fields.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::DeviceCapabilities;
use crate::error::ConfigError;
use crate::types::CommandKind;

// ---------------------------------------------------------------------------
// Signal names
// ---------------------------------------------------------------------------

/// Every signal the orchestration core can address on a device.
///
/// `BarcodeChar(n)` covers the ten barcode character registers
/// (`BarcodeChar1` .. `BarcodeChar10`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalName {
    // Status flags
    DeviceReady,
    SoftwareConnected,
    CommandFailed,
    ErrorAlarm,
    ErrorCode,
    // Completion flags (one per command kind)
    InboundCompleted,
    OutboundCompleted,
    TransferCompleted,
    PalletCheckCompleted,
    // Handshake control bits
    StartProcess,
    InboundTrigger,
    OutboundTrigger,
    TransferTrigger,
    PalletCheckTrigger,
    // Barcode validation outcome bits
    BarcodeValid,
    BarcodeInvalid,
    // Pallet check outputs
    AvailablePallet,
    UnavailablePallet,
    // Command input registers
    SourceFloor,
    SourceRail,
    SourceBlock,
    SourceDepth,
    TargetFloor,
    TargetRail,
    TargetBlock,
    TargetDepth,
    GateNumber,
    EnterDirection,
    ExitDirection,
    // Live position registers
    CurrentFloor,
    CurrentRail,
    CurrentBlock,
    CurrentDepth,
    // Barcode character registers, 1-based index 1..=10
    BarcodeChar(u8),
}

impl SignalName {
    /// Number of barcode character registers.
    pub const BARCODE_CHARS: u8 = 10;

    pub fn name(&self) -> String {
        match self {
            Self::DeviceReady => "DeviceReady".to_string(),
            Self::SoftwareConnected => "SoftwareConnected".to_string(),
            Self::CommandFailed => "CommandFailed".to_string(),
            Self::ErrorAlarm => "ErrorAlarm".to_string(),
            Self::ErrorCode => "ErrorCode".to_string(),
            Self::InboundCompleted => "InboundCompleted".to_string(),
            Self::OutboundCompleted => "OutboundCompleted".to_string(),
            Self::TransferCompleted => "TransferCompleted".to_string(),
            Self::PalletCheckCompleted => "PalletCheckCompleted".to_string(),
            Self::StartProcess => "StartProcess".to_string(),
            Self::InboundTrigger => "InboundTrigger".to_string(),
            Self::OutboundTrigger => "OutboundTrigger".to_string(),
            Self::TransferTrigger => "TransferTrigger".to_string(),
            Self::PalletCheckTrigger => "PalletCheckTrigger".to_string(),
            Self::BarcodeValid => "BarcodeValid".to_string(),
            Self::BarcodeInvalid => "BarcodeInvalid".to_string(),
            Self::AvailablePallet => "AvailablePallet".to_string(),
            Self::UnavailablePallet => "UnavailablePallet".to_string(),
            Self::SourceFloor => "SourceFloor".to_string(),
            Self::SourceRail => "SourceRail".to_string(),
            Self::SourceBlock => "SourceBlock".to_string(),
            Self::SourceDepth => "SourceDepth".to_string(),
            Self::TargetFloor => "TargetFloor".to_string(),
            Self::TargetRail => "TargetRail".to_string(),
            Self::TargetBlock => "TargetBlock".to_string(),
            Self::TargetDepth => "TargetDepth".to_string(),
            Self::GateNumber => "GateNumber".to_string(),
            Self::EnterDirection => "EnterDirection".to_string(),
            Self::ExitDirection => "ExitDirection".to_string(),
            Self::CurrentFloor => "CurrentFloor".to_string(),
            Self::CurrentRail => "CurrentRail".to_string(),
            Self::CurrentBlock => "CurrentBlock".to_string(),
            Self::CurrentDepth => "CurrentDepth".to_string(),
            Self::BarcodeChar(n) => format!("BarcodeChar{n}"),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        if let Some(rest) = s.strip_prefix("BarcodeChar") {
            let n: u8 = rest.parse().ok()?;
            if (1..=Self::BARCODE_CHARS).contains(&n) {
                return Some(Self::BarcodeChar(n));
            }
            return None;
        }
        match s {
            "DeviceReady" => Some(Self::DeviceReady),
            "SoftwareConnected" => Some(Self::SoftwareConnected),
            "CommandFailed" => Some(Self::CommandFailed),
            "ErrorAlarm" => Some(Self::ErrorAlarm),
            "ErrorCode" => Some(Self::ErrorCode),
            "InboundCompleted" => Some(Self::InboundCompleted),
            "OutboundCompleted" => Some(Self::OutboundCompleted),
            "TransferCompleted" => Some(Self::TransferCompleted),
            "PalletCheckCompleted" => Some(Self::PalletCheckCompleted),
            "StartProcess" => Some(Self::StartProcess),
            "InboundTrigger" => Some(Self::InboundTrigger),
            "OutboundTrigger" => Some(Self::OutboundTrigger),
            "TransferTrigger" => Some(Self::TransferTrigger),
            "PalletCheckTrigger" => Some(Self::PalletCheckTrigger),
            "BarcodeValid" => Some(Self::BarcodeValid),
            "BarcodeInvalid" => Some(Self::BarcodeInvalid),
            "AvailablePallet" => Some(Self::AvailablePallet),
            "UnavailablePallet" => Some(Self::UnavailablePallet),
            "SourceFloor" => Some(Self::SourceFloor),
            "SourceRail" => Some(Self::SourceRail),
            "SourceBlock" => Some(Self::SourceBlock),
            "SourceDepth" => Some(Self::SourceDepth),
            "TargetFloor" => Some(Self::TargetFloor),
            "TargetRail" => Some(Self::TargetRail),
            "TargetBlock" => Some(Self::TargetBlock),
            "TargetDepth" => Some(Self::TargetDepth),
            "GateNumber" => Some(Self::GateNumber),
            "EnterDirection" => Some(Self::EnterDirection),
            "ExitDirection" => Some(Self::ExitDirection),
            "CurrentFloor" => Some(Self::CurrentFloor),
            "CurrentRail" => Some(Self::CurrentRail),
            "CurrentBlock" => Some(Self::CurrentBlock),
            "CurrentDepth" => Some(Self::CurrentDepth),
            _ => None,
        }
    }

    /// The completion flag the signal monitor watches for a kind.
    pub fn completion_for(kind: CommandKind) -> Self {
        match kind {
            CommandKind::Inbound => Self::InboundCompleted,
            CommandKind::Outbound => Self::OutboundCompleted,
            CommandKind::Transfer => Self::TransferCompleted,
            CommandKind::CheckPallet => Self::PalletCheckCompleted,
        }
    }

    /// The handshake trigger bit pulsed for a kind.
    pub fn trigger_for(kind: CommandKind) -> Self {
        match kind {
            CommandKind::Inbound => Self::InboundTrigger,
            CommandKind::Outbound => Self::OutboundTrigger,
            CommandKind::Transfer => Self::TransferTrigger,
            CommandKind::CheckPallet => Self::PalletCheckTrigger,
        }
    }
}

impl std::fmt::Display for SignalName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

/// Width of a PLC memory cell, from the `T` in `DB<blk>.DB<T><offset>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressWidth {
    /// `X` — a single bit (requires a `.bit` suffix).
    Bit,
    /// `B` — one byte.
    Byte,
    /// `W` — a 16-bit word.
    Word,
    /// `D` — a 32-bit double word.
    DWord,
}

impl AddressWidth {
    fn letter(&self) -> char {
        match self {
            Self::Bit => 'X',
            Self::Byte => 'B',
            Self::Word => 'W',
            Self::DWord => 'D',
        }
    }
}

/// A parsed S7-style data block address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalAddress {
    pub db: u16,
    pub width: AddressWidth,
    pub offset: u32,
    /// Bit position 0..=7; present iff `width` is `Bit`.
    pub bit: Option<u8>,
}

impl FromStr for SignalAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("DB")
            .ok_or_else(|| "expected 'DB' prefix".to_string())?;
        let (db_str, rest) = rest
            .split_once('.')
            .ok_or_else(|| "expected '.' after block number".to_string())?;
        let db: u16 = db_str
            .parse()
            .map_err(|_| format!("invalid block number '{db_str}'"))?;

        let rest = rest
            .strip_prefix("DB")
            .ok_or_else(|| "expected 'DB<T>' after block".to_string())?;
        let mut chars = rest.chars();
        let width = match chars.next() {
            Some('X') => AddressWidth::Bit,
            Some('B') => AddressWidth::Byte,
            Some('W') => AddressWidth::Word,
            Some('D') => AddressWidth::DWord,
            other => return Err(format!("invalid width letter {other:?}")),
        };
        let tail: &str = chars.as_str();

        match width {
            AddressWidth::Bit => {
                let (off_str, bit_str) = tail
                    .split_once('.')
                    .ok_or_else(|| "bit address requires '.bit' suffix".to_string())?;
                let offset: u32 = off_str
                    .parse()
                    .map_err(|_| format!("invalid offset '{off_str}'"))?;
                let bit: u8 = bit_str
                    .parse()
                    .map_err(|_| format!("invalid bit '{bit_str}'"))?;
                if bit > 7 {
                    return Err(format!("bit {bit} out of range 0..=7"));
                }
                Ok(Self {
                    db,
                    width,
                    offset,
                    bit: Some(bit),
                })
            }
            _ => {
                if tail.contains('.') {
                    return Err("bit suffix only valid on X addresses".to_string());
                }
                let offset: u32 = tail
                    .parse()
                    .map_err(|_| format!("invalid offset '{tail}'"))?;
                Ok(Self {
                    db,
                    width,
                    offset,
                    bit: None,
                })
            }
        }
    }
}

impl std::fmt::Display for SignalAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DB{}.DB{}{}", self.db, self.width.letter(), self.offset)?;
        if let Some(bit) = self.bit {
            write!(f, ".{bit}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Signal map
// ---------------------------------------------------------------------------

/// Required on every device regardless of capabilities. `ErrorAlarm` is
/// accepted in the map but optional: the alarm predicate keys off
/// `ErrorCode` alone.
const CORE_SIGNALS: &[SignalName] = &[
    SignalName::DeviceReady,
    SignalName::SoftwareConnected,
    SignalName::CommandFailed,
    SignalName::ErrorCode,
    SignalName::StartProcess,
    SignalName::CurrentFloor,
    SignalName::CurrentRail,
    SignalName::CurrentBlock,
    SignalName::CurrentDepth,
];

/// Parsed signal table for one device.
#[derive(Debug, Clone)]
pub struct SignalMap {
    addresses: HashMap<SignalName, SignalAddress>,
}

impl SignalMap {
    /// Parse a raw name → address table from configuration.
    ///
    /// Unknown names and malformed addresses are fatal.
    pub fn from_raw(
        device_id: &str,
        raw: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut addresses = HashMap::with_capacity(raw.len());
        for (name, addr) in raw {
            let signal = SignalName::parse(name)
                .ok_or_else(|| ConfigError::UnknownSignal(name.clone()))?;
            let parsed =
                SignalAddress::from_str(addr).map_err(|detail| ConfigError::InvalidAddress {
                    signal: name.clone(),
                    address: addr.clone(),
                    detail,
                })?;
            addresses.insert(signal, parsed);
        }
        let map = Self { addresses };
        map.require(device_id, CORE_SIGNALS)?;
        Ok(map)
    }

    /// Check that every signal a device's capabilities imply is mapped.
    pub fn validate_for(
        &self,
        device_id: &str,
        caps: &DeviceCapabilities,
    ) -> Result<(), ConfigError> {
        if caps.supports_inbound {
            self.require(
                device_id,
                &[
                    SignalName::InboundTrigger,
                    SignalName::InboundCompleted,
                    SignalName::BarcodeValid,
                    SignalName::BarcodeInvalid,
                    SignalName::TargetFloor,
                    SignalName::TargetRail,
                    SignalName::TargetBlock,
                    SignalName::TargetDepth,
                    SignalName::GateNumber,
                    SignalName::EnterDirection,
                    SignalName::ExitDirection,
                ],
            )?;
            for n in 1..=SignalName::BARCODE_CHARS {
                self.require(device_id, &[SignalName::BarcodeChar(n)])?;
            }
        }
        if caps.supports_outbound {
            self.require(
                device_id,
                &[
                    SignalName::OutboundTrigger,
                    SignalName::OutboundCompleted,
                    SignalName::SourceFloor,
                    SignalName::SourceRail,
                    SignalName::SourceBlock,
                    SignalName::SourceDepth,
                    SignalName::GateNumber,
                    SignalName::EnterDirection,
                    SignalName::ExitDirection,
                ],
            )?;
        }
        if caps.supports_transfer {
            self.require(
                device_id,
                &[
                    SignalName::TransferTrigger,
                    SignalName::TransferCompleted,
                    SignalName::SourceFloor,
                    SignalName::TargetFloor,
                ],
            )?;
        }
        if caps.supports_pallet_check {
            self.require(
                device_id,
                &[
                    SignalName::PalletCheckTrigger,
                    SignalName::PalletCheckCompleted,
                    SignalName::AvailablePallet,
                    SignalName::UnavailablePallet,
                    SignalName::SourceFloor,
                ],
            )?;
        }
        Ok(())
    }

    fn require(&self, device_id: &str, signals: &[SignalName]) -> Result<(), ConfigError> {
        for signal in signals {
            if !self.addresses.contains_key(signal) {
                return Err(ConfigError::MissingSignal {
                    device: device_id.to_string(),
                    signal: signal.name(),
                });
            }
        }
        Ok(())
    }

    /// Address of a signal. The map is validated at load time, so a miss
    /// here means a capability the config never declared.
    pub fn addr(&self, signal: SignalName) -> Result<SignalAddress, TransportErrorAddr> {
        self.addresses
            .get(&signal)
            .copied()
            .ok_or_else(|| TransportErrorAddr(signal.name()))
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Lookup miss for an unmapped signal; converts into a transport
/// `InvalidAddress` at the call site.
#[derive(Debug)]
pub struct TransportErrorAddr(pub String);

impl From<TransportErrorAddr> for crate::error::TransportError {
    fn from(e: TransportErrorAddr) -> Self {
        crate::error::TransportError::InvalidAddress(format!("signal '{}' is not mapped", e.0))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
