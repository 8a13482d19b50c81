//! Warehouse layout — block dimensions and disabled-location patterns.
//!
//! A location is valid iff it falls inside a configured block and does
//! not match any disabled pattern (null fields wildcard). Applied by the
//! gateway at `send_command` as a synchronous rejection.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::Location;

/// Dimensions of one storage block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutBlock {
    pub block_number: u16,
    pub max_floor: u16,
    pub max_rail: u16,
    pub max_depth: u16,
}

/// Pattern excluding locations; `None` fields match anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisabledLocation {
    pub floor: Option<u16>,
    pub rail: Option<u16>,
    pub block: Option<u16>,
    pub depth: Option<u16>,
}

impl DisabledLocation {
    fn matches(&self, loc: &Location) -> bool {
        self.floor.map_or(true, |f| f == loc.floor)
            && self.rail.map_or(true, |r| r == loc.rail)
            && self.block.map_or(true, |b| b == loc.block)
            && self.depth.map_or(true, |d| d == loc.depth)
    }
}

/// Secondary JSON layout document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarehouseLayout {
    pub blocks: Vec<LayoutBlock>,
    #[serde(default)]
    pub disabled_locations: Vec<DisabledLocation>,
}

impl WarehouseLayout {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let layout: Self = serde_json::from_str(json)?;
        Ok(layout)
    }

    /// Validate a location against the block table and disabled patterns.
    ///
    /// Coordinates are 1-based; `0` never addresses a real position.
    pub fn is_valid(&self, loc: &Location) -> bool {
        let in_block = self.blocks.iter().any(|b| {
            b.block_number == loc.block
                && (1..=b.max_floor).contains(&loc.floor)
                && (1..=b.max_rail).contains(&loc.rail)
                && (1..=b.max_depth).contains(&loc.depth)
        });
        in_block && !self.disabled_locations.iter().any(|d| d.matches(loc))
    }
}
