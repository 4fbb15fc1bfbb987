// Algorithm Configuration Source — static descriptors for padding units
//
// The embedding node loads a fixed list of algorithm descriptors at
// startup (how it obtains them is out of scope) and hands them to the
// registry. Negotiated installs resolve uuids against this registry; a
// uuid absent here is a non-fatal ConfigNotFound.

use crate::runtime::UnitCategory;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Duplicate algorithm uuid: {0}")]
    DuplicateUuid(u8),
    #[error("Invalid descriptor for uuid {0}: {1}")]
    InvalidDescriptor(u8, String),
}

/// Static description of one installable padding algorithm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmDescriptor {
    /// Algorithm identifier carried on the wire (one byte)
    pub uuid: u8,
    /// Whether this algorithm schedules units or emits padding
    pub category: UnitCategory,
    /// Bitmask of hop positions at which this algorithm may run
    pub initial_hop_mask: u8,
    /// Hop index dummy cells are encrypted to
    pub target_hop: u8,
    /// Ticker interval for the unit's algorithm invocations
    pub tick_interval_ms: u64,
    /// Opaque program for the algorithm executor
    pub bytecode: Vec<u8>,
}

impl AlgorithmDescriptor {
    /// Validate descriptor fields
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidDescriptor(
                self.uuid,
                "tick_interval_ms must be > 0".to_string(),
            ));
        }
        if self.bytecode.is_empty() {
            return Err(ConfigError::InvalidDescriptor(
                self.uuid,
                "bytecode must not be empty".to_string(),
            ));
        }
        if self.initial_hop_mask & (1 << self.target_hop) == 0 {
            return Err(ConfigError::InvalidDescriptor(
                self.uuid,
                format!("target_hop {} not covered by hop mask", self.target_hop),
            ));
        }
        Ok(())
    }
}

/// Registry of configured algorithms, keyed by uuid
#[derive(Debug, Clone, Default)]
pub struct ConfigRegistry {
    descriptors: Vec<AlgorithmDescriptor>,
}

impl ConfigRegistry {
    /// Build a registry from a descriptor list, rejecting duplicates
    pub fn new(descriptors: Vec<AlgorithmDescriptor>) -> Result<Self, ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for desc in &descriptors {
            desc.validate()?;
            if !seen.insert(desc.uuid) {
                return Err(ConfigError::DuplicateUuid(desc.uuid));
            }
        }
        Ok(Self { descriptors })
    }

    /// Look up a descriptor by uuid
    pub fn lookup(&self, uuid: u8) -> Option<&AlgorithmDescriptor> {
        self.descriptors.iter().find(|d| d.uuid == uuid)
    }

    /// Number of configured algorithms
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
