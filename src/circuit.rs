// Circuit Handles — identifiers and collaborator seams
//
// The padding subsystem never owns circuits. It refers to them by
// handle, keeps a liveness set maintained by the circuit lifecycle
// callbacks, and reaches the wire through the CellTransport trait
// implemented by the embedding node.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier for a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CircuitId(u64);

impl CircuitId {
    /// Generate a new random circuit ID
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 8];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut bytes);
        CircuitId(u64::from_le_bytes(bytes))
    }

    /// Wrap a raw identifier assigned by the circuit layer
    pub fn from_raw(raw: u64) -> Self {
        CircuitId(raw)
    }

    /// Raw identifier value
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CircuitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "circ#{:016x}", self.0)
    }
}

/// Errors surfaced by the cell transport collaborator
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Hop {0} not established on circuit")]
    HopUnavailable(u8),
    #[error("Control channel unavailable")]
    ChannelClosed,
    #[error("Transport failure: {0}")]
    Failed(String),
}

/// Cell transport and crypto collaborator
///
/// Implemented by the node's circuit layer. `send_control_cell` rides the
/// circuit's reliable in-order control channel; `encrypt_and_queue` onion
/// encrypts a cell body to the given hop and places it on the normal
/// transmit queue. Both are expected to be cheap and non-blocking.
pub trait CellTransport: Send + Sync {
    /// Send a negotiation frame on the circuit's control channel
    fn send_control_cell(&self, circuit: CircuitId, bytes: &[u8]) -> Result<(), TransportError>;

    /// Encrypt a cell body to `hop_index` and enqueue it for transmit
    fn encrypt_and_queue(
        &self,
        circuit: CircuitId,
        hop_index: u8,
        bytes: &[u8],
    ) -> Result<(), TransportError>;

    /// Whether the given hop has completed its handshake
    fn hop_established(&self, circuit: CircuitId, hop_index: u8) -> bool;
}
