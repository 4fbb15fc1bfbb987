// Padding Cells — fixed-size no-op relay cells for cover traffic
//
// Dummy cells carry the no-op Drop command and a fully random body so
// that, once decrypted at the target hop, they are indistinguishable
// from random bytes and cannot be told apart from real traffic on the
// wire.

use rand::RngCore;
use thiserror::Error;

/// Fixed relay cell size in bytes
pub const CELL_LEN: usize = 512;

/// Cell header: command (1 byte) + payload length (2 bytes, LE)
pub const CELL_HEADER_LEN: usize = 3;

/// Maximum payload bytes in a single cell
pub const CELL_BODY_LEN: usize = CELL_LEN - CELL_HEADER_LEN;

#[derive(Debug, Error)]
pub enum CellError {
    #[error("Cell buffer has wrong size: need {CELL_LEN}, got {0}")]
    WrongSize(usize),
    #[error("Unknown relay command: {0:#04x}")]
    UnknownCommand(u8),
    #[error("Payload length {0} exceeds cell body ({CELL_BODY_LEN})")]
    PayloadTooLarge(usize),
}

/// Relay command carried in a cell header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelayCommand {
    /// Application data (0x01)
    Data = 0x01,
    /// No-op dummy cell, discarded at the target hop (0x02)
    Drop = 0x02,
    /// Subsystem control payload (0x03)
    Control = 0x03,
}

impl RelayCommand {
    /// Convert from u8 to RelayCommand
    pub fn from_u8(value: u8) -> Result<Self, CellError> {
        match value {
            0x01 => Ok(RelayCommand::Data),
            0x02 => Ok(RelayCommand::Drop),
            0x03 => Ok(RelayCommand::Control),
            other => Err(CellError::UnknownCommand(other)),
        }
    }

    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// A relay cell in its decrypted (innermost) form
///
/// Format (fixed 512 bytes):
/// [1 byte]  relay command
/// [2 bytes] payload length (LE u16), bytes beyond it are padding
/// [509 bytes] payload + padding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Command byte
    pub command: RelayCommand,
    /// Meaningful payload (length ≤ CELL_BODY_LEN)
    pub payload: Vec<u8>,
}

impl RelayCell {
    /// Build a data cell; unused body bytes are randomized
    pub fn data(payload: Vec<u8>) -> Result<Self, CellError> {
        if payload.len() > CELL_BODY_LEN {
            return Err(CellError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            command: RelayCommand::Data,
            payload,
        })
    }

    /// Build a dummy cell: Drop command, zero-length payload
    ///
    /// The entire body is filled with random bytes at serialization time,
    /// so the decrypted cell carries no structure beyond the header.
    pub fn dummy() -> Self {
        Self {
            command: RelayCommand::Drop,
            payload: Vec::new(),
        }
    }

    /// Whether this cell is a padding no-op
    pub fn is_noop(&self) -> bool {
        self.command == RelayCommand::Drop && self.payload.is_empty()
    }

    /// Serialized dummy cell: Drop header plus a fully random body
    ///
    /// Infallible variant of `dummy().to_bytes()` for injection paths.
    pub fn dummy_bytes() -> Vec<u8> {
        let mut buf = vec![0u8; CELL_LEN];
        buf[0] = RelayCommand::Drop.as_u8();
        rand::thread_rng().fill_bytes(&mut buf[CELL_HEADER_LEN..]);
        buf
    }

    /// Serialize to a fixed 512-byte buffer
    ///
    /// Body bytes past the payload are filled from the thread RNG rather
    /// than zeroed. Zero padding would give dummy cells a recognizable
    /// all-zero body after decryption.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CellError> {
        if self.payload.len() > CELL_BODY_LEN {
            return Err(CellError::PayloadTooLarge(self.payload.len()));
        }

        let mut buf = vec![0u8; CELL_LEN];
        buf[0] = self.command.as_u8();
        buf[1..3].copy_from_slice(&(self.payload.len() as u16).to_le_bytes());
        buf[CELL_HEADER_LEN..CELL_HEADER_LEN + self.payload.len()].copy_from_slice(&self.payload);

        let pad_start = CELL_HEADER_LEN + self.payload.len();
        rand::thread_rng().fill_bytes(&mut buf[pad_start..]);

        Ok(buf)
    }

    /// Deserialize from a fixed 512-byte buffer
    pub fn from_bytes(data: &[u8]) -> Result<Self, CellError> {
        if data.len() != CELL_LEN {
            return Err(CellError::WrongSize(data.len()));
        }

        let command = RelayCommand::from_u8(data[0])?;
        let payload_len = u16::from_le_bytes([data[1], data[2]]) as usize;
        if payload_len > CELL_BODY_LEN {
            return Err(CellError::PayloadTooLarge(payload_len));
        }

        Ok(Self {
            command,
            payload: data[CELL_HEADER_LEN..CELL_HEADER_LEN + payload_len].to_vec(),
        })
    }
}
