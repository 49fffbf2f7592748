//! Wire format primitives.
//!
//! Every message starts with a 4-byte header:
//! ```text
//! ┌──────────┬──────────┐
//! │ Opcode   │ Id       │
//! │ 2 bytes  │ 2 bytes  │
//! │ uint16 BE│ uint16 BE│
//! └──────────┴──────────┘
//! ```
//!
//! `Id` is a file id for file-scoped opcodes and a bulk id for bulk-scoped
//! opcodes. The two id spaces are independent.
//!
//! All multi-byte integers are Big Endian, fields are packed with no padding.

use serde::{Deserialize, Serialize};

use crate::error::{Result, WireDropError};

/// Header size in bytes (fixed, exactly 4).
pub const HEADER_SIZE: usize = 4;

/// Fixed size of `FileStartRequest` before the filename bytes.
pub const FILE_START_FIXED_SIZE: usize = HEADER_SIZE + 12;

/// Fixed size of `FileSegment` before the payload bytes.
pub const FILE_SEGMENT_FIXED_SIZE: usize = HEADER_SIZE + 5;

/// Size of `FileEnd` (header only).
pub const FILE_END_SIZE: usize = HEADER_SIZE;

/// Size of every `{bool, reason}` acknowledgement and of `BulkEndRequest`.
pub const ACK_SIZE: usize = HEADER_SIZE + 2;

/// Size of `BulkStartRequest`.
pub const BULK_START_SIZE: usize = HEADER_SIZE + 4;

/// Protocol message opcodes.
///
/// Values follow declaration order and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Client announces a file.
    FileStart = 0,
    /// Client sends one fragment of file data.
    FileSegment = 1,
    /// Client signals all fragments were sent.
    FileEnd = 2,
    /// Server accepts or rejects a file.
    FileStartAck = 3,
    /// Server reports the verdict for a file.
    FileEndAck = 4,
    /// Client announces a batch of files.
    BulkStart = 5,
    /// Client closes a batch (normally or aborted).
    BulkEnd = 6,
    /// Server accepts or rejects a batch.
    BulkStartAck = 7,
    /// Server reports the verdict for a batch.
    BulkEndAck = 8,
}

impl TryFrom<u16> for Opcode {
    type Error = WireDropError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0 => Ok(Opcode::FileStart),
            1 => Ok(Opcode::FileSegment),
            2 => Ok(Opcode::FileEnd),
            3 => Ok(Opcode::FileStartAck),
            4 => Ok(Opcode::FileEndAck),
            5 => Ok(Opcode::BulkStart),
            6 => Ok(Opcode::BulkEnd),
            7 => Ok(Opcode::BulkStartAck),
            8 => Ok(Opcode::BulkEndAck),
            other => Err(WireDropError::MalformedMessage(format!(
                "unknown opcode 0x{:04x}",
                other
            ))),
        }
    }
}

impl From<Opcode> for u16 {
    fn from(op: Opcode) -> u16 {
        op as u16
    }
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message opcode.
    pub opcode: Opcode,
    /// File id or bulk id, depending on the opcode.
    pub id: u16,
}

impl Header {
    /// Create a new header.
    pub fn new(opcode: Opcode, id: u16) -> Self {
        Self { opcode, id }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use wiredrop::protocol::{Header, Opcode};
    ///
    /// let bytes = Header::new(Opcode::FileEnd, 7).encode();
    /// assert_eq!(bytes, [0, 2, 0, 7]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&u16::from(self.opcode).to_be_bytes());
        buf[2..4].copy_from_slice(&self.id.to_be_bytes());
        buf
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Fails with `MalformedMessage` if the buffer is too short or the
    /// opcode is unknown.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(WireDropError::MalformedMessage(format!(
                "header needs {} bytes, have {}",
                HEADER_SIZE,
                buf.len()
            )));
        }
        let opcode = Opcode::try_from(u16::from_be_bytes([buf[0], buf[1]]))?;
        let id = u16::from_be_bytes([buf[2], buf[3]]);
        Ok(Self { opcode, id })
    }
}

/// Reason code carried by acknowledgements and bulk end requests.
///
/// Unknown codes from a newer peer are kept as `Unknown` and treated as a
/// generic failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    Accepted,
    ResourceUnavailable,
    TransferAlreadyInProgress,
    Incompatible,
    IncompleteTransfer,
    Aborted,
    NoTransferActive,
    UnexpectedFragment,
    Unknown(u8),
}

impl From<u8> for Reason {
    fn from(value: u8) -> Self {
        match value {
            0 => Reason::Accepted,
            1 => Reason::ResourceUnavailable,
            2 => Reason::TransferAlreadyInProgress,
            3 => Reason::Incompatible,
            4 => Reason::IncompleteTransfer,
            5 => Reason::Aborted,
            6 => Reason::NoTransferActive,
            7 => Reason::UnexpectedFragment,
            other => Reason::Unknown(other),
        }
    }
}

impl From<Reason> for u8 {
    fn from(reason: Reason) -> u8 {
        match reason {
            Reason::Accepted => 0,
            Reason::ResourceUnavailable => 1,
            Reason::TransferAlreadyInProgress => 2,
            Reason::Incompatible => 3,
            Reason::IncompleteTransfer => 4,
            Reason::Aborted => 5,
            Reason::NoTransferActive => 6,
            Reason::UnexpectedFragment => 7,
            Reason::Unknown(code) => code,
        }
    }
}

/// Kind of application on the sending side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    MacApp,
    IosApp,
    IosExtension,
    #[serde(skip)]
    Unknown(u16),
}

impl From<u16> for ClientType {
    fn from(value: u16) -> Self {
        match value {
            0 => ClientType::MacApp,
            1 => ClientType::IosApp,
            2 => ClientType::IosExtension,
            other => ClientType::Unknown(other),
        }
    }
}

impl From<ClientType> for u16 {
    fn from(client: ClientType) -> u16 {
        match client {
            ClientType::MacApp => 0,
            ClientType::IosApp => 1,
            ClientType::IosExtension => 2,
            ClientType::Unknown(raw) => raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_big_endian_byte_order() {
        let bytes = Header::new(Opcode::BulkEndAck, 0x0102).encode();
        assert_eq!(bytes, [0x00, 0x08, 0x01, 0x02]);
    }

    #[test]
    fn test_header_roundtrip() {
        let header = Header::new(Opcode::FileSegment, 0xBEEF);
        assert_eq!(Header::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let err = Header::decode(&[0, 1, 0]).unwrap_err();
        assert!(matches!(err, WireDropError::MalformedMessage(_)));
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let err = Header::decode(&[0x00, 0x09, 0, 1]).unwrap_err();
        assert!(err.to_string().contains("unknown opcode 0x0009"));
    }

    #[test]
    fn test_opcode_numbering_is_stable() {
        let all = [
            Opcode::FileStart,
            Opcode::FileSegment,
            Opcode::FileEnd,
            Opcode::FileStartAck,
            Opcode::FileEndAck,
            Opcode::BulkStart,
            Opcode::BulkEnd,
            Opcode::BulkStartAck,
            Opcode::BulkEndAck,
        ];
        for (i, op) in all.iter().enumerate() {
            assert_eq!(u16::from(*op), i as u16);
            assert_eq!(Opcode::try_from(i as u16).unwrap(), *op);
        }
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(u8::from(Reason::Accepted), 0);
        assert_eq!(Reason::from(4), Reason::IncompleteTransfer);
        assert_eq!(Reason::from(200), Reason::Unknown(200));
        assert_eq!(u8::from(Reason::Unknown(200)), 200);
    }

    #[test]
    fn test_client_type_codes() {
        assert_eq!(ClientType::from(0), ClientType::MacApp);
        assert_eq!(ClientType::from(2), ClientType::IosExtension);
        assert_eq!(u16::from(ClientType::IosApp), 1);
        assert_eq!(ClientType::from(77), ClientType::Unknown(77));
    }
}
