//! Error types for wiredrop.

use thiserror::Error;

use crate::protocol::{Opcode, Reason};

/// Main error type for all wiredrop operations.
#[derive(Debug, Error)]
pub enum WireDropError {
    /// I/O error on the underlying byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (configuration loading only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration value out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Bytes could not be decoded as a protocol message.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A file or bulk transfer is already occupying the connection.
    #[error("Transfer already in progress")]
    TransferAlreadyInProgress,

    /// Fragment arrived with no receiving transfer or out of sequence.
    #[error("Unexpected fragment: expected {expected}, received {received}")]
    UnexpectedFragment { expected: u16, received: u8 },

    /// End of file reached before all declared fragments arrived.
    #[error("Incomplete transfer: received {received} of {expected} fragments")]
    IncompleteTransfer { received: u16, expected: u16 },

    /// Acknowledgement with no matching pending operation.
    #[error("Unsolicited {opcode:?} for id {id}")]
    UnsolicitedAck { opcode: Opcode, id: u16 },

    /// Protocol versions of the two endpoints do not overlap.
    #[error("Incompatible protocol version: {0}")]
    Incompatible(String),

    /// Pending operation was cancelled by cleanup.
    #[error("Operation cancelled")]
    Cancelled,

    /// Peer refused a file or bulk start request.
    #[error("Rejected by peer: {0:?}")]
    Rejected(Reason),

    /// Peer reported failure when closing a file or bulk transfer.
    #[error("Transfer failed: {0:?}")]
    TransferFailed(Reason),

    /// Outbound data does not fit the wire field ranges.
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    /// Bulk end or abort requested with no bulk session open.
    #[error("No bulk transfer active")]
    NoBulkActive,

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

/// Result type alias using WireDropError.
pub type Result<T> = std::result::Result<T, WireDropError>;
