//! Protocol module - wire format, messages, and stream re-synchronisation.
//!
//! This module implements the binary file-transfer protocol:
//! - 4-byte header encoding/decoding and the opcode space
//! - Typed messages with bounds-checked encode/decode
//! - Message buffer for accumulating partial reads

mod message;
mod message_buffer;
mod wire_format;

pub use message::{
    frame_len, Ack, BulkEndRequest, BulkStartRequest, FileSegment, FileStartRequest, Message,
};
pub use message_buffer::{MessageBuffer, DEFAULT_MAX_INBOUND_FRAGMENT};
pub use wire_format::{
    ClientType, Header, Opcode, Reason, ACK_SIZE, BULK_START_SIZE, FILE_END_SIZE,
    FILE_SEGMENT_FIXED_SIZE, FILE_START_FIXED_SIZE, HEADER_SIZE,
};
