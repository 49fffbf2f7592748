//! Message buffer for accumulating partial reads.
//!
//! The transport delivers bytes with no message boundaries: a read may end
//! in the middle of a header, or carry several messages back to back.
//! Boundaries are recovered from each opcode's fixed size plus its length
//! field, never by scanning for a delimiter:
//! - `WaitingForLength`: need enough bytes to learn the message length
//! - `WaitingForBody`: length known, need the rest of the message
//!
//! # Example
//!
//! ```
//! use wiredrop::protocol::{Message, MessageBuffer};
//!
//! let bytes = Message::FileEnd { file_id: 1 }.encode();
//! let mut buffer = MessageBuffer::new();
//!
//! assert!(buffer.push(&bytes[..2]).unwrap().is_empty());
//! let messages = buffer.push(&bytes[2..]).unwrap();
//! assert_eq!(messages, vec![Message::FileEnd { file_id: 1 }]);
//! ```

use bytes::BytesMut;

use super::message::{frame_len, Message};
use super::wire_format::FILE_SEGMENT_FIXED_SIZE;
use crate::error::{Result, WireDropError};

/// Default maximum fragment payload accepted from the peer (1 MiB).
pub const DEFAULT_MAX_INBOUND_FRAGMENT: u32 = 1024 * 1024;

/// State machine for message extraction.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Header or length-bearing fixed part still incomplete.
    WaitingForLength,
    /// Total length known, waiting for remaining bytes.
    WaitingForBody { total: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete messages.
pub struct MessageBuffer {
    /// Accumulated bytes from transport reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Largest message the buffer will wait for.
    max_message_size: usize,
}

impl MessageBuffer {
    /// Create a buffer with the default inbound fragment limit.
    pub fn new() -> Self {
        Self::with_max_fragment(DEFAULT_MAX_INBOUND_FRAGMENT)
    }

    /// Create a buffer that refuses fragments larger than `max_fragment`.
    pub fn with_max_fragment(max_fragment: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForLength,
            max_message_size: FILE_SEGMENT_FIXED_SIZE + max_fragment as usize,
        }
    }

    /// Push data into the buffer and extract all complete messages.
    ///
    /// Partial data is kept for the next push. A decode error fails the
    /// whole push; use [`extend`](Self::extend) with
    /// [`next_message`](Self::next_message) to keep the messages decoded
    /// ahead of it.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Message>> {
        self.extend(data);

        let mut messages = Vec::new();
        while let Some(message) = self.next_message()? {
            messages.push(message);
        }
        Ok(messages)
    }

    /// Append data without extracting anything.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Extract the next complete message, if any.
    ///
    /// On a decode error the buffer is cleared, since the stream position
    /// is no longer known. Messages already returned are unaffected.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        let result = self.try_extract_one();
        if result.is_err() {
            self.clear();
        }
        result
    }

    fn try_extract_one(&mut self) -> Result<Option<Message>> {
        let total = match self.state {
            State::WaitingForLength => match frame_len(&self.buffer)? {
                None => return Ok(None),
                Some(total) => {
                    if total > self.max_message_size {
                        return Err(WireDropError::MalformedMessage(format!(
                            "message size {} exceeds maximum {}",
                            total, self.max_message_size
                        )));
                    }
                    self.state = State::WaitingForBody { total };
                    total
                }
            },
            State::WaitingForBody { total } => total,
        };

        if self.buffer.len() < total {
            return Ok(None);
        }

        let bytes = self.buffer.split_to(total).freeze();
        self.state = State::WaitingForLength;
        Message::decode_bytes(bytes).map(Some)
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForLength;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForLength => "WaitingForLength",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}
