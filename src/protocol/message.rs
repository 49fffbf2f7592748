//! Protocol messages with explicit encode/decode.
//!
//! Layouts (after the 4-byte [`Header`]):
//! ```text
//! FileStart     clientType u16 │ fragmentCount u16 │ totalSize u32 │ fileNo u16 │ nameLen u16 │ name[nameLen]
//! FileSegment   fragmentIndex u8 │ fragmentSize u32 │ data[fragmentSize]
//! FileEnd       (header only)
//! BulkStart     clientType u16 │ fileCount u16
//! BulkEnd       aborted u8 │ reason u8
//! *Ack          ok u8 │ reason u8
//! ```
//!
//! Length fields are peer-controlled. Decoding checks every one of them
//! against the bytes actually present and never reads past the buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::wire_format::{
    ClientType, Header, Opcode, Reason, ACK_SIZE, BULK_START_SIZE, FILE_END_SIZE,
    FILE_SEGMENT_FIXED_SIZE, FILE_START_FIXED_SIZE, HEADER_SIZE,
};
use crate::error::{Result, WireDropError};

/// Declares an incoming file before any data arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStartRequest {
    pub file_id: u16,
    pub client_type: ClientType,
    pub fragment_count: u16,
    pub total_size: u32,
    pub file_no: u16,
    /// Raw filename bytes, not null-terminated.
    pub filename: Bytes,
}

/// One chunk of file data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSegment {
    pub file_id: u16,
    /// Low 8 bits of the fragment sequence number.
    pub fragment_index: u8,
    pub payload: Bytes,
}

/// Announces a batch of `file_count` files sharing `bulk_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkStartRequest {
    pub bulk_id: u16,
    pub client_type: ClientType,
    pub file_count: u16,
}

/// Closes a batch, normally or aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkEndRequest {
    pub bulk_id: u16,
    pub aborted: bool,
    pub reason: Reason,
}

/// Accept/success verdict shared by all four acknowledgement opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// File id or bulk id.
    pub id: u16,
    pub ok: bool,
    pub reason: Reason,
}

impl Ack {
    /// Positive acknowledgement.
    pub fn accept(id: u16) -> Self {
        Self {
            id,
            ok: true,
            reason: Reason::Accepted,
        }
    }

    /// Negative acknowledgement with a reason.
    pub fn reject(id: u16, reason: Reason) -> Self {
        Self {
            id,
            ok: false,
            reason,
        }
    }
}

/// A complete protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    FileStart(FileStartRequest),
    FileSegment(FileSegment),
    FileEnd { file_id: u16 },
    FileStartAck(Ack),
    FileEndAck(Ack),
    BulkStart(BulkStartRequest),
    BulkEnd(BulkEndRequest),
    BulkStartAck(Ack),
    BulkEndAck(Ack),
}

impl Message {
    /// Opcode of this message.
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::FileStart(_) => Opcode::FileStart,
            Message::FileSegment(_) => Opcode::FileSegment,
            Message::FileEnd { .. } => Opcode::FileEnd,
            Message::FileStartAck(_) => Opcode::FileStartAck,
            Message::FileEndAck(_) => Opcode::FileEndAck,
            Message::BulkStart(_) => Opcode::BulkStart,
            Message::BulkEnd(_) => Opcode::BulkEnd,
            Message::BulkStartAck(_) => Opcode::BulkStartAck,
            Message::BulkEndAck(_) => Opcode::BulkEndAck,
        }
    }

    /// File id or bulk id carried in the header.
    pub fn id(&self) -> u16 {
        match self {
            Message::FileStart(m) => m.file_id,
            Message::FileSegment(m) => m.file_id,
            Message::FileEnd { file_id } => *file_id,
            Message::BulkStart(m) => m.bulk_id,
            Message::BulkEnd(m) => m.bulk_id,
            Message::FileStartAck(a)
            | Message::FileEndAck(a)
            | Message::BulkStartAck(a)
            | Message::BulkEndAck(a) => a.id,
        }
    }

    /// Header of this message.
    pub fn header(&self) -> Header {
        Header::new(self.opcode(), self.id())
    }

    /// Total encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Message::FileStart(m) => FILE_START_FIXED_SIZE + m.filename.len(),
            Message::FileSegment(m) => FILE_SEGMENT_FIXED_SIZE + m.payload.len(),
            Message::FileEnd { .. } => FILE_END_SIZE,
            Message::BulkStart(_) => BULK_START_SIZE,
            Message::BulkEnd(_)
            | Message::FileStartAck(_)
            | Message::FileEndAck(_)
            | Message::BulkStartAck(_)
            | Message::BulkEndAck(_) => ACK_SIZE,
        }
    }

    /// Encode into a single contiguous buffer.
    ///
    /// # Example
    ///
    /// ```
    /// use wiredrop::protocol::{Ack, Message};
    ///
    /// let bytes = Message::FileEndAck(Ack::accept(3)).encode();
    /// assert_eq!(&bytes[..], &[0, 4, 0, 3, 1, 0]);
    /// ```
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_head(&mut buf);
        if let Some(payload) = self.trailing_payload() {
            buf.extend_from_slice(payload);
        }
        buf.freeze()
    }

    /// Encode everything except a fragment's data bytes.
    ///
    /// Together with [`Message::trailing_payload`] this allows the writer to
    /// send fragment data without copying it.
    ///
    /// Callers must ensure variable-length fields fit their length
    /// prefixes (filename <= u16::MAX, payload <= u32::MAX).
    pub fn encode_head(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.header().encode());
        match self {
            Message::FileStart(m) => {
                buf.put_u16(m.client_type.into());
                buf.put_u16(m.fragment_count);
                buf.put_u32(m.total_size);
                buf.put_u16(m.file_no);
                buf.put_u16(m.filename.len() as u16);
                buf.put_slice(&m.filename);
            }
            Message::FileSegment(m) => {
                buf.put_u8(m.fragment_index);
                buf.put_u32(m.payload.len() as u32);
            }
            Message::FileEnd { .. } => {}
            Message::BulkStart(m) => {
                buf.put_u16(m.client_type.into());
                buf.put_u16(m.file_count);
            }
            Message::BulkEnd(m) => {
                buf.put_u8(m.aborted as u8);
                buf.put_u8(m.reason.into());
            }
            Message::FileStartAck(a)
            | Message::FileEndAck(a)
            | Message::BulkStartAck(a)
            | Message::BulkEndAck(a) => {
                buf.put_u8(a.ok as u8);
                buf.put_u8(a.reason.into());
            }
        }
    }

    /// Fragment data that follows the encoded head, if any.
    pub fn trailing_payload(&self) -> Option<&Bytes> {
        match self {
            Message::FileSegment(m) if !m.payload.is_empty() => Some(&m.payload),
            _ => None,
        }
    }

    /// Decode exactly one message from `buf` (copies the input).
    ///
    /// Fails with `MalformedMessage` on truncation, unknown opcode, or
    /// trailing bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        Self::decode_bytes(Bytes::copy_from_slice(buf))
    }

    /// Decode exactly one message from `buf`.
    ///
    /// Variable-length fields are returned as zero-copy slices of `buf`.
    pub fn decode_bytes(buf: Bytes) -> Result<Self> {
        let total = buf.len();
        let header = Header::decode(&buf)?;
        let mut cur = buf;
        cur.advance(HEADER_SIZE);

        let message = match header.opcode {
            Opcode::FileStart => {
                need(&cur, FILE_START_FIXED_SIZE - HEADER_SIZE, header.opcode)?;
                let client_type = ClientType::from(cur.get_u16());
                let fragment_count = cur.get_u16();
                let total_size = cur.get_u32();
                let file_no = cur.get_u16();
                let name_len = cur.get_u16() as usize;
                need(&cur, name_len, header.opcode)?;
                let filename = cur.split_to(name_len);
                Message::FileStart(FileStartRequest {
                    file_id: header.id,
                    client_type,
                    fragment_count,
                    total_size,
                    file_no,
                    filename,
                })
            }
            Opcode::FileSegment => {
                need(&cur, FILE_SEGMENT_FIXED_SIZE - HEADER_SIZE, header.opcode)?;
                let fragment_index = cur.get_u8();
                let size = cur.get_u32() as usize;
                need(&cur, size, header.opcode)?;
                let payload = cur.split_to(size);
                Message::FileSegment(FileSegment {
                    file_id: header.id,
                    fragment_index,
                    payload,
                })
            }
            Opcode::FileEnd => Message::FileEnd { file_id: header.id },
            Opcode::BulkStart => {
                need(&cur, BULK_START_SIZE - HEADER_SIZE, header.opcode)?;
                Message::BulkStart(BulkStartRequest {
                    bulk_id: header.id,
                    client_type: ClientType::from(cur.get_u16()),
                    file_count: cur.get_u16(),
                })
            }
            Opcode::BulkEnd => {
                need(&cur, ACK_SIZE - HEADER_SIZE, header.opcode)?;
                Message::BulkEnd(BulkEndRequest {
                    bulk_id: header.id,
                    aborted: cur.get_u8() != 0,
                    reason: Reason::from(cur.get_u8()),
                })
            }
            Opcode::FileStartAck | Opcode::FileEndAck | Opcode::BulkStartAck | Opcode::BulkEndAck => {
                need(&cur, ACK_SIZE - HEADER_SIZE, header.opcode)?;
                let ack = Ack {
                    id: header.id,
                    ok: cur.get_u8() != 0,
                    reason: Reason::from(cur.get_u8()),
                };
                match header.opcode {
                    Opcode::FileStartAck => Message::FileStartAck(ack),
                    Opcode::FileEndAck => Message::FileEndAck(ack),
                    Opcode::BulkStartAck => Message::BulkStartAck(ack),
                    _ => Message::BulkEndAck(ack),
                }
            }
        };

        if cur.has_remaining() {
            return Err(WireDropError::MalformedMessage(format!(
                "{:?}: {} trailing bytes after {} byte message",
                header.opcode,
                cur.remaining(),
                total - cur.remaining()
            )));
        }
        Ok(message)
    }
}

/// Total length of the message at the start of `buf`, once knowable.
///
/// Returns `Ok(None)` while the header or the fixed portion carrying a
/// length field is still incomplete. Fails on an unknown opcode.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let header = Header::decode(buf)?;
    let len = match header.opcode {
        Opcode::FileStart => {
            if buf.len() < FILE_START_FIXED_SIZE {
                return Ok(None);
            }
            let off = FILE_START_FIXED_SIZE - 2;
            FILE_START_FIXED_SIZE + u16::from_be_bytes([buf[off], buf[off + 1]]) as usize
        }
        Opcode::FileSegment => {
            if buf.len() < FILE_SEGMENT_FIXED_SIZE {
                return Ok(None);
            }
            let off = HEADER_SIZE + 1;
            let size = u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
            FILE_SEGMENT_FIXED_SIZE.saturating_add(size as usize)
        }
        Opcode::FileEnd => FILE_END_SIZE,
        Opcode::BulkStart => BULK_START_SIZE,
        _ => ACK_SIZE,
    };
    Ok(Some(len))
}

fn need(cur: &Bytes, n: usize, opcode: Opcode) -> Result<()> {
    if cur.remaining() < n {
        return Err(WireDropError::MalformedMessage(format!(
            "{:?}: need {} more bytes, have {}",
            opcode,
            n,
            cur.remaining()
        )));
    }
    Ok(())
}
