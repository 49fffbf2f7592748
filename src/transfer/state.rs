//! Single-slot transfer record for one connection.
//!
//! At most one file transfer is active on a connection at any instant. A
//! bulk session does not track its member files concurrently; it serialises
//! them through the same file slot.
//!
//! File lifecycle:
//! ```text
//! sender:   Idle ─► AwaitingStartAck ─► Transferring ─► AwaitingEndAck ─► Idle
//! receiver: Idle ─► Transferring ─► Idle        (FileEnd completes in one step)
//! ```

use bytes::{Bytes, BytesMut};

use crate::error::{Result, WireDropError};

/// Which way file data flows for the active transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Receiving,
    Sending,
}

/// Phase of the file slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePhase {
    Idle,
    AwaitingStartAck,
    Transferring,
    AwaitingEndAck,
}

/// Phase of the bulk session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkPhase {
    Idle,
    AwaitingStartAck,
    Active,
    AwaitingEndAck,
}

/// Per-file and per-batch completion ratios in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub file: f64,
    pub batch: f64,
}

impl Progress {
    /// `fragments_done` of `total_fragments` for file `file_no` of `total_files`.
    pub fn compute(fragments_done: u16, total_fragments: u16, file_no: u16, total_files: u16) -> Self {
        let file = if total_fragments == 0 {
            1.0
        } else {
            f64::from(fragments_done) / f64::from(total_fragments)
        };
        let total_files = f64::from(total_files.max(1));
        let batch = (f64::from(file_no) / total_files + file / total_files).min(1.0);
        Self { file, batch }
    }
}

/// Number of fragments needed for `len` bytes.
///
/// ```
/// use wiredrop::transfer::fragment_count;
///
/// assert_eq!(fragment_count(10, 4), 3);
/// assert_eq!(fragment_count(0, 4), 0);
/// ```
pub fn fragment_count(len: usize, fragment_size: usize) -> usize {
    len.div_ceil(fragment_size.max(1))
}

/// The transfer happening right now on this connection.
#[derive(Debug, Clone)]
pub struct TransferState {
    pub direction: Direction,
    pub phase: FilePhase,
    pub bulk_phase: BulkPhase,
    /// Which side opened the bulk session.
    pub bulk_direction: Direction,
    pub is_part_of_bulk: bool,
    pub bulk_id: u16,
    pub total_files_in_bulk: u16,
    pub files_completed_in_bulk: u16,
    pub file_id: u16,
    pub file_no: u16,
    /// Files in the current batch as seen by progress reporting.
    pub total_files: u16,
    pub total_fragments: u16,
    pub next_expected_fragment: u16,
    pub fragment_size: u32,
    pub total_size: u32,
    pub filename: Bytes,
    /// Present only while sending.
    pub outbound_payload: Option<Bytes>,
    /// Present only while receiving.
    pub inbound_fragments: Vec<Bytes>,
    /// Bytes accumulated in `inbound_fragments`.
    pub received_bytes: u64,
}

impl Default for TransferState {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferState {
    /// Empty record, as at connection start.
    pub fn new() -> Self {
        Self {
            direction: Direction::Receiving,
            phase: FilePhase::Idle,
            bulk_phase: BulkPhase::Idle,
            bulk_direction: Direction::Receiving,
            is_part_of_bulk: false,
            bulk_id: 0,
            total_files_in_bulk: 0,
            files_completed_in_bulk: 0,
            file_id: 0,
            file_no: 0,
            total_files: 0,
            total_fragments: 0,
            next_expected_fragment: 0,
            fragment_size: 0,
            total_size: 0,
            filename: Bytes::new(),
            outbound_payload: None,
            inbound_fragments: Vec::new(),
            received_bytes: 0,
        }
    }

    #[inline]
    pub fn file_active(&self) -> bool {
        self.phase != FilePhase::Idle
    }

    #[inline]
    pub fn bulk_active(&self) -> bool {
        self.bulk_phase != BulkPhase::Idle
    }

    /// True while a bulk opened by `direction` is accepting files.
    #[inline]
    pub fn in_bulk(&self, direction: Direction) -> bool {
        self.bulk_phase == BulkPhase::Active && self.bulk_direction == direction
    }

    /// Occupy the file slot for an inbound file.
    pub fn begin_receive(
        &mut self,
        file_id: u16,
        file_no: u16,
        total_fragments: u16,
        total_size: u32,
        filename: Bytes,
    ) -> Result<()> {
        if self.file_active() {
            return Err(WireDropError::TransferAlreadyInProgress);
        }
        self.direction = Direction::Receiving;
        self.phase = FilePhase::Transferring;
        self.is_part_of_bulk = self.in_bulk(Direction::Receiving);
        self.file_id = file_id;
        self.file_no = file_no;
        self.total_files = if self.is_part_of_bulk {
            self.total_files_in_bulk
        } else {
            1
        };
        self.total_fragments = total_fragments;
        self.next_expected_fragment = 0;
        self.fragment_size = 0;
        self.total_size = total_size;
        self.filename = filename;
        self.outbound_payload = None;
        self.inbound_fragments = Vec::with_capacity(usize::from(total_fragments).min(1024));
        self.received_bytes = 0;
        Ok(())
    }

    /// Occupy the file slot for an outbound file awaiting its start ack.
    #[allow(clippy::too_many_arguments)]
    pub fn begin_send(
        &mut self,
        file_id: u16,
        file_no: u16,
        total_files: u16,
        filename: Bytes,
        payload: Bytes,
        fragment_size: u32,
    ) -> Result<()> {
        if self.file_active() {
            return Err(WireDropError::TransferAlreadyInProgress);
        }
        let total_size = u32::try_from(payload.len()).map_err(|_| {
            WireDropError::PayloadTooLarge(format!("{} bytes exceeds u32 size field", payload.len()))
        })?;
        let fragments = fragment_count(payload.len(), fragment_size as usize);
        let total_fragments = u16::try_from(fragments).map_err(|_| {
            WireDropError::PayloadTooLarge(format!(
                "{} fragments of {} bytes exceeds u16 fragment count",
                fragments, fragment_size
            ))
        })?;
        if filename.len() > usize::from(u16::MAX) {
            return Err(WireDropError::PayloadTooLarge(format!(
                "filename of {} bytes exceeds u16 length field",
                filename.len()
            )));
        }

        self.direction = Direction::Sending;
        self.phase = FilePhase::AwaitingStartAck;
        self.is_part_of_bulk = self.in_bulk(Direction::Sending);
        self.file_id = file_id;
        self.file_no = file_no;
        self.total_files = total_files;
        self.total_fragments = total_fragments;
        self.next_expected_fragment = 0;
        self.fragment_size = fragment_size;
        self.total_size = total_size;
        self.filename = filename;
        self.outbound_payload = Some(payload);
        self.inbound_fragments = Vec::new();
        Ok(())
    }

    /// Store the next inbound fragment, returning its sequence number.
    ///
    /// The wire index is the low 8 bits of the sequence number. On mismatch
    /// nothing already accumulated is touched.
    pub fn append_fragment(&mut self, wire_index: u8, payload: Bytes) -> Result<u16> {
        let expected = self.next_expected_fragment;
        if self.direction != Direction::Receiving
            || self.phase != FilePhase::Transferring
            || expected >= self.total_fragments
            || wire_index != expected as u8
        {
            return Err(WireDropError::UnexpectedFragment {
                expected,
                received: wire_index,
            });
        }
        let received = self.received_bytes + payload.len() as u64;
        if received > u64::from(self.total_size) {
            return Err(WireDropError::PayloadTooLarge(format!(
                "fragment {} overruns declared size {}",
                expected, self.total_size
            )));
        }
        if expected == 0 {
            self.fragment_size = payload.len() as u32;
        }
        self.received_bytes = received;
        self.inbound_fragments.push(payload);
        self.next_expected_fragment += 1;
        Ok(expected)
    }

    /// Concatenate inbound fragments into the final payload.
    ///
    /// Fails if fewer fragments or bytes arrived than were declared.
    pub fn reassemble(&mut self) -> Result<Bytes> {
        if self.next_expected_fragment != self.total_fragments
            || self.received_bytes != u64::from(self.total_size)
        {
            return Err(WireDropError::IncompleteTransfer {
                received: self.next_expected_fragment,
                expected: self.total_fragments,
            });
        }
        let fragments = std::mem::take(&mut self.inbound_fragments);
        if fragments.len() == 1 {
            return Ok(fragments.into_iter().next().unwrap_or_default());
        }
        let len = fragments.iter().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(len);
        for fragment in &fragments {
            out.extend_from_slice(fragment);
        }
        Ok(out.freeze())
    }

    /// Zero-copy slice of the outbound payload for fragment `seq`.
    pub fn outbound_fragment(&self, seq: u16) -> Option<Bytes> {
        let payload = self.outbound_payload.as_ref()?;
        if seq >= self.total_fragments {
            return None;
        }
        let size = self.fragment_size as usize;
        let start = usize::from(seq) * size;
        let end = (start + size).min(payload.len());
        Some(payload.slice(start..end))
    }

    /// Progress after `fragments_done` fragments of the current file.
    pub fn progress(&self, fragments_done: u16) -> Progress {
        Progress::compute(
            fragments_done,
            self.total_fragments,
            self.file_no,
            self.total_files,
        )
    }

    /// Empty the file slot. Bulk fields are kept.
    pub fn clear_file(&mut self) {
        self.phase = FilePhase::Idle;
        self.is_part_of_bulk = false;
        self.file_id = 0;
        self.file_no = 0;
        self.total_fragments = 0;
        self.next_expected_fragment = 0;
        self.fragment_size = 0;
        self.total_size = 0;
        self.filename = Bytes::new();
        self.outbound_payload = None;
        self.inbound_fragments = Vec::new();
        self.received_bytes = 0;
        if !self.bulk_active() {
            self.total_files = 0;
        }
    }

    /// Close the bulk session.
    pub fn clear_bulk(&mut self) {
        self.bulk_phase = BulkPhase::Idle;
        self.bulk_direction = Direction::Receiving;
        self.bulk_id = 0;
        self.total_files_in_bulk = 0;
        self.files_completed_in_bulk = 0;
        if !self.file_active() {
            self.total_files = 0;
        }
    }

    /// Reset everything to the empty record.
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}
