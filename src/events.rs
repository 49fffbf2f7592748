//! Lifecycle events raised by the engine.
//!
//! Events are delivered over an unbounded channel in the order the state
//! machine raises them. Dropping the receiver is allowed; events are then
//! discarded.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::Reason;
use crate::transfer::Progress;

/// A fully reassembled inbound file.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFile {
    pub file_id: u16,
    pub file_no: u16,
    /// Raw filename bytes as sent by the peer.
    pub filename: Bytes,
    pub payload: Bytes,
    /// True if the file arrived as part of a bulk session.
    pub in_bulk: bool,
}

impl ReceivedFile {
    /// Filename as UTF-8, if it is valid UTF-8.
    pub fn filename_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.filename).ok()
    }
}

/// Transfer lifecycle notification.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    ReceivedFile(ReceivedFile),
    FragmentReceived {
        file_id: u16,
        index: u16,
        total: u16,
        progress: Progress,
    },
    FragmentSent {
        file_id: u16,
        index: u16,
        total: u16,
        progress: Progress,
    },
    FileTransferAccepted {
        file_id: u16,
        file_no: u16,
        total: u16,
    },
    FileTransferCompleted {
        file_id: u16,
    },
    /// A file was abandoned. For inbound files nothing is delivered.
    FileTransferFailed {
        file_id: u16,
        reason: Reason,
    },
    BulkTransferAccepted {
        accepted: bool,
        bulk_id: u16,
        total: u16,
    },
    BulkTransferEnded {
        success: bool,
        bulk_id: u16,
    },
}

pub type EventSender = mpsc::UnboundedSender<TransferEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransferEvent>;

/// Create a connected event channel.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
