//! Accept/reject hook consulted on inbound start requests.
//!
//! The engine only enforces protocol rules (single slot, version gate).
//! Whether there is room for a file is the application's call, made through
//! an [`AcceptPolicy`] installed on the session builder.

use bytes::Bytes;

use crate::protocol::{ClientType, Reason};

/// An inbound file announced by the peer.
#[derive(Debug, Clone)]
pub struct FileOffer {
    pub file_id: u16,
    pub client_type: ClientType,
    pub file_no: u16,
    pub fragment_count: u16,
    pub total_size: u32,
    pub filename: Bytes,
    /// True when the file arrives inside an open bulk session.
    pub in_bulk: bool,
}

/// An inbound bulk session announced by the peer.
#[derive(Debug, Clone, Copy)]
pub struct BulkOffer {
    pub bulk_id: u16,
    pub client_type: ClientType,
    pub file_count: u16,
}

/// Decides whether inbound transfers are accepted.
///
/// Returning `Err(reason)` rejects the request; `reason` is sent back to
/// the peer in the acknowledgement.
pub trait AcceptPolicy: Send + Sync + 'static {
    fn accept_file(&self, offer: &FileOffer) -> Result<(), Reason> {
        let _ = offer;
        Ok(())
    }

    fn accept_bulk(&self, offer: &BulkOffer) -> Result<(), Reason> {
        let _ = offer;
        Ok(())
    }
}

/// Accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl AcceptPolicy for AcceptAll {}

/// Rejects files larger than a byte limit with `ResourceUnavailable`.
#[derive(Debug, Clone, Copy)]
pub struct MaxFileSize(pub u32);

impl AcceptPolicy for MaxFileSize {
    fn accept_file(&self, offer: &FileOffer) -> Result<(), Reason> {
        if offer.total_size > self.0 {
            return Err(Reason::ResourceUnavailable);
        }
        Ok(())
    }
}

impl<F> AcceptPolicy for F
where
    F: Fn(&FileOffer) -> Result<(), Reason> + Send + Sync + 'static,
{
    fn accept_file(&self, offer: &FileOffer) -> Result<(), Reason> {
        self(offer)
    }
}
