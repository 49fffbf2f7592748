//! Transfer bookkeeping: the single-slot state record and the accept policy.

mod policy;
mod state;

pub use policy::{AcceptAll, AcceptPolicy, BulkOffer, FileOffer, MaxFileSize};
pub use state::{fragment_count, BulkPhase, Direction, FilePhase, Progress, TransferState};
