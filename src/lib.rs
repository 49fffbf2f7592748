//! # wiredrop
//!
//! Fragment-based file transfer protocol engine for a point-to-point,
//! reliable, ordered byte stream (USB link, socket, pipe).
//!
//! ## Architecture
//!
//! - **Wire format** ([`protocol`]): 4-byte big-endian header, nine opcodes,
//!   length-prefixed variable fields, bounds-checked decoding
//! - **Version negotiation** ([`version`]): compatibility of the two
//!   endpoints' declared versions
//! - **Transfer state** ([`transfer`]): one file slot per connection, bulk
//!   sessions serialised through it
//! - **Engine** ([`engine`]): the synchronous state machine
//! - **Session** ([`Session`]): async operations, writer task, read loop
//!
//! ## Example
//!
//! ```no_run
//! use wiredrop::{OutboundFile, Session};
//!
//! # async fn run(stream: tokio::net::TcpStream) -> wiredrop::Result<()> {
//! let (session, _events) = Session::builder().peer_version(0, 0).spawn(stream)?;
//!
//! session
//!     .send_files(vec![
//!         OutboundFile::new("a.txt", &b"first"[..]),
//!         OutboundFile::new("b.txt", &b"second"[..]),
//!     ])
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod protocol;
pub mod transfer;
pub mod version;
pub mod writer;

mod backpressure;
mod session;

pub use config::{PeerVersion, SessionConfig};
pub use error::{Result, WireDropError};
pub use events::{EventReceiver, ReceivedFile, TransferEvent};
pub use protocol::{ClientType, Reason};
pub use session::{OutboundFile, Session, SessionBuilder};
pub use transfer::{AcceptAll, AcceptPolicy, BulkOffer, FileOffer, MaxFileSize, Progress};
pub use version::{Compatibility, ConnectionVersion};
