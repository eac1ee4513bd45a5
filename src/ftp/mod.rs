//! Minimal anonymous FTP client: passive-mode listings and resumable retrieval.

mod codec;
mod error;
mod listing;
mod session;

pub use codec::FtpReply;
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use listing::{FtpEntry, parse_listing};
pub use session::FtpSession;
