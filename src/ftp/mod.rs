//! File transfer over the packet bus: a chunked, session based subprotocol tunneled through
//!  a single message type, with a client (raw operations plus whole-file transfers) and a
//!  server dispatching to a pluggable storage backend.

mod client;
mod fs_backend;
mod listing;
mod payload;
mod server;
mod transfer;

pub use client::{FtpClient, FtpClientConfig};
pub use fs_backend::FsBackend;
pub use listing::{format_entry, parse_listing, DirEntry, DirEntryKind};
pub use payload::{FtpMessage, FtpOpcode, FtpPayload, NakError, FTP_MESSAGE_ID, MAX_DATA_SIZE};
pub use server::{FtpNak, FtpServer, FtpServerBackend, FtpServerConfig, OpenReadResult};
pub use transfer::FtpTransfer;

use thiserror::Error;

use crate::microservice::CallError;

/// Why an FTP operation failed.
#[derive(Debug, Error)]
pub enum FtpError {
    #[error("{opcode:?} rejected by server: {error:?}{}", errno.map(|e| format!(" (errno {})", e)).unwrap_or_default())]
    Nak {
        opcode: FtpOpcode,
        error: NakError,
        errno: Option<u8>,
    },
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("malformed {opcode:?} reply: {message}")]
    Malformed { opcode: FtpOpcode, message: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FtpError {
    /// Naks that signal "end of data" rather than failure.
    pub fn is_eof_nak(&self) -> bool {
        matches!(self, FtpError::Nak { error: NakError::Eof, .. })
    }
}
