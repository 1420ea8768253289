mod codec;
mod messages;
mod status;
mod types;

pub use codec::*;
pub use messages::*;
pub use status::*;
pub use types::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("truncated packet: {0}")]
    Truncated(String),
    #[error("invalid field: {0}")]
    InvalidField(String),
    #[error("unknown message type: {0}")]
    UnknownType(u32),
    #[error("payload too large: {0}")]
    TooLarge(u32),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for ProtoError {
    fn from(err: std::io::Error) -> Self {
        ProtoError::IoError(err.to_string())
    }
}

pub type ProtoResult<T> = std::result::Result<T, ProtoError>;

/// Hard cap on a single packet payload. Data packets carry at most one
/// 64 KiB block; listing replies (readdir, trash, chunk locations) can be
/// larger, so the cap leaves generous headroom.
pub const MAX_PACKET_SIZE: u32 = 4 * 1024 * 1024;
