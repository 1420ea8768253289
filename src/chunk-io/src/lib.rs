mod connector;
mod part;
mod plan;
mod replicator;
mod stats;
mod writer;
mod xor;

pub use connector::*;
pub use part::*;
pub use plan::*;
pub use replicator::*;
pub use stats::*;
pub use writer::*;
pub use xor::*;

use thiserror::Error;

/// One logical chunk holds 64 MiB organised as 1024 blocks of 64 KiB.
pub const BLOCK_SIZE: u32 = 64 * 1024;
pub const BLOCKS_IN_CHUNK: u32 = 1024;
pub const CHUNK_SIZE: u64 = (BLOCK_SIZE as u64) * (BLOCKS_IN_CHUNK as u64);

#[derive(Error, Debug)]
pub enum ChunkIoError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("no server to read from: {0}")]
    NoSource(String),
    #[error("recoverable write failure: {0}")]
    RecoverableWrite(String),
    #[error("chunkserver connection failed: {0}")]
    Connection(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("chunkserver returned status: {0}")]
    ServerStatus(wire_proto::Status),
    #[error("plan cannot be completed: {0}")]
    Unrecoverable(String),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for ChunkIoError {
    fn from(err: std::io::Error) -> Self {
        ChunkIoError::IoError(err.to_string())
    }
}

impl From<wire_proto::ProtoError> for ChunkIoError {
    fn from(err: wire_proto::ProtoError) -> Self {
        ChunkIoError::IoError(err.to_string())
    }
}

pub type ChunkIoResult<T> = std::result::Result<T, ChunkIoError>;

/// Timeouts for talking to chunkservers, all in milliseconds.
#[derive(Clone, Copy, Debug)]
pub struct ChunkserverTimeouts {
    pub connect_ms: u64,
    pub basic_read_ms: u64,
    pub total_read_ms: u64,
    pub write_ms: u64,
}

impl Default for ChunkserverTimeouts {
    fn default() -> Self {
        Self {
            connect_ms: 2000,
            basic_read_ms: 2000,
            total_read_ms: 2000,
            write_ms: 5000,
        }
    }
}
