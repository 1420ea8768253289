mod client;
mod conn;
mod errno;
mod options;

pub use client::*;
pub use conn::*;
pub use errno::*;
pub use options::*;

use thiserror::Error;
use wire_proto::Status;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("bad mount option: {0}")]
    BadOption(String),
    #[error("master returned status: {0}")]
    MasterStatus(Status),
    #[error("chunkserver I/O failed: {0}")]
    ChunkIo(#[from] chunk_io::ChunkIoError),
    #[error("protocol error: {0}")]
    Proto(#[from] wire_proto::ProtoError),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::IoError(err.to_string())
    }
}

impl ClientError {
    pub fn from_status(status: Status) -> Self {
        ClientError::MasterStatus(status)
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Per-request credentials, one per calling process.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Context {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub umask: u16,
    /// Supplementary groups, refreshed with `update_groups`.
    pub groups: Vec<u32>,
}

impl Context {
    pub fn new(uid: u32, gid: u32, pid: u32, umask: u16) -> Self {
        Self {
            uid,
            gid,
            pid,
            umask,
            groups: Vec::new(),
        }
    }

    pub fn cred(&self) -> wire_proto::WireCred {
        wire_proto::WireCred {
            uid: self.uid,
            gid: self.gid,
        }
    }
}
