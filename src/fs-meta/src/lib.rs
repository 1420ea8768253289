mod apply;
mod changelog;
mod checksum;
mod chunks;
mod goal;
mod locks;
mod metadata;
mod node;
mod ops;
mod quota;
mod server;
mod snapshot;
mod tasks;

pub use changelog::*;
pub use checksum::*;
pub use chunks::*;
pub use goal::*;
pub use locks::*;
pub use metadata::*;
pub use node::*;
pub use ops::*;
pub use quota::*;
pub use server::*;
pub use snapshot::*;
pub use tasks::*;

#[cfg(test)]
mod metadata_tests;

use thiserror::Error;
use wire_proto::Status;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("operation not permitted")]
    Perm,
    #[error("not a directory")]
    NotDir,
    #[error("no such file or directory")]
    NoEnt,
    #[error("permission denied")]
    Access,
    #[error("file exists")]
    Exist,
    #[error("invalid argument")]
    Inval,
    #[error("directory not empty")]
    NotEmpty,
    #[error("read-only file system")]
    ReadOnly,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("quota exceeded")]
    Quota,
    #[error("chunk index too big")]
    IndexTooBig,
    #[error("no such chunk")]
    NoChunk,
    #[error("replayed result diverges from the master's")]
    Mismatch,
    #[error("metadata checksum mismatch")]
    BadMetadataChecksum,
    #[error("operation delegated to chunkservers")]
    Delayed,
    #[error("lock is taken, request queued")]
    Waiting,
}

impl FsError {
    pub fn to_status(&self) -> Status {
        match self {
            FsError::Perm => Status::EPerm,
            FsError::NotDir => Status::ENotDir,
            FsError::NoEnt => Status::ENoEnt,
            FsError::Access => Status::EAcces,
            FsError::Exist => Status::EExist,
            FsError::Inval => Status::EInval,
            FsError::NotEmpty => Status::ENotEmpty,
            FsError::ReadOnly => Status::ERofs,
            FsError::Io(_) => Status::EIo,
            FsError::Quota => Status::Quota,
            FsError::IndexTooBig => Status::IndexTooBig,
            FsError::NoChunk => Status::NoChunk,
            FsError::Mismatch => Status::Mismatch,
            FsError::BadMetadataChecksum => Status::BadMetadataChecksum,
            FsError::Delayed => Status::Delayed,
            FsError::Waiting => Status::Waiting,
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::Io(err.to_string())
    }
}

impl From<wire_proto::ProtoError> for FsError {
    fn from(err: wire_proto::ProtoError) -> Self {
        FsError::Io(err.to_string())
    }
}

pub type FsResult<T> = std::result::Result<T, FsError>;

/// Session flag: every mutation through this session is rejected.
pub const SESFLAG_READONLY: u8 = 0x01;
/// Session flag: uid/gid are mapped, ownership changes are restricted.
pub const SESFLAG_MAPALL: u8 = 0x02;
/// Session flag: gid checks are skipped on chown.
pub const SESFLAG_IGNOREGID: u8 = 0x04;

/// Whether this instance originates mutations (and emits changelog records)
/// or replays them (and verifies encoded results).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Personality {
    Master,
    Shadow,
}

/// Per-request context for metadata operations.
#[derive(Clone, Copy, Debug)]
pub struct FsContext {
    pub ts: u32,
    pub uid: u32,
    pub gid: u32,
    pub sesflags: u8,
    pub personality: Personality,
}

impl FsContext {
    pub fn master(ts: u32, uid: u32, gid: u32) -> Self {
        Self {
            ts,
            uid,
            gid,
            sesflags: 0,
            personality: Personality::Master,
        }
    }

    pub fn shadow(ts: u32) -> Self {
        Self {
            ts,
            uid: 0,
            gid: 0,
            sesflags: 0,
            personality: Personality::Shadow,
        }
    }

    pub fn is_master(&self) -> bool {
        self.personality == Personality::Master
    }

    pub fn read_only(&self) -> bool {
        self.sesflags & SESFLAG_READONLY != 0
    }
}
