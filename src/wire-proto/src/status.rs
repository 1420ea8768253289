use crate::{ProtoError, ProtoResult};

/// Status byte carried in every response payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    EPerm = 1,
    ENotDir = 2,
    ENoEnt = 3,
    EAcces = 4,
    EExist = 5,
    EInval = 6,
    ENotEmpty = 7,
    ERofs = 8,
    EIo = 9,
    Quota = 10,
    IndexTooBig = 11,
    NoChunk = 12,
    Mismatch = 13,
    BadMetadataChecksum = 14,
    Delayed = 15,
    Waiting = 16,
}

impl Status {
    pub fn from_u8(value: u8) -> ProtoResult<Status> {
        let status = match value {
            0 => Status::Ok,
            1 => Status::EPerm,
            2 => Status::ENotDir,
            3 => Status::ENoEnt,
            4 => Status::EAcces,
            5 => Status::EExist,
            6 => Status::EInval,
            7 => Status::ENotEmpty,
            8 => Status::ERofs,
            9 => Status::EIo,
            10 => Status::Quota,
            11 => Status::IndexTooBig,
            12 => Status::NoChunk,
            13 => Status::Mismatch,
            14 => Status::BadMetadataChecksum,
            15 => Status::Delayed,
            16 => Status::Waiting,
            other => return Err(ProtoError::InvalidField(format!("status byte {}", other))),
        };
        Ok(status)
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::EPerm => "EPERM",
            Status::ENotDir => "ENOTDIR",
            Status::ENoEnt => "ENOENT",
            Status::EAcces => "EACCES",
            Status::EExist => "EEXIST",
            Status::EInval => "EINVAL",
            Status::ENotEmpty => "ENOTEMPTY",
            Status::ERofs => "EROFS",
            Status::EIo => "EIO",
            Status::Quota => "QUOTA",
            Status::IndexTooBig => "INDEXTOOBIG",
            Status::NoChunk => "NOCHUNK",
            Status::Mismatch => "MISMATCH",
            Status::BadMetadataChecksum => "BADMETADATACHECKSUM",
            Status::Delayed => "DELAYED",
            Status::Waiting => "WAITING",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for value in 0..=16u8 {
            let status = Status::from_u8(value).unwrap();
            assert_eq!(status as u8, value);
        }
        assert!(Status::from_u8(17).is_err());
    }
}
