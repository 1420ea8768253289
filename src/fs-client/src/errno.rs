use wire_proto::Status;

/// Map a protocol status byte to the native errno space.
pub fn error_conv(status: Status) -> i32 {
    match status {
        Status::Ok => 0,
        Status::EPerm => libc::EPERM,
        Status::ENotDir => libc::ENOTDIR,
        Status::ENoEnt => libc::ENOENT,
        Status::EAcces => libc::EACCES,
        Status::EExist => libc::EEXIST,
        Status::EInval => libc::EINVAL,
        Status::ENotEmpty => libc::ENOTEMPTY,
        Status::ERofs => libc::EROFS,
        Status::EIo => libc::EIO,
        Status::Quota => libc::EDQUOT,
        Status::IndexTooBig => libc::EFBIG,
        Status::NoChunk => libc::ENXIO,
        Status::Mismatch | Status::BadMetadataChecksum => libc::EIO,
        // Transient conditions surface as EAGAIN; callers retry.
        Status::Delayed | Status::Waiting => libc::EAGAIN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_statuses_map_to_errno() {
        assert_eq!(error_conv(Status::Ok), 0);
        assert_eq!(error_conv(Status::ENoEnt), libc::ENOENT);
        assert_eq!(error_conv(Status::Quota), libc::EDQUOT);
        assert_eq!(error_conv(Status::Waiting), libc::EAGAIN);
    }
}
