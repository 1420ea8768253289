//! Typed messages of the binary protocol. Message type numbers are grouped
//! by link direction; each struct encodes to / decodes from a raw payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{get_bytes, get_string, need, put_bytes, put_string, Packet};
use crate::{ChunkPartType, ChunkTypeWithAddress, ProtoResult, Status};

// client -> chunkserver
pub const CLTOCS_READ: u32 = 200;
pub const CLTOCS_WRITE_INIT: u32 = 201;
pub const CLTOCS_WRITE_DATA: u32 = 202;
pub const CLTOCS_WRITE_END: u32 = 203;

// chunkserver -> client
pub const CSTOCL_READ_DATA: u32 = 220;
pub const CSTOCL_READ_STATUS: u32 = 221;
pub const CSTOCL_WRITE_STATUS: u32 = 222;

// chunkserver <-> chunkserver
pub const CSTOCS_GET_CHUNK_BLOCKS: u32 = 250;
pub const CSTOCS_GET_CHUNK_BLOCKS_STATUS: u32 = 251;

// client -> master
pub const CLTOMA_REGISTER_SESSION: u32 = 400;
pub const CLTOMA_LOOKUP: u32 = 401;
pub const CLTOMA_GETATTR: u32 = 402;
pub const CLTOMA_SETATTR: u32 = 403;
pub const CLTOMA_MKNOD: u32 = 404;
pub const CLTOMA_MKDIR: u32 = 405;
pub const CLTOMA_SYMLINK: u32 = 406;
pub const CLTOMA_READLINK: u32 = 407;
pub const CLTOMA_UNLINK: u32 = 408;
pub const CLTOMA_RMDIR: u32 = 409;
pub const CLTOMA_RENAME: u32 = 410;
pub const CLTOMA_LINK: u32 = 411;
pub const CLTOMA_READDIR: u32 = 412;
pub const CLTOMA_OPEN: u32 = 413;
pub const CLTOMA_RELEASE: u32 = 414;
pub const CLTOMA_READ_CHUNK: u32 = 415;
pub const CLTOMA_WRITE_CHUNK: u32 = 416;
pub const CLTOMA_WRITE_CHUNK_END: u32 = 417;
pub const CLTOMA_TRUNCATE: u32 = 418;
pub const CLTOMA_STATFS: u32 = 419;
pub const CLTOMA_SETGOAL: u32 = 430;
pub const CLTOMA_SETTRASHTIME: u32 = 431;
pub const CLTOMA_SETEATTR: u32 = 432;
pub const CLTOMA_READ_TRASH: u32 = 433;
pub const CLTOMA_READ_RESERVED: u32 = 434;
pub const CLTOMA_UNDEL: u32 = 435;
pub const CLTOMA_PURGE: u32 = 436;
pub const CLTOMA_GETGOAL: u32 = 437;
pub const CLTOMA_GETTRASHTIME: u32 = 438;
pub const CLTOMA_GETEATTR: u32 = 439;
pub const CLTOMA_SETXATTR: u32 = 440;
pub const CLTOMA_GETXATTR: u32 = 441;
pub const CLTOMA_LISTXATTR: u32 = 442;
pub const CLTOMA_SETACL: u32 = 443;
pub const CLTOMA_GETACL: u32 = 444;
pub const CLTOMA_DELETEACL: u32 = 445;
pub const CLTOMA_APPEND: u32 = 446;
pub const CLTOMA_REPAIR: u32 = 447;
pub const CLTOMA_SET_QUOTA: u32 = 448;
pub const CLTOMA_GET_QUOTA: u32 = 449;
pub const CLTOMA_FLOCK: u32 = 450;
pub const CLTOMA_POSIX_LOCK: u32 = 451;
pub const CLTOMA_LOCK_PROBE: u32 = 452;

// master -> client: reply type is request type + 20
pub const MATOCL_BASE: u32 = 20;

// chunkserver -> master
pub const CSTOMA_REGISTER: u32 = 600;
pub const CSTOMA_SPACE: u32 = 601;
pub const CSTOMA_CHUNK_NEW: u32 = 602;
pub const CSTOMA_CHUNK_LOST: u32 = 603;
pub const CSTOMA_CHUNK_DAMAGED: u32 = 604;
pub const CSTOMA_REPLICATION_STATUS: u32 = 605;

// master -> chunkserver
pub const MATOCS_CREATE_CHUNK: u32 = 620;
pub const MATOCS_DELETE_CHUNK: u32 = 621;
pub const MATOCS_SET_VERSION: u32 = 622;
pub const MATOCS_REPLICATE: u32 = 623;
pub const MATOCS_TRUNCATE: u32 = 624;

// metalogger / shadow <-> master
pub const MLTOMA_REGISTER: u32 = 660;
pub const MATOML_CHANGELOG_LINE: u32 = 680;
pub const MATOML_CHECKSUM: u32 = 681;

pub fn reply_type(request_type: u32) -> u32 {
    request_type + MATOCL_BASE
}

/// Fixed-width attribute record returned by lookup/getattr/... replies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Attr {
    pub kind: u8,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub nlink: u32,
    pub length: u64,
    pub rdev: u32,
}

impl Attr {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_u16(self.mode);
        buf.put_u32(self.uid);
        buf.put_u32(self.gid);
        buf.put_u32(self.atime);
        buf.put_u32(self.mtime);
        buf.put_u32(self.ctime);
        buf.put_u32(self.nlink);
        buf.put_u64(self.length);
        buf.put_u32(self.rdev);
    }

    pub fn decode(buf: &mut impl Buf) -> ProtoResult<Attr> {
        need(buf, 35, "attr record")?;
        Ok(Attr {
            kind: buf.get_u8(),
            mode: buf.get_u16(),
            uid: buf.get_u32(),
            gid: buf.get_u32(),
            atime: buf.get_u32(),
            mtime: buf.get_u32(),
            ctime: buf.get_u32(),
            nlink: buf.get_u32(),
            length: buf.get_u64(),
            rdev: buf.get_u32(),
        })
    }
}

/// Credentials attached to every client -> master request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WireCred {
    pub uid: u32,
    pub gid: u32,
}

impl WireCred {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.uid);
        buf.put_u32(self.gid);
    }

    fn decode(buf: &mut impl Buf) -> ProtoResult<WireCred> {
        need(buf, 8, "credentials")?;
        Ok(WireCred {
            uid: buf.get_u32(),
            gid: buf.get_u32(),
        })
    }
}

macro_rules! packet_from {
    ($msg_type:expr, $buf:ident, $body:block) => {{
        let mut $buf = BytesMut::new();
        $body
        Packet::new($msg_type, $buf.freeze())
    }};
}

// ========== client -> master ==========

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterSession {
    pub mountpoint: String,
    pub subfolder: String,
}

impl RegisterSession {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_REGISTER_SESSION, buf, {
            put_string(&mut buf, &self.mountpoint);
            put_string(&mut buf, &self.subfolder);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        Ok(Self {
            mountpoint: get_string(payload)?,
            subfolder: get_string(payload)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterSessionReply {
    pub status: Status,
    pub session_id: u32,
    pub root_inode: u32,
}

impl RegisterSessionReply {
    pub fn to_packet(&self) -> Packet {
        packet_from!(reply_type(CLTOMA_REGISTER_SESSION), buf, {
            buf.put_u8(self.status as u8);
            buf.put_u32(self.session_id);
            buf.put_u32(self.root_inode);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 9, "register session reply")?;
        Ok(Self {
            status: Status::from_u8(payload.get_u8())?,
            session_id: payload.get_u32(),
            root_inode: payload.get_u32(),
        })
    }
}

/// Shared shape of lookup-like requests: `(parent, name)` plus credentials.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameRequest {
    pub msg_type: u32,
    pub parent: u32,
    pub name: String,
    pub cred: WireCred,
}

impl NameRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(self.msg_type, buf, {
            buf.put_u32(self.parent);
            put_string(&mut buf, &self.name);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(msg_type: u32, payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 4, "parent inode")?;
        let parent = payload.get_u32();
        let name = get_string(payload)?;
        let cred = WireCred::decode(payload)?;
        Ok(Self {
            msg_type,
            parent,
            name,
            cred,
        })
    }
}

/// Reply carrying a status and, on success, an inode id with attributes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryReply {
    pub msg_type: u32,
    pub status: Status,
    pub inode: u32,
    pub attr: Attr,
}

impl EntryReply {
    pub fn error(msg_type: u32, status: Status) -> Self {
        Self {
            msg_type,
            status,
            inode: 0,
            attr: Attr::default(),
        }
    }

    pub fn to_packet(&self) -> Packet {
        packet_from!(self.msg_type, buf, {
            buf.put_u8(self.status as u8);
            if self.status.is_ok() {
                buf.put_u32(self.inode);
                self.attr.encode(&mut buf);
            }
        })
    }

    pub fn decode(msg_type: u32, payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 1, "status")?;
        let status = Status::from_u8(payload.get_u8())?;
        if !status.is_ok() {
            return Ok(Self::error(msg_type, status));
        }
        need(payload, 4, "inode")?;
        Ok(Self {
            msg_type,
            status,
            inode: payload.get_u32(),
            attr: Attr::decode(payload)?,
        })
    }
}

/// Status-only reply used by unlink, rmdir, release, undel, purge, ...
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusReply {
    pub msg_type: u32,
    pub status: Status,
}

impl StatusReply {
    pub fn to_packet(&self) -> Packet {
        packet_from!(self.msg_type, buf, {
            buf.put_u8(self.status as u8);
        })
    }

    pub fn decode(msg_type: u32, payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 1, "status")?;
        Ok(Self {
            msg_type,
            status: Status::from_u8(payload.get_u8())?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadChunkRequest {
    pub inode: u32,
    pub index: u32,
}

impl ReadChunkRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_READ_CHUNK, buf, {
            buf.put_u32(self.inode);
            buf.put_u32(self.index);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 8, "read chunk request")?;
        Ok(Self {
            inode: payload.get_u32(),
            index: payload.get_u32(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkLocationReply {
    pub msg_type: u32,
    pub status: Status,
    pub file_length: u64,
    pub chunk_id: u64,
    pub version: u32,
    pub lock_id: u32,
    pub locations: Vec<ChunkTypeWithAddress>,
}

impl ChunkLocationReply {
    pub fn error(msg_type: u32, status: Status) -> Self {
        Self {
            msg_type,
            status,
            file_length: 0,
            chunk_id: 0,
            version: 0,
            lock_id: 0,
            locations: Vec::new(),
        }
    }

    pub fn to_packet(&self) -> Packet {
        packet_from!(self.msg_type, buf, {
            buf.put_u8(self.status as u8);
            if self.status.is_ok() {
                buf.put_u64(self.file_length);
                buf.put_u64(self.chunk_id);
                buf.put_u32(self.version);
                buf.put_u32(self.lock_id);
                buf.put_u32(self.locations.len() as u32);
                for location in &self.locations {
                    location.encode(&mut buf);
                }
            }
        })
    }

    pub fn decode(msg_type: u32, payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 1, "status")?;
        let status = Status::from_u8(payload.get_u8())?;
        if !status.is_ok() {
            return Ok(Self::error(msg_type, status));
        }
        need(payload, 28, "chunk location reply")?;
        let file_length = payload.get_u64();
        let chunk_id = payload.get_u64();
        let version = payload.get_u32();
        let lock_id = payload.get_u32();
        let count = payload.get_u32() as usize;
        let mut locations = Vec::with_capacity(count);
        for _ in 0..count {
            locations.push(ChunkTypeWithAddress::decode(payload)?);
        }
        Ok(Self {
            msg_type,
            status,
            file_length,
            chunk_id,
            version,
            lock_id,
            locations,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteChunkRequest {
    pub inode: u32,
    pub index: u32,
    pub lock_id: u32,
}

impl WriteChunkRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_WRITE_CHUNK, buf, {
            buf.put_u32(self.inode);
            buf.put_u32(self.index);
            buf.put_u32(self.lock_id);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 12, "write chunk request")?;
        Ok(Self {
            inode: payload.get_u32(),
            index: payload.get_u32(),
            lock_id: payload.get_u32(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteChunkEnd {
    pub inode: u32,
    pub file_length: u64,
    pub chunk_id: u64,
    pub lock_id: u32,
}

impl WriteChunkEnd {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_WRITE_CHUNK_END, buf, {
            buf.put_u32(self.inode);
            buf.put_u64(self.file_length);
            buf.put_u64(self.chunk_id);
            buf.put_u32(self.lock_id);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 24, "write chunk end")?;
        Ok(Self {
            inode: payload.get_u32(),
            file_length: payload.get_u64(),
            chunk_id: payload.get_u64(),
            lock_id: payload.get_u32(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u32,
    pub kind: u8,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReaddirReply {
    pub status: Status,
    pub entries: Vec<DirEntry>,
}

impl ReaddirReply {
    pub fn to_packet(&self) -> Packet {
        packet_from!(reply_type(CLTOMA_READDIR), buf, {
            buf.put_u8(self.status as u8);
            if self.status.is_ok() {
                buf.put_u32(self.entries.len() as u32);
                for entry in &self.entries {
                    buf.put_u32(entry.inode);
                    buf.put_u8(entry.kind);
                    put_string(&mut buf, &entry.name);
                }
            }
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 1, "status")?;
        let status = Status::from_u8(payload.get_u8())?;
        if !status.is_ok() {
            return Ok(Self {
                status,
                entries: Vec::new(),
            });
        }
        need(payload, 4, "entry count")?;
        let count = payload.get_u32() as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            need(payload, 5, "dir entry")?;
            let inode = payload.get_u32();
            let kind = payload.get_u8();
            let name = get_string(payload)?;
            entries.push(DirEntry { inode, kind, name });
        }
        Ok(Self { status, entries })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MknodRequest {
    pub parent: u32,
    pub name: String,
    pub kind: u8,
    pub mode: u16,
    pub umask: u16,
    pub rdev: u32,
    pub cred: WireCred,
}

impl MknodRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_MKNOD, buf, {
            buf.put_u32(self.parent);
            put_string(&mut buf, &self.name);
            buf.put_u8(self.kind);
            buf.put_u16(self.mode);
            buf.put_u16(self.umask);
            buf.put_u32(self.rdev);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 4, "parent inode")?;
        let parent = payload.get_u32();
        let name = get_string(payload)?;
        need(payload, 9, "mknod fields")?;
        Ok(Self {
            parent,
            name,
            kind: payload.get_u8(),
            mode: payload.get_u16(),
            umask: payload.get_u16(),
            rdev: payload.get_u32(),
            cred: WireCred::decode(payload)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MkdirRequest {
    pub parent: u32,
    pub name: String,
    pub mode: u16,
    pub umask: u16,
    pub cred: WireCred,
}

impl MkdirRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_MKDIR, buf, {
            buf.put_u32(self.parent);
            put_string(&mut buf, &self.name);
            buf.put_u16(self.mode);
            buf.put_u16(self.umask);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 4, "parent inode")?;
        let parent = payload.get_u32();
        let name = get_string(payload)?;
        need(payload, 4, "mkdir fields")?;
        Ok(Self {
            parent,
            name,
            mode: payload.get_u16(),
            umask: payload.get_u16(),
            cred: WireCred::decode(payload)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymlinkRequest {
    pub parent: u32,
    pub name: String,
    pub target: String,
    pub cred: WireCred,
}

impl SymlinkRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_SYMLINK, buf, {
            buf.put_u32(self.parent);
            put_string(&mut buf, &self.name);
            put_string(&mut buf, &self.target);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 4, "parent inode")?;
        let parent = payload.get_u32();
        let name = get_string(payload)?;
        let target = get_string(payload)?;
        Ok(Self {
            parent,
            name,
            target,
            cred: WireCred::decode(payload)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkRequest {
    pub inode: u32,
    pub parent: u32,
    pub name: String,
    pub cred: WireCred,
}

impl LinkRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_LINK, buf, {
            buf.put_u32(self.inode);
            buf.put_u32(self.parent);
            put_string(&mut buf, &self.name);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 8, "link inodes")?;
        let inode = payload.get_u32();
        let parent = payload.get_u32();
        let name = get_string(payload)?;
        Ok(Self {
            inode,
            parent,
            name,
            cred: WireCred::decode(payload)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenameRequest {
    pub src_parent: u32,
    pub src_name: String,
    pub dst_parent: u32,
    pub dst_name: String,
    pub cred: WireCred,
}

impl RenameRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_RENAME, buf, {
            buf.put_u32(self.src_parent);
            put_string(&mut buf, &self.src_name);
            buf.put_u32(self.dst_parent);
            put_string(&mut buf, &self.dst_name);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 4, "source parent")?;
        let src_parent = payload.get_u32();
        let src_name = get_string(payload)?;
        need(payload, 4, "destination parent")?;
        let dst_parent = payload.get_u32();
        let dst_name = get_string(payload)?;
        Ok(Self {
            src_parent,
            src_name,
            dst_parent,
            dst_name,
            cred: WireCred::decode(payload)?,
        })
    }
}

/// Generic single-inode request (getattr, readlink, readdir, undel, purge,
/// read trash/reserved listings use inode 0).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InodeRequest {
    pub msg_type: u32,
    pub inode: u32,
    pub cred: WireCred,
}

impl InodeRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(self.msg_type, buf, {
            buf.put_u32(self.inode);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(msg_type: u32, payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 4, "inode")?;
        Ok(Self {
            msg_type,
            inode: payload.get_u32(),
            cred: WireCred::decode(payload)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenRequest {
    pub inode: u32,
    pub flags: u8,
    pub session_id: u32,
    pub cred: WireCred,
}

pub const OPEN_WANT_READ: u8 = 0x01;
pub const OPEN_WANT_WRITE: u8 = 0x02;
pub const OPEN_AFTER_CREATE: u8 = 0x04;

impl OpenRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_OPEN, buf, {
            buf.put_u32(self.inode);
            buf.put_u8(self.flags);
            buf.put_u32(self.session_id);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 9, "open request")?;
        Ok(Self {
            inode: payload.get_u32(),
            flags: payload.get_u8(),
            session_id: payload.get_u32(),
            cred: WireCred::decode(payload)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReleaseRequest {
    pub inode: u32,
    pub session_id: u32,
}

impl ReleaseRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_RELEASE, buf, {
            buf.put_u32(self.inode);
            buf.put_u32(self.session_id);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 8, "release request")?;
        Ok(Self {
            inode: payload.get_u32(),
            session_id: payload.get_u32(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetattrRequest {
    pub inode: u32,
    pub setmask: u8,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub sugid_clear_mode: u8,
    pub cred: WireCred,
}

impl SetattrRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_SETATTR, buf, {
            buf.put_u32(self.inode);
            buf.put_u8(self.setmask);
            buf.put_u16(self.mode);
            buf.put_u32(self.uid);
            buf.put_u32(self.gid);
            buf.put_u32(self.atime);
            buf.put_u32(self.mtime);
            buf.put_u8(self.sugid_clear_mode);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 24, "setattr request")?;
        Ok(Self {
            inode: payload.get_u32(),
            setmask: payload.get_u8(),
            mode: payload.get_u16(),
            uid: payload.get_u32(),
            gid: payload.get_u32(),
            atime: payload.get_u32(),
            mtime: payload.get_u32(),
            sugid_clear_mode: payload.get_u8(),
            cred: WireCred::decode(payload)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TruncateRequest {
    pub inode: u32,
    pub length: u64,
    pub opened: bool,
    pub cred: WireCred,
}

impl TruncateRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_TRUNCATE, buf, {
            buf.put_u32(self.inode);
            buf.put_u64(self.length);
            buf.put_u8(self.opened as u8);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 13, "truncate request")?;
        Ok(Self {
            inode: payload.get_u32(),
            length: payload.get_u64(),
            opened: payload.get_u8() != 0,
            cred: WireCred::decode(payload)?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatfsReply {
    pub total_space: u64,
    pub avail_space: u64,
    pub trash_space: u64,
    pub reserved_space: u64,
    pub inodes: u32,
}

impl StatfsReply {
    pub fn to_packet(&self) -> Packet {
        packet_from!(reply_type(CLTOMA_STATFS), buf, {
            buf.put_u64(self.total_space);
            buf.put_u64(self.avail_space);
            buf.put_u64(self.trash_space);
            buf.put_u64(self.reserved_space);
            buf.put_u32(self.inodes);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 36, "statfs reply")?;
        Ok(Self {
            total_space: payload.get_u64(),
            avail_space: payload.get_u64(),
            trash_space: payload.get_u64(),
            reserved_space: payload.get_u64(),
            inodes: payload.get_u32(),
        })
    }
}

/// Listing of detached inodes (trash with restore paths, reserved with
/// empty paths).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetachedListReply {
    pub msg_type: u32,
    pub entries: Vec<(u32, String)>,
}

impl DetachedListReply {
    pub fn to_packet(&self) -> Packet {
        packet_from!(self.msg_type, buf, {
            buf.put_u32(self.entries.len() as u32);
            for (inode, path) in &self.entries {
                buf.put_u32(*inode);
                put_string(&mut buf, path);
            }
        })
    }

    pub fn decode(msg_type: u32, payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 4, "entry count")?;
        let count = payload.get_u32() as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            need(payload, 4, "detached inode")?;
            let inode = payload.get_u32();
            entries.push((inode, get_string(payload)?));
        }
        Ok(Self { msg_type, entries })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetGoalRequest {
    pub inode: u32,
    pub goal: u8,
    pub smode: u8,
    pub cred: WireCred,
}

impl SetGoalRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_SETGOAL, buf, {
            buf.put_u32(self.inode);
            buf.put_u8(self.goal);
            buf.put_u8(self.smode);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 6, "setgoal request")?;
        Ok(Self {
            inode: payload.get_u32(),
            goal: payload.get_u8(),
            smode: payload.get_u8(),
            cred: WireCred::decode(payload)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetTrashtimeRequest {
    pub inode: u32,
    pub trashtime: u32,
    pub smode: u8,
    pub cred: WireCred,
}

impl SetTrashtimeRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_SETTRASHTIME, buf, {
            buf.put_u32(self.inode);
            buf.put_u32(self.trashtime);
            buf.put_u8(self.smode);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 9, "settrashtime request")?;
        Ok(Self {
            inode: payload.get_u32(),
            trashtime: payload.get_u32(),
            smode: payload.get_u8(),
            cred: WireCred::decode(payload)?,
        })
    }
}

/// Reply carrying the counters of a recursive attribute operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CountersReply {
    pub msg_type: u32,
    pub status: Status,
    pub changed: u32,
    pub not_changed: u32,
    pub not_permitted: u32,
}

impl CountersReply {
    pub fn error(msg_type: u32, status: Status) -> Self {
        Self {
            msg_type,
            status,
            changed: 0,
            not_changed: 0,
            not_permitted: 0,
        }
    }

    pub fn to_packet(&self) -> Packet {
        packet_from!(self.msg_type, buf, {
            buf.put_u8(self.status as u8);
            if self.status.is_ok() {
                buf.put_u32(self.changed);
                buf.put_u32(self.not_changed);
                buf.put_u32(self.not_permitted);
            }
        })
    }

    pub fn decode(msg_type: u32, payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 1, "status")?;
        let status = Status::from_u8(payload.get_u8())?;
        if !status.is_ok() {
            return Ok(Self::error(msg_type, status));
        }
        need(payload, 12, "counters")?;
        Ok(Self {
            msg_type,
            status,
            changed: payload.get_u32(),
            not_changed: payload.get_u32(),
            not_permitted: payload.get_u32(),
        })
    }
}

/// Reply to readlink: status plus the stored path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathReply {
    pub msg_type: u32,
    pub status: Status,
    pub path: String,
}

impl PathReply {
    pub fn to_packet(&self) -> Packet {
        packet_from!(self.msg_type, buf, {
            buf.put_u8(self.status as u8);
            if self.status.is_ok() {
                put_string(&mut buf, &self.path);
            }
        })
    }

    pub fn decode(msg_type: u32, payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 1, "status")?;
        let status = Status::from_u8(payload.get_u8())?;
        let path = if status.is_ok() {
            get_string(payload)?
        } else {
            String::new()
        };
        Ok(Self {
            msg_type,
            status,
            path,
        })
    }
}

// Quota owner/rigor/resource selector bytes, shared by both peers.
pub const QUOTA_OWNER_USER: u8 = b'u';
pub const QUOTA_OWNER_GROUP: u8 = b'g';
pub const QUOTA_RIGOR_SOFT: u8 = b's';
pub const QUOTA_RIGOR_HARD: u8 = b'h';
pub const QUOTA_RESOURCE_INODES: u8 = b'i';
pub const QUOTA_RESOURCE_BYTES: u8 = b'b';

// Lock operation selectors and lock kinds on the wire.
pub const LOCK_OP_SHARED: u16 = 1;
pub const LOCK_OP_EXCLUSIVE: u16 = 2;
pub const LOCK_OP_UNLOCK: u16 = 3;
pub const LOCK_OP_RELEASE: u16 = 4;
pub const LOCK_KIND_SHARED: u8 = 1;
pub const LOCK_KIND_EXCLUSIVE: u8 = 2;

// ACL variant selector bytes.
pub const ACL_VARIANT_ACCESS: u8 = b'a';
pub const ACL_VARIANT_DEFAULT: u8 = b'd';

/// Recursive readout of goal / trashtime / eattr values over a subtree
/// (getgoal, gettrashtime, geteattr share the shape).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubtreeQueryRequest {
    pub msg_type: u32,
    pub inode: u32,
    pub recursive: bool,
    pub cred: WireCred,
}

impl SubtreeQueryRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(self.msg_type, buf, {
            buf.put_u32(self.inode);
            buf.put_u8(self.recursive as u8);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(msg_type: u32, payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 5, "subtree query")?;
        Ok(Self {
            msg_type,
            inode: payload.get_u32(),
            recursive: payload.get_u8() != 0,
            cred: WireCred::decode(payload)?,
        })
    }
}

/// Histogram reply: one `(value, files, dirs)` row per distinct value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttrHistogramReply {
    pub msg_type: u32,
    pub status: Status,
    pub entries: Vec<(u32, u32, u32)>,
}

impl AttrHistogramReply {
    pub fn to_packet(&self) -> Packet {
        packet_from!(self.msg_type, buf, {
            buf.put_u8(self.status as u8);
            if self.status.is_ok() {
                buf.put_u32(self.entries.len() as u32);
                for (value, files, dirs) in &self.entries {
                    buf.put_u32(*value);
                    buf.put_u32(*files);
                    buf.put_u32(*dirs);
                }
            }
        })
    }

    pub fn decode(msg_type: u32, payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 1, "status")?;
        let status = Status::from_u8(payload.get_u8())?;
        if !status.is_ok() {
            return Ok(Self {
                msg_type,
                status,
                entries: Vec::new(),
            });
        }
        need(payload, 4, "histogram length")?;
        let count = payload.get_u32() as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            need(payload, 12, "histogram row")?;
            entries.push((payload.get_u32(), payload.get_u32(), payload.get_u32()));
        }
        Ok(Self {
            msg_type,
            status,
            entries,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetEattrRequest {
    pub inode: u32,
    pub eattr: u8,
    pub smode: u8,
    pub cred: WireCred,
}

impl SetEattrRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_SETEATTR, buf, {
            buf.put_u32(self.inode);
            buf.put_u8(self.eattr);
            buf.put_u8(self.smode);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 6, "seteattr request")?;
        Ok(Self {
            inode: payload.get_u32(),
            eattr: payload.get_u8(),
            smode: payload.get_u8(),
            cred: WireCred::decode(payload)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetXattrRequest {
    pub inode: u32,
    pub name: String,
    pub value: Vec<u8>,
    pub mode: u8,
    pub cred: WireCred,
}

impl SetXattrRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_SETXATTR, buf, {
            buf.put_u32(self.inode);
            put_string(&mut buf, &self.name);
            put_bytes(&mut buf, &self.value);
            buf.put_u8(self.mode);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 4, "inode")?;
        let inode = payload.get_u32();
        let name = get_string(payload)?;
        let value = get_bytes(payload)?;
        need(payload, 1, "xattr mode")?;
        Ok(Self {
            inode,
            name,
            value,
            mode: payload.get_u8(),
            cred: WireCred::decode(payload)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetXattrRequest {
    pub inode: u32,
    pub name: String,
    pub cred: WireCred,
}

impl GetXattrRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_GETXATTR, buf, {
            buf.put_u32(self.inode);
            put_string(&mut buf, &self.name);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 4, "inode")?;
        let inode = payload.get_u32();
        let name = get_string(payload)?;
        Ok(Self {
            inode,
            name,
            cred: WireCred::decode(payload)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XattrValueReply {
    pub status: Status,
    pub value: Vec<u8>,
}

impl XattrValueReply {
    pub fn to_packet(&self) -> Packet {
        packet_from!(reply_type(CLTOMA_GETXATTR), buf, {
            buf.put_u8(self.status as u8);
            if self.status.is_ok() {
                put_bytes(&mut buf, &self.value);
            }
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 1, "status")?;
        let status = Status::from_u8(payload.get_u8())?;
        let value = if status.is_ok() {
            get_bytes(payload)?
        } else {
            Vec::new()
        };
        Ok(Self { status, value })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XattrListReply {
    pub status: Status,
    pub names: Vec<String>,
}

impl XattrListReply {
    pub fn to_packet(&self) -> Packet {
        packet_from!(reply_type(CLTOMA_LISTXATTR), buf, {
            buf.put_u8(self.status as u8);
            if self.status.is_ok() {
                buf.put_u32(self.names.len() as u32);
                for name in &self.names {
                    put_string(&mut buf, name);
                }
            }
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 1, "status")?;
        let status = Status::from_u8(payload.get_u8())?;
        if !status.is_ok() {
            return Ok(Self {
                status,
                names: Vec::new(),
            });
        }
        need(payload, 4, "name count")?;
        let count = payload.get_u32() as usize;
        let mut names = Vec::with_capacity(count);
        for _ in 0..count {
            names.push(get_string(payload)?);
        }
        Ok(Self { status, names })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetAclRequest {
    pub inode: u32,
    pub variant: u8,
    pub acl: String,
    pub cred: WireCred,
}

impl SetAclRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_SETACL, buf, {
            buf.put_u32(self.inode);
            buf.put_u8(self.variant);
            put_string(&mut buf, &self.acl);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 5, "setacl request")?;
        let inode = payload.get_u32();
        let variant = payload.get_u8();
        let acl = get_string(payload)?;
        Ok(Self {
            inode,
            variant,
            acl,
            cred: WireCred::decode(payload)?,
        })
    }
}

/// Shared shape of getacl and deleteacl: an inode plus the ACL variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AclVariantRequest {
    pub msg_type: u32,
    pub inode: u32,
    pub variant: u8,
    pub cred: WireCred,
}

impl AclVariantRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(self.msg_type, buf, {
            buf.put_u32(self.inode);
            buf.put_u8(self.variant);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(msg_type: u32, payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 5, "acl request")?;
        Ok(Self {
            msg_type,
            inode: payload.get_u32(),
            variant: payload.get_u8(),
            cred: WireCred::decode(payload)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AclTextReply {
    pub status: Status,
    pub acl: String,
}

impl AclTextReply {
    pub fn to_packet(&self) -> Packet {
        packet_from!(reply_type(CLTOMA_GETACL), buf, {
            buf.put_u8(self.status as u8);
            if self.status.is_ok() {
                put_string(&mut buf, &self.acl);
            }
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 1, "status")?;
        let status = Status::from_u8(payload.get_u8())?;
        let acl = if status.is_ok() {
            get_string(payload)?
        } else {
            String::new()
        };
        Ok(Self { status, acl })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendRequest {
    pub inode: u32,
    pub inode_src: u32,
    pub cred: WireCred,
}

impl AppendRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_APPEND, buf, {
            buf.put_u32(self.inode);
            buf.put_u32(self.inode_src);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 8, "append request")?;
        Ok(Self {
            inode: payload.get_u32(),
            inode_src: payload.get_u32(),
            cred: WireCred::decode(payload)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RepairReply {
    pub status: Status,
    pub not_changed: u32,
    pub erased: u32,
    pub repaired: u32,
}

impl RepairReply {
    pub fn error(status: Status) -> Self {
        Self {
            status,
            not_changed: 0,
            erased: 0,
            repaired: 0,
        }
    }

    pub fn to_packet(&self) -> Packet {
        packet_from!(reply_type(CLTOMA_REPAIR), buf, {
            buf.put_u8(self.status as u8);
            if self.status.is_ok() {
                buf.put_u32(self.not_changed);
                buf.put_u32(self.erased);
                buf.put_u32(self.repaired);
            }
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 1, "status")?;
        let status = Status::from_u8(payload.get_u8())?;
        if !status.is_ok() {
            return Ok(Self::error(status));
        }
        need(payload, 12, "repair counters")?;
        Ok(Self {
            status,
            not_changed: payload.get_u32(),
            erased: payload.get_u32(),
            repaired: payload.get_u32(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetQuotaRequest {
    pub owner_type: u8,
    pub owner_id: u32,
    pub rigor: u8,
    pub resource: u8,
    pub limit: u64,
    pub cred: WireCred,
}

impl SetQuotaRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_SET_QUOTA, buf, {
            buf.put_u8(self.owner_type);
            buf.put_u32(self.owner_id);
            buf.put_u8(self.rigor);
            buf.put_u8(self.resource);
            buf.put_u64(self.limit);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 15, "set quota request")?;
        Ok(Self {
            owner_type: payload.get_u8(),
            owner_id: payload.get_u32(),
            rigor: payload.get_u8(),
            resource: payload.get_u8(),
            limit: payload.get_u64(),
            cred: WireCred::decode(payload)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GetQuotaRequest {
    pub owner_type: u8,
    pub owner_id: u32,
    pub cred: WireCred,
}

impl GetQuotaRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_GET_QUOTA, buf, {
            buf.put_u8(self.owner_type);
            buf.put_u32(self.owner_id);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 5, "get quota request")?;
        Ok(Self {
            owner_type: payload.get_u8(),
            owner_id: payload.get_u32(),
            cred: WireCred::decode(payload)?,
        })
    }
}

/// Limits and usage counters of one quota owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaReply {
    pub status: Status,
    pub inodes_soft_limit: u64,
    pub inodes_hard_limit: u64,
    pub bytes_soft_limit: u64,
    pub bytes_hard_limit: u64,
    pub inodes: u64,
    pub bytes: u64,
}

impl QuotaReply {
    pub fn error(status: Status) -> Self {
        Self {
            status,
            inodes_soft_limit: 0,
            inodes_hard_limit: 0,
            bytes_soft_limit: 0,
            bytes_hard_limit: 0,
            inodes: 0,
            bytes: 0,
        }
    }

    pub fn to_packet(&self) -> Packet {
        packet_from!(reply_type(CLTOMA_GET_QUOTA), buf, {
            buf.put_u8(self.status as u8);
            if self.status.is_ok() {
                buf.put_u64(self.inodes_soft_limit);
                buf.put_u64(self.inodes_hard_limit);
                buf.put_u64(self.bytes_soft_limit);
                buf.put_u64(self.bytes_hard_limit);
                buf.put_u64(self.inodes);
                buf.put_u64(self.bytes);
            }
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 1, "status")?;
        let status = Status::from_u8(payload.get_u8())?;
        if !status.is_ok() {
            return Ok(Self::error(status));
        }
        need(payload, 48, "quota reply")?;
        Ok(Self {
            status,
            inodes_soft_limit: payload.get_u64(),
            inodes_hard_limit: payload.get_u64(),
            bytes_soft_limit: payload.get_u64(),
            bytes_hard_limit: payload.get_u64(),
            inodes: payload.get_u64(),
            bytes: payload.get_u64(),
        })
    }
}

/// A flock or POSIX range lock operation. The owner tuple mirrors the
/// master's lock tables; flock requests ignore `start`/`end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockRequest {
    pub msg_type: u32,
    pub inode: u32,
    pub start: u64,
    pub end: u64,
    pub owner: u64,
    pub session_id: u32,
    pub reqid: u32,
    pub msgid: u32,
    pub op: u16,
    pub nonblocking: bool,
    pub cred: WireCred,
}

impl LockRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(self.msg_type, buf, {
            buf.put_u32(self.inode);
            buf.put_u64(self.start);
            buf.put_u64(self.end);
            buf.put_u64(self.owner);
            buf.put_u32(self.session_id);
            buf.put_u32(self.reqid);
            buf.put_u32(self.msgid);
            buf.put_u16(self.op);
            buf.put_u8(self.nonblocking as u8);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(msg_type: u32, payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 43, "lock request")?;
        Ok(Self {
            msg_type,
            inode: payload.get_u32(),
            start: payload.get_u64(),
            end: payload.get_u64(),
            owner: payload.get_u64(),
            session_id: payload.get_u32(),
            reqid: payload.get_u32(),
            msgid: payload.get_u32(),
            op: payload.get_u16(),
            nonblocking: payload.get_u8() != 0,
            cred: WireCred::decode(payload)?,
        })
    }
}

/// Lock outcome: `Ok` means applied, `Waiting` means denied (nonblocking)
/// or queued (blocking). Owners whose pending locks were applied by this
/// operation are reported so the caller can wake them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockReply {
    pub msg_type: u32,
    pub status: Status,
    pub applied: Vec<(u64, u32)>,
}

impl LockReply {
    pub fn to_packet(&self) -> Packet {
        packet_from!(self.msg_type, buf, {
            buf.put_u8(self.status as u8);
            buf.put_u32(self.applied.len() as u32);
            for (owner, session_id) in &self.applied {
                buf.put_u64(*owner);
                buf.put_u32(*session_id);
            }
        })
    }

    pub fn decode(msg_type: u32, payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 5, "lock reply")?;
        let status = Status::from_u8(payload.get_u8())?;
        let count = payload.get_u32() as usize;
        let mut applied = Vec::with_capacity(count);
        for _ in 0..count {
            need(payload, 12, "applied owner")?;
            applied.push((payload.get_u64(), payload.get_u32()));
        }
        Ok(Self {
            msg_type,
            status,
            applied,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockProbeRequest {
    pub inode: u32,
    pub flock: bool,
    pub exclusive: bool,
    pub start: u64,
    pub end: u64,
    pub owner: u64,
    pub session_id: u32,
    pub cred: WireCred,
}

impl LockProbeRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOMA_LOCK_PROBE, buf, {
            buf.put_u32(self.inode);
            buf.put_u8(self.flock as u8);
            buf.put_u8(self.exclusive as u8);
            buf.put_u64(self.start);
            buf.put_u64(self.end);
            buf.put_u64(self.owner);
            buf.put_u32(self.session_id);
            self.cred.encode(&mut buf);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 34, "lock probe request")?;
        Ok(Self {
            inode: payload.get_u32(),
            flock: payload.get_u8() != 0,
            exclusive: payload.get_u8() != 0,
            start: payload.get_u64(),
            end: payload.get_u64(),
            owner: payload.get_u64(),
            session_id: payload.get_u32(),
            cred: WireCred::decode(payload)?,
        })
    }
}

/// `Ok` with zeroed fields when the probe found no collision; `Waiting`
/// with the first colliding lock otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockProbeReply {
    pub status: Status,
    pub kind: u8,
    pub start: u64,
    pub end: u64,
    pub owner: u64,
    pub session_id: u32,
}

impl LockProbeReply {
    pub fn free() -> Self {
        Self {
            status: Status::Ok,
            kind: 0,
            start: 0,
            end: 0,
            owner: 0,
            session_id: 0,
        }
    }

    pub fn to_packet(&self) -> Packet {
        packet_from!(reply_type(CLTOMA_LOCK_PROBE), buf, {
            buf.put_u8(self.status as u8);
            buf.put_u8(self.kind);
            buf.put_u64(self.start);
            buf.put_u64(self.end);
            buf.put_u64(self.owner);
            buf.put_u32(self.session_id);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 30, "lock probe reply")?;
        Ok(Self {
            status: Status::from_u8(payload.get_u8())?,
            kind: payload.get_u8(),
            start: payload.get_u64(),
            end: payload.get_u64(),
            owner: payload.get_u64(),
            session_id: payload.get_u32(),
        })
    }
}

// ========== client <-> chunkserver ==========

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CsReadRequest {
    pub chunk_id: u64,
    pub version: u32,
    pub part_type: ChunkPartType,
    pub offset: u32,
    pub size: u32,
}

impl CsReadRequest {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOCS_READ, buf, {
            buf.put_u64(self.chunk_id);
            buf.put_u32(self.version);
            self.part_type.encode(&mut buf);
            buf.put_u32(self.offset);
            buf.put_u32(self.size);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 12, "read request")?;
        let chunk_id = payload.get_u64();
        let version = payload.get_u32();
        let part_type = ChunkPartType::decode(payload)?;
        need(payload, 8, "read request range")?;
        Ok(Self {
            chunk_id,
            version,
            part_type,
            offset: payload.get_u32(),
            size: payload.get_u32(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CsReadData {
    pub chunk_id: u64,
    pub offset: u32,
    pub data: Bytes,
}

impl CsReadData {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CSTOCL_READ_DATA, buf, {
            buf.put_u64(self.chunk_id);
            buf.put_u32(self.offset);
            put_bytes(&mut buf, &self.data);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 12, "read data header")?;
        let chunk_id = payload.get_u64();
        let offset = payload.get_u32();
        let data = Bytes::from(get_bytes(payload)?);
        Ok(Self {
            chunk_id,
            offset,
            data,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CsReadStatus {
    pub chunk_id: u64,
    pub status: Status,
}

impl CsReadStatus {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CSTOCL_READ_STATUS, buf, {
            buf.put_u64(self.chunk_id);
            buf.put_u8(self.status as u8);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 9, "read status")?;
        Ok(Self {
            chunk_id: payload.get_u64(),
            status: Status::from_u8(payload.get_u8())?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CsWriteInit {
    pub chunk_id: u64,
    pub version: u32,
    pub part_type: ChunkPartType,
    /// Remaining chain: servers this chunkserver must forward writes to.
    pub chain: Vec<ChunkTypeWithAddress>,
}

impl CsWriteInit {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOCS_WRITE_INIT, buf, {
            buf.put_u64(self.chunk_id);
            buf.put_u32(self.version);
            self.part_type.encode(&mut buf);
            buf.put_u32(self.chain.len() as u32);
            for link in &self.chain {
                link.encode(&mut buf);
            }
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 12, "write init")?;
        let chunk_id = payload.get_u64();
        let version = payload.get_u32();
        let part_type = ChunkPartType::decode(payload)?;
        need(payload, 4, "chain length")?;
        let count = payload.get_u32() as usize;
        let mut chain = Vec::with_capacity(count);
        for _ in 0..count {
            chain.push(ChunkTypeWithAddress::decode(payload)?);
        }
        Ok(Self {
            chunk_id,
            version,
            part_type,
            chain,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CsWriteData {
    pub chunk_id: u64,
    pub write_id: u32,
    pub block: u16,
    pub offset: u16,
    pub data: Bytes,
}

impl CsWriteData {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CLTOCS_WRITE_DATA, buf, {
            buf.put_u64(self.chunk_id);
            buf.put_u32(self.write_id);
            buf.put_u16(self.block);
            buf.put_u16(self.offset);
            put_bytes(&mut buf, &self.data);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 16, "write data header")?;
        let chunk_id = payload.get_u64();
        let write_id = payload.get_u32();
        let block = payload.get_u16();
        let offset = payload.get_u16();
        let data = Bytes::from(get_bytes(payload)?);
        Ok(Self {
            chunk_id,
            write_id,
            block,
            offset,
            data,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CsWriteStatus {
    pub chunk_id: u64,
    pub write_id: u32,
    pub status: Status,
}

impl CsWriteStatus {
    pub fn to_packet(&self) -> Packet {
        packet_from!(CSTOCL_WRITE_STATUS, buf, {
            buf.put_u64(self.chunk_id);
            buf.put_u32(self.write_id);
            buf.put_u8(self.status as u8);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 13, "write status")?;
        Ok(Self {
            chunk_id: payload.get_u64(),
            write_id: payload.get_u32(),
            status: Status::from_u8(payload.get_u8())?,
        })
    }
}

// ========== master <-> chunkserver ==========

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicateChunk {
    pub chunk_id: u64,
    pub version: u32,
    pub part_type: ChunkPartType,
    pub sources: Vec<ChunkTypeWithAddress>,
}

impl ReplicateChunk {
    pub fn to_packet(&self) -> Packet {
        packet_from!(MATOCS_REPLICATE, buf, {
            buf.put_u64(self.chunk_id);
            buf.put_u32(self.version);
            self.part_type.encode(&mut buf);
            buf.put_u32(self.sources.len() as u32);
            for source in &self.sources {
                source.encode(&mut buf);
            }
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 12, "replicate chunk")?;
        let chunk_id = payload.get_u64();
        let version = payload.get_u32();
        let part_type = ChunkPartType::decode(payload)?;
        need(payload, 4, "source count")?;
        let count = payload.get_u32() as usize;
        let mut sources = Vec::with_capacity(count);
        for _ in 0..count {
            sources.push(ChunkTypeWithAddress::decode(payload)?);
        }
        Ok(Self {
            chunk_id,
            version,
            part_type,
            sources,
        })
    }
}

// ========== metalogger / shadow <-> master ==========

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShadowRegister {
    pub last_meta_version: u64,
}

impl ShadowRegister {
    pub fn to_packet(&self) -> Packet {
        packet_from!(MLTOMA_REGISTER, buf, {
            buf.put_u64(self.last_meta_version);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 8, "shadow register")?;
        Ok(Self {
            last_meta_version: payload.get_u64(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangelogLine {
    pub meta_version: u64,
    pub line: String,
}

impl ChangelogLine {
    pub fn to_packet(&self) -> Packet {
        packet_from!(MATOML_CHANGELOG_LINE, buf, {
            buf.put_u64(self.meta_version);
            put_string(&mut buf, &self.line);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 8, "changelog line")?;
        Ok(Self {
            meta_version: payload.get_u64(),
            line: get_string(payload)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChecksumAnnouncement {
    pub meta_version: u64,
    pub checksum: u64,
}

impl ChecksumAnnouncement {
    pub fn to_packet(&self) -> Packet {
        packet_from!(MATOML_CHECKSUM, buf, {
            buf.put_u64(self.meta_version);
            buf.put_u64(self.checksum);
        })
    }

    pub fn decode(payload: &mut Bytes) -> ProtoResult<Self> {
        need(payload, 16, "checksum announcement")?;
        Ok(Self {
            meta_version: payload.get_u64(),
            checksum: payload.get_u64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NetworkAddress;

    fn location(ip: u32, port: u16, part_type: ChunkPartType) -> ChunkTypeWithAddress {
        ChunkTypeWithAddress {
            address: NetworkAddress::new(ip, port),
            part_type,
            chunkserver_version: 1,
        }
    }

    #[test]
    fn name_request_round_trip() {
        let request = NameRequest {
            msg_type: CLTOMA_LOOKUP,
            parent: 1,
            name: "passwd".to_string(),
            cred: WireCred { uid: 1000, gid: 100 },
        };
        let packet = request.to_packet();
        assert_eq!(packet.msg_type, CLTOMA_LOOKUP);
        let mut payload = packet.payload.clone();
        assert_eq!(
            NameRequest::decode(packet.msg_type, &mut payload).unwrap(),
            request
        );
    }

    #[test]
    fn entry_reply_error_has_no_body() {
        let reply = EntryReply::error(reply_type(CLTOMA_LOOKUP), Status::ENoEnt);
        let packet = reply.to_packet();
        assert_eq!(packet.payload.len(), 1);
        let mut payload = packet.payload.clone();
        let decoded = EntryReply::decode(packet.msg_type, &mut payload).unwrap();
        assert_eq!(decoded.status, Status::ENoEnt);
    }

    #[test]
    fn chunk_location_reply_round_trip() {
        let reply = ChunkLocationReply {
            msg_type: reply_type(CLTOMA_WRITE_CHUNK),
            status: Status::Ok,
            file_length: 10,
            chunk_id: 77,
            version: 3,
            lock_id: 9,
            locations: vec![
                location(0x0a000001, 9422, ChunkPartType::Xor { level: 3, piece: 1 }),
                location(0x0a000002, 9422, ChunkPartType::Xor { level: 3, piece: 4 }),
            ],
        };
        let mut payload = reply.to_packet().payload;
        assert_eq!(
            ChunkLocationReply::decode(reply.msg_type, &mut payload).unwrap(),
            reply
        );
    }

    #[test]
    fn write_data_round_trip() {
        let message = CsWriteData {
            chunk_id: 5,
            write_id: 42,
            block: 17,
            offset: 128,
            data: Bytes::from_static(b"HelloWorld"),
        };
        let mut payload = message.to_packet().payload;
        assert_eq!(CsWriteData::decode(&mut payload).unwrap(), message);
    }

    #[test]
    fn replicate_round_trip() {
        let message = ReplicateChunk {
            chunk_id: 123,
            version: 7,
            part_type: ChunkPartType::xor_parity(3).unwrap(),
            sources: vec![location(1, 2, ChunkPartType::Standard)],
        };
        let mut payload = message.to_packet().payload;
        assert_eq!(ReplicateChunk::decode(&mut payload).unwrap(), message);
    }

    #[test]
    fn lock_request_round_trip() {
        let request = LockRequest {
            msg_type: CLTOMA_POSIX_LOCK,
            inode: 9,
            start: 100,
            end: 200,
            owner: 0xdead,
            session_id: 3,
            reqid: 4,
            msgid: 5,
            op: LOCK_OP_EXCLUSIVE,
            nonblocking: true,
            cred: WireCred { uid: 1, gid: 2 },
        };
        let mut payload = request.to_packet().payload;
        assert_eq!(
            LockRequest::decode(CLTOMA_POSIX_LOCK, &mut payload).unwrap(),
            request
        );
    }

    #[test]
    fn lock_reply_carries_applied_owners() {
        let reply = LockReply {
            msg_type: reply_type(CLTOMA_FLOCK),
            status: Status::Ok,
            applied: vec![(7, 1), (8, 2)],
        };
        let mut payload = reply.to_packet().payload;
        assert_eq!(
            LockReply::decode(reply.msg_type, &mut payload).unwrap(),
            reply
        );
    }

    #[test]
    fn quota_messages_round_trip() {
        let request = SetQuotaRequest {
            owner_type: QUOTA_OWNER_GROUP,
            owner_id: 50,
            rigor: QUOTA_RIGOR_HARD,
            resource: QUOTA_RESOURCE_BYTES,
            limit: 1 << 30,
            cred: WireCred { uid: 0, gid: 0 },
        };
        let mut payload = request.to_packet().payload;
        assert_eq!(SetQuotaRequest::decode(&mut payload).unwrap(), request);

        let reply = QuotaReply {
            status: Status::Ok,
            inodes_soft_limit: 1,
            inodes_hard_limit: 2,
            bytes_soft_limit: 3,
            bytes_hard_limit: 4,
            inodes: 5,
            bytes: 6,
        };
        let mut payload = reply.to_packet().payload;
        assert_eq!(QuotaReply::decode(&mut payload).unwrap(), reply);
    }

    #[test]
    fn xattr_messages_round_trip() {
        let request = SetXattrRequest {
            inode: 4,
            name: "user.tag".to_string(),
            value: vec![0, 1, 2],
            mode: 1,
            cred: WireCred::default(),
        };
        let mut payload = request.to_packet().payload;
        assert_eq!(SetXattrRequest::decode(&mut payload).unwrap(), request);

        let reply = XattrListReply {
            status: Status::Ok,
            names: vec!["user.a".to_string(), "user.b".to_string()],
        };
        let mut payload = reply.to_packet().payload;
        assert_eq!(XattrListReply::decode(&mut payload).unwrap(), reply);
    }

    #[test]
    fn histogram_reply_round_trip() {
        let reply = AttrHistogramReply {
            msg_type: reply_type(CLTOMA_GETGOAL),
            status: Status::Ok,
            entries: vec![(2, 10, 3), (0x13, 1, 0)],
        };
        let mut payload = reply.to_packet().payload;
        assert_eq!(
            AttrHistogramReply::decode(reply.msg_type, &mut payload).unwrap(),
            reply
        );
    }

    #[test]
    fn changelog_line_round_trip() {
        let message = ChangelogLine {
            meta_version: 991,
            line: "991|12|CREATE(1,f,f,420,0,0,0):5".to_string(),
        };
        let mut payload = message.to_packet().payload;
        assert_eq!(ChangelogLine::decode(&mut payload).unwrap(), message);
    }
}
