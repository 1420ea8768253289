//! Master TCP service and the shadow follower. The metadata graph lives
//! behind one mutex and every request handler takes it for the duration of
//! its mutation, so observed changelog order is observed mutation order.
//! Shadows and metaloggers register over the same port and are fed the
//! changelog stream; a periodic tick drives the task manager, the trash
//! sweep, and checksum announcements.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};

use wire_proto::{
    read_packet, reply_type, write_packet, AclTextReply, AclVariantRequest, AppendRequest,
    AttrHistogramReply, ChangelogLine, ChunkLocationReply, ChunkTypeWithAddress, CountersReply,
    DetachedListReply, DirEntry, EntryReply, GetQuotaRequest, GetXattrRequest, InodeRequest,
    LockProbeRequest, LockProbeReply, LockRequest, LockReply, MkdirRequest, MknodRequest,
    NameRequest, NetworkAddress, OpenRequest, Packet, PathReply, QuotaReply, ReaddirReply,
    RegisterSession, RegisterSessionReply, ReleaseRequest, RenameRequest, RepairReply,
    SetAclRequest, SetEattrRequest, SetGoalRequest, SetQuotaRequest, SetTrashtimeRequest,
    SetXattrRequest, SetattrRequest, ShadowRegister, StatfsReply, Status, StatusReply,
    SubtreeQueryRequest, TruncateRequest, WriteChunkEnd, WriteChunkRequest, XattrListReply,
    XattrValueReply, CLTOMA_APPEND, CLTOMA_DELETEACL, CLTOMA_FLOCK, CLTOMA_GETACL,
    CLTOMA_GETATTR, CLTOMA_GETEATTR, CLTOMA_GETGOAL, CLTOMA_GETTRASHTIME, CLTOMA_GETXATTR,
    CLTOMA_GET_QUOTA, CLTOMA_LISTXATTR, CLTOMA_LOCK_PROBE, CLTOMA_LOOKUP, CLTOMA_MKDIR,
    CLTOMA_MKNOD, CLTOMA_OPEN, CLTOMA_POSIX_LOCK, CLTOMA_PURGE, CLTOMA_READDIR,
    CLTOMA_READLINK, CLTOMA_READ_CHUNK, CLTOMA_READ_RESERVED, CLTOMA_READ_TRASH,
    CLTOMA_REGISTER_SESSION, CLTOMA_RELEASE, CLTOMA_RENAME, CLTOMA_REPAIR, CLTOMA_RMDIR,
    CLTOMA_SETACL, CLTOMA_SETATTR, CLTOMA_SETEATTR, CLTOMA_SETGOAL, CLTOMA_SETTRASHTIME,
    CLTOMA_SETXATTR, CLTOMA_SET_QUOTA, CLTOMA_STATFS, CLTOMA_SYMLINK, CLTOMA_TRUNCATE,
    CLTOMA_UNDEL, CLTOMA_UNLINK, CLTOMA_WRITE_CHUNK, CLTOMA_WRITE_CHUNK_END, LOCK_KIND_EXCLUSIVE,
    LOCK_KIND_SHARED, MLTOMA_REGISTER, QUOTA_OWNER_GROUP, QUOTA_OWNER_USER,
    QUOTA_RESOURCE_BYTES, QUOTA_RESOURCE_INODES, QUOTA_RIGOR_HARD, QUOTA_RIGOR_SOFT,
};

use crate::goal::Goal;
use crate::locks::{LockKind, LockOwner};
use crate::metadata::FsMetadata;
use crate::node::{AccessControlList, AclVariant, InodeId, ROOT_INODE};
use crate::ops::{LockOp, SugidClearMode, TruncateOutcome, SMODE_RECURSIVE};
use crate::quota::{QuotaOwnerType, QuotaResource, QuotaRigor};
use crate::tasks::{TaskManager, TrashSweepTask};
use crate::{FsContext, FsError, FsResult};

fn quota_owner_type(selector: u8) -> FsResult<QuotaOwnerType> {
    match selector {
        QUOTA_OWNER_USER => Ok(QuotaOwnerType::User),
        QUOTA_OWNER_GROUP => Ok(QuotaOwnerType::Group),
        _ => Err(FsError::Inval),
    }
}

fn quota_rigor(selector: u8) -> FsResult<QuotaRigor> {
    match selector {
        QUOTA_RIGOR_SOFT => Ok(QuotaRigor::Soft),
        QUOTA_RIGOR_HARD => Ok(QuotaRigor::Hard),
        _ => Err(FsError::Inval),
    }
}

fn quota_resource(selector: u8) -> FsResult<QuotaResource> {
    match selector {
        QUOTA_RESOURCE_INODES => Ok(QuotaResource::Inodes),
        QUOTA_RESOURCE_BYTES => Ok(QuotaResource::Size),
        _ => Err(FsError::Inval),
    }
}

pub fn now_ts() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

// ========== chunkserver database ==========

#[derive(Clone, Copy, Debug)]
pub struct ChunkserverEntry {
    pub address: NetworkAddress,
    pub version: u32,
    pub total_space: u64,
    pub used_space: u64,
    pub connected: bool,
}

/// Registry of chunkservers known to the master; used for space reporting
/// and for picking the targets of new chunk parts.
#[derive(Default)]
pub struct ChunkserverDb {
    servers: BTreeMap<NetworkAddress, ChunkserverEntry>,
    next_pick: usize,
}

impl ChunkserverDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the server was already registered and connected.
    pub fn register(&mut self, address: NetworkAddress, version: u32) -> bool {
        let entry = self.servers.entry(address).or_insert(ChunkserverEntry {
            address,
            version,
            total_space: 0,
            used_space: 0,
            connected: false,
        });
        if entry.connected {
            return false;
        }
        entry.connected = true;
        entry.version = version;
        true
    }

    pub fn lost_connection(&mut self, address: NetworkAddress) {
        if let Some(entry) = self.servers.get_mut(&address) {
            entry.connected = false;
        }
    }

    pub fn update_space(&mut self, address: NetworkAddress, total: u64, used: u64) {
        if let Some(entry) = self.servers.get_mut(&address) {
            entry.total_space = total;
            entry.used_space = used;
        }
    }

    pub fn list(&self) -> Vec<ChunkserverEntry> {
        self.servers.values().copied().collect()
    }

    pub fn space(&self) -> (u64, u64) {
        let mut total = 0;
        let mut avail = 0;
        for entry in self.servers.values().filter(|e| e.connected) {
            total += entry.total_space;
            avail += entry.total_space.saturating_sub(entry.used_space);
        }
        (total, avail)
    }

    /// Assign each part of a goal to a connected chunkserver, round-robin,
    /// distinct servers while enough are available.
    pub fn place_goal(&mut self, goal: &Goal) -> Vec<ChunkTypeWithAddress> {
        let connected: Vec<&ChunkserverEntry> =
            self.servers.values().filter(|e| e.connected).collect();
        if connected.is_empty() {
            return Vec::new();
        }
        let mut locations = Vec::new();
        for part_type in goal.parts() {
            let entry = connected[self.next_pick % connected.len()];
            self.next_pick = self.next_pick.wrapping_add(1);
            locations.push(ChunkTypeWithAddress {
                address: entry.address,
                part_type,
                chunkserver_version: entry.version,
            });
        }
        locations
    }
}

// ========== per-operation statistics ==========

/// Request counters owned by the server instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpStatistics {
    pub statfs: u32,
    pub getattr: u32,
    pub setattr: u32,
    pub lookup: u32,
    pub mkdir: u32,
    pub rmdir: u32,
    pub symlink: u32,
    pub readlink: u32,
    pub mknod: u32,
    pub unlink: u32,
    pub rename: u32,
    pub link: u32,
    pub readdir: u32,
    pub open: u32,
    pub read: u32,
    pub write: u32,
}

impl OpStatistics {
    pub fn snapshot_and_reset(&mut self) -> OpStatistics {
        std::mem::take(self)
    }
}

// ========== the server ==========

/// Emit a CHECKSUM record after this many mutations.
const CHECKSUM_EVERY_VERSIONS: u64 = 1000;
const TICK_INTERVAL: Duration = Duration::from_secs(1);
const TASK_ROUNDS_PER_TICK: usize = 16;

pub struct MasterServer {
    fs: Arc<Mutex<FsMetadata>>,
    tasks: Arc<Mutex<TaskManager>>,
    pub csdb: Arc<Mutex<ChunkserverDb>>,
    pub stats: Arc<Mutex<OpStatistics>>,
}

impl MasterServer {
    pub fn new(fs: FsMetadata) -> Self {
        Self {
            fs: Arc::new(Mutex::new(fs)),
            tasks: Arc::new(Mutex::new(TaskManager::new())),
            csdb: Arc::new(Mutex::new(ChunkserverDb::new())),
            stats: Arc::new(Mutex::new(OpStatistics::default())),
        }
    }

    pub fn fs(&self) -> Arc<Mutex<FsMetadata>> {
        self.fs.clone()
    }

    /// Accept loop plus the periodic tick. Runs until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> FsResult<()> {
        let ticker = self.clone();
        tokio::spawn(async move {
            let mut last_checksum_version = 0u64;
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                ticker.tick(&mut last_checksum_version);
            }
        });

        info!("master listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("connection from {}", peer);
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = server.handle_connection(stream).await {
                    debug!("connection from {} closed: {}", peer, err);
                }
            });
        }
    }

    /// One scheduler turn: task batches, trash sweep, periodic checksum.
    pub fn tick(&self, last_checksum_version: &mut u64) {
        let ts = now_ts();
        let ctx = FsContext::master(ts, 0, 0);
        let mut fs = self.fs.lock().unwrap();
        let mut tasks = self.tasks.lock().unwrap();
        tasks.process(&mut fs, &ctx, TASK_ROUNDS_PER_TICK);
        tasks.submit(Box::new(TrashSweepTask::new()), None);
        tasks.process(&mut fs, &ctx, 1);
        if fs.metaversion >= *last_checksum_version + CHECKSUM_EVERY_VERSIONS {
            fs.emit_checksum(ts);
            *last_checksum_version = fs.metaversion;
        }
        if let Err(err) = fs.changelog_mut().flush() {
            warn!("changelog flush failed: {}", err);
        }
    }

    pub fn task_manager(&self) -> Arc<Mutex<TaskManager>> {
        self.tasks.clone()
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> FsResult<()> {
        loop {
            let packet = read_packet(&mut stream)
                .await
                .map_err(|err| FsError::Io(err.to_string()))?;
            if packet.msg_type == MLTOMA_REGISTER {
                return self.feed_shadow(stream, packet).await;
            }
            let reply = self.dispatch(packet);
            write_packet(&mut stream, &reply)
                .await
                .map_err(|err| FsError::Io(err.to_string()))?;
        }
    }

    /// Stream the changelog to a registered shadow/metalogger, starting
    /// with the backlog after its last known version.
    async fn feed_shadow(&self, mut stream: TcpStream, packet: Packet) -> FsResult<()> {
        let mut payload = packet.payload;
        let register = ShadowRegister::decode(&mut payload)
            .map_err(|err| FsError::Io(err.to_string()))?;
        info!(
            "shadow registered at version {}",
            register.last_meta_version
        );
        let (backlog, mut rx) = {
            let fs = self.fs.lock().unwrap();
            (
                fs.changelog.lines_after(register.last_meta_version),
                fs.changelog.subscribe(),
            )
        };
        let mut last_sent = register.last_meta_version;
        for (version, line) in backlog {
            let message = ChangelogLine {
                meta_version: version,
                line,
            };
            write_packet(&mut stream, &message.to_packet())
                .await
                .map_err(|err| FsError::Io(err.to_string()))?;
            last_sent = version;
        }
        loop {
            let (version, line) = rx
                .recv()
                .await
                .map_err(|err| FsError::Io(format!("changelog feed lagged: {}", err)))?;
            if version <= last_sent {
                continue;
            }
            let message = ChangelogLine {
                meta_version: version,
                line,
            };
            write_packet(&mut stream, &message.to_packet())
                .await
                .map_err(|err| FsError::Io(err.to_string()))?;
            last_sent = version;
        }
    }

    fn dispatch(&self, packet: Packet) -> Packet {
        let msg_type = packet.msg_type;
        let mut payload = packet.payload;
        let result = self.dispatch_inner(msg_type, &mut payload);
        match result {
            Ok(reply) => reply,
            Err(err) => StatusReply {
                msg_type: reply_type(msg_type),
                status: err.to_status(),
            }
            .to_packet(),
        }
    }

    fn dispatch_inner(
        &self,
        msg_type: u32,
        payload: &mut bytes::Bytes,
    ) -> FsResult<Packet> {
        let ts = now_ts();
        match msg_type {
            CLTOMA_REGISTER_SESSION => {
                let request = RegisterSession::decode(payload)?;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, 0, 0);
                let session_id = fs.new_session(&ctx);
                // The mount may ask for a subfolder as its root.
                let root_inode = if request.subfolder.is_empty() || request.subfolder == "/" {
                    ROOT_INODE
                } else {
                    let mut inode = ROOT_INODE;
                    for segment in request.subfolder.split('/').filter(|s| !s.is_empty()) {
                        inode = fs.lookup_child(inode, segment)?;
                    }
                    inode
                };
                info!(
                    "session {} registered for mountpoint {}",
                    session_id, request.mountpoint
                );
                Ok(RegisterSessionReply {
                    status: Status::Ok,
                    session_id,
                    root_inode,
                }
                .to_packet())
            }
            CLTOMA_LOOKUP => {
                let request = NameRequest::decode(msg_type, payload)?;
                self.stats.lock().unwrap().lookup += 1;
                let fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                let reply = match fs
                    .lookup(&ctx, request.parent, &request.name)
                    .and_then(|inode| Ok((inode, fs.attr(inode)?)))
                {
                    Ok((inode, attr)) => EntryReply {
                        msg_type: reply_type(msg_type),
                        status: Status::Ok,
                        inode,
                        attr,
                    },
                    Err(err) => EntryReply::error(reply_type(msg_type), err.to_status()),
                };
                Ok(reply.to_packet())
            }
            CLTOMA_GETATTR => {
                let request = InodeRequest::decode(msg_type, payload)?;
                self.stats.lock().unwrap().getattr += 1;
                let fs = self.fs.lock().unwrap();
                Ok(self.entry_reply(&fs, msg_type, request.inode))
            }
            CLTOMA_SETATTR => {
                let request = SetattrRequest::decode(payload)?;
                self.stats.lock().unwrap().setattr += 1;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                let sugid = match request.sugid_clear_mode {
                    0 => SugidClearMode::Never,
                    1 => SugidClearMode::Always,
                    2 => SugidClearMode::Osx,
                    3 => SugidClearMode::Bsd,
                    4 => SugidClearMode::Ext,
                    _ => SugidClearMode::Xfs,
                };
                fs.setattr(
                    &ctx,
                    request.inode,
                    request.setmask,
                    request.mode,
                    request.uid,
                    request.gid,
                    request.atime,
                    request.mtime,
                    sugid,
                )?;
                Ok(self.entry_reply(&fs, msg_type, request.inode))
            }
            CLTOMA_MKNOD => {
                let request = MknodRequest::decode(payload)?;
                self.stats.lock().unwrap().mknod += 1;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                let inode = fs.mknod(
                    &ctx,
                    request.parent,
                    &request.name,
                    request.kind as char,
                    request.mode,
                    request.umask,
                    request.rdev,
                )?;
                Ok(self.entry_reply(&fs, msg_type, inode))
            }
            CLTOMA_MKDIR => {
                let request = MkdirRequest::decode(payload)?;
                self.stats.lock().unwrap().mkdir += 1;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                let inode = fs.mkdir(
                    &ctx,
                    request.parent,
                    &request.name,
                    request.mode,
                    request.umask,
                )?;
                Ok(self.entry_reply(&fs, msg_type, inode))
            }
            CLTOMA_SYMLINK => {
                let request = wire_proto::SymlinkRequest::decode(payload)?;
                self.stats.lock().unwrap().symlink += 1;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                let inode = fs.symlink(&ctx, request.parent, &request.name, &request.target)?;
                Ok(self.entry_reply(&fs, msg_type, inode))
            }
            CLTOMA_READLINK => {
                let request = InodeRequest::decode(msg_type, payload)?;
                self.stats.lock().unwrap().readlink += 1;
                let fs = self.fs.lock().unwrap();
                let reply = match fs.readlink(request.inode) {
                    Ok(path) => PathReply {
                        msg_type: reply_type(msg_type),
                        status: Status::Ok,
                        path,
                    },
                    Err(err) => PathReply {
                        msg_type: reply_type(msg_type),
                        status: err.to_status(),
                        path: String::new(),
                    },
                };
                Ok(reply.to_packet())
            }
            CLTOMA_UNLINK | CLTOMA_RMDIR => {
                let request = NameRequest::decode(msg_type, payload)?;
                {
                    let mut stats = self.stats.lock().unwrap();
                    if msg_type == CLTOMA_UNLINK {
                        stats.unlink += 1;
                    } else {
                        stats.rmdir += 1;
                    }
                }
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                if msg_type == CLTOMA_UNLINK {
                    fs.unlink(&ctx, request.parent, &request.name)?;
                } else {
                    fs.rmdir(&ctx, request.parent, &request.name)?;
                }
                Ok(StatusReply {
                    msg_type: reply_type(msg_type),
                    status: Status::Ok,
                }
                .to_packet())
            }
            CLTOMA_RENAME => {
                let request = RenameRequest::decode(payload)?;
                self.stats.lock().unwrap().rename += 1;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                let inode = fs.rename(
                    &ctx,
                    request.src_parent,
                    &request.src_name,
                    request.dst_parent,
                    &request.dst_name,
                )?;
                Ok(self.entry_reply(&fs, msg_type, inode))
            }
            wire_proto::CLTOMA_LINK => {
                let request = wire_proto::LinkRequest::decode(payload)?;
                self.stats.lock().unwrap().link += 1;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                fs.link(&ctx, request.inode, request.parent, &request.name)?;
                Ok(self.entry_reply(&fs, msg_type, request.inode))
            }
            CLTOMA_READDIR => {
                let request = InodeRequest::decode(msg_type, payload)?;
                self.stats.lock().unwrap().readdir += 1;
                let fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                let reply = match fs.readdir(&ctx, request.inode) {
                    Ok(entries) => ReaddirReply {
                        status: Status::Ok,
                        entries: entries
                            .into_iter()
                            .map(|(name, inode, kind)| DirEntry {
                                inode,
                                kind: kind as u8,
                                name,
                            })
                            .collect(),
                    },
                    Err(err) => ReaddirReply {
                        status: err.to_status(),
                        entries: Vec::new(),
                    },
                };
                Ok(reply.to_packet())
            }
            CLTOMA_OPEN => {
                let request = OpenRequest::decode(payload)?;
                self.stats.lock().unwrap().open += 1;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                {
                    let node = fs.node(request.inode)?;
                    if request.flags & wire_proto::OPEN_AFTER_CREATE == 0 {
                        let mut mask = 0;
                        if request.flags & wire_proto::OPEN_WANT_READ != 0 {
                            mask |= crate::node::MODE_MASK_R;
                        }
                        if request.flags & wire_proto::OPEN_WANT_WRITE != 0 {
                            mask |= crate::node::MODE_MASK_W;
                        }
                        if !fs.access(node, ctx.uid, ctx.gid, mask) {
                            return Err(FsError::Access);
                        }
                    }
                }
                fs.acquire(&ctx, request.inode, request.session_id)?;
                Ok(self.entry_reply(&fs, msg_type, request.inode))
            }
            CLTOMA_RELEASE => {
                let request = ReleaseRequest::decode(payload)?;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, 0, 0);
                fs.release(&ctx, request.inode, request.session_id)?;
                Ok(StatusReply {
                    msg_type: reply_type(msg_type),
                    status: Status::Ok,
                }
                .to_packet())
            }
            CLTOMA_READ_CHUNK => {
                let request = wire_proto::ReadChunkRequest::decode(payload)?;
                self.stats.lock().unwrap().read += 1;
                let fs = self.fs.lock().unwrap();
                let (chunk_id, version, file_length) =
                    fs.read_chunk(request.inode, request.index)?;
                let goal = Goal::from_id(fs.node(request.inode)?.goal)?;
                drop(fs);
                let locations = if chunk_id == 0 {
                    Vec::new()
                } else {
                    self.csdb.lock().unwrap().place_goal(&goal)
                };
                Ok(ChunkLocationReply {
                    msg_type: reply_type(msg_type),
                    status: Status::Ok,
                    file_length,
                    chunk_id,
                    version,
                    lock_id: 0,
                    locations,
                }
                .to_packet())
            }
            CLTOMA_WRITE_CHUNK => {
                let request = WriteChunkRequest::decode(payload)?;
                self.stats.lock().unwrap().write += 1;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, 0, 0);
                let grant = fs.write_chunk(&ctx, request.inode, request.index, request.lock_id)?;
                let goal = Goal::from_id(fs.node(request.inode)?.goal)?;
                drop(fs);
                let locations = self.csdb.lock().unwrap().place_goal(&goal);
                Ok(ChunkLocationReply {
                    msg_type: reply_type(msg_type),
                    status: Status::Ok,
                    file_length: grant.file_length,
                    chunk_id: grant.chunk_id,
                    version: grant.version,
                    lock_id: grant.lock_id,
                    locations,
                }
                .to_packet())
            }
            CLTOMA_WRITE_CHUNK_END => {
                let request = WriteChunkEnd::decode(payload)?;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, 0, 0);
                fs.write_end(
                    &ctx,
                    request.inode,
                    request.file_length,
                    request.chunk_id,
                    request.lock_id,
                )?;
                Ok(StatusReply {
                    msg_type: reply_type(msg_type),
                    status: Status::Ok,
                }
                .to_packet())
            }
            CLTOMA_TRUNCATE => {
                let request = TruncateRequest::decode(payload)?;
                self.stats.lock().unwrap().setattr += 1;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                match fs.try_truncate(&ctx, request.inode, request.length, request.opened)? {
                    TruncateOutcome::Done => {
                        fs.set_length(&ctx, request.inode, request.length, request.opened)?;
                        Ok(self.entry_reply(&fs, msg_type, request.inode))
                    }
                    TruncateOutcome::Delayed { .. } => Ok(StatusReply {
                        msg_type: reply_type(msg_type),
                        status: Status::Delayed,
                    }
                    .to_packet()),
                }
            }
            CLTOMA_STATFS => {
                self.stats.lock().unwrap().statfs += 1;
                let fs = self.fs.lock().unwrap();
                let (trash_space, _, reserved_space, _, inodes) = fs.statfs();
                drop(fs);
                let (total_space, avail_space) = self.csdb.lock().unwrap().space();
                Ok(StatfsReply {
                    total_space,
                    avail_space,
                    trash_space,
                    reserved_space,
                    inodes,
                }
                .to_packet())
            }
            CLTOMA_SETGOAL => {
                let request = SetGoalRequest::decode(payload)?;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                let counters = fs.setgoal(&ctx, request.inode, request.goal, request.smode)?;
                Ok(CountersReply {
                    msg_type: reply_type(msg_type),
                    status: Status::Ok,
                    changed: counters.changed,
                    not_changed: counters.not_changed,
                    not_permitted: counters.not_permitted,
                }
                .to_packet())
            }
            CLTOMA_SETTRASHTIME => {
                let request = SetTrashtimeRequest::decode(payload)?;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                if request.smode & SMODE_RECURSIVE != 0 {
                    // Large subtrees go through the task manager; the reply
                    // only confirms submission.
                    let root = request.inode;
                    drop(fs);
                    let mut tasks = self.tasks.lock().unwrap();
                    tasks.submit(
                        Box::new(crate::tasks::SubtreeTask::new(
                            crate::tasks::SubtreeUpdate::Trashtime {
                                value: request.trashtime,
                                smode: request.smode & 0x3,
                            },
                            request.cred.uid,
                            vec![root],
                        )),
                        None,
                    );
                    return Ok(CountersReply {
                        msg_type: reply_type(msg_type),
                        status: Status::Ok,
                        changed: 0,
                        not_changed: 0,
                        not_permitted: 0,
                    }
                    .to_packet());
                }
                let counters =
                    fs.settrashtime(&ctx, request.inode, request.trashtime, request.smode)?;
                Ok(CountersReply {
                    msg_type: reply_type(msg_type),
                    status: Status::Ok,
                    changed: counters.changed,
                    not_changed: counters.not_changed,
                    not_permitted: counters.not_permitted,
                }
                .to_packet())
            }
            CLTOMA_READ_TRASH => {
                let fs = self.fs.lock().unwrap();
                let entries = fs
                    .trash_entries()
                    .into_iter()
                    .map(|(inode, entry)| (inode, entry.path.clone()))
                    .collect();
                Ok(DetachedListReply {
                    msg_type: reply_type(msg_type),
                    entries,
                }
                .to_packet())
            }
            CLTOMA_READ_RESERVED => {
                let fs = self.fs.lock().unwrap();
                let entries = fs
                    .reserved_entries()
                    .into_iter()
                    .map(|inode| (inode, String::new()))
                    .collect();
                Ok(DetachedListReply {
                    msg_type: reply_type(msg_type),
                    entries,
                }
                .to_packet())
            }
            CLTOMA_UNDEL => {
                let request = InodeRequest::decode(msg_type, payload)?;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                fs.undel(&ctx, request.inode)?;
                Ok(StatusReply {
                    msg_type: reply_type(msg_type),
                    status: Status::Ok,
                }
                .to_packet())
            }
            CLTOMA_PURGE => {
                let request = InodeRequest::decode(msg_type, payload)?;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                fs.purge(&ctx, request.inode)?;
                Ok(StatusReply {
                    msg_type: reply_type(msg_type),
                    status: Status::Ok,
                }
                .to_packet())
            }
            CLTOMA_SETEATTR => {
                let request = SetEattrRequest::decode(payload)?;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                let counters = fs.seteattr(&ctx, request.inode, request.eattr, request.smode)?;
                Ok(CountersReply {
                    msg_type: reply_type(msg_type),
                    status: Status::Ok,
                    changed: counters.changed,
                    not_changed: counters.not_changed,
                    not_permitted: counters.not_permitted,
                }
                .to_packet())
            }
            CLTOMA_GETGOAL | CLTOMA_GETTRASHTIME | CLTOMA_GETEATTR => {
                let request = SubtreeQueryRequest::decode(msg_type, payload)?;
                let fs = self.fs.lock().unwrap();
                let entries: Vec<(u32, u32, u32)> = match msg_type {
                    CLTOMA_GETGOAL => fs
                        .getgoal_recursive(request.inode, request.recursive)?
                        .into_iter()
                        .map(|(goal, files, dirs)| (goal as u32, files, dirs))
                        .collect(),
                    CLTOMA_GETTRASHTIME => {
                        fs.gettrashtime_recursive(request.inode, request.recursive)?
                    }
                    _ => fs
                        .geteattr_recursive(request.inode, request.recursive)?
                        .into_iter()
                        .map(|(eattr, files, dirs)| (eattr as u32, files, dirs))
                        .collect(),
                };
                Ok(AttrHistogramReply {
                    msg_type: reply_type(msg_type),
                    status: Status::Ok,
                    entries,
                }
                .to_packet())
            }
            CLTOMA_SETXATTR => {
                let request = SetXattrRequest::decode(payload)?;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                fs.setxattr(&ctx, request.inode, &request.name, &request.value, request.mode)?;
                Ok(StatusReply {
                    msg_type: reply_type(msg_type),
                    status: Status::Ok,
                }
                .to_packet())
            }
            CLTOMA_GETXATTR => {
                let request = GetXattrRequest::decode(payload)?;
                let fs = self.fs.lock().unwrap();
                let reply = match fs.getxattr(request.inode, &request.name) {
                    Ok(value) => XattrValueReply {
                        status: Status::Ok,
                        value,
                    },
                    Err(err) => XattrValueReply {
                        status: err.to_status(),
                        value: Vec::new(),
                    },
                };
                Ok(reply.to_packet())
            }
            CLTOMA_LISTXATTR => {
                let request = InodeRequest::decode(msg_type, payload)?;
                let fs = self.fs.lock().unwrap();
                let reply = match fs.listxattr(request.inode) {
                    Ok(names) => XattrListReply {
                        status: Status::Ok,
                        names,
                    },
                    Err(err) => XattrListReply {
                        status: err.to_status(),
                        names: Vec::new(),
                    },
                };
                Ok(reply.to_packet())
            }
            CLTOMA_SETACL => {
                let request = SetAclRequest::decode(payload)?;
                let variant = AclVariant::from_type_char(request.variant as char)
                    .ok_or(FsError::Inval)?;
                let acl = AccessControlList::from_record_string(&request.acl)
                    .ok_or(FsError::Inval)?;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                fs.setacl(&ctx, request.inode, variant, acl)?;
                Ok(StatusReply {
                    msg_type: reply_type(msg_type),
                    status: Status::Ok,
                }
                .to_packet())
            }
            CLTOMA_GETACL => {
                let request = AclVariantRequest::decode(msg_type, payload)?;
                let variant = AclVariant::from_type_char(request.variant as char)
                    .ok_or(FsError::Inval)?;
                let fs = self.fs.lock().unwrap();
                let reply = match fs.getacl(request.inode, variant) {
                    Ok(acl) => AclTextReply {
                        status: Status::Ok,
                        acl: acl.to_record_string(),
                    },
                    Err(err) => AclTextReply {
                        status: err.to_status(),
                        acl: String::new(),
                    },
                };
                Ok(reply.to_packet())
            }
            CLTOMA_DELETEACL => {
                let request = AclVariantRequest::decode(msg_type, payload)?;
                let variant = AclVariant::from_type_char(request.variant as char)
                    .ok_or(FsError::Inval)?;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                fs.deleteacl(&ctx, request.inode, variant)?;
                Ok(StatusReply {
                    msg_type: reply_type(msg_type),
                    status: Status::Ok,
                }
                .to_packet())
            }
            CLTOMA_APPEND => {
                let request = AppendRequest::decode(payload)?;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                fs.append(&ctx, request.inode, request.inode_src)?;
                Ok(StatusReply {
                    msg_type: reply_type(msg_type),
                    status: Status::Ok,
                }
                .to_packet())
            }
            CLTOMA_REPAIR => {
                let request = InodeRequest::decode(msg_type, payload)?;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                let (not_changed, erased, repaired) = fs.repair(&ctx, request.inode)?;
                Ok(RepairReply {
                    status: Status::Ok,
                    not_changed,
                    erased,
                    repaired,
                }
                .to_packet())
            }
            CLTOMA_SET_QUOTA => {
                let request = SetQuotaRequest::decode(payload)?;
                let owner_type = quota_owner_type(request.owner_type)?;
                let rigor = quota_rigor(request.rigor)?;
                let resource = quota_resource(request.resource)?;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                fs.set_quota(&ctx, owner_type, request.owner_id, rigor, resource, request.limit)?;
                Ok(StatusReply {
                    msg_type: reply_type(msg_type),
                    status: Status::Ok,
                }
                .to_packet())
            }
            CLTOMA_GET_QUOTA => {
                let request = GetQuotaRequest::decode(payload)?;
                let owner_type = quota_owner_type(request.owner_type)?;
                let fs = self.fs.lock().unwrap();
                let limits = fs.quota.get(owner_type, request.owner_id).copied();
                let reply = match limits {
                    Some(limits) => QuotaReply {
                        status: Status::Ok,
                        inodes_soft_limit: limits.inodes_soft_limit,
                        inodes_hard_limit: limits.inodes_hard_limit,
                        bytes_soft_limit: limits.bytes_soft_limit,
                        bytes_hard_limit: limits.bytes_hard_limit,
                        inodes: limits.inodes,
                        bytes: limits.bytes,
                    },
                    None => QuotaReply::error(Status::Ok),
                };
                Ok(reply.to_packet())
            }
            CLTOMA_FLOCK | CLTOMA_POSIX_LOCK => {
                let request = LockRequest::decode(msg_type, payload)?;
                let flock = msg_type == CLTOMA_FLOCK;
                let owner = LockOwner {
                    owner: request.owner,
                    sessionid: request.session_id,
                    reqid: request.reqid,
                    msgid: request.msgid,
                };
                let op = LockOp::from_u16(request.op)?;
                let mut fs = self.fs.lock().unwrap();
                let ctx = FsContext::master(ts, request.cred.uid, request.cred.gid);
                let outcome = fs.lock_op(
                    &ctx,
                    flock,
                    request.inode,
                    request.start,
                    request.end,
                    owner,
                    op,
                    request.nonblocking,
                );
                let (status, applied) = match outcome {
                    Ok((true, applied)) => (Status::Ok, applied),
                    Ok((false, applied)) => (Status::Waiting, applied),
                    Err(FsError::Waiting) => (Status::Waiting, Vec::new()),
                    Err(err) => return Err(err),
                };
                Ok(LockReply {
                    msg_type: reply_type(msg_type),
                    status,
                    applied: applied
                        .into_iter()
                        .map(|owner| (owner.owner, owner.sessionid))
                        .collect(),
                }
                .to_packet())
            }
            CLTOMA_LOCK_PROBE => {
                let request = LockProbeRequest::decode(payload)?;
                let owner = LockOwner {
                    owner: request.owner,
                    sessionid: request.session_id,
                    reqid: 0,
                    msgid: 0,
                };
                let fs = self.fs.lock().unwrap();
                let collision = fs.lock_probe(
                    request.flock,
                    request.inode,
                    request.start,
                    request.end,
                    owner,
                    request.exclusive,
                )?;
                let reply = match collision {
                    None => LockProbeReply::free(),
                    Some(lock) => LockProbeReply {
                        status: Status::Waiting,
                        kind: match lock.kind {
                            LockKind::Shared => LOCK_KIND_SHARED,
                            LockKind::Exclusive => LOCK_KIND_EXCLUSIVE,
                        },
                        start: lock.start,
                        end: lock.end,
                        owner: lock.owner.owner,
                        session_id: lock.owner.sessionid,
                    },
                };
                Ok(reply.to_packet())
            }
            other => {
                warn!("unhandled message type {}", other);
                Err(FsError::Inval)
            }
        }
    }

    fn entry_reply(&self, fs: &FsMetadata, msg_type: u32, inode: InodeId) -> Packet {
        let reply = match fs.attr(inode) {
            Ok(attr) => EntryReply {
                msg_type: reply_type(msg_type),
                status: Status::Ok,
                inode,
                attr,
            },
            Err(err) => EntryReply::error(reply_type(msg_type), err.to_status()),
        };
        reply.to_packet()
    }
}

// ========== shadow replica ==========

/// Consumes the master's changelog stream and applies it to a local
/// metadata copy. A `Mismatch` (or checksum failure) is fatal: the caller
/// must resync from a fresh snapshot.
pub struct ShadowReplica {
    pub fs: FsMetadata,
}

impl ShadowReplica {
    pub fn new(fs: FsMetadata) -> Self {
        Self { fs }
    }

    pub async fn follow(&mut self, mut stream: TcpStream, max_lines: Option<u64>) -> FsResult<u64> {
        let register = ShadowRegister {
            last_meta_version: self.fs.metaversion.saturating_sub(1),
        };
        write_packet(&mut stream, &register.to_packet())
            .await
            .map_err(|err| FsError::Io(err.to_string()))?;
        let mut applied = 0u64;
        loop {
            if let Some(limit) = max_lines {
                if applied >= limit {
                    return Ok(applied);
                }
            }
            let packet = read_packet(&mut stream)
                .await
                .map_err(|err| FsError::Io(err.to_string()))?;
            if packet.msg_type != wire_proto::MATOML_CHANGELOG_LINE {
                continue;
            }
            let mut payload = packet.payload;
            let message = ChangelogLine::decode(&mut payload)
                .map_err(|err| FsError::Io(err.to_string()))?;
            self.fs.apply_line(&message.line)?;
            applied += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use wire_proto::WireCred;

    async fn start_master() -> (Arc<MasterServer>, std::net::SocketAddr) {
        let server = Arc::new(MasterServer::new(FsMetadata::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = server.clone();
        tokio::spawn(async move {
            let _ = serving.serve(listener).await;
        });
        (server, addr)
    }

    async fn call(stream: &mut TcpStream, packet: Packet) -> Packet {
        write_packet(stream, &packet).await.unwrap();
        read_packet(stream).await.unwrap()
    }

    #[tokio::test]
    async fn mkdir_lookup_over_the_wire() {
        let (_server, addr) = start_master().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let reply = call(
            &mut stream,
            RegisterSession {
                mountpoint: "/mnt/test".to_string(),
                subfolder: String::new(),
            }
            .to_packet(),
        )
        .await;
        let mut payload = reply.payload;
        let session = RegisterSessionReply::decode(&mut payload).unwrap();
        assert_eq!(session.status, Status::Ok);
        assert_eq!(session.root_inode, ROOT_INODE);

        let cred = WireCred { uid: 0, gid: 0 };
        let reply = call(
            &mut stream,
            MkdirRequest {
                parent: ROOT_INODE,
                name: "music".to_string(),
                mode: 0o755,
                umask: 0,
                cred,
            }
            .to_packet(),
        )
        .await;
        let mut payload = reply.payload;
        let created = EntryReply::decode(reply.msg_type, &mut payload).unwrap();
        assert_eq!(created.status, Status::Ok);
        assert_eq!(created.attr.kind, b'd');

        let reply = call(
            &mut stream,
            NameRequest {
                msg_type: CLTOMA_LOOKUP,
                parent: ROOT_INODE,
                name: "music".to_string(),
                cred,
            }
            .to_packet(),
        )
        .await;
        let mut payload = reply.payload;
        let found = EntryReply::decode(reply.msg_type, &mut payload).unwrap();
        assert_eq!(found.inode, created.inode);
    }

    #[tokio::test]
    async fn shadow_receives_and_applies_changelog() {
        let (server, addr) = start_master().await;

        // Mutate through the server's metadata directly.
        {
            let fs_arc = server.fs();
            let mut fs = fs_arc.lock().unwrap();
            let ctx = FsContext::master(5, 0, 0);
            fs.mkdir(&ctx, ROOT_INODE, "replicated", 0o755, 0).unwrap();
            fs.mknod(&ctx, ROOT_INODE, "file", 'f', 0o644, 0, 0).unwrap();
        }
        let master_checksum = {
            let fs_arc = server.fs();
            let fs = fs_arc.lock().unwrap();
            fs.checksum()
        };

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut shadow = ShadowReplica::new(FsMetadata::new());
        let applied = shadow.follow(stream, Some(2)).await.unwrap();
        assert_eq!(applied, 2);
        assert_eq!(shadow.fs.checksum(), master_checksum);
        shadow.fs.verify_invariants().unwrap();
    }
}
