//! Instance-based client. One `Client` owns one master session and a
//! chunkserver connection pool; several clients can coexist in a process.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::warn;
use tokio::sync::Mutex;

use chunk_io::{
    execute_post_process, CacheBlockKind, ChunkConnector, ChunkIoError, ChunkWriter,
    ChunkWriteStatus, ChunkserverStats, MultiVariantReadPlanner, StripeBlockSource,
    WriteCacheBlock, WriterPacket, BLOCK_SIZE, CHUNK_SIZE,
};
use wire_proto::{
    read_packet, write_packet, AclTextReply, AclVariantRequest, AppendRequest,
    AttrHistogramReply, Attr, ChunkLocationReply, ChunkPartType, ChunkTypeWithAddress,
    CountersReply, CsReadData, CsReadRequest, CsReadStatus, CsWriteData, CsWriteInit,
    CsWriteStatus, DetachedListReply, DirEntry, EntryReply, GetQuotaRequest, GetXattrRequest,
    InodeRequest, LockProbeReply, LockProbeRequest, LockReply, LockRequest, MkdirRequest,
    MknodRequest, NameRequest, OpenRequest, Packet, PathReply, QuotaReply, ReadChunkRequest,
    ReaddirReply, RegisterSession, RegisterSessionReply, ReleaseRequest, RenameRequest,
    RepairReply, SetAclRequest, SetEattrRequest, SetGoalRequest, SetQuotaRequest,
    SetTrashtimeRequest, SetXattrRequest, SetattrRequest, StatfsReply, Status, StatusReply,
    SubtreeQueryRequest, SymlinkRequest, TruncateRequest, WriteChunkEnd, WriteChunkRequest, XattrListReply,
    XattrValueReply, ACL_VARIANT_ACCESS, ACL_VARIANT_DEFAULT, CLTOCS_WRITE_END,
    CLTOMA_DELETEACL, CLTOMA_FLOCK, CLTOMA_GETACL, CLTOMA_GETATTR, CLTOMA_GETEATTR,
    CLTOMA_GETGOAL, CLTOMA_GETTRASHTIME, CLTOMA_LISTXATTR, CLTOMA_LOOKUP, CLTOMA_POSIX_LOCK,
    CLTOMA_PURGE, CLTOMA_READDIR, CLTOMA_READLINK, CLTOMA_READ_RESERVED, CLTOMA_READ_TRASH,
    CLTOMA_REPAIR, CLTOMA_RMDIR, CLTOMA_UNDEL, CLTOMA_UNLINK,
};

use crate::{ClientError, ClientResult, Context, MasterConn, MountOptions};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHandle {
    pub inode: u32,
    pub flags: u8,
}

/// Directory listing handle: the snapshot is taken at opendir time.
#[derive(Clone, Debug)]
pub struct DirHandle {
    pub inode: u32,
    pub entries: Vec<DirEntry>,
}

pub struct Client {
    conn: Mutex<MasterConn>,
    session_id: u32,
    root: u32,
    options: MountOptions,
    connector: Arc<ChunkConnector>,
    stats: Arc<ChunkserverStats>,
}

impl Client {
    /// Connect to the master and register a session for `mountpoint`.
    pub async fn connect(options: MountOptions, mountpoint: &str) -> ClientResult<Client> {
        let mut conn = MasterConn::connect(&options.master_host, options.master_port).await?;
        let reply = conn
            .request(
                RegisterSession {
                    mountpoint: mountpoint.to_string(),
                    subfolder: options.subfolder.clone(),
                }
                .to_packet(),
            )
            .await?;
        let mut payload = reply.payload;
        let session = RegisterSessionReply::decode(&mut payload)?;
        if !session.status.is_ok() {
            return Err(ClientError::from_status(session.status));
        }
        let stats = Arc::new(ChunkserverStats::default());
        let connector = Arc::new(ChunkConnector::new(
            options.chunkserver_timeouts(),
            stats.clone(),
        ));
        Ok(Client {
            conn: Mutex::new(conn),
            session_id: session.session_id,
            root: session.root_inode,
            options,
            connector,
            stats,
        })
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    /// Refresh the caller's supplementary groups.
    pub fn update_groups(&self, ctx: &mut Context, groups: Vec<u32>) {
        ctx.groups = groups;
    }

    async fn entry_request(&self, packet: Packet) -> ClientResult<(u32, Attr)> {
        let mut conn = self.conn.lock().await;
        let reply = conn.request(packet).await?;
        let mut payload = reply.payload;
        let entry = EntryReply::decode(reply.msg_type, &mut payload)?;
        if !entry.status.is_ok() {
            return Err(ClientError::from_status(entry.status));
        }
        Ok((entry.inode, entry.attr))
    }

    async fn status_request(&self, packet: Packet) -> ClientResult<()> {
        let mut conn = self.conn.lock().await;
        let reply = conn.request(packet).await?;
        let mut payload = reply.payload;
        let status = StatusReply::decode(reply.msg_type, &mut payload)?;
        if !status.status.is_ok() {
            return Err(ClientError::from_status(status.status));
        }
        Ok(())
    }

    // ========== namespace operations ==========

    pub async fn lookup(&self, ctx: &Context, parent: u32, name: &str) -> ClientResult<(u32, Attr)> {
        self.entry_request(
            NameRequest {
                msg_type: CLTOMA_LOOKUP,
                parent,
                name: name.to_string(),
                cred: ctx.cred(),
            }
            .to_packet(),
        )
        .await
    }

    pub async fn mknod(
        &self,
        ctx: &Context,
        parent: u32,
        name: &str,
        mode: u16,
    ) -> ClientResult<(u32, Attr)> {
        self.entry_request(
            MknodRequest {
                parent,
                name: name.to_string(),
                kind: b'f',
                mode,
                umask: ctx.umask,
                rdev: 0,
                cred: ctx.cred(),
            }
            .to_packet(),
        )
        .await
    }

    pub async fn mkdir(
        &self,
        ctx: &Context,
        parent: u32,
        name: &str,
        mode: u16,
    ) -> ClientResult<(u32, Attr)> {
        self.entry_request(
            MkdirRequest {
                parent,
                name: name.to_string(),
                mode,
                umask: ctx.umask,
                cred: ctx.cred(),
            }
            .to_packet(),
        )
        .await
    }

    pub async fn symlink(
        &self,
        ctx: &Context,
        parent: u32,
        name: &str,
        target: &str,
    ) -> ClientResult<(u32, Attr)> {
        self.entry_request(
            SymlinkRequest {
                parent,
                name: name.to_string(),
                target: target.to_string(),
                cred: ctx.cred(),
            }
            .to_packet(),
        )
        .await
    }

    pub async fn readlink(&self, ctx: &Context, inode: u32) -> ClientResult<String> {
        let mut conn = self.conn.lock().await;
        let reply = conn
            .request(
                InodeRequest {
                    msg_type: CLTOMA_READLINK,
                    inode,
                    cred: ctx.cred(),
                }
                .to_packet(),
            )
            .await?;
        let mut payload = reply.payload;
        let path = PathReply::decode(reply.msg_type, &mut payload)?;
        if !path.status.is_ok() {
            return Err(ClientError::from_status(path.status));
        }
        Ok(path.path)
    }

    pub async fn unlink(&self, ctx: &Context, parent: u32, name: &str) -> ClientResult<()> {
        self.status_request(
            NameRequest {
                msg_type: CLTOMA_UNLINK,
                parent,
                name: name.to_string(),
                cred: ctx.cred(),
            }
            .to_packet(),
        )
        .await
    }

    pub async fn rmdir(&self, ctx: &Context, parent: u32, name: &str) -> ClientResult<()> {
        self.status_request(
            NameRequest {
                msg_type: CLTOMA_RMDIR,
                parent,
                name: name.to_string(),
                cred: ctx.cred(),
            }
            .to_packet(),
        )
        .await
    }

    pub async fn rename(
        &self,
        ctx: &Context,
        parent: u32,
        name: &str,
        new_parent: u32,
        new_name: &str,
    ) -> ClientResult<(u32, Attr)> {
        self.entry_request(
            RenameRequest {
                src_parent: parent,
                src_name: name.to_string(),
                dst_parent: new_parent,
                dst_name: new_name.to_string(),
                cred: ctx.cred(),
            }
            .to_packet(),
        )
        .await
    }

    pub async fn getattr(&self, ctx: &Context, inode: u32) -> ClientResult<Attr> {
        let (_, attr) = self
            .entry_request(
                InodeRequest {
                    msg_type: CLTOMA_GETATTR,
                    inode,
                    cred: ctx.cred(),
                }
                .to_packet(),
            )
            .await?;
        Ok(attr)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn setattr(
        &self,
        ctx: &Context,
        inode: u32,
        setmask: u8,
        mode: u16,
        uid: u32,
        gid: u32,
        atime: u32,
        mtime: u32,
    ) -> ClientResult<Attr> {
        let (_, attr) = self
            .entry_request(
                SetattrRequest {
                    inode,
                    setmask,
                    mode,
                    uid,
                    gid,
                    atime,
                    mtime,
                    sugid_clear_mode: 4, // EXT semantics by default
                    cred: ctx.cred(),
                }
                .to_packet(),
            )
            .await?;
        Ok(attr)
    }

    pub async fn truncate(&self, ctx: &Context, inode: u32, length: u64) -> ClientResult<()> {
        // DELAYED means chunkservers are rewriting the boundary chunk; the
        // master commits the length once they confirm, so retry briefly.
        for _ in 0..self.options.io_retries.max(1) {
            let mut conn = self.conn.lock().await;
            let reply = conn
                .request(
                    TruncateRequest {
                        inode,
                        length,
                        opened: false,
                        cred: ctx.cred(),
                    }
                    .to_packet(),
                )
                .await?;
            drop(conn);
            let mut payload = reply.payload;
            let entry = EntryReply::decode(reply.msg_type, &mut payload)?;
            match entry.status {
                Status::Ok => return Ok(()),
                Status::Delayed => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                other => return Err(ClientError::from_status(other)),
            }
        }
        Err(ClientError::from_status(Status::EIo))
    }

    // ========== directories ==========

    pub async fn opendir(&self, ctx: &Context, inode: u32) -> ClientResult<DirHandle> {
        let mut conn = self.conn.lock().await;
        let reply = conn
            .request(
                InodeRequest {
                    msg_type: CLTOMA_READDIR,
                    inode,
                    cred: ctx.cred(),
                }
                .to_packet(),
            )
            .await?;
        let mut payload = reply.payload;
        let listing = ReaddirReply::decode(&mut payload)?;
        if !listing.status.is_ok() {
            return Err(ClientError::from_status(listing.status));
        }
        Ok(DirHandle {
            inode,
            entries: listing.entries,
        })
    }

    pub async fn readdir(
        &self,
        _ctx: &Context,
        handle: &DirHandle,
        offset: usize,
        max_entries: usize,
    ) -> ClientResult<Vec<DirEntry>> {
        Ok(handle
            .entries
            .iter()
            .skip(offset)
            .take(max_entries)
            .cloned()
            .collect())
    }

    pub fn releasedir(&self, _ctx: &Context, _handle: DirHandle) {}

    // ========== open files ==========

    pub async fn open(&self, ctx: &Context, inode: u32, flags: u8) -> ClientResult<FileHandle> {
        let (_, _attr) = self
            .entry_request(
                OpenRequest {
                    inode,
                    flags,
                    session_id: self.session_id,
                    cred: ctx.cred(),
                }
                .to_packet(),
            )
            .await?;
        Ok(FileHandle { inode, flags })
    }

    pub async fn release(&self, _ctx: &Context, handle: FileHandle) -> ClientResult<()> {
        self.status_request(
            ReleaseRequest {
                inode: handle.inode,
                session_id: self.session_id,
            }
            .to_packet(),
        )
        .await
    }

    pub async fn flush(&self, _ctx: &Context, _handle: &FileHandle) -> ClientResult<()> {
        // Writes are pushed out synchronously; nothing is buffered here.
        Ok(())
    }

    pub async fn fsync(&self, ctx: &Context, handle: &FileHandle) -> ClientResult<()> {
        self.flush(ctx, handle).await
    }

    // ========== trash ==========

    pub async fn undel(&self, ctx: &Context, inode: u32) -> ClientResult<()> {
        self.status_request(
            InodeRequest {
                msg_type: CLTOMA_UNDEL,
                inode,
                cred: ctx.cred(),
            }
            .to_packet(),
        )
        .await
    }

    pub async fn purge(&self, ctx: &Context, inode: u32) -> ClientResult<()> {
        self.status_request(
            InodeRequest {
                msg_type: CLTOMA_PURGE,
                inode,
                cred: ctx.cred(),
            }
            .to_packet(),
        )
        .await
    }

    pub async fn readtrash(&self, ctx: &Context) -> ClientResult<Vec<(u32, String)>> {
        self.detached_list(ctx, CLTOMA_READ_TRASH).await
    }

    pub async fn readreserved(&self, ctx: &Context) -> ClientResult<Vec<(u32, String)>> {
        self.detached_list(ctx, CLTOMA_READ_RESERVED).await
    }

    async fn detached_list(
        &self,
        ctx: &Context,
        msg_type: u32,
    ) -> ClientResult<Vec<(u32, String)>> {
        let mut conn = self.conn.lock().await;
        let reply = conn
            .request(
                InodeRequest {
                    msg_type,
                    inode: 0,
                    cred: ctx.cred(),
                }
                .to_packet(),
            )
            .await?;
        let mut payload = reply.payload;
        let listing = DetachedListReply::decode(reply.msg_type, &mut payload)?;
        Ok(listing.entries)
    }

    // ========== goals / trashtime / statfs ==========

    pub async fn setgoal(
        &self,
        ctx: &Context,
        inode: u32,
        goal_name: &str,
        smode: u8,
    ) -> ClientResult<(u32, u32, u32)> {
        let goal = goal_id_from_name(goal_name)?;
        let mut conn = self.conn.lock().await;
        let reply = conn
            .request(
                SetGoalRequest {
                    inode,
                    goal,
                    smode,
                    cred: ctx.cred(),
                }
                .to_packet(),
            )
            .await?;
        let mut payload = reply.payload;
        let counters = CountersReply::decode(reply.msg_type, &mut payload)?;
        if !counters.status.is_ok() {
            return Err(ClientError::from_status(counters.status));
        }
        Ok((
            counters.changed,
            counters.not_changed,
            counters.not_permitted,
        ))
    }

    pub async fn getgoal(&self, ctx: &Context, inode: u32) -> ClientResult<String> {
        let entries = self.subtree_query(ctx, CLTOMA_GETGOAL, inode, false).await?;
        let (goal, _, _) = entries
            .first()
            .copied()
            .ok_or_else(|| ClientError::from_status(Status::ENoEnt))?;
        Ok(goal_name_from_id(goal as u8))
    }

    /// Per-goal histogram over a subtree: (goal name, files, dirs).
    pub async fn getgoal_recursive(
        &self,
        ctx: &Context,
        inode: u32,
    ) -> ClientResult<Vec<(String, u32, u32)>> {
        let entries = self.subtree_query(ctx, CLTOMA_GETGOAL, inode, true).await?;
        Ok(entries
            .into_iter()
            .map(|(goal, files, dirs)| (goal_name_from_id(goal as u8), files, dirs))
            .collect())
    }

    pub async fn gettrashtime(&self, ctx: &Context, inode: u32) -> ClientResult<u32> {
        let entries = self
            .subtree_query(ctx, CLTOMA_GETTRASHTIME, inode, false)
            .await?;
        entries
            .first()
            .map(|(trashtime, _, _)| *trashtime)
            .ok_or_else(|| ClientError::from_status(Status::ENoEnt))
    }

    pub async fn geteattr(&self, ctx: &Context, inode: u32) -> ClientResult<u8> {
        let entries = self.subtree_query(ctx, CLTOMA_GETEATTR, inode, false).await?;
        entries
            .first()
            .map(|(eattr, _, _)| *eattr as u8)
            .ok_or_else(|| ClientError::from_status(Status::ENoEnt))
    }

    async fn subtree_query(
        &self,
        ctx: &Context,
        msg_type: u32,
        inode: u32,
        recursive: bool,
    ) -> ClientResult<Vec<(u32, u32, u32)>> {
        let mut conn = self.conn.lock().await;
        let reply = conn
            .request(
                SubtreeQueryRequest {
                    msg_type,
                    inode,
                    recursive,
                    cred: ctx.cred(),
                }
                .to_packet(),
            )
            .await?;
        let mut payload = reply.payload;
        let histogram = AttrHistogramReply::decode(reply.msg_type, &mut payload)?;
        if !histogram.status.is_ok() {
            return Err(ClientError::from_status(histogram.status));
        }
        Ok(histogram.entries)
    }

    pub async fn seteattr(
        &self,
        ctx: &Context,
        inode: u32,
        eattr: u8,
        smode: u8,
    ) -> ClientResult<(u32, u32, u32)> {
        let mut conn = self.conn.lock().await;
        let reply = conn
            .request(
                SetEattrRequest {
                    inode,
                    eattr,
                    smode,
                    cred: ctx.cred(),
                }
                .to_packet(),
            )
            .await?;
        let mut payload = reply.payload;
        let counters = CountersReply::decode(reply.msg_type, &mut payload)?;
        if !counters.status.is_ok() {
            return Err(ClientError::from_status(counters.status));
        }
        Ok((
            counters.changed,
            counters.not_changed,
            counters.not_permitted,
        ))
    }

    // ========== xattr / ACL ==========

    pub async fn setxattr(
        &self,
        ctx: &Context,
        inode: u32,
        name: &str,
        value: &[u8],
        mode: u8,
    ) -> ClientResult<()> {
        self.status_request(
            SetXattrRequest {
                inode,
                name: name.to_string(),
                value: value.to_vec(),
                mode,
                cred: ctx.cred(),
            }
            .to_packet(),
        )
        .await
    }

    pub async fn getxattr(&self, ctx: &Context, inode: u32, name: &str) -> ClientResult<Vec<u8>> {
        let mut conn = self.conn.lock().await;
        let reply = conn
            .request(
                GetXattrRequest {
                    inode,
                    name: name.to_string(),
                    cred: ctx.cred(),
                }
                .to_packet(),
            )
            .await?;
        let mut payload = reply.payload;
        let value = XattrValueReply::decode(&mut payload)?;
        if !value.status.is_ok() {
            return Err(ClientError::from_status(value.status));
        }
        Ok(value.value)
    }

    pub async fn listxattr(&self, ctx: &Context, inode: u32) -> ClientResult<Vec<String>> {
        let mut conn = self.conn.lock().await;
        let reply = conn
            .request(
                InodeRequest {
                    msg_type: CLTOMA_LISTXATTR,
                    inode,
                    cred: ctx.cred(),
                }
                .to_packet(),
            )
            .await?;
        let mut payload = reply.payload;
        let listing = XattrListReply::decode(&mut payload)?;
        if !listing.status.is_ok() {
            return Err(ClientError::from_status(listing.status));
        }
        Ok(listing.names)
    }

    /// `acl` is the textual record form, e.g. "u:1000:6/g::4/o::0".
    pub async fn setacl(
        &self,
        ctx: &Context,
        inode: u32,
        default_variant: bool,
        acl: &str,
    ) -> ClientResult<()> {
        self.status_request(
            SetAclRequest {
                inode,
                variant: acl_variant(default_variant),
                acl: acl.to_string(),
                cred: ctx.cred(),
            }
            .to_packet(),
        )
        .await
    }

    pub async fn getacl(
        &self,
        ctx: &Context,
        inode: u32,
        default_variant: bool,
    ) -> ClientResult<String> {
        let mut conn = self.conn.lock().await;
        let reply = conn
            .request(
                AclVariantRequest {
                    msg_type: CLTOMA_GETACL,
                    inode,
                    variant: acl_variant(default_variant),
                    cred: ctx.cred(),
                }
                .to_packet(),
            )
            .await?;
        let mut payload = reply.payload;
        let acl = AclTextReply::decode(&mut payload)?;
        if !acl.status.is_ok() {
            return Err(ClientError::from_status(acl.status));
        }
        Ok(acl.acl)
    }

    pub async fn deleteacl(
        &self,
        ctx: &Context,
        inode: u32,
        default_variant: bool,
    ) -> ClientResult<()> {
        self.status_request(
            AclVariantRequest {
                msg_type: CLTOMA_DELETEACL,
                inode,
                variant: acl_variant(default_variant),
                cred: ctx.cred(),
            }
            .to_packet(),
        )
        .await
    }

    // ========== append / repair / quota ==========

    /// Append `inode_src`'s chunks after `inode`'s last chunk.
    pub async fn append(&self, ctx: &Context, inode: u32, inode_src: u32) -> ClientResult<()> {
        self.status_request(
            AppendRequest {
                inode,
                inode_src,
                cred: ctx.cred(),
            }
            .to_packet(),
        )
        .await
    }

    /// Returns (not_changed, erased, repaired).
    pub async fn repair(&self, ctx: &Context, inode: u32) -> ClientResult<(u32, u32, u32)> {
        let mut conn = self.conn.lock().await;
        let reply = conn
            .request(
                InodeRequest {
                    msg_type: CLTOMA_REPAIR,
                    inode,
                    cred: ctx.cred(),
                }
                .to_packet(),
            )
            .await?;
        let mut payload = reply.payload;
        let repair = RepairReply::decode(&mut payload)?;
        if !repair.status.is_ok() {
            return Err(ClientError::from_status(repair.status));
        }
        Ok((repair.not_changed, repair.erased, repair.repaired))
    }

    /// Selector bytes come from the wire protocol constants
    /// (QUOTA_OWNER_*, QUOTA_RIGOR_*, QUOTA_RESOURCE_*).
    pub async fn set_quota(
        &self,
        ctx: &Context,
        owner_type: u8,
        owner_id: u32,
        rigor: u8,
        resource: u8,
        limit: u64,
    ) -> ClientResult<()> {
        self.status_request(
            SetQuotaRequest {
                owner_type,
                owner_id,
                rigor,
                resource,
                limit,
                cred: ctx.cred(),
            }
            .to_packet(),
        )
        .await
    }

    pub async fn get_quota(
        &self,
        ctx: &Context,
        owner_type: u8,
        owner_id: u32,
    ) -> ClientResult<QuotaReply> {
        let mut conn = self.conn.lock().await;
        let reply = conn
            .request(
                GetQuotaRequest {
                    owner_type,
                    owner_id,
                    cred: ctx.cred(),
                }
                .to_packet(),
            )
            .await?;
        let mut payload = reply.payload;
        let quota = QuotaReply::decode(&mut payload)?;
        if !quota.status.is_ok() {
            return Err(ClientError::from_status(quota.status));
        }
        Ok(quota)
    }

    // ========== file locks ==========

    /// Whole-file advisory lock. Returns true when the lock was applied,
    /// false when it was queued (blocking) or denied (nonblocking).
    pub async fn flock(
        &self,
        ctx: &Context,
        inode: u32,
        owner: u64,
        op: u16,
        nonblocking: bool,
    ) -> ClientResult<bool> {
        self.lock_request(ctx, CLTOMA_FLOCK, inode, 0, 1, owner, op, nonblocking)
            .await
    }

    /// POSIX byte-range lock over `[start, end)`.
    #[allow(clippy::too_many_arguments)]
    pub async fn posix_lock(
        &self,
        ctx: &Context,
        inode: u32,
        start: u64,
        end: u64,
        owner: u64,
        op: u16,
        nonblocking: bool,
    ) -> ClientResult<bool> {
        self.lock_request(ctx, CLTOMA_POSIX_LOCK, inode, start, end, owner, op, nonblocking)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn lock_request(
        &self,
        ctx: &Context,
        msg_type: u32,
        inode: u32,
        start: u64,
        end: u64,
        owner: u64,
        op: u16,
        nonblocking: bool,
    ) -> ClientResult<bool> {
        let mut conn = self.conn.lock().await;
        let reply = conn
            .request(
                LockRequest {
                    msg_type,
                    inode,
                    start,
                    end,
                    owner,
                    session_id: self.session_id,
                    reqid: 0,
                    msgid: 0,
                    op,
                    nonblocking,
                    cred: ctx.cred(),
                }
                .to_packet(),
            )
            .await?;
        let mut payload = reply.payload;
        let outcome = LockReply::decode(reply.msg_type, &mut payload)?;
        match outcome.status {
            Status::Ok => Ok(true),
            Status::Waiting => Ok(false),
            other => Err(ClientError::from_status(other)),
        }
    }

    /// Probe for a colliding lock without taking one. Returns None when
    /// the range is free, or the colliding (kind, start, end).
    #[allow(clippy::too_many_arguments)]
    pub async fn lock_probe(
        &self,
        ctx: &Context,
        inode: u32,
        flock: bool,
        start: u64,
        end: u64,
        owner: u64,
        exclusive: bool,
    ) -> ClientResult<Option<(u8, u64, u64)>> {
        let mut conn = self.conn.lock().await;
        let reply = conn
            .request(
                LockProbeRequest {
                    inode,
                    flock,
                    exclusive,
                    start,
                    end,
                    owner,
                    session_id: self.session_id,
                    cred: ctx.cred(),
                }
                .to_packet(),
            )
            .await?;
        let mut payload = reply.payload;
        let probe = LockProbeReply::decode(&mut payload)?;
        match probe.status {
            Status::Ok => Ok(None),
            Status::Waiting => Ok(Some((probe.kind, probe.start, probe.end))),
            other => Err(ClientError::from_status(other)),
        }
    }

    pub async fn settrashtime(
        &self,
        ctx: &Context,
        inode: u32,
        trashtime: u32,
        smode: u8,
    ) -> ClientResult<(u32, u32, u32)> {
        let mut conn = self.conn.lock().await;
        let reply = conn
            .request(
                SetTrashtimeRequest {
                    inode,
                    trashtime,
                    smode,
                    cred: ctx.cred(),
                }
                .to_packet(),
            )
            .await?;
        let mut payload = reply.payload;
        let counters = CountersReply::decode(reply.msg_type, &mut payload)?;
        if !counters.status.is_ok() {
            return Err(ClientError::from_status(counters.status));
        }
        Ok((
            counters.changed,
            counters.not_changed,
            counters.not_permitted,
        ))
    }

    pub async fn statfs(&self) -> ClientResult<StatfsReply> {
        let mut conn = self.conn.lock().await;
        let reply = conn
            .request(Packet::new(wire_proto::CLTOMA_STATFS, Bytes::new()))
            .await?;
        let mut payload = reply.payload;
        Ok(StatfsReply::decode(&mut payload)?)
    }

    // ========== data path ==========

    /// Read `size` bytes at `offset`. Holes and the region past EOF read
    /// as zeros / short reads, like the kernel expects.
    pub async fn read(
        &self,
        _ctx: &Context,
        handle: &FileHandle,
        offset: u64,
        size: usize,
    ) -> ClientResult<Vec<u8>> {
        let mut result = Vec::with_capacity(size);
        let mut position = offset;
        let end = offset + size as u64;
        while position < end {
            let chunk_index = (position / CHUNK_SIZE) as u32;
            let location = self.locate_chunk(handle.inode, chunk_index).await?;
            if position >= location.file_length {
                break;
            }
            let span_end = end
                .min(location.file_length)
                .min((chunk_index as u64 + 1) * CHUNK_SIZE);
            let span = (span_end - position) as usize;
            if location.chunk_id == 0 {
                // Hole: no chunk was ever written here.
                result.extend(std::iter::repeat(0u8).take(span));
            } else {
                let within = position % CHUNK_SIZE;
                let data = self
                    .read_from_chunk(&location, within as u32, span as u32)
                    .await?;
                result.extend_from_slice(&data);
            }
            position += span as u64;
        }
        Ok(result)
    }

    async fn locate_chunk(&self, inode: u32, index: u32) -> ClientResult<ChunkLocationReply> {
        let mut conn = self.conn.lock().await;
        let reply = conn
            .request(ReadChunkRequest { inode, index }.to_packet())
            .await?;
        let mut payload = reply.payload;
        let location = ChunkLocationReply::decode(reply.msg_type, &mut payload)?;
        if !location.status.is_ok() {
            return Err(ClientError::from_status(location.status));
        }
        Ok(location)
    }

    /// Plan and execute a read of `[offset, offset + size)` within one
    /// chunk, degrading over failed parts and retrying with the failing
    /// part avoided.
    async fn read_from_chunk(
        &self,
        location: &ChunkLocationReply,
        offset: u32,
        size: u32,
    ) -> ClientResult<Vec<u8>> {
        let first_block = offset / BLOCK_SIZE;
        let last_block = (offset + size - 1) / BLOCK_SIZE;
        let block_count = last_block - first_block + 1;

        let available: Vec<ChunkPartType> = location
            .locations
            .iter()
            .map(|l| l.part_type)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut planner = MultiVariantReadPlanner::new();
        planner.set_scores(self.stats.part_scores(&location.locations));
        planner.prepare(&available);

        let mut last_error: Option<ClientError> = None;
        for attempt in 0..self.options.io_retries.max(1) {
            if !planner.is_reading_possible() {
                break;
            }
            let plan = planner.build_plan_for(first_block, block_count)?;
            let mut buffer = vec![0u8; plan.required_buffer_size as usize];
            let mut failed: BTreeSet<ChunkPartType> = BTreeSet::new();

            let operations: Vec<(ChunkPartType, chunk_io::ReadOperation)> = plan
                .basic_read_operations
                .iter()
                .chain(plan.additional_read_operations.iter())
                .map(|(&part, op)| (part, op.clone()))
                .collect();
            for (part, operation) in &operations {
                let source = location
                    .locations
                    .iter()
                    .find(|l| l.part_type == *part)
                    .expect("planner only uses available parts");
                match self
                    .fetch_part_range(source, location, operation.request_offset, operation.request_size)
                    .await
                {
                    Ok(data) => {
                        for (i, &buffer_offset) in operation.buffer_offsets.iter().enumerate() {
                            let src = i * BLOCK_SIZE as usize;
                            if src >= data.len() {
                                break;
                            }
                            let len = (data.len() - src).min(BLOCK_SIZE as usize);
                            let dst = buffer_offset as usize;
                            buffer[dst..dst + len].copy_from_slice(&data[src..src + len]);
                        }
                    }
                    Err(err) => {
                        warn!("read of part {} failed: {}", part, err);
                        self.stats.register_defect(source.address);
                        failed.insert(*part);
                        last_error = Some(err);
                    }
                }
            }

            if plan.is_reading_finished(&failed) {
                let post_process = if failed.is_empty() {
                    plan.post_process_for_basic()
                } else {
                    plan.post_process_for_extended(&failed)
                };
                match post_process {
                    Ok(operations) => {
                        execute_post_process(&mut buffer, &operations);
                        let start = (offset - first_block * BLOCK_SIZE) as usize;
                        return Ok(buffer[start..start + size as usize].to_vec());
                    }
                    Err(err) => last_error = Some(err.into()),
                }
            }
            for part in failed {
                planner.start_avoiding_part(part);
            }
            tokio::time::sleep(Duration::from_millis(50 * (attempt as u64 + 1))).await;
        }
        Err(last_error
            .unwrap_or_else(|| ClientError::Connection("no readable cover of the chunk".into())))
    }

    /// Fetch one contiguous byte range of one part over the chunkserver
    /// protocol.
    async fn fetch_part_range(
        &self,
        source: &ChunkTypeWithAddress,
        location: &ChunkLocationReply,
        offset: u32,
        size: u32,
    ) -> ClientResult<Vec<u8>> {
        let mut stream = self.connector.start_using_connection(source.address).await?;
        let request = CsReadRequest {
            chunk_id: location.chunk_id,
            version: location.version,
            part_type: source.part_type,
            offset,
            size,
        };
        let outcome = async {
            write_packet(&mut stream, &request.to_packet()).await?;
            let mut data = vec![0u8; size as usize];
            loop {
                let packet = read_packet(&mut stream).await?;
                match packet.msg_type {
                    wire_proto::CSTOCL_READ_DATA => {
                        let mut payload = packet.payload;
                        let message = CsReadData::decode(&mut payload)?;
                        let start = (message.offset - offset) as usize;
                        data[start..start + message.data.len()].copy_from_slice(&message.data);
                    }
                    wire_proto::CSTOCL_READ_STATUS => {
                        let mut payload = packet.payload;
                        let message = CsReadStatus::decode(&mut payload)?;
                        if message.status.is_ok() {
                            return Ok(data);
                        }
                        return Err(ClientError::from_status(message.status));
                    }
                    other => {
                        return Err(ClientError::Connection(format!(
                            "unexpected chunkserver message {}",
                            other
                        )))
                    }
                }
            }
        }
        .await;
        match &outcome {
            Ok(_) => self.connector.end_using_connection(stream, source.address),
            Err(_) => self.connector.invalidate_connection(source.address),
        }
        outcome
    }

    /// Write `data` at `offset`, chunk by chunk. Recoverable failures are
    /// retried with a fresh chunk allocation, up to `io_retries` times.
    pub async fn write(
        &self,
        ctx: &Context,
        handle: &FileHandle,
        offset: u64,
        data: &[u8],
    ) -> ClientResult<usize> {
        let mut written = 0usize;
        while written < data.len() {
            let position = offset + written as u64;
            let chunk_index = (position / CHUNK_SIZE) as u32;
            let span_end = ((chunk_index as u64 + 1) * CHUNK_SIZE).min(offset + data.len() as u64);
            let span = (span_end - position) as usize;

            let mut attempt = 0;
            loop {
                match self
                    .write_chunk_span(
                        ctx,
                        handle.inode,
                        chunk_index,
                        (position % CHUNK_SIZE) as u32,
                        &data[written..written + span],
                    )
                    .await
                {
                    Ok(()) => break,
                    Err(ClientError::ChunkIo(ChunkIoError::RecoverableWrite(reason))) => {
                        attempt += 1;
                        if attempt >= self.options.io_retries.max(1) {
                            return Err(ClientError::from_status(Status::EIo));
                        }
                        warn!("recoverable write failure (attempt {}): {}", attempt, reason);
                        tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                    }
                    Err(ClientError::MasterStatus(Status::Waiting)) => {
                        // The chunk is still locked by a previous writer.
                        attempt += 1;
                        if attempt >= self.options.io_retries.max(1) {
                            return Err(ClientError::from_status(Status::EIo));
                        }
                        tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                    }
                    Err(err) => return Err(err),
                }
            }
            written += span;
        }
        Ok(written)
    }

    async fn write_chunk_span(
        &self,
        _ctx: &Context,
        inode: u32,
        chunk_index: u32,
        offset_in_chunk: u32,
        data: &[u8],
    ) -> ClientResult<()> {
        // Ask the master for the chunk, its version and the target chain.
        let grant = {
            let mut conn = self.conn.lock().await;
            let reply = conn
                .request(
                    WriteChunkRequest {
                        inode,
                        index: chunk_index,
                        lock_id: 0,
                    }
                    .to_packet(),
                )
                .await?;
            let mut payload = reply.payload;
            let grant = ChunkLocationReply::decode(reply.msg_type, &mut payload)?;
            if !grant.status.is_ok() {
                return Err(ClientError::from_status(grant.status));
            }
            grant
        };
        if grant.locations.is_empty() {
            return Err(ClientError::Connection(
                "master offered no chunkservers for the write".into(),
            ));
        }

        let mut writer = ChunkWriter::new(chunk_index, &grant.locations)?;
        let result = self
            .push_span_to_chunkservers(&mut writer, &grant, offset_in_chunk, data)
            .await;
        let end_offset = match result {
            Ok(end_offset) => end_offset,
            Err(err) => {
                // Best effort: release the master-side chunk lock so the
                // retry can get a fresh grant.
                let _ = self
                    .status_request(
                        WriteChunkEnd {
                            inode,
                            file_length: 0,
                            chunk_id: grant.chunk_id,
                            lock_id: grant.lock_id,
                        }
                        .to_packet(),
                    )
                    .await;
                return Err(err);
            }
        };

        // Commit the new file length and release the chunk lock.
        let new_length = grant.file_length.max(end_offset);
        self.status_request(
            WriteChunkEnd {
                inode,
                file_length: new_length,
                chunk_id: grant.chunk_id,
                lock_id: grant.lock_id,
            }
            .to_packet(),
        )
        .await
    }

    async fn push_span_to_chunkservers(
        &self,
        writer: &mut ChunkWriter,
        grant: &ChunkLocationReply,
        offset_in_chunk: u32,
        data: &[u8],
    ) -> ClientResult<u64> {
        let mut driver = WriteDriver::new(self, grant).await?;
        for packet in writer.init() {
            driver.send(grant, packet).await?;
        }
        for status in driver.drain_statuses().await? {
            writer.process_status(status).map_err(ClientError::from)?;
        }

        // Queue the blocks of this span.
        let chunk_index = writer.chunk_index();
        let mut position = offset_in_chunk;
        let end = offset_in_chunk + data.len() as u32;
        while position < end {
            let block_index = position / BLOCK_SIZE;
            let from = position % BLOCK_SIZE;
            let to = BLOCK_SIZE.min(from + (end - position));
            let mut block = WriteCacheBlock::new(chunk_index, block_index, CacheBlockKind::Writable);
            let span = (to - from) as usize;
            let start = (position - offset_in_chunk) as usize;
            if !block.expand(from, to, &data[start..start + span]) {
                return Err(ClientError::Connection("block assembly failed".into()));
            }
            writer.add_operation(block).map_err(ClientError::from)?;
            position += span as u32;
        }
        writer.start_flush_mode();

        let source = RemoteStripeSource {
            client: self,
            grant,
        };
        let mut end_offset = 0u64;
        while writer.unfinished_operation_count() > 0 {
            let packets = writer
                .start_new_operations(&source)
                .await
                .map_err(ClientError::from)?;
            for packet in packets {
                driver.send(grant, packet).await?;
            }
            for status in driver.drain_statuses().await? {
                if let Some(completion) =
                    writer.process_status(status).map_err(ClientError::from)?
                {
                    end_offset = end_offset.max(completion.offset_of_end);
                }
            }
        }
        for packet in writer.finish() {
            driver.send(grant, packet).await?;
        }
        driver.close(self).await;
        Ok(end_offset)
    }
}

/// Open sockets to every distinct write target of one chunk, tracking how
/// many statuses each one still owes us.
struct WriteDriver {
    streams: Vec<(ChunkTypeWithAddress, tokio::net::TcpStream)>,
    pending: Vec<usize>,
    write_timeout: Duration,
}

impl WriteDriver {
    async fn new(client: &Client, grant: &ChunkLocationReply) -> ClientResult<WriteDriver> {
        let mut streams = Vec::new();
        let mut seen: BTreeSet<ChunkPartType> = BTreeSet::new();
        for location in &grant.locations {
            if !seen.insert(location.part_type) {
                continue;
            }
            let stream = client
                .connector
                .start_using_connection(location.address)
                .await?;
            streams.push((*location, stream));
        }
        let pending = vec![0; streams.len()];
        Ok(WriteDriver {
            streams,
            pending,
            write_timeout: Duration::from_millis(client.options.chunkserver_write_timeout_ms),
        })
    }

    fn index_for(&self, target: &ChunkTypeWithAddress) -> ClientResult<usize> {
        self.streams
            .iter()
            .position(|(location, _)| location.part_type == target.part_type)
            .ok_or_else(|| {
                ClientError::Connection(format!("no stream for part {}", target.part_type))
            })
    }

    async fn send(&mut self, grant: &ChunkLocationReply, packet: WriterPacket) -> ClientResult<()> {
        match packet {
            WriterPacket::Init { target } => {
                let message = CsWriteInit {
                    chunk_id: grant.chunk_id,
                    version: grant.version,
                    part_type: target.part_type,
                    chain: Vec::new(),
                };
                let index = self.index_for(&target)?;
                write_packet(&mut self.streams[index].1, &message.to_packet()).await?;
                self.pending[index] += 1;
            }
            WriterPacket::Data {
                target,
                write_id,
                block_in_part,
                from,
                data,
            } => {
                let message = CsWriteData {
                    chunk_id: grant.chunk_id,
                    write_id,
                    block: block_in_part as u16,
                    offset: from as u16,
                    data: Bytes::from(data),
                };
                let index = self.index_for(&target)?;
                write_packet(&mut self.streams[index].1, &message.to_packet()).await?;
                self.pending[index] += 1;
            }
            WriterPacket::End { target } => {
                let message = Packet::new(CLTOCS_WRITE_END, Bytes::new());
                let index = self.index_for(&target)?;
                write_packet(&mut self.streams[index].1, &message).await?;
            }
        }
        Ok(())
    }

    /// Drain every status the targets still owe, in stream order. A target
    /// exceeding the write timeout fails the whole operation as a
    /// recoverable write error.
    async fn drain_statuses(&mut self) -> ClientResult<Vec<ChunkWriteStatus>> {
        let mut statuses = Vec::new();
        for index in 0..self.streams.len() {
            while self.pending[index] > 0 {
                let packet =
                    tokio::time::timeout(self.write_timeout, read_packet(&mut self.streams[index].1))
                        .await
                        .map_err(|_| {
                            ClientError::ChunkIo(ChunkIoError::RecoverableWrite(format!(
                                "chunkserver {} timed out",
                                self.streams[index].0.address
                            )))
                        })??;
                if packet.msg_type != wire_proto::CSTOCL_WRITE_STATUS {
                    continue;
                }
                let mut payload = packet.payload;
                let message = CsWriteStatus::decode(&mut payload)?;
                statuses.push(ChunkWriteStatus {
                    write_id: message.write_id,
                    status: message.status,
                });
                self.pending[index] -= 1;
            }
        }
        Ok(statuses)
    }

    async fn close(self, client: &Client) {
        for (location, stream) in self.streams {
            client.connector.end_using_connection(stream, location.address);
        }
    }
}

/// Read-modify-write block source backed by the chunkserver read protocol.
struct RemoteStripeSource<'a> {
    client: &'a Client,
    grant: &'a ChunkLocationReply,
}

#[async_trait]
impl StripeBlockSource for RemoteStripeSource<'_> {
    async fn read_part_block(
        &self,
        location: &ChunkTypeWithAddress,
        stripe: u32,
    ) -> chunk_io::ChunkIoResult<Vec<u8>> {
        self.client
            .fetch_part_range(location, self.grant, stripe * BLOCK_SIZE, BLOCK_SIZE)
            .await
            .map_err(|err| ChunkIoError::RecoverableWrite(err.to_string()))
    }
}

fn acl_variant(default_variant: bool) -> u8 {
    if default_variant {
        ACL_VARIANT_DEFAULT
    } else {
        ACL_VARIANT_ACCESS
    }
}

fn goal_name_from_id(goal: u8) -> String {
    if goal <= 9 {
        goal.to_string()
    } else {
        format!("xor{}", goal - 0x10)
    }
}

fn goal_id_from_name(name: &str) -> ClientResult<u8> {
    if let Some(level) = name.strip_prefix("xor") {
        let level: u8 = level
            .parse()
            .map_err(|_| ClientError::BadOption(format!("goal {}", name)))?;
        if !(2..=9).contains(&level) {
            return Err(ClientError::BadOption(format!("goal {}", name)));
        }
        return Ok(0x10 + level);
    }
    let copies: u8 = name
        .parse()
        .map_err(|_| ClientError::BadOption(format!("goal {}", name)))?;
    if !(1..=9).contains(&copies) {
        return Err(ClientError::BadOption(format!("goal {}", name)));
    }
    Ok(copies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs_meta::{FsMetadata, MasterServer};
    use std::sync::Arc as StdArc;
    use tokio::net::TcpListener;

    async fn start_master() -> std::net::SocketAddr {
        let server = StdArc::new(MasterServer::new(FsMetadata::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        addr
    }

    async fn connect(addr: std::net::SocketAddr) -> Client {
        let options = MountOptions {
            master_host: addr.ip().to_string(),
            master_port: addr.port(),
            ..Default::default()
        };
        Client::connect(options, "/mnt/test").await.unwrap()
    }

    #[tokio::test]
    async fn namespace_round_trip() {
        let addr = start_master().await;
        let client = connect(addr).await;
        let ctx = Context::new(0, 0, 1, 0o022);

        let (dir, attr) = client.mkdir(&ctx, client.root(), "a", 0o755).await.unwrap();
        assert_eq!(attr.kind, b'd');
        let (file, _) = client.mknod(&ctx, dir, "b", 0o640).await.unwrap();
        let (found, attr) = client.lookup(&ctx, dir, "b").await.unwrap();
        assert_eq!(found, file);
        assert_eq!(attr.mode, 0o640);

        let handle = client.opendir(&ctx, dir).await.unwrap();
        let entries = client.readdir(&ctx, &handle, 0, 100).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b");

        client.rename(&ctx, dir, "b", client.root(), "c").await.unwrap();
        assert!(client.lookup(&ctx, dir, "b").await.is_err());
        client.unlink(&ctx, client.root(), "c").await.unwrap();
        client.rmdir(&ctx, client.root(), "a").await.unwrap();
    }

    #[tokio::test]
    async fn trash_listing_and_undelete() {
        let addr = start_master().await;
        let client = connect(addr).await;
        let ctx = Context::new(0, 0, 1, 0);

        let (file, _) = client.mknod(&ctx, client.root(), "f", 0o644).await.unwrap();
        client.settrashtime(&ctx, file, 86400, 0).await.unwrap();
        client.unlink(&ctx, client.root(), "f").await.unwrap();

        let trash = client.readtrash(&ctx).await.unwrap();
        assert_eq!(trash.len(), 1);
        assert_eq!(trash[0].0, file);
        assert_eq!(trash[0].1, "/f");

        client.undel(&ctx, file).await.unwrap();
        let (found, _) = client.lookup(&ctx, client.root(), "f").await.unwrap();
        assert_eq!(found, file);
    }

    #[tokio::test]
    async fn sparse_read_returns_zeros() {
        let addr = start_master().await;
        let client = connect(addr).await;
        let ctx = Context::new(0, 0, 1, 0);

        let (file, _) = client.mknod(&ctx, client.root(), "sparse", 0o644).await.unwrap();
        let handle = client
            .open(&ctx, file, wire_proto::OPEN_WANT_READ | wire_proto::OPEN_WANT_WRITE)
            .await
            .unwrap();
        // Extend the file without writing data: every byte reads as zero.
        client.truncate(&ctx, file, 100).await.unwrap();
        let data = client.read(&ctx, &handle, 0, 100).await.unwrap();
        assert_eq!(data, vec![0u8; 100]);
        // Reads past EOF come back short.
        let data = client.read(&ctx, &handle, 90, 100).await.unwrap();
        assert_eq!(data.len(), 10);
        client.release(&ctx, handle).await.unwrap();
    }

    #[tokio::test]
    async fn xattr_and_acl_round_trip() {
        let addr = start_master().await;
        let client = connect(addr).await;
        let ctx = Context::new(0, 0, 1, 0);

        let (file, _) = client.mknod(&ctx, client.root(), "tagged", 0o644).await.unwrap();
        client
            .setxattr(&ctx, file, "user.colour", b"blue", 0)
            .await
            .unwrap();
        assert_eq!(
            client.getxattr(&ctx, file, "user.colour").await.unwrap(),
            b"blue"
        );
        assert_eq!(
            client.listxattr(&ctx, file).await.unwrap(),
            vec!["user.colour".to_string()]
        );

        client.setacl(&ctx, file, false, "u:1000:6/g::4/o::0").await.unwrap();
        assert_eq!(
            client.getacl(&ctx, file, false).await.unwrap(),
            "u:1000:6/g::4/o::0"
        );
        client.deleteacl(&ctx, file, false).await.unwrap();
        assert!(client.getacl(&ctx, file, false).await.is_err());
    }

    #[tokio::test]
    async fn goal_trashtime_eattr_queries() {
        let addr = start_master().await;
        let client = connect(addr).await;
        let ctx = Context::new(0, 0, 1, 0);

        let (file, _) = client.mknod(&ctx, client.root(), "g", 0o644).await.unwrap();
        // Freshly created files inherit the root's default goal.
        assert_eq!(client.getgoal(&ctx, file).await.unwrap(), "2");

        client.settrashtime(&ctx, file, 3600, 0).await.unwrap();
        assert_eq!(client.gettrashtime(&ctx, file).await.unwrap(), 3600);

        let (changed, _, _) = client.seteattr(&ctx, file, 0x01, 0).await.unwrap();
        assert_eq!(changed, 1);
        assert_eq!(client.geteattr(&ctx, file).await.unwrap(), 0x01);

        let histogram = client.getgoal_recursive(&ctx, client.root()).await.unwrap();
        assert!(histogram.iter().any(|(name, files, _)| name == "2" && *files >= 1));
    }

    #[tokio::test]
    async fn flock_exclusion_over_the_wire() {
        let addr = start_master().await;
        let client = connect(addr).await;
        let ctx = Context::new(0, 0, 1, 0);
        let (file, _) = client.mknod(&ctx, client.root(), "locked", 0o644).await.unwrap();

        assert!(client
            .flock(&ctx, file, 1, wire_proto::LOCK_OP_EXCLUSIVE, true)
            .await
            .unwrap());
        // A second owner is denied while the first one holds the lock.
        assert!(!client
            .flock(&ctx, file, 2, wire_proto::LOCK_OP_EXCLUSIVE, true)
            .await
            .unwrap());
        let collision = client
            .lock_probe(&ctx, file, true, 0, 1, 2, true)
            .await
            .unwrap();
        assert_eq!(collision, Some((wire_proto::LOCK_KIND_EXCLUSIVE, 0, 1)));

        assert!(client
            .flock(&ctx, file, 1, wire_proto::LOCK_OP_UNLOCK, true)
            .await
            .unwrap());
        assert!(client
            .flock(&ctx, file, 2, wire_proto::LOCK_OP_EXCLUSIVE, true)
            .await
            .unwrap());

        // Byte-range locks on disjoint ranges coexist.
        assert!(client
            .posix_lock(&ctx, file, 0, 100, 3, wire_proto::LOCK_OP_EXCLUSIVE, true)
            .await
            .unwrap());
        assert!(client
            .posix_lock(&ctx, file, 100, 200, 4, wire_proto::LOCK_OP_EXCLUSIVE, true)
            .await
            .unwrap());
        assert!(!client
            .posix_lock(&ctx, file, 50, 150, 5, wire_proto::LOCK_OP_SHARED, true)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn quota_configuration_over_the_wire() {
        let addr = start_master().await;
        let client = connect(addr).await;
        let root_ctx = Context::new(0, 0, 1, 0);

        client
            .set_quota(
                &root_ctx,
                wire_proto::QUOTA_OWNER_USER,
                1000,
                wire_proto::QUOTA_RIGOR_HARD,
                wire_proto::QUOTA_RESOURCE_INODES,
                1,
            )
            .await
            .unwrap();
        let quota = client
            .get_quota(&root_ctx, wire_proto::QUOTA_OWNER_USER, 1000)
            .await
            .unwrap();
        assert_eq!(quota.inodes_hard_limit, 1);

        // The limit is enforced on the second create.
        let user_ctx = Context::new(1000, 1000, 1, 0);
        client.mknod(&user_ctx, client.root(), "q1", 0o644).await.unwrap();
        let err = client
            .mknod(&user_ctx, client.root(), "q2", 0o644)
            .await
            .unwrap_err();
        match err {
            ClientError::MasterStatus(status) => assert_eq!(status, Status::Quota),
            other => panic!("unexpected error {:?}", other),
        }

        // Non-root callers may not change quotas.
        assert!(client
            .set_quota(
                &user_ctx,
                wire_proto::QUOTA_OWNER_USER,
                1000,
                wire_proto::QUOTA_RIGOR_HARD,
                wire_proto::QUOTA_RESOURCE_INODES,
                0,
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn append_and_repair_over_the_wire() {
        let addr = start_master().await;
        let client = connect(addr).await;
        let ctx = Context::new(0, 0, 1, 0);

        let (dst, _) = client.mknod(&ctx, client.root(), "dst", 0o644).await.unwrap();
        let (src, _) = client.mknod(&ctx, client.root(), "src", 0o644).await.unwrap();
        client.append(&ctx, dst, src).await.unwrap();
        assert!(client.append(&ctx, dst, dst).await.is_err());

        // A chunkless file has nothing to reconcile.
        assert_eq!(client.repair(&ctx, dst).await.unwrap(), (0, 0, 0));
    }

    #[tokio::test]
    async fn errno_for_missing_files() {
        let addr = start_master().await;
        let client = connect(addr).await;
        let ctx = Context::new(1000, 1000, 1, 0);
        let err = client.lookup(&ctx, client.root(), "nope").await.unwrap_err();
        match err {
            ClientError::MasterStatus(status) => {
                assert_eq!(crate::error_conv(status), libc::ENOENT);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
