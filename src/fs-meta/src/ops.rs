//! The metadata operation set. Every mutating operation runs its
//! permission and precondition checks, performs the mutation (updating
//! stats, quota and checksums through the helpers in `metadata`), and
//! appends exactly one changelog record. The `apply_*` twins replay a
//! record on a shadow and fail with `Mismatch` when the encoded result
//! diverges.

use log::warn;

use crate::changelog::escape_name;
use crate::goal::Goal;
use crate::locks::{Lock, LockKind, LockOwner};
use crate::metadata::{node_kind_for_create, FsMetadata};
use crate::node::{
    name_is_valid, AclVariant, AccessControlList, FileState, InodeId, NodeKind, SessionId,
    CHUNK_SIZE, EATTR_MASK, MAX_CHUNK_INDEX, MAX_SYMLINK_LENGTH, MODE_MASK_R, MODE_MASK_W,
    ROOT_INODE,
};
use crate::quota::{QuotaOwnerType, QuotaResource, QuotaRigor};
use crate::{FsContext, FsError, FsResult, SESFLAG_IGNOREGID, SESFLAG_MAPALL};

// setattr mask bits.
pub const SET_MODE: u8 = 0x01;
pub const SET_UID: u8 = 0x02;
pub const SET_GID: u8 = 0x04;
pub const SET_ATIME: u8 = 0x08;
pub const SET_MTIME: u8 = 0x10;
pub const SET_ATIME_NOW: u8 = 0x20;
pub const SET_MTIME_NOW: u8 = 0x40;

// smode bits for the recursive attribute operations.
pub const SMODE_SET: u8 = 0;
pub const SMODE_INCREASE: u8 = 1;
pub const SMODE_DECREASE: u8 = 2;
pub const SMODE_RECURSIVE: u8 = 4;

// xattr set modes.
pub const XATTR_CREATE_OR_REPLACE: u8 = 0;
pub const XATTR_CREATE_ONLY: u8 = 1;
pub const XATTR_REPLACE_ONLY: u8 = 2;
pub const XATTR_REMOVE: u8 = 3;

/// How chown clears set-uid/set-gid bits, mirroring the kernel variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SugidClearMode {
    Never,
    Always,
    Osx,
    Bsd,
    Ext,
    Xfs,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskCounters {
    pub changed: u32,
    pub not_changed: u32,
    pub not_permitted: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TruncateOutcome {
    /// Length adjusted in metadata only.
    Done,
    /// A mid-chunk cut was delegated to chunkservers; finish with
    /// `write_end` once they confirm.
    Delayed {
        chunk_id: u64,
        version: u32,
        lock_id: u32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteChunkGrant {
    pub chunk_id: u64,
    pub version: u32,
    pub lock_id: u32,
    pub file_length: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOp {
    Shared,
    Exclusive,
    Unlock,
    Release,
}

impl LockOp {
    pub fn to_u16(self) -> u16 {
        match self {
            LockOp::Shared => 1,
            LockOp::Exclusive => 2,
            LockOp::Unlock => 3,
            LockOp::Release => 4,
        }
    }

    pub fn from_u16(value: u16) -> FsResult<LockOp> {
        match value {
            1 => Ok(LockOp::Shared),
            2 => Ok(LockOp::Exclusive),
            3 => Ok(LockOp::Unlock),
            4 => Ok(LockOp::Release),
            _ => Err(FsError::Inval),
        }
    }
}

impl FsMetadata {
    pub(crate) fn emit(&mut self, ts: u32, entry: String) {
        let version = self.metaversion;
        self.metaversion += 1;
        self.changelog.append(version, ts, &entry);
    }

    fn check_not_readonly(&self, ctx: &FsContext) -> FsResult<()> {
        if ctx.read_only() {
            return Err(FsError::ReadOnly);
        }
        Ok(())
    }

    // ========== read-only operations ==========

    pub fn lookup(&self, ctx: &FsContext, parent: InodeId, name: &str) -> FsResult<InodeId> {
        self.check_searchable_dir(parent, ctx.uid, ctx.gid)?;
        if name == "." {
            return Ok(parent);
        }
        if name == ".." {
            let node = self.node(parent)?;
            return Ok(node.parents.first().copied().unwrap_or(ROOT_INODE));
        }
        if !name_is_valid(name) {
            return Err(FsError::Inval);
        }
        self.lookup_child(parent, name)
    }

    pub fn attr(&self, id: InodeId) -> FsResult<wire_proto::Attr> {
        let node = self.node(id)?;
        let (length, rdev) = match &node.kind {
            NodeKind::File(file) => (file.length, 0),
            NodeKind::Symlink(path) => (path.len() as u64, 0),
            NodeKind::CharDev(rdev) | NodeKind::BlockDev(rdev) => (0, *rdev),
            _ => (0, 0),
        };
        let nlink = match &node.kind {
            NodeKind::Directory(dir) => {
                2 + dir
                    .entries
                    .values()
                    .filter(|&&child| {
                        self.node(child).map(|n| n.is_directory()).unwrap_or(false)
                    })
                    .count() as u32
            }
            _ => node.parents.len().max(1) as u32,
        };
        Ok(wire_proto::Attr {
            kind: node.kind.type_char() as u8,
            mode: node.mode,
            uid: node.uid,
            gid: node.gid,
            atime: node.atime,
            mtime: node.mtime,
            ctime: node.ctime,
            nlink,
            length,
            rdev,
        })
    }

    pub fn readlink(&self, id: InodeId) -> FsResult<String> {
        match &self.node(id)?.kind {
            NodeKind::Symlink(path) => Ok(path.clone()),
            _ => Err(FsError::Inval),
        }
    }

    pub fn readdir(
        &self,
        ctx: &FsContext,
        id: InodeId,
    ) -> FsResult<Vec<(String, InodeId, char)>> {
        let node = self.node(id)?;
        let dir = node.directory().ok_or(FsError::NotDir)?;
        if !self.access(node, ctx.uid, ctx.gid, MODE_MASK_R) {
            return Err(FsError::Access);
        }
        let mut entries = Vec::with_capacity(dir.entries.len());
        for (name, &child) in &dir.entries {
            let kind = self.node(child)?.kind.type_char();
            entries.push((name.clone(), child, kind));
        }
        Ok(entries)
    }

    pub fn get_dir_stats(&self, id: InodeId) -> FsResult<crate::node::StatsRecord> {
        self.stats_of(id)
    }

    /// Per-goal-id histogram over a subtree: (files, directories).
    pub fn getgoal_recursive(
        &self,
        id: InodeId,
        recursive: bool,
    ) -> FsResult<Vec<(u8, u32, u32)>> {
        let mut counts: std::collections::BTreeMap<u8, (u32, u32)> = Default::default();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = self.node(current)?;
            match &node.kind {
                NodeKind::File(_) => counts.entry(node.goal).or_default().0 += 1,
                NodeKind::Directory(dir) => {
                    counts.entry(node.goal).or_default().1 += 1;
                    if recursive {
                        stack.extend(dir.entries.values().copied());
                    }
                }
                _ => {}
            }
        }
        Ok(counts
            .into_iter()
            .map(|(goal, (files, dirs))| (goal, files, dirs))
            .collect())
    }

    /// Per-trashtime histogram over a subtree: (files, directories).
    pub fn gettrashtime_recursive(
        &self,
        id: InodeId,
        recursive: bool,
    ) -> FsResult<Vec<(u32, u32, u32)>> {
        let mut counts: std::collections::BTreeMap<u32, (u32, u32)> = Default::default();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = self.node(current)?;
            match &node.kind {
                NodeKind::File(_) => counts.entry(node.trashtime).or_default().0 += 1,
                NodeKind::Directory(dir) => {
                    counts.entry(node.trashtime).or_default().1 += 1;
                    if recursive {
                        stack.extend(dir.entries.values().copied());
                    }
                }
                _ => {}
            }
        }
        Ok(counts
            .into_iter()
            .map(|(trashtime, (files, dirs))| (trashtime, files, dirs))
            .collect())
    }

    /// Per-eattr histogram over a subtree: (files, directories).
    pub fn geteattr_recursive(
        &self,
        id: InodeId,
        recursive: bool,
    ) -> FsResult<Vec<(u8, u32, u32)>> {
        let mut counts: std::collections::BTreeMap<u8, (u32, u32)> = Default::default();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = self.node(current)?;
            match &node.kind {
                NodeKind::File(_) => counts.entry(node.eattr).or_default().0 += 1,
                NodeKind::Directory(dir) => {
                    counts.entry(node.eattr).or_default().1 += 1;
                    if recursive {
                        stack.extend(dir.entries.values().copied());
                    }
                }
                _ => {}
            }
        }
        Ok(counts
            .into_iter()
            .map(|(eattr, (files, dirs))| (eattr, files, dirs))
            .collect())
    }

    // ========== namespace mutations ==========

    #[allow(clippy::too_many_arguments)]
    pub fn mknod(
        &mut self,
        ctx: &FsContext,
        parent: InodeId,
        name: &str,
        type_char: char,
        mode: u16,
        umask: u16,
        rdev: u32,
    ) -> FsResult<InodeId> {
        self.check_not_readonly(ctx)?;
        if type_char == 'd' {
            return Err(FsError::Inval);
        }
        let kind = node_kind_for_create(type_char, rdev)?;
        self.create_common(ctx, parent, name, kind, mode, umask, rdev)
    }

    pub fn mkdir(
        &mut self,
        ctx: &FsContext,
        parent: InodeId,
        name: &str,
        mode: u16,
        umask: u16,
    ) -> FsResult<InodeId> {
        self.check_not_readonly(ctx)?;
        let kind = node_kind_for_create('d', 0)?;
        self.create_common(ctx, parent, name, kind, mode, umask, 0)
    }

    fn create_common(
        &mut self,
        ctx: &FsContext,
        parent: InodeId,
        name: &str,
        kind: NodeKind,
        mode: u16,
        umask: u16,
        rdev: u32,
    ) -> FsResult<InodeId> {
        self.check_writable_dir(parent, ctx.uid, ctx.gid)?;
        if !name_is_valid(name) {
            return Err(FsError::Inval);
        }
        if self.name_is_used(parent, name) {
            return Err(FsError::Exist);
        }
        if self.quota_exceeded_for_new_inode(ctx.uid, ctx.gid)
            || self.dir_quota_exceeded(parent, 1, 0)
        {
            return Err(FsError::Quota);
        }
        let final_mode = mode & !umask & 0o7777;
        let type_char = kind.type_char();
        let id = self.create_node(ctx.ts, parent, name, kind, final_mode, ctx.uid, ctx.gid, None)?;
        self.emit(
            ctx.ts,
            format!(
                "CREATE({},{},{},{},{},{},{}):{}",
                parent,
                escape_name(name),
                type_char,
                final_mode,
                ctx.uid,
                ctx.gid,
                rdev,
                id
            ),
        );
        Ok(id)
    }

    pub fn symlink(
        &mut self,
        ctx: &FsContext,
        parent: InodeId,
        name: &str,
        path: &str,
    ) -> FsResult<InodeId> {
        self.check_not_readonly(ctx)?;
        self.check_writable_dir(parent, ctx.uid, ctx.gid)?;
        if path.is_empty() || path.len() > MAX_SYMLINK_LENGTH || path.bytes().any(|b| b == 0) {
            return Err(FsError::Inval);
        }
        if !name_is_valid(name) {
            return Err(FsError::Inval);
        }
        if self.name_is_used(parent, name) {
            return Err(FsError::Exist);
        }
        if self.quota_exceeded_for_new_inode(ctx.uid, ctx.gid)
            || self.dir_quota_exceeded(parent, 1, 0)
        {
            return Err(FsError::Quota);
        }
        let id = self.create_node(
            ctx.ts,
            parent,
            name,
            NodeKind::Symlink(path.to_string()),
            0o777,
            ctx.uid,
            ctx.gid,
            None,
        )?;
        self.emit(
            ctx.ts,
            format!(
                "SYMLINK({},{},{},{},{}):{}",
                parent,
                escape_name(name),
                escape_name(path),
                ctx.uid,
                ctx.gid,
                id
            ),
        );
        Ok(id)
    }

    pub fn link(
        &mut self,
        ctx: &FsContext,
        inode: InodeId,
        parent: InodeId,
        name: &str,
    ) -> FsResult<()> {
        self.check_not_readonly(ctx)?;
        self.check_writable_dir(parent, ctx.uid, ctx.gid)?;
        let node = self.node(inode)?;
        if node.is_directory() {
            return Err(FsError::Perm);
        }
        if node.is_detached() {
            return Err(FsError::NoEnt);
        }
        if !name_is_valid(name) {
            return Err(FsError::Inval);
        }
        if self.name_is_used(parent, name) {
            return Err(FsError::Exist);
        }
        self.add_edge(ctx.ts, parent, inode, name)?;
        self.emit(
            ctx.ts,
            format!("LINK({},{},{})", inode, parent, escape_name(name)),
        );
        Ok(())
    }

    pub fn unlink(&mut self, ctx: &FsContext, parent: InodeId, name: &str) -> FsResult<InodeId> {
        self.check_not_readonly(ctx)?;
        self.check_writable_dir(parent, ctx.uid, ctx.gid)?;
        if !name_is_valid(name) {
            return Err(FsError::Inval);
        }
        let child = self.lookup_child(parent, name)?;
        {
            let parent_node = self.node(parent)?;
            let child_node = self.node(child)?;
            if !self.sticky_access(parent_node, child_node, ctx.uid) {
                return Err(FsError::Perm);
            }
            if child_node.is_directory() {
                return Err(FsError::Perm);
            }
        }
        let path = self.full_path(child)?;
        self.remove_edge(ctx.ts, parent, name, child)?;
        self.dispose_unlinked(ctx.ts, child, path)?;
        self.emit(
            ctx.ts,
            format!("UNLINK({},{}):{}", parent, escape_name(name), child),
        );
        Ok(child)
    }

    pub fn rmdir(&mut self, ctx: &FsContext, parent: InodeId, name: &str) -> FsResult<InodeId> {
        self.check_not_readonly(ctx)?;
        self.check_writable_dir(parent, ctx.uid, ctx.gid)?;
        if !name_is_valid(name) {
            return Err(FsError::Inval);
        }
        let child = self.lookup_child(parent, name)?;
        {
            let parent_node = self.node(parent)?;
            let child_node = self.node(child)?;
            if !self.sticky_access(parent_node, child_node, ctx.uid) {
                return Err(FsError::Perm);
            }
            let dir = child_node.directory().ok_or(FsError::NotDir)?;
            if !dir.entries.is_empty() {
                return Err(FsError::NotEmpty);
            }
        }
        self.remove_edge(ctx.ts, parent, name, child)?;
        self.destroy_node(child)?;
        self.emit(
            ctx.ts,
            format!("UNLINK({},{}):{}", parent, escape_name(name), child),
        );
        Ok(child)
    }

    pub fn rename(
        &mut self,
        ctx: &FsContext,
        src_parent: InodeId,
        src_name: &str,
        dst_parent: InodeId,
        dst_name: &str,
    ) -> FsResult<InodeId> {
        self.check_not_readonly(ctx)?;
        self.check_writable_dir(dst_parent, ctx.uid, ctx.gid)?;
        self.check_writable_dir(src_parent, ctx.uid, ctx.gid)?;
        if !name_is_valid(src_name) || !name_is_valid(dst_name) {
            return Err(FsError::Inval);
        }
        let child = self.lookup_child(src_parent, src_name)?;
        {
            let src_node = self.node(src_parent)?;
            let child_node = self.node(child)?;
            if !self.sticky_access(src_node, child_node, ctx.uid) {
                return Err(FsError::Perm);
            }
            // Moving a directory under itself would create a cycle.
            if child_node.is_directory() && self.is_ancestor(child, dst_parent) {
                return Err(FsError::Inval);
            }
        }

        let existing = match self.lookup_child(dst_parent, dst_name) {
            Ok(existing) => Some(existing),
            Err(FsError::NoEnt) => None,
            Err(err) => return Err(err),
        };
        if existing == Some(child) {
            return Ok(child);
        }
        if let Some(existing) = existing {
            let dst_node = self.node(dst_parent)?;
            let existing_node = self.node(existing)?;
            if !self.sticky_access(dst_node, existing_node, ctx.uid) {
                return Err(FsError::Perm);
            }
            if let Some(dir) = existing_node.directory() {
                if !dir.entries.is_empty() {
                    return Err(FsError::NotEmpty);
                }
            }
        }

        // Directory quota check at the destination with the moved subtree's
        // contribution.
        let moved_stats = self.stats_of(child)?;
        if self.dir_quota_exceeded(
            dst_parent,
            moved_stats.inodes as i64,
            moved_stats.size as i64,
        ) && !self.is_ancestor(dst_parent, src_parent)
        {
            return Err(FsError::Quota);
        }

        if let Some(existing) = existing {
            let path = self.full_path(existing)?;
            self.remove_edge(ctx.ts, dst_parent, dst_name, existing)?;
            if self.node(existing)?.is_directory() {
                self.destroy_node(existing)?;
            } else {
                self.dispose_unlinked(ctx.ts, existing, path)?;
            }
        }
        self.remove_edge(ctx.ts, src_parent, src_name, child)?;
        self.add_edge(ctx.ts, dst_parent, child, dst_name)?;
        self.emit(
            ctx.ts,
            format!(
                "MOVE({},{},{},{}):{}",
                src_parent,
                escape_name(src_name),
                dst_parent,
                escape_name(dst_name),
                child
            ),
        );
        Ok(child)
    }

    // ========== attribute mutations ==========

    #[allow(clippy::too_many_arguments)]
    pub fn setattr(
        &mut self,
        ctx: &FsContext,
        inode: InodeId,
        setmask: u8,
        attr_mode: u16,
        attr_uid: u32,
        attr_gid: u32,
        attr_atime: u32,
        attr_mtime: u32,
        sugid_clear_mode: SugidClearMode,
    ) -> FsResult<()> {
        self.check_not_readonly(ctx)?;
        let node = self.node(inode)?;
        let uid = ctx.uid;
        if uid != 0 && ctx.sesflags & SESFLAG_MAPALL != 0 && setmask & (SET_UID | SET_GID) != 0 {
            return Err(FsError::Perm);
        }
        if node.eattr & crate::node::EATTR_NOOWNER == 0 && uid != 0 && uid != node.uid {
            if setmask & (SET_MODE | SET_UID | SET_GID) != 0 {
                return Err(FsError::Perm);
            }
            if setmask & SET_ATIME != 0 && setmask & SET_ATIME_NOW == 0 {
                return Err(FsError::Perm);
            }
            if setmask & SET_MTIME != 0 && setmask & SET_MTIME_NOW == 0 {
                return Err(FsError::Perm);
            }
            if setmask & (SET_ATIME_NOW | SET_MTIME_NOW) != 0
                && !self.access(node, ctx.uid, ctx.gid, MODE_MASK_W)
            {
                return Err(FsError::Access);
            }
        }
        if uid != 0 && uid != attr_uid && setmask & SET_UID != 0 {
            return Err(FsError::Perm);
        }
        if ctx.sesflags & SESFLAG_IGNOREGID == 0
            && uid != 0
            && ctx.gid != attr_gid
            && setmask & SET_GID != 0
        {
            return Err(FsError::Perm);
        }

        let mut attr_mode = attr_mode;
        let node_mode = node.mode;
        let is_dir = node.is_directory();
        let node_gid = node.gid;
        // chown + chmod in one call keeps the kernel-stripped sugid bits.
        if setmask & (SET_UID | SET_GID) != 0 && setmask & SET_MODE != 0 {
            attr_mode |= node_mode & 0o6000;
        }
        let mut strip_mode_bits: u16 = 0;
        if node_mode & 0o6000 != 0 && setmask & (SET_UID | SET_GID) != 0 {
            strip_mode_bits = match sugid_clear_mode {
                SugidClearMode::Always => 0o6000,
                SugidClearMode::Osx => {
                    if uid != 0 {
                        0o6000
                    } else {
                        0
                    }
                }
                SugidClearMode::Bsd => {
                    if uid != 0 && setmask & SET_GID != 0 && node_gid != attr_gid {
                        0o6000
                    } else {
                        0
                    }
                }
                SugidClearMode::Ext => {
                    if !is_dir {
                        if node_mode & 0o010 != 0 {
                            0o6000
                        } else {
                            0o4000
                        }
                    } else {
                        0
                    }
                }
                SugidClearMode::Xfs => {
                    if !is_dir {
                        if node_mode & 0o010 != 0 {
                            0o6000
                        } else {
                            0o4000
                        }
                    } else if uid != 0 {
                        0o6000
                    } else {
                        0
                    }
                }
                SugidClearMode::Never => 0,
            };
        }
        if strip_mode_bits != 0 {
            attr_mode &= !strip_mode_bits;
        }

        let (old_uid, old_gid, size) = {
            let node = self.node(inode)?;
            (node.uid, node.gid, node.file_size())
        };
        let new_uid = if setmask & SET_UID != 0 { attr_uid } else { old_uid };
        let new_gid = if setmask & SET_GID != 0 { attr_gid } else { old_gid };

        let ts = ctx.ts;
        self.mutate_node(inode, |node| {
            if strip_mode_bits != 0 {
                node.mode &= !strip_mode_bits;
            }
            if setmask & SET_MODE != 0 {
                node.mode = attr_mode & 0o7777;
            }
            node.uid = new_uid;
            node.gid = new_gid;
            if setmask & SET_ATIME_NOW != 0 {
                node.atime = ts;
            } else if setmask & SET_ATIME != 0 {
                node.atime = attr_atime;
            }
            if setmask & SET_MTIME_NOW != 0 {
                node.mtime = ts;
            } else if setmask & SET_MTIME != 0 {
                node.mtime = attr_mtime;
            }
            node.ctime = ts;
        })?;

        // Ownership changes move quota usage between owners.
        if new_uid != old_uid || new_gid != old_gid {
            self.quota
                .change_usage(QuotaResource::Inodes, old_uid, old_gid, -1);
            self.quota
                .change_usage(QuotaResource::Size, old_uid, old_gid, -(size as i64));
            self.quota
                .change_usage(QuotaResource::Inodes, new_uid, new_gid, 1);
            self.quota
                .change_usage(QuotaResource::Size, new_uid, new_gid, size as i64);
        }

        let node = self.node(inode)?;
        let entry = format!(
            "ATTR({},{},{},{},{},{})",
            inode,
            node.mode & 0o7777,
            node.uid,
            node.gid,
            node.atime,
            node.mtime
        );
        self.emit(ctx.ts, entry);
        Ok(())
    }

    pub fn set_length(
        &mut self,
        ctx: &FsContext,
        inode: InodeId,
        length: u64,
        opened: bool,
    ) -> FsResult<()> {
        self.check_not_readonly(ctx)?;
        {
            let node = self.file_node_checked(inode)?;
            if !opened && !self.access(node, ctx.uid, ctx.gid, MODE_MASK_W) {
                return Err(FsError::Access);
            }
        }
        self.set_file_length(inode, length)?;
        let ts = ctx.ts;
        self.mutate_node(inode, |node| {
            node.mtime = ts;
            node.ctime = ts;
        })?;
        self.emit(ctx.ts, format!("LENGTH({},{})", inode, length));
        Ok(())
    }

    /// First phase of truncate: a cut in the middle of a chunk needs the
    /// chunkservers to rewrite that chunk, so the chunk gets a new version
    /// under a write lock and the caller is told to wait (`Delayed`).
    pub fn try_truncate(
        &mut self,
        ctx: &FsContext,
        inode: InodeId,
        length: u64,
        opened: bool,
    ) -> FsResult<TruncateOutcome> {
        self.check_not_readonly(ctx)?;
        let (goal, chunk_at_cut) = {
            let node = self.file_node_checked(inode)?;
            if !opened && !self.access(node, ctx.uid, ctx.gid, MODE_MASK_W) {
                return Err(FsError::Access);
            }
            let file = node.file().unwrap();
            let index = (length / CHUNK_SIZE) as usize;
            let chunk = if length % CHUNK_SIZE != 0 && index < file.chunks.len() {
                file.chunks[index]
            } else {
                0
            };
            (node.goal, chunk)
        };
        if chunk_at_cut == 0 {
            return Ok(TruncateOutcome::Done);
        }
        let quota_exceeded = {
            let node = self.node(inode)?;
            self.quota_exceeded_for_growth(node.uid, node.gid)
        };
        let index = (length / CHUNK_SIZE) as u32;
        let modification = self
            .chunks
            .multi_truncate(chunk_at_cut, goal, quota_exceeded)?;
        self.with_file_bookkeeping(inode, |node| {
            let file = node.file_mut().unwrap();
            file.chunks[index as usize] = modification.chunk_id;
        })?;
        self.emit(
            ctx.ts,
            format!(
                "TRUNC({},{},{}):{}",
                inode, index, modification.lock_id, modification.chunk_id
            ),
        );
        Ok(TruncateOutcome::Delayed {
            chunk_id: modification.chunk_id,
            version: modification.version,
            lock_id: modification.lock_id,
        })
    }

    // ========== chunk I/O metadata ==========

    pub fn read_chunk(&self, inode: InodeId, index: u32) -> FsResult<(u64, u32, u64)> {
        let node = self.file_node_checked(inode)?;
        if index > MAX_CHUNK_INDEX {
            return Err(FsError::IndexTooBig);
        }
        let file = node.file().unwrap();
        let chunk_id = file.chunks.get(index as usize).copied().unwrap_or(0);
        let version = self
            .chunks
            .get(chunk_id)
            .map(|info| info.version)
            .unwrap_or(0);
        Ok((chunk_id, version, file.length))
    }

    pub fn write_chunk(
        &mut self,
        ctx: &FsContext,
        inode: InodeId,
        index: u32,
        lock_id: u32,
    ) -> FsResult<WriteChunkGrant> {
        self.check_not_readonly(ctx)?;
        self.file_node_checked(inode)?;
        if index > MAX_CHUNK_INDEX {
            return Err(FsError::IndexTooBig);
        }
        let (goal, uid, gid) = {
            let node = self.node(inode)?;
            (node.goal, node.uid, node.gid)
        };
        let quota_exceeded =
            self.quota_exceeded_for_growth(uid, gid) || self.dir_quota_exceeded_for(inode);

        // Grow the chunk vector in steps: one at a time below 8, then
        // 8-aligned, then 64-aligned.
        let needs_growth = {
            let file = self.node(inode)?.file().unwrap();
            index as usize >= file.chunks.len()
        };
        if needs_growth {
            if quota_exceeded {
                return Err(FsError::Quota);
            }
            self.with_file_bookkeeping(inode, |node| {
                let file = node.file_mut().unwrap();
                let new_size = if index < 8 {
                    index + 1
                } else if index < 64 {
                    (index & 0xFFFFFFF8) + 8
                } else {
                    (index & 0xFFFFFFC0) + 64
                };
                file.chunks.resize(new_size as usize, 0);
            })?;
        }

        let old_chunk_id = self.node(inode)?.file().unwrap().chunks[index as usize];
        let modification = self
            .chunks
            .multi_modify(old_chunk_id, lock_id, goal, quota_exceeded)?;
        let ts = ctx.ts;
        let file_length = self.with_file_bookkeeping(inode, |node| {
            node.mtime = ts;
            node.ctime = ts;
            let file = node.file_mut().unwrap();
            file.chunks[index as usize] = modification.chunk_id;
            file.length
        })?;
        self.emit(
            ctx.ts,
            format!(
                "WRITE({},{},{},{}):{}",
                inode,
                index,
                modification.version_bumped as u8,
                modification.lock_id,
                modification.chunk_id
            ),
        );
        Ok(WriteChunkGrant {
            chunk_id: modification.chunk_id,
            version: modification.version,
            lock_id: modification.lock_id,
            file_length,
        })
    }

    fn dir_quota_exceeded_for(&self, inode: InodeId) -> bool {
        self.node(inode)
            .ok()
            .map(|node| {
                node.parents
                    .iter()
                    .any(|&parent| self.dir_quota_exceeded(parent, 0, CHUNK_SIZE as i64))
            })
            .unwrap_or(false)
    }

    pub fn write_end(
        &mut self,
        ctx: &FsContext,
        inode: InodeId,
        length: u64,
        chunk_id: u64,
        lock_id: u32,
    ) -> FsResult<()> {
        self.chunks.can_unlock(chunk_id, lock_id)?;
        if length > 0 {
            let current = self.file_node_checked(inode)?.file().unwrap().length;
            if length > current {
                self.set_file_length(inode, length)?;
                let ts = ctx.ts;
                self.mutate_node(inode, |node| {
                    node.mtime = ts;
                    node.ctime = ts;
                })?;
                self.emit(ctx.ts, format!("LENGTH({},{})", inode, length));
            }
        }
        self.emit(ctx.ts, format!("UNLOCK({})", chunk_id));
        self.chunks.unlock(chunk_id)
    }

    pub fn increment_chunk_version(&mut self, ctx: &FsContext, chunk_id: u64) -> FsResult<u32> {
        let version = self.chunks.increase_version(chunk_id)?;
        self.emit(ctx.ts, format!("INCVERSION({})", chunk_id));
        Ok(version)
    }

    pub fn reserve_chunk_ids(&mut self, ctx: &FsContext, next: u64) -> FsResult<()> {
        self.chunks.set_next_chunk_id(next)?;
        self.emit(ctx.ts, format!("NEXTCHUNKID({})", next));
        Ok(())
    }

    // ========== sessions, open files ==========

    pub fn new_session(&mut self, ctx: &FsContext) -> SessionId {
        let id = self.next_session_id;
        self.next_session_id += 1;
        self.emit(ctx.ts, format!("SESSION():{}", id));
        id
    }

    pub fn acquire(&mut self, ctx: &FsContext, inode: InodeId, session: SessionId) -> FsResult<()> {
        {
            let node = self.file_node_checked(inode)?;
            if node.file().unwrap().sessions.contains(&session) {
                return Err(FsError::Inval);
            }
        }
        self.mutate_node(inode, |node| {
            node.file_mut().unwrap().sessions.push(session);
        })?;
        self.emit(ctx.ts, format!("ACQUIRE({},{})", inode, session));
        Ok(())
    }

    pub fn release(&mut self, ctx: &FsContext, inode: InodeId, session: SessionId) -> FsResult<()> {
        let (found, now_empty, state) = {
            let node = self.file_node_checked(inode)?;
            let file = node.file().unwrap();
            let found = file.sessions.contains(&session);
            (found, file.sessions.len() == 1, file.state)
        };
        if !found {
            warn!("release: session {} not found on inode {}", session, inode);
            return Err(FsError::Inval);
        }
        if now_empty && state == FileState::Reserved {
            // Last holder of a reserved file: purge it now.
            self.destroy_node(inode)?;
        } else {
            self.mutate_node(inode, |node| {
                let file = node.file_mut().unwrap();
                file.sessions.retain(|&s| s != session);
            })?;
        }
        self.emit(ctx.ts, format!("RELEASE({},{})", inode, session));
        Ok(())
    }

    // ========== trash ==========

    pub fn undel(&mut self, ctx: &FsContext, inode: InodeId) -> FsResult<()> {
        {
            let node = self.node(inode)?;
            if node.file().map(|f| f.state) != Some(FileState::Trash) {
                return Err(FsError::NoEnt);
            }
        }
        self.undelete(ctx.ts, inode)?;
        self.emit(ctx.ts, format!("UNDEL({})", inode));
        Ok(())
    }

    pub fn purge(&mut self, ctx: &FsContext, inode: InodeId) -> FsResult<()> {
        {
            let node = self.node(inode)?;
            if node.file().map(|f| f.state) != Some(FileState::Trash) {
                return Err(FsError::NoEnt);
            }
        }
        self.purge_node(inode)?;
        self.emit(ctx.ts, format!("PURGE({})", inode));
        Ok(())
    }

    pub fn set_trash_path(&mut self, ctx: &FsContext, inode: InodeId, path: &str) -> FsResult<()> {
        if path.is_empty() || path.bytes().any(|b| b == 0) {
            return Err(FsError::Inval);
        }
        let entry = self.trash.get_mut(&inode).ok_or(FsError::NoEnt)?;
        entry.path = path.to_string();
        self.emit(
            ctx.ts,
            format!("SETPATH({},{})", inode, escape_name(path)),
        );
        Ok(())
    }

    pub fn trash_path(&self, inode: InodeId) -> FsResult<String> {
        self.trash
            .get(&inode)
            .map(|entry| entry.path.clone())
            .ok_or(FsError::NoEnt)
    }

    /// Expire trash entries whose retention has passed. Entries still held
    /// open demote to Reserved instead of being destroyed.
    pub fn expire_trash(&mut self, ctx: &FsContext, limit: usize) -> FsResult<u32> {
        let expired: Vec<InodeId> = self
            .trash
            .iter()
            .filter(|(_, entry)| entry.expire_ts <= ctx.ts)
            .map(|(&id, _)| id)
            .take(limit)
            .collect();
        let mut purged = 0;
        for inode in expired {
            self.purge_node(inode)?;
            self.emit(ctx.ts, format!("PURGE({})", inode));
            purged += 1;
        }
        Ok(purged)
    }

    // ========== recursive attribute operations ==========

    /// Update one node's goal; the building block of the recursive task.
    pub(crate) fn setgoal_single(
        &mut self,
        ts: u32,
        inode: InodeId,
        uid: u32,
        goal: u8,
        counters: &mut TaskCounters,
    ) -> FsResult<()> {
        let node = self.node(inode)?;
        if !matches!(node.kind, NodeKind::File(_) | NodeKind::Directory(_)) {
            return Ok(());
        }
        if uid != 0 && uid != node.uid {
            counters.not_permitted += 1;
            return Ok(());
        }
        if node.goal == goal {
            counters.not_changed += 1;
            return Ok(());
        }
        let old_goal = node.goal;
        let is_file = node.is_file();
        self.with_file_bookkeeping(inode, |node| {
            node.goal = goal;
            node.ctime = ts;
        })?;
        if is_file {
            // Chunk references are tracked per goal id.
            let chunk_ids: Vec<u64> = self
                .node(inode)?
                .file()
                .map(|f| f.chunks.iter().copied().filter(|&c| c != 0).collect())
                .unwrap_or_default();
            for chunk in chunk_ids {
                self.chunks.remove_file_ref(chunk, old_goal);
                self.chunks.add_file_ref(chunk, goal);
            }
        }
        counters.changed += 1;
        Ok(())
    }

    pub(crate) fn settrashtime_single(
        &mut self,
        ts: u32,
        inode: InodeId,
        uid: u32,
        trashtime: u32,
        smode: u8,
        counters: &mut TaskCounters,
    ) -> FsResult<()> {
        let node = self.node(inode)?;
        if !matches!(node.kind, NodeKind::File(_) | NodeKind::Directory(_)) {
            return Ok(());
        }
        if uid != 0 && uid != node.uid {
            counters.not_permitted += 1;
            return Ok(());
        }
        let new_value = match smode & 0x3 {
            SMODE_INCREASE => node.trashtime.max(trashtime),
            SMODE_DECREASE => node.trashtime.min(trashtime),
            _ => trashtime,
        };
        if node.trashtime == new_value {
            counters.not_changed += 1;
            return Ok(());
        }
        self.mutate_node(inode, |node| {
            node.trashtime = new_value;
            node.ctime = ts;
        })?;
        counters.changed += 1;
        Ok(())
    }

    pub(crate) fn seteattr_single(
        &mut self,
        ts: u32,
        inode: InodeId,
        uid: u32,
        eattr: u8,
        counters: &mut TaskCounters,
    ) -> FsResult<()> {
        let node = self.node(inode)?;
        if uid != 0 && uid != node.uid {
            counters.not_permitted += 1;
            return Ok(());
        }
        if node.eattr == eattr {
            counters.not_changed += 1;
            return Ok(());
        }
        self.mutate_node(inode, |node| {
            node.eattr = eattr;
            node.ctime = ts;
        })?;
        counters.changed += 1;
        Ok(())
    }

    fn subtree_inodes(&self, root: InodeId, recursive: bool) -> FsResult<Vec<InodeId>> {
        let mut result = Vec::new();
        let mut stack = vec![root];
        while let Some(current) = stack.pop() {
            result.push(current);
            if !recursive {
                break;
            }
            if let Some(dir) = self.node(current)?.directory() {
                stack.extend(dir.entries.values().copied());
            }
        }
        Ok(result)
    }

    pub fn setgoal(
        &mut self,
        ctx: &FsContext,
        inode: InodeId,
        goal: u8,
        smode: u8,
    ) -> FsResult<TaskCounters> {
        self.check_not_readonly(ctx)?;
        if !Goal::is_valid_id(goal) || smode & (SMODE_INCREASE | SMODE_DECREASE) != 0 {
            return Err(FsError::Inval);
        }
        self.node(inode)?;
        let mut counters = TaskCounters::default();
        for id in self.subtree_inodes(inode, smode & SMODE_RECURSIVE != 0)? {
            self.setgoal_single(ctx.ts, id, ctx.uid, goal, &mut counters)?;
        }
        if smode & SMODE_RECURSIVE == 0
            && counters.not_permitted > 0
            && counters.changed == 0
            && counters.not_changed == 0
        {
            return Err(FsError::Perm);
        }
        self.emit(
            ctx.ts,
            format!(
                "SETGOAL({},{},{},{}):{},{},{}",
                inode,
                ctx.uid,
                goal,
                smode,
                counters.changed,
                counters.not_changed,
                counters.not_permitted
            ),
        );
        Ok(counters)
    }

    pub fn settrashtime(
        &mut self,
        ctx: &FsContext,
        inode: InodeId,
        trashtime: u32,
        smode: u8,
    ) -> FsResult<TaskCounters> {
        self.check_not_readonly(ctx)?;
        if smode & 0x3 == 0x3 {
            return Err(FsError::Inval);
        }
        self.node(inode)?;
        let mut counters = TaskCounters::default();
        for id in self.subtree_inodes(inode, smode & SMODE_RECURSIVE != 0)? {
            self.settrashtime_single(ctx.ts, id, ctx.uid, trashtime, smode, &mut counters)?;
        }
        if smode & SMODE_RECURSIVE == 0
            && counters.not_permitted > 0
            && counters.changed == 0
            && counters.not_changed == 0
        {
            return Err(FsError::Perm);
        }
        self.emit(
            ctx.ts,
            format!(
                "SETTRASHTIME({},{},{},{}):{},{},{}",
                inode,
                ctx.uid,
                trashtime,
                smode,
                counters.changed,
                counters.not_changed,
                counters.not_permitted
            ),
        );
        Ok(counters)
    }

    pub fn seteattr(
        &mut self,
        ctx: &FsContext,
        inode: InodeId,
        eattr: u8,
        smode: u8,
    ) -> FsResult<TaskCounters> {
        self.check_not_readonly(ctx)?;
        if eattr & !EATTR_MASK != 0 {
            return Err(FsError::Inval);
        }
        self.node(inode)?;
        let mut counters = TaskCounters::default();
        for id in self.subtree_inodes(inode, smode & SMODE_RECURSIVE != 0)? {
            self.seteattr_single(ctx.ts, id, ctx.uid, eattr, &mut counters)?;
        }
        if smode & SMODE_RECURSIVE == 0
            && counters.not_permitted > 0
            && counters.changed == 0
            && counters.not_changed == 0
        {
            return Err(FsError::Perm);
        }
        self.emit(
            ctx.ts,
            format!(
                "SETEATTR({},{},{},{}):{},{},{}",
                inode,
                ctx.uid,
                eattr,
                smode,
                counters.changed,
                counters.not_changed,
                counters.not_permitted
            ),
        );
        Ok(counters)
    }

    // ========== xattr / ACL ==========

    pub fn setxattr(
        &mut self,
        ctx: &FsContext,
        inode: InodeId,
        name: &str,
        value: &[u8],
        mode: u8,
    ) -> FsResult<()> {
        self.check_not_readonly(ctx)?;
        if name.is_empty() || name.len() > 255 || name.bytes().any(|b| b == 0) || mode > XATTR_REMOVE
        {
            return Err(FsError::Inval);
        }
        {
            let node = self.node(inode)?;
            if ctx.uid != 0 && !self.access(node, ctx.uid, ctx.gid, MODE_MASK_W) {
                return Err(FsError::Access);
            }
        }
        let exists = self.node(inode)?.xattrs.contains_key(name);
        match mode {
            XATTR_CREATE_ONLY if exists => return Err(FsError::Exist),
            XATTR_REPLACE_ONLY if !exists => return Err(FsError::NoEnt),
            XATTR_REMOVE if !exists => return Err(FsError::NoEnt),
            _ => {}
        }
        let ts = ctx.ts;
        let value_vec = value.to_vec();
        let name_owned = name.to_string();
        self.mutate_node(inode, |node| {
            if mode == XATTR_REMOVE {
                node.xattrs.remove(&name_owned);
            } else {
                node.xattrs.insert(name_owned.clone(), value_vec);
            }
            node.ctime = ts;
        })?;
        let value_text = String::from_utf8_lossy(value).into_owned();
        self.emit(
            ctx.ts,
            format!(
                "SETXATTR({},{},{},{})",
                inode,
                escape_name(name),
                escape_name(&value_text),
                mode
            ),
        );
        Ok(())
    }

    pub fn getxattr(&self, inode: InodeId, name: &str) -> FsResult<Vec<u8>> {
        self.node(inode)?
            .xattrs
            .get(name)
            .cloned()
            .ok_or(FsError::NoEnt)
    }

    pub fn listxattr(&self, inode: InodeId) -> FsResult<Vec<String>> {
        Ok(self.node(inode)?.xattrs.keys().cloned().collect())
    }

    pub fn setacl(
        &mut self,
        ctx: &FsContext,
        inode: InodeId,
        variant: AclVariant,
        acl: AccessControlList,
    ) -> FsResult<()> {
        self.check_not_readonly(ctx)?;
        let acl_text = acl.to_record_string();
        let ts = ctx.ts;
        self.mutate_node(inode, |node| {
            match variant {
                AclVariant::Access => node.access_acl = Some(acl),
                AclVariant::Default => node.default_acl = Some(acl),
            }
            node.ctime = ts;
        })?;
        self.emit(
            ctx.ts,
            format!(
                "SETACL({},{},{})",
                inode,
                variant.type_char(),
                escape_name(&acl_text)
            ),
        );
        Ok(())
    }

    pub fn deleteacl(
        &mut self,
        ctx: &FsContext,
        inode: InodeId,
        variant: AclVariant,
    ) -> FsResult<()> {
        self.check_not_readonly(ctx)?;
        let ts = ctx.ts;
        self.mutate_node(inode, |node| {
            match variant {
                AclVariant::Access => node.access_acl = None,
                AclVariant::Default => node.default_acl = None,
            }
            node.ctime = ts;
        })?;
        self.emit(
            ctx.ts,
            format!("DELETEACL({},{})", inode, variant.type_char()),
        );
        Ok(())
    }

    pub fn getacl(&self, inode: InodeId, variant: AclVariant) -> FsResult<AccessControlList> {
        let node = self.node(inode)?;
        let acl = match variant {
            AclVariant::Access => &node.access_acl,
            AclVariant::Default => &node.default_acl,
        };
        acl.clone().ok_or(FsError::NoEnt)
    }

    // ========== append / repair ==========

    pub fn append(&mut self, ctx: &FsContext, inode: InodeId, inode_src: InodeId) -> FsResult<()> {
        self.check_not_readonly(ctx)?;
        if inode == inode_src {
            return Err(FsError::Inval);
        }
        {
            let dst = self.file_node_checked(inode)?;
            if !self.access(dst, ctx.uid, ctx.gid, MODE_MASK_W) {
                return Err(FsError::Access);
            }
            let src = self.file_node_checked(inode_src)?;
            if !self.access(src, ctx.uid, ctx.gid, MODE_MASK_R) {
                return Err(FsError::Access);
            }
        }
        {
            let node = self.node(inode)?;
            if self.quota_exceeded_for_growth(node.uid, node.gid) {
                return Err(FsError::Quota);
            }
        }
        self.append_chunks(ctx.ts, inode, inode_src)?;
        self.emit(ctx.ts, format!("APPEND({},{})", inode, inode_src));
        Ok(())
    }

    /// Walk a file's chunks and reconcile metadata with the copies the
    /// chunkservers actually hold. A chunk whose current version is still
    /// present somewhere is a no-op.
    pub fn repair(
        &mut self,
        ctx: &FsContext,
        inode: InodeId,
    ) -> FsResult<(u32, u32, u32)> {
        self.check_not_readonly(ctx)?;
        {
            let node = self.file_node_checked(inode)?;
            if !self.access(node, ctx.uid, ctx.gid, MODE_MASK_W) {
                return Err(FsError::Access);
            }
        }
        let chunks: Vec<(u32, u64)> = {
            let file = self.node(inode)?.file().unwrap();
            file.chunks
                .iter()
                .enumerate()
                .filter(|(_, &c)| c != 0)
                .map(|(i, &c)| (i as u32, c))
                .collect()
        };
        let mut not_changed = 0;
        let mut erased = 0;
        let mut repaired = 0;
        let goal = self.node(inode)?.goal;
        for (index, chunk_id) in chunks {
            match self.chunks.repair(chunk_id) {
                None => not_changed += 1,
                Some(0) => {
                    self.chunks.remove_file_ref(chunk_id, goal);
                    self.with_file_bookkeeping(inode, |node| {
                        node.file_mut().unwrap().chunks[index as usize] = 0;
                        node.mtime = ctx.ts;
                        node.ctime = ctx.ts;
                    })?;
                    erased += 1;
                    self.emit(ctx.ts, format!("REPAIR({},{}):0", inode, index));
                }
                Some(version) => {
                    let ts = ctx.ts;
                    self.mutate_node(inode, |node| {
                        node.mtime = ts;
                        node.ctime = ts;
                    })?;
                    repaired += 1;
                    self.emit(ctx.ts, format!("REPAIR({},{}):{}", inode, index, version));
                }
            }
        }
        Ok((not_changed, erased, repaired))
    }

    // ========== quota administration ==========

    pub fn set_quota(
        &mut self,
        ctx: &FsContext,
        owner_type: QuotaOwnerType,
        owner_id: u32,
        rigor: QuotaRigor,
        resource: QuotaResource,
        limit: u64,
    ) -> FsResult<()> {
        if ctx.uid != 0 {
            return Err(FsError::Perm);
        }
        self.quota.set(rigor, resource, owner_type, owner_id, limit);
        self.emit(
            ctx.ts,
            format!(
                "SETQUOTA({},{},{},{},{})",
                match owner_type {
                    QuotaOwnerType::User => "u",
                    QuotaOwnerType::Group => "g",
                },
                owner_id,
                match rigor {
                    QuotaRigor::Soft => "s",
                    QuotaRigor::Hard => "h",
                },
                match resource {
                    QuotaResource::Inodes => "i",
                    QuotaResource::Size => "b",
                },
                limit
            ),
        );
        Ok(())
    }

    // ========== file locks ==========

    #[allow(clippy::too_many_arguments)]
    pub fn lock_op(
        &mut self,
        ctx: &FsContext,
        flock: bool,
        inode: InodeId,
        start: u64,
        end: u64,
        owner: LockOwner,
        op: LockOp,
        nonblocking: bool,
    ) -> FsResult<(bool, Vec<LockOwner>)> {
        self.node(inode)?;
        let (start, end) = if flock { (0, 1) } else { (start, end) };
        let table = if flock {
            &mut self.flock_locks
        } else {
            &mut self.posix_locks
        };

        let (success, scan_range) = match op {
            LockOp::Shared => (table.shared_lock(inode, start, end, owner, nonblocking), None),
            LockOp::Exclusive => (
                table.exclusive_lock(inode, start, end, owner, nonblocking),
                None,
            ),
            LockOp::Release => {
                table.remove_pending(inode, |lock| {
                    lock.owner.sessionid == owner.sessionid && lock.owner.owner == owner.owner
                });
                (
                    table.unlock(inode, 0, u64::MAX, owner),
                    Some((0, u64::MAX)),
                )
            }
            LockOp::Unlock => (
                table.unlock(inode, start, end, owner),
                Some((start, end)),
            ),
        };

        // Unlocks (and shared downgrades) can unblock pending candidates.
        let mut applied = Vec::new();
        if op != LockOp::Exclusive {
            let (scan_start, scan_end) = scan_range.unwrap_or((start, end));
            let candidates = table.gather_candidates(inode, scan_start, scan_end);
            for candidate in candidates {
                if table.apply(inode, candidate) {
                    applied.push(candidate.owner);
                }
            }
        }

        // A denied nonblocking attempt neither applies nor queues anything,
        // so it must not reach the changelog: replay runs blocking and
        // would queue a pending lock the master never kept.
        if success || !nonblocking {
            let (log_start, log_end) = scan_range.unwrap_or((start, end));
            self.emit(
                ctx.ts,
                format!(
                    "FLCK({},{},{},{},{},{},{})",
                    if flock { 1 } else { 2 },
                    inode,
                    log_start,
                    log_end,
                    owner.owner,
                    owner.sessionid,
                    op.to_u16()
                ),
            );
        }
        if success {
            Ok((true, applied))
        } else if nonblocking {
            Err(FsError::Waiting)
        } else {
            Ok((false, applied))
        }
    }

    pub fn lock_probe(
        &self,
        flock: bool,
        inode: InodeId,
        start: u64,
        end: u64,
        owner: LockOwner,
        exclusive: bool,
    ) -> FsResult<Option<Lock>> {
        self.node(inode)?;
        let table = if flock {
            &self.flock_locks
        } else {
            &self.posix_locks
        };
        let kind = if exclusive {
            LockKind::Exclusive
        } else {
            LockKind::Shared
        };
        Ok(table.probe(inode, kind, start, end, owner))
    }

    pub fn locks_clear_session(
        &mut self,
        ctx: &FsContext,
        flock: bool,
        inode: InodeId,
        session: SessionId,
    ) -> FsResult<Vec<LockOwner>> {
        let table = if flock {
            &mut self.flock_locks
        } else {
            &mut self.posix_locks
        };
        table.remove_pending(inode, |lock| lock.owner.sessionid == session);
        let (start, end) = table.unlock_matching(inode, |owner| owner.sessionid == session);
        let mut applied = Vec::new();
        if start < end {
            for candidate in table.gather_candidates(inode, start, end) {
                if table.apply(inode, candidate) {
                    applied.push(candidate.owner);
                }
            }
        }
        self.emit(
            ctx.ts,
            format!("CLRLCK({},{},{})", if flock { 1 } else { 2 }, inode, session),
        );
        Ok(applied)
    }

    pub fn locks_unlock_inode(
        &mut self,
        ctx: &FsContext,
        flock: bool,
        inode: InodeId,
    ) -> FsResult<Vec<LockOwner>> {
        let table = if flock {
            &mut self.flock_locks
        } else {
            &mut self.posix_locks
        };
        table.unlock_inode(inode);
        let mut applied = Vec::new();
        for candidate in table.gather_candidates(inode, 0, u64::MAX) {
            if table.apply(inode, candidate) {
                applied.push(candidate.owner);
            }
        }
        self.emit(
            ctx.ts,
            format!("FLCKINODE({},{})", if flock { 1 } else { 2 }, inode),
        );
        Ok(applied)
    }

    pub fn locks_remove_pending(
        &mut self,
        ctx: &FsContext,
        flock: bool,
        owner: u64,
        session: SessionId,
        inode: InodeId,
        reqid: u32,
    ) -> FsResult<()> {
        let table = if flock {
            &mut self.flock_locks
        } else {
            &mut self.posix_locks
        };
        table.remove_pending(inode, |lock| {
            lock.owner.owner == owner
                && lock.owner.sessionid == session
                && lock.owner.reqid == reqid
        });
        self.emit(
            ctx.ts,
            format!(
                "RMPLOCK({},{},{},{},{})",
                if flock { 1 } else { 2 },
                owner,
                session,
                inode,
                reqid
            ),
        );
        Ok(())
    }

    // ========== statfs ==========

    pub fn statfs(&self) -> (u64, u32, u64, u32, u32) {
        let (trash_space, trash_nodes) = self.trash_space();
        let (reserved_space, reserved_nodes) = self.reserved_space();
        let (inodes, _, _) = self.counts();
        (
            trash_space,
            trash_nodes,
            reserved_space,
            reserved_nodes,
            inodes,
        )
    }
}
