//! Shadow/replay handlers. Each performs the same mutation as the master
//! op but takes its inputs from a changelog record and refuses with
//! `Mismatch` when the locally produced result diverges from the encoded
//! one (allocated inode id, chunk id, task counters, session id). The
//! dispatcher in `changelog.rs` bumps the metadata version after a
//! successful handler.

use crate::locks::LockOwner;
use crate::metadata::{node_kind_for_create, FsMetadata};
use crate::node::{AclVariant, AccessControlList, FileState, InodeId, SessionId};
use crate::ops::{LockOp, TaskCounters};
use crate::quota::{QuotaOwnerType, QuotaResource, QuotaRigor};
use crate::{FsError, FsResult};

impl FsMetadata {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn apply_create(
        &mut self,
        ts: u32,
        parent: InodeId,
        name: &str,
        type_char: char,
        mode: u16,
        uid: u32,
        gid: u32,
        rdev: u32,
        inode: InodeId,
    ) -> FsResult<()> {
        let kind = node_kind_for_create(type_char, rdev)?;
        if self.name_is_used(parent, name) {
            return Err(FsError::Exist);
        }
        let created = self.create_node(ts, parent, name, kind, mode, uid, gid, Some(inode))?;
        if created != inode {
            return Err(FsError::Mismatch);
        }
        Ok(())
    }

    pub(crate) fn apply_symlink(
        &mut self,
        ts: u32,
        parent: InodeId,
        name: &str,
        path: &str,
        uid: u32,
        gid: u32,
        inode: InodeId,
    ) -> FsResult<()> {
        if self.name_is_used(parent, name) {
            return Err(FsError::Exist);
        }
        let created = self.create_node(
            ts,
            parent,
            name,
            crate::node::NodeKind::Symlink(path.to_string()),
            0o777,
            uid,
            gid,
            Some(inode),
        )?;
        if created != inode {
            return Err(FsError::Mismatch);
        }
        Ok(())
    }

    pub(crate) fn apply_unlink(
        &mut self,
        ts: u32,
        parent: InodeId,
        name: &str,
        inode: InodeId,
    ) -> FsResult<()> {
        let child = self.lookup_child(parent, name)?;
        if child != inode {
            return Err(FsError::Mismatch);
        }
        {
            let node = self.node(child)?;
            if let Some(dir) = node.directory() {
                if !dir.entries.is_empty() {
                    return Err(FsError::NotEmpty);
                }
            }
        }
        let is_dir = self.node(child)?.is_directory();
        let path = self.full_path(child)?;
        self.remove_edge(ts, parent, name, child)?;
        if is_dir {
            self.destroy_node(child)?;
        } else {
            self.dispose_unlinked(ts, child, path)?;
        }
        Ok(())
    }

    pub(crate) fn apply_move(
        &mut self,
        ts: u32,
        src_parent: InodeId,
        src_name: &str,
        dst_parent: InodeId,
        dst_name: &str,
        inode: InodeId,
    ) -> FsResult<()> {
        let child = self.lookup_child(src_parent, src_name)?;
        if child != inode {
            return Err(FsError::Mismatch);
        }
        match self.lookup_child(dst_parent, dst_name) {
            Ok(existing) => {
                if let Some(dir) = self.node(existing)?.directory() {
                    if !dir.entries.is_empty() {
                        return Err(FsError::NotEmpty);
                    }
                }
                let path = self.full_path(existing)?;
                let is_dir = self.node(existing)?.is_directory();
                self.remove_edge(ts, dst_parent, dst_name, existing)?;
                if is_dir {
                    self.destroy_node(existing)?;
                } else {
                    self.dispose_unlinked(ts, existing, path)?;
                }
            }
            Err(FsError::NoEnt) => {}
            Err(err) => return Err(err),
        }
        self.remove_edge(ts, src_parent, src_name, child)?;
        self.add_edge(ts, dst_parent, child, dst_name)?;
        Ok(())
    }

    pub(crate) fn apply_link(
        &mut self,
        ts: u32,
        inode: InodeId,
        parent: InodeId,
        name: &str,
    ) -> FsResult<()> {
        if self.name_is_used(parent, name) {
            return Err(FsError::Exist);
        }
        self.add_edge(ts, parent, inode, name)
    }

    pub(crate) fn apply_trunc(
        &mut self,
        _ts: u32,
        inode: InodeId,
        index: u32,
        lock_id: u32,
        chunk_id: u64,
    ) -> FsResult<()> {
        let goal = self.node(inode)?.goal;
        let old_chunk_id = {
            let file = self.file_node_checked(inode)?.file().unwrap();
            *file.chunks.get(index as usize).ok_or(FsError::Inval)?
        };
        if old_chunk_id == 0 {
            return Err(FsError::NoChunk);
        }
        let produced = self
            .chunks
            .apply_modification(old_chunk_id, lock_id, goal, true, chunk_id)?;
        if produced != chunk_id {
            return Err(FsError::Mismatch);
        }
        self.with_file_bookkeeping(inode, |node| {
            node.file_mut().unwrap().chunks[index as usize] = chunk_id;
        })?;
        Ok(())
    }

    pub(crate) fn apply_length(&mut self, ts: u32, inode: InodeId, length: u64) -> FsResult<()> {
        self.file_node_checked(inode)?;
        self.set_file_length(inode, length)?;
        self.mutate_node(inode, |node| {
            node.mtime = ts;
            node.ctime = ts;
        })?;
        Ok(())
    }

    pub(crate) fn apply_write(
        &mut self,
        ts: u32,
        inode: InodeId,
        index: u32,
        increase_version: bool,
        lock_id: u32,
        chunk_id: u64,
    ) -> FsResult<()> {
        self.file_node_checked(inode)?;
        let goal = self.node(inode)?.goal;
        let needs_growth = {
            let file = self.node(inode)?.file().unwrap();
            index as usize >= file.chunks.len()
        };
        if needs_growth {
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
        let produced =
            self.chunks
                .apply_modification(old_chunk_id, lock_id, goal, increase_version, chunk_id)?;
        if produced != chunk_id {
            return Err(FsError::Mismatch);
        }
        self.with_file_bookkeeping(inode, |node| {
            node.mtime = ts;
            node.ctime = ts;
            node.file_mut().unwrap().chunks[index as usize] = chunk_id;
        })?;
        Ok(())
    }

    pub(crate) fn apply_unlock(&mut self, chunk_id: u64) -> FsResult<()> {
        self.chunks.unlock(chunk_id)
    }

    pub(crate) fn apply_attr(
        &mut self,
        ts: u32,
        inode: InodeId,
        mode: u16,
        uid: u32,
        gid: u32,
        atime: u32,
        mtime: u32,
    ) -> FsResult<()> {
        if mode > 0o7777 {
            return Err(FsError::Inval);
        }
        let (old_uid, old_gid, size) = {
            let node = self.node(inode)?;
            (node.uid, node.gid, node.file_size())
        };
        self.mutate_node(inode, |node| {
            node.mode = mode;
            node.uid = uid;
            node.gid = gid;
            node.atime = atime;
            node.mtime = mtime;
            node.ctime = ts;
        })?;
        if uid != old_uid || gid != old_gid {
            self.quota
                .change_usage(QuotaResource::Inodes, old_uid, old_gid, -1);
            self.quota
                .change_usage(QuotaResource::Size, old_uid, old_gid, -(size as i64));
            self.quota.change_usage(QuotaResource::Inodes, uid, gid, 1);
            self.quota
                .change_usage(QuotaResource::Size, uid, gid, size as i64);
        }
        Ok(())
    }

    fn verify_counters(counters: TaskCounters, expected: &[u64]) -> FsResult<()> {
        if expected.len() != 3
            || counters.changed as u64 != expected[0]
            || counters.not_changed as u64 != expected[1]
            || counters.not_permitted as u64 != expected[2]
        {
            return Err(FsError::Mismatch);
        }
        Ok(())
    }

    fn subtree_for_apply(&self, root: InodeId, recursive: bool) -> FsResult<Vec<InodeId>> {
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

    pub(crate) fn apply_setgoal(
        &mut self,
        ts: u32,
        inode: InodeId,
        uid: u32,
        goal: u8,
        smode: u8,
        expected: &[u64],
    ) -> FsResult<()> {
        let mut counters = TaskCounters::default();
        for id in self.subtree_for_apply(inode, smode & crate::ops::SMODE_RECURSIVE != 0)? {
            self.setgoal_single(ts, id, uid, goal, &mut counters)?;
        }
        Self::verify_counters(counters, expected)
    }

    pub(crate) fn apply_settrashtime(
        &mut self,
        ts: u32,
        inode: InodeId,
        uid: u32,
        trashtime: u32,
        smode: u8,
        expected: &[u64],
    ) -> FsResult<()> {
        let mut counters = TaskCounters::default();
        for id in self.subtree_for_apply(inode, smode & crate::ops::SMODE_RECURSIVE != 0)? {
            self.settrashtime_single(ts, id, uid, trashtime, smode, &mut counters)?;
        }
        Self::verify_counters(counters, expected)
    }

    pub(crate) fn apply_seteattr(
        &mut self,
        ts: u32,
        inode: InodeId,
        uid: u32,
        eattr: u8,
        smode: u8,
        expected: &[u64],
    ) -> FsResult<()> {
        let mut counters = TaskCounters::default();
        for id in self.subtree_for_apply(inode, smode & crate::ops::SMODE_RECURSIVE != 0)? {
            self.seteattr_single(ts, id, uid, eattr, &mut counters)?;
        }
        Self::verify_counters(counters, expected)
    }

    pub(crate) fn apply_setxattr(
        &mut self,
        ts: u32,
        inode: InodeId,
        name: &str,
        value: Vec<u8>,
        mode: u8,
    ) -> FsResult<()> {
        if name.is_empty() || mode > crate::ops::XATTR_REMOVE {
            return Err(FsError::Inval);
        }
        let name_owned = name.to_string();
        self.mutate_node(inode, |node| {
            if mode == crate::ops::XATTR_REMOVE {
                node.xattrs.remove(&name_owned);
            } else {
                node.xattrs.insert(name_owned.clone(), value);
            }
            node.ctime = ts;
        })?;
        Ok(())
    }

    pub(crate) fn apply_setacl(
        &mut self,
        ts: u32,
        inode: InodeId,
        variant: AclVariant,
        acl_text: &str,
    ) -> FsResult<()> {
        let acl = AccessControlList::from_record_string(acl_text).ok_or(FsError::Inval)?;
        self.mutate_node(inode, |node| {
            match variant {
                AclVariant::Access => node.access_acl = Some(acl),
                AclVariant::Default => node.default_acl = Some(acl),
            }
            node.ctime = ts;
        })?;
        Ok(())
    }

    pub(crate) fn apply_deleteacl(
        &mut self,
        ts: u32,
        inode: InodeId,
        variant: AclVariant,
    ) -> FsResult<()> {
        self.mutate_node(inode, |node| {
            match variant {
                AclVariant::Access => node.access_acl = None,
                AclVariant::Default => node.default_acl = None,
            }
            node.ctime = ts;
        })?;
        Ok(())
    }

    pub(crate) fn apply_acquire(&mut self, inode: InodeId, session: SessionId) -> FsResult<()> {
        {
            let node = self.file_node_checked(inode)?;
            if node.file().unwrap().sessions.contains(&session) {
                return Err(FsError::Inval);
            }
        }
        self.mutate_node(inode, |node| {
            node.file_mut().unwrap().sessions.push(session);
        })
    }

    pub(crate) fn apply_release(
        &mut self,
        _ts: u32,
        inode: InodeId,
        session: SessionId,
    ) -> FsResult<()> {
        let (found, now_empty, state) = {
            let node = self.file_node_checked(inode)?;
            let file = node.file().unwrap();
            (
                file.sessions.contains(&session),
                file.sessions.len() == 1,
                file.state,
            )
        };
        if !found {
            return Err(FsError::Inval);
        }
        if now_empty && state == FileState::Reserved {
            self.destroy_node(inode)?;
        } else {
            self.mutate_node(inode, |node| {
                node.file_mut().unwrap().sessions.retain(|&s| s != session);
            })?;
        }
        Ok(())
    }

    pub(crate) fn apply_session(&mut self, session: SessionId) -> FsResult<()> {
        if session != self.next_session_id {
            return Err(FsError::Mismatch);
        }
        self.next_session_id += 1;
        Ok(())
    }

    pub(crate) fn apply_purge(&mut self, _ts: u32, inode: InodeId) -> FsResult<()> {
        let node = self.node(inode)?;
        if !node.is_detached() {
            return Err(FsError::NoEnt);
        }
        self.purge_node(inode)
    }

    pub(crate) fn apply_undel(&mut self, ts: u32, inode: InodeId) -> FsResult<()> {
        {
            let node = self.node(inode)?;
            if node.file().map(|f| f.state) != Some(FileState::Trash) {
                return Err(FsError::NoEnt);
            }
        }
        self.undelete(ts, inode)
    }

    pub(crate) fn apply_setpath(&mut self, inode: InodeId, path: &str) -> FsResult<()> {
        if path.is_empty() {
            return Err(FsError::Inval);
        }
        let entry = self.trash.get_mut(&inode).ok_or(FsError::NoEnt)?;
        entry.path = path.to_string();
        Ok(())
    }

    pub(crate) fn apply_repair(
        &mut self,
        ts: u32,
        inode: InodeId,
        index: u32,
        new_version: u32,
    ) -> FsResult<()> {
        let goal = self.node(inode)?.goal;
        let chunk_id = {
            let file = self.file_node_checked(inode)?.file().unwrap();
            *file.chunks.get(index as usize).ok_or(FsError::NoChunk)?
        };
        if chunk_id == 0 {
            return Err(FsError::NoChunk);
        }
        if new_version == 0 {
            self.chunks.remove_file_ref(chunk_id, goal);
            self.with_file_bookkeeping(inode, |node| {
                node.file_mut().unwrap().chunks[index as usize] = 0;
                node.mtime = ts;
                node.ctime = ts;
            })?;
        } else {
            self.chunks.set_version(chunk_id, new_version)?;
            self.mutate_node(inode, |node| {
                node.mtime = ts;
                node.ctime = ts;
            })?;
        }
        Ok(())
    }

    pub(crate) fn apply_append(
        &mut self,
        ts: u32,
        inode: InodeId,
        inode_src: InodeId,
    ) -> FsResult<()> {
        if inode == inode_src {
            return Err(FsError::Inval);
        }
        self.append_chunks(ts, inode, inode_src)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn apply_flock_op(
        &mut self,
        lock_type: u8,
        inode: InodeId,
        start: u64,
        end: u64,
        owner: u64,
        session: SessionId,
        op: u16,
    ) -> FsResult<()> {
        let flock = lock_type == 1;
        let owner = LockOwner {
            owner,
            sessionid: session,
            reqid: 0,
            msgid: 0,
        };
        let table = if flock {
            &mut self.flock_locks
        } else {
            &mut self.posix_locks
        };
        match LockOp::from_u16(op)? {
            LockOp::Shared => {
                table.shared_lock(inode, start, end, owner, false);
            }
            LockOp::Exclusive => {
                table.exclusive_lock(inode, start, end, owner, false);
            }
            LockOp::Release => {
                table.remove_pending(inode, |lock| {
                    lock.owner.sessionid == owner.sessionid && lock.owner.owner == owner.owner
                });
                table.unlock(inode, 0, u64::MAX, owner);
            }
            LockOp::Unlock => {
                table.unlock(inode, start, end, owner);
            }
        }
        // Mirror the master's unblock pass so pending queues stay in sync.
        if LockOp::from_u16(op)? != LockOp::Exclusive {
            for candidate in table.gather_candidates(inode, start, end) {
                table.apply(inode, candidate);
            }
        }
        Ok(())
    }

    pub(crate) fn apply_locks_clear_session(
        &mut self,
        lock_type: u8,
        inode: InodeId,
        session: SessionId,
    ) -> FsResult<()> {
        let table = if lock_type == 1 {
            &mut self.flock_locks
        } else {
            &mut self.posix_locks
        };
        table.remove_pending(inode, |lock| lock.owner.sessionid == session);
        let (start, end) = table.unlock_matching(inode, |owner| owner.sessionid == session);
        if start < end {
            for candidate in table.gather_candidates(inode, start, end) {
                table.apply(inode, candidate);
            }
        }
        Ok(())
    }

    pub(crate) fn apply_locks_unlock_inode(
        &mut self,
        lock_type: u8,
        inode: InodeId,
    ) -> FsResult<()> {
        let table = if lock_type == 1 {
            &mut self.flock_locks
        } else {
            &mut self.posix_locks
        };
        table.unlock_inode(inode);
        for candidate in table.gather_candidates(inode, 0, u64::MAX) {
            table.apply(inode, candidate);
        }
        Ok(())
    }

    pub(crate) fn apply_locks_remove_pending(
        &mut self,
        lock_type: u8,
        owner: u64,
        session: SessionId,
        inode: InodeId,
        reqid: u32,
    ) -> FsResult<()> {
        let table = if lock_type == 1 {
            &mut self.flock_locks
        } else {
            &mut self.posix_locks
        };
        table.remove_pending(inode, |lock| {
            lock.owner.owner == owner
                && lock.owner.sessionid == session
                && lock.owner.reqid == reqid
        });
        Ok(())
    }

    pub(crate) fn apply_incversion(&mut self, chunk_id: u64) -> FsResult<()> {
        self.chunks.increase_version(chunk_id).map(|_| ())
    }

    pub(crate) fn apply_setquota(
        &mut self,
        owner_type: &str,
        owner_id: u32,
        rigor: &str,
        resource: &str,
        limit: u64,
    ) -> FsResult<()> {
        let owner_type = match owner_type {
            "u" => QuotaOwnerType::User,
            "g" => QuotaOwnerType::Group,
            _ => return Err(FsError::Inval),
        };
        let rigor = match rigor {
            "s" => QuotaRigor::Soft,
            "h" => QuotaRigor::Hard,
            _ => return Err(FsError::Inval),
        };
        let resource = match resource {
            "i" => QuotaResource::Inodes,
            "b" => QuotaResource::Size,
            _ => return Err(FsError::Inval),
        };
        self.quota.set(rigor, resource, owner_type, owner_id, limit);
        Ok(())
    }
}
