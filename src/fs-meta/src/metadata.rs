//! The in-memory metadata graph: an arena of inodes indexed by id, with
//! directory entries as name→id maps and parent back-references on each
//! node. All mutation helpers keep aggregated directory stats, quota usage
//! and the running checksum consistent at every step.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::changelog::ChangelogSink;
use crate::chunks::ChunkRegistry;
use crate::goal::{Goal, DEFAULT_GOAL};
use crate::locks::FileLocks;
use crate::node::{
    name_is_valid, DirNode, FileNode, FileState, FsNode, InodeId, NodeKind, SessionId,
    StatsRecord, MODE_MASK_W, MODE_MASK_X, ROOT_INODE,
};
use crate::quota::{QuotaDatabase, QuotaLimits, QuotaResource, QuotaRigor};
use crate::{FsError, FsResult};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrashEntry {
    /// Path the node was reachable at when unlinked; undelete target.
    pub path: String,
    pub expire_ts: u32,
}

pub struct FsMetadata {
    pub(crate) nodes: HashMap<InodeId, FsNode>,
    pub(crate) next_inode: InodeId,
    pub metaversion: u64,
    /// XOR-fold of every node's record hash; O(1) to maintain.
    pub(crate) running_checksum: u64,
    pub(crate) trash: BTreeMap<InodeId, TrashEntry>,
    pub(crate) reserved: BTreeSet<InodeId>,
    pub quota: QuotaDatabase,
    pub(crate) dir_quota: HashMap<InodeId, QuotaLimits>,
    pub flock_locks: FileLocks,
    pub posix_locks: FileLocks,
    pub chunks: ChunkRegistry,
    pub(crate) next_session_id: SessionId,
    pub(crate) changelog: ChangelogSink,
}

impl FsMetadata {
    pub fn new() -> Self {
        let mut fs = Self {
            nodes: HashMap::new(),
            next_inode: ROOT_INODE + 1,
            metaversion: 1,
            running_checksum: 0,
            trash: BTreeMap::new(),
            reserved: BTreeSet::new(),
            quota: QuotaDatabase::new(),
            dir_quota: HashMap::new(),
            flock_locks: FileLocks::new(),
            posix_locks: FileLocks::new(),
            chunks: ChunkRegistry::new(),
            next_session_id: 1,
            changelog: ChangelogSink::new(),
        };
        let mut root = FsNode::new(
            ROOT_INODE,
            NodeKind::Directory(DirNode::default()),
            0o777,
            0,
            0,
            0,
        );
        root.checksum = root.compute_checksum();
        fs.running_checksum ^= root.checksum;
        fs.nodes.insert(ROOT_INODE, root);
        fs.quota.change_usage(QuotaResource::Inodes, 0, 0, 1);
        fs
    }

    pub fn changelog_mut(&mut self) -> &mut ChangelogSink {
        &mut self.changelog
    }

    // ---- node access ----

    pub fn node(&self, id: InodeId) -> FsResult<&FsNode> {
        self.nodes.get(&id).ok_or(FsError::NoEnt)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn counts(&self) -> (u32, u32, u32) {
        let mut dirs = 0;
        let mut files = 0;
        for node in self.nodes.values() {
            match node.kind {
                NodeKind::Directory(_) => dirs += 1,
                NodeKind::File(_) => files += 1,
                _ => {}
            }
        }
        (self.nodes.len() as u32, dirs, files)
    }

    /// Mutate a node while keeping its cached hash and the running
    /// checksum in sync.
    pub(crate) fn mutate_node<T>(
        &mut self,
        id: InodeId,
        mutate: impl FnOnce(&mut FsNode) -> T,
    ) -> FsResult<T> {
        let node = self.nodes.get_mut(&id).ok_or(FsError::NoEnt)?;
        self.running_checksum ^= node.checksum;
        let result = mutate(node);
        node.checksum = node.compute_checksum();
        self.running_checksum ^= node.checksum;
        Ok(result)
    }

    // ---- checksums ----

    /// Full metadata checksum: graph fold plus the sub-checksums of the
    /// quota database, lock tables and chunk registry.
    pub fn checksum(&self) -> u64 {
        self.running_checksum
            ^ self.quota.checksum()
            ^ self.flock_locks.checksum().rotate_left(1)
            ^ self.posix_locks.checksum().rotate_left(2)
            ^ self.chunks.checksum()
    }

    /// O(N) recomputation of the graph fold, for verification.
    pub fn recalculate_checksum(&self) -> u64 {
        let mut running = 0u64;
        for node in self.nodes.values() {
            running ^= node.compute_checksum();
        }
        running
            ^ self.quota.checksum()
            ^ self.flock_locks.checksum().rotate_left(1)
            ^ self.posix_locks.checksum().rotate_left(2)
            ^ self.chunks.checksum()
    }

    // ---- lookups, permissions ----

    pub fn lookup_child(&self, parent: InodeId, name: &str) -> FsResult<InodeId> {
        let node = self.node(parent)?;
        let dir = node.directory().ok_or(FsError::NotDir)?;
        dir.entries.get(name).copied().ok_or(FsError::NoEnt)
    }

    pub fn name_is_used(&self, parent: InodeId, name: &str) -> bool {
        self.node(parent)
            .ok()
            .and_then(|node| node.directory())
            .map(|dir| dir.entries.contains_key(name))
            .unwrap_or(false)
    }

    pub fn access(&self, node: &FsNode, uid: u32, gid: u32, mask: u8) -> bool {
        if uid == 0 {
            return true;
        }
        let mode = node.mode;
        let bits = if uid == node.uid {
            (mode >> 6) & 7
        } else if gid == node.gid {
            (mode >> 3) & 7
        } else {
            mode & 7
        } as u8;
        bits & mask == mask
    }

    /// Sticky-bit rule: in a sticky directory only root, the directory
    /// owner or the entry owner may remove/rename the entry.
    pub fn sticky_access(&self, parent: &FsNode, child: &FsNode, uid: u32) -> bool {
        if parent.mode & 0o1000 == 0 || uid == 0 {
            return true;
        }
        uid == parent.uid || uid == child.uid
    }

    pub fn is_ancestor(&self, ancestor: InodeId, node: InodeId) -> bool {
        let mut current = node;
        loop {
            if current == ancestor {
                return true;
            }
            match self.nodes.get(&current).and_then(|n| n.parents.first()) {
                Some(&parent) if parent != current => current = parent,
                _ => return false,
            }
        }
    }

    /// Absolute path of a linked node (first-parent chain).
    pub fn full_path(&self, id: InodeId) -> FsResult<String> {
        if id == ROOT_INODE {
            return Ok("/".to_string());
        }
        let mut segments: Vec<String> = Vec::new();
        let mut current = id;
        while current != ROOT_INODE {
            let node = self.node(current)?;
            let &parent = node.parents.first().ok_or(FsError::NoEnt)?;
            let parent_node = self.node(parent)?;
            let dir = parent_node.directory().ok_or(FsError::NotDir)?;
            let name = dir
                .entries
                .iter()
                .find(|(_, &child)| child == current)
                .map(|(name, _)| name.clone())
                .ok_or(FsError::NoEnt)?;
            segments.push(name);
            current = parent;
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }

    pub(crate) fn goal_of(&self, node: &FsNode) -> Goal {
        Goal::from_id(node.goal).unwrap_or_else(|_| Goal::from_id(DEFAULT_GOAL).unwrap())
    }

    pub(crate) fn stats_of(&self, id: InodeId) -> FsResult<StatsRecord> {
        let node = self.node(id)?;
        Ok(node.stats_entry(&self.goal_of(node)))
    }

    // ---- stats & quota propagation ----

    /// Add (or subtract) a stats delta at `dir` and every ancestor.
    pub(crate) fn propagate_stats(&mut self, dir: InodeId, delta: &StatsRecord, add: bool) {
        let mut current = dir;
        let mut hops = 0;
        loop {
            let parent = {
                let Ok(node) = self.node(current) else {
                    return;
                };
                node.parents.first().copied()
            };
            let updated = self.mutate_node(current, |node| {
                if let Some(dir) = node.directory_mut() {
                    if add {
                        dir.stats.add(delta);
                    } else {
                        dir.stats.sub(delta);
                    }
                    true
                } else {
                    false
                }
            });
            if updated != Ok(true) {
                return;
            }
            hops += 1;
            if hops > self.nodes.len() {
                warn!("stats propagation loop detected at inode {}", current);
                return;
            }
            match parent {
                Some(parent) => current = parent,
                None => return,
            }
        }
    }

    /// Run a mutation of one file node and rebalance stats and quota by
    /// the before/after difference.
    pub(crate) fn with_file_bookkeeping<T>(
        &mut self,
        id: InodeId,
        mutate: impl FnOnce(&mut FsNode) -> T,
    ) -> FsResult<T> {
        let before = self.stats_of(id)?;
        let result = self.mutate_node(id, mutate)?;
        let after = self.stats_of(id)?;
        let node = self.node(id)?;
        let (uid, gid) = (node.uid, node.gid);
        let parents = node.parents.clone();
        for parent in parents {
            self.propagate_stats(parent, &after, true);
            self.propagate_stats(parent, &before, false);
        }
        self.quota.change_usage(
            QuotaResource::Size,
            uid,
            gid,
            after.size as i64 - before.size as i64,
        );
        Ok(result)
    }

    pub fn quota_exceeded_for_new_inode(&self, uid: u32, gid: u32) -> bool {
        self.quota
            .is_exceeded(QuotaRigor::Hard, QuotaResource::Inodes, uid, gid)
    }

    pub fn quota_exceeded_for_growth(&self, uid: u32, gid: u32) -> bool {
        self.quota
            .is_exceeded(QuotaRigor::Hard, QuotaResource::Size, uid, gid)
    }

    /// Directory quota check at `dir` and every ancestor: would adding
    /// `inode_delta`/`size_delta` break a per-directory limit?
    pub fn dir_quota_exceeded(&self, dir: InodeId, inode_delta: i64, size_delta: i64) -> bool {
        let mut current = dir;
        loop {
            if let Some(limits) = self.dir_quota.get(&current) {
                let Ok(node) = self.node(current) else {
                    return false;
                };
                if let Some(dir_node) = node.directory() {
                    let inodes = dir_node.stats.inodes as i64 + inode_delta;
                    let size = dir_node.stats.size as i64 + size_delta;
                    if limits.inodes_hard_limit != 0
                        && inodes > limits.inodes_hard_limit as i64
                    {
                        return true;
                    }
                    if limits.bytes_hard_limit != 0 && size > limits.bytes_hard_limit as i64 {
                        return true;
                    }
                }
            }
            match self.nodes.get(&current).and_then(|n| n.parents.first()) {
                Some(&parent) if parent != current => current = parent,
                _ => return false,
            }
        }
    }

    pub fn set_dir_quota(&mut self, dir: InodeId, limits: QuotaLimits) {
        if limits.is_empty() {
            self.dir_quota.remove(&dir);
        } else {
            self.dir_quota.insert(dir, limits);
        }
    }

    // ---- node lifecycle ----

    pub(crate) fn allocate_inode_id(&mut self, forced: Option<InodeId>) -> FsResult<InodeId> {
        match forced {
            Some(id) => {
                // Replay path: the id must be exactly the next one.
                if id != self.next_inode {
                    return Err(FsError::Mismatch);
                }
                self.next_inode += 1;
                Ok(id)
            }
            None => {
                let id = self.next_inode;
                self.next_inode += 1;
                Ok(id)
            }
        }
    }

    /// Create a node and link it under `parent` as `name`. Goal and
    /// trashtime are inherited from the parent directory; a default ACL on
    /// the parent is inherited by the child.
    pub(crate) fn create_node(
        &mut self,
        ts: u32,
        parent: InodeId,
        name: &str,
        kind: NodeKind,
        mode: u16,
        uid: u32,
        gid: u32,
        forced_id: Option<InodeId>,
    ) -> FsResult<InodeId> {
        let (parent_goal, parent_trashtime, parent_default_acl) = {
            let parent_node = self.node(parent)?;
            if !parent_node.is_directory() {
                return Err(FsError::NotDir);
            }
            (
                parent_node.goal,
                parent_node.trashtime,
                parent_node.default_acl.clone(),
            )
        };
        let id = self.allocate_inode_id(forced_id)?;
        let mut node = FsNode::new(id, kind, mode & 0o7777, uid, gid, ts);
        node.goal = parent_goal;
        node.trashtime = parent_trashtime;
        if let Some(acl) = parent_default_acl {
            node.access_acl = Some(acl.clone());
            if node.is_directory() {
                node.default_acl = Some(acl);
            }
        }
        node.checksum = node.compute_checksum();
        self.running_checksum ^= node.checksum;
        self.nodes.insert(id, node);
        self.quota.change_usage(QuotaResource::Inodes, uid, gid, 1);
        self.add_edge(ts, parent, id, name)?;
        Ok(id)
    }

    /// Insert edge (parent, name) -> child and flow stats upward.
    pub(crate) fn add_edge(
        &mut self,
        ts: u32,
        parent: InodeId,
        child: InodeId,
        name: &str,
    ) -> FsResult<()> {
        let child_stats = self.stats_of(child)?;
        self.mutate_node(parent, |node| {
            let dir = node.directory_mut().expect("edge into non-directory");
            dir.entries.insert(name.to_string(), child);
            node.mtime = ts;
            node.ctime = ts;
        })?;
        self.mutate_node(child, |node| {
            node.parents.push(parent);
            node.ctime = ts;
            if let Some(file) = node.file_mut() {
                file.state = FileState::Linked;
            }
        })?;
        self.propagate_stats(parent, &child_stats, true);
        Ok(())
    }

    /// Remove edge (parent, name) -> child; the child may become orphaned
    /// (caller decides its fate).
    pub(crate) fn remove_edge(
        &mut self,
        ts: u32,
        parent: InodeId,
        name: &str,
        child: InodeId,
    ) -> FsResult<()> {
        let child_stats = self.stats_of(child)?;
        self.mutate_node(parent, |node| {
            let dir = node.directory_mut().expect("edge from non-directory");
            dir.entries.remove(name);
            node.mtime = ts;
            node.ctime = ts;
        })?;
        self.mutate_node(child, |node| {
            if let Some(position) = node.parents.iter().position(|&p| p == parent) {
                node.parents.remove(position);
            }
            node.ctime = ts;
        })?;
        self.propagate_stats(parent, &child_stats, false);
        Ok(())
    }

    /// Unlink semantics after the edge is gone: hard links keep the node
    /// alive; otherwise open files go to Reserved, files with a trashtime
    /// go to Trash, everything else is destroyed.
    pub(crate) fn dispose_unlinked(&mut self, ts: u32, child: InodeId, path: String) -> FsResult<()> {
        let node = self.node(child)?;
        if !node.parents.is_empty() {
            return Ok(());
        }
        let (has_sessions, trashtime) = match node.file() {
            Some(file) => (!file.sessions.is_empty(), node.trashtime),
            None => {
                self.destroy_node(child)?;
                return Ok(());
            }
        };
        if has_sessions {
            self.mutate_node(child, |node| {
                node.file_mut().unwrap().state = FileState::Reserved;
            })?;
            self.reserved.insert(child);
        } else if trashtime > 0 {
            self.mutate_node(child, |node| {
                node.file_mut().unwrap().state = FileState::Trash;
            })?;
            self.trash.insert(
                child,
                TrashEntry {
                    path,
                    expire_ts: ts.saturating_add(trashtime),
                },
            );
        } else {
            self.destroy_node(child)?;
        }
        Ok(())
    }

    /// Final destruction: release chunk references and quota, drop the
    /// node from the arena and all indexes.
    pub(crate) fn destroy_node(&mut self, id: InodeId) -> FsResult<()> {
        let node = self.nodes.get(&id).ok_or(FsError::NoEnt)?;
        let goal = node.goal;
        let (uid, gid) = (node.uid, node.gid);
        let size = node.file_size();
        let chunk_ids: Vec<u64> = node
            .file()
            .map(|file| file.chunks.iter().copied().filter(|&c| c != 0).collect())
            .unwrap_or_default();
        for chunk in chunk_ids {
            self.chunks.remove_file_ref(chunk, goal);
        }
        self.quota.change_usage(QuotaResource::Inodes, uid, gid, -1);
        self.quota
            .change_usage(QuotaResource::Size, uid, gid, -(size as i64));
        let node = self.nodes.remove(&id).unwrap();
        self.running_checksum ^= node.checksum;
        self.trash.remove(&id);
        self.reserved.remove(&id);
        self.flock_locks.unlock_inode(id);
        self.posix_locks.unlock_inode(id);
        self.dir_quota.remove(&id);
        Ok(())
    }

    /// Purge a detached node. A trash node still held open by sessions is
    /// demoted to Reserved instead of being destroyed; everything else is
    /// removed for good.
    pub(crate) fn purge_node(&mut self, id: InodeId) -> FsResult<()> {
        let demote = {
            let node = self.node(id)?;
            node.file()
                .map(|file| file.state == FileState::Trash && !file.sessions.is_empty())
                .unwrap_or(false)
        };
        if demote {
            self.trash.remove(&id);
            self.mutate_node(id, |node| {
                node.file_mut().unwrap().state = FileState::Reserved;
            })?;
            self.reserved.insert(id);
            Ok(())
        } else {
            self.destroy_node(id)
        }
    }

    /// Re-attach a trash node at its stored path, creating missing
    /// directories on the way (root-owned, mode 0755).
    pub(crate) fn undelete(&mut self, ts: u32, id: InodeId) -> FsResult<()> {
        let entry = self.trash.get(&id).cloned().ok_or(FsError::NoEnt)?;
        let mut parent = ROOT_INODE;
        let segments: Vec<&str> = entry.path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return Err(FsError::Inval);
        }
        let (dirs, leaf) = segments.split_at(segments.len() - 1);
        for segment in dirs {
            if !name_is_valid(segment) {
                return Err(FsError::Inval);
            }
            parent = match self.lookup_child(parent, segment) {
                Ok(child) => {
                    if !self.node(child)?.is_directory() {
                        return Err(FsError::NotDir);
                    }
                    child
                }
                Err(FsError::NoEnt) => self.create_node(
                    ts,
                    parent,
                    segment,
                    NodeKind::Directory(DirNode::default()),
                    0o755,
                    0,
                    0,
                    None,
                )?,
                Err(err) => return Err(err),
            };
        }
        let leaf = leaf[0];
        if !name_is_valid(leaf) {
            return Err(FsError::Inval);
        }
        if self.name_is_used(parent, leaf) {
            return Err(FsError::Exist);
        }
        self.trash.remove(&id);
        self.add_edge(ts, parent, id, leaf)?;
        Ok(())
    }

    // ---- file length and chunks ----

    /// Set a file's logical length, dropping chunk references beyond the
    /// new end. Stats and quota are rebalanced.
    pub(crate) fn set_file_length(&mut self, id: InodeId, length: u64) -> FsResult<()> {
        let goal = self.node(id)?.goal;
        let mut released: Vec<u64> = Vec::new();
        self.with_file_bookkeeping(id, |node| {
            if let Some(file) = node.file_mut() {
                let needed = if length == 0 {
                    0
                } else {
                    length.div_ceil(crate::node::CHUNK_SIZE) as usize
                };
                while file.chunks.len() > needed {
                    let chunk = file.chunks.pop().unwrap();
                    if chunk != 0 {
                        released.push(chunk);
                    }
                }
                file.length = length;
            }
        })?;
        for chunk in released {
            self.chunks.remove_file_ref(chunk, goal);
        }
        Ok(())
    }

    /// Append `src`'s chunks after `dst`'s last chunk (the APPEND op).
    pub(crate) fn append_chunks(&mut self, ts: u32, dst: InodeId, src: InodeId) -> FsResult<()> {
        let (src_chunks, src_length) = {
            let node = self.node(src)?;
            let file = node.file().ok_or(FsError::Perm)?;
            (file.chunks.clone(), file.length)
        };
        let dst_goal = self.node(dst)?.goal;
        let dst_chunk_count = {
            let node = self.node(dst)?;
            let file = node.file().ok_or(FsError::Perm)?;
            file.chunks.len() as u64
        };
        if dst_chunk_count + src_chunks.len() as u64 > crate::node::MAX_CHUNK_INDEX as u64 {
            return Err(FsError::IndexTooBig);
        }
        for &chunk in src_chunks.iter().filter(|&&c| c != 0) {
            self.chunks.add_file_ref(chunk, dst_goal);
        }
        self.with_file_bookkeeping(dst, |node| {
            node.mtime = ts;
            node.ctime = ts;
            let file = node.file_mut().unwrap();
            let base = file.chunks.len() as u64 * crate::node::CHUNK_SIZE;
            file.chunks.extend_from_slice(&src_chunks);
            file.length = base + src_length;
        })?;
        Ok(())
    }

    // ---- trash / reserved bookkeeping ----

    pub fn trash_entries(&self) -> Vec<(InodeId, &TrashEntry)> {
        self.trash.iter().map(|(&id, entry)| (id, entry)).collect()
    }

    pub fn reserved_entries(&self) -> Vec<InodeId> {
        self.reserved.iter().copied().collect()
    }

    pub fn trash_space(&self) -> (u64, u32) {
        let mut space = 0;
        for &id in self.trash.keys() {
            if let Ok(node) = self.node(id) {
                space += node.file().map(|f| f.length).unwrap_or(0);
            }
        }
        (space, self.trash.len() as u32)
    }

    pub fn reserved_space(&self) -> (u64, u32) {
        let mut space = 0;
        for &id in &self.reserved {
            if let Ok(node) = self.node(id) {
                space += node.file().map(|f| f.length).unwrap_or(0);
            }
        }
        (space, self.reserved.len() as u32)
    }

    // ---- invariant verification (used by tests and quarantine checks) ----

    pub fn verify_invariants(&self) -> Result<(), String> {
        // Every attached node must be reachable from the root.
        let mut reachable: BTreeSet<InodeId> = BTreeSet::new();
        let mut stack = vec![ROOT_INODE];
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(dir) = self.nodes.get(&id).and_then(|n| n.directory()) {
                stack.extend(dir.entries.values().copied());
            }
        }
        for (id, node) in &self.nodes {
            let detached = node.is_detached();
            if detached && !(self.trash.contains_key(id) || self.reserved.contains(id)) {
                return Err(format!("inode {} detached but not indexed", id));
            }
            if !detached && !reachable.contains(id) {
                return Err(format!("inode {} unreachable from root", id));
            }
        }

        // Edge/parent back-reference consistency.
        for (id, node) in &self.nodes {
            if let Some(dir) = node.directory() {
                for (name, &child) in &dir.entries {
                    let child_node = self
                        .nodes
                        .get(&child)
                        .ok_or_else(|| format!("edge ({}, {}) to missing {}", id, name, child))?;
                    if !child_node.parents.contains(id) {
                        return Err(format!(
                            "child {} lacks parent back-reference to {}",
                            child, id
                        ));
                    }
                    if child_node.is_directory() && child_node.parents.len() != 1 {
                        return Err(format!("directory {} has multiple parents", child));
                    }
                }
            }
            for &parent in &node.parents {
                let parent_node = self
                    .nodes
                    .get(&parent)
                    .ok_or_else(|| format!("missing parent {} of {}", parent, id))?;
                let dir = parent_node
                    .directory()
                    .ok_or_else(|| format!("parent {} of {} is not a directory", parent, id))?;
                if !dir.entries.values().any(|&child| child == *id) {
                    return Err(format!("parent {} has no edge to {}", parent, id));
                }
            }
        }

        // Aggregated stats equal the sum over direct children.
        for (id, node) in &self.nodes {
            let Some(dir) = node.directory() else {
                continue;
            };
            let mut expected = StatsRecord::default();
            for &child in dir.entries.values() {
                if let Ok(stats) = self.stats_of(child) {
                    expected.add(&stats);
                }
            }
            if dir.stats != expected {
                return Err(format!(
                    "dir {} stats {:?} != expected {:?}",
                    id, dir.stats, expected
                ));
            }
        }

        // Quota usage equals the sum of per-inode contributions.
        let mut inode_usage: HashMap<(u8, u32), u64> = HashMap::new();
        let mut size_usage: HashMap<(u8, u32), u64> = HashMap::new();
        for node in self.nodes.values() {
            *inode_usage.entry((b'u', node.uid)).or_default() += 1;
            *inode_usage.entry((b'g', node.gid)).or_default() += 1;
            let size = node.file_size();
            *size_usage.entry((b'u', node.uid)).or_default() += size;
            *size_usage.entry((b'g', node.gid)).or_default() += size;
        }
        for ((kind, id), &expected) in &inode_usage {
            let owner_type = if *kind == b'u' {
                crate::quota::QuotaOwnerType::User
            } else {
                crate::quota::QuotaOwnerType::Group
            };
            let actual = self.quota.usage(owner_type, *id, QuotaResource::Inodes);
            if actual != expected {
                return Err(format!(
                    "quota inode usage for {}{} is {}, expected {}",
                    *kind as char, id, actual, expected
                ));
            }
            let actual = self.quota.usage(owner_type, *id, QuotaResource::Size);
            let expected_size = size_usage.get(&(*kind, *id)).copied().unwrap_or(0);
            if actual != expected_size {
                return Err(format!(
                    "quota size usage for {}{} is {}, expected {}",
                    *kind as char, id, actual, expected_size
                ));
            }
        }

        // Checksum integrity.
        if self.checksum() != self.recalculate_checksum() {
            return Err("running checksum diverged from recomputation".to_string());
        }
        Ok(())
    }

    // ---- misc helpers used by the operation layer ----

    pub(crate) fn check_writable_dir(
        &self,
        id: InodeId,
        uid: u32,
        gid: u32,
    ) -> FsResult<()> {
        let node = self.node(id)?;
        if !node.is_directory() {
            return Err(FsError::NotDir);
        }
        if !self.access(node, uid, gid, MODE_MASK_W) {
            return Err(FsError::Access);
        }
        Ok(())
    }

    pub(crate) fn check_searchable_dir(
        &self,
        id: InodeId,
        uid: u32,
        gid: u32,
    ) -> FsResult<()> {
        let node = self.node(id)?;
        if !node.is_directory() {
            return Err(FsError::NotDir);
        }
        if !self.access(node, uid, gid, MODE_MASK_X) {
            return Err(FsError::Access);
        }
        Ok(())
    }

    pub(crate) fn file_node_checked(&self, id: InodeId) -> FsResult<&FsNode> {
        let node = self.node(id)?;
        if !node.is_file() {
            return Err(FsError::Perm);
        }
        Ok(node)
    }
}

impl Default for FsMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// File node template for mknod-style creation.
pub fn node_kind_for_create(type_char: char, rdev: u32) -> FsResult<NodeKind> {
    let kind = match type_char {
        'f' => NodeKind::File(FileNode::default()),
        'c' => NodeKind::CharDev(rdev),
        'b' => NodeKind::BlockDev(rdev),
        'p' => NodeKind::Fifo,
        's' => NodeKind::Socket,
        'd' => NodeKind::Directory(DirNode::default()),
        _ => return Err(FsError::Inval),
    };
    Ok(kind)
}
