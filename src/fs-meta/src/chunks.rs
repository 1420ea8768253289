//! Master-side chunk table: id allocation, versioning with write locks,
//! file reference counts, and the copy bookkeeping that feeds repair.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use wire_proto::ChunkPartType;

use crate::checksum::Digest;
use crate::{FsError, FsResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCopy {
    pub part: ChunkPartType,
    pub version: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub version: u32,
    /// Non-zero while a writer holds the chunk for modification.
    pub lock_id: u32,
    /// One entry per referencing file (goal id, for replication planning).
    pub refs: Vec<u8>,
    /// Copies reported by chunkservers; consulted by repair.
    pub copies: Vec<ChunkCopy>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkRegistry {
    next_chunk_id: u64,
    next_lock_id: u32,
    chunks: HashMap<u64, ChunkInfo>,
}

/// Result of allocating or reusing a chunk for a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkModification {
    pub chunk_id: u64,
    pub version: u32,
    pub lock_id: u32,
    /// True when a new chunk id or version was produced (the changelog's
    /// opflag); false when an existing write lock was simply re-entered.
    pub version_bumped: bool,
}

impl Default for ChunkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkRegistry {
    pub fn new() -> Self {
        Self {
            next_chunk_id: 1,
            next_lock_id: 1,
            chunks: HashMap::new(),
        }
    }

    pub fn get(&self, chunk_id: u64) -> Option<&ChunkInfo> {
        self.chunks.get(&chunk_id)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn next_chunk_id(&self) -> u64 {
        self.next_chunk_id
    }

    fn allocate(&mut self, goal: u8) -> u64 {
        let id = self.next_chunk_id;
        self.next_chunk_id += 1;
        self.chunks.insert(
            id,
            ChunkInfo {
                version: 1,
                lock_id: 0,
                refs: vec![goal],
                copies: Vec::new(),
            },
        );
        id
    }

    fn allocate_lock_id(&mut self) -> u32 {
        let id = self.next_lock_id;
        self.next_lock_id = self.next_lock_id.wrapping_add(1).max(1);
        id
    }

    /// Prepare a chunk for writing (master side). A zero `old_chunk_id`
    /// allocates a fresh chunk; a shared chunk is duplicated (copy-on-
    /// write); re-entering with the held lock id bumps nothing.
    pub fn multi_modify(
        &mut self,
        old_chunk_id: u64,
        lock_id: u32,
        goal: u8,
        quota_exceeded: bool,
    ) -> FsResult<ChunkModification> {
        if old_chunk_id == 0 {
            if quota_exceeded {
                return Err(FsError::Quota);
            }
            let chunk_id = self.allocate(goal);
            let lock_id = self.allocate_lock_id();
            self.chunks.get_mut(&chunk_id).unwrap().lock_id = lock_id;
            return Ok(ChunkModification {
                chunk_id,
                version: 1,
                lock_id,
                version_bumped: true,
            });
        }

        let info = self.chunks.get(&old_chunk_id).ok_or(FsError::NoChunk)?;
        if info.lock_id != 0 && info.lock_id == lock_id {
            // Same writer continuing within its held lock.
            return Ok(ChunkModification {
                chunk_id: old_chunk_id,
                version: info.version,
                lock_id,
                version_bumped: false,
            });
        }
        if info.lock_id != 0 {
            return Err(FsError::Waiting);
        }

        if info.refs.len() > 1 {
            // Copy-on-write for chunks shared between files.
            if quota_exceeded {
                return Err(FsError::Quota);
            }
            let goal_entry = goal;
            self.remove_file_ref(old_chunk_id, goal);
            let chunk_id = self.allocate(goal_entry);
            let lock_id = self.allocate_lock_id();
            self.chunks.get_mut(&chunk_id).unwrap().lock_id = lock_id;
            return Ok(ChunkModification {
                chunk_id,
                version: 1,
                lock_id,
                version_bumped: true,
            });
        }

        let info = self.chunks.get_mut(&old_chunk_id).unwrap();
        info.version += 1;
        let version = info.version;
        let lock_id = self.allocate_lock_id();
        self.chunks.get_mut(&old_chunk_id).unwrap().lock_id = lock_id;
        Ok(ChunkModification {
            chunk_id: old_chunk_id,
            version,
            lock_id,
            version_bumped: true,
        })
    }

    /// Shadow/replay twin of `multi_modify`: performs the same transition
    /// and reports the resulting chunk id for mismatch detection.
    pub fn apply_modification(
        &mut self,
        old_chunk_id: u64,
        lock_id: u32,
        goal: u8,
        increase_version: bool,
        expected_chunk_id: u64,
    ) -> FsResult<u64> {
        if old_chunk_id == 0 || self.chunks.get(&old_chunk_id).map(|i| i.refs.len() > 1) == Some(true)
        {
            if old_chunk_id != 0 {
                self.remove_file_ref(old_chunk_id, goal);
            }
            if self.next_chunk_id != expected_chunk_id {
                return Err(FsError::Mismatch);
            }
            let chunk_id = self.allocate(goal);
            self.chunks.get_mut(&chunk_id).unwrap().lock_id = lock_id;
            return Ok(chunk_id);
        }
        let info = self.chunks.get_mut(&old_chunk_id).ok_or(FsError::NoChunk)?;
        if increase_version {
            info.version += 1;
        }
        info.lock_id = lock_id;
        Ok(old_chunk_id)
    }

    /// Truncate-in-place versioning: the chunk gets a new version under a
    /// write lock so chunkservers can apply the truncation.
    pub fn multi_truncate(
        &mut self,
        chunk_id: u64,
        goal: u8,
        quota_exceeded: bool,
    ) -> FsResult<ChunkModification> {
        self.multi_modify(chunk_id, 0, goal, quota_exceeded)
    }

    pub fn can_unlock(&self, chunk_id: u64, lock_id: u32) -> FsResult<()> {
        let info = self.chunks.get(&chunk_id).ok_or(FsError::NoChunk)?;
        if info.lock_id != 0 && lock_id != 0 && info.lock_id != lock_id {
            return Err(FsError::Mismatch);
        }
        Ok(())
    }

    pub fn unlock(&mut self, chunk_id: u64) -> FsResult<()> {
        let info = self.chunks.get_mut(&chunk_id).ok_or(FsError::NoChunk)?;
        info.lock_id = 0;
        Ok(())
    }

    pub fn increase_version(&mut self, chunk_id: u64) -> FsResult<u32> {
        let info = self.chunks.get_mut(&chunk_id).ok_or(FsError::NoChunk)?;
        info.version += 1;
        Ok(info.version)
    }

    pub fn set_version(&mut self, chunk_id: u64, version: u32) -> FsResult<()> {
        let info = self.chunks.get_mut(&chunk_id).ok_or(FsError::NoChunk)?;
        info.version = version;
        Ok(())
    }

    pub fn set_next_chunk_id(&mut self, next: u64) -> FsResult<()> {
        if next < self.next_chunk_id {
            return Err(FsError::Mismatch);
        }
        self.next_chunk_id = next;
        Ok(())
    }

    pub fn add_file_ref(&mut self, chunk_id: u64, goal: u8) {
        let info = self.chunks.entry(chunk_id).or_insert_with(|| ChunkInfo {
            version: 1,
            ..Default::default()
        });
        info.refs.push(goal);
    }

    /// Drop one file reference; an unreferenced chunk leaves the table.
    pub fn remove_file_ref(&mut self, chunk_id: u64, goal: u8) {
        let Some(info) = self.chunks.get_mut(&chunk_id) else {
            return;
        };
        if let Some(position) = info.refs.iter().position(|&g| g == goal) {
            info.refs.remove(position);
        } else {
            info.refs.pop();
        }
        if info.refs.is_empty() {
            self.chunks.remove(&chunk_id);
        }
    }

    pub fn file_ref_count(&self, chunk_id: u64) -> usize {
        self.chunks
            .get(&chunk_id)
            .map(|info| info.refs.len())
            .unwrap_or(0)
    }

    // ---- copy reports from chunkservers ----

    pub fn register_copy(&mut self, chunk_id: u64, part: ChunkPartType, version: u32) {
        if let Some(info) = self.chunks.get_mut(&chunk_id) {
            if !info
                .copies
                .iter()
                .any(|copy| copy.part == part && copy.version == version)
            {
                info.copies.push(ChunkCopy { part, version });
            }
        }
    }

    pub fn unregister_copy(&mut self, chunk_id: u64, part: ChunkPartType, version: u32) {
        if let Some(info) = self.chunks.get_mut(&chunk_id) {
            info.copies
                .retain(|copy| !(copy.part == part && copy.version == version));
        }
    }

    pub fn has_only_invalid_copies(&self, chunk_id: u64) -> bool {
        match self.chunks.get(&chunk_id) {
            Some(info) => {
                !info.copies.is_empty()
                    && info.copies.iter().all(|copy| copy.version != info.version)
            }
            None => false,
        }
    }

    /// Repair one chunk reference of a file:
    /// - a valid copy at the current version: nothing to change;
    /// - only stale copies: rewind the version to the best available;
    /// - no copies at all: the chunk is gone, erase the reference.
    /// Returns None for the no-op case, Some(new_version) otherwise
    /// (Some(0) means erase).
    pub fn repair(&mut self, chunk_id: u64) -> Option<u32> {
        let info = self.chunks.get_mut(&chunk_id)?;
        if info.copies.iter().any(|copy| copy.version == info.version) {
            return None;
        }
        match info.copies.iter().map(|copy| copy.version).max() {
            Some(best) => {
                info.version = best;
                Some(best)
            }
            None => Some(0),
        }
    }

    pub fn checksum(&self) -> u64 {
        let mut running = 0u64;
        for (chunk_id, info) in &self.chunks {
            let mut digest = Digest::new();
            digest
                .put_u64(*chunk_id)
                .put_u32(info.version)
                .put_u64(info.refs.len() as u64);
            crate::checksum::fold(&mut running, digest.finish());
        }
        let mut tail = Digest::new();
        tail.put_u64(self.next_chunk_id);
        crate::checksum::fold(&mut running, tail.finish());
        running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_chunk_allocation() {
        let mut registry = ChunkRegistry::new();
        let m = registry.multi_modify(0, 0, 2, false).unwrap();
        assert_eq!(m.chunk_id, 1);
        assert_eq!(m.version, 1);
        assert!(m.version_bumped);
        assert_eq!(registry.file_ref_count(1), 1);
        assert!(registry.get(1).unwrap().lock_id != 0);
    }

    #[test]
    fn quota_blocks_allocation() {
        let mut registry = ChunkRegistry::new();
        assert_eq!(registry.multi_modify(0, 0, 2, true), Err(FsError::Quota));
    }

    #[test]
    fn rewrite_bumps_version_once_per_lock() {
        let mut registry = ChunkRegistry::new();
        let first = registry.multi_modify(0, 0, 2, false).unwrap();
        registry.unlock(first.chunk_id).unwrap();

        let second = registry
            .multi_modify(first.chunk_id, 0, 2, false)
            .unwrap();
        assert_eq!(second.chunk_id, first.chunk_id);
        assert_eq!(second.version, 2);
        assert!(second.version_bumped);

        // Re-entering with the same lock id continues without a bump.
        let third = registry
            .multi_modify(first.chunk_id, second.lock_id, 2, false)
            .unwrap();
        assert_eq!(third.version, 2);
        assert!(!third.version_bumped);

        // A different writer is told to wait.
        assert_eq!(
            registry.multi_modify(first.chunk_id, 9999, 2, false),
            Err(FsError::Waiting)
        );
    }

    #[test]
    fn shared_chunk_is_duplicated_on_write() {
        let mut registry = ChunkRegistry::new();
        let first = registry.multi_modify(0, 0, 2, false).unwrap();
        registry.unlock(first.chunk_id).unwrap();
        registry.add_file_ref(first.chunk_id, 2);
        assert_eq!(registry.file_ref_count(first.chunk_id), 2);

        let cow = registry.multi_modify(first.chunk_id, 0, 2, false).unwrap();
        assert_ne!(cow.chunk_id, first.chunk_id);
        assert_eq!(registry.file_ref_count(first.chunk_id), 1);
        assert_eq!(registry.file_ref_count(cow.chunk_id), 1);
    }

    #[test]
    fn unreferenced_chunks_disappear() {
        let mut registry = ChunkRegistry::new();
        let m = registry.multi_modify(0, 0, 2, false).unwrap();
        registry.remove_file_ref(m.chunk_id, 2);
        assert!(registry.get(m.chunk_id).is_none());
    }

    #[test]
    fn repair_decides_by_copy_versions() {
        let mut registry = ChunkRegistry::new();
        let m = registry.multi_modify(0, 0, 2, false).unwrap();
        registry.unlock(m.chunk_id).unwrap();
        registry.set_version(m.chunk_id, 5).unwrap();

        // No copies at all: erase.
        assert_eq!(registry.repair(m.chunk_id), Some(0));

        // A current copy: no-op.
        registry.register_copy(m.chunk_id, ChunkPartType::Standard, 5);
        assert_eq!(registry.repair(m.chunk_id), None);
        assert!(!registry.has_only_invalid_copies(m.chunk_id));

        // Only a stale copy: rewind.
        registry.unregister_copy(m.chunk_id, ChunkPartType::Standard, 5);
        registry.register_copy(m.chunk_id, ChunkPartType::Standard, 3);
        assert!(registry.has_only_invalid_copies(m.chunk_id));
        assert_eq!(registry.repair(m.chunk_id), Some(3));
        assert_eq!(registry.get(m.chunk_id).unwrap().version, 3);
    }

    #[test]
    fn next_chunk_id_only_moves_forward() {
        let mut registry = ChunkRegistry::new();
        registry.set_next_chunk_id(100).unwrap();
        assert_eq!(registry.next_chunk_id(), 100);
        assert_eq!(registry.set_next_chunk_id(50), Err(FsError::Mismatch));
    }
}
