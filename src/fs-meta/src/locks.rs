//! Advisory file locks: a whole-file table (flock, range [0, 1)) and a
//! POSIX byte-range table, both keyed by inode. Blocked requests queue as
//! pending locks; every unlock re-examines the affected range and applies
//! any pending candidate whose range has become free, reporting the owners
//! so the server can wake them.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::checksum::Digest;
use crate::node::InodeId;

pub const LOCK_RANGE_END_MAX: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// Identity of a lock requester.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub owner: u64,
    pub sessionid: u32,
    pub reqid: u32,
    pub msgid: u32,
}

impl LockOwner {
    fn same_holder(&self, other: &LockOwner) -> bool {
        self.owner == other.owner && self.sessionid == other.sessionid
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub start: u64,
    pub end: u64,
    pub kind: LockKind,
    pub owner: LockOwner,
}

impl Lock {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && self.end > start
    }

    fn conflicts_with(&self, kind: LockKind, start: u64, end: u64, owner: &LockOwner) -> bool {
        if !self.overlaps(start, end) || self.owner.same_holder(owner) {
            return false;
        }
        self.kind == LockKind::Exclusive || kind == LockKind::Exclusive
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct InodeLocks {
    active: Vec<Lock>,
    pending: VecDeque<Lock>,
}

impl InodeLocks {
    fn is_empty(&self) -> bool {
        self.active.is_empty() && self.pending.is_empty()
    }

    fn find_collision(
        &self,
        kind: LockKind,
        start: u64,
        end: u64,
        owner: &LockOwner,
    ) -> Option<&Lock> {
        self.active
            .iter()
            .find(|lock| lock.conflicts_with(kind, start, end, owner))
    }

    /// Remove this holder's coverage of [start, end), splitting partially
    /// covered locks.
    fn carve_out(&mut self, start: u64, end: u64, owner: &LockOwner) {
        let mut result = Vec::with_capacity(self.active.len());
        for lock in self.active.drain(..) {
            if !lock.owner.same_holder(owner) || !lock.overlaps(start, end) {
                result.push(lock);
                continue;
            }
            if lock.start < start {
                result.push(Lock {
                    end: start,
                    ..lock
                });
            }
            if lock.end > end {
                result.push(Lock {
                    start: end,
                    ..lock
                });
            }
        }
        self.active = result;
    }

    fn insert(&mut self, lock: Lock) {
        self.carve_out(lock.start, lock.end, &lock.owner);
        self.active.push(lock);
        self.active.sort_by_key(|l| (l.start, l.end));
    }
}

/// One lock table (flock or posix).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileLocks {
    inodes: HashMap<InodeId, InodeLocks>,
}

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_attempt(
        &mut self,
        inode: InodeId,
        kind: LockKind,
        start: u64,
        end: u64,
        owner: LockOwner,
        nonblocking: bool,
    ) -> bool {
        if start >= end {
            return false;
        }
        let locks = self.inodes.entry(inode).or_default();
        if locks.find_collision(kind, start, end, &owner).is_some() {
            if !nonblocking {
                locks.pending.push_back(Lock {
                    start,
                    end,
                    kind,
                    owner,
                });
            }
            return false;
        }
        locks.insert(Lock {
            start,
            end,
            kind,
            owner,
        });
        true
    }

    pub fn shared_lock(
        &mut self,
        inode: InodeId,
        start: u64,
        end: u64,
        owner: LockOwner,
        nonblocking: bool,
    ) -> bool {
        self.lock_attempt(inode, LockKind::Shared, start, end, owner, nonblocking)
    }

    pub fn exclusive_lock(
        &mut self,
        inode: InodeId,
        start: u64,
        end: u64,
        owner: LockOwner,
        nonblocking: bool,
    ) -> bool {
        self.lock_attempt(inode, LockKind::Exclusive, start, end, owner, nonblocking)
    }

    /// Drop this holder's locks over [start, end). Always succeeds.
    pub fn unlock(&mut self, inode: InodeId, start: u64, end: u64, owner: LockOwner) -> bool {
        if let Some(locks) = self.inodes.get_mut(&inode) {
            locks.carve_out(start, end, &owner);
            if locks.is_empty() {
                self.inodes.remove(&inode);
            }
        }
        true
    }

    /// Drop every active lock on the inode (administrative unlock).
    pub fn unlock_inode(&mut self, inode: InodeId) {
        if let Some(locks) = self.inodes.get_mut(&inode) {
            locks.active.clear();
            if locks.is_empty() {
                self.inodes.remove(&inode);
            }
        }
    }

    /// Drop all locks whose owner matches the predicate, over all ranges.
    /// Returns the byte range affected so candidates can be gathered.
    pub fn unlock_matching<F: Fn(&LockOwner) -> bool>(
        &mut self,
        inode: InodeId,
        predicate: F,
    ) -> (u64, u64) {
        let mut low = u64::MAX;
        let mut high = 0u64;
        if let Some(locks) = self.inodes.get_mut(&inode) {
            locks.active.retain(|lock| {
                if predicate(&lock.owner) {
                    low = low.min(lock.start);
                    high = high.max(lock.end);
                    false
                } else {
                    true
                }
            });
            if locks.is_empty() {
                self.inodes.remove(&inode);
            }
        }
        if low >= high {
            (0, 0)
        } else {
            (low, high)
        }
    }

    pub fn remove_pending<F: Fn(&Lock) -> bool>(&mut self, inode: InodeId, predicate: F) {
        if let Some(locks) = self.inodes.get_mut(&inode) {
            locks.pending.retain(|lock| !predicate(lock));
            if locks.is_empty() {
                self.inodes.remove(&inode);
            }
        }
    }

    /// First active lock colliding with the probe; state is not modified.
    pub fn probe(
        &self,
        inode: InodeId,
        kind: LockKind,
        start: u64,
        end: u64,
        owner: LockOwner,
    ) -> Option<Lock> {
        self.inodes
            .get(&inode)?
            .find_collision(kind, start, end, &owner)
            .copied()
    }

    /// Pending requests touching [start, end), in queue order.
    pub fn gather_candidates(&self, inode: InodeId, start: u64, end: u64) -> Vec<Lock> {
        let Some(locks) = self.inodes.get(&inode) else {
            return Vec::new();
        };
        locks
            .pending
            .iter()
            .filter(|lock| lock.overlaps(start, end))
            .copied()
            .collect()
    }

    /// Try to apply a previously queued candidate. On success it is removed
    /// from the pending queue and the caller notifies its owner.
    pub fn apply(&mut self, inode: InodeId, candidate: Lock) -> bool {
        let Some(locks) = self.inodes.get_mut(&inode) else {
            return false;
        };
        if locks
            .find_collision(candidate.kind, candidate.start, candidate.end, &candidate.owner)
            .is_some()
        {
            return false;
        }
        locks.pending.retain(|lock| *lock != candidate);
        locks.insert(candidate);
        true
    }

    pub fn active_locks(&self, inode: InodeId) -> Vec<Lock> {
        self.inodes
            .get(&inode)
            .map(|locks| locks.active.clone())
            .unwrap_or_default()
    }

    pub fn pending_locks(&self, inode: InodeId) -> Vec<Lock> {
        self.inodes
            .get(&inode)
            .map(|locks| locks.pending.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn checksum(&self) -> u64 {
        let mut running = 0u64;
        for (inode, locks) in &self.inodes {
            for lock in &locks.active {
                let mut digest = Digest::new();
                digest
                    .put_u32(*inode)
                    .put_u64(lock.start)
                    .put_u64(lock.end)
                    .put_u8(match lock.kind {
                        LockKind::Shared => 1,
                        LockKind::Exclusive => 2,
                    })
                    .put_u64(lock.owner.owner)
                    .put_u32(lock.owner.sessionid);
                crate::checksum::fold(&mut running, digest.finish());
            }
        }
        running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(id: u64) -> LockOwner {
        LockOwner {
            owner: id,
            sessionid: id as u32,
            reqid: 0,
            msgid: 0,
        }
    }

    #[test]
    fn shared_locks_coexist_exclusive_does_not() {
        let mut locks = FileLocks::new();
        assert!(locks.shared_lock(1, 0, 100, owner(1), true));
        assert!(locks.shared_lock(1, 50, 150, owner(2), true));
        assert!(!locks.exclusive_lock(1, 0, 10, owner(3), true));
        // Non-overlapping exclusive is fine.
        assert!(locks.exclusive_lock(1, 200, 300, owner(3), true));
        assert!(!locks.shared_lock(1, 250, 260, owner(1), true));
    }

    #[test]
    fn blocking_requests_queue_and_apply_on_unlock() {
        let mut locks = FileLocks::new();
        assert!(locks.exclusive_lock(1, 0, 100, owner(1), false));
        assert!(!locks.exclusive_lock(1, 0, 100, owner(2), false));
        assert_eq!(locks.pending_locks(1).len(), 1);

        locks.unlock(1, 0, 100, owner(1));
        let candidates = locks.gather_candidates(1, 0, 100);
        assert_eq!(candidates.len(), 1);
        assert!(locks.apply(1, candidates[0]));
        assert!(locks.pending_locks(1).is_empty());
        assert_eq!(locks.active_locks(1)[0].owner, owner(2));
    }

    #[test]
    fn unlock_splits_ranges() {
        let mut locks = FileLocks::new();
        assert!(locks.exclusive_lock(1, 0, 100, owner(1), true));
        locks.unlock(1, 40, 60, owner(1));
        let active = locks.active_locks(1);
        assert_eq!(active.len(), 2);
        assert_eq!((active[0].start, active[0].end), (0, 40));
        assert_eq!((active[1].start, active[1].end), (60, 100));
        // The carved-out hole can now be locked by someone else.
        assert!(locks.exclusive_lock(1, 40, 60, owner(2), true));
    }

    #[test]
    fn same_holder_replaces_own_locks() {
        let mut locks = FileLocks::new();
        assert!(locks.exclusive_lock(1, 0, 100, owner(1), true));
        // Downgrade to shared: no self-conflict.
        assert!(locks.shared_lock(1, 0, 100, owner(1), true));
        let active = locks.active_locks(1);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].kind, LockKind::Shared);
    }

    #[test]
    fn release_removes_pending_and_active() {
        let mut locks = FileLocks::new();
        assert!(locks.exclusive_lock(1, 0, 10, owner(1), true));
        assert!(!locks.exclusive_lock(1, 0, 10, owner(2), false));
        locks.remove_pending(1, |lock| lock.owner.sessionid == 2);
        let range = locks.unlock_matching(1, |o| o.sessionid == 1);
        assert_eq!(range, (0, 10));
        assert!(locks.active_locks(1).is_empty());
        assert!(locks.pending_locks(1).is_empty());
    }

    #[test]
    fn exclusion_invariant_holds_under_random_traffic() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut locks = FileLocks::new();
        for _ in 0..500 {
            let who = owner(rng.gen_range(1..5));
            let start = rng.gen_range(0..100u64);
            let end = start + rng.gen_range(1..50u64);
            match rng.gen_range(0..3) {
                0 => {
                    locks.shared_lock(1, start, end, who, true);
                }
                1 => {
                    locks.exclusive_lock(1, start, end, who, true);
                }
                _ => {
                    locks.unlock(1, start, end, who);
                }
            }
            // For every byte: at most one exclusive holder, or any number
            // of shared holders and no exclusive one.
            let active = locks.active_locks(1);
            for byte in 0..150u64 {
                let mut exclusive_holders = 0;
                let mut shared_holders = 0;
                for lock in &active {
                    if lock.overlaps(byte, byte + 1) {
                        match lock.kind {
                            LockKind::Exclusive => exclusive_holders += 1,
                            LockKind::Shared => shared_holders += 1,
                        }
                    }
                }
                assert!(
                    exclusive_holders == 0 || (exclusive_holders == 1 && shared_holders == 0),
                    "byte {} has {} exclusive / {} shared holders",
                    byte,
                    exclusive_holders,
                    shared_holders
                );
            }
        }
    }
}
