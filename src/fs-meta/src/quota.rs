use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::checksum::Digest;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuotaOwnerType {
    User,
    Group,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotaRigor {
    Soft,
    Hard,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotaResource {
    Inodes,
    Size,
}

/// Limits and usage counters for one owner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub inodes_soft_limit: u64,
    pub inodes_hard_limit: u64,
    pub bytes_soft_limit: u64,
    pub bytes_hard_limit: u64,
    pub inodes: u64,
    pub bytes: u64,
}

impl QuotaLimits {
    fn limit(&self, rigor: QuotaRigor, resource: QuotaResource) -> u64 {
        match (rigor, resource) {
            (QuotaRigor::Soft, QuotaResource::Inodes) => self.inodes_soft_limit,
            (QuotaRigor::Hard, QuotaResource::Inodes) => self.inodes_hard_limit,
            (QuotaRigor::Soft, QuotaResource::Size) => self.bytes_soft_limit,
            (QuotaRigor::Hard, QuotaResource::Size) => self.bytes_hard_limit,
        }
    }

    fn limit_mut(&mut self, rigor: QuotaRigor, resource: QuotaResource) -> &mut u64 {
        match (rigor, resource) {
            (QuotaRigor::Soft, QuotaResource::Inodes) => &mut self.inodes_soft_limit,
            (QuotaRigor::Hard, QuotaResource::Inodes) => &mut self.inodes_hard_limit,
            (QuotaRigor::Soft, QuotaResource::Size) => &mut self.bytes_soft_limit,
            (QuotaRigor::Hard, QuotaResource::Size) => &mut self.bytes_hard_limit,
        }
    }

    fn usage(&self, resource: QuotaResource) -> u64 {
        match resource {
            QuotaResource::Inodes => self.inodes,
            QuotaResource::Size => self.bytes,
        }
    }

    fn usage_mut(&mut self, resource: QuotaResource) -> &mut u64 {
        match resource {
            QuotaResource::Inodes => &mut self.inodes,
            QuotaResource::Size => &mut self.bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == QuotaLimits::default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEntry {
    pub owner_type: QuotaOwnerType,
    pub owner_id: u32,
    pub rigor: QuotaRigor,
    pub resource: QuotaResource,
    pub limit: u64,
}

/// Per-uid/gid soft and hard limits with incrementally maintained usage.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QuotaDatabase {
    uid_data: HashMap<u32, QuotaLimits>,
    gid_data: HashMap<u32, QuotaLimits>,
}

impl QuotaDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, owner_type: QuotaOwnerType) -> &HashMap<u32, QuotaLimits> {
        match owner_type {
            QuotaOwnerType::User => &self.uid_data,
            QuotaOwnerType::Group => &self.gid_data,
        }
    }

    fn table_mut(&mut self, owner_type: QuotaOwnerType) -> &mut HashMap<u32, QuotaLimits> {
        match owner_type {
            QuotaOwnerType::User => &mut self.uid_data,
            QuotaOwnerType::Group => &mut self.gid_data,
        }
    }

    pub fn set(
        &mut self,
        rigor: QuotaRigor,
        resource: QuotaResource,
        owner_type: QuotaOwnerType,
        owner_id: u32,
        value: u64,
    ) {
        let limits = self.table_mut(owner_type).entry(owner_id).or_default();
        *limits.limit_mut(rigor, resource) = value;
    }

    pub fn remove(
        &mut self,
        rigor: QuotaRigor,
        resource: QuotaResource,
        owner_type: QuotaOwnerType,
        owner_id: u32,
    ) {
        self.set(rigor, resource, owner_type, owner_id, 0);
    }

    pub fn get(&self, owner_type: QuotaOwnerType, owner_id: u32) -> Option<&QuotaLimits> {
        self.table(owner_type).get(&owner_id)
    }

    fn is_limit_exceeded(
        &self,
        rigor: QuotaRigor,
        resource: QuotaResource,
        owner_type: QuotaOwnerType,
        owner_id: u32,
    ) -> bool {
        let Some(limits) = self.table(owner_type).get(&owner_id) else {
            return false;
        };
        let limit = limits.limit(rigor, resource);
        let mut usage = limits.usage(resource);
        if rigor == QuotaRigor::Hard {
            // A hard limit is exceeded already at equality, so probe one up.
            usage += 1;
        }
        limit != 0 && usage > limit
    }

    /// True iff the limit is exceeded for the user or the group of the
    /// caller.
    pub fn is_exceeded(
        &self,
        rigor: QuotaRigor,
        resource: QuotaResource,
        uid: u32,
        gid: u32,
    ) -> bool {
        self.is_limit_exceeded(rigor, resource, QuotaOwnerType::User, uid)
            || self.is_limit_exceeded(rigor, resource, QuotaOwnerType::Group, gid)
    }

    pub fn change_usage(&mut self, resource: QuotaResource, uid: u32, gid: u32, delta: i64) {
        for (owner_type, owner_id) in [(QuotaOwnerType::User, uid), (QuotaOwnerType::Group, gid)] {
            let limits = self.table_mut(owner_type).entry(owner_id).or_default();
            let usage = limits.usage_mut(resource);
            if delta >= 0 {
                *usage += delta as u64;
            } else {
                *usage = usage.saturating_sub((-delta) as u64);
            }
        }
    }

    pub fn usage(&self, owner_type: QuotaOwnerType, owner_id: u32, resource: QuotaResource) -> u64 {
        self.table(owner_type)
            .get(&owner_id)
            .map(|limits| limits.usage(resource))
            .unwrap_or(0)
    }

    /// All non-zero limits, ordered deterministically.
    pub fn entries(&self) -> Vec<QuotaEntry> {
        let mut entries = Vec::new();
        for (owner_type, table) in [
            (QuotaOwnerType::User, &self.uid_data),
            (QuotaOwnerType::Group, &self.gid_data),
        ] {
            let mut ids: Vec<u32> = table.keys().copied().collect();
            ids.sort_unstable();
            for owner_id in ids {
                let limits = &table[&owner_id];
                for rigor in [QuotaRigor::Soft, QuotaRigor::Hard] {
                    for resource in [QuotaResource::Inodes, QuotaResource::Size] {
                        let limit = limits.limit(rigor, resource);
                        if limit > 0 {
                            entries.push(QuotaEntry {
                                owner_type,
                                owner_id,
                                rigor,
                                resource,
                                limit,
                            });
                        }
                    }
                }
            }
        }
        entries
    }

    pub fn checksum(&self) -> u64 {
        let mut running = 0u64;
        for (owner_type, table) in [
            (QuotaOwnerType::User, &self.uid_data),
            (QuotaOwnerType::Group, &self.gid_data),
        ] {
            for (owner_id, limits) in table {
                if limits.is_empty() {
                    continue;
                }
                let mut digest = Digest::new();
                digest
                    .put_u8(match owner_type {
                        QuotaOwnerType::User => b'u',
                        QuotaOwnerType::Group => b'g',
                    })
                    .put_u32(*owner_id)
                    .put_u64(limits.inodes_soft_limit)
                    .put_u64(limits.inodes_hard_limit)
                    .put_u64(limits.bytes_soft_limit)
                    .put_u64(limits.bytes_hard_limit)
                    .put_u64(limits.inodes)
                    .put_u64(limits.bytes);
                crate::checksum::fold(&mut running, digest.finish());
            }
        }
        running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_limit_blocks_at_equality() {
        let mut quota = QuotaDatabase::new();
        quota.set(QuotaRigor::Hard, QuotaResource::Inodes, QuotaOwnerType::User, 7, 2);
        quota.change_usage(QuotaResource::Inodes, 7, 100, 1);
        assert!(!quota.is_exceeded(QuotaRigor::Hard, QuotaResource::Inodes, 7, 100));
        quota.change_usage(QuotaResource::Inodes, 7, 100, 1);
        assert!(quota.is_exceeded(QuotaRigor::Hard, QuotaResource::Inodes, 7, 100));
        // Soft limit does not probe one ahead.
        quota.set(QuotaRigor::Soft, QuotaResource::Inodes, QuotaOwnerType::User, 7, 2);
        assert!(!quota.is_exceeded(QuotaRigor::Soft, QuotaResource::Inodes, 7, 100));
    }

    #[test]
    fn group_limits_apply_too() {
        let mut quota = QuotaDatabase::new();
        quota.set(QuotaRigor::Hard, QuotaResource::Size, QuotaOwnerType::Group, 50, 10);
        quota.change_usage(QuotaResource::Size, 1, 50, 10);
        assert!(quota.is_exceeded(QuotaRigor::Hard, QuotaResource::Size, 1, 50));
        assert!(!quota.is_exceeded(QuotaRigor::Hard, QuotaResource::Size, 1, 51));
    }

    #[test]
    fn usage_is_reversible() {
        let mut quota = QuotaDatabase::new();
        quota.change_usage(QuotaResource::Size, 1, 2, 100);
        quota.change_usage(QuotaResource::Size, 1, 2, -100);
        assert_eq!(quota.usage(QuotaOwnerType::User, 1, QuotaResource::Size), 0);
        assert_eq!(quota.usage(QuotaOwnerType::Group, 2, QuotaResource::Size), 0);
    }

    #[test]
    fn entries_list_only_set_limits() {
        let mut quota = QuotaDatabase::new();
        quota.set(QuotaRigor::Soft, QuotaResource::Size, QuotaOwnerType::User, 3, 1000);
        quota.set(QuotaRigor::Hard, QuotaResource::Inodes, QuotaOwnerType::Group, 4, 5);
        let entries = quota.entries();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn checksum_reflects_limits_and_usage() {
        let mut quota = QuotaDatabase::new();
        let empty = quota.checksum();
        quota.set(QuotaRigor::Hard, QuotaResource::Size, QuotaOwnerType::User, 3, 10);
        let with_limit = quota.checksum();
        assert_ne!(empty, with_limit);
        quota.change_usage(QuotaResource::Size, 3, 3, 5);
        assert_ne!(quota.checksum(), with_limit);
    }
}
