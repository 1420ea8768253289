//! Persisted master state: a bincode snapshot of the whole metadata graph
//! (`metadata.sfs`) plus rotated changelog files (`changelog.sfs`,
//! `changelog.1.sfs`, ...). Loading replays the snapshot and then every
//! newer changelog line. The data directory is held under an exclusive
//! lock so two masters cannot share it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::chunks::ChunkRegistry;
use crate::locks::FileLocks;
use crate::metadata::{FsMetadata, TrashEntry};
use crate::node::{FsNode, InodeId, SessionId};
use crate::quota::{QuotaDatabase, QuotaLimits};
use crate::{FsError, FsResult};

pub const SNAPSHOT_FILE: &str = "metadata.sfs";
pub const CHANGELOG_FILE: &str = "changelog.sfs";
pub const LOCK_FILE: &str = ".metadata.lock";
/// Rotated changelog files kept next to the current one.
pub const CHANGELOG_KEEP: usize = 4;

/// Plain-data image of the metadata, the bincode snapshot payload.
#[derive(Serialize, Deserialize)]
struct MetadataImage {
    nodes: Vec<FsNode>,
    next_inode: InodeId,
    metaversion: u64,
    trash: BTreeMap<InodeId, TrashEntry>,
    reserved: BTreeSet<InodeId>,
    quota: QuotaDatabase,
    dir_quota: HashMap<InodeId, QuotaLimits>,
    flock_locks: FileLocks,
    posix_locks: FileLocks,
    chunks: ChunkRegistry,
    next_session_id: SessionId,
}

impl MetadataImage {
    fn capture(fs: &FsMetadata) -> Self {
        let mut nodes: Vec<FsNode> = fs.nodes.values().cloned().collect();
        nodes.sort_by_key(|node| node.id);
        Self {
            nodes,
            next_inode: fs.next_inode,
            metaversion: fs.metaversion,
            trash: fs.trash.clone(),
            reserved: fs.reserved.clone(),
            quota: fs.quota.clone(),
            dir_quota: fs.dir_quota.clone(),
            flock_locks: fs.flock_locks.clone(),
            posix_locks: fs.posix_locks.clone(),
            chunks: fs.chunks.clone(),
            next_session_id: fs.next_session_id,
        }
    }

    fn restore(self) -> FsMetadata {
        let mut fs = FsMetadata::new();
        fs.nodes.clear();
        fs.running_checksum = 0;
        fs.quota = self.quota;
        for mut node in self.nodes {
            node.checksum = node.compute_checksum();
            fs.running_checksum ^= node.checksum;
            fs.nodes.insert(node.id, node);
        }
        fs.next_inode = self.next_inode;
        fs.metaversion = self.metaversion;
        fs.trash = self.trash;
        fs.reserved = self.reserved;
        fs.dir_quota = self.dir_quota;
        fs.flock_locks = self.flock_locks;
        fs.posix_locks = self.posix_locks;
        fs.chunks = self.chunks;
        fs.next_session_id = self.next_session_id;
        fs
    }
}

/// The master's data directory.
pub struct MetadataStore {
    data_dir: PathBuf,
    _lock: File,
}

impl MetadataStore {
    /// Open (and exclusively lock) a data directory.
    pub fn open(data_dir: &Path) -> FsResult<MetadataStore> {
        fs::create_dir_all(data_dir)?;
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(data_dir.join(LOCK_FILE))?;
        lock.try_lock_exclusive().map_err(|_| {
            FsError::Io(format!(
                "data directory {} is locked by another master",
                data_dir.display()
            ))
        })?;
        Ok(MetadataStore {
            data_dir: data_dir.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn changelog_path(&self) -> PathBuf {
        self.data_dir.join(CHANGELOG_FILE)
    }

    /// Write a fresh snapshot and rotate the changelog files. The new
    /// changelog starts with the snapshot's metaversion.
    pub fn store(&self, fs: &mut FsMetadata) -> FsResult<()> {
        fs.changelog_mut().close_file()?;

        let snapshot_path = self.data_dir.join(SNAPSHOT_FILE);
        let tmp_path = self.data_dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        {
            let file = File::create(&tmp_path)?;
            let writer = BufWriter::new(file);
            bincode::serialize_into(writer, &MetadataImage::capture(fs))
                .map_err(|err| FsError::Io(format!("snapshot encode failed: {}", err)))?;
        }
        fs::rename(&tmp_path, &snapshot_path)?;

        // Rotate changelog.N.sfs upward, newest first.
        let _ = fs::remove_file(self.rotated_path(CHANGELOG_KEEP));
        for index in (1..CHANGELOG_KEEP).rev() {
            let _ = fs::rename(self.rotated_path(index), self.rotated_path(index + 1));
        }
        let current = self.changelog_path();
        if current.exists() {
            fs::rename(&current, self.rotated_path(1))?;
        }
        fs.changelog_mut().open_file(&current)?;
        info!(
            "metadata snapshot stored at version {} in {}",
            fs.metaversion,
            self.data_dir.display()
        );
        Ok(())
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        self.data_dir.join(format!("changelog.{}.sfs", index))
    }

    /// Load the snapshot (if any) and replay every changelog line newer
    /// than it, oldest file first. The changelog sink is (re)opened for
    /// appending afterwards.
    pub fn load(&self) -> FsResult<FsMetadata> {
        let snapshot_path = self.data_dir.join(SNAPSHOT_FILE);
        let mut fs = if snapshot_path.exists() {
            let file = File::open(&snapshot_path)?;
            let image: MetadataImage = bincode::deserialize_from(BufReader::new(file))
                .map_err(|err| FsError::Io(format!("snapshot decode failed: {}", err)))?;
            image.restore()
        } else {
            FsMetadata::new()
        };

        let mut changelog_files: Vec<PathBuf> = (1..=CHANGELOG_KEEP)
            .rev()
            .map(|index| self.rotated_path(index))
            .filter(|path| path.exists())
            .collect();
        let current = self.changelog_path();
        if current.exists() {
            changelog_files.push(current.clone());
        }
        for path in changelog_files {
            self.replay_file(&mut fs, &path)?;
        }

        fs.changelog_mut().open_file(&current)?;
        info!(
            "metadata loaded at version {} from {}",
            fs.metaversion,
            self.data_dir.display()
        );
        Ok(fs)
    }

    fn replay_file(&self, fs: &mut FsMetadata, path: &Path) -> FsResult<()> {
        let file = File::open(path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let version: u64 = line
                .split('|')
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or(FsError::Inval)?;
            if version < fs.metaversion {
                // Already covered by the snapshot.
                continue;
            }
            if let Err(err) = fs.apply_line(&line) {
                warn!("replay stopped at {}: {} ({})", path.display(), line, err);
                return Err(err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ROOT_INODE;
    use crate::FsContext;
    use tempfile::TempDir;

    fn ctx(ts: u32) -> FsContext {
        FsContext::master(ts, 1000, 100)
    }

    #[test]
    fn data_dir_is_exclusively_locked() {
        let dir = TempDir::new().unwrap();
        let _store = MetadataStore::open(dir.path()).unwrap();
        assert!(MetadataStore::open(dir.path()).is_err());
    }

    #[test]
    fn snapshot_round_trip_preserves_checksum() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        let mut fs = store.load().unwrap();

        let c = ctx(100);
        let sub = fs.mkdir(&c, ROOT_INODE, "home", 0o755, 0).unwrap();
        fs.mknod(&c, sub, "file", 'f', 0o644, 0o022, 0).unwrap();
        fs.settrashtime(&c, sub, 3600, crate::ops::SMODE_RECURSIVE)
            .unwrap();
        let checksum = fs.checksum();
        let version = fs.metaversion;
        store.store(&mut fs).unwrap();

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.metaversion, version);
        assert_eq!(reloaded.checksum(), checksum);
        reloaded.verify_invariants().unwrap();
    }

    #[test]
    fn changelog_replay_after_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        let mut fs = store.load().unwrap();
        let c = ctx(100);

        fs.mkdir(&c, ROOT_INODE, "a", 0o755, 0).unwrap();
        store.store(&mut fs).unwrap();

        // Mutations after the snapshot land in the fresh changelog.
        let sub = fs.lookup(&c, ROOT_INODE, "a").unwrap();
        fs.mknod(&c, sub, "b", 'f', 0o640, 0, 0).unwrap();
        fs.changelog_mut().flush().unwrap();
        let checksum = fs.checksum();
        let version = fs.metaversion;
        drop(fs);
        drop(store);

        let store = MetadataStore::open(dir.path()).unwrap();
        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.metaversion, version);
        assert_eq!(reloaded.checksum(), checksum);
        let sub = reloaded.lookup(&c, ROOT_INODE, "a").unwrap();
        assert!(reloaded.lookup(&c, sub, "b").is_ok());
    }
}
