use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::checksum::Digest;

pub type InodeId = u32;
pub type SessionId = u32;

pub const ROOT_INODE: InodeId = 1;
/// Highest chunk index a file may address (INDEXTOOBIG above this).
pub const MAX_CHUNK_INDEX: u32 = 0xffff;
pub const MAX_NAME_LENGTH: usize = 255;
pub const MAX_SYMLINK_LENGTH: usize = 4096;

pub const CHUNK_SIZE: u64 = 64 * 1024 * 1024;
pub const BLOCK_SIZE: u64 = 64 * 1024;

// eattr bits, settable per inode through seteattr.
pub const EATTR_NOOWNER: u8 = 0x01;
pub const EATTR_NOACACHE: u8 = 0x02;
pub const EATTR_NOECACHE: u8 = 0x04;
pub const EATTR_NODATACACHE: u8 = 0x08;
pub const EATTR_MASK: u8 = 0x0f;

// mode masks for permission checks.
pub const MODE_MASK_R: u8 = 4;
pub const MODE_MASK_W: u8 = 2;
pub const MODE_MASK_X: u8 = 1;

/// Aggregated per-directory statistics; the recursive sum over descendants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub inodes: u32,
    pub dirs: u32,
    pub files: u32,
    pub chunks: u32,
    pub length: u64,
    pub size: u64,
    pub realsize: u64,
}

impl StatsRecord {
    pub fn add(&mut self, other: &StatsRecord) {
        self.inodes += other.inodes;
        self.dirs += other.dirs;
        self.files += other.files;
        self.chunks += other.chunks;
        self.length += other.length;
        self.size += other.size;
        self.realsize += other.realsize;
    }

    pub fn sub(&mut self, other: &StatsRecord) {
        self.inodes -= other.inodes;
        self.dirs -= other.dirs;
        self.files -= other.files;
        self.chunks -= other.chunks;
        self.length -= other.length;
        self.size -= other.size;
        self.realsize -= other.realsize;
    }
}

/// Whether a file node is still linked, or retained after unlink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileState {
    Linked,
    Trash,
    Reserved,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub length: u64,
    /// Index i holds the chunk storing bytes [i * CHUNK_SIZE, (i+1) * CHUNK_SIZE).
    pub chunks: Vec<u64>,
    /// Sessions currently holding this file open.
    pub sessions: Vec<SessionId>,
    pub state: FileState,
}

impl Default for FileNode {
    fn default() -> Self {
        Self {
            length: 0,
            chunks: Vec::new(),
            sessions: Vec::new(),
            state: FileState::Linked,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirNode {
    pub entries: BTreeMap<String, InodeId>,
    pub stats: StatsRecord,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File(FileNode),
    Directory(DirNode),
    Symlink(String),
    CharDev(u32),
    BlockDev(u32),
    Fifo,
    Socket,
}

impl NodeKind {
    pub fn type_char(&self) -> char {
        match self {
            NodeKind::File(_) => 'f',
            NodeKind::Directory(_) => 'd',
            NodeKind::Symlink(_) => 'l',
            NodeKind::CharDev(_) => 'c',
            NodeKind::BlockDev(_) => 'b',
            NodeKind::Fifo => 'p',
            NodeKind::Socket => 's',
        }
    }

    pub fn from_type_char(c: char) -> Option<NodeKind> {
        match c {
            'f' => Some(NodeKind::File(FileNode::default())),
            'd' => Some(NodeKind::Directory(DirNode::default())),
            'l' => Some(NodeKind::Symlink(String::new())),
            'c' => Some(NodeKind::CharDev(0)),
            'b' => Some(NodeKind::BlockDev(0)),
            'p' => Some(NodeKind::Fifo),
            's' => Some(NodeKind::Socket),
            _ => None,
        }
    }
}

/// Access and default ACL variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AclVariant {
    Access,
    Default,
}

impl AclVariant {
    pub fn type_char(&self) -> char {
        match self {
            AclVariant::Access => 'a',
            AclVariant::Default => 'd',
        }
    }

    pub fn from_type_char(c: char) -> Option<AclVariant> {
        match c {
            'a' => Some(AclVariant::Access),
            'd' => Some(AclVariant::Default),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlList {
    /// (tag, qualifier, permission) triples, e.g. ("u", Some(1000), 6).
    pub entries: Vec<(String, Option<u32>, u8)>,
}

impl AccessControlList {
    pub fn to_record_string(&self) -> String {
        self.entries
            .iter()
            .map(|(tag, id, perm)| match id {
                Some(id) => format!("{}:{}:{}", tag, id, perm),
                None => format!("{}::{}", tag, perm),
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn from_record_string(value: &str) -> Option<AccessControlList> {
        let mut entries = Vec::new();
        if value.is_empty() {
            return Some(AccessControlList::default());
        }
        for item in value.split('/') {
            let mut fields = item.split(':');
            let tag = fields.next()?.to_string();
            let id = fields.next()?;
            let id = if id.is_empty() {
                None
            } else {
                Some(id.parse().ok()?)
            };
            let perm: u8 = fields.next()?.parse().ok()?;
            if fields.next().is_some() {
                return None;
            }
            entries.push((tag, id, perm));
        }
        Some(AccessControlList { entries })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsNode {
    pub id: InodeId,
    pub kind: NodeKind,
    /// Permission bits only; the type lives in `kind`.
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub goal: u8,
    pub trashtime: u32,
    pub eattr: u8,
    /// Parent directory ids. Files may be hard-linked into many
    /// directories; a directory has at most one parent; detached
    /// (trash/reserved) nodes have none.
    pub parents: Vec<InodeId>,
    pub xattrs: BTreeMap<String, Vec<u8>>,
    pub access_acl: Option<AccessControlList>,
    pub default_acl: Option<AccessControlList>,
    /// Cached record hash, folded into the graph's running checksum.
    pub checksum: u64,
}

impl FsNode {
    pub fn new(id: InodeId, kind: NodeKind, mode: u16, uid: u32, gid: u32, ts: u32) -> Self {
        Self {
            id,
            kind,
            mode,
            uid,
            gid,
            atime: ts,
            mtime: ts,
            ctime: ts,
            goal: crate::goal::DEFAULT_GOAL,
            trashtime: 0,
            eattr: 0,
            parents: Vec::new(),
            xattrs: BTreeMap::new(),
            access_acl: None,
            default_acl: None,
            checksum: 0,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File(_))
    }

    pub fn file(&self) -> Option<&FileNode> {
        match &self.kind {
            NodeKind::File(file) => Some(file),
            _ => None,
        }
    }

    pub fn file_mut(&mut self) -> Option<&mut FileNode> {
        match &mut self.kind {
            NodeKind::File(file) => Some(file),
            _ => None,
        }
    }

    pub fn directory(&self) -> Option<&DirNode> {
        match &self.kind {
            NodeKind::Directory(dir) => Some(dir),
            _ => None,
        }
    }

    pub fn directory_mut(&mut self) -> Option<&mut DirNode> {
        match &mut self.kind {
            NodeKind::Directory(dir) => Some(dir),
            _ => None,
        }
    }

    pub fn is_detached(&self) -> bool {
        matches!(
            self.file().map(|f| f.state),
            Some(FileState::Trash) | Some(FileState::Reserved)
        )
    }

    /// Per-node contribution to directory stats and quota accounting.
    pub fn stats_entry(&self, goal: &crate::goal::Goal) -> StatsRecord {
        match &self.kind {
            NodeKind::Directory(dir) => {
                let mut stats = dir.stats;
                stats.inodes += 1;
                stats.dirs += 1;
                stats
            }
            NodeKind::File(file) => {
                let size = self.file_size();
                StatsRecord {
                    inodes: 1,
                    dirs: 0,
                    files: 1,
                    chunks: file.chunks.iter().filter(|&&c| c != 0).count() as u32,
                    length: file.length,
                    size,
                    realsize: goal.real_size(size),
                }
            }
            NodeKind::Symlink(path) => StatsRecord {
                inodes: 1,
                length: path.len() as u64,
                ..Default::default()
            },
            _ => StatsRecord {
                inodes: 1,
                ..Default::default()
            },
        }
    }

    /// On-disk size of a file: each chunk's used span rounded up to blocks.
    pub fn file_size(&self) -> u64 {
        let Some(file) = self.file() else {
            return 0;
        };
        let mut size = 0u64;
        for (index, &chunk) in file.chunks.iter().enumerate() {
            if chunk == 0 {
                continue;
            }
            let chunk_start = index as u64 * CHUNK_SIZE;
            if file.length <= chunk_start {
                // Chunk beyond the logical length still occupies one block.
                size += BLOCK_SIZE;
                continue;
            }
            let used = (file.length - chunk_start).min(CHUNK_SIZE);
            size += used.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        }
        size
    }

    /// Record hash folded into the running metadata checksum.
    pub fn compute_checksum(&self) -> u64 {
        let mut digest = Digest::new();
        digest
            .put_u32(self.id)
            .put_u8(self.kind.type_char() as u8)
            .put_u16(self.mode)
            .put_u32(self.uid)
            .put_u32(self.gid)
            .put_u32(self.atime)
            .put_u32(self.mtime)
            .put_u32(self.ctime)
            .put_u8(self.goal)
            .put_u32(self.trashtime)
            .put_u8(self.eattr);
        for parent in &self.parents {
            digest.put_u32(*parent);
        }
        match &self.kind {
            NodeKind::File(file) => {
                digest.put_u64(file.length);
                digest.put_u8(match file.state {
                    FileState::Linked => 0,
                    FileState::Trash => 1,
                    FileState::Reserved => 2,
                });
                for chunk in &file.chunks {
                    digest.put_u64(*chunk);
                }
                for session in &file.sessions {
                    digest.put_u32(*session);
                }
            }
            NodeKind::Directory(dir) => {
                for (name, child) in &dir.entries {
                    digest.put_bytes(name.as_bytes());
                    digest.put_u32(*child);
                }
            }
            NodeKind::Symlink(path) => {
                digest.put_bytes(path.as_bytes());
            }
            NodeKind::CharDev(rdev) | NodeKind::BlockDev(rdev) => {
                digest.put_u32(*rdev);
            }
            NodeKind::Fifo | NodeKind::Socket => {}
        }
        for (name, value) in &self.xattrs {
            digest.put_bytes(name.as_bytes());
            digest.put_bytes(value);
        }
        for acl in [&self.access_acl, &self.default_acl].into_iter().flatten() {
            digest.put_bytes(acl.to_record_string().as_bytes());
        }
        digest.finish()
    }
}

/// Directory entry names: non-empty, no NUL, no '/', bounded length, and
/// the two reserved dot names are rejected.
pub fn name_is_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    if name == "." || name == ".." {
        return false;
    }
    !name.bytes().any(|b| b == 0 || b == b'/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::Goal;

    #[test]
    fn name_validation() {
        assert!(name_is_valid("file.txt"));
        assert!(!name_is_valid(""));
        assert!(!name_is_valid("."));
        assert!(!name_is_valid(".."));
        assert!(!name_is_valid("a/b"));
        assert!(!name_is_valid("a\0b"));
        assert!(!name_is_valid(&"x".repeat(256)));
        assert!(name_is_valid(&"x".repeat(255)));
    }

    #[test]
    fn file_size_rounds_to_blocks() {
        let mut node = FsNode::new(5, NodeKind::File(FileNode::default()), 0o644, 0, 0, 0);
        {
            let file = node.file_mut().unwrap();
            file.chunks = vec![101];
            file.length = 10;
        }
        assert_eq!(node.file_size(), BLOCK_SIZE);
        node.file_mut().unwrap().length = BLOCK_SIZE + 1;
        assert_eq!(node.file_size(), 2 * BLOCK_SIZE);
    }

    #[test]
    fn checksum_tracks_field_changes() {
        let mut node = FsNode::new(7, NodeKind::File(FileNode::default()), 0o640, 10, 10, 99);
        let before = node.compute_checksum();
        node.mode = 0o600;
        assert_ne!(node.compute_checksum(), before);
        node.mode = 0o640;
        assert_eq!(node.compute_checksum(), before);
    }

    #[test]
    fn stats_entry_for_file_counts_chunks() {
        let mut node = FsNode::new(3, NodeKind::File(FileNode::default()), 0o644, 0, 0, 0);
        {
            let file = node.file_mut().unwrap();
            file.chunks = vec![11, 0, 12];
            file.length = 2 * CHUNK_SIZE + 100;
        }
        let goal = Goal::from_id(2).unwrap();
        let stats = node.stats_entry(&goal);
        assert_eq!(stats.files, 1);
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.length, 2 * CHUNK_SIZE + 100);
        assert_eq!(stats.realsize, stats.size * 2);
    }

    #[test]
    fn acl_record_string_round_trip() {
        let acl = AccessControlList {
            entries: vec![
                ("u".to_string(), Some(1000), 6),
                ("g".to_string(), None, 4),
                ("o".to_string(), None, 0),
            ],
        };
        let text = acl.to_record_string();
        assert_eq!(AccessControlList::from_record_string(&text), Some(acl));
    }
}
