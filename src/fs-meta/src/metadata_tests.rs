//! End-to-end metadata scenarios and property checks: namespace CRUD,
//! trash/reserved lifecycle, quota, locks, repair, and full changelog
//! replay onto a fresh shadow.

use rand::{Rng, SeedableRng};

use crate::node::{FileState, NodeKind, CHUNK_SIZE, ROOT_INODE};
use crate::ops::{
    SugidClearMode, TruncateOutcome, SET_GID, SET_MODE, SET_UID, SMODE_RECURSIVE,
};
use crate::quota::{QuotaOwnerType, QuotaResource, QuotaRigor};
use crate::{FsContext, FsError, FsMetadata};

fn ctx(ts: u32) -> FsContext {
    FsContext::master(ts, 0, 0)
}

fn user_ctx(ts: u32, uid: u32, gid: u32) -> FsContext {
    FsContext::master(ts, uid, gid)
}

fn write_block(fs: &mut FsMetadata, c: &FsContext, inode: u32, index: u32) -> u64 {
    let grant = fs.write_chunk(c, inode, index, 0).unwrap();
    fs.write_end(
        c,
        inode,
        index as u64 * CHUNK_SIZE + 10,
        grant.chunk_id,
        grant.lock_id,
    )
    .unwrap();
    grant.chunk_id
}

#[test]
fn create_write_getattr() {
    let mut fs = FsMetadata::new();
    let c = ctx(100);
    let dir = fs.mkdir(&c, ROOT_INODE, "a", 0o755, 0).unwrap();
    let file = fs.mknod(&c, dir, "b", 'f', 0o640, 0, 0).unwrap();

    let grant = fs.write_chunk(&c, file, 0, 0).unwrap();
    assert_eq!(grant.file_length, 0);
    fs.write_end(&c, file, 10, grant.chunk_id, grant.lock_id)
        .unwrap();

    let attr = fs.attr(file).unwrap();
    assert_eq!(attr.length, 10);
    assert_eq!(attr.kind, b'f');
    assert_eq!(attr.mode, 0o640);

    let (chunk_id, version, length) = fs.read_chunk(file, 0).unwrap();
    assert_eq!(chunk_id, grant.chunk_id);
    assert_eq!(version, grant.version);
    assert_eq!(length, 10);
    fs.verify_invariants().unwrap();
}

#[test]
fn lookup_errors() {
    let mut fs = FsMetadata::new();
    let c = ctx(1);
    let file = fs.mknod(&c, ROOT_INODE, "plain", 'f', 0o644, 0, 0).unwrap();
    assert_eq!(
        fs.lookup(&c, ROOT_INODE, "missing"),
        Err(FsError::NoEnt)
    );
    assert_eq!(fs.lookup(&c, file, "x"), Err(FsError::NotDir));
    assert_eq!(fs.lookup(&c, 999, "x"), Err(FsError::NoEnt));
    assert_eq!(fs.lookup(&c, ROOT_INODE, "bad/name"), Err(FsError::Inval));

    let restricted = user_ctx(2, 1000, 1000);
    let private = fs.mkdir(&c, ROOT_INODE, "private", 0o700, 0).unwrap();
    assert_eq!(fs.lookup(&restricted, private, "x"), Err(FsError::Access));
}

#[test]
fn trash_lifecycle_with_undelete() {
    let mut fs = FsMetadata::new();
    let c = ctx(100);
    let dir = fs.mkdir(&c, ROOT_INODE, "docs", 0o755, 0).unwrap();
    let file = fs.mknod(&c, dir, "keep", 'f', 0o644, 0, 0).unwrap();
    let chunk = write_block(&mut fs, &c, file, 0);
    fs.settrashtime(&c, file, 86400, 0).unwrap();

    fs.unlink(&c, dir, "keep").unwrap();
    assert_eq!(
        fs.node(file).unwrap().file().unwrap().state,
        FileState::Trash
    );
    let listed = fs.trash_entries();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].0, file);
    assert_eq!(listed[0].1.path, "/docs/keep");
    // The chunk stays referenced while the node sits in trash.
    assert_eq!(fs.chunks.file_ref_count(chunk), 1);
    fs.verify_invariants().unwrap();

    // Undelete restores the original path.
    fs.undel(&c, file).unwrap();
    assert_eq!(fs.lookup(&c, dir, "keep").unwrap(), file);
    assert_eq!(
        fs.node(file).unwrap().file().unwrap().state,
        FileState::Linked
    );
    assert!(fs.trash_entries().is_empty());

    // Unlink again and purge for real; the chunk reference drops.
    fs.unlink(&c, dir, "keep").unwrap();
    fs.purge(&c, file).unwrap();
    assert_eq!(fs.chunks.file_ref_count(chunk), 0);
    assert!(fs.node(file).is_err());
    fs.verify_invariants().unwrap();
}

#[test]
fn undelete_recreates_missing_directories() {
    let mut fs = FsMetadata::new();
    let c = ctx(50);
    let dir = fs.mkdir(&c, ROOT_INODE, "gone", 0o755, 0).unwrap();
    let file = fs.mknod(&c, dir, "f", 'f', 0o644, 0, 0).unwrap();
    fs.settrashtime(&c, file, 3600, 0).unwrap();
    fs.unlink(&c, dir, "f").unwrap();
    fs.rmdir(&c, ROOT_INODE, "gone").unwrap();

    fs.undel(&c, file).unwrap();
    let dir = fs.lookup(&c, ROOT_INODE, "gone").unwrap();
    assert_eq!(fs.lookup(&c, dir, "f").unwrap(), file);
    fs.verify_invariants().unwrap();
}

#[test]
fn reserved_lifecycle_over_two_sessions() {
    let mut fs = FsMetadata::new();
    let c = ctx(100);
    let file = fs.mknod(&c, ROOT_INODE, "shared", 'f', 0o666, 0, 0).unwrap();
    let s1 = fs.new_session(&c);
    let s2 = fs.new_session(&c);
    fs.acquire(&c, file, s1).unwrap();
    fs.acquire(&c, file, s2).unwrap();

    // Unlink with no trashtime but open sessions: Reserved, not purged.
    fs.unlink(&c, ROOT_INODE, "shared").unwrap();
    assert_eq!(
        fs.node(file).unwrap().file().unwrap().state,
        FileState::Reserved
    );
    assert_eq!(fs.reserved_entries(), vec![file]);

    fs.release(&c, file, s1).unwrap();
    assert!(fs.node(file).is_ok(), "still held by the second session");

    fs.release(&c, file, s2).unwrap();
    assert!(fs.node(file).is_err(), "purged with the last release");
    assert!(fs.reserved_entries().is_empty());
    fs.verify_invariants().unwrap();
}

#[test]
fn trash_expiry_demotes_open_files_to_reserved() {
    let mut fs = FsMetadata::new();
    let c = ctx(100);
    let held = fs.mknod(&c, ROOT_INODE, "held", 'f', 0o644, 0, 0).unwrap();
    let plain = fs.mknod(&c, ROOT_INODE, "plain", 'f', 0o644, 0, 0).unwrap();
    fs.settrashtime(&c, held, 60, 0).unwrap();
    fs.settrashtime(&c, plain, 60, 0).unwrap();
    let session = fs.new_session(&c);
    fs.acquire(&c, held, session).unwrap();
    fs.unlink(&c, ROOT_INODE, "held").unwrap();
    fs.unlink(&c, ROOT_INODE, "plain").unwrap();

    // Nothing expires before the deadline.
    let early = ctx(120);
    assert_eq!(fs.expire_trash(&early, 100).unwrap(), 0);

    let late = ctx(200);
    assert_eq!(fs.expire_trash(&late, 100).unwrap(), 2);
    assert!(fs.node(plain).is_err());
    assert_eq!(
        fs.node(held).unwrap().file().unwrap().state,
        FileState::Reserved
    );
    fs.verify_invariants().unwrap();
}

#[test]
fn rename_into_own_subtree_is_rejected() {
    let mut fs = FsMetadata::new();
    let c = ctx(10);
    let x = fs.mkdir(&c, ROOT_INODE, "x", 0o755, 0).unwrap();
    let y = fs.mkdir(&c, x, "y", 0o755, 0).unwrap();
    assert_eq!(fs.rename(&c, x, "y", y, "z"), Err(FsError::Inval));
    fs.verify_invariants().unwrap();
}

#[test]
fn rename_replaces_destination() {
    let mut fs = FsMetadata::new();
    let c = ctx(10);
    let a = fs.mknod(&c, ROOT_INODE, "a", 'f', 0o644, 0, 0).unwrap();
    let _b = fs.mknod(&c, ROOT_INODE, "b", 'f', 0o644, 0, 0).unwrap();
    fs.rename(&c, ROOT_INODE, "a", ROOT_INODE, "b").unwrap();
    assert_eq!(fs.lookup(&c, ROOT_INODE, "b").unwrap(), a);
    assert_eq!(fs.lookup(&c, ROOT_INODE, "a"), Err(FsError::NoEnt));
    fs.verify_invariants().unwrap();

    // A populated directory cannot be replaced.
    let d1 = fs.mkdir(&c, ROOT_INODE, "d1", 0o755, 0).unwrap();
    let _d2 = fs.mkdir(&c, ROOT_INODE, "d2", 0o755, 0).unwrap();
    fs.mknod(&c, d1, "inner", 'f', 0o644, 0, 0).unwrap();
    assert_eq!(
        fs.rename(&c, ROOT_INODE, "d2", ROOT_INODE, "d1"),
        Err(FsError::NotEmpty)
    );
}

#[test]
fn hardlinks_share_the_inode() {
    let mut fs = FsMetadata::new();
    let c = ctx(10);
    let dir = fs.mkdir(&c, ROOT_INODE, "d", 0o755, 0).unwrap();
    let file = fs.mknod(&c, ROOT_INODE, "one", 'f', 0o644, 0, 0).unwrap();
    fs.link(&c, file, dir, "two").unwrap();
    assert_eq!(fs.attr(file).unwrap().nlink, 2);

    // Unlinking one name keeps the node alive.
    fs.unlink(&c, ROOT_INODE, "one").unwrap();
    assert!(fs.node(file).is_ok());
    assert_eq!(fs.lookup(&c, dir, "two").unwrap(), file);

    // Directories cannot be hard-linked.
    let sub = fs.mkdir(&c, dir, "sub", 0o755, 0).unwrap();
    assert_eq!(fs.link(&c, sub, ROOT_INODE, "dl"), Err(FsError::Perm));
    fs.verify_invariants().unwrap();
}

#[test]
fn sticky_directory_restricts_unlink() {
    let mut fs = FsMetadata::new();
    let root_ctx = ctx(5);
    let tmp = fs.mkdir(&root_ctx, ROOT_INODE, "tmp", 0o1777, 0).unwrap();
    let alice = user_ctx(6, 1000, 1000);
    let bob = user_ctx(7, 1001, 1001);
    fs.mknod(&alice, tmp, "alices", 'f', 0o666, 0, 0).unwrap();
    assert_eq!(fs.unlink(&bob, tmp, "alices"), Err(FsError::Perm));
    fs.unlink(&alice, tmp, "alices").unwrap();
    fs.verify_invariants().unwrap();
}

#[test]
fn quota_limits_creation_and_growth() {
    let mut fs = FsMetadata::new();
    let c = ctx(10);
    fs.set_quota(
        &c,
        QuotaOwnerType::User,
        1000,
        QuotaRigor::Hard,
        QuotaResource::Inodes,
        1,
    )
    .unwrap();
    let alice = user_ctx(11, 1000, 1000);
    fs.mknod(&alice, ROOT_INODE, "f1", 'f', 0o644, 0, 0).unwrap();
    assert_eq!(
        fs.mknod(&alice, ROOT_INODE, "f2", 'f', 0o644, 0, 0),
        Err(FsError::Quota)
    );

    // Size quota blocks new chunk allocation.
    fs.set_quota(
        &c,
        QuotaOwnerType::User,
        1000,
        QuotaRigor::Hard,
        QuotaResource::Size,
        1,
    )
    .unwrap();
    let f1 = fs.lookup(&c, ROOT_INODE, "f1").unwrap();
    assert_eq!(fs.write_chunk(&alice, f1, 0, 0), Err(FsError::Quota));
    fs.verify_invariants().unwrap();
}

#[test]
fn chown_moves_quota_usage() {
    let mut fs = FsMetadata::new();
    let c = ctx(10);
    let file = fs.mknod(&c, ROOT_INODE, "f", 'f', 0o6644, 0, 0).unwrap();
    write_block(&mut fs, &c, file, 0);
    fs.setattr(
        &c,
        file,
        SET_UID | SET_GID,
        0,
        1000,
        1000,
        0,
        0,
        SugidClearMode::Always,
    )
    .unwrap();
    let node = fs.node(file).unwrap();
    assert_eq!(node.uid, 1000);
    // Always-mode chown strips set-uid/set-gid.
    assert_eq!(node.mode & 0o6000, 0);
    assert_eq!(
        fs.quota.usage(QuotaOwnerType::User, 1000, QuotaResource::Inodes),
        1
    );
    fs.verify_invariants().unwrap();
}

#[test]
fn setattr_mode_respects_ownership() {
    let mut fs = FsMetadata::new();
    let c = ctx(10);
    let alice = user_ctx(11, 1000, 1000);
    let bob = user_ctx(12, 1001, 1001);
    let file = fs.mknod(&alice, ROOT_INODE, "hers", 'f', 0o644, 0, 0).unwrap();
    assert_eq!(
        fs.setattr(&bob, file, SET_MODE, 0o600, 0, 0, 0, 0, SugidClearMode::Never),
        Err(FsError::Perm)
    );
    fs.setattr(&alice, file, SET_MODE, 0o600, 0, 0, 0, 0, SugidClearMode::Never)
        .unwrap();
    assert_eq!(fs.node(file).unwrap().mode, 0o600);
}

#[test]
fn write_chunk_grows_in_documented_steps() {
    let mut fs = FsMetadata::new();
    let c = ctx(10);
    let file = fs.mknod(&c, ROOT_INODE, "big", 'f', 0o644, 0, 0).unwrap();
    write_block(&mut fs, &c, file, 0);
    assert_eq!(fs.node(file).unwrap().file().unwrap().chunks.len(), 1);
    write_block(&mut fs, &c, file, 9);
    assert_eq!(fs.node(file).unwrap().file().unwrap().chunks.len(), 16);
    write_block(&mut fs, &c, file, 70);
    assert_eq!(fs.node(file).unwrap().file().unwrap().chunks.len(), 128);
    assert_eq!(
        fs.write_chunk(&c, file, crate::node::MAX_CHUNK_INDEX + 1, 0),
        Err(FsError::IndexTooBig)
    );
    fs.verify_invariants().unwrap();
}

#[test]
fn rewriting_a_chunk_bumps_its_version() {
    let mut fs = FsMetadata::new();
    let c = ctx(10);
    let file = fs.mknod(&c, ROOT_INODE, "v", 'f', 0o644, 0, 0).unwrap();
    let first = fs.write_chunk(&c, file, 0, 0).unwrap();
    fs.write_end(&c, file, 10, first.chunk_id, first.lock_id)
        .unwrap();
    let second = fs.write_chunk(&c, file, 0, 0).unwrap();
    assert_eq!(second.chunk_id, first.chunk_id);
    assert_eq!(second.version, first.version + 1);
}

#[test]
fn truncate_mid_chunk_is_delayed() {
    let mut fs = FsMetadata::new();
    let c = ctx(10);
    let file = fs.mknod(&c, ROOT_INODE, "t", 'f', 0o644, 0, 0).unwrap();
    write_block(&mut fs, &c, file, 0);

    match fs.try_truncate(&c, file, 5, false).unwrap() {
        TruncateOutcome::Delayed { chunk_id, lock_id, .. } => {
            // Chunkservers confirm, then the length is committed.
            fs.write_end(&c, file, 0, chunk_id, lock_id).unwrap();
            fs.set_length(&c, file, 5, false).unwrap();
        }
        TruncateOutcome::Done => panic!("mid-chunk truncate must be delayed"),
    }
    assert_eq!(fs.node(file).unwrap().file().unwrap().length, 5);

    // A block-aligned cut down to zero is metadata-only.
    assert_eq!(
        fs.try_truncate(&c, file, 0, false).unwrap(),
        TruncateOutcome::Done
    );
    fs.set_length(&c, file, 0, false).unwrap();
    assert!(fs
        .node(file)
        .unwrap()
        .file()
        .unwrap()
        .chunks
        .is_empty());
    fs.verify_invariants().unwrap();
}

#[test]
fn append_shares_chunks_and_updates_refcounts() {
    let mut fs = FsMetadata::new();
    let c = ctx(10);
    let src = fs.mknod(&c, ROOT_INODE, "src", 'f', 0o644, 0, 0).unwrap();
    let dst = fs.mknod(&c, ROOT_INODE, "dst", 'f', 0o644, 0, 0).unwrap();
    let chunk = write_block(&mut fs, &c, src, 0);
    write_block(&mut fs, &c, dst, 0);

    fs.append(&c, dst, src).unwrap();
    assert_eq!(fs.chunks.file_ref_count(chunk), 2);
    let dst_file = fs.node(dst).unwrap().file().unwrap().clone();
    assert_eq!(dst_file.chunks.len(), 2);
    assert_eq!(dst_file.chunks[1], chunk);
    assert_eq!(dst_file.length, CHUNK_SIZE + 10);
    fs.verify_invariants().unwrap();
}

#[test]
fn repair_counts_follow_copy_state() {
    let mut fs = FsMetadata::new();
    let c = ctx(10);
    let file = fs.mknod(&c, ROOT_INODE, "r", 'f', 0o644, 0, 0).unwrap();
    let healthy = write_block(&mut fs, &c, file, 0);
    let stale = write_block(&mut fs, &c, file, 1);
    let gone = write_block(&mut fs, &c, file, 2);

    // Rewrite index 1 so its chunk is at version 2 while the only copy
    // reported by chunkservers stays at version 1.
    let bump = fs.write_chunk(&c, file, 1, 0).unwrap();
    fs.write_end(&c, file, 0, bump.chunk_id, bump.lock_id).unwrap();
    assert_eq!(fs.chunks.get(stale).unwrap().version, 2);

    let healthy_version = fs.chunks.get(healthy).unwrap().version;
    fs.chunks
        .register_copy(healthy, wire_proto::ChunkPartType::Standard, healthy_version);
    fs.chunks
        .register_copy(stale, wire_proto::ChunkPartType::Standard, 1);
    let _ = gone; // no copies registered at all

    let (not_changed, erased, repaired) = fs.repair(&c, file).unwrap();
    assert_eq!(not_changed, 1);
    assert_eq!(repaired, 1);
    assert_eq!(erased, 1);
    assert_eq!(fs.chunks.get(stale).unwrap().version, 1);
    assert_eq!(fs.node(file).unwrap().file().unwrap().chunks[2], 0);
    fs.verify_invariants().unwrap();
}

#[test]
fn xattr_modes() {
    let mut fs = FsMetadata::new();
    let c = ctx(10);
    let file = fs.mknod(&c, ROOT_INODE, "x", 'f', 0o644, 0, 0).unwrap();
    fs.setxattr(&c, file, "user.tag", b"blue", crate::ops::XATTR_CREATE_ONLY)
        .unwrap();
    assert_eq!(
        fs.setxattr(&c, file, "user.tag", b"red", crate::ops::XATTR_CREATE_ONLY),
        Err(FsError::Exist)
    );
    fs.setxattr(&c, file, "user.tag", b"red", crate::ops::XATTR_REPLACE_ONLY)
        .unwrap();
    assert_eq!(fs.getxattr(file, "user.tag").unwrap(), b"red");
    assert_eq!(fs.listxattr(file).unwrap(), vec!["user.tag".to_string()]);
    fs.setxattr(&c, file, "user.tag", b"", crate::ops::XATTR_REMOVE)
        .unwrap();
    assert_eq!(fs.getxattr(file, "user.tag"), Err(FsError::NoEnt));
}

#[test]
fn recursive_settrashtime_counts() {
    let mut fs = FsMetadata::new();
    let c = ctx(10);
    let dir = fs.mkdir(&c, ROOT_INODE, "tree", 0o755, 0).unwrap();
    let alice = user_ctx(11, 1000, 1000);
    fs.mknod(&c, dir, "roots", 'f', 0o644, 0, 0).unwrap();
    fs.mknod(&alice, dir, "alices", 'f', 0o644, 0, 0).unwrap();

    let counters = fs
        .settrashtime(&user_ctx(12, 1000, 1000), dir, 7200, SMODE_RECURSIVE)
        .unwrap();
    assert_eq!(counters.changed, 1); // alice's file
    assert_eq!(counters.not_permitted, 2); // the dir and root's file

    let counters = fs.settrashtime(&c, dir, 7200, SMODE_RECURSIVE).unwrap();
    assert_eq!(counters.changed, 2);
    assert_eq!(counters.not_changed, 1);
}

#[test]
fn version_monotonicity() {
    let mut fs = FsMetadata::new();
    let c = ctx(10);
    let before = fs.metaversion;
    fs.mkdir(&c, ROOT_INODE, "one", 0o755, 0).unwrap();
    assert_eq!(fs.metaversion, before + 1);
    fs.mknod(&c, ROOT_INODE, "two", 'f', 0o644, 0, 0).unwrap();
    assert_eq!(fs.metaversion, before + 2);
    // Failed operations never bump the version.
    assert_eq!(
        fs.mkdir(&c, ROOT_INODE, "one", 0o755, 0),
        Err(FsError::Exist)
    );
    assert_eq!(fs.metaversion, before + 2);
}

// ========== replay ==========

/// Drive a pseudo-random CRUD workload, then replay the changelog on a
/// fresh shadow and compare running checksums.
#[test]
fn random_workload_replays_identically() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(20260801);
    let mut fs = FsMetadata::new();
    let mut dirs: Vec<u32> = vec![ROOT_INODE];
    let mut files: Vec<u32> = Vec::new();
    let mut name_counter = 0u32;

    for step in 0..600u32 {
        let ts = 1000 + step;
        let uid = if rng.gen_bool(0.8) { 0 } else { 1000 };
        let c = user_ctx(ts, uid, uid);
        let parent = dirs[rng.gen_range(0..dirs.len())];
        name_counter += 1;
        let name = format!("n{}", name_counter);
        match rng.gen_range(0..12) {
            0 => {
                if let Ok(id) = fs.mkdir(&c, parent, &name, 0o755, 0) {
                    dirs.push(id);
                }
            }
            1 | 2 => {
                if let Ok(id) = fs.mknod(&c, parent, &name, 'f', 0o644, 0, 0) {
                    files.push(id);
                }
            }
            3 => {
                let _ = fs.symlink(&c, parent, &name, "/target");
            }
            4 => {
                if let Some(&file) = files.last() {
                    if fs.node(file).is_ok() {
                        let _ = fs.link(&c, file, parent, &name);
                    }
                }
            }
            5 => {
                if !files.is_empty() {
                    let file = files[rng.gen_range(0..files.len())];
                    if fs.node(file).is_ok() {
                        let grant_result = fs.write_chunk(&c, file, rng.gen_range(0..3), 0);
                        if let Ok(grant) = grant_result {
                            let _ = fs.write_end(
                                &c,
                                file,
                                rng.gen_range(0..CHUNK_SIZE),
                                grant.chunk_id,
                                grant.lock_id,
                            );
                        }
                    }
                }
            }
            6 => {
                // Unlink a random entry of the parent.
                let target = fs
                    .node(parent)
                    .ok()
                    .and_then(|node| node.directory())
                    .and_then(|dir| {
                        let names: Vec<String> = dir.entries.keys().cloned().collect();
                        if names.is_empty() {
                            None
                        } else {
                            Some(names[rng.gen_range(0..names.len())].clone())
                        }
                    });
                if let Some(victim) = target {
                    let _ = fs.unlink(&c, parent, &victim);
                }
            }
            7 => {
                if !files.is_empty() {
                    let file = files[rng.gen_range(0..files.len())];
                    if fs.node(file).is_ok() {
                        let _ = fs.settrashtime(&c, file, rng.gen_range(0..1000), 0);
                    }
                }
            }
            8 => {
                if !files.is_empty() {
                    let file = files[rng.gen_range(0..files.len())];
                    if fs.node(file).is_ok() {
                        let _ = fs.setattr(
                            &c,
                            file,
                            SET_MODE,
                            rng.gen_range(0..0o777),
                            0,
                            0,
                            0,
                            0,
                            SugidClearMode::Never,
                        );
                    }
                }
            }
            9 => {
                let _ = fs.expire_trash(&c, 10);
            }
            10 => {
                if dirs.len() > 1 {
                    let src_parent = dirs[rng.gen_range(0..dirs.len())];
                    let dst_parent = dirs[rng.gen_range(0..dirs.len())];
                    let source = fs
                        .node(src_parent)
                        .ok()
                        .and_then(|node| node.directory())
                        .and_then(|dir| dir.entries.keys().next().cloned());
                    if let Some(source) = source {
                        let _ = fs.rename(&c, src_parent, &source, dst_parent, &name);
                    }
                }
            }
            _ => {
                if !files.is_empty() {
                    let file = files[rng.gen_range(0..files.len())];
                    if fs.node(file).is_ok() {
                        let _ = fs.setxattr(
                            &c,
                            file,
                            "user.k",
                            name.as_bytes(),
                            crate::ops::XATTR_CREATE_OR_REPLACE,
                        );
                    }
                }
            }
        }
        if step % 50 == 0 {
            fs.verify_invariants().unwrap();
        }
    }
    fs.verify_invariants().unwrap();
    fs.emit_checksum(2000);

    // Replay everything on a fresh shadow.
    let lines = fs.changelog.lines_after(0);
    assert!(lines.len() > 100, "workload produced {} records", lines.len());
    let mut shadow = FsMetadata::new();
    for (_, line) in &lines {
        shadow.apply_line(line).unwrap_or_else(|err| {
            panic!("replay failed at {:?}: {}", line, err);
        });
    }
    assert_eq!(shadow.metaversion, fs.metaversion);
    assert_eq!(shadow.checksum(), fs.checksum());
    shadow.verify_invariants().unwrap();
}

#[test]
fn replay_detects_divergence() {
    let mut fs = FsMetadata::new();
    let c = ctx(10);
    fs.mkdir(&c, ROOT_INODE, "a", 0o755, 0).unwrap();
    let lines = fs.changelog.lines_after(0);

    let mut shadow = FsMetadata::new();
    // Occupy the inode id the record expects.
    let sc = ctx(10);
    shadow.mkdir(&sc, ROOT_INODE, "squatter", 0o755, 0).unwrap();
    shadow.metaversion = 1;
    assert_eq!(shadow.apply_line(&lines[0].1), Err(FsError::Mismatch));
}

#[test]
fn symlink_roundtrip_and_stats() {
    let mut fs = FsMetadata::new();
    let c = ctx(10);
    let link = fs.symlink(&c, ROOT_INODE, "ln", "/some/where").unwrap();
    assert_eq!(fs.readlink(link).unwrap(), "/some/where");
    assert_eq!(
        fs.node(ROOT_INODE).unwrap().directory().unwrap().stats.length,
        11
    );
    match &fs.node(link).unwrap().kind {
        NodeKind::Symlink(path) => assert_eq!(path, "/some/where"),
        other => panic!("unexpected kind {:?}", other),
    }
    fs.verify_invariants().unwrap();
}
