//! Long-running recursive operations, decomposed into cooperatively
//! scheduled tasks. A task processes one batch of inodes per turn and may
//! enqueue follow-up tasks (one per subdirectory encountered); the manager
//! interleaves submissions round-robin and fires the submitter's callback
//! with the aggregated counters once every task of the submission drained.

use std::collections::{HashMap, VecDeque};

use log::debug;

use crate::metadata::FsMetadata;
use crate::node::InodeId;
use crate::ops::TaskCounters;
use crate::{FsContext, FsError, FsResult};

pub const INITIAL_TASK_BATCH_SIZE: usize = 1000;

pub type SubmissionId = u64;
pub type TaskCallback = Box<dyn FnOnce(TaskCounters) + Send>;

pub trait Task: Send {
    /// Process up to `batch` units of work. Newly discovered work goes to
    /// `follow_ups` (same submission). Returns the counter delta.
    fn execute(
        &mut self,
        fs: &mut FsMetadata,
        ctx: &FsContext,
        batch: usize,
        follow_ups: &mut Vec<Box<dyn Task>>,
    ) -> FsResult<TaskCounters>;

    fn is_finished(&self) -> bool;
}

/// The attribute pushed down a subtree.
#[derive(Clone, Copy, Debug)]
pub enum SubtreeUpdate {
    Goal(u8),
    Trashtime { value: u32, smode: u8 },
    Eattr(u8),
}

/// Recursive attribute update over an inode list; directories met on the
/// way spawn a follow-up task per directory for their children.
pub struct SubtreeTask {
    update: SubtreeUpdate,
    uid: u32,
    pending: VecDeque<InodeId>,
}

impl SubtreeTask {
    pub fn new(update: SubtreeUpdate, uid: u32, inodes: Vec<InodeId>) -> Self {
        Self {
            update,
            uid,
            pending: inodes.into(),
        }
    }
}

impl Task for SubtreeTask {
    fn execute(
        &mut self,
        fs: &mut FsMetadata,
        ctx: &FsContext,
        batch: usize,
        follow_ups: &mut Vec<Box<dyn Task>>,
    ) -> FsResult<TaskCounters> {
        let mut counters = TaskCounters::default();
        for _ in 0..batch {
            let Some(inode) = self.pending.pop_front() else {
                break;
            };
            let children: Vec<InodeId> = fs
                .node(inode)
                .ok()
                .and_then(|node| node.directory())
                .map(|dir| dir.entries.values().copied().collect())
                .unwrap_or_default();
            if !children.is_empty() {
                follow_ups.push(Box::new(SubtreeTask::new(
                    self.update,
                    self.uid,
                    children,
                )));
            }
            // Per-inode, non-recursive update; each one emits its own
            // changelog record through the regular operation.
            let single = FsContext {
                uid: self.uid,
                ..*ctx
            };
            let result = match self.update {
                SubtreeUpdate::Goal(goal) => fs.setgoal(&single, inode, goal, 0),
                SubtreeUpdate::Trashtime { value, smode } => {
                    fs.settrashtime(&single, inode, value, smode & 0x3)
                }
                SubtreeUpdate::Eattr(eattr) => fs.seteattr(&single, inode, eattr, 0),
            };
            match result {
                Ok(delta) => {
                    counters.changed += delta.changed;
                    counters.not_changed += delta.not_changed;
                    counters.not_permitted += delta.not_permitted;
                }
                Err(FsError::Perm) => counters.not_permitted += 1,
                Err(FsError::NoEnt) => {
                    // Raced with an unlink; nothing to count.
                }
                Err(err) => return Err(err),
            }
        }
        Ok(counters)
    }

    fn is_finished(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Periodic trash expiry; re-armed by the server loop.
pub struct TrashSweepTask {
    done: bool,
}

impl TrashSweepTask {
    pub fn new() -> Self {
        Self { done: false }
    }
}

impl Default for TrashSweepTask {
    fn default() -> Self {
        Self::new()
    }
}

impl Task for TrashSweepTask {
    fn execute(
        &mut self,
        fs: &mut FsMetadata,
        ctx: &FsContext,
        batch: usize,
        _follow_ups: &mut Vec<Box<dyn Task>>,
    ) -> FsResult<TaskCounters> {
        let purged = fs.expire_trash(ctx, batch)?;
        self.done = true;
        Ok(TaskCounters {
            changed: purged,
            ..Default::default()
        })
    }

    fn is_finished(&self) -> bool {
        self.done
    }
}

struct Submission {
    live_tasks: usize,
    counters: TaskCounters,
    callback: Option<TaskCallback>,
}

/// Fairness scheduler for tasks, driven from the master's main loop
/// between request batches.
pub struct TaskManager {
    queue: VecDeque<(SubmissionId, Box<dyn Task>)>,
    submissions: HashMap<SubmissionId, Submission>,
    next_submission: SubmissionId,
    batch_size: usize,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            submissions: HashMap::new(),
            next_submission: 1,
            batch_size: INITIAL_TASK_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            ..Self::new()
        }
    }

    pub fn submit(&mut self, task: Box<dyn Task>, callback: Option<TaskCallback>) -> SubmissionId {
        let id = self.next_submission;
        self.next_submission += 1;
        self.submissions.insert(
            id,
            Submission {
                live_tasks: 1,
                counters: TaskCounters::default(),
                callback,
            },
        );
        self.queue.push_back((id, task));
        debug!("task submission {} queued", id);
        id
    }

    pub fn has_work(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Run up to `rounds` batches, interleaving submissions. Each round
    /// takes the front task, gives it one batch, and requeues it (and its
    /// follow-ups) at the back.
    pub fn process(&mut self, fs: &mut FsMetadata, ctx: &FsContext, rounds: usize) -> usize {
        let mut executed = 0;
        for _ in 0..rounds {
            let Some((submission_id, mut task)) = self.queue.pop_front() else {
                break;
            };
            let mut follow_ups = Vec::new();
            let outcome = task.execute(fs, ctx, self.batch_size, &mut follow_ups);
            executed += 1;
            let submission = self
                .submissions
                .get_mut(&submission_id)
                .expect("submission for queued task");
            match outcome {
                Ok(delta) => {
                    submission.counters.changed += delta.changed;
                    submission.counters.not_changed += delta.not_changed;
                    submission.counters.not_permitted += delta.not_permitted;
                }
                Err(err) => {
                    debug!("task of submission {} failed: {}", submission_id, err);
                }
            }
            submission.live_tasks += follow_ups.len();
            for follow_up in follow_ups {
                self.queue.push_back((submission_id, follow_up));
            }
            if task.is_finished() {
                submission.live_tasks -= 1;
            } else {
                self.queue.push_back((submission_id, task));
            }
            if submission.live_tasks == 0 {
                let submission = self.submissions.remove(&submission_id).unwrap();
                if let Some(callback) = submission.callback {
                    callback(submission.counters);
                }
            }
        }
        executed
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ROOT_INODE;
    use std::sync::{Arc, Mutex};

    fn ctx(ts: u32) -> FsContext {
        FsContext::master(ts, 0, 0)
    }

    fn build_tree(fs: &mut FsMetadata) -> (InodeId, Vec<InodeId>) {
        let c = ctx(10);
        let dir = fs.mkdir(&c, ROOT_INODE, "tree", 0o755, 0).unwrap();
        let mut files = Vec::new();
        for i in 0..5 {
            files.push(
                fs.mknod(&c, dir, &format!("f{}", i), 'f', 0o644, 0, 0)
                    .unwrap(),
            );
        }
        let sub = fs.mkdir(&c, dir, "sub", 0o755, 0).unwrap();
        files.push(fs.mknod(&c, sub, "deep", 'f', 0o644, 0, 0).unwrap());
        (dir, files)
    }

    #[test]
    fn subtree_task_updates_whole_tree() {
        let mut fs = FsMetadata::new();
        let (dir, files) = build_tree(&mut fs);

        let mut manager = TaskManager::with_batch_size(2);
        let result: Arc<Mutex<Option<TaskCounters>>> = Arc::new(Mutex::new(None));
        let result_clone = result.clone();
        manager.submit(
            Box::new(SubtreeTask::new(
                SubtreeUpdate::Trashtime {
                    value: 3600,
                    smode: 0,
                },
                0,
                vec![dir],
            )),
            Some(Box::new(move |counters| {
                *result_clone.lock().unwrap() = Some(counters);
            })),
        );

        let c = ctx(20);
        let mut guard = 0;
        while manager.has_work() {
            manager.process(&mut fs, &c, 1);
            guard += 1;
            assert!(guard < 100, "task manager did not converge");
        }
        let counters = result.lock().unwrap().take().expect("callback fired");
        // Root dir + sub dir + 6 files.
        assert_eq!(counters.changed, 8);
        for file in files {
            assert_eq!(fs.node(file).unwrap().trashtime, 3600);
        }
        fs.verify_invariants().unwrap();
    }

    #[test]
    fn interleaving_is_fair_across_submissions() {
        let mut fs = FsMetadata::new();
        let (dir, _) = build_tree(&mut fs);
        let mut manager = TaskManager::with_batch_size(1);
        manager.submit(
            Box::new(SubtreeTask::new(SubtreeUpdate::Goal(3), 0, vec![dir])),
            None,
        );
        manager.submit(Box::new(TrashSweepTask::new()), None);
        let c = ctx(30);
        // The sweep (second submission) finishes within the first few
        // rounds even though the first submission has more work.
        let executed = manager.process(&mut fs, &c, 3);
        assert_eq!(executed, 3);
        assert!(manager.has_work());
        while manager.has_work() {
            manager.process(&mut fs, &c, 10);
        }
        fs.verify_invariants().unwrap();
    }
}
