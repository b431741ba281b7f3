//! The transactional executor.
//!
//! A plan either applies in full or the filesystem is restored to its
//! pre-call state, modulo operations whose own rollbacks failed (those are
//! reported, never retried). Validation happens up front against the live
//! filesystem plus a pending-effects set, so an operation may rely on a
//! path that an earlier operation in the same plan creates.

use std::collections::HashMap;

use camino::Utf8Path;
use tracing::{debug, warn};

use crate::context::{AppContext, CancelToken};
use crate::error::{ConflictKind, Error, Result};
use crate::fs_utils::{self, FsType};
use crate::ops::{Checkpoint, OpKind, OperationId};
use crate::planner::Plan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Created(FsType),
    Removed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub executed: usize,
}

pub struct Executor {
    concurrency: usize,
    cancel: CancelToken,
}

impl Executor {
    pub fn new(ctx: &AppContext) -> Self {
        Self {
            concurrency: ctx.concurrency.max(1),
            cancel: ctx.cancel.clone(),
        }
    }

    /// Apply the plan: prepare, checkpoint, commit, and on failure roll
    /// back everything that already ran, in reverse order.
    pub fn execute(&self, plan: &Plan) -> Result<ExecutionReport> {
        if plan.is_empty() {
            return Err(Error::EmptyPlan);
        }

        self.prepare(plan)?;

        let mut checkpoints: HashMap<OperationId, Checkpoint> = HashMap::new();
        for (idx, op) in plan.operations.iter().enumerate() {
            match op.checkpoint() {
                Ok(cp) => {
                    checkpoints.insert(op.id, cp);
                }
                Err(e) => {
                    return Err(Error::ExecutionFailed {
                        executed: 0,
                        failed: idx,
                        rolled_back: 0,
                        errors: vec![e],
                    })
                }
            }
        }

        let (executed, failure) = if plan.batches.is_empty() || self.concurrency == 1 {
            self.commit_sequential(plan)
        } else {
            self.commit_batched(plan)
        };

        match failure {
            None => {
                debug!(executed = executed.len(), "plan applied");
                Ok(ExecutionReport {
                    executed: executed.len(),
                })
            }
            Some((failed_idx, mut errors)) => {
                let rolled_back = self.rollback(plan, &executed, &checkpoints, &mut errors);
                Err(Error::ExecutionFailed {
                    executed: executed.len(),
                    failed: failed_idx,
                    rolled_back,
                    errors,
                })
            }
        }
    }

    /// Walk the plan in order and validate every precondition against the
    /// filesystem overlaid with the effects of preceding operations. No
    /// operation runs unless the whole plan validates.
    fn prepare(&self, plan: &Plan) -> Result<()> {
        let mut pending: HashMap<&Utf8Path, Pending> = HashMap::new();

        for (idx, op) in plan.operations.iter().enumerate() {
            if let Err(e) = self
                .cancel
                .check()
                .and_then(|()| validate(&op.kind, &pending))
            {
                return Err(Error::ExecutionFailed {
                    executed: 0,
                    failed: idx,
                    rolled_back: 0,
                    errors: vec![e],
                });
            }
            apply_pending(&op.kind, &mut pending);
        }
        Ok(())
    }

    fn commit_sequential(&self, plan: &Plan) -> (Vec<usize>, Option<(usize, Vec<Error>)>) {
        let mut executed = Vec::new();
        for (idx, op) in plan.operations.iter().enumerate() {
            if let Err(e) = self.cancel.check().and_then(|()| op.execute()) {
                return (executed, Some((idx, vec![e])));
            }
            executed.push(idx);
        }
        (executed, None)
    }

    /// Run each batch on a worker pool; batches are strictly sequential
    /// with respect to each other.
    fn commit_batched(&self, plan: &Plan) -> (Vec<usize>, Option<(usize, Vec<Error>)>) {
        let index_of: HashMap<OperationId, usize> = plan
            .operations
            .iter()
            .enumerate()
            .map(|(i, op)| (op.id, i))
            .collect();

        let mut executed = Vec::new();
        for batch in &plan.batches {
            let indices: Vec<usize> = batch.iter().filter_map(|id| index_of.get(id).copied()).collect();
            if indices.is_empty() {
                continue;
            }
            let workers = self.concurrency.min(indices.len()).max(1);

            let (results, canceled) = run_batch(plan, &indices, workers, &self.cancel);

            let mut failures: Vec<(usize, Error)> = Vec::new();
            for (idx, result) in results {
                match result {
                    Ok(()) => executed.push(idx),
                    Err(e) => failures.push((idx, e)),
                }
            }
            if canceled {
                failures.push((indices[0], Error::Canceled));
            }
            if !failures.is_empty() {
                failures.sort_by_key(|(idx, _)| *idx);
                let failed_idx = failures[0].0;
                let errors = failures.into_iter().map(|(_, e)| e).collect();
                executed.sort_unstable();
                return (executed, Some((failed_idx, errors)));
            }
        }
        executed.sort_unstable();
        (executed, None)
    }

    /// Undo completed operations in reverse plan order. Rollback errors are
    /// collected and reported, never rolled back further.
    fn rollback(
        &self,
        plan: &Plan,
        executed: &[usize],
        checkpoints: &HashMap<OperationId, Checkpoint>,
        errors: &mut Vec<Error>,
    ) -> usize {
        let mut rolled_back = 0;
        for &idx in executed.iter().rev() {
            let op = &plan.operations[idx];
            let result = match checkpoints.get(&op.id) {
                Some(cp) => op.rollback(cp),
                None => Err(Error::CheckpointNotFound { id: op.id }),
            };
            match result {
                Ok(()) => rolled_back += 1,
                Err(e) => {
                    warn!(op = %op.describe(), %e, "rollback failed");
                    errors.push(e);
                }
            }
        }
        rolled_back
    }
}

/// Spawn up to `workers` threads over one batch. Operations within a batch
/// are independent by construction; their completion order is unobservable.
fn run_batch(
    plan: &Plan,
    indices: &[usize],
    workers: usize,
    cancel: &CancelToken,
) -> (Vec<(usize, Result<()>)>, bool) {
    if workers == 1 || indices.len() == 1 {
        let mut out = Vec::new();
        for &idx in indices {
            if cancel.is_canceled() {
                return (out, true);
            }
            out.push((idx, plan.operations[idx].execute()));
        }
        return (out, false);
    }

    let (task_tx, task_rx) = crossbeam::channel::bounded::<usize>(indices.len());
    let (result_tx, result_rx) = crossbeam::channel::unbounded::<(usize, Result<()>)>();

    let mut canceled = false;
    for &idx in indices {
        if cancel.is_canceled() {
            canceled = true;
            break;
        }
        // The channel is sized for the whole batch.
        let _ = task_tx.send(idx);
    }
    drop(task_tx);

    crossbeam::thread::scope(|scope| {
        for _ in 0..workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let cancel = cancel.clone();
            scope.spawn(move |_| {
                while let Ok(idx) = task_rx.recv() {
                    if cancel.is_canceled() {
                        let _ = result_tx.send((idx, Err(Error::Canceled)));
                        continue;
                    }
                    let _ = result_tx.send((idx, plan.operations[idx].execute()));
                }
            });
        }
        drop(result_tx);
    })
    .expect("executor worker panicked");

    let results: Vec<(usize, Result<()>)> = result_rx.into_iter().collect();
    (results, canceled)
}

fn effective(path: &Utf8Path, pending: &HashMap<&Utf8Path, Pending>) -> Option<FsType> {
    match pending.get(path) {
        Some(Pending::Created(kind)) => Some(*kind),
        Some(Pending::Removed) => None,
        None => fs_utils::entry_type(path),
    }
}

fn require_parent(path: &Utf8Path, pending: &HashMap<&Utf8Path, Pending>) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    match effective(parent, pending) {
        Some(FsType::Dir) => Ok(()),
        _ => Err(Error::ParentNotFound {
            path: parent.to_owned(),
        }),
    }
}

fn require_absent(path: &Utf8Path, pending: &HashMap<&Utf8Path, Pending>) -> Result<()> {
    match effective(path, pending) {
        None => Ok(()),
        Some(kind) => Err(Error::Conflict {
            target: path.to_owned(),
            kind: match kind {
                FsType::Dir => ConflictKind::Directory,
                FsType::File => ConflictKind::RegularFile,
                FsType::Symlink => ConflictKind::WrongTarget,
            },
        }),
    }
}

fn require_present(path: &Utf8Path, pending: &HashMap<&Utf8Path, Pending>) -> Result<()> {
    match effective(path, pending) {
        Some(_) => Ok(()),
        None => Err(Error::SourceNotFound {
            path: path.to_owned(),
        }),
    }
}

fn validate(kind: &OpKind, pending: &HashMap<&Utf8Path, Pending>) -> Result<()> {
    match kind {
        OpKind::LinkCreate { source, target } => {
            require_present(source.as_path(), pending)?;
            require_parent(target.as_path(), pending)?;
            require_absent(target.as_path(), pending)
        }
        OpKind::LinkDelete { target } => match effective(target.as_path(), pending) {
            Some(FsType::Symlink) => Ok(()),
            Some(_) => Err(Error::Conflict {
                target: target.as_path().to_owned(),
                kind: ConflictKind::WrongTarget,
            }),
            None => Err(Error::SourceNotFound {
                path: target.as_path().to_owned(),
            }),
        },
        OpKind::DirCreate { path } => {
            require_parent(path.as_path(), pending)?;
            require_absent(path.as_path(), pending)
        }
        OpKind::DirDelete { path } => {
            match effective(path.as_path(), pending) {
                Some(FsType::Dir) => {}
                Some(_) => {
                    return Err(Error::Conflict {
                        target: path.as_path().to_owned(),
                        kind: ConflictKind::RegularFile,
                    })
                }
                None => {
                    return Err(Error::SourceNotFound {
                        path: path.as_path().to_owned(),
                    })
                }
            }
            // Empty means: every on-disk child is removed by a preceding
            // operation and nothing new was created inside.
            if let Ok(entries) = std::fs::read_dir(path.as_path()) {
                for entry in entries.flatten() {
                    if let Ok(child) = camino::Utf8PathBuf::from_path_buf(entry.path()) {
                        if effective(&child, pending).is_some() {
                            return Err(Error::io(
                                "rmdir",
                                path.as_path(),
                                std::io::Error::new(
                                    std::io::ErrorKind::Other,
                                    "directory not empty",
                                ),
                            ));
                        }
                    }
                }
            }
            for (p, state) in pending {
                if matches!(state, Pending::Created(_)) && p.starts_with(path.as_path()) && *p != path.as_path() {
                    return Err(Error::io(
                        "rmdir",
                        path.as_path(),
                        std::io::Error::new(std::io::ErrorKind::Other, "directory not empty"),
                    ));
                }
            }
            Ok(())
        }
        OpKind::DirRemoveAll { path } => require_present(path.as_path(), pending),
        OpKind::FileMove { from, to } => {
            require_present(from.as_path(), pending)?;
            require_parent(to.as_path(), pending)?;
            require_absent(to.as_path(), pending)
        }
        OpKind::FileBackup { source, backup } => {
            require_present(source.as_path(), pending)?;
            require_absent(backup.as_path(), pending)
        }
        OpKind::FileDelete { path } => require_present(path.as_path(), pending),
        OpKind::DirCopy { from, to } => {
            require_present(from.as_path(), pending)?;
            require_absent(to.as_path(), pending)
        }
    }
}

fn apply_pending<'p>(kind: &'p OpKind, pending: &mut HashMap<&'p Utf8Path, Pending>) {
    match kind {
        OpKind::LinkCreate { target, .. } => {
            pending.insert(target.as_path(), Pending::Created(FsType::Symlink));
        }
        OpKind::LinkDelete { target } => {
            pending.insert(target.as_path(), Pending::Removed);
        }
        OpKind::DirCreate { path } => {
            pending.insert(path.as_path(), Pending::Created(FsType::Dir));
        }
        OpKind::DirDelete { path } | OpKind::DirRemoveAll { path } => {
            pending.insert(path.as_path(), Pending::Removed);
        }
        OpKind::FileMove { from, to } => {
            pending.insert(from.as_path(), Pending::Removed);
            pending.insert(to.as_path(), Pending::Created(FsType::File));
        }
        OpKind::FileBackup { backup, .. } => {
            pending.insert(backup.as_path(), Pending::Created(FsType::File));
        }
        OpKind::FileDelete { path } => {
            pending.insert(path.as_path(), Pending::Removed);
        }
        OpKind::DirCopy { to, .. } => {
            pending.insert(to.as_path(), Pending::Created(FsType::Dir));
        }
    }
}
