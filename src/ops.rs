//! Filesystem operations.
//!
//! A plan is a totally ordered list of these. Each variant knows how to
//! execute itself and how to undo itself from a checkpoint captured before
//! commit. Operations are a tagged sum rather than a trait hierarchy so the
//! planner and executor can match on them directly.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{Error, Result};
use crate::fs_utils;
use crate::paths::{FilePath, TargetPath};

pub type OperationId = u64;

/// Files up to this size are checkpointed in memory; larger ones are
/// stashed in a temp file instead.
pub const SMALL_FILE_LIMIT: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    LinkCreate { source: FilePath, target: TargetPath },
    LinkDelete { target: TargetPath },
    DirCreate { path: FilePath },
    /// Remove a directory that must already be empty.
    DirDelete { path: FilePath },
    DirRemoveAll { path: FilePath },
    FileMove { from: TargetPath, to: FilePath },
    FileBackup { source: FilePath, backup: FilePath },
    FileDelete { path: FilePath },
    DirCopy { from: FilePath, to: FilePath },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OpKind,
}

/// Undo information captured before commit.
///
/// `DirStash` and `FileStash` hold handles to temp storage; dropping the
/// checkpoint releases them.
#[derive(Debug)]
pub enum Checkpoint {
    /// The operation creates something; undo is removal.
    None,
    /// Prior symlink destination, for `LinkDelete`.
    SymlinkDest { dest: Utf8PathBuf },
    /// Prior bytes and mode of a small file, for `FileDelete`.
    FileContent { bytes: Vec<u8>, mode: u32 },
    /// A large file moved aside before deletion.
    FileStash { stash: tempfile::TempPath, mode: u32 },
    /// A directory tree copied aside before `DirRemoveAll`.
    DirStash { stash: tempfile::TempDir },
}

impl Operation {
    pub fn new(id: OperationId, kind: OpKind) -> Self {
        Self { id, kind }
    }

    /// The path this operation is "about", for display and grouping.
    pub fn primary_path(&self) -> &Utf8Path {
        match &self.kind {
            OpKind::LinkCreate { target, .. } => target.as_path(),
            OpKind::LinkDelete { target } => target.as_path(),
            OpKind::DirCreate { path }
            | OpKind::DirDelete { path }
            | OpKind::DirRemoveAll { path }
            | OpKind::FileDelete { path } => path.as_path(),
            OpKind::FileMove { from, .. } => from.as_path(),
            OpKind::FileBackup { source, .. } => source.as_path(),
            OpKind::DirCopy { from, .. } => from.as_path(),
        }
    }

    /// Capture the undo information for this operation. Must run before the
    /// operation (or any operation that touches the same path) executes.
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        match &self.kind {
            OpKind::LinkDelete { target } => {
                let dest = fs_utils::read_link_raw(target.as_path()).ok_or_else(|| {
                    Error::io(
                        "readlink",
                        target.as_path(),
                        std::io::Error::new(std::io::ErrorKind::NotFound, "not a symlink"),
                    )
                })?;
                Ok(Checkpoint::SymlinkDest { dest })
            }
            OpKind::FileDelete { path } => {
                let metadata = fs::symlink_metadata(path.as_path())
                    .map_err(|e| Error::io("stat", path.as_path(), e))?;
                let mode = fs_utils::mode_bits(path.as_path());
                if metadata.is_symlink() {
                    // A symlink occupying a file slot: remember its dest.
                    let dest = fs_utils::read_link_raw(path.as_path()).unwrap_or_default();
                    return Ok(Checkpoint::SymlinkDest { dest });
                }
                if metadata.len() <= SMALL_FILE_LIMIT {
                    let bytes = fs::read(path.as_path())
                        .map_err(|e| Error::io("read", path.as_path(), e))?;
                    Ok(Checkpoint::FileContent { bytes, mode })
                } else {
                    let stash = tempfile::NamedTempFile::new()
                        .map_err(|e| Error::io("mkstemp", path.as_path(), e))?;
                    let stash_path = stash.into_temp_path();
                    fs::copy(path.as_path(), &stash_path)
                        .map_err(|e| Error::io("copy", path.as_path(), e))?;
                    Ok(Checkpoint::FileStash {
                        stash: stash_path,
                        mode,
                    })
                }
            }
            OpKind::DirRemoveAll { path } => {
                let stash = tempfile::TempDir::new()
                    .map_err(|e| Error::io("mkdtemp", path.as_path(), e))?;
                let stash_root = Utf8PathBuf::from_path_buf(stash.path().join("snapshot"))
                    .map_err(|_| Error::InvalidPath {
                        path: path.as_path().to_owned(),
                        reason: "temp dir is not valid UTF-8".to_string(),
                    })?;
                fs_utils::copy_dir_all(path.as_path(), &stash_root)?;
                Ok(Checkpoint::DirStash { stash })
            }
            _ => Ok(Checkpoint::None),
        }
    }

    /// Apply the operation to the filesystem.
    pub fn execute(&self) -> Result<()> {
        match &self.kind {
            OpKind::LinkCreate { source, target } => {
                fs_utils::symlink(source.as_path(), target.as_path())
            }
            OpKind::LinkDelete { target } => fs::remove_file(target.as_path())
                .map_err(|e| Error::io("unlink", target.as_path(), e)),
            OpKind::DirCreate { path } => {
                fs::create_dir(path.as_path()).map_err(|e| Error::io("mkdir", path.as_path(), e))
            }
            OpKind::DirDelete { path } => {
                fs::remove_dir(path.as_path()).map_err(|e| Error::io("rmdir", path.as_path(), e))
            }
            OpKind::DirRemoveAll { path } => fs::remove_dir_all(path.as_path())
                .map_err(|e| Error::io("rmtree", path.as_path(), e)),
            OpKind::FileMove { from, to } => fs_utils::move_file(from.as_path(), to.as_path()),
            OpKind::FileBackup { source, backup } => {
                if let Some(parent) = backup.parent() {
                    fs::create_dir_all(parent.as_path())
                        .map_err(|e| Error::io("mkdir", parent.as_path(), e))?;
                }
                fs::copy(source.as_path(), backup.as_path())
                    .map_err(|e| Error::io("copy", backup.as_path(), e))?;
                fs_utils::set_mode_bits(backup.as_path(), fs_utils::mode_bits(source.as_path()))
            }
            OpKind::FileDelete { path } => fs::remove_file(path.as_path())
                .map_err(|e| Error::io("unlink", path.as_path(), e)),
            OpKind::DirCopy { from, to } => fs_utils::copy_dir_all(from.as_path(), to.as_path()),
        }
    }

    /// Undo the operation using its checkpoint.
    pub fn rollback(&self, checkpoint: &Checkpoint) -> Result<()> {
        match (&self.kind, checkpoint) {
            (OpKind::LinkCreate { target, .. }, _) => {
                match fs::symlink_metadata(target.as_path()) {
                    Ok(m) if m.is_symlink() => fs::remove_file(target.as_path())
                        .map_err(|e| Error::io("unlink", target.as_path(), e)),
                    _ => Ok(()),
                }
            }
            (OpKind::LinkDelete { target }, Checkpoint::SymlinkDest { dest }) => {
                fs_utils::symlink(dest, target.as_path())
            }
            (OpKind::DirCreate { path }, _) => match fs::remove_dir(path.as_path()) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::io("rmdir", path.as_path(), e)),
            },
            (OpKind::DirDelete { path }, _) => {
                fs::create_dir(path.as_path()).map_err(|e| Error::io("mkdir", path.as_path(), e))
            }
            (OpKind::DirRemoveAll { path }, Checkpoint::DirStash { stash }) => {
                let snapshot = stash.path().join("snapshot");
                let snapshot =
                    Utf8PathBuf::from_path_buf(snapshot).map_err(|_| Error::InvalidPath {
                        path: path.as_path().to_owned(),
                        reason: "temp dir is not valid UTF-8".to_string(),
                    })?;
                fs_utils::copy_dir_all(&snapshot, path.as_path())
            }
            (OpKind::FileMove { from, to }, _) => {
                fs_utils::move_file(to.as_path(), from.as_path())
            }
            (OpKind::FileBackup { backup, .. }, _) => match fs::remove_file(backup.as_path()) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::io("unlink", backup.as_path(), e)),
            },
            (OpKind::FileDelete { path }, Checkpoint::FileContent { bytes, mode }) => {
                fs::write(path.as_path(), bytes).map_err(|e| Error::io("write", path.as_path(), e))?;
                fs_utils::set_mode_bits(path.as_path(), *mode)
            }
            (OpKind::FileDelete { path }, Checkpoint::FileStash { stash, mode }) => {
                fs::copy(stash, path.as_path())
                    .map_err(|e| Error::io("copy", path.as_path(), e))?;
                fs_utils::set_mode_bits(path.as_path(), *mode)
            }
            (OpKind::FileDelete { path }, Checkpoint::SymlinkDest { dest }) => {
                fs_utils::symlink(dest, path.as_path())
            }
            (OpKind::DirCopy { to, .. }, _) => match fs::remove_dir_all(to.as_path()) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::io("rmtree", to.as_path(), e)),
            },
            (_, _) => Err(Error::CheckpointNotFound { id: self.id }),
        }
    }

    /// One-line rendering for plan previews.
    pub fn describe(&self) -> String {
        match &self.kind {
            OpKind::LinkCreate { source, target } => format!("link {target} -> {source}"),
            OpKind::LinkDelete { target } => format!("unlink {target}"),
            OpKind::DirCreate { path } => format!("mkdir {path}"),
            OpKind::DirDelete { path } => format!("rmdir {path}"),
            OpKind::DirRemoveAll { path } => format!("remove tree {path}"),
            OpKind::FileMove { from, to } => format!("move {from} -> {to}"),
            OpKind::FileBackup { source, backup } => format!("backup {source} -> {backup}"),
            OpKind::FileDelete { path } => format!("delete {path}"),
            OpKind::DirCopy { from, to } => format!("copy {from} -> {to}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn utf8_temp() -> (TempDir, Utf8PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    fn file(path: &Utf8Path) -> FilePath {
        FilePath::new(path.to_owned()).unwrap()
    }

    fn target(path: &Utf8Path) -> TargetPath {
        TargetPath::new(path.to_owned()).unwrap()
    }

    #[test]
    fn test_link_create_execute_and_rollback() {
        let (_guard, root) = utf8_temp();
        fs::write(root.join("src"), "x").unwrap();

        let op = Operation::new(
            1,
            OpKind::LinkCreate {
                source: file(&root.join("src")),
                target: target(&root.join("link")),
            },
        );
        let cp = op.checkpoint().unwrap();
        op.execute().unwrap();
        assert_eq!(
            fs_utils::read_link_raw(&root.join("link")).unwrap(),
            root.join("src")
        );

        op.rollback(&cp).unwrap();
        assert!(fs::symlink_metadata(root.join("link")).is_err());
    }

    #[test]
    fn test_link_delete_rollback_restores_dest() {
        let (_guard, root) = utf8_temp();
        fs::write(root.join("src"), "x").unwrap();
        fs_utils::symlink(&root.join("src"), &root.join("link")).unwrap();

        let op = Operation::new(1, OpKind::LinkDelete {
            target: target(&root.join("link")),
        });
        let cp = op.checkpoint().unwrap();
        op.execute().unwrap();
        assert!(fs::symlink_metadata(root.join("link")).is_err());

        op.rollback(&cp).unwrap();
        assert_eq!(
            fs_utils::read_link_raw(&root.join("link")).unwrap(),
            root.join("src")
        );
    }

    #[test]
    fn test_file_delete_rollback_restores_bytes() {
        let (_guard, root) = utf8_temp();
        fs::write(root.join("victim"), "precious").unwrap();

        let op = Operation::new(1, OpKind::FileDelete {
            path: file(&root.join("victim")),
        });
        let cp = op.checkpoint().unwrap();
        assert!(matches!(cp, Checkpoint::FileContent { .. }));
        op.execute().unwrap();
        assert!(!root.join("victim").exists());

        op.rollback(&cp).unwrap();
        assert_eq!(fs::read_to_string(root.join("victim")).unwrap(), "precious");
    }

    #[test]
    fn test_dir_remove_all_rollback_restores_tree() {
        let (_guard, root) = utf8_temp();
        fs::create_dir_all(root.join("tree/sub")).unwrap();
        fs::write(root.join("tree/sub/file"), "deep").unwrap();

        let op = Operation::new(1, OpKind::DirRemoveAll {
            path: file(&root.join("tree")),
        });
        let cp = op.checkpoint().unwrap();
        op.execute().unwrap();
        assert!(!root.join("tree").exists());

        op.rollback(&cp).unwrap();
        assert_eq!(
            fs::read_to_string(root.join("tree/sub/file")).unwrap(),
            "deep"
        );
    }

    #[test]
    fn test_file_move_rollback_moves_back() {
        let (_guard, root) = utf8_temp();
        fs::write(root.join("a"), "payload").unwrap();

        let op = Operation::new(1, OpKind::FileMove {
            from: target(&root.join("a")),
            to: file(&root.join("b")),
        });
        let cp = op.checkpoint().unwrap();
        op.execute().unwrap();
        assert!(!root.join("a").exists());

        op.rollback(&cp).unwrap();
        assert_eq!(fs::read_to_string(root.join("a")).unwrap(), "payload");
        assert!(!root.join("b").exists());
    }

    #[test]
    fn test_backup_creates_parents_and_preserves_content() {
        let (_guard, root) = utf8_temp();
        fs::write(root.join("orig"), "old").unwrap();

        let op = Operation::new(1, OpKind::FileBackup {
            source: file(&root.join("orig")),
            backup: file(&root.join("backups/2024/orig")),
        });
        op.execute().unwrap();
        assert_eq!(
            fs::read_to_string(root.join("backups/2024/orig")).unwrap(),
            "old"
        );
        // Source is untouched; the following delete is a separate operation.
        assert!(root.join("orig").exists());

        op.rollback(&Checkpoint::None).unwrap();
        assert!(!root.join("backups/2024/orig").exists());
    }

    #[test]
    fn test_dir_delete_requires_empty() {
        let (_guard, root) = utf8_temp();
        fs::create_dir(root.join("full")).unwrap();
        fs::write(root.join("full/file"), "x").unwrap();

        let op = Operation::new(1, OpKind::DirDelete {
            path: file(&root.join("full")),
        });
        assert!(op.execute().is_err());
    }

    #[test]
    fn test_missing_checkpoint_reported() {
        let (_guard, root) = utf8_temp();
        let op = Operation::new(7, OpKind::FileDelete {
            path: file(&root.join("x")),
        });
        let err = op.rollback(&Checkpoint::None).unwrap_err();
        assert!(matches!(err, Error::CheckpointNotFound { id: 7 }));
    }
}
