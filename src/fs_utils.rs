use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Filesystem type detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    File,
    Dir,
    Symlink,
}

/// Get filesystem type for a given path without following symlinks.
/// Returns None if the path does not exist.
pub fn entry_type(path: &Utf8Path) -> Option<FsType> {
    match fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.is_symlink() {
                Some(FsType::Symlink)
            } else if metadata.is_dir() {
                Some(FsType::Dir)
            } else {
                Some(FsType::File)
            }
        }
        Err(_) => None,
    }
}

/// Read a symlink's stored destination without resolving it.
/// Returns None if the path is not a symlink.
pub fn read_link_raw(path: &Utf8Path) -> Option<Utf8PathBuf> {
    fs::read_link(path)
        .ok()
        .and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
}

/// Check if path is a symlink whose destination no longer exists.
pub fn is_broken_symlink(path: &Utf8Path) -> bool {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_symlink() => match fs::read_link(path) {
            Ok(dest) => {
                let resolved = if dest.is_absolute() {
                    dest
                } else {
                    path.parent()
                        .map(|p| p.as_std_path().join(&dest))
                        .unwrap_or(dest)
                };
                fs::symlink_metadata(resolved).is_err()
            }
            Err(_) => true,
        },
        _ => false,
    }
}

/// Create a symlink at `link` pointing at `dest`.
pub fn symlink(dest: &Utf8Path, link: &Utf8Path) -> Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(dest, link).map_err(|e| Error::io("symlink", link, e))
    }
    #[cfg(windows)]
    {
        if dest.is_dir() {
            std::os::windows::fs::symlink_dir(dest, link)
                .map_err(|e| Error::io("symlink", link, e))
        } else {
            std::os::windows::fs::symlink_file(dest, link)
                .map_err(|e| Error::io("symlink", link, e))
        }
    }
}

/// Unix mode bits for a path, 0 where the platform has none.
pub fn mode_bits(path: &Utf8Path) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::symlink_metadata(path)
            .map(|m| m.permissions().mode())
            .unwrap_or(0)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        0
    }
}

/// Apply mode bits where the platform supports them.
pub fn set_mode_bits(path: &Utf8Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if mode != 0 {
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .map_err(|e| Error::io("chmod", path, e))?;
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
        Ok(())
    }
}

/// Move a file by rename, falling back to copy-then-delete across devices.
/// The copy is fsynced before the source is removed.
pub fn move_file(from: &Utf8Path, to: &Utf8Path) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ) =>
        {
            Err(Error::io("rename", from, e))
        }
        Err(_) => {
            fs::copy(from, to).map_err(|e| Error::io("copy", to, e))?;
            let copied = fs::File::open(to).map_err(|e| Error::io("open", to, e))?;
            copied.sync_all().map_err(|e| Error::io("fsync", to, e))?;
            fs::remove_file(from).map_err(|e| Error::io("unlink", from, e))
        }
    }
}

/// Recursively copy a directory, preserving mode bits and recreating
/// symlinks as symlinks.
pub fn copy_dir_all(from: &Utf8Path, to: &Utf8Path) -> Result<()> {
    fs::create_dir_all(to).map_err(|e| Error::io("mkdir", to, e))?;
    set_mode_bits(to, mode_bits(from))?;
    for entry in fs::read_dir(from).map_err(|e| Error::io("readdir", from, e))? {
        let entry = entry.map_err(|e| Error::io("readdir", from, e))?;
        let src = Utf8PathBuf::from_path_buf(entry.path()).map_err(|p| Error::InvalidPath {
            path: Utf8PathBuf::from(p.to_string_lossy().to_string()),
            reason: "not valid UTF-8".to_string(),
        })?;
        let dst = to.join(src.file_name().unwrap_or_default());
        match entry_type(&src) {
            Some(FsType::Dir) => copy_dir_all(&src, &dst)?,
            Some(FsType::Symlink) => {
                if let Some(dest) = read_link_raw(&src) {
                    symlink(&dest, &dst)?;
                }
            }
            Some(FsType::File) => {
                fs::copy(&src, &dst).map_err(|e| Error::io("copy", &dst, e))?;
            }
            None => {}
        }
    }
    Ok(())
}

/// Expand a leading `~` against the home directory and make the path
/// absolute relative to the current working directory.
pub fn resolve_user_path(raw: &str) -> Result<Utf8PathBuf> {
    if raw == "~" {
        return crate::context::home_dir();
    }
    if let Some(stripped) = raw.strip_prefix("~/") {
        return Ok(crate::context::home_dir()?.join(stripped));
    }
    let path = Utf8PathBuf::from(raw);
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir().map_err(|e| Error::io("getcwd", Utf8PathBuf::from("."), e))?;
    let cwd = Utf8PathBuf::from_path_buf(cwd).map_err(|p| Error::InvalidPath {
        path: Utf8PathBuf::from(p.to_string_lossy().to_string()),
        reason: "working directory is not valid UTF-8".to_string(),
    })?;
    Ok(cwd.join(path))
}

/// SHA-256 of a byte slice, hex encoded.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-256 of a file's contents, hex encoded.
pub fn sha256_file(path: &Utf8Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| Error::io("read", path, e))?;
    Ok(sha256_bytes(&bytes))
}

/// Remove now-empty directories from `start` up to (but excluding) `stop`.
/// Stops at the first non-empty directory; failures are not errors.
pub fn prune_empty_dirs(start: &Utf8Path, stop: &Utf8Path) {
    let mut current = start.to_owned();
    while current != *stop && current.starts_with(stop) {
        if fs::remove_dir(&current).is_err() {
            break;
        }
        match current.parent() {
            Some(parent) => current = parent.to_owned(),
            None => break,
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

    #[test]
    fn test_entry_type() {
        let (_guard, root) = utf8_temp();
        fs::write(root.join("file"), "x").unwrap();
        fs::create_dir(root.join("dir")).unwrap();
        symlink(&root.join("file"), &root.join("link")).unwrap();

        assert_eq!(entry_type(&root.join("file")), Some(FsType::File));
        assert_eq!(entry_type(&root.join("dir")), Some(FsType::Dir));
        assert_eq!(entry_type(&root.join("link")), Some(FsType::Symlink));
        assert_eq!(entry_type(&root.join("missing")), None);
    }

    #[test]
    fn test_broken_symlink_detection() {
        let (_guard, root) = utf8_temp();
        fs::write(root.join("file"), "x").unwrap();
        symlink(&root.join("file"), &root.join("good")).unwrap();
        symlink(&root.join("ghost"), &root.join("bad")).unwrap();

        assert!(!is_broken_symlink(&root.join("good")));
        assert!(is_broken_symlink(&root.join("bad")));
        assert!(!is_broken_symlink(&root.join("file")));
        assert!(!is_broken_symlink(&root.join("missing")));
    }

    #[test]
    fn test_move_file_same_device() {
        let (_guard, root) = utf8_temp();
        fs::write(root.join("a"), "payload").unwrap();

        move_file(&root.join("a"), &root.join("b")).unwrap();
        assert!(!root.join("a").exists());
        assert_eq!(fs::read_to_string(root.join("b")).unwrap(), "payload");
    }

    #[test]
    fn test_move_file_missing_source() {
        let (_guard, root) = utf8_temp();
        let err = move_file(&root.join("ghost"), &root.join("b")).unwrap_err();
        assert!(matches!(
            err,
            Error::FilesystemOperation { op: "rename", .. }
        ));
    }

    #[test]
    fn test_copy_dir_all_preserves_links() {
        let (_guard, root) = utf8_temp();
        let src = root.join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested/file"), "deep").unwrap();
        symlink(&src.join("nested/file"), &src.join("alias")).unwrap();

        copy_dir_all(&src, &root.join("dst")).unwrap();
        assert_eq!(
            fs::read_to_string(root.join("dst/nested/file")).unwrap(),
            "deep"
        );
        assert_eq!(entry_type(&root.join("dst/alias")), Some(FsType::Symlink));
    }

    #[test]
    fn test_sha256_is_stable() {
        assert_eq!(
            sha256_bytes(b"x"),
            "2d711642b726b04401627ca9fbac32f5c8530fb1903cc4db02258717921a4881"
        );
    }

    #[test]
    fn test_prune_empty_dirs() {
        let (_guard, root) = utf8_temp();
        fs::create_dir_all(root.join("a/b/c")).unwrap();
        fs::write(root.join("a/keep"), "x").unwrap();

        prune_empty_dirs(&root.join("a/b/c"), &root);
        assert!(!root.join("a/b").exists());
        assert!(root.join("a").exists());
    }
}
