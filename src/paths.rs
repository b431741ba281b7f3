//! Phantom-typed absolute paths.
//!
//! Three path kinds exist: paths inside the package directory, paths inside
//! the target directory, and generic absolute paths used for moves, backups
//! and copies. Mixing kinds is a type error; the only way to cross kinds is
//! an explicit `as_file` conversion.

use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::error::{Error, Result};

pub trait PathKind {
    const LABEL: &'static str;
}

#[derive(Debug)]
pub enum PackageKind {}
#[derive(Debug)]
pub enum TargetKind {}
#[derive(Debug)]
pub enum FileKind {}

impl PathKind for PackageKind {
    const LABEL: &'static str = "package";
}
impl PathKind for TargetKind {
    const LABEL: &'static str = "target";
}
impl PathKind for FileKind {
    const LABEL: &'static str = "file";
}

/// A path inside the package directory.
pub type PackagePath = TypedPath<PackageKind>;
/// A path inside the target directory.
pub type TargetPath = TypedPath<TargetKind>;
/// A generic absolute path (move/backup/copy operands).
pub type FilePath = TypedPath<FileKind>;

/// An absolute, cleaned UTF-8 path tagged with a zero-size kind marker.
pub struct TypedPath<K: PathKind> {
    inner: Utf8PathBuf,
    _kind: PhantomData<fn() -> K>,
}

fn validate(path: &Utf8Path, label: &'static str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidPath {
        path: path.to_owned(),
        reason: format!("{label} path {reason}"),
    };

    if !path.is_absolute() {
        return Err(invalid("must be absolute"));
    }
    let raw = path.as_str();
    if raw.len() > 1 && raw.ends_with('/') {
        return Err(invalid("has a trailing separator"));
    }
    if raw.contains("//") {
        return Err(invalid("has a doubled separator"));
    }
    for component in path.components() {
        match component {
            Utf8Component::CurDir => return Err(invalid("contains a '.' component")),
            Utf8Component::ParentDir => return Err(invalid("contains a '..' component")),
            _ => {}
        }
    }
    Ok(())
}

impl<K: PathKind> TypedPath<K> {
    /// The validating factory: requires an absolute, cleaned path.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Result<Self> {
        let inner = path.into();
        validate(&inner, K::LABEL)?;
        Ok(Self {
            inner,
            _kind: PhantomData,
        })
    }

    pub fn as_path(&self) -> &Utf8Path {
        &self.inner
    }

    pub fn as_str(&self) -> &str {
        self.inner.as_str()
    }

    pub fn into_inner(self) -> Utf8PathBuf {
        self.inner
    }

    /// Join a clean relative fragment, preserving the kind.
    ///
    /// Callers pass plain file or directory names produced by the scanner;
    /// the result stays clean by construction.
    pub fn join(&self, rel: impl AsRef<Utf8Path>) -> Self {
        Self {
            inner: self.inner.join(rel),
            _kind: PhantomData,
        }
    }

    pub fn parent(&self) -> Option<Self> {
        self.inner.parent().map(|p| Self {
            inner: p.to_owned(),
            _kind: PhantomData,
        })
    }

    pub fn file_name(&self) -> Option<&str> {
        self.inner.file_name()
    }

    pub fn starts_with(&self, base: &Self) -> bool {
        self.inner.starts_with(&base.inner)
    }

    pub fn strip_prefix(&self, base: &Self) -> Option<&Utf8Path> {
        self.inner.strip_prefix(&base.inner).ok()
    }

    /// Cross into the generic kind for use as a move/backup/copy operand.
    pub fn as_file(&self) -> FilePath {
        FilePath {
            inner: self.inner.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: PathKind> Clone for TypedPath<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: PathKind> PartialEq for TypedPath<K> {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl<K: PathKind> Eq for TypedPath<K> {}

impl<K: PathKind> PartialOrd for TypedPath<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: PathKind> Ord for TypedPath<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.inner.cmp(&other.inner)
    }
}

impl<K: PathKind> Hash for TypedPath<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.hash(state);
    }
}

impl<K: PathKind> std::fmt::Debug for TypedPath<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", K::LABEL, self.inner)
    }
}

impl<K: PathKind> std::fmt::Display for TypedPath<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl<K: PathKind> AsRef<Utf8Path> for TypedPath<K> {
    fn as_ref(&self) -> &Utf8Path {
        &self.inner
    }
}

impl<K: PathKind> AsRef<std::path::Path> for TypedPath<K> {
    fn as_ref(&self) -> &std::path::Path {
        self.inner.as_std_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_relative_paths() {
        assert!(matches!(
            PackagePath::new("vim/dot-vimrc"),
            Err(Error::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_rejects_unclean_paths() {
        assert!(PackagePath::new("/p/./vim").is_err());
        assert!(PackagePath::new("/p/../vim").is_err());
        assert!(PackagePath::new("/p//vim").is_err());
        assert!(PackagePath::new("/p/vim/").is_err());
    }

    #[test]
    fn test_accepts_clean_absolute_paths() {
        let path = TargetPath::new("/home/user/.vimrc").unwrap();
        assert_eq!(path.as_str(), "/home/user/.vimrc");
        assert_eq!(TargetPath::new("/").unwrap().as_str(), "/");
    }

    #[test]
    fn test_join_and_parent_preserve_kind() {
        let root = PackagePath::new("/p/vim").unwrap();
        let child = root.join("dot-vimrc");
        assert_eq!(child.as_str(), "/p/vim/dot-vimrc");
        assert_eq!(child.parent().unwrap(), root);
        assert!(child.starts_with(&root));
        assert_eq!(child.strip_prefix(&root).unwrap(), "dot-vimrc");
    }

    #[test]
    fn test_equality_is_string_equality() {
        let a = FilePath::new("/t/.vimrc").unwrap();
        let b = FilePath::new("/t/.vimrc").unwrap();
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_as_file_crosses_kinds() {
        let target = TargetPath::new("/t/.vimrc").unwrap();
        let generic: FilePath = target.as_file();
        assert_eq!(generic.as_str(), "/t/.vimrc");
    }
}
