//! Package tree scanning.
//!
//! A package is an immediate subdirectory of the package directory. The
//! scanner walks one package, applies the layered ignore rules and emits a
//! logical tree whose leaves are the files that will be linked into the
//! target. Name translation between `dot-` components and hidden `.`
//! components happens when mapping into the target, not on disk.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use colored::Colorize;
use dialoguer::Confirm;
use tracing::{debug, warn};

use crate::context::ScanConfig;
use crate::error::{Error, Result};
use crate::fs_utils::{entry_type, FsType};
use crate::ignore::{self, IgnoreSet};
use crate::paths::{FilePath, PackagePath};

/// Component prefix exposed as a hidden name inside the target.
pub const DOT_PREFIX: &str = "dot-";

/// Names the tool reserves for its own bookkeeping; never valid packages.
pub const RESERVED_NAMES: &[&str] = &[
    ".dot-manifest",
    ".dot-manifest.json",
    ".dot-backup",
    ".dotignore",
    ".dotbootstrap.yaml",
    ".git",
];

/// Translate one path component for the target side: `dot-x` becomes `.x`.
/// Already-hidden components pass through untouched, so translation is
/// idempotent.
pub fn translate_component(name: &str) -> String {
    match name.strip_prefix(DOT_PREFIX) {
        Some(suffix) if !suffix.is_empty() => format!(".{suffix}"),
        _ => name.to_string(),
    }
}

/// Reverse translation used during adoption: `.x` becomes `dot-x`.
pub fn untranslate_component(name: &str) -> String {
    match name.strip_prefix('.') {
        Some(suffix) if !suffix.is_empty() => format!("{DOT_PREFIX}{suffix}"),
        _ => name.to_string(),
    }
}

/// Translate every component of a relative path.
pub fn translate_rel_path(rel: &Utf8Path) -> Utf8PathBuf {
    rel.components()
        .map(|c| translate_component(c.as_str()))
        .collect()
}

pub fn is_reserved_name(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// A self-contained collection of configuration files, re-scanned every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    pub root: PackagePath,
}

impl Package {
    pub fn new(name: impl Into<String>, package_dir: &FilePath) -> Result<Self> {
        let name = name.into();
        if is_reserved_name(&name) {
            return Err(Error::ReservedPackageName { name });
        }
        let root = PackagePath::new(package_dir.as_path().join(&name))?;
        Ok(Self { name, root })
    }

    /// The package's name as it appears in the target when name mapping is
    /// enabled (`dot-gnupg` installs under `.gnupg`).
    pub fn target_name(&self) -> String {
        translate_component(&self.name)
    }
}

/// List the packages under a package directory, skipping reserved names and
/// non-directories. Returned sorted by name.
pub fn discover_packages(package_dir: &FilePath) -> Result<Vec<Package>> {
    let entries = fs::read_dir(package_dir.as_path())
        .map_err(|e| Error::io("readdir", package_dir.as_path(), e))?;

    let mut packages = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io("readdir", package_dir.as_path(), e))?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            warn!(path = %entry.path().display(), "skipping non-UTF-8 entry");
            continue;
        };
        if is_reserved_name(&name) {
            debug!(%name, "skipping reserved name during discovery");
            continue;
        }
        let path = package_dir.as_path().join(&name);
        if entry_type(&path) != Some(FsType::Dir) {
            continue;
        }
        packages.push(Package {
            name,
            root: PackagePath::new(path)?,
        });
    }
    packages.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(packages)
}

/// A scanned tree node. Dir nodes carry children ordered by name;
/// File and Symlink nodes are leaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub path: PackagePath,
    pub kind: NodeKind,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
    Symlink,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        !matches!(self.kind, NodeKind::Dir)
    }

    /// Depth-first leaves in traversal order.
    pub fn leaves(&self) -> Vec<&Node> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Node>) {
        if self.is_leaf() {
            out.push(self);
        } else {
            for child in &self.children {
                child.collect_leaves(out);
            }
        }
    }
}

/// One package's scan result.
#[derive(Debug, Clone)]
pub struct PackageTree {
    pub package: Package,
    pub root: Node,
    pub warnings: Vec<String>,
}

/// Walks a package tree, applying ignore rules and size limits.
pub struct Scanner<'a> {
    config: &'a ScanConfig,
}

impl<'a> Scanner<'a> {
    pub fn new(config: &'a ScanConfig) -> Self {
        Self { config }
    }

    /// Produce the logical tree for one package.
    pub fn scan_package(&self, package: &Package) -> Result<PackageTree> {
        match entry_type(package.root.as_path()) {
            Some(FsType::Dir) => {}
            Some(_) | None => {
                return Err(Error::SourceNotFound {
                    path: package.root.as_path().to_owned(),
                })
            }
        }

        let mut ignores = IgnoreSet::from_patterns(&self.config.default_ignores);
        ignores.extend(&self.config.extra_ignores);
        if self.config.per_package_ignore {
            ignores.extend(ignore::load_dotignore(&package.root)?);
        }

        let mut warnings = Vec::new();
        let children =
            self.scan_dir(&package.root, &package.root, &ignores, &mut warnings)?;
        debug!(package = %package.name, leaves = children.iter().map(|c| c.leaves().len()).sum::<usize>(), "scanned package");

        Ok(PackageTree {
            package: package.clone(),
            root: Node {
                path: package.root.clone(),
                kind: NodeKind::Dir,
                children,
            },
            warnings,
        })
    }

    fn scan_dir(
        &self,
        dir: &PackagePath,
        package_root: &PackagePath,
        ignores: &IgnoreSet,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<Node>> {
        let entries =
            fs::read_dir(dir.as_path()).map_err(|e| Error::io("readdir", dir.as_path(), e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("readdir", dir.as_path(), e))?;
            match entry.file_name().to_str() {
                Some(name) => names.push(name.to_string()),
                None => warn!(path = %entry.path().display(), "skipping non-UTF-8 entry"),
            }
        }
        names.sort();

        let mut nodes = Vec::new();
        for name in names {
            let path = dir.join(&name);
            let rel = path
                .strip_prefix(package_root)
                .expect("scanned path is under its package root");

            // An ignored directory prunes its whole subtree.
            if ignores.is_ignored(rel) {
                debug!(path = %rel, "ignored");
                continue;
            }

            match entry_type(path.as_path()) {
                Some(FsType::Dir) => {
                    let children = self.scan_dir(&path, package_root, ignores, warnings)?;
                    nodes.push(Node {
                        path,
                        kind: NodeKind::Dir,
                        children,
                    });
                }
                Some(FsType::Symlink) => nodes.push(Node {
                    path,
                    kind: NodeKind::Symlink,
                    children: Vec::new(),
                }),
                Some(FsType::File) => {
                    if !self.admit_file(&path, rel, warnings)? {
                        continue;
                    }
                    nodes.push(Node {
                        path,
                        kind: NodeKind::File,
                        children: Vec::new(),
                    });
                }
                None => {}
            }
        }
        Ok(nodes)
    }

    /// Apply the large-file rule: prompt in interactive mode, otherwise
    /// skip with a warning.
    fn admit_file(
        &self,
        path: &PackagePath,
        rel: &Utf8Path,
        warnings: &mut Vec<String>,
    ) -> Result<bool> {
        if self.config.max_file_size == 0 {
            return Ok(true);
        }
        let metadata = fs::symlink_metadata(path.as_path())
            .map_err(|e| Error::io("stat", path.as_path(), e))?;
        if metadata.len() <= self.config.max_file_size {
            return Ok(true);
        }

        if self.config.interactive_large_files {
            let include = Confirm::new()
                .with_prompt(format!(
                    "{} is {} bytes, include it?",
                    rel.to_string().bold(),
                    metadata.len()
                ))
                .default(false)
                .interact()
                .unwrap_or(false);
            if include {
                return Ok(true);
            }
        }
        warnings.push(format!(
            "skipped {rel}: {} bytes exceeds the {} byte limit",
            metadata.len(),
            self.config.max_file_size
        ));
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    fn setup() -> (TempDir, FilePath) {
        let dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, FilePath::new(root).unwrap())
    }

    fn utf8(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    #[test]
    fn test_translate_component() {
        assert_eq!(translate_component("dot-vimrc"), ".vimrc");
        assert_eq!(translate_component("config"), "config");
        // Idempotent: already-hidden components are not re-prefixed.
        assert_eq!(translate_component(".vimrc"), ".vimrc");
        // A bare prefix is not a translation candidate.
        assert_eq!(translate_component("dot-"), "dot-");
    }

    #[test]
    fn test_untranslate_component() {
        assert_eq!(untranslate_component(".ssh"), "dot-ssh");
        assert_eq!(untranslate_component("config"), "config");
        assert_eq!(untranslate_component("."), ".");
    }

    #[test]
    fn test_translate_rel_path_per_component() {
        assert_eq!(
            translate_rel_path(Utf8Path::new("dot-config/nvim/init.lua")),
            Utf8PathBuf::from(".config/nvim/init.lua")
        );
        // Nested dot- prefixes translate independently per component.
        assert_eq!(
            translate_rel_path(Utf8Path::new("dot-a/dot-b")),
            Utf8PathBuf::from(".a/.b")
        );
    }

    #[test]
    fn test_reserved_package_name_refused() {
        let (_guard, pkg_dir) = setup();
        let err = Package::new(".dot-backup", &pkg_dir).unwrap_err();
        assert!(matches!(err, Error::ReservedPackageName { .. }));
    }

    #[test]
    fn test_discover_packages_skips_reserved_and_files() {
        let (guard, pkg_dir) = setup();
        let root = utf8(&guard);
        fs::create_dir(root.join("vim")).unwrap();
        fs::create_dir(root.join("zsh")).unwrap();
        fs::create_dir(root.join(".git")).unwrap();
        fs::create_dir(root.join(".dot-backup")).unwrap();
        fs::write(root.join("stray-file"), "x").unwrap();

        let packages = discover_packages(&pkg_dir).unwrap();
        let names: Vec<_> = packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["vim", "zsh"]);
    }

    #[test]
    fn test_scan_missing_package_fails() {
        let (_guard, pkg_dir) = setup();
        let package = Package::new("ghost", &pkg_dir).unwrap();
        let err = Scanner::new(&ScanConfig::default())
            .scan_package(&package)
            .unwrap_err();
        assert!(matches!(err, Error::SourceNotFound { .. }));
    }

    #[test]
    fn test_scan_emits_ordered_tree() {
        let (guard, pkg_dir) = setup();
        let root = utf8(&guard);
        fs::create_dir_all(root.join("vim/dot-config/nvim")).unwrap();
        fs::write(root.join("vim/dot-vimrc"), "set nocompatible").unwrap();
        fs::write(root.join("vim/dot-config/nvim/init.lua"), "-- init").unwrap();
        fs::write(root.join("vim/README.md"), "docs").unwrap();

        let package = Package::new("vim", &pkg_dir).unwrap();
        let tree = Scanner::new(&ScanConfig::default())
            .scan_package(&package)
            .unwrap();

        let leaves: Vec<_> = tree
            .root
            .leaves()
            .iter()
            .map(|n| n.path.strip_prefix(&package.root).unwrap().to_string())
            .collect();
        // README.md is ignored by the defaults; children come back sorted.
        assert_eq!(leaves, vec!["dot-config/nvim/init.lua", "dot-vimrc"]);
    }

    #[test]
    fn test_scan_prunes_ignored_directory() {
        let (guard, pkg_dir) = setup();
        let root = utf8(&guard);
        fs::create_dir_all(root.join("app/cache/deep")).unwrap();
        fs::write(root.join("app/cache/deep/blob"), "x").unwrap();
        fs::write(root.join("app/dot-apprc"), "x").unwrap();
        fs::write(root.join("app/.dotignore"), "cache\n").unwrap();

        let package = Package::new("app", &pkg_dir).unwrap();
        let tree = Scanner::new(&ScanConfig::default())
            .scan_package(&package)
            .unwrap();

        assert_eq!(tree.root.leaves().len(), 1);
        assert_eq!(tree.root.leaves()[0].path.file_name(), Some("dot-apprc"));
    }

    #[test]
    fn test_scan_skips_oversize_file_with_warning() {
        let (guard, pkg_dir) = setup();
        let root = utf8(&guard);
        fs::create_dir(root.join("media")).unwrap();
        fs::write(root.join("media/huge.bin"), vec![0u8; 64]).unwrap();
        fs::write(root.join("media/small.txt"), "ok").unwrap();

        let config = ScanConfig {
            max_file_size: 16,
            ..ScanConfig::default()
        };
        let package = Package::new("media", &pkg_dir).unwrap();
        let tree = Scanner::new(&config).scan_package(&package).unwrap();

        assert_eq!(tree.root.leaves().len(), 1);
        assert_eq!(tree.warnings.len(), 1);
        assert!(tree.warnings[0].contains("huge.bin"));
    }

    #[test]
    fn test_scan_empty_package() {
        let (guard, pkg_dir) = setup();
        fs::create_dir(utf8(&guard).join("empty")).unwrap();
        let package = Package::new("empty", &pkg_dir).unwrap();
        let tree = Scanner::new(&ScanConfig::default())
            .scan_package(&package)
            .unwrap();
        assert!(tree.root.leaves().is_empty());
    }
}
