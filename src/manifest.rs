//! The persisted manifest.
//!
//! One JSON document per target directory records what is installed, where
//! it came from, content hashes for incremental remanage, and the doctor's
//! ignore decisions. Writes are atomic: temp file, fsync, rename. Unknown
//! top-level fields are preserved on rewrite so newer versions of the tool
//! can round-trip through older ones.

use std::collections::BTreeMap;
use std::io::Write;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};
use crate::fs_utils;
use crate::paths::TargetPath;
use crate::scanner::{NodeKind, PackageTree};

pub const MANIFEST_FILE: &str = ".dot-manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub packages: BTreeMap<String, PackageRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hashes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepositoryInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doctor: Option<DoctorState>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageRecord {
    pub name: String,
    pub installed_at: DateTime<Utc>,
    pub link_count: usize,
    /// Target paths relative to the target directory.
    pub links: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub backups: BTreeMap<String, String>,
    pub source: PackageSource,
    pub target_dir: Utf8PathBuf,
    pub package_dir: Utf8PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PackageSource {
    Managed,
    Adopted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryInfo {
    pub url: String,
    pub branch: String,
    pub cloned_at: DateTime<Utc>,
    #[serde(rename = "commitSHA")]
    pub commit_sha: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DoctorState {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ignored_links: BTreeMap<String, IgnoredLink>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignored_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IgnoredLink {
    /// The link's destination when the ignore was recorded.
    pub target: String,
    /// Hash of that destination; empty means "match on path only".
    #[serde(default)]
    pub target_hash: String,
    pub reason: String,
    pub acknowledged_at: DateTime<Utc>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            updated_at: Utc::now(),
            packages: BTreeMap::new(),
            hashes: BTreeMap::new(),
            repository: None,
            doctor: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl Manifest {
    pub fn path(target_dir: &TargetPath) -> Utf8PathBuf {
        target_dir.as_path().join(MANIFEST_FILE)
    }

    /// Load the manifest for a target directory; a missing file yields an
    /// empty manifest.
    pub fn load(target_dir: &TargetPath) -> Result<Self> {
        let path = Self::path(target_dir);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::io("read", &path, e)),
        };
        serde_json::from_str(&content).map_err(|e| Error::InvalidPath {
            path: path.clone(),
            reason: format!("manifest is not valid JSON: {e}"),
        })
    }

    /// Write atomically: sibling temp file, fsync, rename.
    pub fn save(&mut self, target_dir: &TargetPath) -> Result<()> {
        self.updated_at = Utc::now();
        let path = Self::path(target_dir);
        let json = serde_json::to_string_pretty(self).map_err(|e| Error::InvalidPath {
            path: path.clone(),
            reason: format!("manifest failed to serialize: {e}"),
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(target_dir.as_path())
            .map_err(|e| Error::io("mkstemp", &path, e))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| Error::io("write", &path, e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Error::io("fsync", &path, e))?;
        tmp.persist(&path)
            .map_err(|e| Error::io("rename", &path, e.error))?;
        debug!(%path, packages = self.packages.len(), "manifest saved");
        Ok(())
    }

    /// Express a link target relative to the target directory, the form
    /// links are recorded in.
    pub fn rel_link(target_dir: &TargetPath, link: &TargetPath) -> String {
        link.strip_prefix(target_dir)
            .map(|p| p.to_string())
            .unwrap_or_else(|| link.as_str().to_string())
    }

    /// Record a managed package installation, replacing any prior record.
    pub fn record_managed(
        &mut self,
        name: &str,
        links: Vec<String>,
        backups: BTreeMap<String, String>,
        hash: String,
        target_dir: &TargetPath,
        package_dir: Utf8PathBuf,
    ) {
        // Keep backups already on file so restore works across remanages.
        let mut merged = self
            .packages
            .get(name)
            .map(|r| r.backups.clone())
            .unwrap_or_default();
        merged.extend(backups);

        self.packages.insert(
            name.to_string(),
            PackageRecord {
                name: name.to_string(),
                installed_at: Utc::now(),
                link_count: links.len(),
                links,
                backups: merged,
                source: PackageSource::Managed,
                target_dir: target_dir.as_path().to_owned(),
                package_dir,
            },
        );
        self.hashes.insert(name.to_string(), hash);
    }

    /// Record an adopted package. Adopted packages carry no content hash.
    pub fn record_adopted(
        &mut self,
        name: &str,
        links: Vec<String>,
        target_dir: &TargetPath,
        package_dir: Utf8PathBuf,
    ) {
        self.packages.insert(
            name.to_string(),
            PackageRecord {
                name: name.to_string(),
                installed_at: Utc::now(),
                link_count: links.len(),
                links,
                backups: BTreeMap::new(),
                source: PackageSource::Adopted,
                target_dir: target_dir.as_path().to_owned(),
                package_dir,
            },
        );
        self.hashes.remove(name);
    }

    pub fn remove_package(&mut self, name: &str) -> Option<PackageRecord> {
        self.hashes.remove(name);
        self.packages.remove(name)
    }

    pub fn doctor_state(&self) -> Option<&DoctorState> {
        self.doctor.as_ref()
    }

    pub fn doctor_state_mut(&mut self) -> &mut DoctorState {
        self.doctor.get_or_insert_with(DoctorState::default)
    }
}

/// The package content hash: a SHA-256 digest over the ordered sequence of
/// `(relative path, mode, size, content hash)` for every scanned file.
/// Symlink leaves contribute their destination string instead of content.
pub fn package_content_hash(tree: &PackageTree) -> Result<String> {
    let mut leaves = tree.root.leaves();
    leaves.sort_by_key(|n| n.path.as_str());

    let mut hasher = Sha256::new();
    for leaf in leaves {
        let rel = leaf
            .path
            .strip_prefix(&tree.package.root)
            .map(|p| p.to_string())
            .unwrap_or_else(|| leaf.path.as_str().to_string());
        let mode = fs_utils::mode_bits(leaf.path.as_path());
        let (size, content_hash) = match leaf.kind {
            NodeKind::Symlink => {
                let dest = fs_utils::read_link_raw(leaf.path.as_path()).unwrap_or_default();
                (dest.as_str().len() as u64, fs_utils::sha256_bytes(dest.as_str().as_bytes()))
            }
            _ => {
                let metadata = std::fs::symlink_metadata(leaf.path.as_path())
                    .map_err(|e| Error::io("stat", leaf.path.as_path(), e))?;
                (metadata.len(), fs_utils::sha256_file(leaf.path.as_path())?)
            }
        };
        hasher.update(rel.as_bytes());
        hasher.update([0]);
        hasher.update(mode.to_le_bytes());
        hasher.update(size.to_le_bytes());
        hasher.update(content_hash.as_bytes());
        hasher.update([0]);
    }
    Ok(hex::encode(hasher.finalize()))
}
