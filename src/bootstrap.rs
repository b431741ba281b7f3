//! The optional bootstrap file.
//!
//! `<packageDir>/.dotbootstrap.yaml` names the packages a fresh machine
//! should install, grouped into profiles with an OS filter per package.
//! Cloning and authentication live outside this crate; this module only
//! parses the file and resolves a profile to a package list.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::paths::FilePath;

pub const BOOTSTRAP_FILE: &str = ".dotbootstrap.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bootstrap {
    pub version: u32,
    #[serde(default)]
    pub packages: Vec<BootstrapPackage>,
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
    #[serde(default)]
    pub defaults: Defaults,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootstrapPackage {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    /// OS identifiers this package applies to; empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platform: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    #[serde(default)]
    pub description: String,
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Defaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_conflict: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

impl Bootstrap {
    pub fn path(package_dir: &FilePath) -> Utf8PathBuf {
        package_dir.as_path().join(BOOTSTRAP_FILE)
    }

    pub fn load(package_dir: &FilePath) -> Result<Self> {
        let path = Self::path(package_dir);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::BootstrapNotFound { path });
            }
            Err(e) => return Err(Error::io("read", &path, e)),
        };
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| Error::InvalidBootstrap {
            reason: e.to_string(),
        })
    }

    /// Write a starter bootstrap file listing the given packages.
    pub fn init(package_dir: &FilePath, packages: &[String]) -> Result<Self> {
        let path = Self::path(package_dir);
        if path.as_std_path().exists() {
            return Err(Error::BootstrapExists { path });
        }
        let bootstrap = Bootstrap {
            version: 1,
            packages: packages
                .iter()
                .map(|name| BootstrapPackage {
                    name: name.clone(),
                    required: false,
                    platform: Vec::new(),
                })
                .collect(),
            profiles: BTreeMap::new(),
            defaults: Defaults::default(),
        };
        let yaml = serde_yaml::to_string(&bootstrap).map_err(|e| Error::InvalidBootstrap {
            reason: e.to_string(),
        })?;
        std::fs::write(&path, yaml).map_err(|e| Error::io("write", &path, e))?;
        Ok(bootstrap)
    }

    /// Resolve a profile (explicit, or the configured default, or the full
    /// package list) to the package names to manage on this OS.
    pub fn select_packages(&self, profile: Option<&str>) -> Result<Vec<String>> {
        self.select_for_os(profile, std::env::consts::OS)
    }

    fn select_for_os(&self, profile: Option<&str>, os: &str) -> Result<Vec<String>> {
        let candidates: Vec<&BootstrapPackage> = self
            .packages
            .iter()
            .filter(|p| p.platform.is_empty() || p.platform.iter().any(|p| p == os))
            .collect();

        let profile = profile.or(self.defaults.profile.as_deref());
        match profile {
            None => Ok(candidates.iter().map(|p| p.name.clone()).collect()),
            Some(name) => {
                let profile = self
                    .profiles
                    .get(name)
                    .ok_or_else(|| Error::ProfileNotFound {
                        name: name.to_string(),
                    })?;
                // Required packages install regardless of the profile.
                let mut selected: Vec<String> = candidates
                    .iter()
                    .filter(|p| p.required || profile.packages.contains(&p.name))
                    .map(|p| p.name.clone())
                    .collect();
                selected.dedup();
                Ok(selected)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: 1
packages:
  - name: vim
    required: true
  - name: zsh
  - name: homebrew-tools
    platform: [macos]
  - name: systemd-units
    platform: [linux]
profiles:
  minimal:
    description: Just the editor
    packages: [vim]
  work:
    description: Everything for the office machine
    packages: [vim, zsh, systemd-units]
defaults:
  on_conflict: backup
  profile: minimal
"#;

    #[test]
    fn test_parse_sample() {
        let bootstrap = Bootstrap::parse(SAMPLE).unwrap();
        assert_eq!(bootstrap.version, 1);
        assert_eq!(bootstrap.packages.len(), 4);
        assert!(bootstrap.packages[0].required);
        assert_eq!(bootstrap.profiles["minimal"].packages, vec!["vim"]);
        assert_eq!(bootstrap.defaults.profile.as_deref(), Some("minimal"));
    }

    #[test]
    fn test_parse_garbage_is_invalid_bootstrap() {
        let err = Bootstrap::parse(": not yaml: [").unwrap_err();
        assert!(matches!(err, Error::InvalidBootstrap { .. }));
    }

    #[test]
    fn test_platform_filter() {
        let bootstrap = Bootstrap::parse(SAMPLE).unwrap();
        let linux = bootstrap.select_for_os(Some("work"), "linux").unwrap();
        assert_eq!(linux, vec!["vim", "zsh", "systemd-units"]);
        let macos = bootstrap.select_for_os(Some("work"), "macos").unwrap();
        assert_eq!(macos, vec!["vim", "zsh"]);
    }

    #[test]
    fn test_default_profile_and_required() {
        let bootstrap = Bootstrap::parse(SAMPLE).unwrap();
        // No explicit profile: the default (minimal) applies, and vim is
        // both required and listed.
        let selected = bootstrap.select_for_os(None, "linux").unwrap();
        assert_eq!(selected, vec!["vim"]);
    }

    #[test]
    fn test_unknown_profile() {
        let bootstrap = Bootstrap::parse(SAMPLE).unwrap();
        let err = bootstrap.select_for_os(Some("ghost"), "linux").unwrap_err();
        assert!(matches!(err, Error::ProfileNotFound { .. }));
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let package_dir = FilePath::new(root).unwrap();

        Bootstrap::init(&package_dir, &["vim".to_string()]).unwrap();
        let err = Bootstrap::init(&package_dir, &[]).unwrap_err();
        assert!(matches!(err, Error::BootstrapExists { .. }));

        let loaded = Bootstrap::load(&package_dir).unwrap();
        assert_eq!(loaded.packages[0].name, "vim");
    }

    #[test]
    fn test_load_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let package_dir = FilePath::new(root).unwrap();
        let err = Bootstrap::load(&package_dir).unwrap_err();
        assert!(matches!(err, Error::BootstrapNotFound { .. }));
    }
}
