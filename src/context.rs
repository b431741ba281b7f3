//! The immutable application context threaded through every service.
//!
//! There is no global state: directories, policies, concurrency limits and
//! the cancellation token are all constructed once at the top and passed in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::paths::{FilePath, TargetPath};
use crate::planner::ConflictPolicy;

/// Name of the backup directory under the target directory.
pub const BACKUP_DIR_NAME: &str = ".dot-backup";

/// Cooperative cancellation, checked before each I/O batch and between
/// operations. An optional deadline turns the token into a timeout.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<DateTime<Utc>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: DateTime<Utc>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        match self.deadline {
            Some(deadline) => Utc::now() >= deadline,
            None => false,
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }
}

/// Scanner configuration.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Honor per-package `.dotignore` files.
    pub per_package_ignore: bool,
    /// Skip files larger than this many bytes; 0 means unlimited.
    pub max_file_size: u64,
    /// Prompt before including an oversize file instead of skipping it.
    pub interactive_large_files: bool,
    /// Built-in ignore patterns; empty disables the defaults.
    pub default_ignores: Vec<String>,
    /// Extra patterns evaluated after the defaults.
    pub extra_ignores: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            per_package_ignore: true,
            max_file_size: 0,
            interactive_large_files: false,
            default_ignores: crate::ignore::DEFAULT_IGNORES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            extra_ignores: Vec::new(),
        }
    }
}

/// Everything a service needs to run one user-visible operation.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub package_dir: FilePath,
    pub target_dir: TargetPath,
    pub backup_dir: FilePath,
    pub scan: ScanConfig,
    pub policy: ConflictPolicy,
    /// Make the package's translated name the first target component.
    pub package_name_mapping: bool,
    /// Allow directory-level links where ownership is exclusive.
    pub folding: bool,
    pub concurrency: usize,
    pub dry_run: bool,
    pub cancel: CancelToken,
}

impl AppContext {
    pub fn new(package_dir: FilePath, target_dir: TargetPath) -> Self {
        let backup_dir = target_dir.as_file().join(BACKUP_DIR_NAME);
        Self {
            package_dir,
            target_dir,
            backup_dir,
            scan: ScanConfig::default(),
            policy: ConflictPolicy::Fail,
            package_name_mapping: false,
            folding: true,
            concurrency: num_cpus::get(),
            dry_run: false,
            cancel: CancelToken::new(),
        }
    }
}

/// The user's home directory, the default target directory.
pub fn home_dir() -> Result<Utf8PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| Error::InvalidPath {
        path: Utf8PathBuf::from("~"),
        reason: "HOME is not set".to_string(),
    })?;
    Utf8PathBuf::from_path_buf(home).map_err(|p| Error::InvalidPath {
        path: Utf8PathBuf::from(p.to_string_lossy().to_string()),
        reason: "home directory is not valid UTF-8".to_string(),
    })
}

fn xdg_dir(var: &str, home_rel: &str) -> Result<Utf8PathBuf> {
    match std::env::var(var) {
        Ok(dir) if !dir.is_empty() => Ok(Utf8PathBuf::from(dir)),
        _ => Ok(home_dir()?.join(home_rel)),
    }
}

/// `$XDG_DATA_HOME/dot`, where a cloned dotfiles repository lives by default.
pub fn data_dir() -> Result<Utf8PathBuf> {
    Ok(xdg_dir("XDG_DATA_HOME", ".local/share")?.join("dot"))
}

/// `$XDG_CONFIG_HOME/dot`.
pub fn config_dir() -> Result<Utf8PathBuf> {
    Ok(xdg_dir("XDG_CONFIG_HOME", ".config")?.join("dot"))
}

/// `$XDG_STATE_HOME/dot`.
pub fn state_dir() -> Result<Utf8PathBuf> {
    Ok(xdg_dir("XDG_STATE_HOME", ".local/state")?.join("dot"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_flag() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());
        assert!(token.check().is_ok());

        token.cancel();
        assert!(token.is_canceled());
        assert!(matches!(token.check(), Err(Error::Canceled)));

        // Clones share the flag.
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_canceled());
    }

    #[test]
    fn test_cancel_token_deadline() {
        let expired = CancelToken::with_deadline(Utc::now() - chrono::Duration::seconds(1));
        assert!(expired.is_canceled());

        let future = CancelToken::with_deadline(Utc::now() + chrono::Duration::hours(1));
        assert!(!future.is_canceled());
    }

    #[test]
    fn test_context_derives_backup_dir() {
        let ctx = AppContext::new(
            FilePath::new("/p").unwrap(),
            TargetPath::new("/t").unwrap(),
        );
        assert_eq!(ctx.backup_dir.as_str(), "/t/.dot-backup");
    }
}
