//! Layered glob ignore rules.
//!
//! Patterns are evaluated in order: built-in defaults, then global extras,
//! then a package's own `.dotignore`. Later matches override earlier ones
//! and a leading `!` negates, forcing inclusion.

use camino::Utf8Path;
use globset::{Glob, GlobMatcher};
use tracing::warn;

use crate::error::{Error, Result};
use crate::paths::PackagePath;

/// Patterns every dotfiles tree wants out of the way.
pub const DEFAULT_IGNORES: &[&str] = &[
    ".git",
    ".gitignore",
    ".gitmodules",
    ".DS_Store",
    ".dotignore",
    "README*",
    "LICENSE*",
    "*.md",
];

/// File name of the per-package ignore file.
pub const DOTIGNORE_FILE: &str = ".dotignore";

#[derive(Debug, Clone)]
struct Rule {
    negated: bool,
    matcher: GlobMatcher,
}

/// An ordered rule list; the last matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    rules: Vec<Rule>,
}

impl IgnoreSet {
    /// Compile patterns in evaluation order. Unparsable patterns are
    /// skipped with a warning rather than failing the scan.
    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            let (negated, body) = match pattern.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, pattern),
            };
            match Glob::new(body) {
                Ok(glob) => rules.push(Rule {
                    negated,
                    matcher: glob.compile_matcher(),
                }),
                Err(err) => warn!(pattern, %err, "skipping unparsable ignore pattern"),
            }
        }
        Self { rules }
    }

    /// Append further patterns, keeping them after the existing layers.
    pub fn extend<I, S>(&mut self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extra = Self::from_patterns(patterns);
        self.rules.extend(extra.rules);
    }

    /// Decide for a path relative to the package root. Patterns match the
    /// relative path and the bare file name.
    pub fn is_ignored(&self, rel_path: &Utf8Path) -> bool {
        let file_name = rel_path.file_name().unwrap_or("");
        let mut ignored = false;
        for rule in &self.rules {
            if rule.matcher.is_match(rel_path) || rule.matcher.is_match(file_name) {
                ignored = !rule.negated;
            }
        }
        ignored
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Parse `.dotignore` content: one glob per line, `#` comments, `!` negates.
pub fn parse_dotignore(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Load a package's `.dotignore` patterns, empty when the file is absent.
pub fn load_dotignore(package_root: &PackagePath) -> Result<Vec<String>> {
    let path = package_root.join(DOTIGNORE_FILE);
    match std::fs::read_to_string(path.as_path()) {
        Ok(content) => Ok(parse_dotignore(&content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::io("read", path.as_path(), e)),
    }
}
