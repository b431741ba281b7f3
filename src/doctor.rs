//! Health checking and triage.
//!
//! The doctor verifies every manifest-recorded link, then scans the target
//! tree for symlinks nobody claims. Scanning runs on a bounded worker pool;
//! workers each own a directory and stream findings over a channel to a
//! single aggregator. The doctor never returns early: independent failures
//! are aggregated into the report.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::context::{AppContext, CancelToken};
use crate::error::{Error, Result};
use crate::fs_utils::{self, FsType};
use crate::ignore::IgnoreSet;
use crate::manifest::{IgnoredLink, Manifest, PackageSource};
use crate::ops::OpKind;
use crate::paths::{PackagePath, TargetPath};
use crate::planner::Plan;
use crate::scanner::{self, Package, Scanner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IssueKind {
    /// A symlink whose destination no longer exists.
    BrokenLink,
    /// A manifest link that points outside its package.
    WrongTarget,
    /// A manifest record with no symlink on disk.
    MissingLink,
    /// A symlink into a known package that no manifest entry claims.
    OrphanedLink,
    /// A symlink pointing outside the known area entirely.
    UntrackedLink,
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            IssueKind::BrokenLink => "broken link",
            IssueKind::WrongTarget => "wrong target",
            IssueKind::MissingLink => "missing link",
            IssueKind::OrphanedLink => "orphaned link",
            IssueKind::UntrackedLink => "untracked link",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct Issue {
    pub kind: IssueKind,
    /// Path relative to the target directory.
    pub path: String,
    pub package: Option<String>,
    pub detail: String,
    pub severity: Severity,
    /// The symlink's destination, when one exists.
    pub dest: Option<Utf8PathBuf>,
}

#[derive(Debug, Default)]
pub struct Report {
    pub issues: Vec<Issue>,
    pub checked_links: usize,
    pub canceled: bool,
    pub truncated: bool,
}

impl Report {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }

    /// Exit contract: 0 healthy, 1 warnings only, 2 any error.
    pub fn exit_code(&self) -> i32 {
        if self.issues.is_empty() {
            0
        } else if self
            .issues
            .iter()
            .any(|i| i.severity == Severity::Error)
        {
            2
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    Off,
    /// Walk only directories that contain managed links (plus the target
    /// root itself).
    #[default]
    Scoped,
    /// Walk the whole target tree down to a depth limit.
    Deep,
}

#[derive(Debug, Clone)]
pub struct DoctorConfig {
    pub scan: ScanMode,
    pub workers: usize,
    pub max_issues: usize,
    pub max_depth: usize,
}

impl Default for DoctorConfig {
    fn default() -> Self {
        Self {
            scan: ScanMode::Scoped,
            workers: num_cpus::get(),
            max_issues: 500,
            max_depth: 8,
        }
    }
}

pub struct Doctor<'a> {
    ctx: &'a AppContext,
    config: DoctorConfig,
}

impl<'a> Doctor<'a> {
    pub fn new(ctx: &'a AppContext, config: DoctorConfig) -> Self {
        Self { ctx, config }
    }

    pub fn run(&self, manifest: &Manifest) -> Result<Report> {
        let mut report = Report::default();
        let suppress = SuppressionIndex::new(manifest);

        let known_links = self.check_manifest_links(manifest, &mut report);
        if report.canceled {
            report.issues.sort_by(|a, b| a.path.cmp(&b.path));
            return Ok(report);
        }

        if report.issues.len() >= self.config.max_issues {
            report.issues.truncate(self.config.max_issues);
            report.truncated = true;
        } else if self.config.scan != ScanMode::Off {
            self.scan_orphans(manifest, &known_links, &suppress, &mut report);
        }

        report.issues.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(report)
    }

    /// Verify every link the manifest records. Runs sequentially; the scan
    /// phase is where parallelism pays off.
    fn check_manifest_links(
        &self,
        manifest: &Manifest,
        report: &mut Report,
    ) -> HashSet<Utf8PathBuf> {
        let mut known = HashSet::new();
        for (name, record) in &manifest.packages {
            let package_root = self.ctx.package_dir.as_path().join(name);
            for rel in &record.links {
                if self.ctx.cancel.is_canceled() {
                    report.canceled = true;
                    return known;
                }
                report.checked_links += 1;
                let path = self.ctx.target_dir.as_path().join(rel);
                known.insert(path.clone());

                match fs_utils::entry_type(&path) {
                    None => report.issues.push(Issue {
                        kind: IssueKind::MissingLink,
                        path: rel.clone(),
                        package: Some(name.clone()),
                        detail: "recorded link is absent from disk".to_string(),
                        severity: Severity::Warning,
                        dest: None,
                    }),
                    Some(FsType::Symlink) => {
                        let dest = fs_utils::read_link_raw(&path).unwrap_or_default();
                        if fs_utils::is_broken_symlink(&path) {
                            report.issues.push(Issue {
                                kind: IssueKind::BrokenLink,
                                path: rel.clone(),
                                package: Some(name.clone()),
                                detail: format!("destination {dest} does not exist"),
                                severity: Severity::Error,
                                dest: Some(dest),
                            });
                        } else if !dest.starts_with(&package_root) {
                            report.issues.push(Issue {
                                kind: IssueKind::WrongTarget,
                                path: rel.clone(),
                                package: Some(name.clone()),
                                detail: format!("resolves to {dest}, outside {package_root}"),
                                severity: Severity::Error,
                                dest: Some(dest),
                            });
                        }
                    }
                    Some(_) => report.issues.push(Issue {
                        kind: IssueKind::MissingLink,
                        path: rel.clone(),
                        package: Some(name.clone()),
                        detail: "recorded link was replaced by a real entry".to_string(),
                        severity: Severity::Warning,
                        dest: None,
                    }),
                }
            }
        }
        known
    }

    /// The bounded parallel orphan scan.
    fn scan_orphans(
        &self,
        manifest: &Manifest,
        known_links: &HashSet<Utf8PathBuf>,
        suppress: &SuppressionIndex,
        report: &mut Report,
    ) {
        let dirs = self.scan_roots(manifest);
        if dirs.is_empty() || self.config.max_issues == 0 {
            return;
        }

        let budget = self.config.max_issues - report.issues.len();
        let workers = self
            .config
            .workers
            .min(num_cpus::get())
            .min(dirs.len())
            .max(1);
        debug!(dirs = dirs.len(), workers, budget, "orphan scan starting");

        let counter = AtomicUsize::new(0);
        let stop = CancelToken::new();
        let outer = self.ctx.cancel.clone();

        let (dir_tx, dir_rx) = crossbeam::channel::bounded::<Utf8PathBuf>(dirs.len());
        for dir in dirs {
            let _ = dir_tx.send(dir);
        }
        drop(dir_tx);
        let (issue_tx, issue_rx) = crossbeam::channel::bounded::<Issue>(64);

        let mut found: Vec<Issue> = Vec::new();
        crossbeam::thread::scope(|scope| {
            for _ in 0..workers {
                let dir_rx = dir_rx.clone();
                let issue_tx = issue_tx.clone();
                let counter = &counter;
                let stop = stop.clone();
                let outer = outer.clone();
                scope.spawn(move |_| {
                    while let Ok(dir) = dir_rx.recv() {
                        if stop.is_canceled() || outer.is_canceled() {
                            break;
                        }
                        self.scan_one_dir(
                            &dir,
                            known_links,
                            suppress,
                            counter,
                            budget,
                            &stop,
                            &issue_tx,
                        );
                    }
                });
            }
            drop(issue_tx);

            // Single aggregator: the only writer to the issue list.
            for issue in issue_rx.iter() {
                found.push(issue);
            }
        })
        .expect("doctor scan worker panicked");

        report.canceled = report.canceled || outer.is_canceled();
        report.truncated = report.truncated || counter.load(Ordering::SeqCst) >= budget;
        found.truncate(budget);
        report.issues.extend(found);
    }

    /// Inspect one directory's immediate entries for unclaimed symlinks.
    #[allow(clippy::too_many_arguments)]
    fn scan_one_dir(
        &self,
        dir: &Utf8Path,
        known_links: &HashSet<Utf8PathBuf>,
        suppress: &SuppressionIndex,
        counter: &AtomicUsize,
        budget: usize,
        stop: &CancelToken,
        issue_tx: &crossbeam::channel::Sender<Issue>,
    ) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            if stop.is_canceled() {
                return;
            }
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            if fs_utils::entry_type(&path) != Some(FsType::Symlink) {
                continue;
            }
            if known_links.contains(&path) {
                continue;
            }
            let rel = path
                .strip_prefix(self.ctx.target_dir.as_path())
                .map(|p| p.to_string())
                .unwrap_or_else(|_| path.to_string());
            let dest = fs_utils::read_link_raw(&path).unwrap_or_default();
            if suppress.is_suppressed(&rel, &dest) {
                continue;
            }

            let issue = if fs_utils::is_broken_symlink(&path) {
                Issue {
                    kind: IssueKind::BrokenLink,
                    path: rel,
                    package: None,
                    detail: format!("destination {dest} does not exist"),
                    severity: Severity::Error,
                    dest: Some(dest),
                }
            } else if dest.starts_with(self.ctx.package_dir.as_path()) {
                Issue {
                    kind: IssueKind::OrphanedLink,
                    path: rel,
                    package: None,
                    detail: format!("points into {dest} but no manifest entry claims it"),
                    severity: Severity::Warning,
                    dest: Some(dest),
                }
            } else {
                Issue {
                    kind: IssueKind::UntrackedLink,
                    path: rel,
                    package: None,
                    detail: format!("points outside the package directory at {dest}"),
                    severity: Severity::Warning,
                    dest: Some(dest),
                }
            };

            // The cap is enforced at the counter: once it is reached the
            // cancellation signal fans out and workers wind down.
            let seen = counter.fetch_add(1, Ordering::SeqCst);
            if seen >= budget {
                stop.cancel();
                return;
            }
            if issue_tx.send(issue).is_err() {
                return;
            }
        }
    }

    /// Directories the scan will visit, depending on the mode.
    fn scan_roots(&self, manifest: &Manifest) -> Vec<Utf8PathBuf> {
        let target = self.ctx.target_dir.as_path();
        let mut roots: HashSet<Utf8PathBuf> = HashSet::new();

        match self.config.scan {
            ScanMode::Off => {}
            ScanMode::Scoped => {
                roots.insert(target.to_owned());
                for record in manifest.packages.values() {
                    for rel in &record.links {
                        if let Some(parent) = target.join(rel).parent() {
                            roots.insert(parent.to_owned());
                        }
                    }
                }
            }
            ScanMode::Deep => {
                for entry in WalkDir::new(target)
                    .max_depth(self.config.max_depth)
                    .into_iter()
                    .filter_map(std::result::Result::ok)
                {
                    if !entry.file_type().is_dir() {
                        continue;
                    }
                    if let Ok(dir) = Utf8PathBuf::from_path_buf(entry.path().to_path_buf()) {
                        roots.insert(dir);
                    }
                }
            }
        }

        roots.retain(|dir| {
            !dir.starts_with(self.ctx.backup_dir.as_path())
                && !dir.starts_with(self.ctx.package_dir.as_path())
        });
        let mut roots: Vec<Utf8PathBuf> = roots.into_iter().collect();
        roots.sort();
        roots
    }

    /// Plan automated fixes for the report's issues. The caller routes the
    /// plan through the executor and applies the manifest fixes afterwards.
    pub fn plan_fixes(&self, report: &Report) -> Result<(Plan, Vec<ManifestFix>)> {
        let mut sources: HashMap<String, HashMap<String, PackagePath>> = HashMap::new();
        let mut ops: Vec<OpKind> = Vec::new();
        let mut fixes: Vec<ManifestFix> = Vec::new();

        for issue in &report.issues {
            match issue.kind {
                IssueKind::MissingLink | IssueKind::WrongTarget | IssueKind::BrokenLink => {
                    let target = TargetPath::new(
                        self.ctx.target_dir.as_path().join(&issue.path),
                    )?;
                    let package = issue.package.clone();
                    let source = match &package {
                        Some(name) => self
                            .package_sources(name, &mut sources)
                            .get(issue.path.as_str())
                            .cloned(),
                        None => None,
                    };
                    match (issue.kind, source) {
                        // A managed link whose source still exists: recreate.
                        (_, Some(source)) => {
                            match fs_utils::entry_type(target.as_path()) {
                                Some(FsType::Symlink) => {
                                    ops.push(OpKind::LinkDelete {
                                        target: target.clone(),
                                    });
                                }
                                // A real entry took the link's place; that
                                // is a conflict for manage, not a fix.
                                Some(_) => continue,
                                None => {}
                            }
                            ops.push(OpKind::LinkCreate {
                                source: source.as_file(),
                                target,
                            });
                        }
                        // The source is gone: drop the link and the record.
                        (IssueKind::BrokenLink | IssueKind::WrongTarget, None) => {
                            if fs_utils::entry_type(target.as_path()) == Some(FsType::Symlink) {
                                ops.push(OpKind::LinkDelete { target });
                            }
                            if let Some(package) = package {
                                fixes.push(ManifestFix::DropLink {
                                    package,
                                    rel: issue.path.clone(),
                                });
                            }
                        }
                        (_, None) => {
                            if let Some(package) = package {
                                fixes.push(ManifestFix::DropLink {
                                    package,
                                    rel: issue.path.clone(),
                                });
                            }
                        }
                    }
                }
                // Orphans and untracked links go through triage, not fix.
                IssueKind::OrphanedLink | IssueKind::UntrackedLink => {}
            }
        }

        let operations: Vec<crate::ops::Operation> = ops
            .into_iter()
            .enumerate()
            .map(|(i, kind)| crate::ops::Operation::new(i as u64 + 1, kind))
            .collect();
        let mut plan = Plan {
            operations,
            ..Plan::default()
        };
        plan.metadata.operation_count = plan.operations.len();
        Ok((plan, fixes))
    }

    /// Lazily build the map from recorded link-relative paths to package
    /// sources, used to recreate links.
    fn package_sources<'m>(
        &self,
        name: &str,
        cache: &'m mut HashMap<String, HashMap<String, PackagePath>>,
    ) -> &'m HashMap<String, PackagePath> {
        if !cache.contains_key(name) {
            let mut map = HashMap::new();
            if let Ok(package) = Package::new(name, &self.ctx.package_dir) {
                if let Ok(tree) = Scanner::new(&self.ctx.scan).scan_package(&package) {
                    let base = if self.ctx.package_name_mapping {
                        Utf8PathBuf::from(package.target_name())
                    } else {
                        Utf8PathBuf::new()
                    };
                    index_tree(&tree.root, &package.root, &base, &mut map);
                }
            }
            cache.insert(name.to_string(), map);
        }
        &cache[name]
    }
}

fn index_tree(
    node: &crate::scanner::Node,
    root: &PackagePath,
    base: &Utf8Path,
    map: &mut HashMap<String, PackagePath>,
) {
    for child in &node.children {
        let rel = child
            .path
            .strip_prefix(root)
            .map(scanner::translate_rel_path)
            .unwrap_or_default();
        let rel = if base.as_str().is_empty() {
            rel
        } else {
            base.join(rel)
        };
        map.insert(rel.to_string(), child.path.clone());
        if !child.is_leaf() {
            index_tree(child, root, base, map);
        }
    }
}

/// A manifest mutation the fix phase applies after the plan succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestFix {
    DropLink { package: String, rel: String },
}

pub fn apply_manifest_fixes(manifest: &mut Manifest, fixes: &[ManifestFix]) {
    for fix in fixes {
        match fix {
            ManifestFix::DropLink { package, rel } => {
                let emptied = if let Some(record) = manifest.packages.get_mut(package) {
                    record.links.retain(|l| l != rel);
                    record.link_count = record.links.len();
                    record.links.is_empty() && record.source == PackageSource::Managed
                } else {
                    false
                };
                if emptied {
                    manifest.remove_package(package);
                }
            }
        }
    }
}

/// Precise and glob-based ignore decisions from previous triage runs.
struct SuppressionIndex {
    links: BTreeMap<String, IgnoredLink>,
    patterns: IgnoreSet,
}

impl SuppressionIndex {
    fn new(manifest: &Manifest) -> Self {
        match manifest.doctor_state() {
            Some(state) => Self {
                links: state.ignored_links.clone(),
                patterns: IgnoreSet::from_patterns(&state.ignored_patterns),
            },
            None => Self {
                links: BTreeMap::new(),
                patterns: IgnoreSet::default(),
            },
        }
    }

    fn is_suppressed(&self, rel: &str, dest: &Utf8Path) -> bool {
        if self.patterns.is_ignored(Utf8Path::new(rel)) {
            return true;
        }
        match self.links.get(rel) {
            // An empty stored hash matches on path alone; otherwise the
            // live destination must still hash to the acknowledged value.
            Some(entry) => {
                entry.target_hash.is_empty()
                    || entry.target_hash == fs_utils::sha256_bytes(dest.as_str().as_bytes())
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

pub struct TriageRule {
    pub prefix: &'static str,
    pub category: &'static str,
    pub confidence: Confidence,
}

/// Rule table for classifying orphans: system-managed prefixes, caches,
/// and language toolchain install areas.
pub const TRIAGE_RULES: &[TriageRule] = &[
    TriageRule { prefix: ".cache/", category: "cache", confidence: Confidence::High },
    TriageRule { prefix: ".local/share/Trash/", category: "system", confidence: Confidence::High },
    TriageRule { prefix: ".local/state/", category: "system", confidence: Confidence::Medium },
    TriageRule { prefix: ".cargo/", category: "toolchain", confidence: Confidence::High },
    TriageRule { prefix: ".rustup/", category: "toolchain", confidence: Confidence::High },
    TriageRule { prefix: ".nvm/", category: "toolchain", confidence: Confidence::High },
    TriageRule { prefix: ".pyenv/", category: "toolchain", confidence: Confidence::High },
    TriageRule { prefix: ".rbenv/", category: "toolchain", confidence: Confidence::High },
    TriageRule { prefix: ".npm/", category: "toolchain", confidence: Confidence::Medium },
    TriageRule { prefix: "go/bin/", category: "toolchain", confidence: Confidence::Medium },
    TriageRule { prefix: ".local/share/flatpak/", category: "system", confidence: Confidence::High },
    TriageRule { prefix: "snap/", category: "system", confidence: Confidence::High },
    TriageRule { prefix: ".steam/", category: "system", confidence: Confidence::Medium },
    TriageRule { prefix: ".wine/", category: "system", confidence: Confidence::Medium },
];

/// Classify one orphan path against the rule table.
pub fn categorize(rel: &str) -> (&'static str, Confidence) {
    for rule in TRIAGE_RULES {
        if rel.starts_with(rule.prefix) {
            return (rule.category, rule.confidence);
        }
    }
    ("unrecognized", Confidence::Low)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageMode {
    /// One prompt per category.
    ByCategory,
    /// One prompt per link.
    PerLink,
    /// Ignore high-confidence matches without prompting.
    AutoIgnore,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TriageSummary {
    pub ignored: usize,
    pub remaining: usize,
}

/// Persist ignore decisions for the report's orphans. Interactive modes
/// prompt through the console; `AutoIgnore` acts silently on
/// high-confidence matches.
pub fn triage(
    report: &Report,
    manifest: &mut Manifest,
    mode: TriageMode,
) -> Result<TriageSummary> {
    use colored::Colorize;
    use dialoguer::Confirm;

    let orphans: Vec<&Issue> = report
        .issues
        .iter()
        .filter(|i| matches!(i.kind, IssueKind::OrphanedLink | IssueKind::UntrackedLink))
        .collect();
    let mut summary = TriageSummary::default();

    let acknowledge = |manifest: &mut Manifest, issue: &Issue, category: &str| {
        let dest = issue.dest.clone().unwrap_or_default();
        manifest.doctor_state_mut().ignored_links.insert(
            issue.path.clone(),
            IgnoredLink {
                target: dest.to_string(),
                target_hash: fs_utils::sha256_bytes(dest.as_str().as_bytes()),
                reason: category.to_string(),
                acknowledged_at: Utc::now(),
            },
        );
    };

    match mode {
        TriageMode::AutoIgnore => {
            for issue in &orphans {
                let (category, confidence) = categorize(&issue.path);
                if confidence == Confidence::High {
                    acknowledge(manifest, issue, category);
                    summary.ignored += 1;
                } else {
                    summary.remaining += 1;
                }
            }
        }
        TriageMode::PerLink => {
            for issue in &orphans {
                let (category, _) = categorize(&issue.path);
                let ignore = Confirm::new()
                    .with_prompt(format!(
                        "ignore {} ({category})?",
                        issue.path.clone().bold()
                    ))
                    .default(true)
                    .interact()
                    .map_err(|e| {
                        Error::io(
                            "prompt",
                            Utf8PathBuf::from(issue.path.clone()),
                            std::io::Error::other(e.to_string()),
                        )
                    })?;
                if ignore {
                    acknowledge(manifest, issue, category);
                    summary.ignored += 1;
                } else {
                    summary.remaining += 1;
                }
            }
        }
        TriageMode::ByCategory => {
            let mut by_category: BTreeMap<&'static str, Vec<&Issue>> = BTreeMap::new();
            for issue in &orphans {
                let (category, _) = categorize(&issue.path);
                by_category.entry(category).or_default().push(issue);
            }
            for (category, issues) in by_category {
                let ignore = Confirm::new()
                    .with_prompt(format!(
                        "ignore {} {} link(s)?",
                        issues.len(),
                        category.bold()
                    ))
                    .default(category != "unrecognized")
                    .interact()
                    .map_err(|e| {
                        Error::io(
                            "prompt",
                            Utf8PathBuf::from(category),
                            std::io::Error::other(e.to_string()),
                        )
                    })?;
                for issue in issues {
                    if ignore {
                        acknowledge(manifest, issue, category);
                        summary.ignored += 1;
                    } else {
                        summary.remaining += 1;
                    }
                }
            }
        }
    }

    if summary.ignored > 0 {
        debug!(ignored = summary.ignored, "triage recorded ignore decisions");
    } else if !orphans.is_empty() {
        warn!("triage left all orphans unacknowledged");
    }
    Ok(summary)
}
