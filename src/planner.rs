//! The planner.
//!
//! Purely functional over scanned package trees and observed target state:
//! computes desired links, classifies conflicts, resolves them per policy,
//! then orders the resulting operations along an explicit dependency graph
//! and partitions them into parallel-safe batches. The planner never touches
//! the filesystem beyond reading it and never recovers from an error.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::context::AppContext;
use crate::error::{ConflictKind, Error, Result};
use crate::fs_utils::{self, FsType};
use crate::ops::{OpKind, Operation, OperationId};
use crate::paths::{FilePath, PackagePath, TargetPath};
use crate::scanner::{translate_component, untranslate_component, Node, Package, PackageTree};

/// What to do when an existing entry blocks a proposed link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Surface the conflict and refuse to plan.
    #[default]
    Fail,
    /// Preserve the existing entry under the backup directory, then link.
    Backup,
    /// Remove the existing entry, then link.
    Overwrite,
    /// Leave the existing entry alone and omit the link.
    Skip,
}

#[derive(Debug, Clone, Default)]
pub struct PlanMetadata {
    pub package_count: usize,
    pub operation_count: usize,
    pub link_count: usize,
    pub dir_count: usize,
    pub conflicts: usize,
    pub warnings: Vec<String>,
}

/// A totally ordered list of operations plus parallel-safe batches.
/// Produced once, consumed once by the executor, then discarded.
#[derive(Debug, Default)]
pub struct Plan {
    pub operations: Vec<Operation>,
    pub batches: Vec<Vec<OperationId>>,
    pub metadata: PlanMetadata,
    pub package_operations: BTreeMap<String, Vec<OperationId>>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }
}

/// A manage plan plus the bookkeeping the manifest needs afterwards.
#[derive(Debug, Default)]
pub struct ManageBlueprint {
    pub plan: Plan,
    /// Links each package will own after execution, including ones that
    /// already existed and were dropped as idempotent.
    pub links: BTreeMap<String, Vec<TargetPath>>,
    /// Backups taken per package: (original target, backup location).
    pub backups: BTreeMap<String, Vec<(TargetPath, FilePath)>>,
    /// Links created on behalf of other, on-disk packages while unfolding,
    /// keyed by that package's name.
    pub foreign_links: BTreeMap<String, Vec<TargetPath>>,
    /// Folded links of other packages that were replaced while unfolding.
    pub foreign_removed: BTreeMap<String, Vec<TargetPath>>,
}

/// One package's share of an unmanage plan, assembled by the service from
/// the manifest record.
#[derive(Debug, Clone)]
pub struct UnmanageItem {
    pub package: String,
    pub links: Vec<TargetPath>,
    /// Backups to move back into place: (backup location, original target).
    pub restores: Vec<(FilePath, TargetPath)>,
    /// Remove the package directory itself afterwards.
    pub purge_root: Option<FilePath>,
}

/// One path to adopt into a package.
#[derive(Debug, Clone)]
pub struct AdoptRequest {
    pub path: TargetPath,
}

#[derive(Debug, Default)]
pub struct AdoptBlueprint {
    pub plan: Plan,
    pub links: Vec<TargetPath>,
}

pub struct Planner<'a> {
    ctx: &'a AppContext,
}

/// The planner's view of what a path will be once earlier operations in the
/// same plan have run.
#[derive(Debug, Clone)]
enum SimEntry {
    Created(FsType, Option<Utf8PathBuf>),
    Removed,
}

/// Cross-package claim index: which packages contribute beneath each target
/// directory, and which package owns each leaf target.
#[derive(Debug, Default)]
struct Claims {
    contributors: HashMap<Utf8PathBuf, BTreeSet<usize>>,
    leaf_owner: HashMap<Utf8PathBuf, usize>,
}

impl Claims {
    fn sole_contributor(&self, target: &TargetPath) -> Option<usize> {
        match self.contributors.get(target.as_path()) {
            Some(set) if set.len() == 1 => set.iter().next().copied(),
            _ => None,
        }
    }
}

struct PlanBuilder<'a> {
    ctx: &'a AppContext,
    assume_absent: &'a HashSet<TargetPath>,
    next_id: OperationId,
    ops: Vec<Operation>,
    sim: HashMap<Utf8PathBuf, SimEntry>,
    fatal_conflicts: Vec<Error>,
    resolved_conflicts: usize,
    warnings: Vec<String>,
    package_operations: BTreeMap<String, Vec<OperationId>>,
    current_package: Option<String>,
    links: BTreeMap<String, Vec<TargetPath>>,
    backups: BTreeMap<String, Vec<(TargetPath, FilePath)>>,
    foreign_links: BTreeMap<String, Vec<TargetPath>>,
    foreign_removed: BTreeMap<String, Vec<TargetPath>>,
    backup_stamp: String,
}

impl<'a> Planner<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self { ctx }
    }

    /// Plan installing the given packages. `assume_absent` names target
    /// entries to treat as missing, which remanage uses to plan over links
    /// it is about to delete.
    pub fn plan_manage(
        &self,
        trees: &[PackageTree],
        assume_absent: &HashSet<TargetPath>,
    ) -> Result<ManageBlueprint> {
        let claims = self.collect_claims(trees)?;
        let mut b = PlanBuilder::new(self.ctx, assume_absent);

        for (idx, tree) in trees.iter().enumerate() {
            self.ctx.cancel.check()?;
            b.begin_package(&tree.package.name);
            b.warnings.extend(tree.warnings.iter().cloned());

            if self.ctx.package_name_mapping {
                let base = self.ctx.target_dir.join(tree.package.target_name());
                b.plan_dir(idx, &tree.root, &base, &claims)?;
            } else {
                for child in &tree.root.children {
                    b.plan_node(idx, child, &self.ctx.target_dir, &claims)?;
                }
            }
        }

        if !b.fatal_conflicts.is_empty() {
            return Err(Error::aggregate(std::mem::take(&mut b.fatal_conflicts)));
        }

        let plan = b.assemble(trees.len())?;
        debug!(
            operations = plan.metadata.operation_count,
            links = plan.metadata.link_count,
            dirs = plan.metadata.dir_count,
            batches = plan.batches.len(),
            "manage plan ready"
        );
        Ok(ManageBlueprint {
            plan,
            links: b.links,
            backups: b.backups,
            foreign_links: b.foreign_links,
            foreign_removed: b.foreign_removed,
        })
    }

    /// Plan removing the given installed packages.
    pub fn plan_unmanage(&self, items: &[UnmanageItem]) -> Result<Plan> {
        let empty = HashSet::new();
        let mut b = PlanBuilder::new(self.ctx, &empty);

        for item in items {
            self.ctx.cancel.check()?;
            b.begin_package(&item.package);
            for link in &item.links {
                match b.effective(link.as_path()) {
                    Some((FsType::Symlink, _)) => {
                        b.push(OpKind::LinkDelete {
                            target: link.clone(),
                        });
                    }
                    Some(_) => b.warnings.push(format!(
                        "{link} is no longer a symlink, leaving it alone"
                    )),
                    None => b
                        .warnings
                        .push(format!("{link} is already gone, nothing to remove")),
                }
            }
            for (backup, original) in &item.restores {
                if b.effective(backup.as_path()).is_none() {
                    b.warnings
                        .push(format!("backup {backup} is missing, cannot restore"));
                    continue;
                }
                match TargetPath::new(backup.as_path().to_owned()) {
                    Ok(from) => {
                        b.push(OpKind::FileMove {
                            from,
                            to: original.as_file(),
                        });
                    }
                    Err(e) => b.warnings.push(format!("cannot restore {backup}: {e}")),
                }
            }
            if let Some(root) = &item.purge_root {
                if b.effective(root.as_path()).is_some() {
                    b.push(OpKind::DirRemoveAll { path: root.clone() });
                }
            }
        }

        b.assemble(items.len())
    }

    /// Plan moving existing target-side entries into a package and linking
    /// them back.
    pub fn plan_adopt(
        &self,
        requests: &[AdoptRequest],
        package: &Package,
    ) -> Result<AdoptBlueprint> {
        let empty = HashSet::new();
        let mut b = PlanBuilder::new(self.ctx, &empty);
        b.begin_package(&package.name);
        let mut links = Vec::new();

        for request in requests {
            self.ctx.cancel.check()?;
            let path = &request.path;
            let rel = path
                .strip_prefix(&self.ctx.target_dir)
                .ok_or_else(|| Error::InvalidPath {
                    path: path.as_path().to_owned(),
                    reason: "not inside the target directory".to_string(),
                })?;
            let pkg_rel: Utf8PathBuf = rel
                .components()
                .map(|c| untranslate_component(c.as_str()))
                .collect();

            match b.effective(path.as_path()) {
                None => {
                    return Err(Error::SourceNotFound {
                        path: path.as_path().to_owned(),
                    })
                }
                Some((FsType::Symlink, _)) => {
                    b.warnings
                        .push(format!("{path} is already a symlink, skipping"));
                    continue;
                }
                Some((FsType::File, _)) => {
                    let dest = package.root.join(&pkg_rel);
                    b.ensure_package_dirs(&package.root, dest.parent().as_ref());
                    b.push(OpKind::FileMove {
                        from: path.clone(),
                        to: dest.as_file(),
                    });
                    b.push(OpKind::LinkCreate {
                        source: dest.as_file(),
                        target: path.clone(),
                    });
                    links.push(path.clone());
                }
                Some((FsType::Dir, _)) => {
                    // Adopting the package's own hidden name flattens the
                    // directory contents into the package root.
                    let flatten = rel.components().count() == 1
                        && untranslate_component(rel.as_str()) == package.name;
                    let dest_root = if flatten {
                        package.root.clone()
                    } else {
                        package.root.join(&pkg_rel)
                    };
                    b.ensure_package_dirs(&package.root, Some(&dest_root));
                    b.adopt_dir(path, &dest_root)?;
                    b.push(OpKind::LinkCreate {
                        source: dest_root.as_file(),
                        target: path.clone(),
                    });
                    links.push(path.clone());
                }
            }
        }

        let plan = b.assemble(1)?;
        Ok(AdoptBlueprint { plan, links })
    }

    fn collect_claims(&self, trees: &[PackageTree]) -> Result<Claims> {
        let mut claims = Claims::default();
        let mut clashes = Vec::new();

        for (idx, tree) in trees.iter().enumerate() {
            let base = if self.ctx.package_name_mapping {
                self.ctx.target_dir.join(tree.package.target_name())
            } else {
                self.ctx.target_dir.clone()
            };
            for child in &tree.root.children {
                self.claim_node(idx, child, &base, &mut claims, &mut clashes);
            }
        }

        // A leaf target that doubles as another package's directory is a
        // clash no policy can resolve.
        for (leaf, owner) in &claims.leaf_owner {
            if let Some(set) = claims.contributors.get(leaf) {
                if set.iter().any(|p| p != owner) {
                    clashes.push(Error::Conflict {
                        target: leaf.clone(),
                        kind: ConflictKind::WrongTarget,
                    });
                }
            }
        }

        if clashes.is_empty() {
            Ok(claims)
        } else {
            Err(Error::aggregate(clashes))
        }
    }

    fn claim_node(
        &self,
        idx: usize,
        node: &Node,
        parent_target: &TargetPath,
        claims: &mut Claims,
        clashes: &mut Vec<Error>,
    ) {
        let name = translate_component(node.path.file_name().unwrap_or_default());
        let target = parent_target.join(&name);
        if node.is_leaf() {
            let key = target.as_path().to_owned();
            if let Some(other) = claims.leaf_owner.get(&key) {
                if *other != idx {
                    clashes.push(Error::Conflict {
                        target: key.clone(),
                        kind: ConflictKind::WrongTarget,
                    });
                }
            }
            claims.leaf_owner.insert(key, idx);
            // Register every ancestor directory up to the target root.
            let mut ancestor = target.parent();
            while let Some(dir) = ancestor {
                if dir == self.ctx.target_dir || !dir.starts_with(&self.ctx.target_dir) {
                    break;
                }
                claims
                    .contributors
                    .entry(dir.as_path().to_owned())
                    .or_default()
                    .insert(idx);
                ancestor = dir.parent();
            }
        } else {
            for child in &node.children {
                self.claim_node(idx, child, &target, claims, clashes);
            }
        }
    }
}

impl<'a> PlanBuilder<'a> {
    fn new(ctx: &'a AppContext, assume_absent: &'a HashSet<TargetPath>) -> Self {
        Self {
            ctx,
            assume_absent,
            next_id: 1,
            ops: Vec::new(),
            sim: HashMap::new(),
            fatal_conflicts: Vec::new(),
            resolved_conflicts: 0,
            warnings: Vec::new(),
            package_operations: BTreeMap::new(),
            current_package: None,
            links: BTreeMap::new(),
            backups: BTreeMap::new(),
            foreign_links: BTreeMap::new(),
            foreign_removed: BTreeMap::new(),
            backup_stamp: chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string(),
        }
    }

    fn begin_package(&mut self, name: &str) {
        self.current_package = Some(name.to_string());
        self.package_operations.entry(name.to_string()).or_default();
        self.links.entry(name.to_string()).or_default();
    }

    fn push(&mut self, kind: OpKind) -> OperationId {
        match &kind {
            OpKind::LinkCreate { source, target } => {
                self.sim.insert(
                    target.as_path().to_owned(),
                    SimEntry::Created(FsType::Symlink, Some(source.as_path().to_owned())),
                );
            }
            OpKind::LinkDelete { target } => {
                self.sim
                    .insert(target.as_path().to_owned(), SimEntry::Removed);
            }
            OpKind::DirCreate { path } => {
                self.sim.insert(
                    path.as_path().to_owned(),
                    SimEntry::Created(FsType::Dir, None),
                );
            }
            OpKind::DirDelete { path } | OpKind::DirRemoveAll { path } => {
                self.sim.insert(path.as_path().to_owned(), SimEntry::Removed);
            }
            OpKind::FileMove { from, to } => {
                self.sim.insert(from.as_path().to_owned(), SimEntry::Removed);
                self.sim.insert(
                    to.as_path().to_owned(),
                    SimEntry::Created(FsType::File, None),
                );
            }
            OpKind::FileBackup { backup, .. } => {
                self.sim.insert(
                    backup.as_path().to_owned(),
                    SimEntry::Created(FsType::File, None),
                );
            }
            OpKind::FileDelete { path } => {
                self.sim.insert(path.as_path().to_owned(), SimEntry::Removed);
            }
            OpKind::DirCopy { to, .. } => {
                self.sim.insert(
                    to.as_path().to_owned(),
                    SimEntry::Created(FsType::Dir, None),
                );
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        self.ops.push(Operation::new(id, kind));
        if let Some(pkg) = &self.current_package {
            self.package_operations
                .entry(pkg.clone())
                .or_default()
                .push(id);
        }
        id
    }

    /// What `path` will be once preceding operations have run: the in-plan
    /// simulation wins over the live filesystem.
    fn effective(&self, path: &Utf8Path) -> Option<(FsType, Option<Utf8PathBuf>)> {
        if let Some(entry) = self.sim.get(path) {
            return match entry {
                SimEntry::Created(kind, dest) => Some((*kind, dest.clone())),
                SimEntry::Removed => None,
            };
        }
        if self
            .assume_absent
            .iter()
            .any(|absent| absent.as_path() == path)
        {
            return None;
        }
        let kind = fs_utils::entry_type(path)?;
        let dest = if kind == FsType::Symlink {
            fs_utils::read_link_raw(path)
        } else {
            None
        };
        Some((kind, dest))
    }

    fn record_link(&mut self, target: &TargetPath) {
        if let Some(pkg) = &self.current_package {
            self.links
                .entry(pkg.clone())
                .or_default()
                .push(target.clone());
        }
    }

    fn backup_path_for(&self, target: &TargetPath) -> FilePath {
        let rel = target
            .strip_prefix(&self.ctx.target_dir)
            .map(Utf8Path::to_owned)
            .unwrap_or_else(|| Utf8PathBuf::from(target.file_name().unwrap_or("entry")));
        self.ctx
            .backup_dir
            .join(&self.backup_stamp)
            .join(rel)
    }

    fn plan_node(
        &mut self,
        idx: usize,
        node: &Node,
        parent_target: &TargetPath,
        claims: &Claims,
    ) -> Result<()> {
        let name = translate_component(node.path.file_name().unwrap_or_default());
        let target = parent_target.join(&name);
        if node.is_leaf() {
            self.plan_leaf(node, &target)
        } else {
            self.plan_dir(idx, node, &target, claims)
        }
    }

    fn plan_dir(
        &mut self,
        idx: usize,
        node: &Node,
        target: &TargetPath,
        claims: &Claims,
    ) -> Result<()> {
        if !node_has_leaves(node) {
            return Ok(());
        }

        let foldable = self.ctx.folding && claims.sole_contributor(target) == Some(idx);

        match self.effective(target.as_path()) {
            None => {
                if foldable {
                    self.record_link(target);
                    self.push(OpKind::LinkCreate {
                        source: node.path.as_file(),
                        target: target.clone(),
                    });
                    Ok(())
                } else {
                    self.push(OpKind::DirCreate {
                        path: target.as_file(),
                    });
                    self.descend(idx, node, target, claims)
                }
            }
            Some((FsType::Dir, _)) => self.descend(idx, node, target, claims),
            Some((FsType::Symlink, dest)) => {
                let dest = dest.unwrap_or_default();
                if dest == *node.path.as_path() {
                    // Already folded onto this package.
                    self.record_link(target);
                    return Ok(());
                }
                if dest.starts_with(self.ctx.package_dir.as_path()) {
                    debug!(%target, %dest, "unfolding directory link");
                    self.unfold(idx, node, target, &dest, claims)
                } else {
                    if self.resolve_conflict(target, ConflictKind::WrongTarget, FsType::Symlink) {
                        self.materialize_dir(idx, node, target, foldable, claims)?;
                    }
                    Ok(())
                }
            }
            Some((FsType::File, _)) => {
                // A regular file sits where this package wants a directory.
                if self.resolve_conflict(target, ConflictKind::RegularFile, FsType::File) {
                    self.materialize_dir(idx, node, target, foldable, claims)?;
                }
                Ok(())
            }
        }
    }

    /// After a conflicting entry was cleared away, place the directory
    /// either as a fold link or as a real directory.
    fn materialize_dir(
        &mut self,
        idx: usize,
        node: &Node,
        target: &TargetPath,
        foldable: bool,
        claims: &Claims,
    ) -> Result<()> {
        if foldable {
            self.record_link(target);
            self.push(OpKind::LinkCreate {
                source: node.path.as_file(),
                target: target.clone(),
            });
            Ok(())
        } else {
            self.push(OpKind::DirCreate {
                path: target.as_file(),
            });
            self.descend(idx, node, target, claims)
        }
    }

    fn descend(
        &mut self,
        idx: usize,
        node: &Node,
        target: &TargetPath,
        claims: &Claims,
    ) -> Result<()> {
        for child in &node.children {
            self.plan_node(idx, child, target, claims)?;
        }
        Ok(())
    }

    fn plan_leaf(&mut self, node: &Node, target: &TargetPath) -> Result<()> {
        match self.effective(target.as_path()) {
            None => {
                self.record_link(target);
                self.push(OpKind::LinkCreate {
                    source: node.path.as_file(),
                    target: target.clone(),
                });
            }
            Some((FsType::Symlink, dest)) => {
                if dest.as_deref() == Some(node.path.as_path()) {
                    // Idempotent: the link is already correct.
                    self.record_link(target);
                } else if self.resolve_conflict(target, ConflictKind::WrongTarget, FsType::Symlink)
                {
                    self.record_link(target);
                    self.push(OpKind::LinkCreate {
                        source: node.path.as_file(),
                        target: target.clone(),
                    });
                }
            }
            Some((FsType::File, _)) => {
                if self.resolve_conflict(target, ConflictKind::RegularFile, FsType::File) {
                    self.record_link(target);
                    self.push(OpKind::LinkCreate {
                        source: node.path.as_file(),
                        target: target.clone(),
                    });
                }
            }
            Some((FsType::Dir, _)) => {
                if self.resolve_conflict(target, ConflictKind::Directory, FsType::Dir) {
                    self.record_link(target);
                    self.push(OpKind::LinkCreate {
                        source: node.path.as_file(),
                        target: target.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Apply the conflict policy to an existing entry at `target`. Returns
    /// true when the caller may proceed to create its link.
    fn resolve_conflict(
        &mut self,
        target: &TargetPath,
        kind: ConflictKind,
        existing: FsType,
    ) -> bool {
        match self.ctx.policy {
            ConflictPolicy::Fail => {
                self.fatal_conflicts.push(Error::Conflict {
                    target: target.as_path().to_owned(),
                    kind,
                });
                false
            }
            ConflictPolicy::Skip => {
                self.warnings
                    .push(format!("skipped {target}: {kind}"));
                self.resolved_conflicts += 1;
                false
            }
            ConflictPolicy::Overwrite => {
                self.resolved_conflicts += 1;
                match existing {
                    FsType::Dir => {
                        self.push(OpKind::DirRemoveAll {
                            path: target.as_file(),
                        });
                    }
                    FsType::File | FsType::Symlink => {
                        self.push(OpKind::FileDelete {
                            path: target.as_file(),
                        });
                    }
                }
                true
            }
            ConflictPolicy::Backup => {
                self.resolved_conflicts += 1;
                let backup = self.backup_path_for(target);
                match existing {
                    FsType::Dir => {
                        self.push(OpKind::DirCopy {
                            from: target.as_file(),
                            to: backup.clone(),
                        });
                        self.push(OpKind::DirRemoveAll {
                            path: target.as_file(),
                        });
                        self.note_backup(target, &backup);
                    }
                    FsType::File => {
                        self.push(OpKind::FileBackup {
                            source: target.as_file(),
                            backup: backup.clone(),
                        });
                        self.push(OpKind::FileDelete {
                            path: target.as_file(),
                        });
                        self.note_backup(target, &backup);
                    }
                    // A symlink carries no content of its own; replacing it
                    // is enough.
                    FsType::Symlink => {
                        self.push(OpKind::FileDelete {
                            path: target.as_file(),
                        });
                    }
                }
                true
            }
        }
    }

    fn note_backup(&mut self, target: &TargetPath, backup: &FilePath) {
        if let Some(pkg) = &self.current_package {
            self.backups
                .entry(pkg.clone())
                .or_default()
                .push((target.clone(), backup.clone()));
        }
    }

    /// Replace a folded directory link with a real directory carrying
    /// per-leaf links for both the on-disk owner and the current package.
    fn unfold(
        &mut self,
        idx: usize,
        node: &Node,
        target: &TargetPath,
        folded_source: &Utf8Path,
        claims: &Claims,
    ) -> Result<()> {
        let owner = self.foreign_package_name(folded_source);
        if let Some(owner) = &owner {
            self.foreign_removed
                .entry(owner.clone())
                .or_default()
                .push(target.clone());
        }
        self.push(OpKind::LinkDelete {
            target: target.clone(),
        });
        self.push(OpKind::DirCreate {
            path: target.as_file(),
        });
        self.merge_children(idx, Some(node), target, folded_source, owner.as_deref(), claims)
    }

    /// Merge the children of an on-disk package directory with the current
    /// package's children of the same target directory.
    fn merge_children(
        &mut self,
        idx: usize,
        our_node: Option<&Node>,
        target: &TargetPath,
        foreign_dir: &Utf8Path,
        foreign_owner: Option<&str>,
        claims: &Claims,
    ) -> Result<()> {
        let mut ours: BTreeMap<String, &Node> = BTreeMap::new();
        if let Some(node) = our_node {
            for child in &node.children {
                let name = translate_component(child.path.file_name().unwrap_or_default());
                ours.insert(name, child);
            }
        }

        let mut foreign: BTreeMap<String, Utf8PathBuf> = BTreeMap::new();
        let entries = std::fs::read_dir(foreign_dir)
            .map_err(|e| Error::io("readdir", foreign_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("readdir", foreign_dir, e))?;
            if let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) {
                if let Some(name) = path.file_name() {
                    foreign.insert(translate_component(name), path.clone());
                }
            }
        }

        let names: BTreeSet<String> = ours.keys().chain(foreign.keys()).cloned().collect();
        for name in names {
            let child_target = target.join(&name);
            match (foreign.get(&name), ours.get(&name).copied()) {
                (Some(foreign_path), None) => {
                    self.push(OpKind::LinkCreate {
                        source: FilePath::new(foreign_path.clone())?,
                        target: child_target.clone(),
                    });
                    if let Some(owner) = foreign_owner {
                        self.foreign_links
                            .entry(owner.to_string())
                            .or_default()
                            .push(child_target);
                    }
                }
                (None, Some(child)) => {
                    self.plan_node(idx, child, target, claims)?;
                }
                (Some(foreign_path), Some(child)) => {
                    let both_dirs = fs_utils::entry_type(foreign_path) == Some(FsType::Dir)
                        && !child.is_leaf();
                    if both_dirs {
                        self.push(OpKind::DirCreate {
                            path: child_target.as_file(),
                        });
                        self.merge_children(
                            idx,
                            Some(child),
                            &child_target,
                            foreign_path,
                            foreign_owner,
                            claims,
                        )?;
                    } else {
                        // Two packages want the same entry with different
                        // shapes; no policy can resolve that.
                        self.fatal_conflicts.push(Error::Conflict {
                            target: child_target.as_path().to_owned(),
                            kind: ConflictKind::WrongTarget,
                        });
                    }
                }
                (None, None) => unreachable!("name came from one of the two maps"),
            }
        }
        Ok(())
    }

    fn foreign_package_name(&self, source: &Utf8Path) -> Option<String> {
        source
            .strip_prefix(self.ctx.package_dir.as_path())
            .ok()
            .and_then(|rel| rel.components().next())
            .map(|c| c.as_str().to_string())
    }

    /// Create any missing package-side directories from the package root
    /// down to `until` (inclusive).
    fn ensure_package_dirs(&mut self, root: &PackagePath, until: Option<&PackagePath>) {
        let mut chain = Vec::new();
        if let Some(until) = until {
            let mut current = Some(until.clone());
            while let Some(dir) = current {
                let done = dir == *root;
                chain.push(dir.clone());
                if done || !dir.starts_with(root) {
                    break;
                }
                current = dir.parent();
            }
        } else {
            chain.push(root.clone());
        }
        for dir in chain.into_iter().rev() {
            if self.effective(dir.as_path()).is_none() {
                self.push(OpKind::DirCreate {
                    path: dir.as_file(),
                });
            }
        }
    }

    /// Plan flattening one adopted directory: mirror its structure inside
    /// the package, move every file, then delete the old directories
    /// deepest-first.
    fn adopt_dir(&mut self, dir: &TargetPath, dest_root: &PackagePath) -> Result<()> {
        let mut dirs_to_delete = Vec::new();
        self.adopt_dir_inner(dir, dest_root, &mut dirs_to_delete)?;
        dirs_to_delete.push(dir.clone());
        // Deepest first so every directory is empty by the time it goes.
        dirs_to_delete.sort_by_key(|d| std::cmp::Reverse(d.as_str().len()));
        for dir in dirs_to_delete {
            self.push(OpKind::DirDelete {
                path: dir.as_file(),
            });
        }
        Ok(())
    }

    fn adopt_dir_inner(
        &mut self,
        dir: &TargetPath,
        dest: &PackagePath,
        dirs_to_delete: &mut Vec<TargetPath>,
    ) -> Result<()> {
        let entries = std::fs::read_dir(dir.as_path())
            .map_err(|e| Error::io("readdir", dir.as_path(), e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("readdir", dir.as_path(), e))?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();

        for name in names {
            let src = dir.join(&name);
            let dst = dest.join(untranslate_component(&name));
            match fs_utils::entry_type(src.as_path()) {
                Some(FsType::Dir) => {
                    if self.effective(dst.as_path()).is_none() {
                        self.push(OpKind::DirCreate {
                            path: dst.as_file(),
                        });
                    }
                    self.adopt_dir_inner(&src, &dst, dirs_to_delete)?;
                    dirs_to_delete.push(src);
                }
                Some(_) => {
                    self.push(OpKind::FileMove {
                        from: src,
                        to: dst.as_file(),
                    });
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Build the dependency graph, order the operations, compute batches
    /// and wrap everything into a `Plan`.
    fn assemble(&mut self, package_count: usize) -> Result<Plan> {
        let ops = std::mem::take(&mut self.ops);
        let (operations, batches) = order_and_batch(ops)?;

        let link_count = operations
            .iter()
            .filter(|op| matches!(op.kind, OpKind::LinkCreate { .. }))
            .count();
        let dir_count = operations
            .iter()
            .filter(|op| matches!(op.kind, OpKind::DirCreate { .. }))
            .count();

        let metadata = PlanMetadata {
            package_count,
            operation_count: operations.len(),
            link_count,
            dir_count,
            conflicts: self.resolved_conflicts,
            warnings: std::mem::take(&mut self.warnings),
        };

        Ok(Plan {
            operations,
            batches,
            metadata,
            package_operations: std::mem::take(&mut self.package_operations),
        })
    }
}

fn node_has_leaves(node: &Node) -> bool {
    if node.is_leaf() {
        return true;
    }
    node.children.iter().any(node_has_leaves)
}

/// Paths an operation creates, removes and reads, for edge construction.
fn classify(op: &OpKind) -> (Vec<&Utf8Path>, Vec<&Utf8Path>, Vec<&Utf8Path>) {
    match op {
        OpKind::LinkCreate { source, target } => {
            (vec![target.as_path()], vec![], vec![source.as_path()])
        }
        OpKind::LinkDelete { target } => (vec![], vec![target.as_path()], vec![]),
        OpKind::DirCreate { path } => (vec![path.as_path()], vec![], vec![]),
        OpKind::DirDelete { path } | OpKind::DirRemoveAll { path } => {
            (vec![], vec![path.as_path()], vec![])
        }
        OpKind::FileMove { from, to } => (
            vec![to.as_path()],
            vec![from.as_path()],
            vec![from.as_path()],
        ),
        OpKind::FileBackup { source, backup } => {
            (vec![backup.as_path()], vec![], vec![source.as_path()])
        }
        OpKind::FileDelete { path } => (vec![], vec![path.as_path()], vec![]),
        OpKind::DirCopy { from, to } => (vec![to.as_path()], vec![], vec![from.as_path()]),
    }
}

/// Dependency edges, Kahn's algorithm with deterministic id tie-breaking,
/// then maximal-antichain batches over the same graph.
fn order_and_batch(ops: Vec<Operation>) -> Result<(Vec<Operation>, Vec<Vec<OperationId>>)> {
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;

    let n = ops.len();
    let mut creates: HashMap<&Utf8Path, Vec<usize>> = HashMap::new();
    let mut removes: HashMap<&Utf8Path, Vec<usize>> = HashMap::new();
    let mut reads: HashMap<&Utf8Path, Vec<usize>> = HashMap::new();
    let mut dir_creates: HashMap<&Utf8Path, usize> = HashMap::new();
    let mut dir_removes: Vec<(usize, &Utf8Path)> = Vec::new();

    for (i, op) in ops.iter().enumerate() {
        let (c, r, rd) = classify(&op.kind);
        for path in c {
            creates.entry(path).or_default().push(i);
            if matches!(op.kind, OpKind::DirCreate { .. }) {
                dir_creates.insert(path, i);
            }
        }
        for path in r {
            removes.entry(path).or_default().push(i);
            if matches!(op.kind, OpKind::DirDelete { .. } | OpKind::DirRemoveAll { .. }) {
                dir_removes.push((i, path));
            }
        }
        for path in rd {
            reads.entry(path).or_default().push(i);
        }
    }

    let mut edges: HashSet<(usize, usize)> = HashSet::new();

    // Same-path ordering: with a removal present it is read, then remove,
    // then create (backup before delete before link). Without one, the
    // creation comes first and readers follow (adopt moves a file into the
    // package before linking at it).
    let mut paths: HashSet<&Utf8Path> = HashSet::new();
    paths.extend(creates.keys());
    paths.extend(removes.keys());
    paths.extend(reads.keys());
    for path in paths {
        let c = creates.get(path).cloned().unwrap_or_default();
        let r = removes.get(path).cloned().unwrap_or_default();
        let rd = reads.get(path).cloned().unwrap_or_default();
        if !r.is_empty() {
            for &reader in &rd {
                for &remover in &r {
                    if reader != remover {
                        edges.insert((reader, remover));
                    }
                }
            }
            for &remover in &r {
                for &creator in &c {
                    edges.insert((remover, creator));
                }
            }
        } else {
            for &creator in &c {
                for &reader in &rd {
                    if creator != reader {
                        edges.insert((creator, reader));
                    }
                }
            }
        }
    }

    // A directory creation precedes every operation on a path inside it.
    for (i, op) in ops.iter().enumerate() {
        let (c, _, rd) = classify(&op.kind);
        for path in c.into_iter().chain(rd) {
            let mut ancestor = path.parent();
            while let Some(dir) = ancestor {
                if let Some(&creator) = dir_creates.get(dir) {
                    if creator != i {
                        edges.insert((creator, i));
                    }
                }
                ancestor = dir.parent();
            }
        }
    }

    // Deleting a child precedes deleting its parent.
    for &(i, parent) in &dir_removes {
        for (path, ids) in &removes {
            if *path != parent && path.starts_with(parent) {
                for &j in ids {
                    if j != i {
                        edges.insert((j, i));
                    }
                }
            }
        }
    }

    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];
    for &(u, v) in &edges {
        adjacency[u].push(v);
        indegree[v] += 1;
    }

    // Kahn with a min-heap on operation id for deterministic tie-breaking.
    let mut heap: BinaryHeap<Reverse<(OperationId, usize)>> = BinaryHeap::new();
    let mut remaining = indegree.clone();
    for (i, &deg) in remaining.iter().enumerate() {
        if deg == 0 {
            heap.push(Reverse((ops[i].id, i)));
        }
    }
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse((_, i))) = heap.pop() {
        order.push(i);
        for &j in &adjacency[i] {
            remaining[j] -= 1;
            if remaining[j] == 0 {
                heap.push(Reverse((ops[j].id, j)));
            }
        }
    }
    if order.len() < n {
        let cycle: Vec<OperationId> = (0..n)
            .filter(|i| remaining[*i] > 0)
            .map(|i| ops[i].id)
            .collect();
        return Err(Error::CyclicDependency { cycle });
    }

    // Maximal antichains: every operation whose remaining in-degree is zero
    // forms the next batch.
    let mut remaining = indegree;
    let mut pending: BTreeSet<usize> = (0..n).collect();
    let mut batches = Vec::new();
    while !pending.is_empty() {
        let batch: Vec<usize> = pending
            .iter()
            .copied()
            .filter(|&i| remaining[i] == 0)
            .collect();
        debug_assert!(!batch.is_empty(), "acyclic graph always has a frontier");
        for &i in &batch {
            pending.remove(&i);
            for &j in &adjacency[i] {
                remaining[j] -= 1;
            }
        }
        batches.push(batch.iter().map(|&i| ops[i].id).collect());
    }

    let ordered: Vec<Operation> = order.iter().map(|&i| ops[i].clone()).collect();
    Ok((ordered, batches))
}
