//! Services: one function per user-visible operation.
//!
//! Each service composes scanner, planner, executor, manifest and doctor
//! into a single transaction-like flow and renders the outcome. Low-level
//! error kinds are translated into messages with a suggestion where one
//! exists.

use std::collections::{BTreeMap, HashSet};

use anyhow::Context;
use camino::Utf8PathBuf;
use colored::Colorize;
use pluralizer::pluralize;
use tracing::warn;

use crate::bootstrap::Bootstrap;
use crate::context::AppContext;
use crate::doctor::{self, Doctor, DoctorConfig, Severity, TriageMode};
use crate::error::Error;
use crate::executor::Executor;
use crate::fs_utils;
use crate::manifest::{Manifest, PackageSource};
use crate::paths::{FilePath, TargetPath};
use crate::planner::{AdoptRequest, ManageBlueprint, Plan, Planner, UnmanageItem};
use crate::scanner::{discover_packages, Package, PackageTree, Scanner};

#[derive(Debug, Clone, Copy, Default)]
pub struct UnmanageOptions {
    pub restore: bool,
    pub purge: bool,
    pub cleanup: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatusOptions {
    pub verify: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DoctorOptions {
    pub config: DoctorConfig,
    pub fix: bool,
    pub triage: Option<TriageMode>,
}

/// Attach a user-facing suggestion to a core error where one exists.
fn with_hint(err: Error) -> anyhow::Error {
    let hint = match &err {
        Error::Conflict { .. } => {
            Some("an existing entry is in the way; retry with --on-conflict backup, or adopt it")
        }
        Error::PackageNotFound { .. } => Some("run `dot status` to see installed packages"),
        Error::SourceNotFound { .. } => Some("check the package directory for the missing entry"),
        Error::ReservedPackageName { .. } => {
            Some("that name is reserved for the tool's own bookkeeping")
        }
        _ => None,
    };
    match hint {
        Some(hint) => anyhow::Error::new(err).context(format!("hint: {hint}")),
        None => err.into(),
    }
}

/// Resolve the requested package names, filtering reserved names with a
/// warning and refusing names with no directory behind them.
fn resolve_packages(ctx: &AppContext, names: &[String]) -> anyhow::Result<Vec<Package>> {
    if names.is_empty() {
        return discover_packages(&ctx.package_dir).map_err(with_hint);
    }
    let mut packages = Vec::new();
    for name in names {
        match Package::new(name.clone(), &ctx.package_dir) {
            Ok(package) => {
                if !package.root.as_path().as_std_path().is_dir() {
                    return Err(with_hint(Error::PackageNotFound { name: name.clone() }));
                }
                packages.push(package);
            }
            Err(Error::ReservedPackageName { name }) => {
                warn!(%name, "reserved package name requested");
                println!(
                    "{} {} is a reserved name, skipping",
                    "[!]".yellow().bold(),
                    name
                );
            }
            Err(e) => return Err(with_hint(e)),
        }
    }
    Ok(packages)
}

fn scan_all(ctx: &AppContext, packages: &[Package]) -> anyhow::Result<Vec<PackageTree>> {
    let scanner = Scanner::new(&ctx.scan);
    let mut trees = Vec::new();
    for package in packages {
        ctx.cancel.check().map_err(with_hint)?;
        let tree = scanner.scan_package(package).map_err(with_hint)?;
        for warning in &tree.warnings {
            println!("{} {}", "[!]".yellow().bold(), warning);
        }
        trees.push(tree);
    }
    Ok(trees)
}

fn print_plan(plan: &Plan) {
    for op in &plan.operations {
        println!("  {} {}", "[·]".dimmed(), op.describe());
    }
}

fn print_summary(plan: &Plan) {
    let meta = &plan.metadata;
    if meta.link_count > 0 {
        println!(
            "  {} {} created",
            "[+]".green().bold(),
            pluralize("link", meta.link_count as isize, true)
        );
    }
    if meta.dir_count > 0 {
        println!(
            "  {} {} created",
            "[+]".green().bold(),
            pluralize("directory", meta.dir_count as isize, true)
        );
    }
    if meta.conflicts > 0 {
        println!(
            "  {} {} resolved",
            "[~]".yellow().bold(),
            pluralize("conflict", meta.conflicts as isize, true)
        );
    }
    for warning in &meta.warnings {
        println!("  {} {}", "[!]".yellow().bold(), warning);
    }
}

/// Record a manage blueprint's outcome in the manifest and save it.
fn commit_manifest(
    ctx: &AppContext,
    manifest: &mut Manifest,
    trees: &[PackageTree],
    blueprint: &ManageBlueprint,
) -> anyhow::Result<()> {
    for tree in trees {
        let name = &tree.package.name;
        let mut links: Vec<String> = blueprint
            .links
            .get(name)
            .map(|links| {
                links
                    .iter()
                    .map(|l| Manifest::rel_link(&ctx.target_dir, l))
                    .collect()
            })
            .unwrap_or_default();
        links.sort();
        links.dedup();

        let backups: BTreeMap<String, String> = blueprint
            .backups
            .get(name)
            .map(|pairs| {
                pairs
                    .iter()
                    .map(|(target, backup)| {
                        (
                            Manifest::rel_link(&ctx.target_dir, target),
                            backup.as_str().to_string(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        let hash = crate::manifest::package_content_hash(tree).map_err(with_hint)?;
        manifest.record_managed(
            name,
            links,
            backups,
            hash,
            &ctx.target_dir,
            ctx.package_dir.as_path().to_owned(),
        );
    }

    // Unfolding rewires links that belong to packages outside this run;
    // keep their records truthful.
    for (name, removed) in &blueprint.foreign_removed {
        if let Some(record) = manifest.packages.get_mut(name) {
            for target in removed {
                let rel = Manifest::rel_link(&ctx.target_dir, target);
                record.links.retain(|l| *l != rel);
            }
            record.link_count = record.links.len();
        }
    }
    for (name, added) in &blueprint.foreign_links {
        if let Some(record) = manifest.packages.get_mut(name) {
            for target in added {
                let rel = Manifest::rel_link(&ctx.target_dir, target);
                if !record.links.contains(&rel) {
                    record.links.push(rel);
                }
            }
            record.links.sort();
            record.link_count = record.links.len();
        }
    }

    manifest.save(&ctx.target_dir).map_err(with_hint)
}

/// Install links for the given packages (all packages when none named).
pub fn manage(ctx: &AppContext, names: &[String]) -> anyhow::Result<()> {
    let packages = resolve_packages(ctx, names)?;
    if packages.is_empty() {
        println!("{} no packages to manage", "[·]".dimmed());
        return Ok(());
    }
    let trees = scan_all(ctx, &packages)?;
    let blueprint = Planner::new(ctx)
        .plan_manage(&trees, &HashSet::new())
        .map_err(with_hint)?;

    if ctx.dry_run {
        print_plan(&blueprint.plan);
        println!("\n{}", "[DRY RUN] No changes were made".yellow().bold());
        return Ok(());
    }

    if blueprint.plan.is_empty() {
        println!(
            "{} all {} already up to date",
            "✓".green().bold(),
            pluralize("package", packages.len() as isize, true)
        );
    } else {
        Executor::new(ctx)
            .execute(&blueprint.plan)
            .map_err(with_hint)?;
        print_summary(&blueprint.plan);
    }

    let mut manifest = Manifest::load(&ctx.target_dir).map_err(with_hint)?;
    commit_manifest(ctx, &mut manifest, &trees, &blueprint)?;
    println!(
        "\n{} managed {}",
        "✓".green().bold(),
        pluralize("package", trees.len() as isize, true)
    );
    Ok(())
}

/// Remove the links of installed packages.
pub fn unmanage(
    ctx: &AppContext,
    names: &[String],
    options: UnmanageOptions,
) -> anyhow::Result<()> {
    let mut manifest = Manifest::load(&ctx.target_dir).map_err(with_hint)?;
    let names: Vec<String> = if names.is_empty() {
        manifest.packages.keys().cloned().collect()
    } else {
        names.to_vec()
    };

    let mut items = Vec::new();
    let mut removed_parents: Vec<Utf8PathBuf> = Vec::new();
    for name in &names {
        let record = manifest
            .packages
            .get(name)
            .ok_or_else(|| with_hint(Error::PackageNotFound { name: name.clone() }))?;

        let links: Vec<TargetPath> = record
            .links
            .iter()
            .map(|rel| ctx.target_dir.join(rel))
            .collect();

        if options.cleanup
            && links
                .iter()
                .all(|l| fs_utils::entry_type(l.as_path()).is_none())
        {
            println!(
                "{} {} has no links on disk, dropping its record",
                "[·]".dimmed(),
                name
            );
            if !ctx.dry_run {
                manifest.remove_package(name);
            }
            continue;
        }

        for link in &links {
            if let Some(parent) = link.parent() {
                removed_parents.push(parent.as_path().to_owned());
            }
        }
        let restores = if options.restore {
            record
                .backups
                .iter()
                .filter_map(|(rel, backup)| {
                    let original = ctx.target_dir.join(rel);
                    FilePath::new(Utf8PathBuf::from(backup.clone()))
                        .ok()
                        .map(|b| (b, original))
                })
                .collect()
        } else {
            Vec::new()
        };
        let purge_root = if options.purge {
            FilePath::new(record.package_dir.join(name)).ok()
        } else {
            None
        };
        items.push(UnmanageItem {
            package: name.clone(),
            links,
            restores,
            purge_root,
        });
    }

    if items.is_empty() {
        if ctx.dry_run {
            println!("\n{}", "[DRY RUN] No changes were made".yellow().bold());
        } else {
            manifest.save(&ctx.target_dir).map_err(with_hint)?;
        }
        return Ok(());
    }

    let plan = Planner::new(ctx).plan_unmanage(&items).map_err(with_hint)?;
    if ctx.dry_run {
        print_plan(&plan);
        println!("\n{}", "[DRY RUN] No changes were made".yellow().bold());
        return Ok(());
    }
    if !plan.is_empty() {
        Executor::new(ctx).execute(&plan).map_err(with_hint)?;
    }
    for warning in &plan.metadata.warnings {
        println!("  {} {}", "[!]".yellow().bold(), warning);
    }

    // Directories that only hosted our links are left empty; sweep them.
    for parent in removed_parents {
        fs_utils::prune_empty_dirs(&parent, ctx.target_dir.as_path());
    }

    for item in &items {
        manifest.remove_package(&item.package);
    }
    manifest.save(&ctx.target_dir).map_err(with_hint)?;
    println!(
        "\n{} unmanaged {}",
        "✓".green().bold(),
        pluralize("package", items.len() as isize, true)
    );
    Ok(())
}

/// Re-sync packages whose content changed; unchanged packages are no-ops.
pub fn remanage(ctx: &AppContext, names: &[String]) -> anyhow::Result<()> {
    let mut manifest = Manifest::load(&ctx.target_dir).map_err(with_hint)?;
    let names: Vec<String> = if names.is_empty() {
        manifest.packages.keys().cloned().collect()
    } else {
        names.to_vec()
    };

    for name in &names {
        ctx.cancel.check().map_err(with_hint)?;
        let Some(record) = manifest.packages.get(name).cloned() else {
            // Never installed: remanage degrades to manage.
            manage(ctx, std::slice::from_ref(name))?;
            continue;
        };

        match record.source {
            PackageSource::Adopted => {
                remanage_adopted(ctx, &mut manifest, name)?;
                continue;
            }
            PackageSource::Managed => {}
        }

        let package = Package::new(name.clone(), &ctx.package_dir).map_err(with_hint)?;
        let tree = Scanner::new(&ctx.scan)
            .scan_package(&package)
            .map_err(with_hint)?;
        let hash = crate::manifest::package_content_hash(&tree).map_err(with_hint)?;

        let links_healthy = record.links.iter().all(|rel| {
            let link = ctx.target_dir.join(rel);
            fs_utils::entry_type(link.as_path()) == Some(fs_utils::FsType::Symlink)
                && !fs_utils::is_broken_symlink(link.as_path())
                && fs_utils::read_link_raw(link.as_path())
                    .map(|dest| dest.starts_with(package.root.as_path()))
                    .unwrap_or(false)
        });

        if manifest.hashes.get(name) == Some(&hash) && links_healthy {
            println!("{} {} unchanged", "[·]".dimmed(), name);
            continue;
        }

        // Content or layout drifted: plan the teardown and the fresh
        // manage against the same pre-state, dropping the still-present
        // links from consideration, then run teardown first.
        let old_links: Vec<TargetPath> = record
            .links
            .iter()
            .map(|rel| ctx.target_dir.join(rel))
            .collect();
        let items = vec![UnmanageItem {
            package: name.clone(),
            links: old_links.clone(),
            restores: Vec::new(),
            purge_root: None,
        }];
        let down = Planner::new(ctx).plan_unmanage(&items).map_err(with_hint)?;

        let assume_absent: HashSet<TargetPath> = old_links.into_iter().collect();
        let trees = vec![tree];
        let blueprint = Planner::new(ctx)
            .plan_manage(&trees, &assume_absent)
            .map_err(with_hint)?;

        if ctx.dry_run {
            print_plan(&down);
            print_plan(&blueprint.plan);
            continue;
        }
        if !down.is_empty() {
            Executor::new(ctx).execute(&down).map_err(with_hint)?;
        }
        if !blueprint.plan.is_empty() {
            Executor::new(ctx)
                .execute(&blueprint.plan)
                .map_err(with_hint)?;
        }
        commit_manifest(ctx, &mut manifest, &trees, &blueprint)?;
        println!("{} {} re-synced", "[~]".yellow().bold(), name);
    }

    if ctx.dry_run {
        println!("\n{}", "[DRY RUN] No changes were made".yellow().bold());
    }
    Ok(())
}

/// An adopted package owns exactly one root link; recreate it if needed.
fn remanage_adopted(
    ctx: &AppContext,
    manifest: &mut Manifest,
    name: &str,
) -> anyhow::Result<()> {
    let Some(record) = manifest.packages.get(name) else {
        return Ok(());
    };
    let package_root = ctx.package_dir.join(name);
    let mut ops = Vec::new();
    for rel in &record.links {
        let link = ctx.target_dir.join(rel);
        match fs_utils::read_link_raw(link.as_path()) {
            Some(dest) if dest.starts_with(package_root.as_path()) => {}
            Some(_) => {
                ops.push(crate::ops::OpKind::LinkDelete {
                    target: link.clone(),
                });
                ops.push(crate::ops::OpKind::LinkCreate {
                    source: package_root.clone(),
                    target: link,
                });
            }
            None if fs_utils::entry_type(link.as_path()).is_none() => {
                ops.push(crate::ops::OpKind::LinkCreate {
                    source: package_root.clone(),
                    target: link,
                });
            }
            None => {
                println!(
                    "{} {} is occupied by a real entry, not touching it",
                    "[!]".yellow().bold(),
                    link
                );
            }
        }
    }
    if ops.is_empty() {
        println!("{} {} unchanged", "[·]".dimmed(), name);
        return Ok(());
    }
    let operations: Vec<crate::ops::Operation> = ops
        .into_iter()
        .enumerate()
        .map(|(i, kind)| crate::ops::Operation::new(i as u64 + 1, kind))
        .collect();
    let plan = Plan {
        operations,
        ..Plan::default()
    };
    if ctx.dry_run {
        print_plan(&plan);
        return Ok(());
    }
    Executor::new(ctx).execute(&plan).map_err(with_hint)?;
    println!("{} {} root link restored", "[~]".yellow().bold(), name);
    Ok(())
}

/// Move existing target entries into a package and link them back.
pub fn adopt(ctx: &AppContext, raw_paths: &[String], package_name: &str) -> anyhow::Result<()> {
    let manifest_snapshot = Manifest::load(&ctx.target_dir).map_err(with_hint)?;
    let package = Package::new(package_name.to_string(), &ctx.package_dir).map_err(with_hint)?;

    let mut requests = Vec::new();
    for raw in raw_paths {
        let resolved = fs_utils::resolve_user_path(raw).map_err(with_hint)?;
        let path = TargetPath::new(resolved).map_err(with_hint)?;
        let rel = Manifest::rel_link(&ctx.target_dir, &path);

        let already_managed = manifest_snapshot
            .packages
            .values()
            .any(|record| record.links.iter().any(|l| *l == rel));
        if already_managed {
            anyhow::bail!("{raw} is already managed; unmanage it first");
        }
        requests.push(AdoptRequest { path });
    }

    let blueprint = Planner::new(ctx)
        .plan_adopt(&requests, &package)
        .map_err(with_hint)?;

    if ctx.dry_run {
        print_plan(&blueprint.plan);
        println!("\n{}", "[DRY RUN] No changes were made".yellow().bold());
        return Ok(());
    }
    if blueprint.plan.is_empty() {
        println!("{} nothing to adopt", "[·]".dimmed());
        return Ok(());
    }

    Executor::new(ctx)
        .execute(&blueprint.plan)
        .map_err(with_hint)?;

    let mut manifest = Manifest::load(&ctx.target_dir).map_err(with_hint)?;
    let links: Vec<String> = blueprint
        .links
        .iter()
        .map(|l| Manifest::rel_link(&ctx.target_dir, l))
        .collect();
    if manifest.packages.contains_key(&package.name) {
        // Adopting into an existing package appends links and keeps its
        // source designation.
        if let Some(record) = manifest.packages.get_mut(&package.name) {
            for link in links {
                if !record.links.contains(&link) {
                    record.links.push(link);
                }
            }
            record.links.sort();
            record.link_count = record.links.len();
        }
    } else {
        manifest.record_adopted(
            &package.name,
            links,
            &ctx.target_dir,
            ctx.package_dir.as_path().to_owned(),
        );
    }
    manifest.save(&ctx.target_dir).map_err(with_hint)?;

    println!(
        "\n{} adopted {} into {}",
        "✓".green().bold(),
        pluralize("path", blueprint.links.len() as isize, true),
        package.name.bold()
    );
    Ok(())
}

/// Show installed packages, optionally re-verifying each recorded link.
pub fn status(ctx: &AppContext, options: StatusOptions) -> anyhow::Result<()> {
    let manifest = Manifest::load(&ctx.target_dir).map_err(with_hint)?;
    if manifest.packages.is_empty() {
        println!("no packages installed");
        return Ok(());
    }

    for (name, record) in &manifest.packages {
        let source = match record.source {
            PackageSource::Managed => "managed",
            PackageSource::Adopted => "adopted",
        };

        if !options.verify {
            println!(
                "{:<20} {:>4} {}  {}",
                name.bold(),
                record.link_count,
                pluralize("link", record.link_count as isize, false),
                source.dimmed()
            );
            continue;
        }

        let package_root = ctx.package_dir.as_path().join(name);
        let mut issue: Option<&str> = None;
        for rel in &record.links {
            let link = ctx.target_dir.join(rel);
            match fs_utils::entry_type(link.as_path()) {
                None => {
                    issue = Some("missing link");
                    break;
                }
                Some(fs_utils::FsType::Symlink) => {
                    if fs_utils::is_broken_symlink(link.as_path()) {
                        issue = Some("broken link");
                        break;
                    }
                    let ok = fs_utils::read_link_raw(link.as_path())
                        .map(|dest| dest.starts_with(&package_root))
                        .unwrap_or(false);
                    if !ok {
                        issue = Some("wrong target");
                        break;
                    }
                }
                Some(_) => {
                    issue = Some("replaced by a real entry");
                    break;
                }
            }
        }

        match issue {
            None => println!(
                "{:<20} {:>4} {}  {} {}",
                name.bold(),
                record.link_count,
                pluralize("link", record.link_count as isize, false),
                source.dimmed(),
                "✓".green().bold()
            ),
            Some(tag) => println!(
                "{:<20} {:>4} {}  {} {} {}",
                name.bold(),
                record.link_count,
                pluralize("link", record.link_count as isize, false),
                source.dimmed(),
                "✗".red().bold(),
                tag.red()
            ),
        }
    }
    Ok(())
}

/// Health check; returns the process exit code per the doctor contract.
pub fn doctor(ctx: &AppContext, options: DoctorOptions) -> anyhow::Result<i32> {
    let mut manifest = Manifest::load(&ctx.target_dir).map_err(with_hint)?;
    let engine = Doctor::new(ctx, options.config.clone());
    let report = engine.run(&manifest).map_err(with_hint)?;

    if report.is_healthy() {
        println!(
            "{} {} checked, no issues",
            "✓".green().bold(),
            pluralize("link", report.checked_links as isize, true)
        );
    } else {
        for issue in &report.issues {
            let marker = match issue.severity {
                Severity::Error => "[✗]".red().bold(),
                Severity::Warning => "[!]".yellow().bold(),
            };
            println!("{} {} {}: {}", marker, issue.kind, issue.path.bold(), issue.detail);
        }
        println!(
            "\n{} checked, {} found",
            pluralize("link", report.checked_links as isize, true),
            pluralize("issue", report.issues.len() as isize, true)
        );
    }
    if report.canceled {
        println!("{}", "scan canceled, report is partial".yellow().bold());
    }
    if report.truncated {
        println!("{}", "issue limit reached, report is truncated".yellow());
    }

    if let Some(mode) = options.triage {
        let summary = doctor::triage(&report, &mut manifest, mode).map_err(with_hint)?;
        if summary.ignored > 0 {
            manifest.save(&ctx.target_dir).map_err(with_hint)?;
            println!(
                "{} {} acknowledged",
                "✓".green().bold(),
                pluralize("orphan", summary.ignored as isize, true)
            );
        }
    }

    if options.fix {
        let (plan, fixes) = engine.plan_fixes(&report).map_err(with_hint)?;
        if plan.is_empty() && fixes.is_empty() {
            println!("{} nothing to fix automatically", "[·]".dimmed());
        } else if ctx.dry_run {
            print_plan(&plan);
            println!("\n{}", "[DRY RUN] No changes were made".yellow().bold());
        } else {
            if !plan.is_empty() {
                Executor::new(ctx).execute(&plan).map_err(with_hint)?;
            }
            doctor::apply_manifest_fixes(&mut manifest, &fixes);
            manifest.save(&ctx.target_dir).map_err(with_hint)?;
            println!(
                "{} applied {}",
                "✓".green().bold(),
                pluralize("fix", (plan.len() + fixes.len()) as isize, true)
            );
        }
    }

    Ok(report.exit_code())
}

/// Manage the packages a bootstrap profile selects.
pub fn bootstrap_apply(ctx: &AppContext, profile: Option<&str>) -> anyhow::Result<()> {
    let bootstrap = Bootstrap::load(&ctx.package_dir).map_err(with_hint)?;
    let names = bootstrap.select_packages(profile).map_err(with_hint)?;
    if names.is_empty() {
        println!("bootstrap selected no packages for this platform");
        return Ok(());
    }
    println!(
        "bootstrap: managing {}\n",
        pluralize("package", names.len() as isize, true)
    );
    manage(ctx, &names)
}

/// Write a starter bootstrap file from the discovered packages.
pub fn bootstrap_init(ctx: &AppContext) -> anyhow::Result<()> {
    let packages = discover_packages(&ctx.package_dir).map_err(with_hint)?;
    let names: Vec<String> = packages.into_iter().map(|p| p.name).collect();
    Bootstrap::init(&ctx.package_dir, &names)
        .map_err(with_hint)
        .context("could not create the bootstrap file")?;
    println!(
        "{} wrote {} with {}",
        "✓".green().bold(),
        crate::bootstrap::BOOTSTRAP_FILE,
        pluralize("package", names.len() as isize, true)
    );
    Ok(())
}
