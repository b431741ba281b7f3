
use fixtures::Env;

use dot::commands::{self, DoctorOptions};
use dot::doctor::{Doctor, DoctorConfig, IssueKind, ScanMode};
use dot::manifest::Manifest;

/// An empty manifest and a dangling symlink in the target root: the scoped
/// scan reports one broken link and the doctor exit code is 2.
#[test]
fn test_dangling_link_is_an_error() {
    let env = Env::new();
    env.symlink(
        &env.package_dir.join("ghost/dot-oldrc"),
        &env.target_dir.join(".oldrc"),
    );

    let code = commands::doctor(&env.ctx(), DoctorOptions::default()).unwrap();
    assert_eq!(code, 2);

    let report = Doctor::new(&env.ctx(), DoctorConfig::default())
        .run(&Manifest::load(&env.target()).unwrap())
        .unwrap();
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].kind, IssueKind::BrokenLink);
    assert_eq!(report.issues[0].path, ".oldrc");
}

/// A healthy installation exits 0.
#[test]
fn test_healthy_installation_exits_zero() {
    let env = Env::new();
    env.write_package_file("vim/dot-vimrc", "x");
    commands::manage(&env.ctx(), &["vim".to_string()]).unwrap();

    let code = commands::doctor(&env.ctx(), DoctorOptions::default()).unwrap();
    assert_eq!(code, 0);
}

/// Deleting a managed link demotes the install to a warning (exit 1).
#[test]
fn test_missing_link_exits_one() {
    let env = Env::new();
    env.write_package_file("vim/dot-vimrc", "x");
    commands::manage(&env.ctx(), &["vim".to_string()]).unwrap();
    std::fs::remove_file(env.target_dir.join(".vimrc")).unwrap();

    let code = commands::doctor(&env.ctx(), DoctorOptions::default()).unwrap();
    assert_eq!(code, 1);
}

/// --fix recreates a missing managed link.
#[test]
fn test_fix_recreates_missing_link() {
    let env = Env::new();
    env.write_package_file("vim/dot-vimrc", "x");
    commands::manage(&env.ctx(), &["vim".to_string()]).unwrap();
    std::fs::remove_file(env.target_dir.join(".vimrc")).unwrap();

    let options = DoctorOptions {
        fix: true,
        ..DoctorOptions::default()
    };
    commands::doctor(&env.ctx(), options).unwrap();

    assert!(env.is_symlink(".vimrc"));
    assert_eq!(env.read_target(".vimrc"), "x");
}

/// --fix removes a dangling managed link and drops its manifest record.
#[test]
fn test_fix_drops_dead_link() {
    let env = Env::new();
    env.write_package_file("vim/dot-vimrc", "x");
    commands::manage(&env.ctx(), &["vim".to_string()]).unwrap();
    std::fs::remove_file(env.package_dir.join("vim/dot-vimrc")).unwrap();

    let options = DoctorOptions {
        fix: true,
        ..DoctorOptions::default()
    };
    commands::doctor(&env.ctx(), options).unwrap();

    assert!(!env.target_exists(".vimrc"));
    let manifest = Manifest::load(&env.target()).unwrap();
    assert!(!manifest.packages.contains_key("vim"));
}

/// An unmanaged symlink into the package area is an orphan; one pointing
/// elsewhere is untracked.
#[test]
fn test_orphan_classification() {
    let env = Env::new();
    env.write_package_file("vim/dot-vimrc", "x");
    env.write_target_file("real-file", "y");
    env.symlink(
        &env.package_dir.join("vim/dot-vimrc"),
        &env.target_dir.join(".orphan"),
    );
    env.symlink(
        &env.target_dir.join("real-file"),
        &env.target_dir.join(".untracked"),
    );

    let report = Doctor::new(&env.ctx(), DoctorConfig::default())
        .run(&Manifest::default())
        .unwrap();
    let kind_of = |path: &str| {
        report
            .issues
            .iter()
            .find(|i| i.path == path)
            .map(|i| i.kind)
    };
    assert_eq!(kind_of(".orphan"), Some(IssueKind::OrphanedLink));
    assert_eq!(kind_of(".untracked"), Some(IssueKind::UntrackedLink));
}

/// Ignored patterns persisted in the manifest suppress matching issues on
/// the next run.
#[test]
fn test_ignored_pattern_suppresses_rerun() {
    let env = Env::new();
    env.write_target_file("real-file", "y");
    env.symlink(
        &env.target_dir.join("real-file"),
        &env.target_dir.join(".vendor-link"),
    );

    let mut manifest = Manifest::load(&env.target()).unwrap();
    let report = Doctor::new(&env.ctx(), DoctorConfig::default())
        .run(&manifest)
        .unwrap();
    assert_eq!(report.issues.len(), 1);

    manifest
        .doctor_state_mut()
        .ignored_patterns
        .push(".vendor-*".to_string());
    manifest.save(&env.target()).unwrap();

    let manifest = Manifest::load(&env.target()).unwrap();
    let report = Doctor::new(&env.ctx(), DoctorConfig::default())
        .run(&manifest)
        .unwrap();
    assert!(report.is_healthy());
}

/// A deep scan reaches below the directories that hold managed links.
#[test]
fn test_deep_scan_finds_nested_links() {
    let env = Env::new();
    std::fs::create_dir_all(env.target_dir.join("projects/tools")).unwrap();
    env.symlink(
        &env.package_dir.join("ghost/bin/tool"),
        &env.target_dir.join("projects/tools/tool"),
    );

    // Scoped mode misses it.
    let scoped = Doctor::new(&env.ctx(), DoctorConfig::default())
        .run(&Manifest::default())
        .unwrap();
    assert!(scoped.is_healthy());

    let deep = Doctor::new(
        &env.ctx(),
        DoctorConfig {
            scan: ScanMode::Deep,
            ..DoctorConfig::default()
        },
    )
    .run(&Manifest::default())
    .unwrap();
    assert_eq!(deep.issues.len(), 1);
    assert_eq!(deep.issues[0].path, "projects/tools/tool");
}

/// The issue cap bounds the report.
#[test]
fn test_issue_cap() {
    let env = Env::new();
    for i in 0..20 {
        env.symlink(
            &env.package_dir.join("ghost/file"),
            &env.target_dir.join(format!(".dead{i:02}")),
        );
    }

    let report = Doctor::new(
        &env.ctx(),
        DoctorConfig {
            max_issues: 5,
            ..DoctorConfig::default()
        },
    )
    .run(&Manifest::default())
    .unwrap();
    assert!(report.issues.len() <= 5);
    assert!(report.truncated);
}
