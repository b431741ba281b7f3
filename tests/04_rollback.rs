
use std::collections::HashSet;

use fixtures::Env;

use dot::context::ScanConfig;
use dot::error::Error;
use dot::executor::Executor;
use dot::planner::Planner;
use dot::scanner::{Package, Scanner};

/// A three-operation plan whose second operation fails at commit time:
/// one executed, one failed, one rolled back, and the target directory is
/// byte-for-byte back where it started.
#[cfg(unix)]
#[test]
fn test_midplan_failure_restores_target() {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    let env = Env::new();
    env.write_package_file("shell/dot-alpha", "a");
    env.write_package_file("shell/dot-readonly/dot-x", "x");
    env.write_package_file("shell/dot-zeta", "z");
    // The fold target exists as a real, soon-to-be unwritable directory,
    // so the planner descends into it.
    fs::create_dir(env.target_dir.join(".readonly")).unwrap();

    let ctx = env.ctx();
    let package = Package::new("shell", &ctx.package_dir).unwrap();
    let tree = Scanner::new(&ScanConfig::default())
        .scan_package(&package)
        .unwrap();
    let blueprint = Planner::new(&ctx)
        .plan_manage(&[tree], &HashSet::new())
        .unwrap();
    assert_eq!(blueprint.plan.metadata.operation_count, 3);

    let readonly = env.target_dir.join(".readonly");
    fs::set_permissions(&readonly, fs::Permissions::from_mode(0o555)).unwrap();
    let err = Executor::new(&ctx).execute(&blueprint.plan).unwrap_err();
    fs::set_permissions(&readonly, fs::Permissions::from_mode(0o755)).unwrap();

    match err {
        Error::ExecutionFailed {
            executed,
            failed,
            rolled_back,
            errors,
        } => {
            assert_eq!(executed, 1);
            assert_eq!(failed, 1);
            assert_eq!(rolled_back, 1);
            assert!(errors
                .iter()
                .any(|e| matches!(e, Error::PermissionDenied { .. })));
        }
        other => panic!("expected ExecutionFailed, got {other:?}"),
    }

    // Pre-execute state: the directory exists, nothing else does.
    assert!(!env.target_exists(".alpha"));
    assert!(!env.target_exists(".zeta"));
    assert!(!env.target_exists(".readonly/.x"));
    assert!(env.target_dir.join(".readonly").as_std_path().is_dir());
}

/// Rollback restores a file that a backup-policy plan deleted.
#[cfg(unix)]
#[test]
fn test_rollback_restores_deleted_file() {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use dot::planner::ConflictPolicy;

    let env = Env::new();
    env.write_package_file("shell/dot-profile", "new");
    env.write_package_file("shell/dot-readonly/dot-x", "x");
    env.write_target_file(".profile", "precious");
    fs::create_dir(env.target_dir.join(".readonly")).unwrap();

    let mut ctx = env.ctx();
    ctx.policy = ConflictPolicy::Backup;
    let package = Package::new("shell", &ctx.package_dir).unwrap();
    let tree = Scanner::new(&ScanConfig::default())
        .scan_package(&package)
        .unwrap();
    let blueprint = Planner::new(&ctx)
        .plan_manage(&[tree], &HashSet::new())
        .unwrap();

    let readonly = env.target_dir.join(".readonly");
    fs::set_permissions(&readonly, fs::Permissions::from_mode(0o555)).unwrap();
    let err = Executor::new(&ctx).execute(&blueprint.plan).unwrap_err();
    fs::set_permissions(&readonly, fs::Permissions::from_mode(0o755)).unwrap();
    assert!(matches!(err, Error::ExecutionFailed { .. }));

    // The deleted original is back, and the backup copy was removed again
    // (empty backup directories may remain; they hold no data).
    assert_eq!(env.read_target(".profile"), "precious");
    assert!(!env.is_symlink(".profile"));
    fn files_under(dir: &std::path::Path) -> usize {
        let Ok(entries) = fs::read_dir(dir) else {
            return 0;
        };
        entries
            .flatten()
            .map(|e| {
                let path = e.path();
                if path.is_dir() {
                    files_under(&path)
                } else {
                    1
                }
            })
            .sum()
    }
    assert_eq!(
        files_under(env.target_dir.join(".dot-backup").as_std_path()),
        0
    );
}
