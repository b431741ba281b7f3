
use std::collections::HashSet;

use fixtures::Env;

use dot::commands;
use dot::context::ScanConfig;
use dot::manifest::{package_content_hash, Manifest};
use dot::planner::Planner;
use dot::scanner::{Package, Scanner};

/// Rewriting a file with identical bytes leaves the hash alone and the
/// remanage plans nothing.
#[test]
fn test_remanage_unchanged_content_is_noop() {
    let env = Env::new();
    env.write_package_file("vim/dot-vimrc", "x");
    commands::manage(&env.ctx(), &["vim".to_string()]).unwrap();

    let hash_before = Manifest::load(&env.target()).unwrap().hashes["vim"].clone();

    // Same bytes, fresh write.
    env.write_package_file("vim/dot-vimrc", "x");
    commands::remanage(&env.ctx(), &["vim".to_string()]).unwrap();

    let manifest = Manifest::load(&env.target()).unwrap();
    assert_eq!(manifest.hashes["vim"], hash_before);
    assert!(env.is_symlink(".vimrc"));

    // The manage planner agrees: nothing to do.
    let ctx = env.ctx();
    let package = Package::new("vim", &ctx.package_dir).unwrap();
    let tree = Scanner::new(&ScanConfig::default())
        .scan_package(&package)
        .unwrap();
    let blueprint = Planner::new(&ctx)
        .plan_manage(&[tree], &HashSet::new())
        .unwrap();
    assert!(blueprint.plan.is_empty());
}

/// Changing content updates the stored hash.
#[test]
fn test_remanage_updates_hash_on_content_change() {
    let env = Env::new();
    env.write_package_file("vim/dot-vimrc", "x");
    commands::manage(&env.ctx(), &["vim".to_string()]).unwrap();
    let hash_before = Manifest::load(&env.target()).unwrap().hashes["vim"].clone();

    env.write_package_file("vim/dot-vimrc", "y");
    commands::remanage(&env.ctx(), &["vim".to_string()]).unwrap();

    let manifest = Manifest::load(&env.target()).unwrap();
    assert_ne!(manifest.hashes["vim"], hash_before);
    assert!(env.is_symlink(".vimrc"));
    assert_eq!(env.read_target(".vimrc"), "y");
}

/// Structural drift: a new file appears, remanage links it; a removed file
/// loses its link.
#[test]
fn test_remanage_follows_structure_changes() {
    let env = Env::new();
    env.write_package_file("vim/dot-vimrc", "x");
    commands::manage(&env.ctx(), &["vim".to_string()]).unwrap();

    env.write_package_file("vim/dot-gvimrc", "g");
    std::fs::remove_file(env.package_dir.join("vim/dot-vimrc")).unwrap();
    commands::remanage(&env.ctx(), &["vim".to_string()]).unwrap();

    assert!(env.is_symlink(".gvimrc"));
    assert!(!env.target_exists(".vimrc"));

    let manifest = Manifest::load(&env.target()).unwrap();
    assert_eq!(manifest.packages["vim"].links, vec![".gvimrc".to_string()]);
}

/// A package absent from the manifest degrades remanage to manage.
#[test]
fn test_remanage_unknown_package_manages_it() {
    let env = Env::new();
    env.write_package_file("vim/dot-vimrc", "x");

    commands::remanage(&env.ctx(), &["vim".to_string()]).unwrap();
    assert!(env.is_symlink(".vimrc"));
}

/// A healthy tree whose links were tampered with gets re-synced even when
/// the content hash is unchanged.
#[test]
fn test_remanage_repairs_missing_link() {
    let env = Env::new();
    env.write_package_file("vim/dot-vimrc", "x");
    commands::manage(&env.ctx(), &["vim".to_string()]).unwrap();

    std::fs::remove_file(env.target_dir.join(".vimrc")).unwrap();
    commands::remanage(&env.ctx(), &["vim".to_string()]).unwrap();

    assert!(env.is_symlink(".vimrc"));
}

/// The hash function itself: stable across identical trees.
#[test]
fn test_hash_stability_across_scans() {
    let env = Env::new();
    env.write_package_file("vim/dot-vimrc", "x");
    env.write_package_file("vim/dot-config/nvim/init.lua", "l");

    let ctx = env.ctx();
    let package = Package::new("vim", &ctx.package_dir).unwrap();
    let scan_config = ScanConfig::default();
    let scanner = Scanner::new(&scan_config);
    let first = package_content_hash(&scanner.scan_package(&package).unwrap()).unwrap();
    let second = package_content_hash(&scanner.scan_package(&package).unwrap()).unwrap();
    assert_eq!(first, second);
}
