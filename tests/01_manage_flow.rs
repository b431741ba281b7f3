
use fixtures::Env;

use dot::commands::{self, UnmanageOptions};
use dot::manifest::{Manifest, PackageSource};

/// Simple manage: one package, one translated file link, manifest record.
#[test]
fn test_manage_creates_link_and_manifest() {
    let env = Env::new();
    env.write_package_file("vim/dot-vimrc", "x");

    commands::manage(&env.ctx(), &["vim".to_string()]).unwrap();

    assert!(env.is_symlink(".vimrc"));
    assert_eq!(env.link_dest(".vimrc"), env.package_dir.join("vim/dot-vimrc"));
    assert_eq!(env.read_target(".vimrc"), "x");

    let manifest = Manifest::load(&env.target()).unwrap();
    let record = &manifest.packages["vim"];
    assert_eq!(record.links, vec![".vimrc".to_string()]);
    assert_eq!(record.link_count, 1);
    assert_eq!(record.source, PackageSource::Managed);
    assert!(manifest.hashes.contains_key("vim"));
}

/// Managing the same packages twice is a no-op: the second plan is empty
/// and the links are untouched.
#[test]
fn test_manage_twice_is_idempotent() {
    let env = Env::new();
    env.write_package_file("vim/dot-vimrc", "x");

    commands::manage(&env.ctx(), &["vim".to_string()]).unwrap();
    let dest_before = env.link_dest(".vimrc");

    commands::manage(&env.ctx(), &["vim".to_string()]).unwrap();
    assert_eq!(env.link_dest(".vimrc"), dest_before);

    let manifest = Manifest::load(&env.target()).unwrap();
    assert_eq!(manifest.packages["vim"].link_count, 1);
}

/// Manage then unmanage leaves the target as it was: no recorded link
/// remains and nothing was created outside the backup area.
#[test]
fn test_manage_unmanage_roundtrip() {
    let env = Env::new();
    env.write_package_file("vim/dot-vimrc", "x");
    env.write_package_file("vim/dot-config/nvim/init.lua", "-- lua");

    commands::manage(&env.ctx(), &["vim".to_string()]).unwrap();
    commands::unmanage(
        &env.ctx(),
        &["vim".to_string()],
        UnmanageOptions::default(),
    )
    .unwrap();

    assert!(!env.target_exists(".vimrc"));
    assert!(!env.target_exists(".config"));

    let manifest = Manifest::load(&env.target()).unwrap();
    assert!(manifest.packages.is_empty());
    assert!(manifest.hashes.is_empty());

    // The package itself is untouched.
    assert!(env.package_dir.join("vim/dot-vimrc").as_std_path().exists());
}

/// A directory owned by a single package folds into one link; the manifest
/// records the fold, not the leaves.
#[test]
fn test_manage_folds_exclusive_directory() {
    let env = Env::new();
    env.write_package_file("gnupg/dot-gnupg/gpg.conf", "g");
    env.write_package_file("gnupg/dot-gnupg/dirmngr.conf", "d");

    commands::manage(&env.ctx(), &["gnupg".to_string()]).unwrap();

    assert!(env.is_symlink(".gnupg"));
    assert_eq!(env.link_dest(".gnupg"), env.package_dir.join("gnupg/dot-gnupg"));
    assert_eq!(env.read_target(".gnupg/gpg.conf"), "g");

    let manifest = Manifest::load(&env.target()).unwrap();
    assert_eq!(manifest.packages["gnupg"].links, vec![".gnupg".to_string()]);
}

/// A second package extending into a folded directory unfolds it: the link
/// becomes a real directory with per-package links, and both manifest
/// records stay truthful.
#[test]
fn test_manage_unfolds_shared_directory() {
    let env = Env::new();
    env.write_package_file("nvim/dot-config/nvim/init.lua", "n");
    commands::manage(&env.ctx(), &["nvim".to_string()]).unwrap();
    assert!(env.is_symlink(".config"));

    env.write_package_file("kitty/dot-config/kitty/kitty.conf", "k");
    commands::manage(&env.ctx(), &["kitty".to_string()]).unwrap();

    assert!(!env.is_symlink(".config"));
    assert!(env.target_dir.join(".config").as_std_path().is_dir());
    assert!(env.is_symlink(".config/nvim"));
    assert!(env.is_symlink(".config/kitty"));
    assert_eq!(env.read_target(".config/nvim/init.lua"), "n");
    assert_eq!(env.read_target(".config/kitty/kitty.conf"), "k");

    let manifest = Manifest::load(&env.target()).unwrap();
    assert_eq!(
        manifest.packages["nvim"].links,
        vec![".config/nvim".to_string()]
    );
    assert_eq!(
        manifest.packages["kitty"].links,
        vec![".config/kitty".to_string()]
    );
}

/// Packages that only contain ignored files produce nothing.
#[test]
fn test_manage_fully_ignored_package() {
    let env = Env::new();
    env.write_package_file("docs/README.md", "readme");
    env.write_package_file("docs/LICENSE", "license");

    commands::manage(&env.ctx(), &["docs".to_string()]).unwrap();

    let manifest = Manifest::load(&env.target()).unwrap();
    assert_eq!(manifest.packages["docs"].link_count, 0);
    assert!(!env.target_exists("README.md"));
}

/// Unmanage --purge removes the package directory as well.
#[test]
fn test_unmanage_purge() {
    let env = Env::new();
    env.write_package_file("vim/dot-vimrc", "x");
    commands::manage(&env.ctx(), &["vim".to_string()]).unwrap();

    commands::unmanage(
        &env.ctx(),
        &["vim".to_string()],
        UnmanageOptions {
            purge: true,
            ..UnmanageOptions::default()
        },
    )
    .unwrap();

    assert!(!env.target_exists(".vimrc"));
    assert!(!env.package_dir.join("vim").as_std_path().exists());
}

/// Unmanage --cleanup drops records whose links are already gone without
/// planning any operations.
#[test]
fn test_unmanage_cleanup_drops_stale_records() {
    let env = Env::new();
    env.write_package_file("vim/dot-vimrc", "x");
    commands::manage(&env.ctx(), &["vim".to_string()]).unwrap();

    std::fs::remove_file(env.target_dir.join(".vimrc")).unwrap();
    commands::unmanage(
        &env.ctx(),
        &["vim".to_string()],
        UnmanageOptions {
            cleanup: true,
            ..UnmanageOptions::default()
        },
    )
    .unwrap();

    let manifest = Manifest::load(&env.target()).unwrap();
    assert!(manifest.packages.is_empty());
}
