//! End-to-end lifecycle scenarios through the `Updater` façade, grounded
//! on the literal scenarios in the design doc's testable-properties
//! section: fresh install, upgrade with an active version, an
//! interrupted install recovered by cleanup, and legacy-to-`appdata`
//! layout migration.

use std::fs;
use std::path::Path;

use refit::config::default_platform;
use refit::finder::LocalVersionFinder;
use refit::naming;
use refit::store::VersionStore;
use refit::swapper::BootstrapSwapper;
use refit::updater::Updater;

/// Lay out a staging directory under `finder_root` the way a real
/// `VersionFinder` would: `<name>-<version>-<platform>/esky-files/{bootstrap,
/// bootstrap-manifest.txt}`.
fn stage_in_finder(finder_root: &Path, name: &str, version: &str, platform: &str, files: &[(&str, &[u8])]) {
    let dirname = naming::join(name, version, platform);
    let esky_files = finder_root.join(&dirname).join("esky-files");
    let bootstrap = esky_files.join("bootstrap");
    for (rel, contents) in files {
        let dst = bootstrap.join(rel);
        fs::create_dir_all(dst.parent().unwrap()).unwrap();
        fs::write(dst, contents).unwrap();
    }
    let manifest: String = files.iter().map(|(rel, _)| format!("{rel}\n")).collect();
    fs::write(esky_files.join("bootstrap-manifest.txt"), manifest).unwrap();
}

#[test]
fn fresh_install_places_bootstrap_files_and_becomes_best() {
    let appdir = tempfile::tempdir().unwrap();
    let finder_root = tempfile::tempdir().unwrap();
    let platform = default_platform();
    stage_in_finder(
        finder_root.path(),
        "app",
        "1.0.0",
        &platform,
        &[("lib/a.so", b"libdata"), ("app", b"binary")],
    );

    let mut updater = Updater::new(appdir.path(), "app", &platform)
        .with_finder(Box::new(LocalVersionFinder::new(finder_root.path(), &platform)));
    updater.install_version("1.0.0").unwrap();

    assert_eq!(fs::read(appdir.path().join("lib/a.so")).unwrap(), b"libdata");
    assert_eq!(fs::read(appdir.path().join("app")).unwrap(), b"binary");
    assert_eq!(updater.current_version().map(|d| d.to_string()), Some(naming::join("app", "1.0.0", &platform)));
}

#[test]
fn upgrade_keeps_files_the_active_version_still_needs_and_blocks_its_uninstall() {
    let appdir = tempfile::tempdir().unwrap();
    let finder_root = tempfile::tempdir().unwrap();
    let platform = default_platform();

    stage_in_finder(
        finder_root.path(),
        "app",
        "1.0.0",
        &platform,
        &[("lib/a.so", b"libdata"), ("app", b"binary-v1")],
    );
    stage_in_finder(
        finder_root.path(),
        "app",
        "1.0.1",
        &platform,
        &[("lib/b.so", b"newlib"), ("app", b"binary-v2")],
    );

    let active_dirname = naming::join("app", "1.0.0", &platform);
    let mut updater = Updater::new(appdir.path(), "app", &platform)
        .with_finder(Box::new(LocalVersionFinder::new(finder_root.path(), &platform)))
        .with_active_version(Some(active_dirname));
    updater.install_version("1.0.0").unwrap();
    updater.install_version("1.0.1").unwrap();

    // 1.0.0's lib/a.so is not in 1.0.1's manifest but 1.0.0 is still
    // active, so installing 1.0.1 must not have touched it.
    assert!(appdir.path().join("lib/a.so").exists());
    assert!(appdir.path().join("lib/b.so").exists());
    assert_eq!(fs::read(appdir.path().join("app")).unwrap(), b"binary-v2");
    assert_eq!(
        updater.current_version().map(|d| d.to_string()),
        Some(naming::join("app", "1.0.1", &platform))
    );

    let err = updater.uninstall_version("1.0.0").unwrap_err();
    assert!(matches!(err, refit::error::RefitError::VersionLocked(_)));
    assert!(appdir.path().join("lib/a.so").exists());
}

#[test]
fn interrupted_install_is_finished_by_the_next_cleanup_pass() {
    let appdir = tempfile::tempdir().unwrap();
    let platform = default_platform();

    // 1.0.0 already fully installed (READY).
    let store = VersionStore::new(appdir.path(), "app");
    let d1 = naming::join("app", "1.0.0", &platform);
    {
        let esky_files = appdir.path().join(&d1).join("esky-files");
        let bootstrap = esky_files.join("bootstrap");
        fs::create_dir_all(&bootstrap).unwrap();
        fs::write(bootstrap.join("app"), b"v1").unwrap();
        fs::write(esky_files.join("bootstrap-manifest.txt"), "app\n").unwrap();
        let swapper = BootstrapSwapper::new(appdir.path(), &store);
        let mut lock = refit::lock::AppdirLock::new(appdir.path());
        swapper.install(&mut lock, &d1).unwrap();
    }

    // 1.0.1 staged (its `esky-files/bootstrap/` tree is unpacked into the
    // versions root) but never unpacked into the appdir — simulating a
    // crash between rename-into-place and the transaction commit.
    let d2 = naming::join("app", "1.0.1", &platform);
    {
        let esky_files = appdir.path().join(&d2).join("esky-files");
        let bootstrap = esky_files.join("bootstrap");
        fs::create_dir_all(&bootstrap).unwrap();
        fs::write(bootstrap.join("app"), b"v2").unwrap();
        fs::write(esky_files.join("bootstrap-manifest.txt"), "app\n").unwrap();
    }

    assert_eq!(
        store.get_best_version(false).unwrap().map(|v| v.dirname),
        Some(d1.clone())
    );
    assert_eq!(
        store.get_best_version(true).unwrap().map(|v| v.dirname),
        Some(d2.clone())
    );

    let mut updater = Updater::new(appdir.path(), "app", &platform);
    let report = updater.cleanup().unwrap();
    assert!(report.fully_cleaned(), "cleanup actions: {:?}", report.failed);

    assert_eq!(fs::read(appdir.path().join("app")).unwrap(), b"v2");
    assert_eq!(updater.current_version().map(|d| d.to_string()), Some(d2));
}

#[test]
fn fresh_install_against_a_virgin_appdir_lands_straight_in_appdata() {
    let appdir = tempfile::tempdir().unwrap();
    let finder_root = tempfile::tempdir().unwrap();
    let platform = default_platform();
    stage_in_finder(
        finder_root.path(),
        "app",
        "1.0.0",
        &platform,
        &[("app", b"binary")],
    );

    let dirname = naming::join("app", "1.0.0", &platform);
    let mut updater = Updater::new(appdir.path(), "app", &platform)
        .with_finder(Box::new(LocalVersionFinder::new(finder_root.path(), &platform)));
    updater.install_version("1.0.0").unwrap();

    // No prior legacy-root version ever existed, yet the very first
    // install already migrates to the `appdata/` layout.
    assert!(appdir.path().join("appdata").join(&dirname).is_dir());
    assert!(!appdir.path().join(&dirname).exists());
    let store = VersionStore::new(appdir.path(), "app");
    assert_eq!(store.versions_root(), appdir.path().join("appdata"));
}

#[cfg(windows)]
#[test]
fn uninstall_is_blocked_while_the_manifest_file_is_open_elsewhere() {
    let appdir = tempfile::tempdir().unwrap();
    let platform = default_platform();
    let dirname = naming::join("app", "1.0.0", &platform);

    let esky_files = appdir.path().join(&dirname).join("esky-files");
    fs::create_dir_all(&esky_files).unwrap();
    let manifest_path = esky_files.join("bootstrap-manifest.txt");
    fs::write(&manifest_path, "app\n").unwrap();
    fs::write(appdir.path().join("app"), b"v1").unwrap();

    // Hold the manifest file open without FILE_SHARE_DELETE, so the
    // rename-to-demote that `uninstall` performs hits a sharing violation.
    let _keep_open = fs::OpenOptions::new().read(true).open(&manifest_path).unwrap();

    let store = VersionStore::new(appdir.path(), "app");
    let swapper = BootstrapSwapper::new(appdir.path(), &store);
    let mut lock = refit::lock::AppdirLock::new(appdir.path());
    let err = swapper.uninstall(&mut lock, &dirname, &[]).unwrap_err();
    assert!(matches!(err, refit::error::RefitError::VersionLocked(_)));
    assert!(manifest_path.exists());
}

#[test]
fn legacy_root_migrates_into_appdata_on_cleanup() {
    let appdir = tempfile::tempdir().unwrap();
    let platform = default_platform();
    let dirname = naming::join("app", "1.0.0", &platform);

    // A version installed directly at the appdir root (legacy layout,
    // already READY: its bootstrap files are already unpacked at the
    // appdir root, only the control directory needs to move).
    let esky_files = appdir.path().join(&dirname).join("esky-files");
    fs::create_dir_all(&esky_files).unwrap();
    fs::write(esky_files.join("bootstrap-manifest.txt"), "app\n").unwrap();
    fs::write(appdir.path().join("app"), b"v1").unwrap();

    // An `appdata/` child already exists (e.g. the app was repackaged to
    // the newer layout) but holds no versions of its own yet.
    fs::create_dir_all(appdir.path().join("appdata")).unwrap();

    let store = VersionStore::new(appdir.path(), "app");
    assert_eq!(store.versions_root(), appdir.path().to_path_buf());

    let mut updater = Updater::new(appdir.path(), "app", &platform);
    let report = updater.cleanup().unwrap();
    assert!(report.fully_cleaned(), "cleanup actions: {:?}", report.failed);

    let store = VersionStore::new(appdir.path(), "app");
    assert_eq!(store.versions_root(), appdir.path().join("appdata"));
    assert!(appdir.path().join("appdata").join(&dirname).is_dir());
    assert!(!appdir.path().join(&dirname).exists());
}
