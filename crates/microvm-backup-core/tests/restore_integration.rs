//! Cross-module scenarios for the restore transaction (C8), composed from
//! the same public trait seams `microvm-backup-cli` uses: [`ArchiveClient`],
//! [`SubvolumeOps`], [`ServiceOps`]. No real `btrfs`/`systemctl`/`borg` is
//! available in CI, so every collaborator here is an in-memory fake.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use microvm_backup_core::archive::{ArchiveClient, ArchiveInfo};
use microvm_backup_core::error::CliError;
use microvm_backup_core::manifest::{VmBackupConfig, VmPaths};
use microvm_backup_core::restore::run_restore;
use microvm_backup_core::service::{self, ServiceOps};
use microvm_backup_core::subvolume::SubvolumeOps;

struct FakeSubvolumes {
    subvolumes: Mutex<HashSet<std::path::PathBuf>>,
}

impl FakeSubvolumes {
    fn new(initial: &[&Path]) -> Self {
        Self { subvolumes: Mutex::new(initial.iter().map(|p| p.to_path_buf()).collect()) }
    }
}

impl SubvolumeOps for FakeSubvolumes {
    fn is_subvolume(&self, path: &Path) -> Result<bool, CliError> {
        Ok(self.subvolumes.lock().unwrap().contains(path))
    }
    fn create(&self, path: &Path) -> Result<(), CliError> {
        std::fs::create_dir_all(path).ok();
        self.subvolumes.lock().unwrap().insert(path.to_path_buf());
        Ok(())
    }
    fn delete_strict_if_exists(&self, path: &Path, label: &str) -> Result<(), CliError> {
        let mut set = self.subvolumes.lock().unwrap();
        if path.exists() && !set.contains(path) {
            return Err(CliError::Precondition(format!("refusing to delete non-subvolume {label}")));
        }
        set.remove(path);
        let _ = std::fs::remove_dir_all(path);
        Ok(())
    }
    fn delete_best_effort(&self, path: &Path, _label: &str) {
        self.subvolumes.lock().unwrap().remove(path);
        let _ = std::fs::remove_dir_all(path);
    }
}

struct FakeServices {
    active: Mutex<HashSet<String>>,
    fail_start: AtomicBool,
}

impl FakeServices {
    fn new(initially_active: &[&str]) -> Self {
        Self {
            active: Mutex::new(initially_active.iter().map(|s| s.to_string()).collect()),
            fail_start: AtomicBool::new(false),
        }
    }
}

impl ServiceOps for FakeServices {
    fn is_active(&self, unit: &str) -> Result<bool, CliError> {
        Ok(self.active.lock().unwrap().contains(unit))
    }
    fn stop(&self, unit: &str) -> Result<(), CliError> {
        self.active.lock().unwrap().remove(unit);
        Ok(())
    }
    fn start(&self, unit: &str) -> Result<(), CliError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(CliError::Subprocess {
                argv: "systemctl start".to_string(),
                stderr: Some("simulated failure".to_string()),
            });
        }
        self.active.lock().unwrap().insert(unit.to_string());
        Ok(())
    }
    fn start_best_effort(&self, unit: &str) {
        let _ = self.start(unit);
    }
    fn restart_backup_job(&self, _vm: &str) -> Result<(), CliError> {
        unimplemented!("restore never restarts the backup job")
    }
}

struct FakeArchiveClient {
    fail_extract: bool,
}

impl ArchiveClient for FakeArchiveClient {
    fn list_archive_names(&self, _vm_cfg: &VmBackupConfig) -> Result<Vec<String>, CliError> {
        Ok(vec![])
    }
    fn fetch_archive_info(&self, _vm_cfg: &VmBackupConfig, archive: &str) -> Result<ArchiveInfo, CliError> {
        Ok(ArchiveInfo::unknown(archive))
    }
    fn extract_archive(&self, _vm_cfg: &VmBackupConfig, _archive: &str, cwd: &Path) -> Result<(), CliError> {
        if self.fail_extract {
            return Err(CliError::Subprocess {
                argv: "borg extract".to_string(),
                stderr: Some("simulated extract failure".to_string()),
            });
        }
        std::fs::write(cwd.join("restored-marker"), b"ok").ok();
        Ok(())
    }
}

fn vm_cfg() -> VmBackupConfig {
    VmBackupConfig {
        repo: "ssh://host/repo".to_string(),
        pass_file: "/etc/pw".into(),
        ssh_key_path: "/etc/key".into(),
    }
}

#[test]
fn restore_stops_and_restarts_an_active_vm_around_the_swap() {
    let dir = tempfile::tempdir().unwrap();
    let paths = VmPaths::derive(dir.path(), "web");
    std::fs::create_dir_all(&paths.target).unwrap();
    std::fs::write(paths.target.join("old-data"), b"stale").unwrap();

    let subvolumes = FakeSubvolumes::new(&[&paths.target]);
    let services = FakeServices::new(&[&service::runtime_unit("web")]);
    let client: Arc<dyn ArchiveClient> = Arc::new(FakeArchiveClient { fail_extract: false });

    run_restore("web", "a1", &paths, &vm_cfg(), &client, &subvolumes, &services, false)
        .expect("restore should succeed");

    assert!(paths.target.join("restored-marker").exists());
    assert!(!paths.target.join("old-data").exists());
    assert!(services.is_active(&service::runtime_unit("web")).unwrap());
    assert!(!paths.old.exists());
    assert!(!paths.stage.exists());
    assert!(!paths.lock.exists());
}

#[test]
fn restore_leaves_a_stopped_vm_stopped_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let paths = VmPaths::derive(dir.path(), "web");
    std::fs::create_dir_all(&paths.target).unwrap();

    let subvolumes = FakeSubvolumes::new(&[&paths.target]);
    let services = FakeServices::new(&[]);
    let client: Arc<dyn ArchiveClient> = Arc::new(FakeArchiveClient { fail_extract: false });

    run_restore("web", "a1", &paths, &vm_cfg(), &client, &subvolumes, &services, false)
        .expect("restore should succeed");

    assert!(!services.is_active(&service::runtime_unit("web")).unwrap());
}

#[test]
fn failed_extract_never_touches_the_running_target_or_its_service() {
    let dir = tempfile::tempdir().unwrap();
    let paths = VmPaths::derive(dir.path(), "web");
    std::fs::create_dir_all(&paths.target).unwrap();
    std::fs::write(paths.target.join("untouched"), b"keep").unwrap();

    let subvolumes = FakeSubvolumes::new(&[&paths.target]);
    let services = FakeServices::new(&[&service::runtime_unit("web")]);
    let client: Arc<dyn ArchiveClient> = Arc::new(FakeArchiveClient { fail_extract: true });

    let err = run_restore("web", "a1", &paths, &vm_cfg(), &client, &subvolumes, &services, false).unwrap_err();

    assert!(matches!(err, CliError::Subprocess { .. }));
    assert!(paths.target.join("untouched").exists());
    assert!(services.is_active(&service::runtime_unit("web")).unwrap());
    assert!(!paths.lock.exists());
}

#[test]
fn a_second_concurrent_restore_for_the_same_vm_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let paths = VmPaths::derive(dir.path(), "web");
    std::fs::create_dir_all(&paths.target).unwrap();
    std::fs::write(paths.lock.clone(), b"").unwrap();

    let subvolumes = FakeSubvolumes::new(&[&paths.target]);
    let services = FakeServices::new(&[]);
    let client: Arc<dyn ArchiveClient> = Arc::new(FakeArchiveClient { fail_extract: false });

    let err = run_restore("web", "a1", &paths, &vm_cfg(), &client, &subvolumes, &services, false).unwrap_err();
    assert!(matches!(err, CliError::Configuration(_)));

    std::fs::remove_file(&paths.lock).unwrap();
}

#[test]
fn dry_run_restore_completes_without_mutating_the_filesystem_renames() {
    let dir = tempfile::tempdir().unwrap();
    let paths = VmPaths::derive(dir.path(), "web");
    std::fs::create_dir_all(&paths.target).unwrap();

    let subvolumes = FakeSubvolumes::new(&[&paths.target]);
    let services = FakeServices::new(&[]);
    let client: Arc<dyn ArchiveClient> = Arc::new(FakeArchiveClient { fail_extract: false });

    run_restore("web", "a1", &paths, &vm_cfg(), &client, &subvolumes, &services, true)
        .expect("dry-run restore should still report success");

    // The two renames were elided, so `target` was never actually displaced.
    assert!(paths.target.exists());
    assert!(!paths.lock.exists());
}
