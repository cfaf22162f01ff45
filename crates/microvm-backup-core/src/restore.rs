//! Restore Transaction (C8): the atomic subvolume swap at the heart of
//! `restore`. Scoped acquisition with guaranteed cleanup on every exit path —
//! implemented without `Drop` (Rust destructors cannot propagate errors, and
//! the rollback/cleanup steps here are themselves fallible-but-best-effort),
//! the same way the teacher's `pool.rs` returns a slot from both the success
//! and the disconnect arm of its work loop rather than leaning on `Drop`.

use std::path::Path;
use std::sync::Arc;

use crate::archive::ArchiveClient;
use crate::error::CliError;
use crate::manifest::{VmBackupConfig, VmPaths};
use crate::service::{self, ServiceOps};
use crate::subvolume::SubvolumeOps;

/// Tracks exactly the three facts the rollback/cleanup logic needs to decide
/// what to undo: whether the VM service was running at entry, whether the
/// commit's first rename completed, and whether the whole transaction
/// finished successfully.
#[derive(Debug, Default)]
struct TransactionState {
    was_active: bool,
    target_moved_to_old: bool,
    restore_finished: bool,
}

/// Runs the full restore transaction for `vm` against `archive`, using
/// `paths` as the volume's derived scratch locations. Acquires the per-VM
/// advisory lock first (see module docs on [`acquire_lock`]) and always
/// releases it before returning, success or failure.
#[allow(clippy::too_many_arguments)]
pub fn run_restore(
    vm: &str,
    archive: &str,
    paths: &VmPaths,
    vm_cfg: &VmBackupConfig,
    archive_client: &Arc<dyn ArchiveClient>,
    subvolumes: &dyn SubvolumeOps,
    services: &dyn ServiceOps,
    dry_run: bool,
) -> Result<(), CliError> {
    acquire_lock(vm, &paths.lock)?;
    let result = run_restore_locked(vm, archive, paths, vm_cfg, archive_client, subvolumes, services, dry_run);
    release_lock(&paths.lock);
    result
}

#[allow(clippy::too_many_arguments)]
fn run_restore_locked(
    vm: &str,
    archive: &str,
    paths: &VmPaths,
    vm_cfg: &VmBackupConfig,
    archive_client: &Arc<dyn ArchiveClient>,
    subvolumes: &dyn SubvolumeOps,
    services: &dyn ServiceOps,
    dry_run: bool,
) -> Result<(), CliError> {
    let mut state = TransactionState::default();
    let runtime_unit = service::runtime_unit(vm);

    let outcome = (|| -> Result<(), CliError> {
        preconditions(paths, subvolumes)?;
        subvolumes.create(&paths.stage)?;
        archive_client.extract_archive(vm_cfg, archive, &paths.stage)?;

        state.was_active = services.is_active(&runtime_unit)?;
        if state.was_active {
            services.stop(&runtime_unit)?;
        }

        rename(&paths.target, &paths.old, dry_run)?;
        state.target_moved_to_old = true;

        rename(&paths.stage, &paths.target, dry_run)?;

        if state.was_active {
            services.start(&runtime_unit)?;
        }

        state.restore_finished = true;
        Ok(())
    })();

    if outcome.is_err() {
        rollback(&state, paths, subvolumes, services, &runtime_unit, dry_run);
    }
    cleanup(&state, paths, subvolumes);
    outcome
}

fn preconditions(paths: &VmPaths, subvolumes: &dyn SubvolumeOps) -> Result<(), CliError> {
    if !subvolumes.is_subvolume(&paths.target)? {
        return Err(CliError::Precondition(format!(
            "restore target {} does not exist or is not a subvolume",
            paths.target.display()
        )));
    }
    subvolumes.delete_strict_if_exists(&paths.stage, "stage")?;
    subvolumes.delete_strict_if_exists(&paths.old, "old")?;
    Ok(())
}

/// Renames `from` to `to`, the transaction's two commit-point filesystem
/// mutations. In dry-run mode the rename is logged at info level and elided
/// entirely — matching [`crate::command::CommandRunner`]'s mutating-command
/// contract even though these renames bypass the runner (there is no
/// external tool invocation for a rename).
fn rename(from: &Path, to: &Path, dry_run: bool) -> Result<(), CliError> {
    if dry_run {
        tracing::info!(from = %from.display(), to = %to.display(), "dry-run: skipping rename");
        return Ok(());
    }
    std::fs::rename(from, to).map_err(|e| {
        CliError::Precondition(format!("rename {} -> {} failed: {e}", from.display(), to.display()))
    })
}

/// Only reached on failure. If the commit's first rename (`target -> old`)
/// never happened, `target` is byte-unchanged and there is nothing to roll
/// back. Otherwise: clear away a partially-renamed `target`, restore it from
/// `old`, and best-effort resume the service. Every step here only warns.
fn rollback(
    state: &TransactionState,
    paths: &VmPaths,
    subvolumes: &dyn SubvolumeOps,
    services: &dyn ServiceOps,
    runtime_unit: &str,
    dry_run: bool,
) {
    if !state.target_moved_to_old {
        return;
    }
    subvolumes.delete_best_effort(&paths.target, "target (partial commit)");
    if dry_run {
        tracing::info!(old = %paths.old.display(), target = %paths.target.display(), "dry-run: skipping rollback rename");
    } else if paths.old.exists() {
        if let Err(e) = std::fs::rename(&paths.old, &paths.target) {
            tracing::warn!(error = %e, old = %paths.old.display(), target = %paths.target.display(), "rollback rename failed");
        }
    } else {
        tracing::warn!(
            old = %paths.old.display(),
            target = %paths.target.display(),
            "rollback cannot find 'old' subvolume; target is missing and needs manual recovery"
        );
    }
    if state.was_active {
        services.start_best_effort(runtime_unit);
    }
}

/// Always runs, on every exit path. `stage` is always a leftover if present;
/// `old` is only safe to discard once the transaction fully finished.
fn cleanup(state: &TransactionState, paths: &VmPaths, subvolumes: &dyn SubvolumeOps) {
    subvolumes.delete_best_effort(&paths.stage, "stage");
    if state.restore_finished {
        subvolumes.delete_best_effort(&paths.old, "old");
    }
}

/// Acquires the per-VM advisory lock via an atomically-created marker file.
/// `create_new` fails if the file already exists, which is exactly the
/// "another restore is in progress" signal this needs — no separate locking
/// primitive, since `std::fs::File` exposes no platform-independent
/// file-lock API.
fn acquire_lock(vm: &str, lock_path: &Path) -> Result<(), CliError> {
    match std::fs::OpenOptions::new().create_new(true).write(true).open(lock_path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(CliError::Configuration(format!("a restore for {vm} is already in progress")))
        }
        Err(e) => Err(CliError::Configuration(format!(
            "cannot acquire restore lock {}: {e}",
            lock_path.display()
        ))),
    }
}

fn release_lock(lock_path: &Path) {
    if let Err(e) = std::fs::remove_file(lock_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(error = %e, lock = %lock_path.display(), "failed to release restore lock");
        }
    }
}
