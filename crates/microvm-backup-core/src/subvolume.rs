//! Typed wrappers over the filesystem's subvolume primitives (C2).
//!
//! The real implementation shells out to the host's `btrfs subvolume`
//! tooling through [`CommandRunner`]; callers that need to substitute a fake
//! (restore-transaction tests have no real btrfs filesystem available)
//! depend on the [`SubvolumeOps`] trait rather than [`RealSubvolumeOps`]
//! directly, the same capability seam used for [`crate::archive::ArchiveClient`].

use std::path::Path;

use crate::command::CommandRunner;
use crate::error::CliError;

pub trait SubvolumeOps: Send + Sync {
    /// True iff the filesystem reports `path` as a subvolume. Must be
    /// non-destructive and must consult real state even in dry-run mode.
    fn is_subvolume(&self, path: &Path) -> Result<bool, CliError>;

    /// Create a new empty subvolume at `path`. Mutating.
    fn create(&self, path: &Path) -> Result<(), CliError>;

    /// If `path` exists and is not a subvolume, fail with a precondition
    /// error naming `label`. If it is a subvolume, delete it. If it does not
    /// exist, no-op. Used where the wrong type at `path` is a bug.
    fn delete_strict_if_exists(&self, path: &Path, label: &str) -> Result<(), CliError>;

    /// If `path` exists and is a subvolume, attempt to delete it; log a
    /// warning on any failure and return `Ok`. Used in cleanup paths.
    fn delete_best_effort(&self, path: &Path, label: &str);
}

pub struct RealSubvolumeOps {
    runner: CommandRunner,
}

impl RealSubvolumeOps {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }
}

impl SubvolumeOps for RealSubvolumeOps {
    fn is_subvolume(&self, path: &Path) -> Result<bool, CliError> {
        if !path.exists() {
            return Ok(false);
        }
        let path_str = path.to_string_lossy().into_owned();
        // `btrfs subvolume show` exits non-zero for a plain directory; that is
        // a normal "not a subvolume" outcome, not a failure, so this probe
        // uses `run`, never `check`, and never routes through dry-run elision
        // (this call is never `mutating`).
        let outcome = self.runner.run(
            &["btrfs", "subvolume", "show", &path_str],
            None,
            &[],
            true,
            false,
        )?;
        Ok(outcome.success())
    }

    fn create(&self, path: &Path) -> Result<(), CliError> {
        let path_str = path.to_string_lossy().into_owned();
        self.runner
            .check(&["btrfs", "subvolume", "create", &path_str], None, &[], true, true)?;
        Ok(())
    }

    fn delete_strict_if_exists(&self, path: &Path, label: &str) -> Result<(), CliError> {
        if !path.exists() {
            return Ok(());
        }
        if !self.is_subvolume(path)? {
            return Err(CliError::Precondition(format!(
                "refusing to delete non-subvolume {label} at {}",
                path.display()
            )));
        }
        let path_str = path.to_string_lossy().into_owned();
        self.runner
            .check(&["btrfs", "subvolume", "delete", &path_str], None, &[], true, true)?;
        Ok(())
    }

    fn delete_best_effort(&self, path: &Path, label: &str) {
        match self.is_subvolume(path) {
            Ok(true) => {
                let path_str = path.to_string_lossy().into_owned();
                if let Err(e) =
                    self.runner
                        .check(&["btrfs", "subvolume", "delete", &path_str], None, &[], true, true)
                {
                    tracing::warn!(error = %e, label, path = %path.display(), "best-effort subvolume delete failed");
                }
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, label, path = %path.display(), "best-effort subvolume delete: could not classify path");
            }
        }
    }
}
