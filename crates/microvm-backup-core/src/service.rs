//! Start/stop/query/restart of a VM's runtime service unit and backup job
//! unit (C3). Thin, typed wrappers over the host's service manager.

use crate::command::CommandRunner;
use crate::error::CliError;

/// Derives the runtime service unit name for `vm`: `microvm@{vm}.service`.
pub fn runtime_unit(vm: &str) -> String {
    format!("microvm@{vm}.service")
}

/// Derives the backup job unit name for `vm`:
/// `borgbackup-job-microvm-{vm}.service`.
pub fn backup_job_unit(vm: &str) -> String {
    format!("borgbackup-job-microvm-{vm}.service")
}

pub trait ServiceOps: Send + Sync {
    fn is_active(&self, unit: &str) -> Result<bool, CliError>;
    fn stop(&self, unit: &str) -> Result<(), CliError>;
    fn start(&self, unit: &str) -> Result<(), CliError>;
    fn start_best_effort(&self, unit: &str);
    /// Restarts the backup job unit and waits for it to complete. Mutating.
    fn restart_backup_job(&self, vm: &str) -> Result<(), CliError>;
}

pub struct RealServiceOps {
    runner: CommandRunner,
}

impl RealServiceOps {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }
}

impl ServiceOps for RealServiceOps {
    fn is_active(&self, unit: &str) -> Result<bool, CliError> {
        let outcome = self
            .runner
            .run(&["systemctl", "is-active", "--quiet", unit], None, &[], false, false)?;
        Ok(outcome.success())
    }

    fn stop(&self, unit: &str) -> Result<(), CliError> {
        self.runner
            .check(&["systemctl", "stop", unit], None, &[], true, true)?;
        Ok(())
    }

    fn start(&self, unit: &str) -> Result<(), CliError> {
        self.runner
            .check(&["systemctl", "start", unit], None, &[], true, true)?;
        Ok(())
    }

    fn start_best_effort(&self, unit: &str) {
        if let Err(e) = self.start(unit) {
            tracing::warn!(error = %e, unit, "best-effort service start failed");
        }
    }

    fn restart_backup_job(&self, vm: &str) -> Result<(), CliError> {
        let unit = backup_job_unit(vm);
        // `systemctl restart --wait` blocks until the oneshot job unit
        // finishes, so success here means the backup run completed.
        self.runner
            .check(&["systemctl", "restart", "--wait", &unit], None, &[], true, true)?;
        Ok(())
    }
}
