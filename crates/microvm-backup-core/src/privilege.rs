//! Privilege re-exec (C12): `backup`/`restore` mutate btrfs subvolumes and
//! systemd units, which require root. Rather than each subcommand checking
//! and failing, the CLI re-execs itself under `sudo` once, up front.

use std::os::unix::process::CommandExt;
use std::process::Command;

use crate::error::CliError;

/// Current UID via `rustix`'s safe wrapper (no `unsafe` FFI), matching the
/// teacher's own zero-`unsafe` dependency surface.
fn current_uid() -> u32 {
    rustix::process::getuid().as_raw()
}

/// If not already running as root, replaces the current process image with
/// `sudo -E -- <current_exe> <original args>`, preserving the environment so
/// `MICROVM_BACKUP_MANIFEST` and friends survive the escalation. Does
/// nothing in dry-run mode, where no mutating command will actually run.
pub fn ensure_root(dry_run: bool) -> Result<(), CliError> {
    if dry_run || current_uid() == 0 {
        return Ok(());
    }

    let current_exe = std::env::current_exe()
        .map_err(|e| CliError::Configuration(format!("cannot resolve own executable path: {e}")))?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    tracing::info!("re-executing under sudo for privileged operation");

    // `exec` replaces this process; on success it never returns. It only
    // returns on failure to exec, which becomes our error.
    let err = Command::new("sudo").arg("-E").arg("--").arg(&current_exe).args(&args).exec();
    Err(CliError::Configuration(format!("failed to re-exec under sudo: {err}")))
}
