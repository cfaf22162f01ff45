//! Interactive archive picker driver (C6): launches the `sk` fuzzy finder
//! against the candidate archive list, wiring its `--preview` command to the
//! spawned preview child (C7) via the preview cache's socket name.

use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::archive::{ArchiveClient, ArchiveInfo};
use crate::error::CliError;
use crate::manifest::VmBackupConfig;
use crate::preview::PreviewCache;

/// Environment variable carrying the preview socket's name to the spawned
/// preview child process (C7) and, transitively, to `sk`'s preview command.
pub const PREVIEW_SOCKET_ENV: &str = "MICROVM_BACKUP_PREVIEW_SOCKET";

/// A short, best-effort wait for the cache to have already resolved the
/// selected archive's info by the time the picker exits — long enough to
/// usually catch a prefetch that was already in flight, short enough to
/// never make the user wait on a cold fetch they didn't ask for.
const SELECTION_ENRICHMENT_WAIT_MS: u64 = 200;

/// The outcome of a successful pick: the archive name, plus its metadata if
/// the cache happened to have it ready (or nearly ready) by selection time.
pub struct PickerSelection {
    pub archive: String,
    pub info: Option<ArchiveInfo>,
}

/// Runs the plain interactive picker over a list of VM names — no preview
/// pane, since a VM has nothing to preview until an archive within it is
/// chosen. Returns the selected name, or [`CliError::Cancelled`] if the user
/// backed out (exit 1 or 130).
pub fn pick_vm(vm_names: &[&str]) -> Result<String, CliError> {
    if vm_names.is_empty() {
        return Err(CliError::Configuration("manifest has no configured vms".to_string()));
    }

    let binary = which::which("sk")
        .map_err(|e| CliError::Configuration(format!("interactive picker 'sk' not found on PATH: {e}")))?;

    let mut child = Command::new(&binary)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| CliError::Configuration(format!("failed to launch picker: {e}")))?;

    {
        let stdin = child.stdin.as_mut().expect("piped stdin");
        for name in vm_names {
            writeln!(stdin, "{name}").map_err(|e| CliError::Configuration(format!("failed to feed picker: {e}")))?;
        }
    }

    let output = child
        .wait_with_output()
        .map_err(|e| CliError::Configuration(format!("picker process failed: {e}")))?;

    selected_line(&output)
}

/// Decodes a finished picker process's exit status and stdout into a
/// selection. Exit 0 with empty trimmed stdout is an error, not a
/// cancellation — the picker reports cancellation through its exit code
/// (1 or 130), never through an empty success. [`CliError::Cancelled`] is
/// reserved for that exit-1/130/signal arm; any other non-zero exit, and a
/// 0 exit with nothing selected, become a plain error (exit 1). Shared by
/// [`pick_vm`] and [`pick_archive`].
fn selected_line(output: &std::process::Output) -> Result<String, CliError> {
    match output.status.code() {
        Some(0) => {
            let selected = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if selected.is_empty() {
                Err(CliError::Configuration("picker exited successfully but selected nothing".to_string()))
            } else {
                Ok(selected)
            }
        }
        Some(1) | Some(130) | None => Err(CliError::Cancelled),
        Some(code) => Err(CliError::Subprocess {
            argv: format!("sk (exit {code})"),
            stderr: Some(String::from_utf8_lossy(&output.stderr).into_owned()),
        }),
    }
}

/// Runs the interactive picker over `archives` for `vm`, pre-warming the
/// preview cache for every row before the picker's own process starts.
/// Returns the selection, or [`CliError::Cancelled`] if the user backed out
/// (exit 1 or 130).
pub fn pick_archive(
    vm: &str,
    archives: &[String],
    client: Arc<dyn ArchiveClient>,
    vm_cfg: VmBackupConfig,
) -> Result<PickerSelection, CliError> {
    if archives.is_empty() {
        return Err(CliError::Configuration(format!("vm {vm} has no archives to restore from")));
    }

    let binary = which::which("sk")
        .map_err(|e| CliError::Configuration(format!("interactive picker 'sk' not found on PATH: {e}")))?;

    let cache = PreviewCache::start(client, vm_cfg)
        .map_err(|e| CliError::Configuration(format!("failed to start preview cache: {e}")))?;
    for archive in archives {
        cache.prefetch(archive);
    }

    let self_exe = std::env::current_exe()
        .map_err(|e| CliError::Configuration(format!("cannot resolve own executable path: {e}")))?;
    let preview_cmd = format!("{} __preview --archive {{}}", self_exe.display());

    let mut child = Command::new(&binary)
        .arg("--preview")
        .arg(&preview_cmd)
        .env(PREVIEW_SOCKET_ENV, cache.socket_name())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| CliError::Configuration(format!("failed to launch picker: {e}")))?;

    {
        let stdin = child.stdin.as_mut().expect("piped stdin");
        for archive in archives {
            writeln!(stdin, "{archive}").map_err(|e| CliError::Configuration(format!("failed to feed picker: {e}")))?;
        }
    }

    let output = child
        .wait_with_output()
        .map_err(|e| CliError::Configuration(format!("picker process failed: {e}")))?;

    let selection = selected_line(&output).map(|selected| {
        let info = match cache.get_preview(&selected, SELECTION_ENRICHMENT_WAIT_MS) {
            crate::preview::PreviewRecord::Ready { info, .. } => Some(info),
            _ => None,
        };
        PickerSelection { archive: selected, info }
    });

    // The cache is stopped here regardless of outcome, once the picker
    // process — and every preview child it spawned — has exited.
    cache.stop();
    selection
}
