//! Human-readable formatting and confirmation prompts (C9).

use std::io::{self, BufRead, Write};

use crate::archive::ArchiveInfo;
use crate::error::CliError;

const IEC_UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// Formats `bytes` with binary IEC units, two decimals above the base unit.
pub fn format_size_iec(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit_idx = 0;
    while value >= 1024.0 && unit_idx < IEC_UNITS.len() - 1 {
        value /= 1024.0;
        unit_idx += 1;
    }
    if unit_idx == 0 {
        format!("{bytes} {}", IEC_UNITS[0])
    } else {
        format!("{value:.2} {}", IEC_UNITS[unit_idx])
    }
}

/// Formats a duration in whole seconds as `Ns`, `Mm Ns`, or `Hh Mm Ns`.
pub fn format_duration(total_secs: u64) -> String {
    let h = total_secs / 3600;
    let m = (total_secs % 3600) / 60;
    let s = total_secs % 60;
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

/// Builds the confirmation/summary block shown before an irreversible
/// restore: VM, archive, restore target, then the archive's metadata.
pub fn format_summary(vm: &str, archive: &str, target: &str, info: &ArchiveInfo) -> String {
    format!(
        "VM: {vm}\nArchive: {archive}\nRestore target: {target}\n\nStart: {}\nDuration: {}\nFiles: {}\nOriginal size: {}\nCompressed size: {}\nDeduplicated size: {}",
        info.start, info.duration, info.file_count, info.original_size, info.compressed_size, info.deduplicated_size,
    )
}

/// Builds the short metadata block shown by the interactive picker's
/// preview pane for one archive — the same fields as [`format_summary`]
/// minus the VM/restore-target framing, which the preview pane does not know.
pub fn format_preview_text(info: &ArchiveInfo) -> String {
    format!(
        "Archive: {}\n\nStart: {}\nDuration: {}\nFiles: {}\nOriginal size: {}\nCompressed size: {}\nDeduplicated size: {}",
        info.name, info.start, info.duration, info.file_count, info.original_size, info.compressed_size, info.deduplicated_size,
    )
}

/// Reads a line from stdin after printing `prompt`. Accepted answers are
/// `y`/`yes` (case-insensitive); anything else cancels the restore with
/// [`CliError::Cancelled`] rather than returning a plain `false` — a restore
/// is irreversible enough that "didn't confirm" and "errored" should unwind
/// through the same path.
pub fn confirm(prompt: &str) -> Result<(), CliError> {
    print!("{prompt}");
    io::stdout().flush().ok();
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| CliError::Configuration(format!("failed to read confirmation: {e}")))?;
    let answer = line.trim().to_lowercase();
    if answer == "y" || answer == "yes" {
        Ok(())
    } else {
        Err(CliError::Cancelled)
    }
}
