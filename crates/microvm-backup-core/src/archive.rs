//! Repository metadata and extraction operations (C4).
//!
//! Per the design note on dynamic dispatch in tests, [`PreviewCache`]
//! (C5) and [`crate::restore::RestoreTransaction`] (C8) depend on
//! `Arc<dyn ArchiveClient>`, never on [`RealArchiveClient`] directly, so
//! tests can script lock contention and transient failures deterministically.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::CommandRunner;
use crate::error::CliError;
use crate::manifest::VmBackupConfig;

/// Case-insensitive substrings that mark a repository-tool failure as lock
/// contention rather than some other error.
const LOCK_MARKERS: &[&str] = &[
    "lock",
    "already locked",
    "another",
    "process",
    "failed to create/acquire the lock",
    "failed to acquire",
    "lock timeout",
];

/// Normalized record parsed from the archive tool's JSON metadata. Every
/// field falls back to the literal `"N/A"` when the underlying data is
/// missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub name: String,
    pub start: String,
    pub end: String,
    pub duration: String,
    pub hostname: String,
    pub username: String,
    pub source_path: String,
    pub command_line: String,
    pub file_count: String,
    pub original_size: String,
    pub compressed_size: String,
    pub deduplicated_size: String,
}

impl ArchiveInfo {
    /// All-`"N/A"` record for `archive`, used when the tool's JSON payload
    /// contains no archive entry.
    pub fn unknown(archive: &str) -> ArchiveInfo {
        let na = || "N/A".to_string();
        ArchiveInfo {
            name: archive.to_string(),
            start: na(),
            end: na(),
            duration: na(),
            hostname: na(),
            username: na(),
            source_path: na(),
            command_line: na(),
            file_count: na(),
            original_size: na(),
            compressed_size: na(),
            deduplicated_size: na(),
        }
    }
}

pub trait ArchiveClient: Send + Sync {
    /// Archive names, newest-first by descending lexicographic string order.
    /// Trailing whitespace is stripped and empty lines dropped.
    fn list_archive_names(&self, vm_cfg: &VmBackupConfig) -> Result<Vec<String>, CliError>;

    fn fetch_archive_info(&self, vm_cfg: &VmBackupConfig, archive: &str) -> Result<ArchiveInfo, CliError>;

    /// Mutating: extracts `archive`'s contents into `cwd`.
    fn extract_archive(&self, vm_cfg: &VmBackupConfig, archive: &str, cwd: &Path) -> Result<(), CliError>;

    fn is_lock_failure(&self, err: &CliError) -> bool {
        default_is_lock_failure(err)
    }
}

/// Case-insensitive substring match of a subprocess error's stderr against
/// [`LOCK_MARKERS`].
pub fn default_is_lock_failure(err: &CliError) -> bool {
    let Some(stderr) = err.subprocess_stderr() else {
        return false;
    };
    let lower = stderr.to_lowercase();
    LOCK_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Builds the environment required by every archive-tool invocation:
/// repository address, an SSH-command pointing at the VM's private key, and
/// a passphrase-command that reads the passphrase file. These are
/// process-local to each invocation, never written to the manifest's own
/// process environment.
fn env_for(vm_cfg: &VmBackupConfig) -> Vec<(String, String)> {
    vec![
        ("BORG_REPO".to_string(), vm_cfg.repo.clone()),
        (
            "BORG_RSH".to_string(),
            format!("ssh -i {} -o StrictHostKeyChecking=accept-new", vm_cfg.ssh_key_path.display()),
        ),
        (
            "BORG_PASSCOMMAND".to_string(),
            format!("cat {}", vm_cfg.pass_file.display()),
        ),
    ]
}

pub struct RealArchiveClient {
    runner: CommandRunner,
}

impl RealArchiveClient {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }
}

impl ArchiveClient for RealArchiveClient {
    fn list_archive_names(&self, vm_cfg: &VmBackupConfig) -> Result<Vec<String>, CliError> {
        let env = env_for(vm_cfg);
        let env_refs: Vec<(&str, &str)> = env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let outcome = self.runner.check(&["borg", "list", "--short"], None, &env_refs, true, false)?;
        let mut names: Vec<String> = outcome
            .stdout
            .lines()
            .map(|l| l.trim_end())
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
            .collect();
        names.sort_unstable_by(|a, b| b.cmp(a));
        Ok(names)
    }

    fn fetch_archive_info(&self, vm_cfg: &VmBackupConfig, archive: &str) -> Result<ArchiveInfo, CliError> {
        let env = env_for(vm_cfg);
        let env_refs: Vec<(&str, &str)> = env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let repo_archive = format!("::{archive}");
        let outcome = self.runner.check(
            &["borg", "info", "--json", &repo_archive],
            None,
            &env_refs,
            true,
            false,
        )?;
        parse_archive_info(archive, &outcome.stdout)
    }

    fn extract_archive(&self, vm_cfg: &VmBackupConfig, archive: &str, cwd: &Path) -> Result<(), CliError> {
        let env = env_for(vm_cfg);
        let env_refs: Vec<(&str, &str)> = env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let repo_archive = format!("::{archive}");
        self.runner
            .check(&["borg", "extract", &repo_archive], Some(cwd), &env_refs, true, true)?;
        Ok(())
    }
}

/// Parses the archive tool's `borg info --json` payload into an
/// [`ArchiveInfo`]. If the payload contains no `archives` entry, every field
/// defaults to `"N/A"`.
pub fn parse_archive_info(archive: &str, json: &str) -> Result<ArchiveInfo, CliError> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| CliError::Configuration(format!("invalid archive info JSON: {e}")))?;

    let Some(entry) = value.get("archives").and_then(|a| a.as_array()).and_then(|a| a.first()) else {
        return Ok(ArchiveInfo::unknown(archive));
    };

    let s = |key: &str| entry.get(key).and_then(|v| v.as_str()).map(|s| s.to_string());
    let stats = entry.get("stats");
    let stat_u64 = |key: &str| stats.and_then(|st| st.get(key)).and_then(|v| v.as_u64());

    let command_line = entry
        .get("command_line")
        .and_then(|v| v.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        });

    let source_path = extract_source_path(entry);

    let start = s("start");
    let end = s("end");
    let duration = match (&start, &end) {
        (Some(_), Some(_)) => format_iso_duration(entry),
        _ => None,
    };

    Ok(ArchiveInfo {
        name: entry.get("name").and_then(|v| v.as_str()).map(|s| s.to_string()).unwrap_or_else(|| "N/A".to_string()),
        start: start.unwrap_or_else(|| "N/A".to_string()),
        end: end.unwrap_or_else(|| "N/A".to_string()),
        duration: duration.unwrap_or_else(|| "N/A".to_string()),
        hostname: s("hostname").unwrap_or_else(|| "N/A".to_string()),
        username: s("username").unwrap_or_else(|| "N/A".to_string()),
        source_path: source_path.unwrap_or_else(|| "N/A".to_string()),
        command_line: command_line.unwrap_or_else(|| "N/A".to_string()),
        file_count: stat_u64("nfiles").map(|n| n.to_string()).unwrap_or_else(|| "N/A".to_string()),
        original_size: stat_u64("original_size").map(crate::summary::format_size_iec).unwrap_or_else(|| "N/A".to_string()),
        compressed_size: stat_u64("compressed_size").map(crate::summary::format_size_iec).unwrap_or_else(|| "N/A".to_string()),
        deduplicated_size: stat_u64("deduplicated_size").map(crate::summary::format_size_iec).unwrap_or_else(|| "N/A".to_string()),
    })
}

fn format_iso_duration(entry: &Value) -> Option<String> {
    let start = entry.get("start")?.as_str()?;
    let end = entry.get("end")?.as_str()?;
    let parse = |s: &str| -> Option<i64> {
        // Archive timestamps are "YYYY-MM-DDTHH:MM:SS.ffffff"; only the
        // HH:MM:SS component and whole-day boundaries matter for a duration,
        // so this does a plain lexical/numeric decomposition rather than
        // pulling in a date-time crate for a single subtraction.
        let (date, time) = s.split_once('T')?;
        let mut date_parts = date.split('-');
        let y: i64 = date_parts.next()?.parse().ok()?;
        let mo: i64 = date_parts.next()?.parse().ok()?;
        let d: i64 = date_parts.next()?.parse().ok()?;
        let time = time.split('.').next().unwrap_or(time);
        let mut time_parts = time.split(':');
        let h: i64 = time_parts.next()?.parse().ok()?;
        let mi: i64 = time_parts.next()?.parse().ok()?;
        let se: i64 = time_parts.next()?.parse().ok()?;
        // Days since a fixed epoch via a simplified proleptic Gregorian
        // day-count; exact enough for elapsed-seconds subtraction between
        // two nearby timestamps.
        let days = days_from_civil(y, mo, d);
        Some(days * 86_400 + h * 3600 + mi * 60 + se)
    };
    let start_s = parse(start)?;
    let end_s = parse(end)?;
    let elapsed = (end_s - start_s).max(0) as u64;
    Some(crate::summary::format_duration(elapsed))
}

/// Howard Hinnant's days-from-civil algorithm (proleptic Gregorian).
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Extracts the archive's source path from structured fields if present,
/// else scans the command line for the first `/`-prefixed token. Returns
/// `None` when neither is available.
pub fn extract_source_path(entry: &Value) -> Option<String> {
    if let Some(paths) = entry.get("paths").and_then(|v| v.as_array()) {
        if let Some(first) = paths.iter().filter_map(|p| p.as_str()).next() {
            return Some(first.to_string());
        }
    }
    let cmdline = entry.get("command_line").and_then(|v| v.as_array())?;
    cmdline
        .iter()
        .filter_map(|p| p.as_str())
        .find(|tok| tok.starts_with('/'))
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_lock_failure_matches_known_markers() {
        let err = CliError::Subprocess {
            argv: "borg info".to_string(),
            stderr: Some("Failed to create/acquire the lock".to_string()),
        };
        assert!(default_is_lock_failure(&err));
    }

    #[test]
    fn test_is_lock_failure_case_insensitive() {
        let err = CliError::Subprocess {
            argv: "borg info".to_string(),
            stderr: Some("LOCK TIMEOUT exceeded".to_string()),
        };
        assert!(default_is_lock_failure(&err));
    }

    #[test]
    fn test_is_lock_failure_false_for_unrelated_error() {
        let err = CliError::Subprocess {
            argv: "borg info".to_string(),
            stderr: Some("repository does not exist".to_string()),
        };
        assert!(!default_is_lock_failure(&err));
    }

    #[test]
    fn test_is_lock_failure_false_for_non_subprocess_error() {
        let err = CliError::Configuration("bad manifest".to_string());
        assert!(!default_is_lock_failure(&err));
    }

    #[test]
    fn test_parse_archive_info_missing_entry_all_na() {
        let info = parse_archive_info("missing", r#"{"archives": []}"#).unwrap();
        assert_eq!(info.start, "N/A");
        assert_eq!(info.original_size, "N/A");
        assert_eq!(info.source_path, "N/A");
    }

    #[test]
    fn test_extract_source_path_from_structured_paths() {
        let entry: Value = serde_json::from_str(r#"{"paths": ["/srv/vm/data"]}"#).unwrap();
        assert_eq!(extract_source_path(&entry), Some("/srv/vm/data".to_string()));
    }

    #[test]
    fn test_extract_source_path_from_command_line_token() {
        let entry: Value =
            serde_json::from_str(r#"{"command_line": ["borg", "create", "::a", "/srv/vm/data"]}"#).unwrap();
        assert_eq!(extract_source_path(&entry), Some("/srv/vm/data".to_string()));
    }

    #[test]
    fn test_extract_source_path_none_when_absent() {
        let entry: Value = serde_json::from_str(r#"{"command_line": ["borg", "create", "::a"]}"#).unwrap();
        assert_eq!(extract_source_path(&entry), None);
    }

    #[test]
    fn test_parse_archive_info_full_record() {
        let json = r#"{
            "archives": [{
                "name": "web-2024-01-01",
                "start": "2024-01-01T00:00:00.000000",
                "end": "2024-01-01T00:05:30.000000",
                "hostname": "host1",
                "username": "root",
                "paths": ["/srv/vm/web"],
                "command_line": ["borg", "create"],
                "stats": {"nfiles": 42, "original_size": 1048576, "compressed_size": 524288, "deduplicated_size": 262144}
            }]
        }"#;
        let info = parse_archive_info("web-2024-01-01", json).unwrap();
        assert_eq!(info.hostname, "host1");
        assert_eq!(info.file_count, "42");
        assert_eq!(info.source_path, "/srv/vm/web");
        assert_eq!(info.duration, "5m 30s");
        assert_eq!(info.original_size, "1.00 MiB");
    }
}
