//! Process-wide read-only configuration.
//!
//! Loaded once at startup and handed to handlers by reference — no
//! singleton, matching the design note that the only process-wide state
//! should be the manifest and stdout/stderr.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CliError;

/// Per-VM backup configuration: repository address and credential paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmBackupConfig {
    pub repo: String,
    #[serde(rename = "passFile")]
    pub pass_file: PathBuf,
    #[serde(rename = "sshKeyPath")]
    pub ssh_key_path: PathBuf,
}

/// Process-wide read-only configuration: a root volume path and a mapping
/// from VM name to its backup configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "volumePath")]
    pub volume_path: PathBuf,
    pub vms: BTreeMap<String, VmBackupConfig>,
}

/// The three scratch paths derived deterministically from the volume path
/// and VM name. During steady state only `target` exists and is a
/// subvolume; `stage`/`old` exist only inside a restore transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmPaths {
    pub target: PathBuf,
    pub stage: PathBuf,
    pub old: PathBuf,
    /// Advisory lock marker preventing two concurrent restores of one VM.
    pub lock: PathBuf,
}

impl VmPaths {
    pub fn derive(volume: &Path, vm: &str) -> VmPaths {
        VmPaths {
            target: volume.join(vm),
            stage: volume.join(format!(".{vm}.restore-new")),
            old: volume.join(format!(".{vm}.restore-old")),
            lock: volume.join(format!(".{vm}.restore.lock")),
        }
    }
}

impl Manifest {
    /// Load and validate a manifest from `path`. All string fields must be
    /// non-empty; `volumePath`, `passFile`, and `sshKeyPath` must be absolute;
    /// `vms` must be non-empty.
    pub fn load(path: &Path) -> Result<Manifest, CliError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CliError::Configuration(format!("cannot read manifest {}: {e}", path.display()))
        })?;
        let manifest: Manifest = serde_json::from_str(&text).map_err(|e| {
            CliError::Configuration(format!("invalid manifest {}: {e}", path.display()))
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), CliError> {
        if !self.volume_path.is_absolute() {
            return Err(CliError::Configuration(
                "volumePath must be an absolute path".to_string(),
            ));
        }
        if self.vms.is_empty() {
            return Err(CliError::Configuration(
                "manifest must configure at least one vm".to_string(),
            ));
        }
        for (name, cfg) in &self.vms {
            if name.is_empty() {
                return Err(CliError::Configuration("vm name must not be empty".to_string()));
            }
            if cfg.repo.is_empty() {
                return Err(CliError::Configuration(format!("vm {name}: repo must not be empty")));
            }
            if !cfg.pass_file.is_absolute() {
                return Err(CliError::Configuration(format!(
                    "vm {name}: passFile must be an absolute path"
                )));
            }
            if !cfg.ssh_key_path.is_absolute() {
                return Err(CliError::Configuration(format!(
                    "vm {name}: sshKeyPath must be an absolute path"
                )));
            }
        }
        Ok(())
    }

    /// Look up a VM's config, or a `Configuration` error naming the unknown VM.
    pub fn vm(&self, name: &str) -> Result<&VmBackupConfig, CliError> {
        self.vms
            .get(name)
            .ok_or_else(|| CliError::Configuration(format!("unknown vm: {name}")))
    }

    /// All configured VM names, in manifest (map) order.
    pub fn vm_names(&self) -> Vec<&str> {
        self.vms.keys().map(|s| s.as_str()).collect()
    }

    pub fn paths_for(&self, vm: &str) -> VmPaths {
        VmPaths::derive(&self.volume_path, vm)
    }
}

/// Resolve the manifest path per the CLI's override order: `--manifest`
/// flag, `MICROVM_BACKUP_MANIFEST` env var, then the compiled-in default.
pub fn resolve_manifest_path(flag: Option<PathBuf>) -> PathBuf {
    if let Some(p) = flag {
        return p;
    }
    if let Ok(p) = std::env::var("MICROVM_BACKUP_MANIFEST") {
        return PathBuf::from(p);
    }
    PathBuf::from("/etc/microvm-backup/manifest.json")
}
