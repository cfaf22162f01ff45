//! Thin clap front end over `microvm-backup-core`. Owns only argument
//! parsing, manifest path resolution, logging setup, and the top-level
//! error-to-exit-code mapping; every behavior described in the CLI surface
//! table delegates to the core crate.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use microvm_backup_core::archive::{ArchiveClient, RealArchiveClient};
use microvm_backup_core::command::CommandRunner;
use microvm_backup_core::manifest::{resolve_manifest_path, Manifest};
use microvm_backup_core::service::{RealServiceOps, ServiceOps};
use microvm_backup_core::subvolume::RealSubvolumeOps;
use microvm_backup_core::{picker, preview_child, privilege, restore, summary, CliError};

/// Operator CLI for microvm subvolume backup, browsing, and restore.
#[derive(Parser)]
#[command(name = "microvm-backup", version, about)]
struct Cli {
    /// Path to the manifest. Falls back to MICROVM_BACKUP_MANIFEST, then
    /// /etc/microvm-backup/manifest.json.
    #[arg(long, global = true)]
    manifest: Option<PathBuf>,

    /// Verbose (debug-level) logging.
    #[arg(long, global = true)]
    verbose: bool,

    /// Log mutating commands instead of running them.
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Restart the VM's backup job unit and wait for it to finish.
    Backup { vm: String },

    /// Browse archives for a VM. Picks the VM interactively if omitted.
    List { vm: Option<String> },

    /// Restore a VM's subvolume from a chosen archive.
    Restore {
        vm: Option<String>,
        archive: Option<String>,

        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },

    /// Hidden: the preview-pane child process invoked by the picker.
    #[command(name = "__preview", hide = true)]
    Preview {
        #[arg(long)]
        archive: String,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let exit_code = match &cli.command {
        Command::Preview { archive } => run_preview(archive),
        _ => match run(&cli) {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("error: {}", err.full_message());
                err.exit_code()
            }
        },
    };
    std::process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default_directive = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// The preview child (C7) is rendered directly, bypassing the top-level
/// error handler: errors here are rendered into the preview pane itself
/// (§4.7), never surfaced as a CLI exit-1 error.
fn run_preview(archive: &str) -> i32 {
    if let Err(err) = preview_child::render_preview(archive) {
        println!("{}", err.full_message());
    }
    0
}

/// Escalates to root, when required, before the manifest is ever read — the
/// manifest's `passFile`/`sshKeyPath` are typically root-only, and `backup`/
/// `list`/`restore` all end up invoking the archive tool with them. This
/// must happen before `Manifest::load`: re-exec replaces the process image,
/// so a manifest read before escalating would just be read again afterward
/// under the new (privileged) process. A dry-run `list` or `restore` never
/// runs a mutating command, so it is left unescalated, matching `backup`'s
/// and `restore`'s own dry-run contract.
fn run(cli: &Cli) -> Result<(), CliError> {
    let needs_root = match &cli.command {
        Command::Backup { .. } => true,
        Command::List { .. } => !cli.dry_run,
        Command::Restore { .. } => true,
        Command::Preview { .. } => false,
    };
    if needs_root {
        privilege::ensure_root(cli.dry_run)?;
    }

    let manifest_path = resolve_manifest_path(cli.manifest.clone());
    let manifest = Manifest::load(&manifest_path)?;

    match &cli.command {
        Command::Backup { vm } => run_backup(&manifest, vm, cli.dry_run),
        Command::List { vm } => run_list(&manifest, vm.as_deref(), cli.dry_run),
        Command::Restore { vm, archive, yes } => {
            run_restore(&manifest, vm.as_deref(), archive.as_deref(), *yes, cli.dry_run)
        }
        Command::Preview { .. } => unreachable!("handled in main() before manifest load"),
    }
}

fn run_backup(manifest: &Manifest, vm: &str, dry_run: bool) -> Result<(), CliError> {
    manifest.vm(vm)?;

    let runner = CommandRunner::new(dry_run);
    let services = RealServiceOps::new(runner);
    services.restart_backup_job(vm)
}

fn run_list(manifest: &Manifest, vm: Option<&str>, dry_run: bool) -> Result<(), CliError> {
    let runner = CommandRunner::new(dry_run);
    let client: Arc<dyn ArchiveClient> = Arc::new(RealArchiveClient::new(runner));

    if dry_run {
        let vm = vm.ok_or_else(|| {
            CliError::Configuration("dry-run 'list' requires a vm argument".to_string())
        })?;
        let cfg = manifest.vm(vm)?;
        for name in client.list_archive_names(cfg)? {
            println!("{name}");
        }
        return Ok(());
    }

    let vm_name = match vm {
        Some(v) => v.to_string(),
        None => picker::pick_vm(&manifest.vm_names())?,
    };
    let cfg = manifest.vm(&vm_name)?.clone();
    let archives = client.list_archive_names(&cfg)?;
    let selection = picker::pick_archive(&vm_name, &archives, Arc::clone(&client), cfg.clone())?;
    let info = match selection.info {
        Some(info) => info,
        None => client.fetch_archive_info(&cfg, &selection.archive)?,
    };
    let paths = manifest.paths_for(&vm_name);
    println!("{}", summary::format_summary(&vm_name, &selection.archive, &paths.target.to_string_lossy(), &info));
    Ok(())
}

fn run_restore(
    manifest: &Manifest,
    vm: Option<&str>,
    archive: Option<&str>,
    yes: bool,
    dry_run: bool,
) -> Result<(), CliError> {
    let runner = CommandRunner::new(dry_run);
    let client: Arc<dyn ArchiveClient> = Arc::new(RealArchiveClient::new(runner));

    let vm_name = match vm {
        Some(v) => v.to_string(),
        None => picker::pick_vm(&manifest.vm_names())?,
    };
    let cfg = manifest.vm(&vm_name)?.clone();

    let (archive_name, info) = match archive {
        Some(a) => {
            let info = client.fetch_archive_info(&cfg, a)?;
            (a.to_string(), info)
        }
        None => {
            let archives = client.list_archive_names(&cfg)?;
            let selection = picker::pick_archive(&vm_name, &archives, Arc::clone(&client), cfg.clone())?;
            let info = match selection.info {
                Some(info) => info,
                None => client.fetch_archive_info(&cfg, &selection.archive)?,
            };
            (selection.archive, info)
        }
    };

    let paths = manifest.paths_for(&vm_name);

    if !yes {
        println!(
            "{}",
            summary::format_summary(&vm_name, &archive_name, &paths.target.to_string_lossy(), &info)
        );
        summary::confirm("\nProceed with restore? [y/N] ")?;
    }

    let subvolumes = RealSubvolumeOps::new(runner);
    let services = RealServiceOps::new(runner);
    restore::run_restore(&vm_name, &archive_name, &paths, &cfg, &client, &subvolumes, &services, dry_run)
}
