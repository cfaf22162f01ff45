//! Core engine for microvm subvolume backup/restore: manifest loading,
//! external-tool wrappers for the archive/subvolume/service surfaces, the
//! preview cache service, the interactive picker driver, and the restore
//! transaction. The `microvm-backup-cli` crate is a thin clap front end over
//! this crate's public API.

pub mod archive;
pub mod command;
pub mod error;
pub mod manifest;
pub mod picker;
pub mod preview;
pub mod preview_child;
pub mod privilege;
pub mod restore;
pub mod service;
pub mod subvolume;
pub mod summary;

pub use error::CliError;
pub use manifest::{Manifest, VmBackupConfig, VmPaths};
