//! Structured error variants shared across every component.
//!
//! The teacher crate's `ExecutionError` is tagged for a JSON wire format and
//! has no `Display`; this crate's errors exist to become a human-readable CLI
//! exit message, so `thiserror` is used instead of a hand-rolled `Display`.

/// The single error type returned by every fallible operation in this crate.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Missing/invalid manifest, unknown VM, bad CLI arguments, or a
    /// restore already in progress for the VM.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An external command (archive tool, subvolume tool, service manager,
    /// picker) exited non-zero.
    #[error("command failed: {argv}")]
    Subprocess { argv: String, stderr: Option<String> },

    /// A filesystem precondition was violated (wrong subvolume type, missing
    /// target, etc). Never delete unknown data in response to this.
    #[error("filesystem precondition failed: {0}")]
    Precondition(String),

    /// The interactive picker was cancelled by the user (exit 1 or 130).
    #[error("operation cancelled")]
    Cancelled,
}

impl CliError {
    /// Maps this error to the process exit code described in the CLI surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Cancelled => 130,
            _ => 1,
        }
    }

    /// The full message including captured stderr, for the top-level handler.
    pub fn full_message(&self) -> String {
        match self {
            CliError::Subprocess { argv, stderr: Some(s) } if !s.is_empty() => {
                format!("command failed: {argv}: {s}")
            }
            other => other.to_string(),
        }
    }

    /// The raw stderr text of a subprocess failure, if any — used by
    /// [`crate::archive::is_lock_failure`] to classify lock contention.
    pub fn subprocess_stderr(&self) -> Option<&str> {
        match self {
            CliError::Subprocess { stderr, .. } => stderr.as_deref(),
            _ => None,
        }
    }
}
