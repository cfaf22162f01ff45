//! Uniform external-process execution (C1).
//!
//! Every external tool invocation in this crate — the archive tool, the
//! subvolume tool, the service manager, the interactive picker — goes
//! through [`CommandRunner`] so dry-run handling, logging, and error
//! wrapping live in exactly one place.

use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

use crate::error::CliError;

/// The result of running a command: exit status plus captured output
/// (empty strings if `capture` was false).
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    #[cfg(unix)]
    fn synthetic_success() -> RunOutcome {
        use std::os::unix::process::ExitStatusExt;
        RunOutcome {
            status: ExitStatus::from_raw(0),
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Executes external commands, eliding mutating ones in dry-run mode.
/// Holds no state beyond the flag, so it is cheaply `Copy` — every `Real*Ops`
/// wrapper owns one by value rather than borrowing it, which keeps them
/// `'static` and therefore usable behind `Arc<dyn Trait>`.
#[derive(Debug, Clone, Copy)]
pub struct CommandRunner {
    dry_run: bool,
}

impl CommandRunner {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Run `argv` with the given working directory and environment overlay.
    ///
    /// In dry-run mode, if `mutating` is true, the command is logged and a
    /// synthetic success result is returned without execution. Otherwise the
    /// child is spawned with the given `cwd`/`env`; `capture` controls whether
    /// stdout/stderr are piped and decoded. Never errors on a non-zero exit —
    /// the caller inspects `status`.
    pub fn run(
        &self,
        argv: &[&str],
        cwd: Option<&Path>,
        env: &[(&str, &str)],
        capture: bool,
        mutating: bool,
    ) -> Result<RunOutcome, CliError> {
        let joined = argv.join(" ");

        if self.dry_run && mutating {
            tracing::info!(command = %joined, "dry-run: skipping mutating command");
            return Ok(RunOutcome::synthetic_success());
        }

        tracing::debug!(command = %joined, "running command");

        let [program, rest @ ..] = argv else {
            return Err(CliError::Configuration("empty command".to_string()));
        };

        let mut cmd = Command::new(program);
        cmd.args(rest);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in env {
            cmd.env(k, v);
        }
        if capture {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let output = cmd.output().map_err(|e| {
            CliError::Subprocess {
                argv: joined.clone(),
                stderr: Some(format!("failed to spawn: {e}")),
            }
        })?;

        Ok(RunOutcome {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Like [`run`](Self::run) but turns a non-zero exit into
    /// [`CliError::Subprocess`] carrying the joined argv and trimmed stderr.
    pub fn check(
        &self,
        argv: &[&str],
        cwd: Option<&Path>,
        env: &[(&str, &str)],
        capture: bool,
        mutating: bool,
    ) -> Result<RunOutcome, CliError> {
        let outcome = self.run(argv, cwd, env, capture, mutating)?;
        if outcome.success() {
            return Ok(outcome);
        }
        Err(CliError::Subprocess {
            argv: argv.join(" "),
            stderr: if outcome.stderr.is_empty() {
                None
            } else {
                Some(outcome.stderr.trim().to_string())
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let runner = CommandRunner::new(false);
        let outcome = runner
            .run(&["echo", "hello"], None, &[], true, false)
            .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.stdout.trim(), "hello");
    }

    #[test]
    fn test_run_never_errors_on_nonzero_exit() {
        let runner = CommandRunner::new(false);
        let outcome = runner
            .run(&["false"], None, &[], false, false)
            .expect("run() must not raise on non-zero exit");
        assert!(!outcome.success());
    }

    #[test]
    fn test_check_wraps_nonzero_exit() {
        let runner = CommandRunner::new(false);
        let err = runner
            .check(&["sh", "-c", "echo boom 1>&2; exit 3"], None, &[], true, false)
            .unwrap_err();
        match err {
            CliError::Subprocess { argv, stderr } => {
                assert!(argv.contains("sh"));
                assert_eq!(stderr.as_deref(), Some("boom"));
            }
            other => panic!("expected Subprocess, got {other:?}"),
        }
    }

    #[test]
    fn test_dry_run_elides_mutating_command() {
        let runner = CommandRunner::new(true);
        let outcome = runner
            .run(&["rm", "-rf", "/should/not/run"], None, &[], false, true)
            .unwrap();
        assert!(outcome.success());
    }

    #[test]
    fn test_dry_run_still_executes_non_mutating_command() {
        let runner = CommandRunner::new(true);
        let outcome = runner
            .run(&["echo", "probe"], None, &[], true, false)
            .unwrap();
        assert_eq!(outcome.stdout.trim(), "probe");
    }

    #[test]
    fn test_env_overlay_is_visible_to_child() {
        let runner = CommandRunner::new(false);
        let outcome = runner
            .run(&["sh", "-c", "echo $FOO"], None, &[("FOO", "bar")], true, false)
            .unwrap();
        assert_eq!(outcome.stdout.trim(), "bar");
    }
}
