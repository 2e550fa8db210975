//! Host command execution.
//!
//! Every privileged host mutation (ip, iptables, tc, jailer, mount, ...)
//! goes through a [`CommandRunner`] so the network and jail backends can be
//! exercised against a recording runner in tests.

use std::fmt;
use std::process::{Command, Stdio};

use crate::ExecutorError;

/// A command line, optionally run through `sudo`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    privileged: bool,
}

impl Cmd {
    /// Unprivileged command.
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new(), privileged: false }
    }

    /// Command that needs root.
    pub fn sudo(program: impl Into<String>) -> Self {
        Self { privileged: true, ..Self::new(program) }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// Program followed by its arguments.
    #[must_use]
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.privileged {
            f.write_str("sudo ")?;
        }
        f.write_str(&self.argv().join(" "))
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Converts a failed run into [`ExecutorError::CommandFailed`].
    #[must_use]
    pub fn into_error(self, cmd: &Cmd) -> ExecutorError {
        ExecutorError::CommandFailed {
            command: cmd.to_string(),
            status: self.code.map_or_else(|| "signal".to_owned(), |c| format!("exit {c}")),
            stderr: self.stderr.trim().to_owned(),
        }
    }
}

/// Runs host commands synchronously.
pub trait CommandRunner: Send + Sync + fmt::Debug {
    /// Runs `cmd` to completion, whatever its exit status.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Io`] if the program cannot be started.
    fn output(&self, cmd: &Cmd) -> Result<CommandOutput, ExecutorError>;

    /// Runs `cmd` and returns its stdout, failing on non-zero exit.
    ///
    /// # Errors
    /// Returns [`ExecutorError::CommandFailed`] on non-zero exit.
    fn run(&self, cmd: &Cmd) -> Result<String, ExecutorError> {
        let out = self.output(cmd)?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(out.into_error(cmd))
        }
    }
}

/// Runs commands on the real host via `std::process`.
///
/// Privileged commands are prefixed with `sudo` unless the process already
/// runs as root.
#[derive(Debug, Clone, Copy)]
pub struct SystemRunner {
    use_sudo: bool,
}

impl SystemRunner {
    #[must_use]
    pub fn new() -> Self {
        Self { use_sudo: !nix::unistd::geteuid().is_root() }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for SystemRunner {
    fn output(&self, cmd: &Cmd) -> Result<CommandOutput, ExecutorError> {
        let mut command = if cmd.is_privileged() && self.use_sudo {
            let mut c = Command::new("sudo");
            c.arg(cmd.program());
            c
        } else {
            Command::new(cmd.program())
        };
        command.args(cmd.arguments()).stdin(Stdio::null());

        tracing::debug!(command = %cmd, "running host command");
        let out = command.output()?;

        Ok(CommandOutput {
            code: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_shows_sudo_prefix_for_privileged_commands() {
        let cmd = Cmd::sudo("ip").args(["link", "set", "fhvm0", "up"]);
        assert_eq!(cmd.to_string(), "sudo ip link set fhvm0 up");
        assert_eq!(Cmd::new("ip").arg("route").to_string(), "ip route");
    }

    #[test]
    fn sudo_is_used_only_without_root() {
        let runner = SystemRunner::new();
        assert_eq!(runner.use_sudo, !nix::unistd::geteuid().is_root());
        let out = match runner.output(&Cmd::new("true")) {
            Ok(o) => o,
            Err(e) => panic!("true: {e}"),
        };
        assert!(out.success());
    }

    #[test]
    fn failed_output_becomes_command_failed() {
        let cmd = Cmd::new("false");
        let out = CommandOutput { code: Some(1), stdout: String::new(), stderr: " nope \n".to_owned() };
        match out.into_error(&cmd) {
            ExecutorError::CommandFailed { command, status, stderr } => {
                assert_eq!(command, "false");
                assert_eq!(status, "exit 1");
                assert_eq!(stderr, "nope");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn system_runner_reports_exit_status() {
        let runner = SystemRunner { use_sudo: false };
        let ok = runner.run(&Cmd::new("true"));
        assert!(ok.is_ok(), "true must succeed: {ok:?}");
        let bad = runner.run(&Cmd::new("false"));
        assert!(matches!(bad, Err(ExecutorError::CommandFailed { .. })));
    }
}
