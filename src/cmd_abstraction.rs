//! Command execution abstraction for testability.
//!
//! Every backend (nft, iptables-restore, dnsmasq, systemctl) runs its
//! system commands through [`CommandExecutor`], so unit tests can script
//! the host's answers without touching it.

use anyhow::{Context, Result};
use std::io::Write;
use std::process::{Command, Output, Stdio};
use std::sync::Arc;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Output from command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Whether the command exited with code 0
    pub success: bool,
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Turn a non-zero exit into an error carrying stderr.
    pub fn into_result(self, program: &str) -> Result<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            anyhow::bail!("{} failed: {}", program, self.stderr.trim())
        }
    }
}

/// Trait for command execution, allowing dependency injection for testing.
///
/// Arguments are `&[String]` rather than `&[&str]` because mockall cannot
/// express the nested lifetimes of the latter.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    /// Run `cmd` with `args` and capture its output.
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;

    /// Run `cmd` with `args`, feeding `stdin` to it.
    fn execute_with_stdin(&self, cmd: &str, args: &[String], stdin: &str) -> Result<CommandOutput>;
}

/// Shared handle used by backends.
pub type SharedExecutor = Arc<dyn CommandExecutor>;

/// Runs actual system commands.
#[derive(Debug, Clone, Default)]
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self
    }

    pub fn shared() -> SharedExecutor {
        Arc::new(Self)
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
            code: output.status.code(),
        }
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        debug!("exec: {} {}", cmd, args.join(" "));
        Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map(CommandOutput::from)
            .with_context(|| format!("Failed to execute {}", cmd))
    }

    fn execute_with_stdin(&self, cmd: &str, args: &[String], input: &str) -> Result<CommandOutput> {
        debug!("exec: {} {} (<{} bytes on stdin)", cmd, args.join(" "), input.len());
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", cmd))?;

        // Dropped at the end of the block so the child sees EOF
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input.as_bytes())
                .with_context(|| format!("Failed to write stdin of {}", cmd))?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for {}", cmd))?;
        Ok(output.into())
    }
}

/// Convert a slice of &str to the owned form the trait takes.
pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Run a command and return stdout, failing on non-zero exit.
pub fn run_checked(executor: &dyn CommandExecutor, program: &str, args: &[&str]) -> Result<String> {
    executor
        .execute(program, &args_to_strings(args))?
        .into_result(program)
}


#[cfg(test)]
mod tests {
    use super::testing::{args_eq, ok};
    use super::*;

    #[test]
    fn test_args_to_strings() {
        let args = args_to_strings(&["list", "table", "inet", "openpath"]);
        assert_eq!(args, vec!["list", "table", "inet", "openpath"]);
        assert!(args_to_strings(&[]).is_empty());
    }

    #[test]
    fn test_into_result() {
        assert_eq!(ok("out").into_result("nft").unwrap(), "out");

        let failed = CommandOutput {
            stderr: "Error: No such file or directory\n".to_string(),
            code: Some(1),
            ..Default::default()
        };
        let err = failed.into_result("nft").unwrap_err();
        assert_eq!(err.to_string(), "nft failed: Error: No such file or directory");
    }

    #[test]
    fn test_real_executor_echo() {
        let output = RealCommandExecutor::new()
            .execute("echo", &args_to_strings(&["-n", "hello"]))
            .unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "hello");
    }

    #[test]
    fn test_real_executor_failure_is_not_error() {
        let output = RealCommandExecutor::new()
            .execute("ls", &args_to_strings(&["--definitely-invalid-flag"]))
            .unwrap();
        assert!(!output.success);
    }

    #[test]
    fn test_real_executor_missing_program() {
        let result = RealCommandExecutor::new().execute("/nonexistent/openpath-bin", &[]);
        assert!(result.is_err());
    }

    #[test]
    fn test_real_executor_with_stdin() {
        let output = RealCommandExecutor::new()
            .execute_with_stdin("cat", &[], "table inet openpath {}")
            .unwrap();
        assert_eq!(output.stdout, "table inet openpath {}");
    }

    #[test]
    fn test_run_checked_with_mock() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|cmd, args| cmd == "systemctl" && args_eq(args, &["is-active", "dnsmasq"]))
            .times(1)
            .returning(|_, _| Ok(ok("active\n")));

        let out = run_checked(&mock, "systemctl", &["is-active", "dnsmasq"]).unwrap();
        assert_eq!(out.trim(), "active");
    }
}
