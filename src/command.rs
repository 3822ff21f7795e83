//! External command execution with captured output.

use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Captured result of a finished command
#[derive(Clone, Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
}

impl CommandOutput {
    fn from_output(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            code: output.status.code(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Builder for running an external program
pub struct CommandBuilder {
    command: Command,
    display: String,
    timeout: Option<Duration>,
}

impl CommandBuilder {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        let display = program.as_ref().to_string_lossy().to_string();
        let mut command = Command::new(program);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Self {
            command,
            display,
            timeout: None,
        }
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.command.arg(arg);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command.args(args);
        self
    }

    pub fn env<K, V>(mut self, key: K, val: V) -> Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.command.env(key, val);
        self
    }

    /// Kill the command if it runs longer than `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run to completion and return the captured output, whatever the exit code
    pub async fn output(mut self) -> Result<CommandOutput> {
        debug!(program = %self.display, "Running command");
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.command.output())
                .await
                .map_err(|_| Error::Timeout {
                    description: format!("command {}", self.display),
                    timeout: limit,
                })??,
            None => self.command.output().await?,
        };
        Ok(CommandOutput::from_output(output))
    }

    /// Run and return stdout; a non-zero exit is an [`Error::Command`]
    pub async fn run(self) -> Result<String> {
        let display = self.display.clone();
        let output = self.output().await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(Error::Command(format!(
                "{} exited with {}: {}",
                display,
                output
                    .code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                output.stderr.trim()
            )))
        }
    }
}
