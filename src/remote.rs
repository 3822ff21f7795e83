//! Commands on management hosts over `ssh`.
//!
//! Used where vCenter offers no API, such as `service-control` on the
//! appliance.

use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use crate::command::CommandBuilder;
use crate::config::E2eConfig;
use crate::error::Result;
use crate::poll::Poller;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Quote a string for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// `ssh` access as one user with an optional identity file
#[derive(Clone, Debug)]
pub struct RemoteShell {
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl RemoteShell {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            identity_file: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn from_config(config: &E2eConfig) -> Self {
        Self {
            user: config.ssh_user.clone(),
            identity_file: config.ssh_identity_file.clone(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Arguments passed to `ssh` to run `command` on `host`
    pub fn ssh_args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ];
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(format!("{}@{}", self.user, host));
        args.push(command.to_string());
        args
    }

    /// Run `command` on `host` and return its stdout
    pub async fn run(&self, host: &str, command: &str) -> Result<String> {
        CommandBuilder::new("ssh")
            .args(self.ssh_args(host, command))
            .timeout(COMMAND_TIMEOUT)
            .run()
            .await
    }

    /// Wait until `host` accepts ssh connections
    pub async fn wait_reachable(&self, host: &str, poller: &Poller) -> Result<()> {
        poller
            .describe(format!("ssh to {} reachable", host))
            .poll_ignoring_errors(|| async {
                self.run(host, "true").await?;
                Ok(true)
            })
            .await
    }

    /// Run `service-control --<action> <service>` on a vCenter appliance
    pub async fn service_control(&self, host: &str, action: &str, service: &str) -> Result<String> {
        let command = format!("service-control --{} {}", action, shell_quote(service));
        let out = self.run(host, &command).await?;
        info!(host = %host, service = %service, action = %action, "Ran service-control");
        Ok(out)
    }

    /// Restart a service on a vCenter appliance
    pub async fn restart_service(&self, host: &str, service: &str) -> Result<String> {
        self.service_control(host, "restart", service).await
    }
}
