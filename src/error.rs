//! Error types for the E2E harness.
//!
//! Helpers return [`Result`]; test bodies turn errors into failures. The
//! classification helpers decide which errors a polling loop may retry.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// A single failed task from a parallel fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub label: String,
    pub message: String,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.message)
    }
}

/// Error type for harness operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Transport-level HTTP error talking to vCenter
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// vCenter answered with a non-success status
    #[error("vSphere API error ({status}): {message}")]
    Vsphere { status: u16, message: String },

    /// External command (ssh, kubectl) failed
    #[error("Command failed: {0}")]
    Command(String),

    /// Missing or malformed configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Polling deadline elapsed
    #[error("Timed out after {timeout:?} waiting for: {description}")]
    Timeout {
        description: String,
        timeout: Duration,
    },

    /// Observed state does not match the expectation
    #[error("Assertion failed: {0}")]
    Assertion(String),

    /// One or more tasks of a parallel fan-out failed
    #[error("{} of the parallel tasks failed:\n{}", .0.len(), join_lines(.0))]
    FanOut(Vec<TaskFailure>),

    /// Several independent steps failed (bulk cleanup)
    #[error("Multiple errors:\n{}", .0.join("\n"))]
    Multiple(Vec<String>),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML manifest error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Local IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_lines(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            Error::Vsphere { status, .. } => *status == 404,
            _ => false,
        }
    }

    /// Check if this error is worth another attempt inside a polling loop
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429
                ) || matches!(e, kube::Error::Service(_) | kube::Error::HyperError(_))
            }
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            Error::Vsphere { status, .. } => *status >= 500 || *status == 429,
            Error::Command(_) | Error::Io(_) => true,
            Error::Config(_)
            | Error::Timeout { .. }
            | Error::Assertion(_)
            | Error::FanOut(_)
            | Error::Multiple(_)
            | Error::Serialization(_)
            | Error::Yaml(_) => false,
        }
    }
}

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, Error>;
