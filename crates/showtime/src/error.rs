//! Error types surfaced by the showtime pipeline and orchestrator.

use std::time::Duration;

use thiserror::Error;

use crate::github::StoreError;

/// Errors that can occur while reconciling or orchestrating an environment.
#[derive(Error, Debug)]
pub enum ShowtimeError {
    /// A `conf-*` command that the config algebra does not understand.
    #[error("Invalid config command: {0}")]
    InvalidCommand(String),

    /// A cleanup age such as `48h` that could not be parsed.
    #[error("Invalid age '{0}' (expected e.g. 90m, 48h, 2d, 1w)")]
    InvalidAge(String),

    /// A start was requested for a PR that already has a current environment,
    /// or the cloud service for it is already active.
    #[error("Environment already exists for PR #{pr_number}: {service_name}")]
    AlreadyExists { pr_number: u64, service_name: String },

    /// No matching environment or resource.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A cloud or image-build step failed.
    #[error("{operation} failed for {resource}: {message}")]
    Provider {
        operation: &'static str,
        resource: String,
        message: String,
    },

    /// A bounded wait ran out.
    #[error("Timed out after {}s waiting for {resource}", waited.as_secs())]
    Timeout { resource: String, waited: Duration },

    /// The label store could not be read or written.
    #[error("Label store error: {0}")]
    Store(#[from] StoreError),
}

impl ShowtimeError {
    /// Build a provider error for `operation` on `resource`.
    pub fn provider(
        operation: &'static str,
        resource: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::Provider {
            operation,
            resource: resource.into(),
            message: message.to_string(),
        }
    }
}

/// Result alias used throughout the crate.
pub type ShowtimeResult<T> = Result<T, ShowtimeError>;
