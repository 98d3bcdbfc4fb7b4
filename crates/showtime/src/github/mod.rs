//! # Label store
//!
//! The label store is the only persistent state showtime has. [`LabelStore`]
//! is the seam the reconciliation pipeline talks to; [`GitHubLabelClient`]
//! implements it against the GitHub REST API with rate-limit tracking and
//! `ETag` based conditional writes.

mod client;

use async_trait::async_trait;
use thiserror::Error;

pub use client::{GitHubConfig, GitHubLabelClient};

/// Errors returned by a label store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GitHub API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Rate limit exceeded, reset in {reset_in:?}")]
    RateLimitExceeded { reset_in: std::time::Duration },

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Concurrent modification detected")]
    ConcurrentModification,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Labels of one PR together with the revision they were read at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSnapshot {
    pub labels: Vec<String>,
    /// Opaque revision (an `ETag` on GitHub) for conditional writes.
    pub revision: Option<String>,
}

/// A PR-scoped label key-value store.
#[async_trait]
pub trait LabelStore: Send + Sync {
    /// Read all labels of a PR.
    async fn labels(&self, pr_number: u64) -> Result<LabelSnapshot, StoreError>;

    /// Remove one label. Returns `false` if the label was already gone, which
    /// callers treat as "someone else claimed it".
    async fn remove_label(&self, pr_number: u64, label: &str) -> Result<bool, StoreError>;

    /// Replace the full label set. When `revision` is given the write only
    /// succeeds if the labels have not changed since that revision, otherwise
    /// [`StoreError::ConcurrentModification`] is returned.
    async fn replace_labels(
        &self,
        pr_number: u64,
        labels: &[String],
        revision: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Full SHA of the PR head commit.
    async fn latest_commit_sha(&self, pr_number: u64) -> Result<String, StoreError>;

    /// Open PRs with their labels.
    async fn open_pull_requests(&self) -> Result<Vec<(u64, Vec<String>)>, StoreError>;
}

#[async_trait]
impl<T: LabelStore + ?Sized> LabelStore for Box<T> {
    async fn labels(&self, pr_number: u64) -> Result<LabelSnapshot, StoreError> {
        (**self).labels(pr_number).await
    }

    async fn remove_label(&self, pr_number: u64, label: &str) -> Result<bool, StoreError> {
        (**self).remove_label(pr_number, label).await
    }

    async fn replace_labels(
        &self,
        pr_number: u64,
        labels: &[String],
        revision: Option<&str>,
    ) -> Result<(), StoreError> {
        (**self).replace_labels(pr_number, labels, revision).await
    }

    async fn latest_commit_sha(&self, pr_number: u64) -> Result<String, StoreError> {
        (**self).latest_commit_sha(pr_number).await
    }

    async fn open_pull_requests(&self) -> Result<Vec<(u64, Vec<String>)>, StoreError> {
        (**self).open_pull_requests().await
    }
}
