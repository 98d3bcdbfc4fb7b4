#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::doc_markdown)]

//! # Showtime
//!
//! Ephemeral pull request environments driven entirely by GitHub labels.
//!
//! A PR's labels are the only state showtime keeps. Adding a trigger label
//! (`🎪 trigger-start`, `🎪 trigger-sync`, `🎪 conf-enable-ALERTS`, ...) asks
//! for a transition; showtime claims the trigger, drives the cloud, and
//! rewrites the PR's state labels to describe the result.
//!
//! This crate provides:
//! - The label codec and PR state projection ([`labels`])
//! - The configuration token algebra ([`show_config`])
//! - The trigger reconciliation pipeline ([`pipeline`])
//! - The environment lifecycle orchestrator ([`orchestrator`]) on top of
//!   ECS/ECR/EC2 ([`aws`]) and an image builder ([`image`])
//! - Age-based cleanup ([`sweep`])
//! - Side-effect free stand-ins for rehearsing triggers ([`dry_run`])
//!
//! ## Example
//!
//! ```rust,ignore
//! use showtime::{GitHubConfig, GitHubLabelClient, PipelineConfig, Reconciler};
//!
//! let store = GitHubLabelClient::new(GitHubConfig::new(token, "apache/superset")?)?;
//! let reconciler = Reconciler::new(store, orchestrator, PipelineConfig::default());
//!
//! for report in reconciler.handle_triggers(1234).await? {
//!     println!("{}: {:?}", report.trigger, report.result);
//! }
//! ```

pub mod aws;
pub mod dry_run;
pub mod error;
pub mod github;
pub mod image;
pub mod labels;
pub mod orchestrator;
pub mod pipeline;
pub mod show;
pub mod show_config;
pub mod sweep;
pub mod ui;

pub use dry_run::{run_lifecycle, DryRunEnvironments, DryRunStore};
pub use error::{ShowtimeError, ShowtimeResult};
pub use github::{GitHubConfig, GitHubLabelClient, LabelSnapshot, LabelStore, StoreError};
pub use image::{CommandImageBuilder, ImageBuilder};
pub use labels::{decode, encode, PullRequestState, Trigger};
pub use orchestrator::{
    Environment, EnvironmentStatus, EnvironmentSummary, Environments, Orchestrator,
    OrchestratorConfig,
};
pub use pipeline::{PipelineConfig, Reconciler, StartOptions, TriggerOutcome, TriggerReport};
pub use show::{Show, ShowStatus, Ttl};
pub use show_config::{merge_config, ConfigCommand, ShowConfig};
pub use sweep::{cleanup_older_than, parse_age, SweepOptions, SweepReport};
