//! # Trigger reconciliation
//!
//! The [`Reconciler`] turns trigger labels into environment transitions:
//!
//! ```text
//! labels ──decode──▶ PullRequestState ──trigger──▶ Environments ──encode──▶ labels
//! ```
//!
//! Every trigger is claimed by removing its label before anything else
//! happens. If the label is already gone another run got there first and the
//! trigger is skipped. Claiming gives at-most-one processing per trigger label
//! across concurrent runs; everything after it is written to converge when
//! repeated.
//!
//! Label writes are read-modify-write of the whole set. Labels outside the
//! showtime state markers, pending triggers included, are carried over
//! untouched, and a write that lost a race is retried against a fresh read.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ShowtimeError, ShowtimeResult};
use crate::github::{LabelStore, StoreError};
use crate::labels::{decode, encode_state, is_circus_label, is_state_label, PullRequestState, Trigger};
use crate::orchestrator::Environments;
use crate::show::{short_sha, Show, ShowStatus, Ttl};
use crate::show_config::{ConfigCommand, ShowConfig};

/// Settings for the reconciliation pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// User recorded as requester and passed to the platform.
    pub actor: String,
    pub default_ttl: Ttl,
    /// Attempts for one label write before giving up.
    pub write_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            actor: "unknown".to_string(),
            default_ttl: Ttl::DEFAULT,
            write_attempts: 5,
            retry_base_delay: Duration::from_millis(1000),
            retry_max_delay: Duration::from_millis(5000),
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        let actor = actor.into();
        if !actor.is_empty() {
            self.actor = actor;
        }
        self
    }

    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Ttl) -> Self {
        self.default_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        self.write_attempts = attempts.max(1);
        self.retry_base_delay = base_delay;
        self.retry_max_delay = max_delay;
        self
    }

    /// Capped exponential backoff before retry number `attempt`.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

/// Overrides for an explicit start.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Commit to deploy. Defaults to the PR head.
    pub sha: Option<String>,
    pub ttl: Option<Ttl>,
    pub config: ShowConfig,
}

/// What a processed trigger did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Another run claimed the trigger first.
    Skipped,
    /// Nothing to do.
    NoOp(&'static str),
    Started(Show),
    /// Environment torn down and labels cleared. `clean` is false when a
    /// service delete failed.
    Stopped { clean: bool },
    Synced(Show),
    Configured(ShowConfig),
}

impl fmt::Display for TriggerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped => f.write_str("skipped (claimed elsewhere)"),
            Self::NoOp(reason) => write!(f, "no-op: {reason}"),
            Self::Started(show) => write!(f, "started {}", show.aws_service_name()),
            Self::Stopped { clean: true } => f.write_str("stopped"),
            Self::Stopped { clean: false } => f.write_str("stopped (cloud cleanup incomplete)"),
            Self::Synced(show) => write!(f, "synced to {}", show.sha),
            Self::Configured(config) => write!(f, "configured {config}"),
        }
    }
}

/// Result of one trigger in a batch.
#[derive(Debug)]
pub struct TriggerReport {
    pub trigger: Trigger,
    pub result: ShowtimeResult<TriggerOutcome>,
}

/// Drives environments from PR label state.
pub struct Reconciler<S, E> {
    store: S,
    environments: E,
    config: PipelineConfig,
}

impl<S: LabelStore, E: Environments> Reconciler<S, E> {
    pub fn new(store: S, environments: E, config: PipelineConfig) -> Self {
        Self {
            store,
            environments,
            config,
        }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn environments(&self) -> &E {
        &self.environments
    }

    /// Decode the current state of a PR.
    pub async fn state(&self, pr_number: u64) -> ShowtimeResult<PullRequestState> {
        let snapshot = self.store.labels(pr_number).await?;
        Ok(decode(pr_number, &snapshot.labels, None))
    }

    /// States of every open PR that has at least one show.
    pub async fn active_states(&self) -> ShowtimeResult<Vec<PullRequestState>> {
        Ok(self
            .store
            .open_pull_requests()
            .await?
            .into_iter()
            .map(|(pr_number, labels)| decode(pr_number, &labels, None))
            .filter(PullRequestState::has_shows)
            .collect())
    }

    /// Process every pending trigger on a PR, in label order.
    ///
    /// Each trigger's error is captured in its report; one failing trigger
    /// does not stop the others.
    #[instrument(skip(self))]
    pub async fn handle_triggers(&self, pr_number: u64) -> ShowtimeResult<Vec<TriggerReport>> {
        let triggers = self.state(pr_number).await?.triggers();
        if triggers.is_empty() {
            debug!(pr_number, "No pending triggers");
        }

        let mut reports = Vec::with_capacity(triggers.len());
        for trigger in triggers {
            let result = self.handle_trigger(pr_number, &trigger).await;
            match &result {
                Ok(outcome) => info!(pr_number, trigger = trigger.kind(), %outcome, "Trigger processed"),
                Err(e) => error!(pr_number, trigger = trigger.kind(), error = %e, "Trigger failed"),
            }
            reports.push(TriggerReport { trigger, result });
        }
        Ok(reports)
    }

    /// Claim and process one trigger.
    #[instrument(skip(self, trigger), fields(trigger = trigger.kind()))]
    pub async fn handle_trigger(
        &self,
        pr_number: u64,
        trigger: &Trigger,
    ) -> ShowtimeResult<TriggerOutcome> {
        if !self.store.remove_label(pr_number, &trigger.label()).await? {
            info!(pr_number, "Trigger already claimed, skipping");
            return Ok(TriggerOutcome::Skipped);
        }

        self.apply(pr_number, trigger).await
    }

    /// Run a trigger's transition without claiming its label.
    pub async fn apply(&self, pr_number: u64, trigger: &Trigger) -> ShowtimeResult<TriggerOutcome> {
        match trigger {
            Trigger::Start => self.start(pr_number, StartOptions::default()).await,
            Trigger::Stop => self.stop(pr_number).await,
            Trigger::Sync => self.sync(pr_number).await,
            Trigger::Config(command) => self.configure(pr_number, command).await,
        }
    }

    /// The show a start would create, without side effects.
    pub async fn plan_start(&self, pr_number: u64, options: &StartOptions) -> ShowtimeResult<Show> {
        let state = self.state(pr_number).await?;
        if let Some(current) = state.current_show() {
            return Err(ShowtimeError::AlreadyExists {
                pr_number,
                service_name: current.aws_service_name(),
            });
        }

        let sha = match &options.sha {
            Some(sha) => sha.clone(),
            None => self.store.latest_commit_sha(pr_number).await?,
        };

        Ok(Show::building(pr_number, &sha, Utc::now())
            .with_ttl(Some(options.ttl.unwrap_or(self.config.default_ttl)))
            .with_requester(Some(self.config.actor.clone()))
            .with_config(options.config.clone()))
    }

    /// Create the environment for a PR.
    #[instrument(skip(self, options))]
    pub async fn start(&self, pr_number: u64, options: StartOptions) -> ShowtimeResult<TriggerOutcome> {
        let full_sha = match &options.sha {
            Some(sha) => sha.clone(),
            None => self.store.latest_commit_sha(pr_number).await?,
        };
        let options = StartOptions {
            sha: Some(full_sha.clone()),
            ..options
        };
        let mut show = self.plan_start(pr_number, &options).await?;

        info!(pr_number, sha = %show.sha, "Starting environment");
        self.write_state(pr_number, Some(&show), None).await?;

        let environment = self
            .environments
            .create(pr_number, &full_sha, &self.config.actor)
            .await?;

        show.status = ShowStatus::Running;
        show.ip = Some(environment.ip);
        self.write_state(pr_number, Some(&show), None).await?;

        Ok(TriggerOutcome::Started(show))
    }

    /// Tear down every environment of a PR and clear its showtime labels.
    #[instrument(skip(self))]
    pub async fn stop(&self, pr_number: u64) -> ShowtimeResult<TriggerOutcome> {
        let state = self.state(pr_number).await?;
        if !state.has_shows() {
            return Ok(TriggerOutcome::NoOp("no environment"));
        }

        let mut clean = true;
        for show in state.shows() {
            let service_name = show.aws_service_name();
            if let Err(e) = self.environments.delete(&service_name, pr_number).await {
                warn!(pr_number, service_name = %service_name, error = %e, "Delete failed, clearing labels anyway");
                clean = false;
            }
        }

        self.rewrite_labels(pr_number, |labels| {
            labels.into_iter().filter(|l| !is_circus_label(l)).collect()
        })
        .await?;

        info!(pr_number, clean, "Environment stopped");
        Ok(TriggerOutcome::Stopped { clean })
    }

    /// Move the environment to the PR head if it is behind.
    #[instrument(skip(self))]
    pub async fn sync(&self, pr_number: u64) -> ShowtimeResult<TriggerOutcome> {
        let state = self.state(pr_number).await?;
        let Some(current) = state.current_show() else {
            return Ok(TriggerOutcome::NoOp("no environment"));
        };

        let latest = self.store.latest_commit_sha(pr_number).await?;
        if !current.needs_update(&latest) {
            return Ok(TriggerOutcome::NoOp("already up to date"));
        }
        if state
            .building_show()
            .is_some_and(|b| b.sha == short_sha(&latest))
        {
            return Ok(TriggerOutcome::NoOp("update already in progress"));
        }

        let mut next = Show::building(pr_number, &latest, Utc::now())
            .with_ttl(current.ttl)
            .with_requester(current.requested_by.clone())
            .with_config(current.config.clone());

        let mut updating = current.clone();
        updating.status = ShowStatus::Updating;

        info!(pr_number, from = %current.sha, to = %next.sha, "Syncing environment");
        self.write_state(pr_number, Some(&updating), Some(&next)).await?;

        let environment = self
            .environments
            .replace(
                &current.aws_service_name(),
                pr_number,
                &latest,
                &self.config.actor,
                &current.config,
            )
            .await?;

        next.status = ShowStatus::Running;
        next.ip = Some(environment.ip);
        self.write_state(pr_number, Some(&next), None).await?;

        Ok(TriggerOutcome::Synced(next))
    }

    /// Apply a `conf-*` command to the current environment.
    #[instrument(skip(self))]
    pub async fn configure(&self, pr_number: u64, command: &str) -> ShowtimeResult<TriggerOutcome> {
        let command = ConfigCommand::parse(command)?;

        let state = self.state(pr_number).await?;
        let Some(current) = state.current_show() else {
            return Ok(TriggerOutcome::NoOp("no environment"));
        };

        let config = current.config.apply(&command);
        self.environments
            .update_feature_flags(&current.aws_service_name(), &config.feature_flags())
            .await?;

        let updated = current.clone().with_config(config.clone());
        self.write_state(pr_number, Some(&updated), state.building_show())
            .await?;

        info!(pr_number, config = %config, "Configuration updated");
        Ok(TriggerOutcome::Configured(config))
    }

    /// Replace the state markers on a PR with the encoding of the given shows.
    async fn write_state(
        &self,
        pr_number: u64,
        current: Option<&Show>,
        building: Option<&Show>,
    ) -> ShowtimeResult<()> {
        let encoded = encode_state(current, building);
        self.rewrite_labels(pr_number, |labels| {
            labels
                .into_iter()
                .filter(|l| !is_state_label(l))
                .chain(encoded.iter().cloned())
                .collect()
        })
        .await
    }

    /// Read-modify-write of a PR's labels, retried on concurrent modification.
    async fn rewrite_labels<F>(&self, pr_number: u64, update: F) -> ShowtimeResult<()>
    where
        F: Fn(Vec<String>) -> Vec<String> + Send + Sync,
    {
        let mut attempt = 1;
        loop {
            let snapshot = self.store.labels(pr_number).await?;
            let labels = update(snapshot.labels);

            match self
                .store
                .replace_labels(pr_number, &labels, snapshot.revision.as_deref())
                .await
            {
                Ok(()) => return Ok(()),
                Err(StoreError::ConcurrentModification) if attempt < self.config.write_attempts => {
                    let delay = self.config.backoff(attempt);
                    warn!(pr_number, attempt, ?delay, "Labels changed concurrently, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
