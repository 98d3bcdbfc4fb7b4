//! # Dry runs
//!
//! Stand-ins that let the trigger pipeline run against a live PR without
//! side effects:
//!
//! - [`DryRunEnvironments`] answers every environment operation with mock
//!   data and never touches the cloud.
//! - [`DryRunStore`] reads labels from a real store but keeps its own writes
//!   in memory, so later steps see the labels earlier steps would have set.
//!
//! [`run_lifecycle`] drives a PR through a full start, configure, sync and
//! stop sequence, typically on top of both.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::ShowtimeResult;
use crate::github::{LabelSnapshot, LabelStore, StoreError};
use crate::labels::Trigger;
use crate::orchestrator::{Environment, EnvironmentStatus, EnvironmentSummary, Environments};
use crate::pipeline::{Reconciler, TriggerReport};
use crate::show::short_sha;
use crate::show_config::ShowConfig;

/// Address reported for every mock environment.
pub const MOCK_IP: Ipv4Addr = Ipv4Addr::new(52, 1, 2, 3);

/// [`Environments`] that only logs what it would do.
#[derive(Debug, Clone, Default)]
pub struct DryRunEnvironments {
    /// Simulated build and deploy time for create and replace.
    delay: Duration,
}

impl DryRunEnvironments {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Environments for DryRunEnvironments {
    async fn create(&self, pr_number: u64, sha: &str, actor: &str) -> ShowtimeResult<Environment> {
        let service_name = format!("pr-{pr_number}-{}", short_sha(sha));
        info!(pr_number, service_name = %service_name, actor, "DRY-RUN-AWS: would build and deploy");
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Environment {
            ip: MOCK_IP,
            service_name,
        })
    }

    async fn delete(&self, service_name: &str, pr_number: u64) -> ShowtimeResult<()> {
        info!(pr_number, service_name = %service_name, "DRY-RUN-AWS: would delete service and image");
        Ok(())
    }

    async fn get_ip(&self, _service_name: &str) -> ShowtimeResult<Option<Ipv4Addr>> {
        Ok(Some(MOCK_IP))
    }

    async fn get_status(&self, _service_name: &str) -> EnvironmentStatus {
        EnvironmentStatus::Running
    }

    async fn update_feature_flags(
        &self,
        service_name: &str,
        flags: &BTreeMap<String, bool>,
    ) -> ShowtimeResult<()> {
        info!(service_name = %service_name, count = flags.len(), "DRY-RUN-AWS: would update feature flags");
        Ok(())
    }

    async fn list(&self) -> ShowtimeResult<Vec<EnvironmentSummary>> {
        Ok(Vec::new())
    }

    async fn replace(
        &self,
        old_service: &str,
        pr_number: u64,
        sha: &str,
        actor: &str,
        config: &ShowConfig,
    ) -> ShowtimeResult<Environment> {
        info!(old_service = %old_service, config = %config, "DRY-RUN-AWS: would replace service");
        self.create(pr_number, sha, actor).await
    }
}

/// [`LabelStore`] that reads through to `inner` and keeps writes in memory.
pub struct DryRunStore<S> {
    inner: S,
    written: Mutex<HashMap<u64, Vec<String>>>,
}

impl<S: LabelStore> DryRunStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            written: Mutex::new(HashMap::new()),
        }
    }

    /// Labels a PR would have after the writes made so far, if any were made.
    pub fn pending(&self, pr_number: u64) -> Option<Vec<String>> {
        self.lock().get(&pr_number).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Vec<String>>> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn current(&self, pr_number: u64) -> Result<Vec<String>, StoreError> {
        if let Some(labels) = self.pending(pr_number) {
            return Ok(labels);
        }
        Ok(self.inner.labels(pr_number).await?.labels)
    }
}

#[async_trait]
impl<S: LabelStore> LabelStore for DryRunStore<S> {
    async fn labels(&self, pr_number: u64) -> Result<LabelSnapshot, StoreError> {
        Ok(LabelSnapshot {
            labels: self.current(pr_number).await?,
            revision: None,
        })
    }

    async fn remove_label(&self, pr_number: u64, label: &str) -> Result<bool, StoreError> {
        let mut labels = self.current(pr_number).await?;
        if !labels.iter().any(|l| l == label) {
            return Ok(false);
        }
        labels.retain(|l| l != label);
        info!(pr_number, label, "DRY-RUN-GITHUB: would remove label");
        self.lock().insert(pr_number, labels);
        Ok(true)
    }

    async fn replace_labels(
        &self,
        pr_number: u64,
        labels: &[String],
        _revision: Option<&str>,
    ) -> Result<(), StoreError> {
        info!(pr_number, ?labels, "DRY-RUN-GITHUB: would set labels");
        self.lock().insert(pr_number, labels.to_vec());
        Ok(())
    }

    async fn latest_commit_sha(&self, pr_number: u64) -> Result<String, StoreError> {
        self.inner.latest_commit_sha(pr_number).await
    }

    async fn open_pull_requests(&self) -> Result<Vec<(u64, Vec<String>)>, StoreError> {
        let mut prs = self.inner.open_pull_requests().await?;
        let written = self.lock();
        for (pr_number, labels) in &mut prs {
            if let Some(pending) = written.get(pr_number) {
                labels.clone_from(pending);
            }
        }
        Ok(prs)
    }
}

/// Walk a PR through start, `conf-enable-ALERTS`, sync and stop without
/// claiming any labels. Stops after the first failing step.
pub async fn run_lifecycle<S: LabelStore, E: Environments>(
    reconciler: &Reconciler<S, E>,
    pr_number: u64,
) -> Vec<TriggerReport> {
    let steps = [
        Trigger::Start,
        Trigger::Config("enable-ALERTS".to_string()),
        Trigger::Sync,
        Trigger::Stop,
    ];

    let mut reports = Vec::with_capacity(steps.len());
    for trigger in steps {
        let result = reconciler.apply(pr_number, &trigger).await;
        let failed = result.is_err();
        reports.push(TriggerReport { trigger, result });
        if failed {
            break;
        }
    }
    reports
}
