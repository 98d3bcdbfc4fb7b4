//! # Environment lifecycle
//!
//! [`Orchestrator`] turns the raw calls of a [`ContainerPlatform`] and an
//! [`ImageBuilder`] into whole-environment operations: create, replace,
//! delete, reconfigure and inspect. It keeps no state of its own; every
//! decision is made against what the platform reports right now.
//!
//! Creation is a straight pipeline with no rollback:
//!
//! 1. build the image for the commit
//! 2. push it to the registry
//! 3. refuse to continue if a same-named service is already active
//! 4. register a task-definition revision pointing at the pushed image, in a
//!    family named after the service so the base family is never written
//! 5. create the service with public networking and tracking tags
//! 6. wait for the service to become stable
//! 7. resolve the public address of its task

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::aws::{
    AwsVpcConfiguration, ContainerDefinition, ContainerPlatform, CreateServiceRequest,
    NetworkConfiguration, PlatformError, Service, Tag,
};
use crate::error::{ShowtimeError, ShowtimeResult};
use crate::image::ImageBuilder;
use crate::show::short_sha;
use crate::show_config::{is_flag_env, ShowConfig};
use crate::sweep::{self, SweepOptions, SweepReport};

static SERVICE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^pr-(\d+)-([0-9a-f]{7,40})$").unwrap());

/// Service tag holding the PR number.
pub const TAG_PR: &str = "pr";
/// Service tag holding the requesting user.
pub const TAG_USER: &str = "github_user";
/// Service tag holding the short commit id.
pub const TAG_SHA: &str = "circus_sha";
/// Service tag holding the creation time in epoch seconds.
pub const TAG_CREATED: &str = "circus_created";

/// Deployment constants for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub cluster: String,
    /// Registry repository images are pushed to.
    pub repository: String,
    /// Base task definition new revisions are derived from. Showtime only
    /// reads it; each environment registers revisions in its own family.
    pub task_definition: String,
    pub subnets: Vec<String>,
    pub security_group: String,
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cluster: "superset-ci".to_string(),
            repository: "superset-ci".to_string(),
            task_definition: "superset-ci".to_string(),
            subnets: vec![
                "subnet-0e15a5034b4121710".to_string(),
                "subnet-0e8efef4a72224974".to_string(),
            ],
            security_group: "sg-092ff3a6ae0574d91".to_string(),
            poll_interval: Duration::from_secs(30),
            max_polls: 20,
        }
    }
}

impl OrchestratorConfig {
    #[must_use]
    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    #[must_use]
    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    #[must_use]
    pub fn with_task_definition(mut self, task_definition: impl Into<String>) -> Self {
        self.task_definition = task_definition.into();
        self
    }

    #[must_use]
    pub fn with_subnets(mut self, subnets: Vec<String>) -> Self {
        self.subnets = subnets;
        self
    }

    #[must_use]
    pub fn with_security_group(mut self, security_group: impl Into<String>) -> Self {
        self.security_group = security_group.into();
        self
    }

    #[must_use]
    pub fn with_polling(mut self, poll_interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = poll_interval;
        self.max_polls = max_polls;
        self
    }

    /// Upper bound of the stability wait.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        self.poll_interval * self.max_polls
    }
}

/// Coarse environment status as seen by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Running,
    Building,
    Failed,
    NotFound,
    Unknown,
}

impl EnvironmentStatus {
    /// Reduce a service lookup to a status.
    #[must_use]
    pub fn from_service(service: Option<&Service>) -> Self {
        match service {
            None => Self::NotFound,
            Some(s) if !s.is_active() => Self::Failed,
            Some(s) if s.desired_count > 0 && s.running_count == s.desired_count => Self::Running,
            Some(_) => Self::Building,
        }
    }
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Building => "building",
            Self::Failed => "failed",
            Self::NotFound => "not_found",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A successfully created environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub ip: Ipv4Addr,
    pub service_name: String,
}

/// One tracked service as reported by the platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentSummary {
    pub service_name: String,
    pub pr_number: u64,
    pub sha: String,
    /// Raw platform status (`ACTIVE`, `DRAINING`, ...).
    pub status: String,
    pub running_count: i64,
    pub desired_count: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub requested_by: Option<String>,
}

impl EnvironmentSummary {
    fn from_service(service: &Service) -> Option<Self> {
        let (pr_number, sha) = parse_service_name(&service.service_name)?;
        Some(Self {
            service_name: service.service_name.clone(),
            pr_number,
            sha,
            status: service.status.clone(),
            running_count: service.running_count,
            desired_count: service.desired_count,
            created_at: service.created_time(),
            requested_by: service.tag(TAG_USER).map(str::to_string),
        })
    }
}

/// Split a `pr-<number>-<sha>` service name.
#[must_use]
pub fn parse_service_name(name: &str) -> Option<(u64, String)> {
    let captures = SERVICE_NAME.captures(name)?;
    let pr_number = captures.get(1)?.as_str().parse().ok()?;
    Some((pr_number, captures.get(2)?.as_str().to_string()))
}

/// Environment operations the reconciliation pipeline depends on.
#[async_trait]
pub trait Environments: Send + Sync {
    /// Build, deploy and expose the environment for `sha`.
    async fn create(&self, pr_number: u64, sha: &str, actor: &str) -> ShowtimeResult<Environment>;

    /// Tear down a service and its image. Succeeds if it is already gone.
    async fn delete(&self, service_name: &str, pr_number: u64) -> ShowtimeResult<()>;

    async fn get_ip(&self, service_name: &str) -> ShowtimeResult<Option<Ipv4Addr>>;

    /// Never fails: lookup errors reduce to [`EnvironmentStatus::Unknown`].
    async fn get_status(&self, service_name: &str) -> EnvironmentStatus;

    /// Replace the feature flags of a running service. Flag variables absent
    /// from `flags` are removed.
    async fn update_feature_flags(
        &self,
        service_name: &str,
        flags: &BTreeMap<String, bool>,
    ) -> ShowtimeResult<()>;

    /// All services that look like showtime environments.
    async fn list(&self) -> ShowtimeResult<Vec<EnvironmentSummary>>;

    /// Create the environment for `sha` with `config` applied, then remove
    /// `old_service`. A failure to remove the old service is logged only.
    async fn replace(
        &self,
        old_service: &str,
        pr_number: u64,
        sha: &str,
        actor: &str,
        config: &ShowConfig,
    ) -> ShowtimeResult<Environment>;
}

#[async_trait]
impl<T: Environments + ?Sized> Environments for Box<T> {
    async fn create(&self, pr_number: u64, sha: &str, actor: &str) -> ShowtimeResult<Environment> {
        (**self).create(pr_number, sha, actor).await
    }

    async fn delete(&self, service_name: &str, pr_number: u64) -> ShowtimeResult<()> {
        (**self).delete(service_name, pr_number).await
    }

    async fn get_ip(&self, service_name: &str) -> ShowtimeResult<Option<Ipv4Addr>> {
        (**self).get_ip(service_name).await
    }

    async fn get_status(&self, service_name: &str) -> EnvironmentStatus {
        (**self).get_status(service_name).await
    }

    async fn update_feature_flags(
        &self,
        service_name: &str,
        flags: &BTreeMap<String, bool>,
    ) -> ShowtimeResult<()> {
        (**self).update_feature_flags(service_name, flags).await
    }

    async fn list(&self) -> ShowtimeResult<Vec<EnvironmentSummary>> {
        (**self).list().await
    }

    async fn replace(
        &self,
        old_service: &str,
        pr_number: u64,
        sha: &str,
        actor: &str,
        config: &ShowConfig,
    ) -> ShowtimeResult<Environment> {
        (**self)
            .replace(old_service, pr_number, sha, actor, config)
            .await
    }
}

trait PlatformResultExt<T> {
    fn during(self, operation: &'static str, resource: &str) -> ShowtimeResult<T>;
}

impl<T> PlatformResultExt<T> for Result<T, PlatformError> {
    fn during(self, operation: &'static str, resource: &str) -> ShowtimeResult<T> {
        self.map_err(|e| ShowtimeError::provider(operation, resource, e))
    }
}

/// [`Environments`] on top of a container platform and an image builder.
pub struct Orchestrator<P, B> {
    platform: P,
    builder: B,
    config: OrchestratorConfig,
}

impl<P: ContainerPlatform, B: ImageBuilder> Orchestrator<P, B> {
    pub fn new(platform: P, builder: B, config: OrchestratorConfig) -> Self {
        Self {
            platform,
            builder,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Delete every tracked environment older than `max_age`.
    pub async fn cleanup_older_than(
        &self,
        max_age: Duration,
        options: SweepOptions,
    ) -> ShowtimeResult<SweepReport> {
        sweep::cleanup_older_than(self, max_age, options).await
    }

    async fn create_with_config(
        &self,
        pr_number: u64,
        sha: &str,
        actor: &str,
        config: &ShowConfig,
    ) -> ShowtimeResult<Environment> {
        let short = short_sha(sha);
        let service_name = format!("pr-{pr_number}-{short}");
        let image_tag = format!("{service_name}-ci");

        info!(pr_number, sha = %short, service_name = %service_name, "Creating environment");

        self.builder.build(sha, &image_tag).await?;

        let auth = self
            .platform
            .registry_auth()
            .await
            .during("registry_auth", &self.config.repository)?;
        let image = self
            .builder
            .push(&image_tag, &self.config.repository, &auth)
            .await?;

        if self
            .platform
            .describe_service(&self.config.cluster, &service_name)
            .await
            .during("describe_service", &service_name)?
            .is_some_and(|s| s.is_active())
        {
            return Err(ShowtimeError::AlreadyExists {
                pr_number,
                service_name,
            });
        }

        let task_definition = self
            .register_revision(&service_name, &image, &config.feature_flags())
            .await?;

        let request = CreateServiceRequest {
            cluster: self.config.cluster.clone(),
            service_name: service_name.clone(),
            task_definition,
            desired_count: 1,
            launch_type: "FARGATE".to_string(),
            platform_version: "LATEST".to_string(),
            network_configuration: NetworkConfiguration {
                awsvpc_configuration: AwsVpcConfiguration {
                    subnets: self.config.subnets.clone(),
                    security_groups: vec![self.config.security_group.clone()],
                    assign_public_ip: "ENABLED".to_string(),
                },
            },
            tags: vec![
                Tag::new(TAG_PR, pr_number.to_string()),
                Tag::new(TAG_USER, actor),
                Tag::new(TAG_SHA, short.clone()),
                Tag::new(TAG_CREATED, Utc::now().timestamp().to_string()),
            ],
        };
        self.platform
            .create_service(&request)
            .await
            .during("create_service", &service_name)?;

        self.wait_for_stable(&service_name).await?;

        let ip = self.get_ip(&service_name).await?.ok_or_else(|| {
            ShowtimeError::provider("get_ip", &service_name, "service has no public address")
        })?;

        info!(service_name = %service_name, ip = %ip, "Environment ready");
        Ok(Environment { ip, service_name })
    }

    /// Register a copy of the base task definition running `image` under the
    /// service's own family.
    async fn register_revision(
        &self,
        service_name: &str,
        image: &str,
        flags: &BTreeMap<String, bool>,
    ) -> ShowtimeResult<String> {
        let mut definition = self
            .platform
            .describe_task_definition(&self.config.task_definition)
            .await
            .during("describe_task_definition", &self.config.task_definition)?;

        let container = definition.container_definitions.first_mut().ok_or_else(|| {
            ShowtimeError::provider(
                "register_task_definition",
                service_name,
                "base task definition has no containers",
            )
        })?;
        container.image = image.to_string();
        apply_flags(container, flags);
        definition.family = service_name.to_string();

        self.platform
            .register_task_definition(&definition)
            .await
            .during("register_task_definition", service_name)
    }

    /// Poll until the service is stable, at most `max_polls` times.
    async fn wait_for_stable(&self, service_name: &str) -> ShowtimeResult<()> {
        for attempt in 1..=self.config.max_polls {
            let service = self
                .platform
                .describe_service(&self.config.cluster, service_name)
                .await
                .during("wait_for_stable", service_name)?
                .ok_or_else(|| {
                    ShowtimeError::provider("wait_for_stable", service_name, "service disappeared")
                })?;

            if !service.is_active() {
                return Err(ShowtimeError::provider(
                    "wait_for_stable",
                    service_name,
                    format!("service is {}", service.status),
                ));
            }
            if service.is_stable() {
                debug!(service_name = %service_name, attempt, "Service stable");
                return Ok(());
            }

            debug!(
                service_name = %service_name,
                attempt,
                running = service.running_count,
                desired = service.desired_count,
                deployments = service.deployments.len(),
                "Waiting for service to stabilize"
            );
            if attempt < self.config.max_polls {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }

        Err(ShowtimeError::Timeout {
            resource: service_name.to_string(),
            waited: self.config.max_wait(),
        })
    }
}

/// Replace every flag variable of `container` with `flags`.
fn apply_flags(container: &mut ContainerDefinition, flags: &BTreeMap<String, bool>) {
    container.environment.retain(|e| !is_flag_env(&e.name));
    for (name, enabled) in flags {
        container.set_env(name, if *enabled { "True" } else { "False" });
    }
}

#[async_trait]
impl<P: ContainerPlatform, B: ImageBuilder> Environments for Orchestrator<P, B> {
    #[instrument(skip(self, actor))]
    async fn create(&self, pr_number: u64, sha: &str, actor: &str) -> ShowtimeResult<Environment> {
        self.create_with_config(pr_number, sha, actor, &ShowConfig::standard())
            .await
    }

    #[instrument(skip(self))]
    async fn delete(&self, service_name: &str, pr_number: u64) -> ShowtimeResult<()> {
        let service = self
            .platform
            .describe_service(&self.config.cluster, service_name)
            .await
            .during("describe_service", service_name)?;

        if !service.is_some_and(|s| s.is_active()) {
            debug!(service_name = %service_name, "Service already gone");
            return Ok(());
        }

        match self
            .platform
            .delete_service(&self.config.cluster, service_name)
            .await
        {
            Ok(()) | Err(PlatformError::NotFound(_)) => {}
            Err(e) => return Err(ShowtimeError::provider("delete_service", service_name, e)),
        }

        let image_tag = format!("{service_name}-ci");
        match self
            .platform
            .delete_image(&self.config.repository, &image_tag)
            .await
        {
            Ok(_) | Err(PlatformError::NotFound(_)) => {}
            Err(e) => return Err(ShowtimeError::provider("delete_image", image_tag, e)),
        }

        info!(pr_number, service_name = %service_name, "Environment deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_ip(&self, service_name: &str) -> ShowtimeResult<Option<Ipv4Addr>> {
        let tasks = self
            .platform
            .list_tasks(&self.config.cluster, service_name)
            .await
            .during("list_tasks", service_name)?;
        let Some(task) = tasks.first() else {
            return Ok(None);
        };

        let Some(interface) = self
            .platform
            .task_network_interface(&self.config.cluster, task)
            .await
            .during("describe_tasks", service_name)?
        else {
            return Ok(None);
        };

        self.platform
            .network_interface_public_ip(&interface)
            .await
            .during("describe_network_interfaces", service_name)
    }

    async fn get_status(&self, service_name: &str) -> EnvironmentStatus {
        match self
            .platform
            .describe_service(&self.config.cluster, service_name)
            .await
        {
            Ok(service) => EnvironmentStatus::from_service(service.as_ref()),
            Err(e) => {
                warn!(service_name = %service_name, error = %e, "Status lookup failed");
                EnvironmentStatus::Unknown
            }
        }
    }

    #[instrument(skip(self, flags), fields(count = flags.len()))]
    async fn update_feature_flags(
        &self,
        service_name: &str,
        flags: &BTreeMap<String, bool>,
    ) -> ShowtimeResult<()> {
        let service = self
            .platform
            .describe_service(&self.config.cluster, service_name)
            .await
            .during("describe_service", service_name)?
            .ok_or_else(|| ShowtimeError::NotFound(format!("service {service_name}")))?;

        let current = service.task_definition.ok_or_else(|| {
            ShowtimeError::provider(
                "update_feature_flags",
                service_name,
                "service has no task definition",
            )
        })?;

        let mut definition = self
            .platform
            .describe_task_definition(&current)
            .await
            .during("describe_task_definition", &current)?;
        let container = definition.container_definitions.first_mut().ok_or_else(|| {
            ShowtimeError::provider(
                "update_feature_flags",
                service_name,
                "task definition has no containers",
            )
        })?;
        apply_flags(container, flags);
        definition.family = service_name.to_string();

        let revision = self
            .platform
            .register_task_definition(&definition)
            .await
            .during("register_task_definition", service_name)?;
        self.platform
            .update_service(&self.config.cluster, service_name, &revision)
            .await
            .during("update_service", service_name)?;

        info!(service_name = %service_name, revision = %revision, "Feature flags updated");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self) -> ShowtimeResult<Vec<EnvironmentSummary>> {
        let services = self
            .platform
            .list_services(&self.config.cluster)
            .await
            .during("list_services", &self.config.cluster)?;

        Ok(services
            .iter()
            .filter_map(EnvironmentSummary::from_service)
            .collect())
    }

    #[instrument(skip(self, actor, config))]
    async fn replace(
        &self,
        old_service: &str,
        pr_number: u64,
        sha: &str,
        actor: &str,
        config: &ShowConfig,
    ) -> ShowtimeResult<Environment> {
        let environment = self
            .create_with_config(pr_number, sha, actor, config)
            .await?;

        if let Err(e) = self.delete(old_service, pr_number).await {
            warn!(
                old_service = %old_service,
                error = %e,
                "Failed to delete previous environment"
            );
        }
        Ok(environment)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::aws::{Deployment, RegistryAuth, TaskDefinition, SERVICE_ACTIVE};
    use crate::image::MockImageBuilder;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// In-memory container platform.
    #[derive(Default)]
    pub(crate) struct FakePlatform {
        pub state: Mutex<FakeState>,
    }

    #[derive(Default)]
    pub(crate) struct FakeState {
        pub services: HashMap<String, Service>,
        pub registered: Vec<TaskDefinition>,
        pub deleted_images: Vec<String>,
        pub updates: Vec<(String, String)>,
        /// Polls before a new service reports running tasks.
        pub polls_until_stable: u32,
        pub polls: u32,
        pub fail_delete: bool,
        /// Services whose delete fails.
        pub fail_delete_for: HashSet<String>,
        pub fail_describe: bool,
    }

    pub(crate) fn active_service(name: &str, created_at: f64) -> Service {
        Service {
            service_name: name.to_string(),
            status: SERVICE_ACTIVE.to_string(),
            desired_count: 1,
            running_count: 1,
            deployments: vec![Deployment::default()],
            task_definition: Some("superset-ci:1".to_string()),
            created_at: Some(created_at),
            ..Service::default()
        }
    }

    impl FakePlatform {
        pub(crate) fn with_services(names: &[&str]) -> Self {
            let platform = Self::default();
            {
                let mut state = platform.state.lock().unwrap();
                for name in names {
                    state
                        .services
                        .insert((*name).to_string(), active_service(name, 1_700_000_000.0));
                }
            }
            platform
        }

        fn base_definition() -> TaskDefinition {
            TaskDefinition {
                task_definition_arn: Some("superset-ci:1".to_string()),
                family: "superset-ci".to_string(),
                container_definitions: vec![ContainerDefinition {
                    name: "superset-ci".to_string(),
                    image: "apache/superset:latest".to_string(),
                    ..ContainerDefinition::default()
                }],
                ..TaskDefinition::default()
            }
        }
    }

    #[async_trait]
    impl ContainerPlatform for FakePlatform {
        async fn describe_service(
            &self,
            _cluster: &str,
            service_name: &str,
        ) -> Result<Option<Service>, PlatformError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_describe {
                return Err(PlatformError::Auth("denied".to_string()));
            }
            state.polls += 1;
            let ready = state.polls > state.polls_until_stable;
            Ok(state.services.get_mut(service_name).map(|s| {
                if ready && s.is_active() {
                    s.running_count = s.desired_count;
                }
                s.clone()
            }))
        }

        async fn create_service(
            &self,
            request: &CreateServiceRequest,
        ) -> Result<Service, PlatformError> {
            let mut state = self.state.lock().unwrap();
            state.polls = 0;
            let service = Service {
                service_name: request.service_name.clone(),
                status: SERVICE_ACTIVE.to_string(),
                desired_count: request.desired_count,
                running_count: 0,
                deployments: vec![Deployment::default()],
                task_definition: Some(request.task_definition.clone()),
                tags: request.tags.clone(),
                ..Service::default()
            };
            state
                .services
                .insert(request.service_name.clone(), service.clone());
            Ok(service)
        }

        async fn update_service(
            &self,
            _cluster: &str,
            service_name: &str,
            task_definition: &str,
        ) -> Result<(), PlatformError> {
            let mut state = self.state.lock().unwrap();
            state
                .updates
                .push((service_name.to_string(), task_definition.to_string()));
            Ok(())
        }

        async fn delete_service(
            &self,
            _cluster: &str,
            service_name: &str,
        ) -> Result<(), PlatformError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_delete || state.fail_delete_for.contains(service_name) {
                return Err(PlatformError::Api {
                    status: 500,
                    code: "ServerException".to_string(),
                    message: "boom".to_string(),
                });
            }
            match state.services.get_mut(service_name) {
                Some(service) => {
                    service.status = "INACTIVE".to_string();
                    Ok(())
                }
                None => Err(PlatformError::NotFound(service_name.to_string())),
            }
        }

        async fn list_services(&self, _cluster: &str) -> Result<Vec<Service>, PlatformError> {
            let state = self.state.lock().unwrap();
            let mut services: Vec<Service> = state.services.values().cloned().collect();
            services.sort_by(|a, b| a.service_name.cmp(&b.service_name));
            Ok(services)
        }

        async fn list_tasks(
            &self,
            _cluster: &str,
            service_name: &str,
        ) -> Result<Vec<String>, PlatformError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .services
                .get(service_name)
                .filter(|s| s.running_count > 0)
                .map(|_| vec![format!("arn:task/{service_name}")])
                .unwrap_or_default())
        }

        async fn task_network_interface(
            &self,
            _cluster: &str,
            _task_arn: &str,
        ) -> Result<Option<String>, PlatformError> {
            Ok(Some("eni-0abc".to_string()))
        }

        async fn network_interface_public_ip(
            &self,
            _interface_id: &str,
        ) -> Result<Option<Ipv4Addr>, PlatformError> {
            Ok(Some(Ipv4Addr::new(52, 1, 2, 3)))
        }

        /// Resolves `family:revision` exactly and a bare family to its
        /// latest registered revision, like ECS.
        async fn describe_task_definition(
            &self,
            task_definition: &str,
        ) -> Result<TaskDefinition, PlatformError> {
            let state = self.state.lock().unwrap();
            let found = if task_definition.contains(':') {
                state
                    .registered
                    .iter()
                    .find(|d| d.task_definition_arn.as_deref() == Some(task_definition))
            } else {
                state
                    .registered
                    .iter()
                    .rev()
                    .find(|d| d.family == task_definition)
            };
            match found {
                Some(definition) => Ok(definition.clone()),
                None if task_definition.starts_with("superset-ci") => Ok(Self::base_definition()),
                None => Err(PlatformError::NotFound(task_definition.to_string())),
            }
        }

        async fn register_task_definition(
            &self,
            task_definition: &TaskDefinition,
        ) -> Result<String, PlatformError> {
            let mut state = self.state.lock().unwrap();
            let revision = state
                .registered
                .iter()
                .filter(|d| d.family == task_definition.family)
                .count()
                + 1;
            let arn = format!("{}:{revision}", task_definition.family);
            let mut registered = task_definition.clone();
            registered.task_definition_arn = Some(arn.clone());
            state.registered.push(registered);
            Ok(arn)
        }

        async fn registry_auth(&self) -> Result<RegistryAuth, PlatformError> {
            Ok(RegistryAuth {
                username: "AWS".to_string(),
                password: "secret".to_string(),
                registry: "1234.dkr.ecr.us-west-2.amazonaws.com".to_string(),
            })
        }

        async fn delete_image(&self, _repository: &str, tag: &str) -> Result<bool, PlatformError> {
            let mut state = self.state.lock().unwrap();
            state.deleted_images.push(tag.to_string());
            Ok(true)
        }
    }

    fn builder_ok() -> MockImageBuilder {
        let mut builder = MockImageBuilder::new();
        builder.expect_build().returning(|_, _| Ok(()));
        builder
            .expect_push()
            .returning(|tag, repository, auth| Ok(auth.image_uri(repository, tag)));
        builder
    }

    fn orchestrator(
        platform: FakePlatform,
        builder: MockImageBuilder,
    ) -> Orchestrator<FakePlatform, MockImageBuilder> {
        let config = OrchestratorConfig::default().with_polling(Duration::from_millis(1), 5);
        Orchestrator::new(platform, builder, config)
    }

    #[tokio::test]
    async fn test_create_full_pipeline() {
        let platform = FakePlatform::default();
        platform.state.lock().unwrap().polls_until_stable = 2;
        let orchestrator = orchestrator(platform, builder_ok());

        let env = orchestrator
            .create(1234, "ABC123F0123456789", "maxime")
            .await
            .unwrap();
        assert_eq!(env.service_name, "pr-1234-abc123f");
        assert_eq!(env.ip, Ipv4Addr::new(52, 1, 2, 3));

        let state = orchestrator.platform.state.lock().unwrap();
        let image = &state.registered[0].container_definitions[0].image;
        assert_eq!(
            image,
            "1234.dkr.ecr.us-west-2.amazonaws.com/superset-ci:pr-1234-abc123f-ci"
        );
        let service = &state.services["pr-1234-abc123f"];
        assert_eq!(service.tag(TAG_USER), Some("maxime"));
        assert_eq!(service.tag(TAG_SHA), Some("abc123f"));
        assert_eq!(service.tag(TAG_PR), Some("1234"));
        assert_eq!(state.registered[0].family, "pr-1234-abc123f");
        assert_eq!(service.task_definition.as_deref(), Some("pr-1234-abc123f:1"));
        assert_eq!(
            state.registered[0].container_definitions[0].env("FLASK_DEBUG"),
            Some("False")
        );
    }

    #[tokio::test]
    async fn test_create_rejects_active_service() {
        let platform = FakePlatform::with_services(&["pr-1-abc123f"]);
        let orchestrator = orchestrator(platform, builder_ok());

        let err = orchestrator.create(1, "abc123f", "u").await.unwrap_err();
        assert!(matches!(err, ShowtimeError::AlreadyExists { pr_number: 1, .. }));
    }

    #[tokio::test]
    async fn test_create_build_failure_short_circuits() {
        let mut builder = MockImageBuilder::new();
        builder.expect_build().returning(|_, tag| {
            Err(ShowtimeError::provider("build_image", tag, "exit 1"))
        });
        builder.expect_push().never();
        let orchestrator = orchestrator(FakePlatform::default(), builder);

        let err = orchestrator.create(1, "abc123f", "u").await.unwrap_err();
        assert!(matches!(
            err,
            ShowtimeError::Provider { operation: "build_image", .. }
        ));
        assert!(orchestrator.platform.state.lock().unwrap().services.is_empty());
    }

    #[tokio::test]
    async fn test_stability_wait_times_out() {
        let platform = FakePlatform::default();
        platform.state.lock().unwrap().polls_until_stable = 100;
        let orchestrator = orchestrator(platform, builder_ok());

        let err = orchestrator.create(1, "abc123f", "u").await.unwrap_err();
        match err {
            ShowtimeError::Timeout { resource, waited } => {
                assert_eq!(resource, "pr-1-abc123f");
                assert_eq!(waited, Duration::from_millis(5));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let platform = FakePlatform::with_services(&["pr-1-abc123f"]);
        let orchestrator = orchestrator(platform, builder_ok());

        orchestrator.delete("pr-1-abc123f", 1).await.unwrap();
        orchestrator.delete("pr-1-abc123f", 1).await.unwrap();
        orchestrator.delete("pr-2-def456a", 2).await.unwrap();

        let state = orchestrator.platform.state.lock().unwrap();
        assert_eq!(state.deleted_images, vec!["pr-1-abc123f-ci"]);
    }

    #[tokio::test]
    async fn test_get_status_reduction() {
        let platform = FakePlatform::with_services(&["pr-1-abc123f", "pr-2-def456a"]);
        {
            let mut state = platform.state.lock().unwrap();
            state.polls_until_stable = 100;
            let building = state.services.get_mut("pr-2-def456a").unwrap();
            building.running_count = 0;
        }
        let orchestrator = orchestrator(platform, builder_ok());

        assert_eq!(
            orchestrator.get_status("pr-1-abc123f").await,
            EnvironmentStatus::Running
        );
        assert_eq!(
            orchestrator.get_status("pr-2-def456a").await,
            EnvironmentStatus::Building
        );
        assert_eq!(
            orchestrator.get_status("pr-3-0000000").await,
            EnvironmentStatus::NotFound
        );

        orchestrator.delete("pr-1-abc123f", 1).await.unwrap();
        assert_eq!(
            orchestrator.get_status("pr-1-abc123f").await,
            EnvironmentStatus::Failed
        );

        orchestrator.platform.state.lock().unwrap().fail_describe = true;
        assert_eq!(
            orchestrator.get_status("pr-1-abc123f").await,
            EnvironmentStatus::Unknown
        );
    }

    #[tokio::test]
    async fn test_list_filters_service_names() {
        let platform = FakePlatform::with_services(&[
            "pr-1-abc123f",
            "pr-abc-abc123f",
            "pr-2",
            "superset-ci",
            "pr-3-nothex!",
            "pr-4-def456a",
        ]);
        let orchestrator = orchestrator(platform, builder_ok());

        let names: Vec<String> = orchestrator
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.service_name)
            .collect();
        assert_eq!(names, vec!["pr-1-abc123f", "pr-4-def456a"]);
    }

    #[tokio::test]
    async fn test_update_feature_flags_registers_revision() {
        let platform = FakePlatform::with_services(&["pr-1-abc123f"]);
        let orchestrator = orchestrator(platform, builder_ok());

        let flags = ShowConfig::parse("alerts,debug").feature_flags();
        orchestrator
            .update_feature_flags("pr-1-abc123f", &flags)
            .await
            .unwrap();

        let state = orchestrator.platform.state.lock().unwrap();
        let container = &state.registered[0].container_definitions[0];
        assert_eq!(container.env("SUPERSET_FEATURE_ALERTS"), Some("True"));
        assert_eq!(container.env("FLASK_DEBUG"), Some("True"));
        assert_eq!(
            state.updates,
            vec![("pr-1-abc123f".to_string(), "pr-1-abc123f:1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_flags_do_not_leak_between_environments() {
        let platform = FakePlatform::with_services(&["pr-1-abc123f"]);
        let orchestrator = orchestrator(platform, builder_ok());

        let flags = ShowConfig::parse("alerts,debug").feature_flags();
        orchestrator
            .update_feature_flags("pr-1-abc123f", &flags)
            .await
            .unwrap();
        orchestrator.create(2, "def456a", "bob").await.unwrap();

        let state = orchestrator.platform.state.lock().unwrap();
        let created = state
            .registered
            .iter()
            .find(|d| d.family == "pr-2-def456a")
            .unwrap();
        let container = &created.container_definitions[0];
        assert_eq!(container.env("SUPERSET_FEATURE_ALERTS"), None);
        assert_eq!(container.env("FLASK_DEBUG"), Some("False"));
        assert!(state.registered.iter().all(|d| d.family != "superset-ci"));
    }

    #[tokio::test]
    async fn test_update_feature_flags_replaces_previous_flags() {
        let platform = FakePlatform::with_services(&["pr-1-abc123f"]);
        let orchestrator = orchestrator(platform, builder_ok());

        orchestrator
            .update_feature_flags("pr-1-abc123f", &ShowConfig::parse("alerts").feature_flags())
            .await
            .unwrap();
        orchestrator
            .platform
            .state
            .lock()
            .unwrap()
            .services
            .get_mut("pr-1-abc123f")
            .unwrap()
            .task_definition = Some("pr-1-abc123f:1".to_string());
        orchestrator
            .update_feature_flags("pr-1-abc123f", &ShowConfig::standard().feature_flags())
            .await
            .unwrap();

        let state = orchestrator.platform.state.lock().unwrap();
        let latest = &state.registered[1];
        assert_eq!(latest.task_definition_arn.as_deref(), Some("pr-1-abc123f:2"));
        assert_eq!(latest.container_definitions[0].env("SUPERSET_FEATURE_ALERTS"), None);
        assert_eq!(latest.container_definitions[0].env("FLASK_DEBUG"), Some("False"));
    }

    #[tokio::test]
    async fn test_update_feature_flags_missing_service() {
        let orchestrator = orchestrator(FakePlatform::default(), builder_ok());
        let err = orchestrator
            .update_feature_flags("pr-1-abc123f", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ShowtimeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_replace_applies_config_and_tolerates_old_delete_failure() {
        let platform = FakePlatform::with_services(&["pr-1-abc123f"]);
        platform.state.lock().unwrap().fail_delete = true;
        let orchestrator = orchestrator(platform, builder_ok());

        let env = orchestrator
            .replace(
                "pr-1-abc123f",
                1,
                "def456a999",
                "maxime",
                &ShowConfig::parse("no-alerts"),
            )
            .await
            .unwrap();
        assert_eq!(env.service_name, "pr-1-def456a");

        let state = orchestrator.platform.state.lock().unwrap();
        let container = &state.registered[0].container_definitions[0];
        assert_eq!(container.env("SUPERSET_FEATURE_ALERTS"), Some("False"));
        assert!(state.services["pr-1-abc123f"].is_active());
    }

    #[test]
    fn test_parse_service_name() {
        assert_eq!(
            parse_service_name("pr-1234-abc123f"),
            Some((1234, "abc123f".to_string()))
        );
        assert_eq!(parse_service_name("pr-x-abc123f"), None);
        assert_eq!(parse_service_name("pr-12-ABC123F"), None);
        assert_eq!(parse_service_name("app-12-abc123f"), None);
    }
}
