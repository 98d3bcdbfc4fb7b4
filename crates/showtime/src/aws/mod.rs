//! Container platform access.
//!
//! [`ContainerPlatform`] is the raw-call seam the orchestrator drives. It is
//! implemented by [`Aws`] for the services showtime needs:
//!
//! - **ECS**: services, tasks and task definitions
//! - **ECR**: registry credentials and image cleanup
//! - **EC2**: public address lookup for a task's network interface

mod client;
mod models;
mod signing;

use std::net::Ipv4Addr;

use async_trait::async_trait;
use thiserror::Error;

pub use client::{Aws, AwsConfig};
pub use models::*;
pub use signing::Credentials;

/// Errors returned by container platform calls.
#[derive(Error, Debug)]
pub enum PlatformError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} {code} - {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Authentication error.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed XML response.
    #[error("XML error: {0}")]
    Xml(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Raw cloud operations used by the orchestrator.
///
/// Every call is a single remote request (or a paginated sequence of them);
/// sequencing, waiting and error policy live in the orchestrator.
#[async_trait]
pub trait ContainerPlatform: Send + Sync {
    /// Describe one service. `None` if the cluster does not know it.
    async fn describe_service(
        &self,
        cluster: &str,
        service_name: &str,
    ) -> Result<Option<Service>, PlatformError>;

    /// Create a service.
    async fn create_service(&self, request: &CreateServiceRequest)
        -> Result<Service, PlatformError>;

    /// Point a service at another task definition and roll it.
    async fn update_service(
        &self,
        cluster: &str,
        service_name: &str,
        task_definition: &str,
    ) -> Result<(), PlatformError>;

    /// Force-delete a service, stopping its tasks.
    async fn delete_service(&self, cluster: &str, service_name: &str)
        -> Result<(), PlatformError>;

    /// Describe every service in the cluster.
    async fn list_services(&self, cluster: &str) -> Result<Vec<Service>, PlatformError>;

    /// Task ARNs currently belonging to a service.
    async fn list_tasks(
        &self,
        cluster: &str,
        service_name: &str,
    ) -> Result<Vec<String>, PlatformError>;

    /// Elastic network interface attached to a task.
    async fn task_network_interface(
        &self,
        cluster: &str,
        task_arn: &str,
    ) -> Result<Option<String>, PlatformError>;

    /// Public address associated with a network interface.
    async fn network_interface_public_ip(
        &self,
        interface_id: &str,
    ) -> Result<Option<Ipv4Addr>, PlatformError>;

    /// Fetch a task definition by family, `family:revision` or ARN.
    async fn describe_task_definition(
        &self,
        task_definition: &str,
    ) -> Result<TaskDefinition, PlatformError>;

    /// Register a new revision and return its ARN.
    async fn register_task_definition(
        &self,
        task_definition: &TaskDefinition,
    ) -> Result<String, PlatformError>;

    /// Short-lived credentials for the image registry.
    async fn registry_auth(&self) -> Result<RegistryAuth, PlatformError>;

    /// Delete one image tag. Returns `false` if the tag did not exist.
    async fn delete_image(&self, repository: &str, tag: &str) -> Result<bool, PlatformError>;
}
