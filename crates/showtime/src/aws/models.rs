//! AWS API request and response models.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// ECS services
// ============================================================================

/// Status string of a live service.
pub const SERVICE_ACTIVE: &str = "ACTIVE";

/// ECS service description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub service_name: String,
    #[serde(default)]
    pub service_arn: Option<String>,
    /// `ACTIVE`, `DRAINING` or `INACTIVE`.
    pub status: String,
    #[serde(default)]
    pub desired_count: i64,
    #[serde(default)]
    pub running_count: i64,
    #[serde(default)]
    pub pending_count: i64,
    #[serde(default)]
    pub deployments: Vec<Deployment>,
    #[serde(default)]
    pub task_definition: Option<String>,
    /// Creation time in epoch seconds.
    #[serde(default)]
    pub created_at: Option<f64>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl Service {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SERVICE_ACTIVE
    }

    /// ACTIVE with a single deployment whose tasks are all up.
    #[must_use]
    pub fn is_stable(&self) -> bool {
        self.is_active()
            && self.deployments.len() == 1
            && self.desired_count > 0
            && self.running_count == self.desired_count
    }

    #[must_use]
    pub fn created_time(&self) -> Option<DateTime<Utc>> {
        let secs = self.created_at?;
        #[allow(clippy::cast_possible_truncation)]
        let millis = (secs * 1000.0).round() as i64;
        Utc.timestamp_millis_opt(millis).single()
    }

    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }
}

/// One rollout of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    #[serde(default)]
    pub id: Option<String>,
    /// `PRIMARY` or `ACTIVE`.
    pub status: String,
    #[serde(default)]
    pub desired_count: i64,
    #[serde(default)]
    pub running_count: i64,
    #[serde(default)]
    pub rollout_state: Option<String>,
}

/// Resource tag (ECS spelling).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// `CreateService` request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateServiceRequest {
    pub cluster: String,
    pub service_name: String,
    pub task_definition: String,
    pub desired_count: i64,
    pub launch_type: String,
    pub platform_version: String,
    pub network_configuration: NetworkConfiguration,
    pub tags: Vec<Tag>,
}

/// Task placement network settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfiguration {
    pub awsvpc_configuration: AwsVpcConfiguration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsVpcConfiguration {
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    /// `ENABLED` or `DISABLED`.
    pub assign_public_ip: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DescribeServicesResponse {
    #[serde(default)]
    pub services: Vec<Service>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServiceResponse {
    pub service: Service,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListServicesResponse {
    #[serde(default)]
    pub service_arns: Vec<String>,
    #[serde(default)]
    pub next_token: Option<String>,
}

// ============================================================================
// ECS tasks
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListTasksResponse {
    #[serde(default)]
    pub task_arns: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DescribeTasksResponse {
    #[serde(default)]
    pub tasks: Vec<Task>,
}

/// Running task, reduced to its attachments.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default)]
    pub task_arn: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Task {
    /// Id of the task's elastic network interface.
    #[must_use]
    pub fn network_interface_id(&self) -> Option<&str> {
        self.attachments
            .iter()
            .filter(|a| a.kind == "ElasticNetworkInterface")
            .flat_map(|a| a.details.iter())
            .find(|d| d.name == "networkInterfaceId")
            .map(|d| d.value.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub details: Vec<KeyValuePair>,
}

/// `{name, value}` pair used for attachment details and container env vars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValuePair {
    pub name: String,
    pub value: String,
}

// ============================================================================
// ECS task definitions
// ============================================================================

/// Registerable part of a task definition.
///
/// Read-only fields returned by `DescribeTaskDefinition` (revision, status,
/// compatibilities, ...) are dropped, except the ARN which is kept for
/// reference and never sent back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    #[serde(default, skip_serializing)]
    pub task_definition_arn: Option<String>,
    pub family: String,
    pub container_definitions: Vec<ContainerDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_role_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_role_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires_compatibilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<serde_json::Value>,
}

/// Container definition. Fields showtime does not touch are carried through
/// untouched in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerDefinition {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub environment: Vec<KeyValuePair>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ContainerDefinition {
    /// Set an environment variable, replacing any previous value.
    pub fn set_env(&mut self, name: &str, value: impl Into<String>) {
        self.environment.retain(|e| e.name != name);
        self.environment.push(KeyValuePair {
            name: name.to_string(),
            value: value.into(),
        });
    }

    #[must_use]
    pub fn env(&self, name: &str) -> Option<&str> {
        self.environment
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TaskDefinitionResponse {
    pub task_definition: TaskDefinition,
}

// ============================================================================
// ECR
// ============================================================================

/// Decoded registry credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    /// Registry host, without scheme.
    pub registry: String,
}

impl RegistryAuth {
    /// Fully qualified image reference in `repository`.
    #[must_use]
    pub fn image_uri(&self, repository: &str, tag: &str) -> String {
        format!("{}/{repository}:{tag}", self.registry)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthorizationTokenResponse {
    #[serde(default)]
    pub authorization_data: Vec<AuthorizationData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthorizationData {
    pub authorization_token: String,
    pub proxy_endpoint: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BatchDeleteImageResponse {
    #[serde(default)]
    pub image_ids: Vec<serde_json::Value>,
    #[serde(default)]
    pub failures: Vec<ImageFailure>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ImageFailure {
    #[serde(default)]
    pub failure_code: String,
    #[serde(default)]
    pub failure_reason: String,
}

// ============================================================================
// Errors
// ============================================================================

/// JSON error body of the ECS and ECR APIs.
#[derive(Debug, Deserialize)]
pub(crate) struct AwsErrorBody {
    #[serde(rename = "__type", default)]
    pub kind: String,
    #[serde(alias = "Message", default)]
    pub message: String,
}

impl AwsErrorBody {
    /// Error code without the `namespace#` prefix.
    pub fn code(&self) -> &str {
        self.kind.rsplit('#').next().unwrap_or(&self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(status: &str, desired: i64, running: i64, deployments: usize) -> Service {
        Service {
            service_name: "pr-1-abc123f".to_string(),
            status: status.to_string(),
            desired_count: desired,
            running_count: running,
            deployments: vec![Deployment::default(); deployments],
            ..Service::default()
        }
    }

    #[test]
    fn test_service_stability() {
        assert!(service("ACTIVE", 1, 1, 1).is_stable());
        assert!(!service("ACTIVE", 1, 0, 1).is_stable());
        assert!(!service("ACTIVE", 0, 0, 1).is_stable());
        assert!(!service("ACTIVE", 1, 1, 2).is_stable());
        assert!(!service("DRAINING", 1, 1, 1).is_stable());
    }

    #[test]
    fn test_task_definition_drops_read_only_fields() {
        let raw = serde_json::json!({
            "taskDefinitionArn": "arn:aws:ecs:us-west-2:1:task-definition/superset-ci:7",
            "family": "superset-ci",
            "revision": 7,
            "status": "ACTIVE",
            "networkMode": "awsvpc",
            "requiresCompatibilities": ["FARGATE"],
            "cpu": "2048",
            "memory": "4096",
            "containerDefinitions": [{
                "name": "superset-ci",
                "image": "apache/superset:latest",
                "portMappings": [{"containerPort": 8080}],
                "environment": [{"name": "FLASK_DEBUG", "value": "False"}]
            }]
        });
        let def: TaskDefinition = serde_json::from_value(raw).unwrap();
        assert_eq!(def.container_definitions[0].env("FLASK_DEBUG"), Some("False"));

        let sent = serde_json::to_value(&def).unwrap();
        assert!(sent.get("taskDefinitionArn").is_none());
        assert!(sent.get("revision").is_none());
        assert_eq!(
            sent["containerDefinitions"][0]["portMappings"][0]["containerPort"],
            8080
        );
    }

    #[test]
    fn test_set_env_replaces() {
        let mut container = ContainerDefinition::default();
        container.set_env("FLASK_DEBUG", "False");
        container.set_env("FLASK_DEBUG", "True");
        assert_eq!(container.environment.len(), 1);
        assert_eq!(container.env("FLASK_DEBUG"), Some("True"));
    }

    #[test]
    fn test_network_interface_id() {
        let task: Task = serde_json::from_value(serde_json::json!({
            "attachments": [{
                "type": "ElasticNetworkInterface",
                "details": [
                    {"name": "subnetId", "value": "subnet-1"},
                    {"name": "networkInterfaceId", "value": "eni-0abc"}
                ]
            }]
        }))
        .unwrap();
        assert_eq!(task.network_interface_id(), Some("eni-0abc"));
    }

    #[test]
    fn test_error_code() {
        let body: AwsErrorBody = serde_json::from_str(
            r#"{"__type":"com.amazonaws.ecs#ServiceNotFoundException","message":"gone"}"#,
        )
        .unwrap();
        assert_eq!(body.code(), "ServiceNotFoundException");
    }
}
