//! AWS API client implementation.
//!
//! ECS and ECR speak the JSON 1.1 protocol (`X-Amz-Target` selects the
//! operation); EC2 speaks the query protocol and answers in XML. All requests
//! are SigV4 signed.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use super::models::{
    AuthorizationTokenResponse, AwsErrorBody, BatchDeleteImageResponse, CreateServiceRequest,
    DescribeServicesResponse, DescribeTasksResponse, ListServicesResponse, ListTasksResponse,
    RegistryAuth, Service, ServiceResponse, TaskDefinition, TaskDefinitionResponse,
};
use super::signing::{sign, Credentials, SignableRequest};
use super::{ContainerPlatform, PlatformError};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// `DescribeServices` accepts at most this many names per call.
const DESCRIBE_BATCH: usize = 10;

const ECS_TARGET_PREFIX: &str = "AmazonEC2ContainerServiceV20141113";
const ECR_TARGET_PREFIX: &str = "AmazonEC2ContainerRegistry_V20150921";
const JSON_CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";
const EC2_API_VERSION: &str = "2016-11-15";

/// Element path of the public address in a `DescribeNetworkInterfaces` reply,
/// below the root element.
const PUBLIC_IP_PATH: [&[u8]; 4] = [
    b"networkInterfaceSet",
    b"item",
    b"association",
    b"publicIp",
];

/// Connection settings for [`Aws`].
#[derive(Debug, Clone)]
pub struct AwsConfig {
    pub region: String,
    pub credentials: Credentials,
    ecs_endpoint: String,
    ecr_endpoint: String,
    ec2_endpoint: String,
}

impl AwsConfig {
    pub fn new(region: impl Into<String>, credentials: Credentials) -> Self {
        let region = region.into();
        Self {
            ecs_endpoint: format!("https://ecs.{region}.amazonaws.com/"),
            ecr_endpoint: format!("https://api.ecr.{region}.amazonaws.com/"),
            ec2_endpoint: format!("https://ec2.{region}.amazonaws.com/"),
            region,
            credentials,
        }
    }

    /// Send every service's requests to one endpoint (local stacks, tests).
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        let endpoint = format!("{}/", endpoint.trim_end_matches('/'));
        self.ecs_endpoint.clone_from(&endpoint);
        self.ecr_endpoint.clone_from(&endpoint);
        self.ec2_endpoint = endpoint;
        self
    }
}

/// AWS container platform.
#[derive(Clone)]
pub struct Aws {
    /// HTTP client.
    client: Client,
    config: AwsConfig,
}

impl Aws {
    /// Create a new AWS client.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(config: AwsConfig) -> Result<Self, PlatformError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(PlatformError::Http)?;

        Ok(Self { client, config })
    }

    /// Sign and execute an ECS call.
    async fn ecs<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        action: &str,
        body: &B,
    ) -> Result<T, PlatformError> {
        let target = format!("{ECS_TARGET_PREFIX}.{action}");
        self.json_request("ecs", &self.config.ecs_endpoint, &target, body)
            .await
    }

    /// Sign and execute an ECR call.
    async fn ecr<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        action: &str,
        body: &B,
    ) -> Result<T, PlatformError> {
        let target = format!("{ECR_TARGET_PREFIX}.{action}");
        self.json_request("ecr", &self.config.ecr_endpoint, &target, body)
            .await
    }

    async fn json_request<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        service: &str,
        endpoint: &str,
        target: &str,
        body: &B,
    ) -> Result<T, PlatformError> {
        debug!(amz_target = %target, "AWS request");
        let body = serde_json::to_vec(body)?;
        let text = self
            .send(
                service,
                endpoint,
                &[("content-type", JSON_CONTENT_TYPE), ("x-amz-target", target)],
                body,
            )
            .await?;

        serde_json::from_str(&text).map_err(|e| {
            warn!(error = %e, body = %text, "Failed to parse response");
            PlatformError::Serialization(e)
        })
    }

    async fn send(
        &self,
        service: &str,
        endpoint: &str,
        headers: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<String, PlatformError> {
        let url = Url::parse(endpoint)
            .map_err(|e| PlatformError::Config(format!("invalid endpoint {endpoint}: {e}")))?;

        let signed = sign(
            &self.config.credentials,
            &self.config.region,
            service,
            &SignableRequest {
                method: "POST",
                url: &url,
                headers,
                body: &body,
            },
            chrono::Utc::now(),
        )?;

        let mut request = self.client.post(url);
        for (name, value) in headers.iter().copied() {
            request = request.header(name, value);
        }
        for (name, value) in signed {
            request = request.header(name, value);
        }

        let response = request.body(body).send().await?;
        Self::handle_response(response).await
    }

    /// Handle API response.
    async fn handle_response(response: reqwest::Response) -> Result<String, PlatformError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            return Ok(text);
        }

        let (code, message) = match serde_json::from_str::<AwsErrorBody>(&text) {
            Ok(body) => (body.code().to_string(), body.message),
            Err(_) => (String::new(), text),
        };

        if status == StatusCode::NOT_FOUND
            || code.ends_with("NotFoundException")
            || code == "ImageNotFound"
        {
            Err(PlatformError::NotFound(message))
        } else if status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
            || code == "AccessDeniedException"
            || code == "UnrecognizedClientException"
        {
            Err(PlatformError::Auth(message))
        } else {
            Err(PlatformError::Api {
                status: status.as_u16(),
                code,
                message,
            })
        }
    }

    async fn describe_services(
        &self,
        cluster: &str,
        names: &[String],
    ) -> Result<Vec<Service>, PlatformError> {
        let response: DescribeServicesResponse = self
            .ecs(
                "DescribeServices",
                &json!({ "cluster": cluster, "services": names, "include": ["TAGS"] }),
            )
            .await?;
        Ok(response.services)
    }
}

#[async_trait]
impl ContainerPlatform for Aws {
    #[instrument(skip(self))]
    async fn describe_service(
        &self,
        cluster: &str,
        service_name: &str,
    ) -> Result<Option<Service>, PlatformError> {
        let services = self
            .describe_services(cluster, &[service_name.to_string()])
            .await?;
        Ok(services
            .into_iter()
            .find(|s| s.service_name == service_name))
    }

    #[instrument(skip(self, request), fields(service_name = %request.service_name))]
    async fn create_service(
        &self,
        request: &CreateServiceRequest,
    ) -> Result<Service, PlatformError> {
        let response: ServiceResponse = self.ecs("CreateService", request).await?;
        Ok(response.service)
    }

    #[instrument(skip(self))]
    async fn update_service(
        &self,
        cluster: &str,
        service_name: &str,
        task_definition: &str,
    ) -> Result<(), PlatformError> {
        let _: ServiceResponse = self
            .ecs(
                "UpdateService",
                &json!({
                    "cluster": cluster,
                    "service": service_name,
                    "taskDefinition": task_definition,
                    "forceNewDeployment": true,
                }),
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_service(
        &self,
        cluster: &str,
        service_name: &str,
    ) -> Result<(), PlatformError> {
        let _: ServiceResponse = self
            .ecs(
                "DeleteService",
                &json!({ "cluster": cluster, "service": service_name, "force": true }),
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_services(&self, cluster: &str) -> Result<Vec<Service>, PlatformError> {
        let mut names = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut body = json!({ "cluster": cluster, "maxResults": 100 });
            if let Some(token) = &next_token {
                body["nextToken"] = json!(token);
            }
            let page: ListServicesResponse = self.ecs("ListServices", &body).await?;
            names.extend(
                page.service_arns
                    .iter()
                    .filter_map(|arn| arn.rsplit('/').next())
                    .map(str::to_string),
            );
            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }

        let mut services = Vec::with_capacity(names.len());
        for batch in names.chunks(DESCRIBE_BATCH) {
            services.extend(self.describe_services(cluster, batch).await?);
        }
        debug!(count = services.len(), "Listed services");
        Ok(services)
    }

    #[instrument(skip(self))]
    async fn list_tasks(
        &self,
        cluster: &str,
        service_name: &str,
    ) -> Result<Vec<String>, PlatformError> {
        let response: ListTasksResponse = self
            .ecs(
                "ListTasks",
                &json!({ "cluster": cluster, "serviceName": service_name }),
            )
            .await?;
        Ok(response.task_arns)
    }

    #[instrument(skip(self))]
    async fn task_network_interface(
        &self,
        cluster: &str,
        task_arn: &str,
    ) -> Result<Option<String>, PlatformError> {
        let response: DescribeTasksResponse = self
            .ecs(
                "DescribeTasks",
                &json!({ "cluster": cluster, "tasks": [task_arn] }),
            )
            .await?;
        Ok(response
            .tasks
            .iter()
            .find_map(|task| task.network_interface_id())
            .map(str::to_string))
    }

    #[instrument(skip(self))]
    async fn network_interface_public_ip(
        &self,
        interface_id: &str,
    ) -> Result<Option<Ipv4Addr>, PlatformError> {
        let body = format!(
            "Action=DescribeNetworkInterfaces&Version={EC2_API_VERSION}&NetworkInterfaceId.1={}",
            urlencoding::encode(interface_id)
        );
        let xml = self
            .send(
                "ec2",
                &self.config.ec2_endpoint,
                &[("content-type", FORM_CONTENT_TYPE)],
                body.into_bytes(),
            )
            .await?;

        parse_public_ip(&xml)
    }

    #[instrument(skip(self))]
    async fn describe_task_definition(
        &self,
        task_definition: &str,
    ) -> Result<TaskDefinition, PlatformError> {
        let response: TaskDefinitionResponse = self
            .ecs(
                "DescribeTaskDefinition",
                &json!({ "taskDefinition": task_definition }),
            )
            .await?;
        Ok(response.task_definition)
    }

    #[instrument(skip(self, task_definition), fields(family = %task_definition.family))]
    async fn register_task_definition(
        &self,
        task_definition: &TaskDefinition,
    ) -> Result<String, PlatformError> {
        let response: TaskDefinitionResponse = self
            .ecs("RegisterTaskDefinition", task_definition)
            .await?;
        response.task_definition.task_definition_arn.ok_or_else(|| {
            PlatformError::Api {
                status: 200,
                code: "MissingArn".to_string(),
                message: "registered task definition has no ARN".to_string(),
            }
        })
    }

    #[instrument(skip(self))]
    async fn registry_auth(&self) -> Result<RegistryAuth, PlatformError> {
        let response: AuthorizationTokenResponse =
            self.ecr("GetAuthorizationToken", &json!({})).await?;
        let data = response
            .authorization_data
            .into_iter()
            .next()
            .ok_or_else(|| PlatformError::Auth("no registry authorization data".to_string()))?;

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(data.authorization_token.as_bytes())
            .map_err(|e| PlatformError::Auth(format!("malformed registry token: {e}")))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|e| PlatformError::Auth(format!("malformed registry token: {e}")))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| PlatformError::Auth("malformed registry token".to_string()))?;

        let registry = data
            .proxy_endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();

        Ok(RegistryAuth {
            username: username.to_string(),
            password: password.to_string(),
            registry,
        })
    }

    #[instrument(skip(self))]
    async fn delete_image(&self, repository: &str, tag: &str) -> Result<bool, PlatformError> {
        let response: BatchDeleteImageResponse = self
            .ecr(
                "BatchDeleteImage",
                &json!({ "repositoryName": repository, "imageIds": [{ "imageTag": tag }] }),
            )
            .await?;

        if let Some(failure) = response
            .failures
            .iter()
            .find(|f| f.failure_code != "ImageNotFound" && f.failure_code != "ImageTagDoesNotMatchDigest")
        {
            return Err(PlatformError::Api {
                status: 200,
                code: failure.failure_code.clone(),
                message: failure.failure_reason.clone(),
            });
        }
        Ok(!response.image_ids.is_empty())
    }
}

/// First public address of the first interface in a `DescribeNetworkInterfaces`
/// reply. Addresses nested under private IP sets are ignored.
pub(crate) fn parse_public_ip(xml: &str) -> Result<Option<Ipv4Addr>, PlatformError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut path: Vec<Vec<u8>> = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => path.push(e.local_name().as_ref().to_vec()),
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(ref e)) => {
                let at_public_ip = path.len() == PUBLIC_IP_PATH.len() + 1
                    && path[1..]
                        .iter()
                        .zip(PUBLIC_IP_PATH)
                        .all(|(seen, want)| seen.as_slice() == want);
                if at_public_ip {
                    let raw = std::str::from_utf8(e)
                        .map_err(|e| PlatformError::Xml(e.to_string()))?;
                    return raw
                        .trim()
                        .parse()
                        .map(Some)
                        .map_err(|e| PlatformError::Xml(format!("publicIp '{raw}': {e}")));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            Err(e) => return Err(PlatformError::Xml(e.to_string())),
            _ => {}
        }
    }
}
