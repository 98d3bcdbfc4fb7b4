//! GitHub REST client for PR labels.

use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{header, Client as HttpClient, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use super::{LabelSnapshot, LabelStore, StoreError};

const DEFAULT_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = "showtime/0.2";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_SIZE: usize = 100;

/// Connection settings for [`GitHubLabelClient`].
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub token: String,
    pub owner: String,
    pub repo: String,
    pub api_url: String,
}

impl GitHubConfig {
    /// Build from a token and an `owner/repo` slug.
    pub fn new(token: impl Into<String>, repository: &str) -> Result<Self, StoreError> {
        let (owner, repo) = repository
            .split_once('/')
            .filter(|(o, r)| !o.is_empty() && !r.is_empty() && !r.contains('/'))
            .ok_or_else(|| {
                StoreError::Config(format!(
                    "repository must be in owner/repo format, got '{repository}'"
                ))
            })?;

        Ok(Self {
            token: token.into(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
        })
    }

    /// Point the client at another API root (GitHub Enterprise, tests).
    #[must_use]
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[derive(Debug, Deserialize)]
struct GitHubError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GitHubLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GitHubHead {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GitHubPR {
    number: u64,
    #[serde(default)]
    labels: Vec<GitHubLabel>,
    head: GitHubHead,
}

#[derive(Debug)]
struct RateLimit {
    remaining: i64,
    reset_at: Option<Instant>,
}

/// GitHub API client for PR label operations.
pub struct GitHubLabelClient {
    http_client: HttpClient,
    config: GitHubConfig,
    rate_limit: Mutex<RateLimit>,
}

impl GitHubLabelClient {
    /// Create a new client.
    pub fn new(config: GitHubConfig) -> Result<Self, StoreError> {
        let http_client = HttpClient::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http_client,
            config,
            rate_limit: Mutex::new(RateLimit {
                remaining: 5000,
                reset_at: None,
            }),
        })
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.config.api_url, self.config.owner, self.config.repo, path
        )
    }

    async fn fetch_pull_request(&self, pr_number: u64) -> Result<(GitHubPR, Option<String>), StoreError> {
        let url = self.repo_url(&format!("pulls/{pr_number}"));
        let response = self
            .make_request(reqwest::Method::GET, &url, None, None)
            .await?;
        let response = Self::ensure_success(response).await?;

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);

        let pr: GitHubPR = response.json().await?;
        Ok((pr, etag))
    }

    /// Make an HTTP request with rate limiting.
    async fn make_request(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<serde_json::Value>,
        if_match: Option<&str>,
    ) -> Result<Response, StoreError> {
        self.check_rate_limit()?;

        let mut request = self
            .http_client
            .request(method, url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.config.token))
            .header(header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");

        if let Some(etag) = if_match {
            request = request.header(header::IF_MATCH, etag);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        self.update_rate_limit(&response);

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(StoreError::AuthenticationFailed),
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
                if header_i64(&response, "x-ratelimit-remaining") == Some(0) =>
            {
                Err(StoreError::RateLimitExceeded {
                    reset_in: Self::rate_limit_reset(&response)
                        .unwrap_or(Duration::from_secs(60)),
                })
            }
            _ => Ok(response),
        }
    }

    /// Turn a non-2xx response into an API error.
    async fn ensure_success(response: Response) -> Result<Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(Self::api_error(response).await)
    }

    async fn api_error(response: Response) -> StoreError {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<GitHubError>(&text)
            .map(|e| e.message)
            .unwrap_or(text);
        StoreError::Api { status, message }
    }

    fn check_rate_limit(&self) -> Result<(), StoreError> {
        let limit = self
            .rate_limit
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(reset_at) = limit.reset_at {
            let now = Instant::now();
            if limit.remaining <= 0 && now < reset_at {
                return Err(StoreError::RateLimitExceeded {
                    reset_in: reset_at - now,
                });
            }
        }
        Ok(())
    }

    fn update_rate_limit(&self, response: &Response) {
        let mut limit = self
            .rate_limit
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(remaining) = header_i64(response, "x-ratelimit-remaining") {
            limit.remaining = remaining;
        }
        if let Some(reset_in) = Self::rate_limit_reset(response) {
            limit.reset_at = Some(Instant::now() + reset_in);
        }
    }

    fn rate_limit_reset(response: &Response) -> Option<Duration> {
        header_i64(response, "x-ratelimit-reset").map(|reset_timestamp| {
            let now = chrono::Utc::now().timestamp();
            Duration::from_secs(u64::try_from(reset_timestamp - now).unwrap_or(0))
        })
    }
}

fn header_i64(response: &Response, name: &str) -> Option<i64> {
    response
        .headers()
        .get(name)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| i64::from_str(s).ok())
}

#[async_trait]
impl LabelStore for GitHubLabelClient {
    #[instrument(skip(self))]
    async fn labels(&self, pr_number: u64) -> Result<LabelSnapshot, StoreError> {
        let (pr, revision) = self.fetch_pull_request(pr_number).await?;
        let labels: Vec<String> = pr.labels.into_iter().map(|label| label.name).collect();

        debug!("Retrieved {} labels for PR #{}", labels.len(), pr_number);
        Ok(LabelSnapshot { labels, revision })
    }

    #[instrument(skip(self))]
    async fn remove_label(&self, pr_number: u64, label: &str) -> Result<bool, StoreError> {
        let url = self.repo_url(&format!(
            "issues/{pr_number}/labels/{}",
            urlencoding::encode(label)
        ));

        let response = self
            .make_request(reqwest::Method::DELETE, &url, None, None)
            .await?;

        match response.status() {
            status if status.is_success() => {
                debug!("Removed label '{}' from PR #{}", label, pr_number);
                Ok(true)
            }
            StatusCode::NOT_FOUND => {
                debug!(
                    "Label '{}' not found on PR #{} (already removed)",
                    label, pr_number
                );
                Ok(false)
            }
            _ => Err(Self::api_error(response).await),
        }
    }

    #[instrument(skip(self, labels), fields(count = labels.len()))]
    async fn replace_labels(
        &self,
        pr_number: u64,
        labels: &[String],
        revision: Option<&str>,
    ) -> Result<(), StoreError> {
        let url = self.repo_url(&format!("issues/{pr_number}/labels"));
        let body = serde_json::json!({ "labels": labels });

        let response = self
            .make_request(reqwest::Method::PUT, &url, Some(body), revision)
            .await?;

        match response.status() {
            status if status.is_success() => {
                info!(
                    "Replaced all labels on PR #{} with {} labels",
                    pr_number,
                    labels.len()
                );
                Ok(())
            }
            StatusCode::PRECONDITION_FAILED => Err(StoreError::ConcurrentModification),
            _ => Err(Self::api_error(response).await),
        }
    }

    #[instrument(skip(self))]
    async fn latest_commit_sha(&self, pr_number: u64) -> Result<String, StoreError> {
        let (pr, _) = self.fetch_pull_request(pr_number).await?;
        Ok(pr.head.sha)
    }

    #[instrument(skip(self))]
    async fn open_pull_requests(&self) -> Result<Vec<(u64, Vec<String>)>, StoreError> {
        let mut result = Vec::new();
        let mut page = 1;

        loop {
            let url = self.repo_url(&format!(
                "pulls?state=open&per_page={PAGE_SIZE}&page={page}"
            ));
            let response = self
                .make_request(reqwest::Method::GET, &url, None, None)
                .await?;
            let prs: Vec<GitHubPR> = Self::ensure_success(response).await?.json().await?;
            let count = prs.len();

            result.extend(prs.into_iter().map(|pr| {
                (
                    pr.number,
                    pr.labels.into_iter().map(|label| label.name).collect(),
                )
            }));

            if count < PAGE_SIZE {
                break;
            }
            page += 1;
        }

        debug!("Found {} open PRs", result.len());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header as header_eq, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> GitHubLabelClient {
        let config = GitHubConfig::new("test-token", "apache/superset")
            .unwrap()
            .with_api_url(server.uri());
        GitHubLabelClient::new(config).unwrap()
    }

    fn pr_body(number: u64, labels: &[&str]) -> serde_json::Value {
        serde_json::json!({
            "number": number,
            "head": { "sha": "abc123f0123456789abcdef0123456789abcdef0" },
            "labels": labels.iter().map(|l| serde_json::json!({ "name": l })).collect::<Vec<_>>(),
        })
    }

    #[test]
    fn test_repository_slug_validation() {
        assert!(GitHubConfig::new("t", "apache/superset").is_ok());
        assert!(GitHubConfig::new("t", "superset").is_err());
        assert!(GitHubConfig::new("t", "/superset").is_err());
        assert!(GitHubConfig::new("t", "a/b/c").is_err());
    }

    #[tokio::test]
    async fn test_labels_with_etag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/apache/superset/pulls/1234"))
            .and(header_eq("authorization", "Bearer test-token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "\"rev-1\"")
                    .set_body_json(pr_body(1234, &["bug", "🎪 🚦 running"])),
            )
            .mount(&server)
            .await;

        let snapshot = client(&server).await.labels(1234).await.unwrap();
        assert_eq!(snapshot.labels, vec!["bug", "🎪 🚦 running"]);
        assert_eq!(snapshot.revision.as_deref(), Some("\"rev-1\""));
    }

    #[tokio::test]
    async fn test_latest_commit_sha() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/apache/superset/pulls/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(pr_body(7, &[])))
            .mount(&server)
            .await;

        let sha = client(&server).await.latest_commit_sha(7).await.unwrap();
        assert!(sha.starts_with("abc123f"));
    }

    #[tokio::test]
    async fn test_remove_label_reports_claim() {
        let server = MockServer::start().await;
        let encoded = urlencoding::encode("🎪 trigger-start").into_owned();

        Mock::given(method("DELETE"))
            .and(path(format!("/repos/apache/superset/issues/1/labels/{encoded}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("/repos/apache/superset/issues/1/labels/{encoded}")))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(serde_json::json!({ "message": "Label does not exist" })),
            )
            .mount(&server)
            .await;

        let client = client(&server).await;
        assert!(client.remove_label(1, "🎪 trigger-start").await.unwrap());
        assert!(!client.remove_label(1, "🎪 trigger-start").await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_labels_conditional() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/repos/apache/superset/issues/5/labels"))
            .and(header_eq("if-match", "\"stale\""))
            .respond_with(ResponseTemplate::new(412))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/repos/apache/superset/issues/5/labels"))
            .and(body_json(serde_json::json!({ "labels": ["bug"] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let client = client(&server).await;
        let labels = vec!["bug".to_string()];
        let err = client
            .replace_labels(5, &labels, Some("\"stale\""))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConcurrentModification));
        client.replace_labels(5, &labels, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_pull_requests_paginates() {
        let server = MockServer::start().await;
        let first_page: Vec<_> = (1..=100).map(|n| pr_body(n, &[])).collect();
        Mock::given(method("GET"))
            .and(path("/repos/apache/superset/pulls"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(first_page))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/apache/superset/pulls"))
            .and(query_param("page", "2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(vec![pr_body(101, &["🎪 🎯 abc123f"])]),
            )
            .mount(&server)
            .await;

        let prs = client(&server).await.open_pull_requests().await.unwrap();
        assert_eq!(prs.len(), 101);
        assert_eq!(prs[100], (101, vec!["🎪 🎯 abc123f".to_string()]));
    }

    #[tokio::test]
    async fn test_authentication_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client(&server).await.labels(1).await.unwrap_err();
        assert!(matches!(err, StoreError::AuthenticationFailed));
    }

    #[tokio::test]
    async fn test_api_error_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(422)
                    .set_body_json(serde_json::json!({ "message": "Validation Failed" })),
            )
            .mount(&server)
            .await;

        let err = client(&server).await.labels(1).await.unwrap_err();
        assert!(
            matches!(err, StoreError::Api { status: 422, ref message } if message == "Validation Failed")
        );
    }
}
