//! Container image build and push.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::aws::RegistryAuth;
use crate::error::{ShowtimeError, ShowtimeResult};

/// Default bound on a single image build.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(45 * 60);

/// Builds an image for a commit and publishes it to the registry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build the image for `sha` and tag it locally as `tag`.
    async fn build(&self, sha: &str, tag: &str) -> ShowtimeResult<()>;

    /// Push the locally tagged image to `repository` and return its full URI.
    async fn push(&self, tag: &str, repository: &str, auth: &RegistryAuth)
        -> ShowtimeResult<String>;
}

/// [`ImageBuilder`] that shells out to an external build tool and `docker`.
///
/// The build tool is invoked as
/// `<program> docker --push --load --preset ci --platform linux/amd64
/// --context-ref <sha> --extra-flags "--build-arg INCLUDE_CHROMIUM=false"`
/// and is expected to leave `<local_repository>:<tag>` in the local daemon.
#[derive(Debug, Clone)]
pub struct CommandImageBuilder {
    program: String,
    docker: String,
    local_repository: String,
    timeout: Duration,
}

impl Default for CommandImageBuilder {
    fn default() -> Self {
        Self {
            program: "supersetbot".to_string(),
            docker: "docker".to_string(),
            local_repository: "apache/superset".to_string(),
            timeout: DEFAULT_BUILD_TIMEOUT,
        }
    }
}

impl CommandImageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    #[must_use]
    pub fn with_docker(mut self, docker: impl Into<String>) -> Self {
        self.docker = docker.into();
        self
    }

    #[must_use]
    pub fn with_local_repository(mut self, repository: impl Into<String>) -> Self {
        self.local_repository = repository.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_args(sha: &str) -> Vec<String> {
        [
            "docker",
            "--push",
            "--load",
            "--preset",
            "ci",
            "--platform",
            "linux/amd64",
            "--context-ref",
            sha,
            "--extra-flags",
            "--build-arg INCLUDE_CHROMIUM=false",
        ]
        .iter()
        .map(ToString::to_string)
        .collect()
    }

    /// Run a command to completion, feeding `stdin` if given.
    async fn run(
        &self,
        operation: &'static str,
        resource: &str,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> ShowtimeResult<String> {
        debug!(program = %program, args = ?args, "Executing command");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            ShowtimeError::provider(operation, resource, format!("failed to spawn '{program}': {e}"))
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await.map_err(|e| {
                ShowtimeError::provider(operation, resource, format!("failed to write stdin: {e}"))
            })?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ShowtimeError::Timeout {
                resource: resource.to_string(),
                waited: self.timeout,
            })?
            .map_err(|e| {
                ShowtimeError::provider(operation, resource, format!("failed to wait for '{program}': {e}"))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                exit_code = ?output.status.code(),
                stderr = %stderr.trim(),
                "Command failed"
            );
            return Err(ShowtimeError::provider(
                operation,
                resource,
                format!(
                    "'{program}' exited with code {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ImageBuilder for CommandImageBuilder {
    async fn build(&self, sha: &str, tag: &str) -> ShowtimeResult<()> {
        info!(sha = %sha, tag = %tag, "Building image");
        self.run("build_image", tag, &self.program, &Self::build_args(sha), None)
            .await?;
        Ok(())
    }

    async fn push(
        &self,
        tag: &str,
        repository: &str,
        auth: &RegistryAuth,
    ) -> ShowtimeResult<String> {
        let local = format!("{}:{tag}", self.local_repository);
        let remote = auth.image_uri(repository, tag);

        self.run(
            "registry_login",
            &auth.registry,
            &self.docker,
            &[
                "login".to_string(),
                "--username".to_string(),
                auth.username.clone(),
                "--password-stdin".to_string(),
                auth.registry.clone(),
            ],
            Some(&auth.password),
        )
        .await?;

        self.run(
            "tag_image",
            tag,
            &self.docker,
            &["tag".to_string(), local, remote.clone()],
            None,
        )
        .await?;

        info!(image = %remote, "Pushing image");
        self.run(
            "push_image",
            tag,
            &self.docker,
            &["push".to_string(), remote.clone()],
            None,
        )
        .await?;

        Ok(remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args() {
        let args = CommandImageBuilder::build_args("abc123f0123");
        let joined = args.join(" ");
        assert!(joined.starts_with("docker --push --load --preset ci"));
        assert!(joined.contains("--context-ref abc123f0123"));
        assert_eq!(
            args.last().map(String::as_str),
            Some("--build-arg INCLUDE_CHROMIUM=false")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_command_is_provider_error() {
        let builder = CommandImageBuilder::new().with_program("false");
        let err = builder.build("abc123f", "pr-1-abc123f-ci").await.unwrap_err();
        assert!(matches!(
            err,
            ShowtimeError::Provider { operation: "build_image", .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_provider_error() {
        let builder = CommandImageBuilder::new().with_program("showtime-no-such-build-tool");
        let err = builder.build("abc123f", "pr-1-abc123f-ci").await.unwrap_err();
        assert!(matches!(err, ShowtimeError::Provider { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_timeout() {
        let builder = CommandImageBuilder::new().with_timeout(Duration::from_millis(50));
        let err = builder
            .run("build_image", "tag", "sleep", &["5".to_string()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ShowtimeError::Timeout { .. }));
    }
}
