//! Docker runtime - bollard for engine API calls, the docker CLI for
//! build / load / save / compose where output streaming matters

use super::{
    BuildContext, BuildOutcome, BuildRequest, ComposeInvocation, ContainerRuntime, LogsQuery,
    PullOutcome, PullRequest, RegistryAuth,
};
use crate::log::TaskLogger;
use crate::process::{run_streaming, CommandOutput, CommandSpec};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    KillContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, RemoveImageOptions};
use bollard::Docker;
use futures::StreamExt;
use harbor_foundation::{Error, Result};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use tracing::{debug, info};

/// Pull events kept in the task result
const PULL_EVENTS_KEPT: usize = 50;

/// Build output lines kept in the task result
const BUILD_EVENTS_KEPT: usize = 100;

/// Engine API timeout (seconds)
const ENGINE_TIMEOUT_SECS: u64 = 120;

/// Docker engine on this host
pub struct DockerRuntime {
    docker: Docker,
    docker_host: Option<String>,
}

impl DockerRuntime {
    /// Connect to `docker_host` (`unix://`, `tcp://`, `http://`) or the
    /// local default socket
    pub fn connect(docker_host: Option<&str>) -> Result<Self> {
        let docker = match docker_host {
            None => Docker::connect_with_local_defaults(),
            Some(host) if host.starts_with("unix://") => Docker::connect_with_socket(
                host,
                ENGINE_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            ),
            Some(host) => Docker::connect_with_http(
                &host.replacen("tcp://", "http://", 1),
                ENGINE_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            ),
        }
        .map_err(|e| Error::Runtime(format!("Failed to connect to Docker: {}", e)))?;

        info!(docker_host = docker_host.unwrap_or("local"), "Docker runtime configured");
        Ok(Self {
            docker,
            docker_host: docker_host.map(str::to_string),
        })
    }

    /// Engine reachability
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| engine_error("Docker ping failed", e))
    }

    /// `docker ...` with the configured host
    fn cli(&self) -> CommandSpec {
        let spec = CommandSpec::new("docker");
        match &self.docker_host {
            Some(host) => spec.env("DOCKER_HOST", host.clone()),
            None => spec,
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, request: &PullRequest, log: &TaskLogger) -> Result<PullOutcome> {
        let target = request.target();
        let tag = match &request.tag {
            Some(tag) => tag.clone(),
            // An empty tag would pull every tag of the repository.
            None if has_tag(&request.image) => String::new(),
            None => "latest".to_string(),
        };
        let options = CreateImageOptions {
            from_image: request.image.clone(),
            tag,
            ..Default::default()
        };
        let credentials = request.auth.as_ref().map(credentials);

        log.line(format!("Pulling {}", target)).await;
        let mut stream = self.docker.create_image(Some(options), None, credentials);
        let mut events: VecDeque<Value> = VecDeque::new();

        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| engine_error("Image pull failed", e))?;
            if let Some(error) = &info.error {
                return Err(Error::Runtime(format!("Image pull failed: {}", error)));
            }
            // Progress bars are kept in events but not logged line by line.
            if info.progress.is_none() {
                if let Some(status) = &info.status {
                    match &info.id {
                        Some(id) => log.line(format!("{}: {}", id, status)).await,
                        None => log.line(status).await,
                    }
                }
            }
            if events.len() == PULL_EVENTS_KEPT {
                events.pop_front();
            }
            events.push_back(serde_json::to_value(&info)?);
        }

        info!(target = %target, "Image pulled");
        Ok(PullOutcome {
            target,
            events: events.into(),
        })
    }

    async fn build_image(&self, request: &BuildRequest, log: &TaskLogger) -> Result<BuildOutcome> {
        let mut spec = self.cli().args(["build", "-t", request.tag.as_str()]);

        let dockerfile = match &request.context {
            // -f is resolved against the working directory for path contexts
            BuildContext::Path(dir) if Path::new(&request.dockerfile).is_relative() => {
                dir.join(&request.dockerfile).to_string_lossy().to_string()
            }
            _ => request.dockerfile.clone(),
        };
        spec = spec.args(["-f", dockerfile.as_str()]);
        if request.no_cache {
            spec = spec.arg("--no-cache");
        }
        if request.pull {
            spec = spec.arg("--pull");
        }
        spec = match &request.context {
            BuildContext::Path(dir) => spec.arg(dir.to_string_lossy().to_string()),
            BuildContext::GitUrl(url) => spec.arg(url.clone()),
            BuildContext::Archive(archive) => spec.arg("-").stdin_file(archive.clone()),
        };

        let output = run_streaming(&spec, Some(log))
            .await?
            .ensure_success("docker build")?;

        let start = output.lines.len().saturating_sub(BUILD_EVENTS_KEPT);
        info!(tag = %request.tag, "Image built");
        Ok(BuildOutcome {
            tag: request.tag.clone(),
            events: output.lines[start..].to_vec(),
        })
    }

    async fn load_image(&self, archive: &Path, log: &TaskLogger) -> Result<Vec<String>> {
        let spec = self
            .cli()
            .args(["load", "-i"])
            .arg(archive.to_string_lossy().to_string());
        let output = run_streaming(&spec, Some(log))
            .await?
            .ensure_success("docker load")?;
        Ok(parse_loaded(&output.lines))
    }

    async fn save_image(&self, image: &str, output: &Path, log: &TaskLogger) -> Result<u64> {
        let spec = self
            .cli()
            .args(["save", "-o"])
            .arg(output.to_string_lossy().to_string())
            .arg(image);
        run_streaming(&spec, Some(log))
            .await?
            .ensure_success("docker save")?;
        let size = tokio::fs::metadata(output).await?.len();
        info!(image, file = %output.display(), size, "Image saved");
        Ok(size)
    }

    async fn remove_image(&self, image: &str, force: bool, noprune: bool) -> Result<Value> {
        let options = RemoveImageOptions { force, noprune };
        let deleted = self
            .docker
            .remove_image(image, Some(options), None)
            .await
            .map_err(|e| engine_error("Image remove failed", e))?;
        info!(image, force, "Image removed");
        Ok(serde_json::to_value(deleted)?)
    }

    async fn container_logs(&self, container_id: &str, query: &LogsQuery) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            since: query.since.unwrap_or(0),
            until: query.until.unwrap_or(0),
            timestamps: query.timestamps,
            tail: query
                .tail
                .map(|n| n.to_string())
                .unwrap_or_else(|| "all".to_string()),
        };

        let mut stream = self.docker.logs(container_id, Some(options));
        let mut text = String::new();
        while let Some(item) = stream.next().await {
            match item.map_err(|e| engine_error("Container logs failed", e))? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => {
                    text.push_str(&String::from_utf8_lossy(&message));
                }
                _ => {}
            }
        }
        debug!(container_id, bytes = text.len(), "Container logs read");
        Ok(text)
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| engine_error("Container remove failed", e))?;
        info!(container_id, force, "Container removed");
        Ok(())
    }

    async fn kill_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await
            .map_err(|e| engine_error("Container kill failed", e))?;
        info!(container_id, "Container killed");
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .stop_container(container_id, None::<StopContainerOptions>)
            .await
            .map_err(|e| engine_error("Container stop failed", e))?;
        info!(container_id, "Container stopped");
        Ok(())
    }

    async fn compose(&self, invocation: &ComposeInvocation, log: &TaskLogger) -> Result<CommandOutput> {
        let mut spec = self
            .cli()
            .arg("compose")
            .arg("-f")
            .arg(invocation.compose_file.to_string_lossy().to_string())
            .arg("-p")
            .arg(invocation.project_name.clone());
        if let Some(dir) = &invocation.project_directory {
            spec = spec
                .arg("--project-directory")
                .arg(dir.to_string_lossy().to_string())
                .cwd(dir.clone());
        }
        for env_file in &invocation.env_files {
            spec = spec
                .arg("--env-file")
                .arg(env_file.to_string_lossy().to_string());
        }
        let spec = invocation
            .env
            .iter()
            .fold(spec, |spec, (key, value)| spec.env(key.clone(), value.clone()))
            .args(invocation.args.iter().cloned())
            .timeout(invocation.timeout);
        run_streaming(&spec, Some(log)).await
    }
}

fn credentials(auth: &RegistryAuth) -> DockerCredentials {
    DockerCredentials {
        username: auth.username.clone(),
        password: auth.password.clone(),
        email: auth.email.clone(),
        serveraddress: auth.serveraddress.clone(),
        identitytoken: auth.identitytoken.clone(),
        ..Default::default()
    }
}

/// `nginx:1.25`, `repo@sha256:..` carry a tag; `localhost:5000/nginx` does not
fn has_tag(image: &str) -> bool {
    if image.contains('@') {
        return true;
    }
    image
        .rsplit('/')
        .next()
        .map(|name| name.contains(':'))
        .unwrap_or(false)
}

/// References from `docker load` output
fn parse_loaded(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| {
            line.strip_prefix("Loaded image: ")
                .or_else(|| line.strip_prefix("Loaded image ID: "))
                .map(|s| s.trim().to_string())
        })
        .collect()
}

fn engine_error(context: &str, err: bollard::errors::Error) -> Error {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => Error::NotFound(message),
        other => Error::Runtime(format!("{}: {}", context, other)),
    }
}
