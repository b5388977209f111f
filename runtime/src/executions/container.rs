//! Container runtime abstraction and its Docker Engine API binding.

use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Everything needed to create one isolated environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name; the execution id.
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    /// `host:container[:ro]` bind specs.
    pub binds: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("container runtime returned {status} for {operation}: {message}")]
    Status {
        operation: &'static str,
        status: u16,
        message: String,
    },
    #[error("container wait reported an error: {0}")]
    Wait(String),
    #[error("unsupported docker host: {0}")]
    UnsupportedHost(String),
}

/// The five calls a container session depends on.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError>;

    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Block until the container is no longer running and return its exit code.
    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError>;

    /// Combined stdout/stderr, raw as the runtime delivers it.
    async fn logs(&self, handle: &ContainerHandle) -> Result<Vec<u8>, RuntimeError>;

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;
}

/// Authority used in request URLs when the engine is reached over a unix socket.
const UNIX_SOCKET_BASE_URL: &str = "http://docker";

/// Docker Engine HTTP API client, over a unix socket or TCP.
///
/// The client has no request timeout: `wait` blocks for as long as the
/// container runs.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    base_url: String,
    client: Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainerBody<'a> {
    image: &'a str,
    cmd: &'a [String],
    host_config: HostConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig<'a> {
    binds: &'a [String],
    auto_remove: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainerResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WaitResponse {
    status_code: i64,
    #[serde(default)]
    error: Option<WaitError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WaitError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct EngineMessage {
    message: String,
}

impl DockerEngine {
    /// Client for a `DOCKER_HOST`-style address: `unix:///path/to/docker.sock`
    /// or an `http(s)://` base URL.
    pub fn connect(docker_host: &str) -> Result<Self, RuntimeError> {
        match docker_host.strip_prefix("unix://") {
            Some(socket) => {
                let client = unix_socket_client(PathBuf::from(socket))?;
                debug!(socket, "using docker engine unix socket");
                Ok(Self::with_client(UNIX_SOCKET_BASE_URL, client))
            }
            None if docker_host.starts_with("http://") || docker_host.starts_with("https://") => {
                Ok(Self::new(docker_host))
            }
            None => Err(RuntimeError::UnsupportedHost(docker_host.to_string())),
        }
    }

    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, RuntimeError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<EngineMessage>(&body)
            .map(|m| m.message)
            .unwrap_or(body);
        Err(RuntimeError::Status {
            operation,
            status: status.as_u16(),
            message,
        })
    }
}

#[cfg(unix)]
fn unix_socket_client(socket: PathBuf) -> Result<Client, RuntimeError> {
    Ok(Client::builder().unix_socket(socket).build()?)
}

#[cfg(not(unix))]
fn unix_socket_client(socket: PathBuf) -> Result<Client, RuntimeError> {
    Err(RuntimeError::UnsupportedHost(format!(
        "unix://{}",
        socket.display()
    )))
}

#[async_trait]
impl ContainerRuntime for DockerEngine {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let body = CreateContainerBody {
            image: &spec.image,
            cmd: &spec.command,
            host_config: HostConfig {
                binds: &spec.binds,
                // Output is read after exit, so the container must outlive its process.
                auto_remove: false,
            },
        };
        let response = self
            .client
            .post(self.url("/containers/create"))
            .query(&[("name", spec.name.as_str())])
            .json(&body)
            .send()
            .await?;
        let created: CreateContainerResponse = Self::check("create", response).await?.json().await?;
        debug!(container = %created.id, name = %spec.name, image = %spec.image, "container created");
        Ok(ContainerHandle { id: created.id })
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let response = self
            .client
            .post(self.url(&format!("/containers/{}/start", handle.id)))
            .send()
            .await?;
        // 304: already started.
        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        Self::check("start", response).await?;
        Ok(())
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError> {
        let response = self
            .client
            .post(self.url(&format!("/containers/{}/wait", handle.id)))
            .query(&[("condition", "not-running")])
            .send()
            .await?;
        let waited: WaitResponse = Self::check("wait", response).await?.json().await?;
        match waited.error {
            Some(err) if !err.message.is_empty() => Err(RuntimeError::Wait(err.message)),
            _ => Ok(waited.status_code),
        }
    }

    async fn logs(&self, handle: &ContainerHandle) -> Result<Vec<u8>, RuntimeError> {
        let response = self
            .client
            .get(self.url(&format!("/containers/{}/logs", handle.id)))
            .query(&[("stdout", "true"), ("stderr", "true")])
            .send()
            .await?;
        let bytes = Self::check("logs", response).await?.bytes().await?;
        Ok(bytes.to_vec())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let response = self
            .client
            .delete(self.url(&format!("/containers/{}", handle.id)))
            .query(&[("force", "true")])
            .send()
            .await?;
        Self::check("remove", response).await?;
        Ok(())
    }
}
