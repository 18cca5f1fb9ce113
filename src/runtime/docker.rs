//! Docker Engine backend on `bollard`.
//!
//! Connects through the local socket (or `DOCKER_HOST`) unless an explicit
//! address is configured. The connection is made on first use and cached.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerInspectResponse, ContainerSummary, HostConfig};
use bollard::{Docker, API_DEFAULT_VERSION};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{ContainerRuntime, ContainerSpec, ContainerState, ListFilter, RuntimeContainer, RuntimeError};

/// Connection settings for the Docker backend.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Engine address (`unix://`, `tcp://` or `http://`). The local socket,
    /// or `DOCKER_HOST`, when unset.
    pub url: Option<String>,
    /// Container port the GNS3 web console listens on.
    pub console_port: u16,
    /// Host name clients use to reach published ports.
    pub public_host: String,
    /// Grace period handed to `stop` before the daemon kills the container.
    pub stop_grace: Duration,
    pub request_timeout: Duration,
}

pub struct DockerRuntime {
    config: DockerConfig,
    /// Cached Docker connection (created on first use).
    docker: RwLock<Option<Docker>>,
}

impl DockerRuntime {
    pub fn new(config: DockerConfig) -> Self {
        Self {
            config,
            docker: RwLock::new(None),
        }
    }

    /// Get or create the Docker connection.
    async fn docker(&self) -> Result<Docker, RuntimeError> {
        {
            let guard = self.docker.read().await;
            if let Some(ref d) = *guard {
                return Ok(d.clone());
            }
        }
        let timeout = self.config.request_timeout.as_secs().max(1);
        let connected = match self.config.url.as_deref() {
            None => Docker::connect_with_local_defaults(),
            Some(url) if url.starts_with("unix://") => Docker::connect_with_unix(url, timeout, API_DEFAULT_VERSION),
            Some(url) => Docker::connect_with_http(url, timeout, API_DEFAULT_VERSION),
        };
        let docker = connected
            .map_err(|e| RuntimeError::Transient(format!("connect to docker: {e}")))?
            .with_timeout(self.config.request_timeout);
        info!(url = ?self.config.url, "Connected to Docker");
        *self.docker.write().await = Some(docker.clone());
        Ok(docker)
    }

    fn endpoint_for(&self, host_port: Option<u16>) -> Option<String> {
        host_port.map(|port| format!("{}:{}", self.config.public_host, port))
    }

    fn console_key(&self) -> String {
        format!("{}/tcp", self.config.console_port)
    }

    fn inspect_to_container(&self, inspect: ContainerInspectResponse) -> Option<RuntimeContainer> {
        let name = inspect.name?.trim_start_matches('/').to_string();
        let state = inspect
            .state
            .and_then(|s| s.status)
            .map(|status| ContainerState::parse(&status.to_string()))
            .unwrap_or(ContainerState::Unknown);
        let host_port = inspect
            .network_settings
            .and_then(|n| n.ports)
            .and_then(|mut ports| ports.remove(&self.console_key()))
            .flatten()
            .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
            .and_then(|port| port.parse().ok());
        Some(RuntimeContainer {
            name,
            state,
            labels: inspect.config.and_then(|c| c.labels).unwrap_or_default(),
            endpoint: self.endpoint_for(host_port),
        })
    }

    fn summary_to_container(&self, summary: ContainerSummary) -> Option<RuntimeContainer> {
        let name = summary.names?.first()?.trim_start_matches('/').to_string();
        let host_port = summary
            .ports
            .unwrap_or_default()
            .iter()
            .find(|p| p.private_port == self.config.console_port)
            .and_then(|p| p.public_port);
        Some(RuntimeContainer {
            name,
            state: summary
                .state
                .as_deref()
                .map(ContainerState::parse)
                .unwrap_or(ContainerState::Unknown),
            labels: summary.labels.unwrap_or_default(),
            endpoint: self.endpoint_for(host_port),
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<RuntimeContainer, RuntimeError> {
        let docker = self.docker().await?;

        let host_config = HostConfig {
            publish_all_ports: Some(true),
            memory: spec.memory_mb.map(|mb| (mb * 1024 * 1024) as i64),
            ..Default::default()
        };
        let container_config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(HashMap::from([(self.console_key(), HashMap::new())])),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        match docker.create_container(Some(options), container_config).await {
            Ok(_) => info!(name = %spec.name, image = %spec.image, "Created container"),
            // A retried create after a lost response lands here.
            Err(DockerError::DockerResponseServerError { status_code: 409, .. }) => {
                debug!(name = %spec.name, "Container already exists")
            }
            Err(e) => return Err(classify(e, &spec.name)),
        }

        match docker.start_container::<String>(&spec.name, None).await {
            Ok(()) | Err(DockerError::DockerResponseServerError { status_code: 304, .. }) => {}
            Err(e) => return Err(classify(e, &spec.name)),
        }

        let inspect = docker
            .inspect_container(&spec.name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify(e, &spec.name))?;
        self.inspect_to_container(inspect)
            .ok_or_else(|| RuntimeError::Other(format!("inspect of {} returned no name", spec.name)))
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<RuntimeContainer>, RuntimeError> {
        let docker = self.docker().await?;
        let options = ListContainersOptions {
            all: true,
            filters: HashMap::from([("label".to_string(), filter.label_selectors())]),
            ..Default::default()
        };
        let summaries = docker
            .list_containers(Some(options))
            .await
            .map_err(|e| classify(e, "list"))?;
        Ok(summaries
            .into_iter()
            .filter_map(|s| self.summary_to_container(s))
            .collect())
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;
        let grace = self.config.stop_grace.as_secs() as i64;
        match docker
            .stop_container(name, Some(StopContainerOptions { t: grace }))
            .await
        {
            Ok(()) | Err(DockerError::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(e) => Err(classify(e, name)),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            // Removal already in progress on the daemon side.
            Err(DockerError::DockerResponseServerError { status_code: 409, .. }) => {
                Err(RuntimeError::Transient(format!("removal of {name} in progress")))
            }
            Err(e) => Err(classify(e, name)),
        }
    }
}

/// Map a bollard error onto the runtime's retry classes.
fn classify(err: DockerError, subject: &str) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError { status_code, message } => {
            classify_status(status_code, subject, message)
        }
        DockerError::JsonSerdeError { .. } | DockerError::JsonDataError { .. } => RuntimeError::Other(err.to_string()),
        // Timeouts, refused connections and broken transports.
        other => RuntimeError::Transient(other.to_string()),
    }
}

fn classify_status(status: u16, subject: &str, message: String) -> RuntimeError {
    match status {
        404 if subject == "list" => RuntimeError::Other(message),
        404 if message.contains("image") => RuntimeError::InvalidSpec(message),
        404 => RuntimeError::NotFound(format!("{subject}: {message}")),
        400 => RuntimeError::InvalidSpec(message),
        403 | 507 => RuntimeError::QuotaExceeded(message),
        500..=599 => RuntimeError::Transient(message),
        _ => RuntimeError::Other(message),
    }
}
