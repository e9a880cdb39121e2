//! Sandbox lifecycle: one named, running desktop container per sandbox name.
//!
//! The manager talks to the container engine through [`ContainerRuntime`] so
//! the lifecycle rules (idempotent start, tolerant teardown, per-name leases)
//! can be exercised without Docker. [`DockerRuntime`] is the `bollard`
//! implementation used by the server.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use desktop_agent_error::DesktopError;
use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::executor::{ActionError, CommandChannel, CommandOutput, DisplayCommand, DEFAULT_DISPLAY};

pub const DEFAULT_IMAGE: &str = "spongebox/spongecake:latest";
pub const DEFAULT_CONTAINER_NAME: &str = "computer_use_agent";
pub const DEFAULT_VNC_PORT: u16 = 5900;
pub const DEFAULT_API_PORT: u16 = 8000;
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("{0}")]
    Other(String),
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(err: bollard::errors::Error) -> Self {
        RuntimeError::Other(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub running: bool,
}

/// Everything needed to create the desktop container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Container ports published on the same host port.
    pub ports: Vec<u16>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// `Ok(None)` when no container with this name exists.
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError>;
    async fn start(&self, name: &str) -> Result<(), RuntimeError>;
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;
    /// Returns the container id. Fails with [`RuntimeError::ImageNotFound`]
    /// when the image is not available locally.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;
    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;
    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;
    async fn exec(
        &self,
        name: &str,
        argv: Vec<String>,
        env: Vec<String>,
    ) -> Result<CommandOutput, RuntimeError>;
}

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let client = Docker::connect_with_defaults()
            .map_err(|err| RuntimeError::Other(format!("failed to connect to docker: {err}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn to_bollard_config(spec: &ContainerSpec) -> Config<String> {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for port in &spec.ports {
        let key = format!("{port}/tcp");
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(port.to_string()),
            }]),
        );
    }

    Config {
        image: Some(spec.image.clone()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            port_bindings: Some(port_bindings),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        match self.client.inspect_container(name, None).await {
            Ok(inspect) => Ok(Some(ContainerInfo {
                id: inspect.id.unwrap_or_else(|| name.to_string()),
                running: inspect
                    .state
                    .and_then(|state| state.running)
                    .unwrap_or(false),
            })),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.client
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| {
                if is_not_found(&err) {
                    RuntimeError::NotFound(name.to_string())
                } else {
                    err.into()
                }
            })
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        info!(image, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(item) = stream.next().await {
            let info = item.map_err(|err| {
                if is_not_found(&err) {
                    RuntimeError::ImageNotFound(image.to_string())
                } else {
                    RuntimeError::Other(format!("failed to pull image {image}: {err}"))
                }
            })?;
            if let Some(error) = info.error {
                return Err(RuntimeError::Other(format!(
                    "failed to pull image {image}: {error}"
                )));
            }
            if let Some(status) = info.status {
                debug!(image, %status, "pull status");
            }
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let created = self
            .client
            .create_container(Some(options), to_bollard_config(spec))
            .await
            .map_err(|err| {
                if is_not_found(&err) {
                    RuntimeError::ImageNotFound(spec.image.clone())
                } else {
                    err.into()
                }
            })?;
        Ok(created.id)
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .client
            .stop_container(name, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Err(RuntimeError::NotFound(name.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Err(RuntimeError::NotFound(name.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    async fn exec(
        &self,
        name: &str,
        argv: Vec<String>,
        env: Vec<String>,
    ) -> Result<CommandOutput, RuntimeError> {
        let exec = self
            .client
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(argv),
                    env: Some(env),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        match self.client.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg? {
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            stdout.extend_from_slice(&message)
                        }
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(RuntimeError::Other(
                    "exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let inspect = self.client.inspect_exec(&exec.id).await?;
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code.unwrap_or(0),
        })
    }
}

/// Runs display commands inside a sandbox container via `docker exec`.
pub struct DockerExecChannel {
    runtime: Arc<dyn ContainerRuntime>,
    container: String,
}

impl DockerExecChannel {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, container: impl Into<String>) -> Self {
        Self {
            runtime,
            container: container.into(),
        }
    }
}

#[async_trait]
impl CommandChannel for DockerExecChannel {
    async fn run(
        &self,
        display: &str,
        command: &DisplayCommand,
    ) -> Result<CommandOutput, ActionError> {
        let argv = if command.detached {
            // Positional args keep the original argv intact; no quoting.
            let mut argv = vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "\"$@\" >/dev/null 2>&1 &".to_string(),
                "sh".to_string(),
            ];
            argv.extend(command.argv());
            argv
        } else {
            command.argv()
        };
        self.runtime
            .exec(&self.container, argv, vec![format!("DISPLAY={display}")])
            .await
            .map_err(|err| ActionError::Channel(err.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
    pub vnc_port: u16,
    pub api_port: u16,
    pub display: String,
    pub settle_delay: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            vnc_port: DEFAULT_VNC_PORT,
            api_port: DEFAULT_API_PORT,
            display: DEFAULT_DISPLAY.to_string(),
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxHandle {
    pub name: String,
    pub container_id: String,
    pub vnc_port: u16,
    pub api_port: u16,
    pub display: String,
}

pub struct SandboxManager {
    runtime: Arc<dyn ContainerRuntime>,
    config: SandboxConfig,
    // Serializes inspect/create so concurrent ensures never double-create.
    lifecycle: Mutex<()>,
    started: Mutex<HashSet<String>>,
    leases: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("config", &self.config)
            .finish()
    }
}

impl SandboxManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: SandboxConfig) -> Self {
        Self {
            runtime,
            config,
            lifecycle: Mutex::new(()),
            started: Mutex::new(HashSet::new()),
            leases: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        self.runtime.clone()
    }

    /// Command channel bound to the named sandbox.
    pub fn channel(&self, name: &str) -> Arc<dyn CommandChannel> {
        Arc::new(DockerExecChannel::new(self.runtime.clone(), name))
    }

    fn handle(&self, name: &str, container_id: String) -> SandboxHandle {
        SandboxHandle {
            name: name.to_string(),
            container_id,
            vnc_port: self.config.vnc_port,
            api_port: self.config.api_port,
            display: self.config.display.clone(),
        }
    }

    fn provisioning(name: &str, err: impl std::fmt::Display) -> DesktopError {
        DesktopError::Provisioning {
            name: name.to_string(),
            message: err.to_string(),
        }
    }

    pub async fn ensure_running(&self, name: &str) -> Result<SandboxHandle, DesktopError> {
        let _guard = self.lifecycle.lock().await;

        let existing = self
            .runtime
            .inspect(name)
            .await
            .map_err(|err| Self::provisioning(name, err))?;

        let container_id = match existing {
            Some(info) if info.running => {
                debug!(name, container_id = %info.id, "sandbox already running");
                return Ok(self.handle(name, info.id));
            }
            Some(info) => {
                info!(name, container_id = %info.id, "starting stopped sandbox");
                self.runtime
                    .start(name)
                    .await
                    .map_err(|err| Self::provisioning(name, err))?;
                info.id
            }
            None => self.create_and_start(name).await?,
        };

        self.started.lock().await.insert(name.to_string());
        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }
        info!(name, %container_id, "sandbox running");
        Ok(self.handle(name, container_id))
    }

    async fn create_and_start(&self, name: &str) -> Result<String, DesktopError> {
        let spec = ContainerSpec {
            name: name.to_string(),
            image: self.config.image.clone(),
            ports: vec![self.config.vnc_port, self.config.api_port],
        };

        if let Err(err) = self.runtime.pull_image(&spec.image).await {
            warn!(image = %spec.image, error = %err, "image pull failed, trying local image");
        }

        let container_id = match self.runtime.create(&spec).await {
            Ok(id) => id,
            Err(RuntimeError::ImageNotFound(_)) => {
                info!(image = %spec.image, "image missing locally, pulling again");
                self.runtime
                    .pull_image(&spec.image)
                    .await
                    .map_err(|err| Self::provisioning(name, err))?;
                self.runtime
                    .create(&spec)
                    .await
                    .map_err(|err| Self::provisioning(name, err))?
            }
            Err(err) => return Err(Self::provisioning(name, err)),
        };

        info!(name, %container_id, image = %spec.image, "created sandbox container");
        self.runtime
            .start(name)
            .await
            .map_err(|err| Self::provisioning(name, err))?;
        Ok(container_id)
    }

    /// Stops and removes the sandbox. An absent sandbox is not an error.
    pub async fn stop(&self, name: &str) -> Result<(), DesktopError> {
        let _guard = self.lifecycle.lock().await;
        self.started.lock().await.remove(name);

        match self.runtime.stop(name).await {
            Ok(()) => {}
            Err(RuntimeError::NotFound(_)) => {
                debug!(name, "sandbox already absent");
                return Ok(());
            }
            Err(err) => return Err(Self::provisioning(name, err)),
        }
        match self.runtime.remove(name).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {
                info!(name, "sandbox stopped");
                Ok(())
            }
            Err(err) => Err(Self::provisioning(name, err)),
        }
    }

    pub async fn is_running(&self, name: &str) -> bool {
        match self.runtime.inspect(name).await {
            Ok(info) => info.map(|info| info.running).unwrap_or(false),
            Err(err) => {
                warn!(name, error = %err, "failed to inspect sandbox");
                false
            }
        }
    }

    /// Claims `name` for `session_id`. Re-acquiring by the holder succeeds.
    pub async fn acquire(&self, name: &str, session_id: &str) -> Result<(), DesktopError> {
        let mut leases = self.leases.lock().await;
        match leases.get(name) {
            Some(holder) if holder != session_id => Err(DesktopError::SandboxBusy {
                name: name.to_string(),
                session_id: holder.clone(),
            }),
            _ => {
                leases.insert(name.to_string(), session_id.to_string());
                Ok(())
            }
        }
    }

    /// Releases the lease if `session_id` holds it.
    pub async fn release(&self, name: &str, session_id: &str) {
        let mut leases = self.leases.lock().await;
        if leases.get(name).map(String::as_str) == Some(session_id) {
            leases.remove(name);
        }
    }

    pub async fn lease_holder(&self, name: &str) -> Option<String> {
        self.leases.lock().await.get(name).cloned()
    }

    /// Stops every sandbox this process started. Errors are logged only.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.started.lock().await.iter().cloned().collect();
        for name in names {
            if let Err(err) = self.stop(&name).await {
                warn!(name = %name, error = %err, "failed to stop sandbox during shutdown");
            }
        }
    }
}
