//! Container-restart adapter over the host container runtime.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::RestartContainerOptions;
use tracing::info;

/// Seam between the supervision loop and the container runtime. The loop
/// needs exactly one fallible operation, and tests substitute a counting
/// stub behind it.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Restarts the named container. No retries here; if the target is still
    /// down, the next supervision tick re-probes and tries again.
    async fn restart(&self, container: &str) -> Result<()>;
}

/// Docker implementation, speaking to the daemon over the local unix socket.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the daemon and pings it. An unreachable daemon is a
    /// startup failure, not something to discover on the first restart.
    pub async fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_socket_defaults().context("failed to open the Docker socket")?;
        docker
            .ping()
            .await
            .context("Docker daemon did not answer the ping")?;
        info!("connected to the Docker daemon");
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn restart(&self, container: &str) -> Result<()> {
        info!(container, "restarting container");
        self.docker
            .restart_container(container, None::<RestartContainerOptions>)
            .await
            .with_context(|| format!("failed to restart container {container}"))?;
        Ok(())
    }
}
