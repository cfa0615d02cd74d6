//! Container backend: a process host launched through a container CLI.
//!
//! `<runtime> run --rm -i --name work-<id> <image> <args...>` keeps stdin
//! open so the worker API runs over the container's stdio. Containers get
//! no cooperative abort; aborting kills the container.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::core::{PoolError, WorkerFactory, WorkerHost};
use crate::util::WorkerId;

use super::process::ProcessWorkerHost;

/// Container name for worker `id`.
pub fn container_name(id: WorkerId) -> String {
    format!("work-{id}")
}

/// Creates one container per worker.
pub struct ContainerWorkerFactory {
    runtime: String,
    image: String,
    args: Vec<String>,
}

impl ContainerWorkerFactory {
    /// Factory running `image` with the `runtime` CLI (`docker`, `podman`).
    pub fn new(runtime: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            image: image.into(),
            args: Vec::new(),
        }
    }

    /// Arguments appended after the image.
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Full command line used to start worker `id`.
    pub fn run_args(&self, id: WorkerId) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            container_name(id),
            self.image.clone(),
        ];
        args.extend(self.args.iter().cloned());
        args
    }
}

#[async_trait]
impl WorkerFactory for ContainerWorkerFactory {
    fn backend(&self) -> &'static str {
        "container"
    }

    async fn create(&self, id: WorkerId) -> Result<Arc<dyn WorkerHost>, PoolError> {
        let mut command = Command::new(&self.runtime);
        command.args(self.run_args(id));
        let host = ProcessWorkerHost::launch(id, command, container_name(id), false).await?;
        Ok(Arc::new(host))
    }

    async fn destroy(&self, host: Arc<dyn WorkerHost>) -> Result<(), PoolError> {
        let name = container_name(host.id());
        host.kill().await;
        let removed = Command::new(&self.runtime)
            .args(["rm", "-f", name.as_str()])
            .output()
            .await
            .map_err(|e| {
                PoolError::DestroyFailed(format!("cannot run `{} rm`: {e}", self.runtime))
            })?;
        if removed.status.success() {
            debug!(container = %name, "container removed");
        } else {
            warn!(
                container = %name,
                stderr = %String::from_utf8_lossy(&removed.stderr).trim(),
                "container removal reported an error"
            );
        }
        Ok(())
    }
}
