//! Worker backends: how a pool turns a worker id into a running host.

pub mod container;
pub mod local;
pub mod process;
pub mod remote;
pub mod thread;

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::{BackendConfig, WorkerPoolConfig};
use crate::core::{WorkExecutor, WorkRegistry, WorkerFactory};

pub use container::{container_name, ContainerWorkerFactory};
pub use local::{LocalWorkerFactory, LocalWorkerHost};
pub use process::{ProcessWorkerFactory, ProcessWorkerHost, DEBUG_PORT_ENV};
pub use remote::{RemoteWorkerFactory, RemoteWorkerHost, TransportConnector};
pub use thread::{ThreadWorkerFactory, ThreadWorkerHost};

/// Resolves once the kill flag is raised or its sender is gone.
pub(crate) async fn wait_killed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|killed| *killed).await;
}

/// Factory for the backend named in `config`.
///
/// In-process backends run work through `registry`; process and container
/// backends carry their own registry on the far side.
pub fn factory_for(
    config: &WorkerPoolConfig,
    registry: Arc<WorkRegistry>,
) -> Arc<dyn WorkerFactory> {
    let executor = WorkExecutor::new(registry).with_abort_grace(config.abort_grace());
    match &config.backend {
        BackendConfig::Local => Arc::new(LocalWorkerFactory::new(executor)),
        BackendConfig::Thread { stack_size } => {
            Arc::new(ThreadWorkerFactory::new(executor).with_stack_size(*stack_size))
        }
        BackendConfig::Process {
            program,
            args,
            env,
            debug_port_base,
        } => Arc::new(
            ProcessWorkerFactory::new(program.clone())
                .with_args(args.clone())
                .with_env(env.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .with_debug_port_base(*debug_port_base),
        ),
        BackendConfig::Container {
            runtime,
            image,
            args,
        } => Arc::new(
            ContainerWorkerFactory::new(runtime.clone(), image.clone()).with_args(args.clone()),
        ),
    }
}
