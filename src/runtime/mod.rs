//! Worker backends, RPC services and the stdio worker host.

pub mod api;
pub mod backends;
pub mod host;

pub use api::{PoolService, RpcSchedulerClient, SchedulerService, WorkerService};
pub use backends::{
    factory_for, ContainerWorkerFactory, LocalWorkerFactory, ProcessWorkerFactory,
    RemoteWorkerFactory, ThreadWorkerFactory, TransportConnector, DEBUG_PORT_ENV,
};
pub use host::{serve_stdio, worker_host_server};
