//! # Prometheus Work Runtime
//!
//! A work scheduler and worker-pool runtime. Discrete units of work are
//! queued in a [`Scheduler`](core::Scheduler) and dispatched to a variable
//! number of workers: tokio tasks, dedicated OS threads, child processes,
//! containers, or remote workers reached over an RPC transport.
//!
//! ## Pieces
//!
//! - **Scheduler**: FIFO queue with pool-type compatibility matching, an
//!   in-flight map, and a completion bus with per-uuid waiters.
//! - **WorkerPool**: a min/max bounded set of workers created through a
//!   [`WorkerFactory`](core::WorkerFactory). It pulls compatible work,
//!   scales up while work is pending, retires idle workers, replaces crashed
//!   ones, and streams log lines back to the scheduler.
//! - **RPC**: a JSON envelope with `Call-Index` correlation, polling and
//!   push transports, and named server-side APIs. The scheduler, worker and
//!   pool APIs in [`runtime::api`] are exposed through it.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_work_runtime::config::WorkerPoolConfig;
//! use prometheus_work_runtime::core::{
//!     LocalSchedulerClient, Scheduler, WorkExecutor, WorkRegistry, WorkSpec, WorkerPool,
//! };
//! use prometheus_work_runtime::runtime::LocalWorkerFactory;
//!
//! let scheduler = Arc::new(Scheduler::default());
//! let executor = WorkExecutor::new(Arc::new(WorkRegistry::with_builtins()));
//! let pool = WorkerPool::start(
//!     WorkerPoolConfig::new().with_name("cpu").with_size(1, 4),
//!     Arc::new(LocalWorkerFactory::new(executor)),
//!     Arc::new(LocalSchedulerClient::new(Arc::clone(&scheduler))),
//! )
//! .await?;
//!
//! let done = scheduler.completion(&"job-1".into());
//! scheduler.schedule(WorkSpec::new("job-1", "Echo").with_arg("hi"))?;
//! let result = done.await?;
//! ```
//!
//! Pools can also be built from a JSON [`RuntimeConfig`](config::RuntimeConfig)
//! with [`builders::build_runtime`].

#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Builders to start pools and runtimes from configuration.
pub mod builders;
/// Configuration models for pools, backends, and the scheduler.
pub mod config;
/// Scheduler, work model, worker pool, and tracker.
pub mod core;
/// Queue and mailbox storage behind the scheduler.
pub mod infra;
/// RPC envelope, transports, server, and client.
pub mod rpc;
/// Worker backends, RPC services, and the stdio worker host.
pub mod runtime;
/// Shared utilities.
pub mod util;
