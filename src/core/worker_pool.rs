//! Worker pool: a min/max-sized set of workers behind a pluggable factory.
//!
//! The pool is backend-agnostic. Everything specific to a runtime (thread
//! spawning, child processes, container images, remote endpoints) lives
//! behind [`WorkerFactory`] and [`WorkerHost`]; the pool and the
//! [`WorkerTracker`](crate::core::tracker::WorkerTracker) only see
//! `create`/`destroy`/`run`/`kill`.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_work_runtime::config::WorkerPoolConfig;
//! use prometheus_work_runtime::core::{
//!     LocalSchedulerClient, Scheduler, WorkExecutor, WorkRegistry, WorkerPool,
//! };
//! use prometheus_work_runtime::runtime::backends::LocalWorkerFactory;
//!
//! let scheduler = Arc::new(Scheduler::default());
//! let executor = WorkExecutor::new(Arc::new(WorkRegistry::with_builtins()));
//! let pool = WorkerPool::start(
//!     WorkerPoolConfig::new().with_name("cpu").with_size(1, 4),
//!     Arc::new(LocalWorkerFactory::new(executor)),
//!     Arc::new(LocalSchedulerClient::new(scheduler.clone())),
//! )
//! .await?;
//! ```

mod pool;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::tracker::{TransitionError, WorkerState};
use crate::core::work::{AbortSignal, LogSink, WorkOutcome, WorkSpec};
use crate::util::{WorkId, WorkerId};

pub use pool::WorkerPool;

/// Errors that can occur when using a `WorkerPool`.
#[derive(Debug)]
pub enum PoolError {
    /// The factory could not create a worker.
    CreateFailed(String),

    /// The factory could not tear a worker down.
    DestroyFailed(String),

    /// No worker in this pool is running the given item.
    WorkNotFound(WorkId),

    /// The pool has been shut down.
    PoolShutdown,

    /// Configuration validation failed.
    InvalidConfig(String),

    /// Internal error (illegal state transition, channel closed, etc.).
    Internal(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateFailed(msg) => write!(f, "cannot create worker: {msg}"),
            Self::DestroyFailed(msg) => write!(f, "cannot destroy worker: {msg}"),
            Self::WorkNotFound(uuid) => write!(f, "no worker is running `{uuid}`"),
            Self::PoolShutdown => write!(f, "pool has been shut down"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<TransitionError> for PoolError {
    fn from(e: TransitionError) -> Self {
        Self::Internal(e.to_string())
    }
}

/// How a host finished a `run` call.
#[derive(Debug, Clone, PartialEq)]
pub enum HostOutcome {
    /// The work reached a terminal outcome; the host is reusable.
    Finished(WorkOutcome),
    /// The backend exited while running; the host is gone.
    Exited {
        /// Exit code, if the backend reported one.
        code: Option<i32>,
        /// What was observed.
        detail: String,
    },
}

/// One execution backend instance, able to run one item at a time.
#[async_trait]
pub trait WorkerHost: Send + Sync {
    /// Worker identity.
    fn id(&self) -> WorkerId;

    /// Whether `run` honors the abort signal. Hosts that cannot cancel
    /// cooperatively are killed instead.
    fn cooperative_abort(&self) -> bool {
        true
    }

    /// Execute `spec`, streaming log lines to `log`.
    async fn run(&self, spec: WorkSpec, log: LogSink, abort: AbortSignal) -> HostOutcome;

    /// Forcefully stop the backend. A pending `run` returns
    /// [`HostOutcome::Exited`].
    async fn kill(&self);
}

/// Creates and destroys hosts for one backend kind.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Backend name reported in pool status (`local`, `thread`, ...).
    fn backend(&self) -> &'static str;

    /// Start a new backend instance.
    async fn create(&self, id: WorkerId) -> Result<Arc<dyn WorkerHost>, PoolError>;

    /// Tear a backend instance down.
    async fn destroy(&self, host: Arc<dyn WorkerHost>) -> Result<(), PoolError>;
}

/// Per-worker entry of [`PoolStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    /// Worker identity.
    pub uuid: WorkerId,
    /// Lifecycle state.
    pub state: WorkerState,
    /// Item being executed.
    pub work: Option<WorkId>,
    /// Items finished by this worker.
    pub completed: u64,
}

/// Statistics about pool activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Workers created.
    pub created: u64,
    /// Workers destroyed (retired, crashed, or shut down).
    pub destroyed: u64,
    /// Workers that died while running.
    pub crashed: u64,
    /// Items handed to workers.
    pub dispatched: u64,
    /// Items that finished successfully.
    pub succeeded: u64,
    /// Items that failed.
    pub failed: u64,
    /// Scheduler calls rejected by the transport.
    pub transport_errors: u64,
}

/// Operational snapshot returned by [`WorkerPool::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Pool name.
    pub name: String,
    /// Backend kind.
    pub backend: String,
    /// Live workers.
    pub size: usize,
    /// Configured lower bound.
    pub min_size: usize,
    /// Configured upper bound.
    pub max_size: usize,
    /// Per-worker state.
    pub workers: Vec<WorkerStatus>,
    /// Counters.
    pub stats: PoolStats,
    /// Completions waiting to be resent to the scheduler.
    #[serde(default)]
    pub undelivered: usize,
    /// Most recent pool-level failure (worker creation and the like).
    pub last_error: Option<String>,
}

/// Internal counters for pool statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub created: AtomicU64,
    pub destroyed: AtomicU64,
    pub crashed: AtomicU64,
    pub dispatched: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub transport_errors: AtomicU64,
}

impl PoolCounters {
    /// Get a snapshot of current statistics.
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            crashed: self.crashed.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
