//! Core scheduling abstractions: the work model, the scheduler, and worker
//! supervision.

pub mod builtin;
pub mod client;
pub mod error;
pub mod executor;
pub mod message;
pub mod registry;
pub mod scheduler;
pub mod tracker;
pub mod work;
pub mod worker_pool;

pub use builtin::{EchoWork, FailWork, SleepWork};
pub use client::{ClientError, LocalSchedulerClient, SchedulerClient};
pub use error::{AppResult, SchedulerError};
pub use executor::{WorkExecutor, DEFAULT_ABORT_GRACE};
pub use message::{LogBuffer, MessageKind, MessageSpec};
pub use registry::{WorkConstructor, WorkRegistry};
pub use scheduler::{
    Assignment, Mailbox, ScheduleOutcome, Scheduler, SchedulerLimits, WorkQueue, WorkState,
};
pub use tracker::{TransitionError, WorkerState, WorkerTracker};
pub use work::{
    abort_pair, AbortHandle, AbortSignal, FailureKind, LogSink, Work, WorkContext, WorkOutcome,
    WorkResult, WorkSpec,
};
pub use worker_pool::{
    HostOutcome, PoolError, PoolStats, PoolStatus, WorkerFactory, WorkerHost, WorkerPool,
    WorkerStatus,
};
