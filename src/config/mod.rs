//! Configuration models for pools, backends, and the scheduler.

pub mod pool;

pub use pool::{BackendConfig, RuntimeConfig, WorkerPoolConfig, CONFIG_PATH_ENV};
