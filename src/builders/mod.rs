//! Builders turning configuration into running components.

pub mod pool_builder;

pub use pool_builder::{build_pools, build_runtime, Runtime};
