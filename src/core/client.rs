//! How a worker pool talks to a scheduler.
//!
//! Pools never touch the scheduler's queue directly; they go through a
//! [`SchedulerClient`], either [`LocalSchedulerClient`] for an in-process
//! scheduler or `runtime::RpcSchedulerClient` over a transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::message::MessageSpec;
use crate::core::scheduler::Scheduler;
use crate::core::work::{WorkResult, WorkSpec};
use crate::util::{Capability, WorkId};

/// Failure talking to the scheduler. Recovered by retrying on the next tick.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The transport rejected or dropped the call.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The scheduler answered with an error.
    #[error("scheduler error: {0}")]
    Remote(String),
}

/// Scheduler operations consumed by worker pools.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Claim the next compatible item, if any.
    async fn poll(&self, capability: &Capability) -> Result<Option<WorkSpec>, ClientError>;

    /// Count queued items `capability` could claim.
    async fn pending(&self, capability: &Capability) -> Result<usize, ClientError>;

    /// Flush a batch of log lines for an in-flight item.
    async fn append_messages(
        &self,
        uuid: &WorkId,
        messages: Vec<MessageSpec>,
    ) -> Result<(), ClientError>;

    /// Report a terminal result.
    async fn complete(&self, result: WorkResult) -> Result<(), ClientError>;

    /// Wait up to `max_wait` for a hint that new work may be available.
    async fn wait_for_work(&self, max_wait: Duration) {
        tokio::time::sleep(max_wait).await;
    }
}

/// Client for a scheduler living in the same process.
#[derive(Clone)]
pub struct LocalSchedulerClient {
    scheduler: Arc<Scheduler>,
}

impl LocalSchedulerClient {
    /// Wrap a shared scheduler.
    #[must_use]
    pub const fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    /// The wrapped scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}

#[async_trait]
impl SchedulerClient for LocalSchedulerClient {
    async fn poll(&self, capability: &Capability) -> Result<Option<WorkSpec>, ClientError> {
        Ok(self.scheduler.poll_for_work(capability))
    }

    async fn pending(&self, capability: &Capability) -> Result<usize, ClientError> {
        Ok(self.scheduler.pending_for(capability))
    }

    async fn append_messages(
        &self,
        uuid: &WorkId,
        messages: Vec<MessageSpec>,
    ) -> Result<(), ClientError> {
        self.scheduler.append_messages(uuid, messages);
        Ok(())
    }

    async fn complete(&self, result: WorkResult) -> Result<(), ClientError> {
        self.scheduler.on_work_completed(result);
        Ok(())
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.scheduler.work_scheduled()).await;
    }
}
