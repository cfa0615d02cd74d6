//! In-process backend: each run is a tokio task on the caller's runtime.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::AbortHandle as TaskAbortHandle;
use tracing::debug;

use crate::core::{
    AbortSignal, HostOutcome, LogSink, PoolError, WorkContext, WorkExecutor, WorkSpec,
    WorkerFactory, WorkerHost,
};
use crate::util::WorkerId;

/// Creates [`LocalWorkerHost`]s sharing one executor.
pub struct LocalWorkerFactory {
    executor: WorkExecutor,
}

impl LocalWorkerFactory {
    /// Factory running work through `executor`.
    pub const fn new(executor: WorkExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl WorkerFactory for LocalWorkerFactory {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn create(&self, id: WorkerId) -> Result<Arc<dyn WorkerHost>, PoolError> {
        Ok(Arc::new(LocalWorkerHost::new(id, self.executor.clone())))
    }

    async fn destroy(&self, host: Arc<dyn WorkerHost>) -> Result<(), PoolError> {
        host.kill().await;
        Ok(())
    }
}

/// Runs each item as a spawned task; `kill` aborts the task.
pub struct LocalWorkerHost {
    id: WorkerId,
    executor: WorkExecutor,
    task: Mutex<Option<TaskAbortHandle>>,
}

impl LocalWorkerHost {
    /// Host `id` over `executor`.
    pub const fn new(id: WorkerId, executor: WorkExecutor) -> Self {
        Self {
            id,
            executor,
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl WorkerHost for LocalWorkerHost {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn run(&self, spec: WorkSpec, log: LogSink, abort: AbortSignal) -> HostOutcome {
        let ctx = WorkContext {
            worker_id: self.id,
            uuid: spec.uuid.clone(),
            log,
            abort,
        };
        let executor = self.executor.clone();
        let handle = tokio::spawn(async move { executor.run(&spec, ctx).await });
        *self.task.lock() = Some(handle.abort_handle());

        let joined = handle.await;
        self.task.lock().take();
        match joined {
            Ok(outcome) => HostOutcome::Finished(outcome),
            Err(e) if e.is_cancelled() => HostOutcome::Exited {
                code: None,
                detail: "worker killed".to_string(),
            },
            Err(e) => HostOutcome::Exited {
                code: None,
                detail: format!("work panicked: {e}"),
            },
        }
    }

    async fn kill(&self) {
        if let Some(task) = self.task.lock().take() {
            debug!(worker_id = %self.id, "aborting local task");
            task.abort();
        }
    }
}
