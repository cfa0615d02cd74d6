//! Dedicated-thread backend.
//!
//! Each worker is an OS thread with its own single-threaded tokio runtime,
//! so CPU-bound work does not block the main runtime. Jobs arrive over a
//! `crossbeam-channel`; the thread blocks on `recv` while idle.
//!
//! A panic inside work unwinds the thread. The pending `run` sees its reply
//! channel dropped and reports the host as exited.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, warn};

use crate::core::{
    AbortSignal, FailureKind, HostOutcome, LogSink, PoolError, WorkContext, WorkExecutor,
    WorkOutcome, WorkSpec, WorkerFactory, WorkerHost,
};
use crate::util::WorkerId;

use super::wait_killed;

/// Default worker thread stack size (2 MiB).
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

struct Job {
    spec: WorkSpec,
    log: LogSink,
    abort: AbortSignal,
    reply: oneshot::Sender<WorkOutcome>,
}

/// Creates one OS thread per worker.
pub struct ThreadWorkerFactory {
    executor: WorkExecutor,
    stack_size: usize,
}

impl ThreadWorkerFactory {
    /// Factory running work through `executor`.
    pub const fn new(executor: WorkExecutor) -> Self {
        Self {
            executor,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    /// Override the thread stack size.
    #[must_use]
    pub const fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }
}

#[async_trait]
impl WorkerFactory for ThreadWorkerFactory {
    fn backend(&self) -> &'static str {
        "thread"
    }

    async fn create(&self, id: WorkerId) -> Result<Arc<dyn WorkerHost>, PoolError> {
        let host = ThreadWorkerHost::spawn(id, self.executor.clone(), self.stack_size)?;
        Ok(Arc::new(host))
    }

    async fn destroy(&self, host: Arc<dyn WorkerHost>) -> Result<(), PoolError> {
        host.kill().await;
        Ok(())
    }
}

/// A worker backed by a dedicated thread.
pub struct ThreadWorkerHost {
    id: WorkerId,
    jobs: Mutex<Option<Sender<Job>>>,
    alive: Arc<AtomicBool>,
    killed: watch::Sender<bool>,
}

/// Clears the alive flag when the thread ends, including by panic.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ThreadWorkerHost {
    /// Start the worker thread.
    ///
    /// # Errors
    ///
    /// `CreateFailed` if the OS refuses the thread.
    pub fn spawn(
        id: WorkerId,
        executor: WorkExecutor,
        stack_size: usize,
    ) -> Result<Self, PoolError> {
        let (job_tx, job_rx) = bounded::<Job>(1);
        let alive = Arc::new(AtomicBool::new(true));
        let guard = AliveGuard(Arc::clone(&alive));

        thread::Builder::new()
            .name(format!("work-{id}"))
            .stack_size(stack_size)
            .spawn(move || worker_thread(id, &executor, &job_rx, guard))
            .map_err(|e| PoolError::CreateFailed(format!("cannot spawn worker thread: {e}")))?;

        let (killed, _) = watch::channel(false);
        Ok(Self {
            id,
            jobs: Mutex::new(Some(job_tx)),
            alive,
            killed,
        })
    }

    /// False once the thread has ended.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

fn worker_thread(id: WorkerId, executor: &WorkExecutor, jobs: &Receiver<Job>, _alive: AliveGuard) {
    debug!(worker_id = %id, "worker thread started");

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(worker_id = %id, error = %e, "failed to create worker runtime");
            return;
        }
    };

    // Blocks while idle; ends when the host drops its sender.
    while let Ok(job) = jobs.recv() {
        let Job {
            spec,
            log,
            abort,
            reply,
        } = job;
        debug!(worker_id = %id, uuid = %spec.uuid, "worker thread executing");
        let ctx = WorkContext {
            worker_id: id,
            uuid: spec.uuid.clone(),
            log,
            abort,
        };
        let outcome = rt.block_on(executor.run(&spec, ctx));
        if reply.send(outcome).is_err() {
            debug!(worker_id = %id, uuid = %spec.uuid, "result discarded, host stopped waiting");
        }
    }

    debug!(worker_id = %id, "worker thread exiting");
}

#[async_trait]
impl WorkerHost for ThreadWorkerHost {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn run(&self, spec: WorkSpec, log: LogSink, abort: AbortSignal) -> HostOutcome {
        let Some(jobs) = self.jobs.lock().clone() else {
            return HostOutcome::Exited {
                code: None,
                detail: "worker thread stopped".to_string(),
            };
        };

        let uuid = spec.uuid.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            spec,
            log,
            abort,
            reply: reply_tx,
        };
        match jobs.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(worker_id = %self.id, uuid = %uuid, "worker thread busy");
                return HostOutcome::Finished(WorkOutcome::failure(
                    FailureKind::Dispatch,
                    format!("worker {} is busy", self.id),
                ));
            }
            Err(TrySendError::Disconnected(_)) => {
                return HostOutcome::Exited {
                    code: None,
                    detail: "worker thread exited".to_string(),
                };
            }
        }

        let mut killed = self.killed.subscribe();
        tokio::select! {
            reply = reply_rx => match reply {
                Ok(outcome) => HostOutcome::Finished(outcome),
                Err(_) => HostOutcome::Exited {
                    code: None,
                    detail: "worker thread panicked".to_string(),
                },
            },
            () = wait_killed(&mut killed) => HostOutcome::Exited {
                code: None,
                detail: "worker thread killed".to_string(),
            },
        }
    }

    async fn kill(&self) {
        self.killed.send_replace(true);
        if self.jobs.lock().take().is_some() {
            debug!(worker_id = %self.id, "worker thread detached");
        }
    }
}
