//! Pool supervisor: dispatch loop, scaling, crash recovery, log flushing.
//!
//! One dispatch loop per pool claims work through the [`SchedulerClient`]
//! and hands it to an idle worker. Each running item gets its own task that
//! forwards log lines into the worker's tracker, enforces the hard deadline,
//! and reports the terminal result. A second loop flushes buffered log lines
//! in batches.
//!
//! Completions and log batches the scheduler could not be reached for are
//! held by the pool and resent on later ticks, oldest first, until the pool
//! shuts down.
//!
//! Lock order is `slots` before any tracker; neither is held across an
//! `.await`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::WorkerPoolConfig;
use crate::core::client::{ClientError, SchedulerClient};
use crate::core::message::MessageSpec;
use crate::core::tracker::{WorkerState, WorkerTracker};
use crate::core::work::{
    abort_pair, AbortHandle, AbortSignal, FailureKind, LogSink, WorkOutcome, WorkResult, WorkSpec,
};
use crate::util::{Capability, WorkId, WorkerId};

use super::{
    HostOutcome, PoolCounters, PoolError, PoolStatus, WorkerFactory, WorkerHost, WorkerStatus,
};

struct WorkerSlot {
    tracker: Arc<Mutex<WorkerTracker>>,
    host: Arc<dyn WorkerHost>,
    abort: Option<AbortHandle>,
    kill_requested: bool,
    idle_since: Instant,
}

/// A worker reserved for one item.
struct Claim {
    id: WorkerId,
    tracker: Arc<Mutex<WorkerTracker>>,
    host: Arc<dyn WorkerHost>,
    abort: AbortSignal,
}

enum Step {
    Dispatched,
    NoWork,
    NoWorker,
    Backoff,
}

struct PoolInner {
    config: WorkerPoolConfig,
    capability: Capability,
    factory: Arc<dyn WorkerFactory>,
    client: Arc<dyn SchedulerClient>,
    slots: Mutex<HashMap<WorkerId, WorkerSlot>>,
    /// Workers whose backend is starting; they count toward the size bounds.
    creating: AtomicUsize,
    active_runs: AtomicUsize,
    counters: PoolCounters,
    last_error: Mutex<Option<String>>,
    shutdown: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    worker_freed: Notify,
    /// Serializes log flushes with completion reports so that no batch
    /// reaches the scheduler after its item's completion.
    report_lock: tokio::sync::Mutex<()>,
    /// Completions not yet accepted by the scheduler, in report order.
    undelivered: Mutex<VecDeque<WorkResult>>,
    /// Log batches whose flush failed, per item.
    held_logs: Mutex<HashMap<WorkId, Vec<MessageSpec>>>,
}

/// A supervised set of workers pulling from one scheduler.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Validate `config`, create `min_size` workers and start the dispatch
    /// and log-flush loops.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for a bad configuration, `CreateFailed` when the
    /// initial workers cannot be created.
    pub async fn start(
        config: WorkerPoolConfig,
        factory: Arc<dyn WorkerFactory>,
        client: Arc<dyn SchedulerClient>,
    ) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        let capability = Capability::new(config.name.clone(), config.pool_types.iter().cloned());
        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(PoolInner {
            config,
            capability,
            factory,
            client,
            slots: Mutex::new(HashMap::new()),
            creating: AtomicUsize::new(0),
            active_runs: AtomicUsize::new(0),
            counters: PoolCounters::default(),
            last_error: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            shutdown_tx,
            worker_freed: Notify::new(),
            report_lock: tokio::sync::Mutex::new(()),
            undelivered: Mutex::new(VecDeque::new()),
            held_logs: Mutex::new(HashMap::new()),
        });

        if !inner.fill_to_min().await {
            let reason = inner
                .last_error
                .lock()
                .clone()
                .unwrap_or_else(|| "worker creation failed".to_string());
            inner.shutdown.store(true, Ordering::SeqCst);
            let created: Vec<WorkerSlot> = inner.slots.lock().drain().map(|(_, s)| s).collect();
            for slot in created {
                inner.destroy(slot.host).await;
            }
            return Err(PoolError::CreateFailed(reason));
        }

        let dispatch =
            tokio::spawn(Arc::clone(&inner).dispatch_loop(inner.shutdown_tx.subscribe()));
        let flush = tokio::spawn(Arc::clone(&inner).flush_loop(inner.shutdown_tx.subscribe()));

        info!(
            pool = %inner.config.name,
            backend = inner.factory.backend(),
            min_size = inner.config.min_size,
            max_size = inner.config.max_size,
            "worker pool started"
        );

        Ok(Self {
            inner,
            tasks: Mutex::new(vec![dispatch, flush]),
        })
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Configuration the pool was started with.
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.inner.config
    }

    /// Capability announced when claiming work.
    pub fn capability(&self) -> &Capability {
        &self.inner.capability
    }

    /// Live workers.
    pub fn size(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Snapshot of workers, counters and the last pool-level error.
    pub fn status(&self) -> PoolStatus {
        let inner = &self.inner;
        let mut workers: Vec<WorkerStatus> = inner
            .slots
            .lock()
            .values()
            .map(|slot| {
                let tracker = slot.tracker.lock();
                WorkerStatus {
                    uuid: tracker.id(),
                    state: tracker.state(),
                    work: tracker.current_uuid().cloned(),
                    completed: tracker.completed(),
                }
            })
            .collect();
        workers.sort_by_key(|w| w.uuid.to_string());

        PoolStatus {
            name: inner.config.name.clone(),
            backend: inner.factory.backend().to_string(),
            size: workers.len(),
            min_size: inner.config.min_size,
            max_size: inner.config.max_size,
            workers,
            stats: inner.counters.snapshot(),
            undelivered: inner.undelivered.lock().len(),
            last_error: inner.last_error.lock().clone(),
        }
    }

    /// Stop the item `uuid`: signal a cooperative abort, then kill the
    /// worker if it is still running after the abort grace period.
    ///
    /// # Errors
    ///
    /// `WorkNotFound` if no worker of this pool runs `uuid`.
    pub async fn kill_work(&self, uuid: &WorkId) -> Result<(), PoolError> {
        if self.inner.is_shutdown() {
            return Err(PoolError::PoolShutdown);
        }

        let (id, host, abort) = {
            let mut slots = self.inner.slots.lock();
            let found = slots
                .iter_mut()
                .find(|(_, slot)| slot.tracker.lock().current_uuid() == Some(uuid));
            let Some((id, slot)) = found else {
                return Err(PoolError::WorkNotFound(uuid.clone()));
            };
            slot.kill_requested = true;
            (*id, Arc::clone(&slot.host), slot.abort.clone())
        };

        info!(pool = %self.inner.config.name, worker_id = %id, uuid = %uuid, "killing work");

        if !host.cooperative_abort() {
            host.kill().await;
            return Ok(());
        }
        if let Some(abort) = abort {
            abort.abort();
        }

        let inner = Arc::clone(&self.inner);
        let uuid = uuid.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.abort_grace()).await;
            if inner.is_running(id, &uuid) {
                warn!(
                    pool = %inner.config.name,
                    worker_id = %id,
                    uuid = %uuid,
                    "work ignored abort, killing worker"
                );
                host.kill().await;
            }
        });
        Ok(())
    }

    /// Abort running work, wait out the abort grace, kill stragglers and
    /// destroy every worker.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(pool = %inner.config.name, "shutting down worker pool");
        inner.shutdown_tx.send_replace(true);

        let running: Vec<(Arc<dyn WorkerHost>, Option<AbortHandle>)> = inner
            .slots
            .lock()
            .values_mut()
            .filter(|slot| slot.tracker.lock().state() == WorkerState::Running)
            .map(|slot| {
                slot.kill_requested = true;
                (Arc::clone(&slot.host), slot.abort.clone())
            })
            .collect();

        for (host, abort) in &running {
            match abort {
                Some(abort) if host.cooperative_abort() => abort.abort(),
                _ => host.kill().await,
            }
        }

        if !inner.wait_for_runs().await {
            for (host, _) in &running {
                if inner.is_host_running(host.id()) {
                    warn!(
                        pool = %inner.config.name,
                        worker_id = %host.id(),
                        "killing worker at shutdown"
                    );
                    host.kill().await;
                }
            }
            inner.wait_for_runs().await;
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(pool = %inner.config.name, error = %e, "pool task ended abnormally");
            }
        }

        let slots: Vec<WorkerSlot> = inner.slots.lock().drain().map(|(_, s)| s).collect();
        for slot in slots {
            if let Err(e) = slot.tracker.lock().retire() {
                debug!(pool = %inner.config.name, error = %e, "retiring worker at shutdown");
            }
            inner.destroy(slot.host).await;
        }

        let lost = inner.undelivered.lock().len();
        if lost > 0 {
            error!(pool = %inner.config.name, lost, "completions undelivered at shutdown");
        }
        info!(pool = %inner.config.name, "worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.inner.shutdown.swap(true, Ordering::SeqCst) {
            debug!(pool = %self.inner.config.name, "worker pool dropped without shutdown");
            self.inner.shutdown_tx.send_replace(true);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl PoolInner {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn has_idle(&self) -> bool {
        self.slots
            .lock()
            .values()
            .any(|slot| slot.tracker.lock().state() == WorkerState::Idle)
    }

    fn is_running(&self, id: WorkerId, uuid: &WorkId) -> bool {
        self.slots
            .lock()
            .get(&id)
            .is_some_and(|slot| slot.tracker.lock().current_uuid() == Some(uuid))
    }

    fn is_host_running(&self, id: WorkerId) -> bool {
        self.slots
            .lock()
            .get(&id)
            .is_some_and(|slot| slot.tracker.lock().state() == WorkerState::Running)
    }

    fn kill_requested(&self, id: WorkerId) -> bool {
        self.slots
            .lock()
            .get(&id)
            .is_some_and(|slot| slot.kill_requested)
    }

    /// Reserve room for one more worker if the pool is below `limit`.
    fn reserve(&self, limit: usize) -> bool {
        let slots = self.slots.lock();
        if slots.len() + self.creating.load(Ordering::SeqCst) >= limit {
            return false;
        }
        self.creating.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Create one worker unless the pool already holds `limit`.
    async fn spawn_worker(&self, limit: usize) -> Result<Option<WorkerId>, PoolError> {
        if self.is_shutdown() {
            return Err(PoolError::PoolShutdown);
        }
        if !self.reserve(limit) {
            return Ok(None);
        }

        let id = WorkerId::new();
        let mut tracker = WorkerTracker::new(id);
        let created = async {
            tracker.begin_initializing()?;
            let host = self.factory.create(id).await?;
            tracker.mark_ready()?;
            Ok::<_, PoolError>(host)
        }
        .await;

        let host = {
            let mut slots = self.slots.lock();
            self.creating.fetch_sub(1, Ordering::SeqCst);
            match created {
                Ok(host) if !self.is_shutdown() => {
                    slots.insert(
                        id,
                        WorkerSlot {
                            tracker: Arc::new(Mutex::new(tracker)),
                            host,
                            abort: None,
                            kill_requested: false,
                            idle_since: Instant::now(),
                        },
                    );
                    None
                }
                Ok(host) => Some(Ok(host)),
                Err(e) => Some(Err(e)),
            }
        };

        match host {
            None => {
                PoolCounters::bump(&self.counters.created);
                info!(
                    pool = %self.config.name,
                    worker_id = %id,
                    backend = self.factory.backend(),
                    "worker created"
                );
                self.worker_freed.notify_waiters();
                Ok(Some(id))
            }
            Some(Ok(host)) => {
                self.destroy(host).await;
                Err(PoolError::PoolShutdown)
            }
            Some(Err(e)) => {
                warn!(
                    pool = %self.config.name,
                    worker_id = %id,
                    error = %e,
                    "worker creation failed"
                );
                *self.last_error.lock() = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Create workers up to `min_size`. Returns false if a creation failed.
    async fn fill_to_min(&self) -> bool {
        loop {
            match self.spawn_worker(self.config.min_size).await {
                Ok(Some(_)) => {}
                Ok(None) => return true,
                Err(_) => return false,
            }
        }
    }

    async fn destroy(&self, host: Arc<dyn WorkerHost>) {
        let id = host.id();
        match self.factory.destroy(host).await {
            Ok(()) => debug!(pool = %self.config.name, worker_id = %id, "worker destroyed"),
            Err(e) => {
                warn!(
                    pool = %self.config.name,
                    worker_id = %id,
                    error = %e,
                    "worker teardown failed"
                );
                *self.last_error.lock() = Some(e.to_string());
            }
        }
        PoolCounters::bump(&self.counters.destroyed);
    }

    async fn discard(&self, id: WorkerId) {
        let slot = self.slots.lock().remove(&id);
        if let Some(slot) = slot {
            self.destroy(slot.host).await;
        }
    }

    /// Retire idle workers past `idle_timeout`, never going below `min_size`.
    async fn retire_idle(&self) {
        let idle_timeout = self.config.idle_timeout();
        let victims: Vec<Arc<dyn WorkerHost>> = {
            let mut slots = self.slots.lock();
            let expired: Vec<WorkerId> = slots
                .iter()
                .filter(|(_, slot)| {
                    slot.idle_since.elapsed() >= idle_timeout
                        && slot.tracker.lock().state() == WorkerState::Idle
                })
                .map(|(id, _)| *id)
                .collect();
            let surplus = slots.len().saturating_sub(self.config.min_size);
            expired
                .into_iter()
                .take(surplus)
                .filter_map(|id| slots.remove(&id))
                .map(|slot| {
                    if let Err(e) = slot.tracker.lock().retire() {
                        debug!(error = %e, "retiring idle worker");
                    }
                    slot.host
                })
                .collect()
        };

        for host in victims {
            info!(pool = %self.config.name, worker_id = %host.id(), "retiring idle worker");
            self.destroy(host).await;
        }
    }

    /// Mark the first idle worker as running `spec`.
    fn claim_idle(&self, spec: &WorkSpec) -> Option<Claim> {
        let mut slots = self.slots.lock();
        for (id, slot) in slots.iter_mut() {
            {
                let mut tracker = slot.tracker.lock();
                if tracker.state() != WorkerState::Idle || tracker.assign(spec.clone()).is_err() {
                    continue;
                }
            }
            let (handle, signal) = abort_pair();
            slot.abort = Some(handle);
            slot.kill_requested = false;
            return Some(Claim {
                id: *id,
                tracker: Arc::clone(&slot.tracker),
                host: Arc::clone(&slot.host),
                abort: signal,
            });
        }
        None
    }

    /// Back to idle after a finished run, unless already re-claimed.
    fn release(&self, id: WorkerId) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&id) {
            if slot.tracker.lock().state() == WorkerState::Idle {
                slot.idle_since = Instant::now();
                slot.abort = None;
                slot.kill_requested = false;
            }
        }
    }

    fn transport_failed(&self, op: &str, e: &ClientError) {
        PoolCounters::bump(&self.counters.transport_errors);
        warn!(pool = %self.config.name, op, error = %e, "scheduler call failed");
    }

    async fn dispatch_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        debug!(pool = %self.config.name, "dispatch loop started");
        while !self.is_shutdown() {
            self.retry_completions().await;
            match self.dispatch_once().await {
                Step::Dispatched => {}
                Step::NoWork => {
                    self.fill_to_min().await;
                    self.retire_idle().await;
                    tokio::select! {
                        () = self.client.wait_for_work(self.config.poll_interval()) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
                Step::NoWorker => {
                    tokio::select! {
                        () = self.worker_freed.notified() => {}
                        () = tokio::time::sleep(self.config.poll_interval()) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
                Step::Backoff => {
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval()) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            }
        }
        debug!(pool = %self.config.name, "dispatch loop stopped");
    }

    /// Claim one item and start it on an idle worker, creating a worker
    /// first when all are busy and compatible work is pending.
    async fn dispatch_once(self: &Arc<Self>) -> Step {
        if !self.has_idle() {
            match self.client.pending(&self.capability).await {
                Ok(0) => return Step::NoWork,
                Ok(_) => match self.spawn_worker(self.config.max_size).await {
                    Ok(Some(_)) => {}
                    Ok(None) => return Step::NoWorker,
                    Err(_) => return Step::Backoff,
                },
                Err(e) => {
                    self.transport_failed("pending", &e);
                    return Step::Backoff;
                }
            }
        }

        let spec = match self.client.poll(&self.capability).await {
            Ok(Some(spec)) => spec,
            Ok(None) => return Step::NoWork,
            Err(e) => {
                self.transport_failed("poll", &e);
                return Step::Backoff;
            }
        };

        let mut claim = self.claim_idle(&spec);
        if claim.is_none()
            && matches!(self.spawn_worker(self.config.max_size).await, Ok(Some(_)))
        {
            claim = self.claim_idle(&spec);
        }
        let Some(claim) = claim else {
            warn!(
                pool = %self.config.name,
                uuid = %spec.uuid,
                "claimed work but no worker is available"
            );
            let outcome = WorkOutcome::failure(
                FailureKind::Dispatch,
                format!("pool {} has no worker available", self.config.name),
            );
            PoolCounters::bump(&self.counters.failed);
            self.report(WorkResult::new(spec.uuid, outcome)).await;
            return Step::NoWorker;
        };

        PoolCounters::bump(&self.counters.dispatched);
        info!(
            pool = %self.config.name,
            worker_id = %claim.id,
            uuid = %spec.uuid,
            type_name = %spec.type_name,
            "dispatching work"
        );
        self.active_runs.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(Arc::clone(self).run_on_worker(claim, spec));
        Step::Dispatched
    }

    async fn run_on_worker(self: Arc<Self>, claim: Claim, spec: WorkSpec) {
        let Claim {
            id,
            tracker,
            host,
            abort,
        } = claim;
        let uuid = spec.uuid.clone();

        let (log_tx, mut log_rx) = mpsc::unbounded_channel::<MessageSpec>();
        let (done_tx, mut done_rx) = oneshot::channel::<()>();
        let forward_to = Arc::clone(&tracker);
        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    line = log_rx.recv() => match line {
                        Some(line) => forward_to.lock().record(line),
                        None => break,
                    },
                    _ = &mut done_rx => {
                        while let Ok(line) = log_rx.try_recv() {
                            forward_to.lock().record(line);
                        }
                        break;
                    }
                }
            }
        });

        let run = host.run(spec.clone(), LogSink::new(uuid.clone(), log_tx), abort);
        let mut timed_out = false;
        let outcome = match spec.timeout() {
            Some(timeout) => {
                let hard_deadline = timeout + self.config.abort_grace() * 2;
                match tokio::time::timeout(hard_deadline, run).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(
                            pool = %self.config.name,
                            worker_id = %id,
                            uuid = %uuid,
                            "work overran its deadline, killing worker"
                        );
                        timed_out = true;
                        host.kill().await;
                        HostOutcome::Exited {
                            code: None,
                            detail: format!("deadline of {}ms exceeded", timeout.as_millis()),
                        }
                    }
                }
            }
            None => run.await,
        };

        let _ = done_tx.send(());
        if let Err(e) = forwarder.await {
            warn!(worker_id = %id, error = %e, "log forwarder failed");
        }

        let (result, exited) = match outcome {
            HostOutcome::Finished(outcome) => {
                let completed = tracker.lock().complete(outcome);
                match completed {
                    Ok(result) => (Some(result), false),
                    Err(e) => {
                        error!(worker_id = %id, uuid = %uuid, error = %e, "cannot complete work");
                        (None, false)
                    }
                }
            }
            HostOutcome::Exited { code, detail } => {
                let failure_kind = if timed_out {
                    FailureKind::Timeout
                } else if self.kill_requested(id) {
                    FailureKind::Aborted
                } else {
                    FailureKind::HostCrash
                };
                let result = tracker.lock().on_exit(code, failure_kind, &detail);
                (result, true)
            }
        };

        if let Some(result) = &result {
            if result.outcome.is_success() {
                PoolCounters::bump(&self.counters.succeeded);
            } else {
                PoolCounters::bump(&self.counters.failed);
            }
            debug!(
                worker_id = %id,
                uuid = %uuid,
                success = result.outcome.is_success(),
                "work finished"
            );
        }

        if exited {
            PoolCounters::bump(&self.counters.crashed);
            self.discard(id).await;
        } else {
            self.release(id);
        }

        if let Some(result) = result {
            self.report(result).await;
        }

        if exited && !self.is_shutdown() {
            self.fill_to_min().await;
        }

        self.active_runs.fetch_sub(1, Ordering::SeqCst);
        self.worker_freed.notify_waiters();
    }

    /// Queue a completion behind any undelivered ones and send what the
    /// scheduler will take.
    async fn report(&self, mut result: WorkResult) {
        let _guard = self.report_lock.lock().await;
        if let Some(mut held) = self.held_logs.lock().remove(&result.uuid) {
            held.append(&mut result.messages);
            result.messages = held;
        }
        self.undelivered.lock().push_back(result);
        self.deliver_completions().await;
    }

    /// Resend held completions, if any.
    async fn retry_completions(&self) {
        if self.undelivered.lock().is_empty() {
            return;
        }
        let _guard = self.report_lock.lock().await;
        self.deliver_completions().await;
    }

    /// Send queued completions in order, stopping at the first transport
    /// failure. Callers hold `report_lock`.
    async fn deliver_completions(&self) {
        loop {
            let Some(result) = self.undelivered.lock().front().cloned() else {
                return;
            };
            match self.client.complete(result).await {
                Ok(()) => {}
                Err(ClientError::Remote(msg)) => {
                    warn!(pool = %self.config.name, error = %msg, "scheduler rejected completion");
                }
                Err(e) => {
                    self.transport_failed("complete", &e);
                    debug!(
                        pool = %self.config.name,
                        held = self.undelivered.lock().len(),
                        "completion held for retry"
                    );
                    return;
                }
            }
            self.undelivered.lock().pop_front();
        }
    }

    async fn flush_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.log_flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.flush_logs().await,
                _ = shutdown_rx.changed() => break,
            }
        }
        self.flush_logs().await;
    }

    /// Resend held completions, then send every running item's unflushed
    /// log lines in one batch per item. A failed batch is held and goes out
    /// ahead of the item's later lines.
    async fn flush_logs(&self) {
        let _guard = self.report_lock.lock().await;
        self.deliver_completions().await;

        let mut batches: HashMap<WorkId, Vec<MessageSpec>> =
            std::mem::take(&mut *self.held_logs.lock());
        let fresh: Vec<(WorkId, Vec<MessageSpec>)> = self
            .slots
            .lock()
            .values()
            .filter_map(|slot| slot.tracker.lock().take_pending_logs())
            .collect();
        for (uuid, mut messages) in fresh {
            batches.entry(uuid).or_default().append(&mut messages);
        }

        for (uuid, messages) in batches {
            let count = messages.len();
            match self.client.append_messages(&uuid, messages.clone()).await {
                Ok(()) => debug!(uuid = %uuid, count, "flushed log lines"),
                Err(ClientError::Remote(msg)) => {
                    warn!(uuid = %uuid, count, error = %msg, "scheduler rejected log lines");
                }
                Err(e) => {
                    self.transport_failed("appendMessages", &e);
                    self.held_logs.lock().insert(uuid, messages);
                }
            }
        }
    }

    /// Wait up to the abort grace for in-flight runs to finish.
    async fn wait_for_runs(&self) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.abort_grace();
        loop {
            let notified = self.worker_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active_runs.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.active_runs.load(Ordering::SeqCst) == 0;
            }
        }
    }
}
