//! Integration tests for WorkerPool
//!
//! These tests run real pools against an in-process scheduler:
//! - Dispatch and completion through the local and thread backends
//! - Failure isolation and worker reuse
//! - Scaling between min and max size, idle retirement
//! - Crash recovery and replacement
//! - kill_work, deadlines, and shutdown
//! - Scheduler outages: held completions and log batches

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use prometheus_work_runtime::config::WorkerPoolConfig;
use prometheus_work_runtime::core::{
    AbortSignal, AppResult, ClientError, FailureKind, HostOutcome, LocalSchedulerClient, LogSink,
    MessageKind, MessageSpec, PoolError, Scheduler, SchedulerClient, Work, WorkContext,
    WorkExecutor, WorkOutcome, WorkRegistry, WorkResult, WorkSpec, WorkerFactory, WorkerHost,
    WorkerPool, WorkerState,
};
use prometheus_work_runtime::runtime::{LocalWorkerFactory, ThreadWorkerFactory};
use prometheus_work_runtime::util::{Capability, WorkId, WorkerId};

// ============================================================================
// HELPERS
// ============================================================================

const WAIT: Duration = Duration::from_secs(10);

fn pool_config(name: &str, min: usize, max: usize) -> WorkerPoolConfig {
    WorkerPoolConfig::new()
        .with_name(name)
        .with_size(min, max)
        .with_poll_interval(Duration::from_millis(10))
        .with_log_flush_interval(Duration::from_millis(20))
        .with_abort_grace(Duration::from_millis(200))
}

fn executor(registry: WorkRegistry) -> WorkExecutor {
    WorkExecutor::new(Arc::new(registry)).with_abort_grace(Duration::from_millis(200))
}

async fn start_local(scheduler: &Arc<Scheduler>, config: WorkerPoolConfig) -> WorkerPool {
    start_with(scheduler, config, WorkRegistry::with_builtins()).await
}

async fn start_with(
    scheduler: &Arc<Scheduler>,
    config: WorkerPoolConfig,
    registry: WorkRegistry,
) -> WorkerPool {
    WorkerPool::start(
        config,
        Arc::new(LocalWorkerFactory::new(executor(registry))),
        Arc::new(LocalSchedulerClient::new(Arc::clone(scheduler))),
    )
    .await
    .expect("pool should start")
}

async fn run_to_completion(scheduler: &Scheduler, spec: WorkSpec) -> WorkResult {
    let done = scheduler.completion(&spec.uuid);
    scheduler.schedule(spec).expect("schedule");
    tokio::time::timeout(WAIT, done)
        .await
        .expect("completion in time")
        .expect("completion delivered")
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

/// Records the order in which items start executing.
struct RecordWork {
    uuid: WorkId,
    seen: Arc<Mutex<Vec<WorkId>>>,
}

#[async_trait]
impl Work for RecordWork {
    async fn execute(&self, _ctx: &WorkContext) -> AppResult<Value> {
        self.seen.lock().push(self.uuid.clone());
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(Value::Null)
    }
}

/// Ignores abort requests.
struct StubbornWork;

#[async_trait]
impl Work for StubbornWork {
    async fn execute(&self, _ctx: &WorkContext) -> AppResult<Value> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Value::Null)
    }
}

/// Local hosts, except that `Crash` items end with the host exiting.
struct CrashingFactory {
    inner: LocalWorkerFactory,
}

struct CrashingHost {
    inner: Arc<dyn WorkerHost>,
}

#[async_trait]
impl WorkerFactory for CrashingFactory {
    fn backend(&self) -> &'static str {
        "crashing"
    }

    async fn create(&self, id: WorkerId) -> Result<Arc<dyn WorkerHost>, PoolError> {
        let inner = self.inner.create(id).await?;
        Ok(Arc::new(CrashingHost { inner }))
    }

    async fn destroy(&self, host: Arc<dyn WorkerHost>) -> Result<(), PoolError> {
        host.kill().await;
        Ok(())
    }
}

#[async_trait]
impl WorkerHost for CrashingHost {
    fn id(&self) -> WorkerId {
        self.inner.id()
    }

    async fn run(&self, spec: WorkSpec, log: LogSink, abort: AbortSignal) -> HostOutcome {
        if spec.type_name == "Crash" {
            log.log("about to crash");
            return HostOutcome::Exited {
                code: Some(137),
                detail: "killed by signal".to_string(),
            };
        }
        self.inner.run(spec, log, abort).await
    }

    async fn kill(&self) {
        self.inner.kill().await;
    }
}

/// Factory whose hosts can never be created.
struct BrokenFactory;

#[async_trait]
impl WorkerFactory for BrokenFactory {
    fn backend(&self) -> &'static str {
        "broken"
    }

    async fn create(&self, _id: WorkerId) -> Result<Arc<dyn WorkerHost>, PoolError> {
        Err(PoolError::CreateFailed("no backend available".to_string()))
    }

    async fn destroy(&self, _host: Arc<dyn WorkerHost>) -> Result<(), PoolError> {
        Ok(())
    }
}

// ============================================================================
// DISPATCH AND COMPLETION
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_completes_with_value_and_logs() {
    let scheduler = Arc::new(Scheduler::default());
    let pool = start_local(&scheduler, pool_config("cpu", 1, 2)).await;

    let result =
        run_to_completion(&scheduler, WorkSpec::new("echo-1", "Echo").with_arg("hi")).await;

    assert_eq!(result.outcome, WorkOutcome::Success { result: json!("hi") });
    assert!(result.messages.iter().any(|m| m.message.contains("echo")));
    assert!(result.messages.iter().all(|m| m.caller.as_str() == "echo-1"));
    assert_eq!(pool.status().stats.succeeded, 1);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_work_leaves_worker_idle() {
    let scheduler = Arc::new(Scheduler::default());
    let pool = start_local(&scheduler, pool_config("cpu", 1, 1)).await;

    let failed =
        run_to_completion(&scheduler, WorkSpec::new("fail-1", "Fail").with_arg("boom")).await;
    match &failed.outcome {
        WorkOutcome::Failure { failure_kind, message } => {
            assert_eq!(*failure_kind, FailureKind::Execution);
            assert!(message.contains("boom"));
        }
        other => panic!("expected failure, got {other:?}"),
    }

    let status = pool.status();
    assert_eq!(status.size, 1);
    assert_eq!(status.workers[0].state, WorkerState::Idle);
    assert_eq!(status.workers[0].completed, 1);

    // Same worker keeps serving.
    let ok = run_to_completion(&scheduler, WorkSpec::new("echo-2", "Echo").with_arg(2)).await;
    assert!(ok.outcome.is_success());
    assert_eq!(pool.status().stats.created, 1);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_type_is_dispatch_failure() {
    let scheduler = Arc::new(Scheduler::default());
    let pool = start_local(&scheduler, pool_config("cpu", 1, 1)).await;

    let result = run_to_completion(&scheduler, WorkSpec::new("nope", "DoesNotExist")).await;
    assert_eq!(result.outcome.failure_kind(), Some(FailureKind::Dispatch));

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_incompatible_work_is_left_queued() {
    let scheduler = Arc::new(Scheduler::default());
    let pool = start_local(&scheduler, pool_config("cpu", 1, 1).with_pool_types(["cpu"])).await;

    scheduler
        .schedule(WorkSpec::new("gpu-only", "Echo").with_compatibility(["gpu"]))
        .expect("schedule");
    let ok = run_to_completion(
        &scheduler,
        WorkSpec::new("cpu-ok", "Echo").with_compatibility(["cpu"]),
    )
    .await;
    assert!(ok.outcome.is_success());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.queue_len(), 1);
    assert_eq!(pool.status().stats.dispatched, 1);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_worker_runs_in_fifo_order() {
    let scheduler = Arc::new(Scheduler::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = WorkRegistry::new();
    let record = Arc::clone(&seen);
    registry.register("Record", move |uuid: &WorkId, _args: &[Value]| {
        Ok(Box::new(RecordWork {
            uuid: uuid.clone(),
            seen: Arc::clone(&record),
        }) as Box<dyn Work>)
    });

    let uuids: Vec<WorkId> = (0..5).map(|i| WorkId::new(format!("item-{i}"))).collect();
    let waiters: Vec<_> = uuids.iter().map(|u| scheduler.completion(u)).collect();
    for uuid in &uuids {
        scheduler.schedule(WorkSpec::new(uuid.clone(), "Record")).expect("schedule");
    }

    let pool = start_with(&scheduler, pool_config("cpu", 0, 1), registry).await;
    for waiter in waiters {
        let result = tokio::time::timeout(WAIT, waiter).await.expect("in time").expect("delivered");
        assert!(result.outcome.is_success());
    }

    assert_eq!(*seen.lock(), uuids);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_competing_pools_never_double_dispatch() {
    let scheduler = Arc::new(Scheduler::default());
    let mut events = scheduler.subscribe();

    let a = start_local(&scheduler, pool_config("a", 0, 3)).await;
    let b = start_local(&scheduler, pool_config("b", 0, 3)).await;

    let total = 30;
    for i in 0..total {
        scheduler
            .schedule(WorkSpec::new(format!("job-{i}"), "Sleep").with_arg(5).with_arg(i))
            .expect("schedule");
    }

    let mut finished = std::collections::HashSet::new();
    while finished.len() < total {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("event in time")
            .expect("event delivered");
        assert!(event.outcome.is_success());
        assert!(finished.insert(event.uuid.clone()), "duplicate completion for {}", event.uuid);
    }

    let dispatched = a.status().stats.dispatched + b.status().stats.dispatched;
    assert_eq!(dispatched, total as u64);
    assert_eq!(scheduler.in_flight_len(), 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_thread_backend_runs_work() {
    let scheduler = Arc::new(Scheduler::default());
    let pool = WorkerPool::start(
        pool_config("threads", 1, 2),
        Arc::new(ThreadWorkerFactory::new(executor(WorkRegistry::with_builtins()))),
        Arc::new(LocalSchedulerClient::new(Arc::clone(&scheduler))),
    )
    .await
    .expect("pool should start");

    let result =
        run_to_completion(&scheduler, WorkSpec::new("t-1", "Echo").with_arg("thread")).await;
    assert_eq!(result.outcome, WorkOutcome::Success { result: json!("thread") });
    assert_eq!(pool.status().backend, "thread");

    pool.shutdown().await;
}

// ============================================================================
// SCALING
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_starts_with_min_size_workers() {
    let scheduler = Arc::new(Scheduler::default());
    let pool = start_local(&scheduler, pool_config("cpu", 2, 4)).await;

    let status = pool.status();
    assert_eq!(status.size, 2);
    assert!(status.workers.iter().all(|w| w.state == WorkerState::Idle));

    pool.shutdown().await;
    assert_eq!(pool.size(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_size_never_exceeds_max() {
    let scheduler = Arc::new(Scheduler::default());
    let pool = Arc::new(start_local(&scheduler, pool_config("cpu", 0, 2)).await);

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let watched = Arc::clone(&pool);
    let sampler = tokio::spawn(async move {
        let mut peak = 0;
        loop {
            peak = peak.max(watched.size());
            tokio::select! {
                _ = &mut stop_rx => return peak,
                () = tokio::time::sleep(Duration::from_millis(2)) => {}
            }
        }
    });

    let uuids: Vec<WorkId> = (0..6).map(|i| WorkId::new(format!("s-{i}"))).collect();
    let waiters: Vec<_> = uuids.iter().map(|u| scheduler.completion(u)).collect();
    for uuid in &uuids {
        scheduler
            .schedule(WorkSpec::new(uuid.clone(), "Sleep").with_arg(50))
            .expect("schedule");
    }
    let results = tokio::time::timeout(WAIT, futures::future::join_all(waiters))
        .await
        .expect("all finished in time");
    for result in results {
        assert!(result.expect("delivered").outcome.is_success());
    }

    let _ = stop_tx.send(());
    let peak = sampler.await.expect("sampler");
    assert_eq!(peak, 2);
    assert_eq!(pool.status().stats.created, 2);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_workers_retire_down_to_min() {
    let scheduler = Arc::new(Scheduler::default());
    let pool = start_local(
        &scheduler,
        pool_config("cpu", 1, 3).with_idle_timeout(Duration::from_millis(50)),
    )
    .await;

    let waiters: Vec<_> = (0..3)
        .map(|i| {
            let spec = WorkSpec::new(format!("r-{i}"), "Sleep").with_arg(100);
            let done = scheduler.completion(&spec.uuid);
            scheduler.schedule(spec).expect("schedule");
            done
        })
        .collect();
    for waiter in waiters {
        tokio::time::timeout(WAIT, waiter).await.expect("in time").expect("delivered");
    }
    assert!(pool.status().stats.created >= 2);

    wait_until(|| pool.size() == 1).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(pool.size(), 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_start_fails_when_min_workers_cannot_be_created() {
    let scheduler = Arc::new(Scheduler::default());
    let err = WorkerPool::start(
        pool_config("broken", 1, 1),
        Arc::new(BrokenFactory),
        Arc::new(LocalSchedulerClient::new(scheduler)),
    )
    .await
    .err()
    .expect("start should fail");

    match err {
        PoolError::CreateFailed(reason) => assert!(reason.contains("no backend available")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_start_rejects_invalid_config() {
    let scheduler = Arc::new(Scheduler::default());
    let err = WorkerPool::start(
        pool_config("bad", 3, 1),
        Arc::new(BrokenFactory),
        Arc::new(LocalSchedulerClient::new(scheduler)),
    )
    .await
    .err()
    .expect("start should fail");
    assert!(matches!(err, PoolError::InvalidConfig(_)));
}

// ============================================================================
// CRASHES, KILLS, DEADLINES
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_crash_is_reported_and_worker_replaced() {
    let scheduler = Arc::new(Scheduler::default());
    let factory = CrashingFactory {
        inner: LocalWorkerFactory::new(executor(WorkRegistry::with_builtins())),
    };
    let pool = WorkerPool::start(
        pool_config("crashy", 1, 1),
        Arc::new(factory),
        Arc::new(LocalSchedulerClient::new(Arc::clone(&scheduler))),
    )
    .await
    .expect("pool should start");
    let first_worker = pool.status().workers[0].uuid;

    let crashed = run_to_completion(&scheduler, WorkSpec::new("crash-1", "Crash")).await;
    match &crashed.outcome {
        WorkOutcome::Failure { failure_kind, message } => {
            assert_eq!(*failure_kind, FailureKind::HostCrash);
            assert!(message.contains("137"));
        }
        other => panic!("expected host crash, got {other:?}"),
    }
    assert!(crashed.messages.iter().any(|m| m.message == "about to crash"));

    wait_until(|| pool.size() == 1).await;
    let status = pool.status();
    assert_ne!(status.workers[0].uuid, first_worker);
    assert_eq!(status.stats.crashed, 1);

    let ok = run_to_completion(&scheduler, WorkSpec::new("after-crash", "Echo").with_arg(1)).await;
    assert!(ok.outcome.is_success());

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_kill_work_aborts_running_item() {
    let scheduler = Arc::new(Scheduler::default());
    let pool = start_local(&scheduler, pool_config("cpu", 1, 1)).await;

    let uuid = WorkId::new("long");
    let done = scheduler.completion(&uuid);
    scheduler
        .schedule(WorkSpec::new(uuid.clone(), "Sleep").with_arg(30_000))
        .expect("schedule");
    wait_until(|| pool.status().workers.iter().any(|w| w.work.as_ref() == Some(&uuid))).await;

    pool.kill_work(&uuid).await.expect("kill");
    let result = tokio::time::timeout(WAIT, done).await.expect("in time").expect("delivered");
    assert_eq!(result.outcome.failure_kind(), Some(FailureKind::Aborted));

    assert!(matches!(
        pool.kill_work(&uuid).await,
        Err(PoolError::WorkNotFound(_))
    ));
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_kill_work_escalates_for_stubborn_work() {
    let scheduler = Arc::new(Scheduler::default());
    let mut registry = WorkRegistry::with_builtins();
    registry.register("Stubborn", |_uuid: &WorkId, _args: &[Value]| {
        Ok(Box::new(StubbornWork) as Box<dyn Work>)
    });
    let pool = start_with(&scheduler, pool_config("cpu", 1, 1), registry).await;

    let uuid = WorkId::new("stubborn");
    let done = scheduler.completion(&uuid);
    scheduler.schedule(WorkSpec::new(uuid.clone(), "Stubborn")).expect("schedule");
    wait_until(|| pool.status().workers.iter().any(|w| w.work.as_ref() == Some(&uuid))).await;

    pool.kill_work(&uuid).await.expect("kill");
    let result = tokio::time::timeout(WAIT, done).await.expect("in time").expect("delivered");
    assert_eq!(result.outcome.failure_kind(), Some(FailureKind::Aborted));

    wait_until(|| pool.size() == 1).await;
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deadline_reports_timeout() {
    let scheduler = Arc::new(Scheduler::default());
    let pool = start_local(&scheduler, pool_config("cpu", 1, 1)).await;

    let result = run_to_completion(
        &scheduler,
        WorkSpec::new("slow", "Sleep")
            .with_arg(30_000)
            .with_timeout(Duration::from_millis(50)),
    )
    .await;
    assert_eq!(result.outcome.failure_kind(), Some(FailureKind::Timeout));

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_aborts_running_work() {
    let scheduler = Arc::new(Scheduler::default());
    let pool = start_local(&scheduler, pool_config("cpu", 1, 1)).await;

    let uuid = WorkId::new("interrupted");
    let done = scheduler.completion(&uuid);
    scheduler
        .schedule(WorkSpec::new(uuid.clone(), "Sleep").with_arg(30_000))
        .expect("schedule");
    wait_until(|| pool.status().workers.iter().any(|w| w.work.as_ref() == Some(&uuid))).await;

    tokio::time::timeout(WAIT, pool.shutdown()).await.expect("shutdown in time");
    let result = tokio::time::timeout(WAIT, done).await.expect("in time").expect("delivered");
    assert_eq!(result.outcome.failure_kind(), Some(FailureKind::Aborted));
    assert_eq!(pool.size(), 0);
    assert!(matches!(pool.kill_work(&uuid).await, Err(PoolError::PoolShutdown)));
}

// ============================================================================
// SCHEDULER OUTAGES
// ============================================================================

/// In-process client whose first few `complete` and `append_messages`
/// calls fail as if the transport were down.
struct FlakyClient {
    inner: LocalSchedulerClient,
    complete_failures: AtomicUsize,
    append_failures: AtomicUsize,
}

impl FlakyClient {
    fn new(scheduler: &Arc<Scheduler>, complete_failures: usize, append_failures: usize) -> Self {
        Self {
            inner: LocalSchedulerClient::new(Arc::clone(scheduler)),
            complete_failures: AtomicUsize::new(complete_failures),
            append_failures: AtomicUsize::new(append_failures),
        }
    }

    fn fail(budget: &AtomicUsize) -> bool {
        budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SchedulerClient for FlakyClient {
    async fn poll(&self, capability: &Capability) -> Result<Option<WorkSpec>, ClientError> {
        self.inner.poll(capability).await
    }

    async fn pending(&self, capability: &Capability) -> Result<usize, ClientError> {
        self.inner.pending(capability).await
    }

    async fn append_messages(
        &self,
        uuid: &WorkId,
        messages: Vec<MessageSpec>,
    ) -> Result<(), ClientError> {
        if Self::fail(&self.append_failures) {
            return Err(ClientError::Transport("connection reset".to_string()));
        }
        self.inner.append_messages(uuid, messages).await
    }

    async fn complete(&self, result: WorkResult) -> Result<(), ClientError> {
        if Self::fail(&self.complete_failures) {
            return Err(ClientError::Transport("connection reset".to_string()));
        }
        self.inner.complete(result).await
    }
}

/// Logs a line, waits past a flush, logs another, waits again.
struct ChattyWork;

#[async_trait]
impl Work for ChattyWork {
    async fn execute(&self, ctx: &WorkContext) -> AppResult<Value> {
        ctx.log.log("first");
        tokio::time::sleep(Duration::from_millis(80)).await;
        ctx.log.log("second");
        tokio::time::sleep(Duration::from_millis(80)).await;
        Ok(json!("done"))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_completion_survives_repeated_transport_failures() {
    let scheduler = Arc::new(Scheduler::default());
    let client = Arc::new(FlakyClient::new(&scheduler, 5, 0));
    let pool = WorkerPool::start(
        pool_config("cpu", 1, 1),
        Arc::new(LocalWorkerFactory::new(executor(WorkRegistry::with_builtins()))),
        client,
    )
    .await
    .expect("pool should start");

    let result = run_to_completion(&scheduler, WorkSpec::new("A", "Echo").with_arg("a")).await;
    assert_eq!(result.outcome, WorkOutcome::Success { result: json!("a") });
    assert_eq!(scheduler.in_flight_len(), 0);

    wait_until(|| pool.status().undelivered == 0).await;
    assert!(pool.status().stats.transport_errors >= 5);

    // Later work still flows once the scheduler is reachable.
    let next = run_to_completion(&scheduler, WorkSpec::new("B", "Echo").with_arg("b")).await;
    assert!(next.outcome.is_success());

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_held_completions_keep_report_order() {
    let scheduler = Arc::new(Scheduler::default());
    let client = Arc::new(FlakyClient::new(&scheduler, 4, 0));
    let mut events = scheduler.subscribe();
    let pool = WorkerPool::start(
        pool_config("cpu", 1, 1),
        Arc::new(LocalWorkerFactory::new(executor(WorkRegistry::with_builtins()))),
        client,
    )
    .await
    .expect("pool should start");

    for uuid in ["first", "second"] {
        scheduler.schedule(WorkSpec::new(uuid, "Echo")).expect("schedule");
    }

    let mut order = Vec::new();
    while order.len() < 2 {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("completion in time")
            .expect("event");
        order.push(event.uuid.as_str().to_string());
    }
    assert_eq!(order, ["first", "second"]);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_log_flush_is_resent() {
    let scheduler = Arc::new(Scheduler::default());
    let client = Arc::new(FlakyClient::new(&scheduler, 0, 1));
    let mut registry = WorkRegistry::new();
    registry.register("Chatty", |_uuid: &WorkId, _args: &[Value]| {
        Ok(Box::new(ChattyWork) as Box<dyn Work>)
    });
    let pool = WorkerPool::start(
        pool_config("cpu", 1, 1),
        Arc::new(LocalWorkerFactory::new(executor(registry))),
        client,
    )
    .await
    .expect("pool should start");

    let result = run_to_completion(&scheduler, WorkSpec::new("talk", "Chatty")).await;
    assert!(result.outcome.is_success());

    let lines: Vec<&str> = result
        .messages
        .iter()
        .filter(|m| m.kind == MessageKind::Log)
        .map(|m| m.message.as_str())
        .collect();
    assert_eq!(lines, ["first", "second"]);
    assert_eq!(result.messages.last().map(|m| m.kind), Some(MessageKind::Success));
    assert!(pool.status().stats.transport_errors >= 1);

    pool.shutdown().await;
}
