//! RPC services for the scheduler, workers and pools, plus the scheduler
//! client pools use across a transport.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::{
    abort_pair, AbortHandle, ClientError, LogSink, MessageSpec, PoolError, PoolStatus,
    ScheduleOutcome, Scheduler, SchedulerClient, WorkContext, WorkExecutor, WorkResult, WorkSpec,
    WorkState, WorkerPool,
};
use crate::rpc::{
    arg, to_result, ApiError, CallContext, ListenerId, RpcApi, RpcClient, RpcError, RpcServer,
    Transport,
};
use crate::util::{Capability, WorkId, WorkerId};

/// Scheduler operations over RPC.
pub struct SchedulerService {
    scheduler: Arc<Scheduler>,
}

impl SchedulerService {
    /// `Api-Name` of the scheduler API.
    pub const API_NAME: &'static str = "scheduler";
    /// Event fired for every terminal result.
    pub const WORK_COMPLETED: &'static str = "workCompleted";

    /// Service over `scheduler`.
    pub const fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    /// Register the service on `server` and relay completion events to
    /// subscribed sessions. The returned task runs as long as the scheduler.
    pub fn mount(scheduler: Arc<Scheduler>, server: &RpcServer) -> JoinHandle<()> {
        let mut events = scheduler.subscribe();
        server.register(Self::API_NAME, Arc::new(Self::new(scheduler)));
        let publisher = server.publisher();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(result) => match serde_json::to_value(&result) {
                        Ok(data) => {
                            let reached =
                                publisher.broadcast(Self::API_NAME, Self::WORK_COMPLETED, &data);
                            debug!(uuid = %result.uuid, reached, "relayed completion");
                        }
                        Err(e) => {
                            warn!(uuid = %result.uuid, error = %e, "cannot encode completion");
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "completion relay lagged behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[async_trait]
impl RpcApi for SchedulerService {
    async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        _ctx: &CallContext,
    ) -> Result<Value, ApiError> {
        match method {
            "schedule" | "push" => {
                let spec: WorkSpec = arg(method, &args, 0)?;
                let outcome = if method == "push" {
                    self.scheduler.push(spec)
                } else {
                    self.scheduler.schedule(spec)
                };
                to_result(&outcome.map_err(|e| ApiError::Failed(e.to_string()))?)
            }
            "poll" => {
                let capability: Capability = arg(method, &args, 0)?;
                to_result(&self.scheduler.poll_for_work(&capability))
            }
            "pending" => {
                let capability: Capability = arg(method, &args, 0)?;
                to_result(&self.scheduler.pending_for(&capability))
            }
            "appendMessages" => {
                let uuid: WorkId = arg(method, &args, 0)?;
                let messages: Vec<MessageSpec> = arg(method, &args, 1)?;
                to_result(&self.scheduler.append_messages(&uuid, messages))
            }
            "completed" => {
                let result: WorkResult = arg(method, &args, 0)?;
                to_result(&self.scheduler.on_work_completed(result))
            }
            "state" => {
                let uuid: WorkId = arg(method, &args, 0)?;
                to_result(&self.scheduler.state_of(&uuid))
            }
            other => Err(ApiError::UnknownMethod(other.to_string())),
        }
    }
}

fn client_error(e: RpcError) -> ClientError {
    match e {
        RpcError::Transport(e) => ClientError::Transport(e.to_string()),
        other => ClientError::Remote(other.to_string()),
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, ClientError> {
    serde_json::to_value(value).map_err(|e| ClientError::Remote(e.to_string()))
}

/// [`SchedulerClient`] for a scheduler behind a transport.
#[derive(Clone)]
pub struct RpcSchedulerClient {
    rpc: RpcClient,
}

impl RpcSchedulerClient {
    /// Client for the scheduler API over `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            rpc: RpcClient::new(transport, SchedulerService::API_NAME),
        }
    }

    /// Client built on an existing RPC client.
    pub const fn from_rpc(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    /// Underlying RPC client.
    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    /// Queue `spec`.
    ///
    /// # Errors
    ///
    /// Transport or scheduler failure.
    pub async fn schedule(&self, spec: &WorkSpec) -> Result<ScheduleOutcome, RpcError> {
        let spec = serde_json::to_value(spec).map_err(|e| RpcError::Decode(e.to_string()))?;
        self.rpc.call_as("schedule", vec![spec]).await
    }

    /// Scheduler-side state of `uuid`.
    ///
    /// # Errors
    ///
    /// Transport or scheduler failure.
    pub async fn state(&self, uuid: &WorkId) -> Result<Option<WorkState>, RpcError> {
        self.rpc.call_as("state", vec![json!(uuid)]).await
    }

    /// Call `listener` for every completion the scheduler publishes.
    ///
    /// # Errors
    ///
    /// The subscription request failed.
    pub async fn on_work_completed<F>(&self, listener: F) -> Result<ListenerId, RpcError>
    where
        F: Fn(WorkResult) + Send + Sync + 'static,
    {
        self.rpc
            .subscribe(SchedulerService::WORK_COMPLETED, move |data| {
                match serde_json::from_value::<WorkResult>(data.clone()) {
                    Ok(result) => listener(result),
                    Err(e) => warn!(error = %e, "malformed completion event"),
                }
            })
            .await
    }
}

#[async_trait]
impl SchedulerClient for RpcSchedulerClient {
    async fn poll(&self, capability: &Capability) -> Result<Option<WorkSpec>, ClientError> {
        self.rpc
            .call_as("poll", vec![encode(capability)?])
            .await
            .map_err(client_error)
    }

    async fn pending(&self, capability: &Capability) -> Result<usize, ClientError> {
        self.rpc
            .call_as("pending", vec![encode(capability)?])
            .await
            .map_err(client_error)
    }

    async fn append_messages(
        &self,
        uuid: &WorkId,
        messages: Vec<MessageSpec>,
    ) -> Result<(), ClientError> {
        self.rpc
            .call("appendMessages", vec![json!(uuid), encode(&messages)?])
            .await
            .map(|_| ())
            .map_err(client_error)
    }

    async fn complete(&self, result: WorkResult) -> Result<(), ClientError> {
        self.rpc
            .call("completed", vec![encode(&result)?])
            .await
            .map(|_| ())
            .map_err(client_error)
    }
}

/// Runs work on behalf of a remote pool.
///
/// Log lines of a running item are published to the calling session as
/// `workLog` events, followed by one `workFinished` event once the item is
/// done and before `run` returns.
pub struct WorkerService {
    worker_id: WorkerId,
    executor: WorkExecutor,
    running: Mutex<HashMap<WorkId, AbortHandle>>,
    debug_port: Option<u16>,
}

impl WorkerService {
    /// `Api-Name` of the worker API.
    pub const API_NAME: &'static str = "worker";
    /// Event carrying one [`MessageSpec`].
    pub const WORK_LOG: &'static str = "workLog";
    /// Event marking the end of an item's log stream.
    pub const WORK_FINISHED: &'static str = "workFinished";

    /// Service executing through `executor`.
    pub fn new(executor: WorkExecutor) -> Self {
        Self {
            worker_id: WorkerId::new(),
            executor,
            running: Mutex::new(HashMap::new()),
            debug_port: None,
        }
    }

    /// Advertise a debug port in `ping`.
    #[must_use]
    pub const fn with_debug_port(mut self, port: Option<u16>) -> Self {
        self.debug_port = port;
        self
    }

    /// Identity reported by `ping`.
    pub const fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    async fn run(&self, spec: WorkSpec, ctx: &CallContext) -> Result<Value, ApiError> {
        let uuid = spec.uuid.clone();
        let (handle, signal) = abort_pair();
        {
            let mut running = self.running.lock();
            if running.contains_key(&uuid) {
                return Err(ApiError::Failed(format!("`{uuid}` is already running")));
            }
            running.insert(uuid.clone(), handle);
        }
        let _entry = RunningEntry {
            running: &self.running,
            uuid: &uuid,
        };

        info!(
            worker_id = %self.worker_id,
            uuid = %uuid,
            type_name = %spec.type_name,
            "running work"
        );
        let (log_tx, mut log_rx) = mpsc::unbounded_channel::<MessageSpec>();
        let work_ctx = WorkContext {
            worker_id: self.worker_id,
            uuid: uuid.clone(),
            log: LogSink::new(uuid.clone(), log_tx),
            abort: signal,
        };

        let publish = |message: &MessageSpec| match serde_json::to_value(message) {
            Ok(data) => ctx.publish(Self::WORK_LOG, data),
            Err(e) => warn!(error = %e, "cannot encode log line"),
        };

        let run = self.executor.run(&spec, work_ctx);
        tokio::pin!(run);
        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                Some(message) = log_rx.recv() => publish(&message),
            }
        };
        while let Ok(message) = log_rx.try_recv() {
            publish(&message);
        }
        ctx.publish(Self::WORK_FINISHED, json!({ "uuid": uuid }));

        debug!(
            worker_id = %self.worker_id,
            uuid = %uuid,
            success = outcome.is_success(),
            "work finished"
        );
        to_result(&outcome)
    }
}

/// Removes a `run` from the running map however the call ends, including
/// when the caller drops it.
struct RunningEntry<'a> {
    running: &'a Mutex<HashMap<WorkId, AbortHandle>>,
    uuid: &'a WorkId,
}

impl Drop for RunningEntry<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(self.uuid);
    }
}

#[async_trait]
impl RpcApi for WorkerService {
    async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        ctx: &CallContext,
    ) -> Result<Value, ApiError> {
        match method {
            "run" => {
                let spec: WorkSpec = arg(method, &args, 0)?;
                self.run(spec, ctx).await
            }
            "abort" => {
                let uuid: WorkId = arg(method, &args, 0)?;
                let found = self.running.lock().get(&uuid).map(AbortHandle::abort).is_some();
                if found {
                    info!(worker_id = %self.worker_id, uuid = %uuid, "abort requested");
                }
                to_result(&found)
            }
            "ping" => Ok(json!({
                "workerId": self.worker_id,
                "typeNames": self.executor.registry().type_names(),
                "debugPort": self.debug_port,
            })),
            other => Err(ApiError::UnknownMethod(other.to_string())),
        }
    }
}

/// Pool status and control over RPC.
#[derive(Default)]
pub struct PoolService {
    pools: RwLock<HashMap<String, Arc<WorkerPool>>>,
}

impl PoolService {
    /// `Api-Name` of the pool API.
    pub const API_NAME: &'static str = "pool";

    /// Service over `pools`, keyed by pool name.
    pub fn new<I>(pools: I) -> Self
    where
        I: IntoIterator<Item = Arc<WorkerPool>>,
    {
        Self {
            pools: RwLock::new(
                pools
                    .into_iter()
                    .map(|pool| (pool.name().to_string(), pool))
                    .collect(),
            ),
        }
    }

    fn snapshot(&self) -> Vec<Arc<WorkerPool>> {
        let mut pools: Vec<Arc<WorkerPool>> = self.pools.read().values().cloned().collect();
        pools.sort_by(|a, b| a.name().cmp(b.name()));
        pools
    }
}

#[async_trait]
impl RpcApi for PoolService {
    async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        _ctx: &CallContext,
    ) -> Result<Value, ApiError> {
        match method {
            "status" => {
                let name: Option<String> = arg(method, &args, 0)?;
                match name {
                    Some(name) => {
                        let pool = self.pools.read().get(&name).cloned();
                        let pool = pool
                            .ok_or_else(|| ApiError::Failed(format!("unknown pool `{name}`")))?;
                        to_result(&pool.status())
                    }
                    None => {
                        let statuses: Vec<PoolStatus> =
                            self.snapshot().iter().map(|pool| pool.status()).collect();
                        to_result(&statuses)
                    }
                }
            }
            "killWork" => {
                let uuid: WorkId = arg(method, &args, 0)?;
                for pool in self.snapshot() {
                    match pool.kill_work(&uuid).await {
                        Ok(()) => return to_result(&pool.name()),
                        Err(PoolError::WorkNotFound(_) | PoolError::PoolShutdown) => {}
                        Err(e) => return Err(ApiError::Failed(e.to_string())),
                    }
                }
                Err(ApiError::Failed(PoolError::WorkNotFound(uuid).to_string()))
            }
            "shutdown" => {
                for pool in self.snapshot() {
                    pool.shutdown().await;
                }
                to_result(&true)
            }
            other => Err(ApiError::UnknownMethod(other.to_string())),
        }
    }
}
