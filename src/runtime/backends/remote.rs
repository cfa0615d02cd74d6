//! Remote backend: the worker API on the far side of any [`Transport`].
//!
//! Browser-hosted workers, workers in other processes and workers on other
//! machines all look the same from here. A [`TransportConnector`] produces
//! the transport; [`RemoteWorkerHost`] speaks the worker API over it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::core::{
    AbortSignal, FailureKind, HostOutcome, LogSink, MessageSpec, PoolError, WorkOutcome, WorkSpec,
    WorkerFactory, WorkerHost,
};
use crate::rpc::{RpcClient, RpcError, Transport, TransportError};
use crate::runtime::api::WorkerService;
use crate::util::{WorkId, WorkerId};

use super::wait_killed;

/// How long `run` waits for the end of the log stream after the reply.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Opens a transport to a new remote worker.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Connect the worker that will be known as `id`.
    async fn connect(&self, id: WorkerId) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Creates [`RemoteWorkerHost`]s through a connector.
pub struct RemoteWorkerFactory {
    connector: Arc<dyn TransportConnector>,
}

impl RemoteWorkerFactory {
    /// Factory over `connector`.
    pub fn new(connector: Arc<dyn TransportConnector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl WorkerFactory for RemoteWorkerFactory {
    fn backend(&self) -> &'static str {
        "remote"
    }

    async fn create(&self, id: WorkerId) -> Result<Arc<dyn WorkerHost>, PoolError> {
        let transport = self
            .connector
            .connect(id)
            .await
            .map_err(|e| PoolError::CreateFailed(format!("cannot connect worker: {e}")))?;
        let host = RemoteWorkerHost::connect(id, transport).await?;
        Ok(Arc::new(host))
    }

    async fn destroy(&self, host: Arc<dyn WorkerHost>) -> Result<(), PoolError> {
        host.kill().await;
        Ok(())
    }
}

struct Route {
    log: LogSink,
    finished: Option<oneshot::Sender<()>>,
}

type Routes = Arc<Mutex<HashMap<WorkId, Route>>>;

/// Worker API client acting as a [`WorkerHost`].
pub struct RemoteWorkerHost {
    id: WorkerId,
    rpc: RpcClient,
    routes: Routes,
    killed: watch::Sender<bool>,
}

impl RemoteWorkerHost {
    /// Attach to the worker API over `transport` and check it answers `ping`.
    ///
    /// # Errors
    ///
    /// `CreateFailed` if the worker does not answer.
    pub async fn connect(id: WorkerId, transport: Arc<dyn Transport>) -> Result<Self, PoolError> {
        let rpc = RpcClient::new(transport, WorkerService::API_NAME);
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));

        let log_routes = Arc::clone(&routes);
        rpc.on(WorkerService::WORK_LOG, move |data| {
            match serde_json::from_value::<MessageSpec>(data.clone()) {
                Ok(message) => match log_routes.lock().get(&message.caller) {
                    Some(route) => route.log.send(message),
                    None => debug!(caller = %message.caller, "log line for unknown work"),
                },
                Err(e) => warn!(error = %e, "malformed log event"),
            }
        });

        let finished_routes = Arc::clone(&routes);
        rpc.on(WorkerService::WORK_FINISHED, move |data| {
            let Some(uuid) = data.get("uuid").and_then(Value::as_str) else {
                return;
            };
            let finished = finished_routes
                .lock()
                .get_mut(&WorkId::from(uuid))
                .and_then(|route| route.finished.take());
            if let Some(finished) = finished {
                let _ = finished.send(());
            }
        });

        let pong = rpc
            .call("ping", Vec::new())
            .await
            .map_err(|e| PoolError::CreateFailed(format!("worker did not answer ping: {e}")))?;
        debug!(worker_id = %id, endpoint = rpc.endpoint(), pong = %pong, "remote worker connected");

        let (killed, _) = watch::channel(false);
        Ok(Self {
            id,
            rpc,
            routes,
            killed,
        })
    }

    /// RPC client of this host.
    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    async fn call_run(
        &self,
        spec: &WorkSpec,
        abort: &AbortSignal,
    ) -> Option<Result<Value, RpcError>> {
        let spec_value = match serde_json::to_value(spec) {
            Ok(value) => value,
            Err(e) => return Some(Err(RpcError::Decode(e.to_string()))),
        };
        let mut killed = self.killed.subscribe();
        let call = self.rpc.call("run", vec![spec_value]);
        tokio::pin!(call);

        let mut abort_sent = false;
        loop {
            tokio::select! {
                reply = &mut call => return Some(reply),
                () = abort.aborted(), if !abort_sent => {
                    abort_sent = true;
                    debug!(worker_id = %self.id, uuid = %spec.uuid, "forwarding abort");
                    if let Err(e) = self.rpc.call("abort", vec![json!(spec.uuid)]).await {
                        warn!(
                            worker_id = %self.id,
                            uuid = %spec.uuid,
                            error = %e,
                            "abort not delivered"
                        );
                    }
                }
                () = wait_killed(&mut killed) => return None,
            }
        }
    }
}

#[async_trait]
impl WorkerHost for RemoteWorkerHost {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn run(&self, spec: WorkSpec, log: LogSink, abort: AbortSignal) -> HostOutcome {
        let uuid = spec.uuid.clone();
        let (finished_tx, finished_rx) = oneshot::channel();
        self.routes.lock().insert(
            uuid.clone(),
            Route {
                log,
                finished: Some(finished_tx),
            },
        );

        let outcome = match self.call_run(&spec, &abort).await {
            None => HostOutcome::Exited {
                code: None,
                detail: "remote worker killed".to_string(),
            },
            Some(Ok(value)) => match serde_json::from_value::<WorkOutcome>(value) {
                Ok(outcome) => {
                    if tokio::time::timeout(LOG_DRAIN_TIMEOUT, finished_rx).await.is_err() {
                        debug!(worker_id = %self.id, uuid = %uuid, "log stream end not seen");
                    }
                    HostOutcome::Finished(outcome)
                }
                Err(e) => HostOutcome::Finished(WorkOutcome::failure(
                    FailureKind::Transport,
                    format!("malformed outcome from worker: {e}"),
                )),
            },
            Some(Err(RpcError::Transport(TransportError::Closed))) => HostOutcome::Exited {
                code: None,
                detail: "connection to worker closed".to_string(),
            },
            Some(Err(RpcError::Transport(e))) => {
                HostOutcome::Finished(WorkOutcome::failure(FailureKind::Transport, e.to_string()))
            }
            Some(Err(e)) => {
                HostOutcome::Finished(WorkOutcome::failure(FailureKind::Dispatch, e.to_string()))
            }
        };

        self.routes.lock().remove(&uuid);
        outcome
    }

    async fn kill(&self) {
        self.killed.send_replace(true);
    }
}
