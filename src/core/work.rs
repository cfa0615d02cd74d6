//! Work item model: the serializable spec, the executable trait, and outcomes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::core::message::{MessageKind, MessageSpec};
use crate::core::AppResult;
use crate::util::{PoolTypes, WorkId, WorkerId};

/// Serializable description of one unit of work.
///
/// A spec is read-only once scheduled; lifecycle state lives in the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkSpec {
    /// Producer-assigned identifier.
    pub uuid: WorkId,
    /// Registry key of the implementation.
    pub type_name: String,
    /// Pool types this item may run on; empty means any pool.
    #[serde(default)]
    pub compatibility: PoolTypes,
    /// Constructor arguments, passed after `uuid`.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Optional execution deadline in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl WorkSpec {
    /// Spec with no arguments, no compatibility constraint, and no deadline.
    pub fn new(uuid: impl Into<WorkId>, type_name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            type_name: type_name.into(),
            compatibility: PoolTypes::new(),
            args: Vec::new(),
            timeout_ms: None,
        }
    }

    /// Append a constructor argument.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Restrict the item to the given pool types.
    #[must_use]
    pub fn with_compatibility<I, S>(mut self, pool_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.compatibility = pool_types.into_iter().map(Into::into).collect();
        self
    }

    /// Set an execution deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Execution deadline, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// True if a consumer serving `pool_types` may run this item.
    #[must_use]
    pub fn is_compatible_with(&self, pool_types: &PoolTypes) -> bool {
        self.compatibility.is_empty() || !self.compatibility.is_disjoint(pool_types)
    }
}

/// Why a work item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// The work type could not be resolved or constructed. Never retried.
    Dispatch,
    /// `execute` returned an error or panicked.
    Execution,
    /// The hosting backend exited while running the item.
    HostCrash,
    /// The outcome could not be delivered over the transport.
    Transport,
    /// The item exceeded its deadline.
    Timeout,
    /// The item was killed on request.
    Aborted,
}

/// Terminal outcome of one work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WorkOutcome {
    /// `execute` returned a value.
    Success {
        /// Opaque JSON result.
        result: Value,
    },
    /// The item failed.
    Failure {
        /// Failure classification.
        #[serde(rename = "failureKind")]
        failure_kind: FailureKind,
        /// Human-readable reason.
        message: String,
    },
}

impl WorkOutcome {
    /// Build a failure outcome.
    pub fn failure(failure_kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure {
            failure_kind,
            message: message.into(),
        }
    }

    /// True for [`WorkOutcome::Success`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Failure classification, if this is a failure.
    #[must_use]
    pub const fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { failure_kind, .. } => Some(*failure_kind),
        }
    }

    /// The terminal log line recorded for this outcome.
    #[must_use]
    pub fn to_message(&self, caller: &WorkId) -> MessageSpec {
        match self {
            Self::Success { .. } => {
                MessageSpec::now(caller.clone(), MessageKind::Success, "work completed")
            }
            Self::Failure { message, .. } => {
                MessageSpec::now(caller.clone(), MessageKind::Failure, message.clone())
            }
        }
    }
}

/// Completion payload sent from a pool to the scheduler and on to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    /// Item the result belongs to.
    pub uuid: WorkId,
    /// Success value or failure reason.
    #[serde(flatten)]
    pub outcome: WorkOutcome,
    /// Log lines not yet flushed to the scheduler (all lines, once published).
    #[serde(default)]
    pub messages: Vec<MessageSpec>,
}

impl WorkResult {
    /// Result without attached messages.
    pub fn new(uuid: WorkId, outcome: WorkOutcome) -> Self {
        Self {
            uuid,
            outcome,
            messages: Vec::new(),
        }
    }
}

/// Receiving side of an abort request.
#[derive(Debug, Clone)]
pub struct AbortSignal(watch::Receiver<bool>);

/// Sending side of an abort request.
#[derive(Debug, Clone)]
pub struct AbortHandle(Arc<watch::Sender<bool>>);

/// Create a connected abort handle and signal.
#[must_use]
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle(Arc::new(tx)), AbortSignal(rx))
}

impl AbortHandle {
    /// Request abort. Idempotent.
    pub fn abort(&self) {
        self.0.send_replace(true);
    }

    /// True once [`AbortHandle::abort`] has been called.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        *self.0.borrow()
    }
}

impl AbortSignal {
    /// A signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self(rx)
    }

    /// True if abort was requested.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once abort is requested. Pends forever if the handle is dropped
    /// without aborting.
    pub async fn aborted(&self) {
        let mut rx = self.0.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Channel a running work item writes its log lines to.
#[derive(Debug, Clone)]
pub struct LogSink {
    caller: WorkId,
    tx: mpsc::UnboundedSender<MessageSpec>,
}

impl LogSink {
    /// Sink attributing lines to `caller`.
    #[must_use]
    pub const fn new(caller: WorkId, tx: mpsc::UnboundedSender<MessageSpec>) -> Self {
        Self { caller, tx }
    }

    /// Sink that discards everything.
    #[must_use]
    pub fn discard(caller: WorkId) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { caller, tx }
    }

    /// Emit a log line. Lines are dropped silently once the tracker is gone.
    pub fn log(&self, message: impl Into<String>) {
        let _ = self.tx.send(MessageSpec::log(self.caller.clone(), message));
    }

    /// Forward an already-built message.
    pub fn send(&self, message: MessageSpec) {
        let _ = self.tx.send(message);
    }
}

/// Everything a running work item can see of its host.
#[derive(Debug, Clone)]
pub struct WorkContext {
    /// Worker hosting the item.
    pub worker_id: WorkerId,
    /// Item being executed.
    pub uuid: WorkId,
    /// Log output.
    pub log: LogSink,
    /// Cooperative cancellation.
    pub abort: AbortSignal,
}

/// Executable entity instantiated from a [`WorkSpec`].
///
/// `execute` may suspend indefinitely; implementations should watch
/// `ctx.abort` so they stop promptly when the host is torn down.
#[async_trait]
pub trait Work: Send + Sync {
    /// Run the item to completion.
    async fn execute(&self, ctx: &WorkContext) -> AppResult<Value>;

    /// Hook invoked when abort is requested while `execute` is running.
    async fn abort(&self, _ctx: &WorkContext) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_compatibility_matches_any_pool() {
        let spec = WorkSpec::new("a", "Echo");
        let pools: PoolTypes = ["gpu".to_string()].into_iter().collect();
        assert!(spec.is_compatible_with(&pools));
        assert!(spec.is_compatible_with(&PoolTypes::new()));
    }

    #[test]
    fn compatibility_requires_intersection() {
        let spec = WorkSpec::new("a", "Echo").with_compatibility(["gpu", "cpu"]);
        let cpu: PoolTypes = ["cpu".to_string()].into_iter().collect();
        let io: PoolTypes = ["io".to_string()].into_iter().collect();
        assert!(spec.is_compatible_with(&cpu));
        assert!(!spec.is_compatible_with(&io));
        assert!(!spec.is_compatible_with(&PoolTypes::new()));
    }

    #[test]
    fn spec_uses_camel_case_on_the_wire() {
        let spec = WorkSpec::new("A", "Echo").with_arg("hi");
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(
            json,
            json!({"uuid": "A", "typeName": "Echo", "compatibility": [], "args": ["hi"]})
        );
        let back: WorkSpec = serde_json::from_value(json!({"uuid": "B", "typeName": "X"})).unwrap();
        assert!(back.args.is_empty());
        assert_eq!(back.timeout_ms, None);
    }

    #[test]
    fn result_flattens_outcome() {
        let result = WorkResult::new(
            "A".into(),
            WorkOutcome::failure(FailureKind::HostCrash, "exit code 3"),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["kind"], "failure");
        assert_eq!(json["failureKind"], "hostCrash");
        assert_eq!(json["message"], "exit code 3");

        let back: WorkResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[tokio::test]
    async fn abort_signal_fires_after_handle_aborts() {
        let (handle, signal) = abort_pair();
        assert!(!signal.is_aborted());
        handle.abort();
        tokio::time::timeout(Duration::from_secs(1), signal.aborted())
            .await
            .unwrap();
        assert!(signal.is_aborted());
    }
}
