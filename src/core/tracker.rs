//! Per-worker supervisor: lifecycle state machine, log buffer, exit handling.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::message::{LogBuffer, MessageKind, MessageSpec};
use crate::core::work::{FailureKind, WorkOutcome, WorkResult, WorkSpec};
use crate::util::{WorkId, WorkerId};

/// Lifecycle of one worker.
///
/// `created → initializing → idle → running → (idle | dead)`; `dead` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerState {
    /// Handle allocated, backend not started.
    Created,
    /// Backend starting.
    Initializing,
    /// Ready for work.
    Idle,
    /// Executing exactly one item.
    Running,
    /// Exited or retired.
    Dead,
}

/// A transition the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal worker transition {from:?} -> {to:?}")]
pub struct TransitionError {
    /// State before the attempted transition.
    pub from: WorkerState,
    /// Requested state.
    pub to: WorkerState,
}

/// Tracks one worker's state, current item, and log lines.
#[derive(Debug)]
pub struct WorkerTracker {
    id: WorkerId,
    state: WorkerState,
    current: Option<WorkSpec>,
    log: LogBuffer,
    exit_code: Option<i32>,
    completed: u64,
}

impl WorkerTracker {
    /// Tracker for a freshly allocated worker.
    #[must_use]
    pub const fn new(id: WorkerId) -> Self {
        Self {
            id,
            state: WorkerState::Created,
            current: None,
            log: LogBuffer::new(),
            exit_code: None,
            completed: 0,
        }
    }

    /// Worker identity.
    #[must_use]
    pub const fn id(&self) -> WorkerId {
        self.id
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> WorkerState {
        self.state
    }

    /// Item being executed, while running.
    #[must_use]
    pub const fn current(&self) -> Option<&WorkSpec> {
        self.current.as_ref()
    }

    /// Uuid of the item being executed, while running.
    #[must_use]
    pub fn current_uuid(&self) -> Option<&WorkId> {
        self.current.as_ref().map(|s| &s.uuid)
    }

    /// Exit code observed when the backend died, if any.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Items this worker finished.
    #[must_use]
    pub const fn completed(&self) -> u64 {
        self.completed
    }

    fn transition(
        &mut self,
        to: WorkerState,
        allowed_from: &[WorkerState],
    ) -> Result<(), TransitionError> {
        if !allowed_from.contains(&self.state) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        debug!(worker_id = %self.id, from = ?self.state, to = ?to, "worker transition");
        self.state = to;
        Ok(())
    }

    /// `created → initializing`.
    ///
    /// # Errors
    ///
    /// `TransitionError` from any other state.
    pub fn begin_initializing(&mut self) -> Result<(), TransitionError> {
        self.transition(WorkerState::Initializing, &[WorkerState::Created])
    }

    /// `initializing → idle`.
    ///
    /// # Errors
    ///
    /// `TransitionError` from any other state.
    pub fn mark_ready(&mut self) -> Result<(), TransitionError> {
        self.transition(WorkerState::Idle, &[WorkerState::Initializing])
    }

    /// `idle → running` with `spec` as the current item.
    ///
    /// # Errors
    ///
    /// `TransitionError` unless the worker is idle.
    pub fn assign(&mut self, spec: WorkSpec) -> Result<(), TransitionError> {
        self.transition(WorkerState::Running, &[WorkerState::Idle])?;
        self.current = Some(spec);
        Ok(())
    }

    /// Buffer a log line from the running item. Lines from other items are
    /// dropped.
    pub fn record(&mut self, message: MessageSpec) {
        if self.current_uuid() == Some(&message.caller) {
            self.log.push(message);
        } else {
            debug!(worker_id = %self.id, caller = %message.caller, "dropping stray log line");
        }
    }

    /// Copy out the unflushed lines of the running item for a batched flush.
    pub fn take_pending_logs(&mut self) -> Option<(WorkId, Vec<MessageSpec>)> {
        let uuid = self.current_uuid()?.clone();
        if self.log.pending_len() == 0 {
            return None;
        }
        Some((uuid, self.log.drain()))
    }

    /// `running → idle`, producing the completion for the current item.
    ///
    /// # Errors
    ///
    /// `TransitionError` unless the worker is running.
    pub fn complete(&mut self, outcome: WorkOutcome) -> Result<WorkResult, TransitionError> {
        self.transition(WorkerState::Idle, &[WorkerState::Running])?;
        let Some(spec) = self.current.take() else {
            return Err(TransitionError {
                from: WorkerState::Running,
                to: WorkerState::Idle,
            });
        };
        self.log.push(outcome.to_message(&spec.uuid));
        self.completed += 1;
        Ok(WorkResult {
            uuid: spec.uuid,
            outcome,
            messages: self.log.drain(),
        })
    }

    /// Backend exited. Moves to `dead`; if an item was running, returns its
    /// synthesized failure citing the exit code.
    pub fn on_exit(
        &mut self,
        code: Option<i32>,
        failure_kind: FailureKind,
        detail: &str,
    ) -> Option<WorkResult> {
        let was = self.state;
        self.state = WorkerState::Dead;
        self.exit_code = code;
        if was != WorkerState::Running {
            debug!(worker_id = %self.id, from = ?was, "worker exited while not running");
            return None;
        }
        let spec = self.current.take()?;
        let message = match code {
            Some(code) => format!("worker {} exited with code {code}: {detail}", self.id),
            None => format!("worker {} exited without an exit code: {detail}", self.id),
        };
        warn!(
            worker_id = %self.id,
            uuid = %spec.uuid,
            exit_code = ?code,
            "worker died while running"
        );
        self.log.push(MessageSpec::now(
            spec.uuid.clone(),
            MessageKind::Failure,
            message.clone(),
        ));
        Some(WorkResult {
            uuid: spec.uuid,
            outcome: WorkOutcome::failure(failure_kind, message),
            messages: self.log.drain(),
        })
    }

    /// Retire a worker that is not running.
    ///
    /// # Errors
    ///
    /// `TransitionError` if the worker is running or already dead.
    pub fn retire(&mut self) -> Result<(), TransitionError> {
        self.transition(
            WorkerState::Dead,
            &[
                WorkerState::Created,
                WorkerState::Initializing,
                WorkerState::Idle,
            ],
        )
    }
}
