//! The scheduler: FIFO queue, in-flight map, and completion bus.
//!
//! All queue and in-flight mutations happen under one `parking_lot::Mutex`, so
//! the scan-remove-assign step in [`Scheduler::poll_for_work`] is atomic with
//! respect to concurrent pollers: an item is handed to at most one consumer.
//! Completion events are broadcast while that lock is held, which makes the
//! delivery order equal to the order `on_work_completed` calls were made.

use std::collections::HashMap;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, Notify};
use tracing::{debug, info, warn};

use crate::core::message::MessageSpec;
use crate::core::work::{FailureKind, WorkOutcome, WorkResult, WorkSpec};
use crate::core::SchedulerError;
use crate::infra::{InMemoryMailbox, InMemoryQueue};
use crate::util::{now_ms, Capability, WorkId};

/// Abstraction for queue backends.
pub trait WorkQueue: Send {
    /// Append a spec at the tail if space permits.
    fn enqueue(&mut self, spec: WorkSpec) -> Result<(), SchedulerError>;
    /// Remove and return the first spec (from the head) satisfying `matches`.
    fn take_first(&mut self, matches: &dyn Fn(&WorkSpec) -> bool) -> Option<WorkSpec>;
    /// Count queued specs satisfying `matches`.
    fn count_matching(&self, matches: &dyn Fn(&WorkSpec) -> bool) -> usize;
    /// True if a spec with `uuid` is queued.
    fn contains(&self, uuid: &WorkId) -> bool;
    /// Remove a queued spec by uuid.
    fn remove(&mut self, uuid: &WorkId) -> Option<WorkSpec>;
    /// Maximum depth allowed for this queue.
    fn max_depth(&self) -> usize;
    /// Current depth.
    fn len(&self) -> usize;
    /// True when nothing is queued.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Abstraction for completion mailboxes that retain recent terminal events.
pub trait Mailbox: Send {
    /// Store a terminal event.
    fn deliver(&mut self, result: WorkResult);
    /// Look up the retained event for `uuid`.
    fn fetch(&self, uuid: &WorkId) -> Option<WorkResult>;
    /// Number of retained events.
    fn len(&self) -> usize;
    /// True when nothing is retained.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lifecycle state of a work item as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkState {
    /// Waiting in the queue.
    Queued,
    /// Claimed by a consumer.
    Assigned,
    /// Finished successfully.
    Completed,
    /// Finished with a failure.
    Failed,
}

/// Result of [`Scheduler::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScheduleOutcome {
    /// Appended to the queue.
    Queued,
    /// A spec with the same uuid is already queued or in flight; nothing changed.
    Duplicate,
}

/// Bookkeeping for an item claimed by a consumer.
#[derive(Debug, Clone)]
pub struct Assignment {
    /// The claimed spec.
    pub spec: WorkSpec,
    /// Consumer that claimed it.
    pub consumer: String,
    /// Claim time in milliseconds since epoch.
    pub assigned_at_ms: u64,
    /// Log lines flushed so far.
    pub messages: Vec<MessageSpec>,
}

/// Capacity limits for a scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerLimits {
    /// Maximum queued items before `schedule` is rejected.
    pub max_queue_depth: usize,
    /// Completed results retained for late waiters.
    pub mailbox_capacity: usize,
    /// Buffered completion events per lagging subscriber.
    pub event_capacity: usize,
}

impl Default for SchedulerLimits {
    fn default() -> Self {
        Self {
            max_queue_depth: 10_000,
            mailbox_capacity: 1024,
            event_capacity: 1024,
        }
    }
}

struct SchedulerState {
    queue: Box<dyn WorkQueue>,
    in_flight: HashMap<WorkId, Assignment>,
    waiters: HashMap<WorkId, Vec<oneshot::Sender<WorkResult>>>,
    mailbox: Box<dyn Mailbox>,
}

/// Queue and dispatch authority matching work to consumers.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    events: broadcast::Sender<WorkResult>,
    work_scheduled: Notify,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerLimits::default())
    }
}

impl Scheduler {
    /// Scheduler with in-memory queue and mailbox.
    #[must_use]
    pub fn new(limits: SchedulerLimits) -> Self {
        Self::with_backends(
            &limits,
            Box::new(InMemoryQueue::new(limits.max_queue_depth)),
            Box::new(InMemoryMailbox::new(limits.mailbox_capacity)),
        )
    }

    /// Scheduler over caller-supplied queue and mailbox backends.
    #[must_use]
    pub fn with_backends(
        limits: &SchedulerLimits,
        queue: Box<dyn WorkQueue>,
        mailbox: Box<dyn Mailbox>,
    ) -> Self {
        let (events, _) = broadcast::channel(limits.event_capacity.max(1));
        Self {
            state: Mutex::new(SchedulerState {
                queue,
                in_flight: HashMap::new(),
                waiters: HashMap::new(),
                mailbox,
            }),
            events,
            work_scheduled: Notify::new(),
        }
    }

    /// Append `spec` to the queue tail.
    ///
    /// A spec whose uuid is already queued or in flight is ignored and
    /// reported as [`ScheduleOutcome::Duplicate`].
    ///
    /// # Errors
    ///
    /// `QueueFull` when the queue is at its maximum depth.
    pub fn schedule(&self, spec: WorkSpec) -> Result<ScheduleOutcome, SchedulerError> {
        let uuid = spec.uuid.clone();
        {
            let mut state = self.state.lock();
            if state.queue.contains(&uuid) || state.in_flight.contains_key(&uuid) {
                warn!(uuid = %uuid, "ignoring duplicate schedule");
                return Ok(ScheduleOutcome::Duplicate);
            }
            state.queue.enqueue(spec)?;
            debug!(uuid = %uuid, depth = state.queue.len(), "work queued");
        }
        self.work_scheduled.notify_waiters();
        Ok(ScheduleOutcome::Queued)
    }

    /// Producer-facing alias of [`Scheduler::schedule`].
    ///
    /// # Errors
    ///
    /// Same as [`Scheduler::schedule`].
    pub fn push(&self, spec: WorkSpec) -> Result<ScheduleOutcome, SchedulerError> {
        self.schedule(spec)
    }

    /// Claim the first queued spec compatible with `capability`.
    ///
    /// Returns `None` when nothing matches; callers should back off before
    /// polling again.
    pub fn poll_for_work(&self, capability: &Capability) -> Option<WorkSpec> {
        let mut state = self.state.lock();
        let spec = state
            .queue
            .take_first(&|s: &WorkSpec| s.is_compatible_with(&capability.pool_types))?;
        state.in_flight.insert(
            spec.uuid.clone(),
            Assignment {
                spec: spec.clone(),
                consumer: capability.consumer.clone(),
                assigned_at_ms: now_ms(),
                messages: Vec::new(),
            },
        );
        debug!(uuid = %spec.uuid, consumer = %capability.consumer, "work assigned");
        Some(spec)
    }

    /// Number of queued specs `capability` could claim.
    pub fn pending_for(&self, capability: &Capability) -> usize {
        self.state
            .lock()
            .queue
            .count_matching(&|s: &WorkSpec| s.is_compatible_with(&capability.pool_types))
    }

    /// Append a flushed batch of log lines to an in-flight item.
    ///
    /// Returns `false` (and drops the batch) if `uuid` is not in flight.
    pub fn append_messages(&self, uuid: &WorkId, messages: Vec<MessageSpec>) -> bool {
        let mut state = self.state.lock();
        match state.in_flight.get_mut(uuid) {
            Some(assignment) => {
                assignment.messages.extend(messages);
                true
            }
            None => {
                debug!(uuid = %uuid, dropped = messages.len(), "log batch for unknown work");
                false
            }
        }
    }

    /// Record a terminal result and notify listeners.
    ///
    /// Results for uuids that are not in flight (late duplicates) are ignored
    /// and `false` is returned.
    pub fn on_work_completed(&self, result: WorkResult) -> bool {
        let mut state = self.state.lock();
        let Some(assignment) = state.in_flight.remove(&result.uuid) else {
            debug!(uuid = %result.uuid, "ignoring completion for unknown work");
            return false;
        };
        let mut event = result;
        let mut messages = assignment.messages;
        messages.append(&mut event.messages);
        event.messages = messages;
        info!(
            uuid = %event.uuid,
            consumer = %assignment.consumer,
            success = event.outcome.is_success(),
            "work finished"
        );
        self.finish(state, event);
        true
    }

    /// Remove a still-queued item and report it as aborted.
    ///
    /// Returns `false` if the item is not queued (already assigned or unknown).
    pub fn cancel(&self, uuid: &WorkId) -> bool {
        let mut state = self.state.lock();
        if state.queue.remove(uuid).is_none() {
            return false;
        }
        let event = WorkResult::new(
            uuid.clone(),
            WorkOutcome::failure(FailureKind::Aborted, "cancelled before dispatch"),
        );
        info!(uuid = %uuid, "queued work cancelled");
        self.finish(state, event);
        true
    }

    fn finish(&self, mut state: MutexGuard<'_, SchedulerState>, event: WorkResult) {
        state.mailbox.deliver(event.clone());
        let waiters = state.waiters.remove(&event.uuid).unwrap_or_default();
        // No receivers is fine; the mailbox still has the event.
        let _ = self.events.send(event.clone());
        drop(state);
        for waiter in waiters {
            let _ = waiter.send(event.clone());
        }
    }

    /// Subscribe to every `workCompleted` event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkResult> {
        self.events.subscribe()
    }

    /// Receiver resolving to the terminal event of `uuid`.
    ///
    /// Resolves immediately if the item already finished and is still
    /// retained in the mailbox. A uuid may be awaited before it is
    /// scheduled; waiters whose receiver was dropped are pruned here.
    pub fn completion(&self, uuid: &WorkId) -> oneshot::Receiver<WorkResult> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.waiters.retain(|_, senders| {
            senders.retain(|sender| !sender.is_closed());
            !senders.is_empty()
        });
        let pending = state.queue.contains(uuid) || state.in_flight.contains_key(uuid);
        match state.mailbox.fetch(uuid) {
            Some(done) if !pending => {
                let _ = tx.send(done);
            }
            _ => state.waiters.entry(uuid.clone()).or_default().push(tx),
        }
        rx
    }

    /// Current lifecycle state of `uuid`, if known.
    pub fn state_of(&self, uuid: &WorkId) -> Option<WorkState> {
        let state = self.state.lock();
        if state.queue.contains(uuid) {
            return Some(WorkState::Queued);
        }
        if state.in_flight.contains_key(uuid) {
            return Some(WorkState::Assigned);
        }
        state.mailbox.fetch(uuid).map(|r| {
            if r.outcome.is_success() {
                WorkState::Completed
            } else {
                WorkState::Failed
            }
        })
    }

    /// Assignment metadata for an in-flight item.
    pub fn assignment(&self, uuid: &WorkId) -> Option<Assignment> {
        self.state.lock().in_flight.get(uuid).cloned()
    }

    /// Number of queued items.
    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Number of assigned, unfinished items.
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Number of uuids with a pending completion waiter.
    pub fn waiting_len(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Resolve the next time something is scheduled.
    pub async fn work_scheduled(&self) {
        self.work_scheduled.notified().await;
    }
}
