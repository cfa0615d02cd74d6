//! Scheduler integration tests: ordering, idempotence, compatibility,
//! concurrent claiming, and completion delivery.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use prometheus_work_runtime::core::{
    FailureKind, MessageSpec, ScheduleOutcome, Scheduler, SchedulerError, SchedulerLimits,
    WorkOutcome, WorkResult, WorkSpec, WorkState,
};
use prometheus_work_runtime::util::{Capability, WorkId};
use serde_json::json;

fn any_pool(name: &str) -> Capability {
    Capability::new(name, Vec::<String>::new())
}

#[test]
fn test_poll_returns_items_in_schedule_order() {
    let scheduler = Scheduler::default();
    for i in 0..5 {
        scheduler
            .schedule(WorkSpec::new(format!("w-{i}"), "Echo"))
            .expect("schedule");
    }

    let cap = any_pool("cpu");
    let order: Vec<String> = std::iter::from_fn(|| scheduler.poll_for_work(&cap))
        .map(|spec| spec.uuid.to_string())
        .collect();
    assert_eq!(order, ["w-0", "w-1", "w-2", "w-3", "w-4"]);
    assert_eq!(scheduler.in_flight_len(), 5);
}

#[test]
fn test_schedule_is_idempotent_while_pending() {
    let scheduler = Scheduler::default();
    let spec = WorkSpec::new("same", "Echo");

    assert_eq!(scheduler.schedule(spec.clone()).expect("first"), ScheduleOutcome::Queued);
    assert_eq!(scheduler.schedule(spec.clone()).expect("second"), ScheduleOutcome::Duplicate);
    assert_eq!(scheduler.queue_len(), 1);

    let claimed = scheduler.poll_for_work(&any_pool("cpu")).expect("claim");
    assert_eq!(scheduler.push(spec.clone()).expect("third"), ScheduleOutcome::Duplicate);

    scheduler.on_work_completed(WorkResult::new(
        claimed.uuid,
        WorkOutcome::Success { result: json!(1) },
    ));
    // Terminal items may be scheduled again.
    assert_eq!(scheduler.schedule(spec).expect("again"), ScheduleOutcome::Queued);
}

#[test]
fn test_compatibility_skips_without_reordering() {
    let scheduler = Scheduler::default();
    scheduler
        .schedule(WorkSpec::new("gpu-1", "Echo").with_compatibility(["gpu"]))
        .expect("schedule");
    scheduler
        .schedule(WorkSpec::new("cpu-1", "Echo").with_compatibility(["cpu"]))
        .expect("schedule");
    scheduler.schedule(WorkSpec::new("any-1", "Echo")).expect("schedule");

    let cpu = Capability::new("cpu-pool", ["cpu"]);
    assert_eq!(scheduler.pending_for(&cpu), 2);
    assert_eq!(scheduler.poll_for_work(&cpu).expect("claim").uuid.as_str(), "cpu-1");
    assert_eq!(scheduler.poll_for_work(&cpu).expect("claim").uuid.as_str(), "any-1");
    assert!(scheduler.poll_for_work(&cpu).is_none());

    assert_eq!(scheduler.state_of(&WorkId::new("gpu-1")), Some(WorkState::Queued));
    let gpu = Capability::new("gpu-pool", ["gpu"]);
    assert_eq!(scheduler.poll_for_work(&gpu).expect("claim").uuid.as_str(), "gpu-1");
    assert_eq!(scheduler.assignment(&WorkId::new("gpu-1")).expect("assigned").consumer, "gpu-pool");
}

#[test]
fn test_queue_full_is_rejected() {
    let scheduler = Scheduler::new(SchedulerLimits {
        max_queue_depth: 2,
        ..SchedulerLimits::default()
    });
    scheduler.schedule(WorkSpec::new("a", "Echo")).expect("a");
    scheduler.schedule(WorkSpec::new("b", "Echo")).expect("b");
    let err = scheduler.schedule(WorkSpec::new("c", "Echo")).unwrap_err();
    assert!(matches!(err, SchedulerError::QueueFull(_)));
}

#[test]
fn test_concurrent_pollers_claim_each_item_once() {
    let scheduler = Arc::new(Scheduler::default());
    let total = 500;
    for i in 0..total {
        scheduler
            .schedule(WorkSpec::new(format!("job-{i}"), "Echo"))
            .expect("schedule");
    }

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || {
                let cap = any_pool(&format!("pool-{n}"));
                let mut claimed = Vec::new();
                while let Some(spec) = scheduler.poll_for_work(&cap) {
                    claimed.push(spec.uuid);
                }
                claimed
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for uuid in handle.join().expect("poller") {
            assert!(seen.insert(uuid), "item claimed twice");
        }
    }
    assert_eq!(seen.len(), total);
    assert_eq!(scheduler.queue_len(), 0);
}

#[tokio::test]
async fn test_completion_merges_flushed_logs_and_notifies() {
    let scheduler = Scheduler::default();
    let uuid = WorkId::new("logged");
    let mut events = scheduler.subscribe();
    let waiter = scheduler.completion(&uuid);

    scheduler.schedule(WorkSpec::new(uuid.clone(), "Echo")).expect("schedule");
    scheduler.poll_for_work(&any_pool("cpu")).expect("claim");
    assert!(scheduler.append_messages(&uuid, vec![MessageSpec::log(uuid.clone(), "first")]));

    let mut result = WorkResult::new(uuid.clone(), WorkOutcome::Success { result: json!("ok") });
    result.messages.push(MessageSpec::log(uuid.clone(), "second"));
    assert!(scheduler.on_work_completed(result));

    let delivered = waiter.await.expect("waiter");
    let lines: Vec<&str> = delivered.messages.iter().map(|m| m.message.as_str()).collect();
    assert_eq!(lines, ["first", "second"]);
    assert_eq!(events.recv().await.expect("event").uuid, uuid);
    assert_eq!(scheduler.state_of(&uuid), Some(WorkState::Completed));

    // Exactly one terminal event per uuid.
    assert!(!scheduler.on_work_completed(WorkResult::new(
        uuid.clone(),
        WorkOutcome::failure(FailureKind::Execution, "late"),
    )));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_late_waiter_gets_retained_result() {
    let scheduler = Scheduler::default();
    let uuid = WorkId::new("early");
    scheduler.schedule(WorkSpec::new(uuid.clone(), "Fail")).expect("schedule");
    scheduler.poll_for_work(&any_pool("cpu")).expect("claim");
    scheduler.on_work_completed(WorkResult::new(
        uuid.clone(),
        WorkOutcome::failure(FailureKind::Execution, "boom"),
    ));

    let result = scheduler.completion(&uuid).await.expect("retained");
    assert_eq!(result.outcome.failure_kind(), Some(FailureKind::Execution));
    assert_eq!(scheduler.state_of(&uuid), Some(WorkState::Failed));
}

#[tokio::test]
async fn test_cancel_only_affects_queued_items() {
    let scheduler = Scheduler::default();
    scheduler.schedule(WorkSpec::new("queued", "Echo")).expect("schedule");
    scheduler.schedule(WorkSpec::new("claimed", "Echo")).expect("schedule");
    let waiter = scheduler.completion(&WorkId::new("queued"));

    assert!(scheduler.cancel(&WorkId::new("queued")));
    let result = waiter.await.expect("cancelled result");
    assert_eq!(result.outcome.failure_kind(), Some(FailureKind::Aborted));

    let claimed = scheduler.poll_for_work(&any_pool("cpu")).expect("claim");
    assert_eq!(claimed.uuid.as_str(), "claimed");
    assert!(!scheduler.cancel(&claimed.uuid));
}
