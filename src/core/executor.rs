//! Runs a resolved work item with abort and deadline handling.
//!
//! Every backend funnels execution through [`WorkExecutor`], so dispatch
//! failures, execution errors, aborts, and timeouts are classified the same
//! way whether the item runs in-process, on a dedicated thread, or inside a
//! child process.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::registry::WorkRegistry;
use crate::core::work::{FailureKind, WorkContext, WorkOutcome, WorkSpec};

/// Default time `execute` gets to wind down after abort.
pub const DEFAULT_ABORT_GRACE: Duration = Duration::from_secs(2);

/// Resolves specs against a registry and drives them to an outcome.
#[derive(Debug, Clone)]
pub struct WorkExecutor {
    registry: Arc<WorkRegistry>,
    abort_grace: Duration,
}

impl WorkExecutor {
    /// Executor over `registry` with the default abort grace.
    #[must_use]
    pub fn new(registry: Arc<WorkRegistry>) -> Self {
        Self {
            registry,
            abort_grace: DEFAULT_ABORT_GRACE,
        }
    }

    /// Override the abort grace period.
    #[must_use]
    pub const fn with_abort_grace(mut self, abort_grace: Duration) -> Self {
        self.abort_grace = abort_grace;
        self
    }

    /// Grace period applied after abort or deadline expiry.
    #[must_use]
    pub const fn abort_grace(&self) -> Duration {
        self.abort_grace
    }

    /// The registry specs are resolved against.
    #[must_use]
    pub fn registry(&self) -> &WorkRegistry {
        &self.registry
    }

    /// Execute `spec` to a terminal outcome.
    ///
    /// Never panics on behalf of the work: resolution failures become
    /// `Dispatch`, errors become `Execution`. When abort is requested or the
    /// deadline passes, the work's `abort` hook runs and `execute` is given
    /// the grace period before it is dropped.
    pub async fn run(&self, spec: &WorkSpec, ctx: WorkContext) -> WorkOutcome {
        let work = match self.registry.resolve(spec) {
            Ok(work) => work,
            Err(e) => {
                warn!(
                    uuid = %spec.uuid,
                    type_name = %spec.type_name,
                    error = %e,
                    "dispatch failed"
                );
                return WorkOutcome::failure(FailureKind::Dispatch, e.to_string());
            }
        };

        debug!(uuid = %spec.uuid, worker_id = %ctx.worker_id, "executing work");

        let execute = work.execute(&ctx);
        tokio::pin!(execute);
        let deadline = async {
            match spec.timeout() {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let reason = tokio::select! {
            result = &mut execute => {
                return match result {
                    Ok(value) => WorkOutcome::Success { result: value },
                    Err(e) => WorkOutcome::failure(FailureKind::Execution, format!("{e:#}")),
                };
            }
            () = ctx.abort.aborted() => FailureKind::Aborted,
            () = &mut deadline => FailureKind::Timeout,
        };

        work.abort(&ctx).await;
        let stopped = tokio::time::timeout(self.abort_grace, &mut execute)
            .await
            .is_ok();

        let mut message = match reason {
            FailureKind::Timeout => format!(
                "work `{}` exceeded its {} ms deadline",
                spec.uuid,
                spec.timeout_ms.unwrap_or_default()
            ),
            _ => format!("work `{}` was aborted", spec.uuid),
        };
        if !stopped {
            message.push_str(&format!(
                " and did not stop within {} ms",
                self.abort_grace.as_millis()
            ));
        }
        warn!(uuid = %spec.uuid, reason = ?reason, stopped, "work interrupted");
        WorkOutcome::failure(reason, message)
    }
}
