//! Built-in work types available in every registry built with `with_builtins`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::work::{Work, WorkContext};
use crate::core::AppResult;
use crate::util::WorkId;

/// Returns its first argument unchanged.
#[derive(Debug)]
pub struct EchoWork {
    value: Value,
}

impl EchoWork {
    /// Registry constructor.
    ///
    /// # Errors
    ///
    /// Never fails; missing arguments echo `null`.
    pub fn construct(_uuid: &WorkId, args: &[Value]) -> AppResult<Box<dyn Work>> {
        Ok(Box::new(Self {
            value: args.first().cloned().unwrap_or(Value::Null),
        }))
    }
}

#[async_trait]
impl Work for EchoWork {
    async fn execute(&self, ctx: &WorkContext) -> AppResult<Value> {
        ctx.log.log(format!("echo {}", self.value));
        Ok(self.value.clone())
    }
}

/// Always fails with its first argument as the reason.
#[derive(Debug)]
pub struct FailWork {
    reason: String,
}

impl FailWork {
    /// Registry constructor.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn construct(_uuid: &WorkId, args: &[Value]) -> AppResult<Box<dyn Work>> {
        let reason = match args.first() {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "failed".to_string(),
        };
        Ok(Box::new(Self { reason }))
    }
}

#[async_trait]
impl Work for FailWork {
    async fn execute(&self, _ctx: &WorkContext) -> AppResult<Value> {
        anyhow::bail!("{}", self.reason)
    }
}

/// Sleeps for `args[0]` milliseconds, then returns `args[1]` (or `null`).
/// Stops early when aborted.
#[derive(Debug)]
pub struct SleepWork {
    duration: Duration,
    value: Value,
}

impl SleepWork {
    /// Registry constructor.
    ///
    /// # Errors
    ///
    /// Fails if `args[0]` is not a non-negative integer.
    pub fn construct(_uuid: &WorkId, args: &[Value]) -> AppResult<Box<dyn Work>> {
        let ms = args
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow::anyhow!("Sleep expects a duration in milliseconds"))?;
        Ok(Box::new(Self {
            duration: Duration::from_millis(ms),
            value: args.get(1).cloned().unwrap_or(Value::Null),
        }))
    }
}

#[async_trait]
impl Work for SleepWork {
    async fn execute(&self, ctx: &WorkContext) -> AppResult<Value> {
        tokio::select! {
            () = tokio::time::sleep(self.duration) => Ok(self.value.clone()),
            () = ctx.abort.aborted() => anyhow::bail!("sleep interrupted"),
        }
    }
}
