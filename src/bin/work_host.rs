//! `work-host`: serves the worker API on stdin/stdout.
//!
//! Launched by the process and container backends. Logs go to stderr.
//! Besides the built-in work types it registers `Exit`, which terminates
//! the host with the exit code in `args[0]`.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use prometheus_work_runtime::core::{AppResult, Work, WorkContext, WorkExecutor, WorkRegistry};
use prometheus_work_runtime::runtime::{serve_stdio, worker_host_server, DEBUG_PORT_ENV};
use prometheus_work_runtime::util::{init_tracing, WorkId};

/// Exits the host process. Used to exercise crash recovery.
struct ExitWork {
    code: i32,
}

impl ExitWork {
    fn construct(_uuid: &WorkId, args: &[Value]) -> AppResult<Box<dyn Work>> {
        let code = args
            .first()
            .and_then(Value::as_i64)
            .and_then(|code| i32::try_from(code).ok())
            .unwrap_or(1);
        Ok(Box::new(Self { code }))
    }
}

#[async_trait]
impl Work for ExitWork {
    async fn execute(&self, ctx: &WorkContext) -> AppResult<Value> {
        warn!(uuid = %ctx.uuid, code = self.code, "exiting on request");
        std::process::exit(self.code)
    }
}

fn debug_port() -> AppResult<Option<u16>> {
    match std::env::var(DEBUG_PORT_ENV) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .with_context(|| format!("{DEBUG_PORT_ENV} is not a port: `{raw}`")),
        Err(_) => Ok(None),
    }
}

#[tokio::main]
async fn main() -> AppResult<()> {
    init_tracing();

    let mut registry = WorkRegistry::with_builtins();
    registry.register("Exit", ExitWork::construct);
    let executor = WorkExecutor::new(Arc::new(registry));

    let server = worker_host_server(executor, debug_port()?);
    serve_stdio(server).await.context("worker channel failed")?;
    info!("stdin closed, worker host exiting");
    Ok(())
}
