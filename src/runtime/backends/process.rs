//! Child-process backend.
//!
//! Each worker is a child process (by default the `work-host` binary)
//! serving the worker API on its stdin/stdout. The child's stderr is
//! inherited so its logs land next to the parent's. Exit codes come from
//! `Child::wait`.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::{
    AbortSignal, HostOutcome, LogSink, PoolError, WorkSpec, WorkerFactory, WorkerHost,
};
use crate::rpc::StreamTransport;
use crate::util::WorkerId;

use super::remote::RemoteWorkerHost;
use super::wait_killed;

/// Environment variable carrying a worker host's debug port.
pub const DEBUG_PORT_ENV: &str = "WORK_HOST_DEBUG_PORT";

/// Time a new child gets to answer its first `ping`.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for the exit status to arrive once the channel closed.
const EXIT_STATUS_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
struct ExitInfo {
    code: Option<i32>,
    detail: String,
}

async fn exit_info(rx: &mut watch::Receiver<Option<ExitInfo>>) -> Option<ExitInfo> {
    match rx.wait_for(Option::is_some).await {
        Ok(info) => info.clone(),
        Err(_) => None,
    }
}

/// Creates one child process per worker.
pub struct ProcessWorkerFactory {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    debug_ports: Option<AtomicU16>,
}

impl ProcessWorkerFactory {
    /// Factory launching `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            debug_ports: None,
        }
    }

    /// Arguments passed to every child.
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Extra environment for every child.
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Give each child its own debug port, counting up from `base`.
    #[must_use]
    pub fn with_debug_port_base(mut self, base: Option<u16>) -> Self {
        self.debug_ports = base.map(AtomicU16::new);
        self
    }

    fn next_debug_port(&self) -> Option<u16> {
        self.debug_ports
            .as_ref()
            .map(|next| next.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl WorkerFactory for ProcessWorkerFactory {
    fn backend(&self) -> &'static str {
        "process"
    }

    async fn create(&self, id: WorkerId) -> Result<Arc<dyn WorkerHost>, PoolError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(&self.env);
        let debug_port = self.next_debug_port();
        if let Some(port) = debug_port {
            command.env(DEBUG_PORT_ENV, port.to_string());
        }
        let host = ProcessWorkerHost::launch(id, command, format!("work-{id}"), true).await?;
        if let Some(port) = debug_port {
            info!(worker_id = %id, debug_port = port, "worker host debug port assigned");
        }
        Ok(Arc::new(host))
    }

    async fn destroy(&self, host: Arc<dyn WorkerHost>) -> Result<(), PoolError> {
        host.kill().await;
        Ok(())
    }
}

/// A worker running in a child process.
pub struct ProcessWorkerHost {
    id: WorkerId,
    name: String,
    remote: RemoteWorkerHost,
    cooperative: bool,
    kill: watch::Sender<bool>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessWorkerHost {
    /// Spawn `command` with piped stdio and connect to the worker API it
    /// serves. `cooperative` tells the pool whether abort requests reach the
    /// work; when false, aborts kill the process.
    ///
    /// # Errors
    ///
    /// `CreateFailed` if the process cannot start or does not answer.
    pub async fn launch(
        id: WorkerId,
        mut command: Command,
        name: String,
        cooperative: bool,
    ) -> Result<Self, PoolError> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| PoolError::CreateFailed(format!("cannot start `{name}`: {e}")))?;
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::CreateFailed("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::CreateFailed("child stdout unavailable".into()))?;

        let (kill, mut kill_rx) = watch::channel(false);
        let (exit_tx, exit) = watch::channel(None);
        let watched = name.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                () = wait_killed(&mut kill_rx) => {
                    if let Err(e) = child.start_kill() {
                        debug!(name = %watched, error = %e, "kill signal not delivered");
                    }
                    child.wait().await
                }
            };
            let info = match status {
                Ok(status) => ExitInfo {
                    code: status.code(),
                    detail: status.to_string(),
                },
                Err(e) => ExitInfo {
                    code: None,
                    detail: format!("cannot observe exit: {e}"),
                },
            };
            debug!(name = %watched, exit_code = ?info.code, "worker process exited");
            exit_tx.send_replace(Some(info));
        });

        let transport = Arc::new(StreamTransport::new(name.clone(), stdout, stdin));
        let connect = RemoteWorkerHost::connect(id, transport);
        let remote = match tokio::time::timeout(STARTUP_TIMEOUT, connect).await {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => {
                kill.send_replace(true);
                return Err(e);
            }
            Err(_) => {
                kill.send_replace(true);
                return Err(PoolError::CreateFailed(format!(
                    "`{name}` did not start within {}s",
                    STARTUP_TIMEOUT.as_secs()
                )));
            }
        };

        info!(worker_id = %id, name = %name, pid = ?pid, "worker process started");
        Ok(Self {
            id,
            name,
            remote,
            cooperative,
            kill,
            exit,
        })
    }

    /// Process name (container name for containers).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exit code, once the process has exited.
    pub fn exit_code(&self) -> Option<i32> {
        match &*self.exit.borrow() {
            Some(info) => info.code,
            None => None,
        }
    }
}

#[async_trait]
impl WorkerHost for ProcessWorkerHost {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn cooperative_abort(&self) -> bool {
        self.cooperative
    }

    async fn run(&self, spec: WorkSpec, log: LogSink, abort: AbortSignal) -> HostOutcome {
        let mut exited = self.exit.clone();
        let outcome = tokio::select! {
            outcome = self.remote.run(spec, log, abort) => outcome,
            info = exit_info(&mut exited) => {
                let info = info.unwrap_or(ExitInfo { code: None, detail: "exited".into() });
                return HostOutcome::Exited { code: info.code, detail: info.detail };
            }
        };

        match outcome {
            HostOutcome::Exited { detail, .. } => {
                let mut exited = self.exit.clone();
                match tokio::time::timeout(EXIT_STATUS_TIMEOUT, exit_info(&mut exited)).await {
                    Ok(Some(info)) => HostOutcome::Exited {
                        code: info.code,
                        detail: info.detail,
                    },
                    _ => {
                        warn!(
                            worker_id = %self.id,
                            name = %self.name,
                            "worker channel closed without exit"
                        );
                        self.kill.send_replace(true);
                        HostOutcome::Exited { code: None, detail }
                    }
                }
            }
            finished => finished,
        }
    }

    async fn kill(&self) {
        self.kill.send_replace(true);
        self.remote.kill().await;
    }
}
