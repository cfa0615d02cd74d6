//! Worker host side of the process and container backends.
//!
//! A host serves the worker API on its own stdin/stdout. Everything it logs
//! must go to stderr.

use std::sync::Arc;

use tracing::info;

use crate::core::WorkExecutor;
use crate::rpc::{serve_stream, RpcServer, TransportError};

use super::api::WorkerService;

/// RPC server exposing a [`WorkerService`] under the worker API name.
pub fn worker_host_server(executor: WorkExecutor, debug_port: Option<u16>) -> Arc<RpcServer> {
    let service = WorkerService::new(executor).with_debug_port(debug_port);
    info!(worker_id = %service.worker_id(), debug_port = ?debug_port, "worker host ready");
    let server = Arc::new(RpcServer::new());
    server.register(WorkerService::API_NAME, Arc::new(service));
    server
}

/// Serve `server` over this process's stdin/stdout until stdin closes.
///
/// # Errors
///
/// The stream failed before stdin reached end of file.
pub async fn serve_stdio(server: Arc<RpcServer>) -> Result<(), TransportError> {
    serve_stream(server, tokio::io::stdin(), tokio::io::stdout()).await
}
