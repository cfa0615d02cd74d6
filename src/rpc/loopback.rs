//! In-process transports to an [`RpcServer`].
//!
//! Both forward requests straight to [`RpcServer::handle`]. They differ in
//! how events reach the client: [`PollingTransport`] leaves them buffered
//! server-side until the next exchange, [`PushTransport`] binds a session
//! with a push channel.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::rpc::envelope::{Request, Response};
use crate::rpc::server::RpcServer;
use crate::rpc::transport::{PushStream, Transport, TransportError, NO_ENDPOINT};

/// Client-driven transport: events arrive only in responses.
pub struct PollingTransport {
    server: Arc<RpcServer>,
    endpoint: String,
}

impl PollingTransport {
    /// Transport to `server` under the `none` endpoint.
    pub fn new(server: Arc<RpcServer>) -> Self {
        Self {
            server,
            endpoint: NO_ENDPOINT.to_string(),
        }
    }

    /// Name the endpoint (used for subscription counting).
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn exchange(&self, request: Request) -> Result<Response, TransportError> {
        Ok(self.server.handle(request).await)
    }

    fn close_session(&self, session_uuid: &str) {
        self.server.detach(session_uuid);
    }
}

/// Connection-bound transport: every request runs in one session whose
/// events are pushed as they happen.
pub struct PushTransport {
    server: Arc<RpcServer>,
    endpoint: String,
    session: String,
    push: Mutex<Option<PushStream>>,
}

impl PushTransport {
    /// Open a fresh session on `server`.
    pub fn new(server: Arc<RpcServer>) -> Self {
        let session = Uuid::new_v4().to_string();
        let push = server.attach_push(&session);
        Self {
            server,
            endpoint: NO_ENDPOINT.to_string(),
            session,
            push: Mutex::new(Some(push)),
        }
    }

    /// Name the endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Session bound to this transport.
    pub fn session(&self) -> &str {
        &self.session
    }
}

impl Drop for PushTransport {
    fn drop(&mut self) {
        self.server.detach(&self.session);
    }
}

#[async_trait]
impl Transport for PushTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn exchange(&self, mut request: Request) -> Result<Response, TransportError> {
        request.headers.session_uuid = Some(self.session.clone());
        Ok(self.server.handle(request).await)
    }

    fn supports_server_push(&self) -> bool {
        true
    }

    fn take_push_stream(&self) -> Option<PushStream> {
        self.push.lock().take()
    }
}
