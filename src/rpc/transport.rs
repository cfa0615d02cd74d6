//! The transport contract.
//!
//! A transport moves one [`Request`] to a server and brings back its
//! [`Response`]. Push-capable transports additionally hand out a stream of
//! unsolicited [`ResponseData`]. Transports never retry: a failure is
//! returned to the caller, which retries on its own next tick.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::rpc::envelope::{Request, Response, ResponseData};

/// Endpoint name used when a transport has no host.
pub const NO_ENDPOINT: &str = "none";

/// Unsolicited server messages on a push-capable transport.
pub type PushStream = mpsc::Receiver<ResponseData>;

/// A rejected exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer went away.
    #[error("transport closed")]
    Closed,
    /// Reading or writing the underlying channel failed.
    #[error("i/o failure: {0}")]
    Io(String),
    /// A frame could not be encoded or decoded.
    #[error("codec failure: {0}")]
    Codec(String),
}

/// Request/response channel to one server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Logical endpoint (hostname, or [`NO_ENDPOINT`]).
    fn endpoint(&self) -> &str;

    /// Send `request` and wait for its response.
    async fn exchange(&self, request: Request) -> Result<Response, TransportError>;

    /// Whether the server can deliver messages without being asked.
    fn supports_server_push(&self) -> bool {
        false
    }

    /// Take the push stream. Returns `None` on polling transports and on
    /// every call after the first.
    fn take_push_stream(&self) -> Option<PushStream> {
        None
    }

    /// The client using `session_uuid` is gone; the server may forget the
    /// session. Connection-bound transports clean up when they close.
    fn close_session(&self, _session_uuid: &str) {}
}
