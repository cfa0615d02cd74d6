//! Request/response RPC used between producers, schedulers and workers.
//!
//! The envelope is transport-independent; [`Transport`] has a polling and a
//! push flavor, and callers choose one per deployment.

pub mod client;
pub mod envelope;
pub mod loopback;
pub mod server;
pub mod stream;
pub mod subscriptions;
pub mod transport;

pub use client::{Listener, ListenerId, RpcClient, RpcError, DEFAULT_POLL_INTERVAL};
pub use envelope::{
    EventAck, MethodReturn, Published, Request, RequestBody, RequestHeaders, Response,
    ResponseData, ReturnHeaders,
};
pub use loopback::{PollingTransport, PushTransport};
pub use server::{
    arg, to_result, ApiError, CallContext, EventPublisher, RpcApi, RpcServer,
    DEFAULT_SESSION_BUFFER, DEFAULT_SESSION_TTL,
};
pub use stream::{serve_stream, RequestFrame, ResponseFrame, StreamTransport};
pub use subscriptions::SubscriptionCounter;
pub use transport::{PushStream, Transport, TransportError, NO_ENDPOINT};
