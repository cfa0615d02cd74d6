//! RPC server: routes calls to named APIs and delivers events per session.
//!
//! Each session either has a push channel (events are sent as they happen)
//! or a bounded buffer drained into the next response for that session.
//! Buffered sessions that stop polling expire after the session TTL.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::rpc::envelope::{EventAck, Request, RequestBody, Response, ResponseData};
use crate::rpc::transport::PushStream;

/// Events kept per session before the oldest are dropped.
pub const DEFAULT_SESSION_BUFFER: usize = 256;

/// Idle time after which a session without a push channel is forgotten.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);

/// Session used for requests without a `Session-Uuid` header.
const ANONYMOUS_SESSION: &str = "anonymous";

/// A failed API call. Carried back to the caller as the `error` of a
/// `methodReturn`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No API is registered under the requested name.
    #[error("unknown api `{0}`")]
    UnknownApi(String),
    /// The API has no such method.
    #[error("unknown method `{0}`")]
    UnknownMethod(String),
    /// Arguments could not be decoded.
    #[error("invalid arguments for `{method}`: {reason}")]
    InvalidArgs {
        /// Method being called.
        method: String,
        /// What was wrong.
        reason: String,
    },
    /// The method ran and failed.
    #[error("{0}")]
    Failed(String),
}

/// Decode positional argument `index` of `method`.
///
/// # Errors
///
/// `InvalidArgs` if the argument is missing or has the wrong shape.
pub fn arg<T: DeserializeOwned>(method: &str, args: &[Value], index: usize) -> Result<T, ApiError> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| ApiError::InvalidArgs {
        method: method.to_string(),
        reason: format!("argument {index}: {e}"),
    })
}

/// Encode a method result.
///
/// # Errors
///
/// `Failed` if `value` cannot be serialized.
pub fn to_result<T: serde::Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::Failed(e.to_string()))
}

/// Per-call information handed to an API.
#[derive(Clone)]
pub struct CallContext {
    /// Session of the caller.
    pub session: String,
    publisher: EventPublisher,
}

impl CallContext {
    /// Deliver an event to the calling session only.
    pub fn publish(&self, event_name: &str, data: Value) {
        self.publisher.publish_to(&self.session, event_name, data);
    }

    /// Publisher for events outliving this call.
    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }
}

/// A named set of methods served by an [`RpcServer`].
#[async_trait]
pub trait RpcApi: Send + Sync {
    /// Invoke `method`.
    async fn call(&self, method: &str, args: Vec<Value>, ctx: &CallContext)
        -> Result<Value, ApiError>;
}

struct Session {
    subscriptions: HashSet<(String, String)>,
    buffered: VecDeque<ResponseData>,
    push: Option<mpsc::Sender<ResponseData>>,
    last_seen: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            subscriptions: HashSet::new(),
            buffered: VecDeque::new(),
            push: None,
            last_seen: Instant::now(),
        }
    }

    fn is_empty(&self) -> bool {
        self.subscriptions.is_empty() && self.buffered.is_empty() && self.push.is_none()
    }
}

struct SessionHub {
    sessions: Mutex<HashMap<String, Session>>,
    capacity: usize,
    ttl: Duration,
    next_sweep: Mutex<Instant>,
}

impl SessionHub {
    /// Forget buffered sessions idle for longer than the TTL. Runs at most
    /// once per TTL.
    fn sweep(&self) {
        let now = Instant::now();
        {
            let mut next = self.next_sweep.lock();
            if now < *next {
                return;
            }
            *next = now + self.ttl;
        }
        let ttl = self.ttl;
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| {
            session.push.is_some() || now.duration_since(session.last_seen) < ttl
        });
        let expired = before - sessions.len();
        if expired > 0 {
            debug!(expired, remaining = sessions.len(), "expired idle sessions");
        }
    }

    fn deliver(&self, session_id: &str, session: &mut Session, data: ResponseData) {
        let Some(push) = session.push.clone() else {
            self.buffer(session_id, session, data);
            return;
        };
        match push.try_send(data) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(session = session_id, "push channel full, dropping event");
            }
            Err(TrySendError::Closed(data)) => {
                debug!(session = session_id, "push channel closed, buffering");
                session.push = None;
                self.buffer(session_id, session, data);
            }
        }
    }

    fn buffer(&self, session_id: &str, session: &mut Session, data: ResponseData) {
        if session.buffered.len() >= self.capacity {
            session.buffered.pop_front();
            warn!(
                session = session_id,
                capacity = self.capacity,
                "session buffer full, dropped oldest event"
            );
        }
        session.buffered.push_back(data);
    }
}

/// Publishes events to sessions of an [`RpcServer`].
#[derive(Clone)]
pub struct EventPublisher {
    hub: Arc<SessionHub>,
}

impl EventPublisher {
    /// Deliver `event_name` to every session subscribed to it on `api_name`.
    /// Returns the number of sessions reached.
    pub fn broadcast(&self, api_name: &str, event_name: &str, data: &Value) -> usize {
        let key = (api_name.to_string(), event_name.to_string());
        let mut sessions = self.hub.sessions.lock();
        let mut reached = 0;
        for (id, session) in sessions.iter_mut() {
            if session.subscriptions.contains(&key) {
                self.hub
                    .deliver(id, session, ResponseData::publish(event_name, data.clone()));
                reached += 1;
            }
        }
        reached
    }

    /// Deliver `event_name` to one session, subscribed or not.
    pub fn publish_to(&self, session_id: &str, event_name: &str, data: Value) {
        let mut sessions = self.hub.sessions.lock();
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(Session::new);
        self.hub
            .deliver(session_id, session, ResponseData::publish(event_name, data));
    }
}

/// Hosts [`RpcApi`]s by `Api-Name`.
pub struct RpcServer {
    apis: RwLock<HashMap<String, Arc<dyn RpcApi>>>,
    hub: Arc<SessionHub>,
    server_api_uuid: String,
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcServer {
    /// Server with the default session buffer.
    pub fn new() -> Self {
        Self::with_session_buffer(DEFAULT_SESSION_BUFFER)
    }

    /// Server keeping up to `capacity` undelivered events per session.
    pub fn with_session_buffer(capacity: usize) -> Self {
        Self::with_session_limits(capacity, DEFAULT_SESSION_TTL)
    }

    /// Server keeping up to `capacity` undelivered events per session and
    /// forgetting sessions that have not polled for `ttl`.
    pub fn with_session_limits(capacity: usize, ttl: Duration) -> Self {
        Self {
            apis: RwLock::new(HashMap::new()),
            hub: Arc::new(SessionHub {
                sessions: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                ttl,
                next_sweep: Mutex::new(Instant::now() + ttl),
            }),
            server_api_uuid: Uuid::new_v4().to_string(),
        }
    }

    /// Identity of this server instance.
    pub fn server_api_uuid(&self) -> &str {
        &self.server_api_uuid
    }

    /// Mount `api` under `api_name`, replacing any previous one.
    pub fn register(&self, api_name: impl Into<String>, api: Arc<dyn RpcApi>) {
        self.apis.write().insert(api_name.into(), api);
    }

    /// Registered API names, sorted.
    pub fn api_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.apis.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Handle for publishing events.
    pub fn publisher(&self) -> EventPublisher {
        EventPublisher {
            hub: Arc::clone(&self.hub),
        }
    }

    /// Route the session's events to a push channel instead of its buffer.
    /// Already buffered events are moved to the channel first.
    pub fn attach_push(&self, session_id: &str) -> PushStream {
        let (tx, rx) = mpsc::channel(self.hub.capacity);
        let mut sessions = self.hub.sessions.lock();
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(Session::new);
        while let Some(data) = session.buffered.pop_front() {
            if tx.try_send(data).is_err() {
                break;
            }
        }
        session.push = Some(tx);
        debug!(session = session_id, "push channel attached");
        rx
    }

    /// Forget a session and its subscriptions.
    pub fn detach(&self, session_id: &str) {
        if self.hub.sessions.lock().remove(session_id).is_some() {
            debug!(session = session_id, "session detached");
        }
    }

    /// Number of known sessions.
    pub fn session_count(&self) -> usize {
        self.hub.sessions.lock().len()
    }

    /// Number of buffered events for `session_id`.
    pub fn buffered_len(&self, session_id: &str) -> usize {
        self.hub
            .sessions
            .lock()
            .get(session_id)
            .map_or(0, |session| session.buffered.len())
    }

    /// Serve one request. Never fails: unknown APIs and methods come back as
    /// a `methodReturn` carrying an error.
    pub async fn handle(&self, request: Request) -> Response {
        self.hub.sweep();
        let session_id = request
            .headers
            .session_uuid
            .clone()
            .unwrap_or_else(|| ANONYMOUS_SESSION.to_string());
        let api_name = request.headers.api_name.clone();
        let call_index = request.headers.call_index;

        let reply = match request.body {
            RequestBody::Poll => None,
            RequestBody::Call {
                method,
                method_args,
            } => {
                let api = self.apis.read().get(&api_name).cloned();
                let result = match api {
                    Some(api) => {
                        let ctx = CallContext {
                            session: session_id.clone(),
                            publisher: self.publisher(),
                        };
                        api.call(&method, method_args, &ctx).await
                    }
                    None => Err(ApiError::UnknownApi(api_name.clone())),
                };
                if let Err(e) = &result {
                    debug!(api = %api_name, method = %method, error = %e, "call failed");
                }
                Some(ResponseData::method_return(
                    call_index,
                    result.map_err(|e| e.to_string()),
                ))
            }
            RequestBody::Subscribe { event_name } => {
                let mut sessions = self.hub.sessions.lock();
                let session = sessions
                    .entry(session_id.clone())
                    .or_insert_with(Session::new);
                session
                    .subscriptions
                    .insert((api_name.clone(), event_name.clone()));
                debug!(session = %session_id, api = %api_name, event = %event_name, "subscribed");
                Some(ResponseData::Subscribed {
                    body: EventAck { event_name },
                })
            }
            RequestBody::Unsubscribe { event_name } => {
                let mut sessions = self.hub.sessions.lock();
                if let Some(session) = sessions.get_mut(&session_id) {
                    session
                        .subscriptions
                        .remove(&(api_name.clone(), event_name.clone()));
                }
                debug!(session = %session_id, api = %api_name, event = %event_name, "unsubscribed");
                Some(ResponseData::Unsubscribed {
                    body: EventAck { event_name },
                })
            }
        };

        let mut data: Vec<ResponseData> = {
            let mut sessions = self.hub.sessions.lock();
            match sessions.get_mut(&session_id) {
                Some(session) => {
                    session.last_seen = Instant::now();
                    let drained: Vec<ResponseData> = session.buffered.drain(..).collect();
                    if session.is_empty() {
                        sessions.remove(&session_id);
                    }
                    drained
                }
                None => Vec::new(),
            }
        };
        data.extend(reply);
        Response { data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl RpcApi for Echo {
        async fn call(
            &self,
            method: &str,
            args: Vec<Value>,
            ctx: &CallContext,
        ) -> Result<Value, ApiError> {
            match method {
                "echo" => {
                    ctx.publish("echoed", json!(args.len()));
                    Ok(args.into_iter().next().unwrap_or(Value::Null))
                }
                other => Err(ApiError::UnknownMethod(other.to_string())),
            }
        }
    }

    fn server() -> RpcServer {
        let server = RpcServer::with_session_buffer(2);
        server.register("echo", Arc::new(Echo));
        server
    }

    #[tokio::test]
    async fn test_events_precede_reply_in_same_response() {
        let server = server();
        let request = Request::call("echo", "echo", vec![json!("x")])
            .with_call_index(4)
            .with_session("s1");
        let response = server.handle(request).await;
        assert_eq!(response.data.len(), 2);
        assert!(matches!(
            &response.data[0],
            ResponseData::Publish { body } if body.event_name == "echoed"
        ));
        match &response.data[1] {
            ResponseData::MethodReturn { headers, body } => {
                assert_eq!(headers.call_index, 4);
                assert_eq!(body.method_result, json!("x"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(server.buffered_len("s1"), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_only_subscribers() {
        let server = server();
        server
            .handle(Request::subscribe("echo", "tick").with_session("sub"))
            .await;
        server.handle(Request::poll("echo").with_session("other")).await;

        let reached = server.publisher().broadcast("echo", "tick", &json!(1));
        assert_eq!(reached, 1);
        assert_eq!(server.buffered_len("sub"), 1);
        assert_eq!(server.buffered_len("other"), 0);

        server
            .handle(Request::unsubscribe("echo", "tick").with_session("sub"))
            .await;
        assert_eq!(server.publisher().broadcast("echo", "tick", &json!(2)), 0);
    }

    #[tokio::test]
    async fn test_session_buffer_drops_oldest() {
        let server = server();
        let publisher = server.publisher();
        for i in 0..3 {
            publisher.publish_to("slow", "n", json!(i));
        }
        let response = server.handle(Request::poll("echo").with_session("slow")).await;
        let values: Vec<Value> = response
            .data
            .into_iter()
            .filter_map(|data| match data {
                ResponseData::Publish { body } => Some(body.event_data),
                _ => None,
            })
            .collect();
        assert_eq!(values, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_push_session_receives_events_directly() {
        let server = server();
        server.publisher().publish_to("live", "early", json!(0));
        let mut push = server.attach_push("live");
        server.publisher().publish_to("live", "late", json!(1));

        let first = push.recv().await.expect("buffered event moved to push");
        let second = push.recv().await.expect("pushed event");
        assert!(matches!(first, ResponseData::Publish { body } if body.event_name == "early"));
        assert!(matches!(second, ResponseData::Publish { body } if body.event_name == "late"));
        assert_eq!(server.buffered_len("live"), 0);

        server.detach("live");
        assert!(push.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_calls_without_state_leave_no_session() {
        let server = server();
        for i in 0..10 {
            let request = Request::call("missing", "x", Vec::new()).with_session(format!("c{i}"));
            server.handle(request).await;
        }
        server
            .handle(Request::call("echo", "echo", vec![json!(1)]).with_session("e"))
            .await;
        assert_eq!(server.session_count(), 0);

        server
            .handle(Request::subscribe("echo", "tick").with_session("sub"))
            .await;
        assert_eq!(server.session_count(), 1);
        server
            .handle(Request::unsubscribe("echo", "tick").with_session("sub"))
            .await;
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_polling_sessions_expire() {
        let server = RpcServer::with_session_limits(8, Duration::from_millis(100));
        server.register("echo", Arc::new(Echo));
        server
            .handle(Request::subscribe("echo", "tick").with_session("gone"))
            .await;
        server
            .handle(Request::subscribe("echo", "tick").with_session("alive"))
            .await;
        let _push = server.attach_push("pushed");
        server
            .handle(Request::subscribe("echo", "tick").with_session("pushed"))
            .await;

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            server.handle(Request::poll("echo").with_session("alive")).await;
        }

        assert_eq!(server.publisher().broadcast("echo", "tick", &json!(1)), 2);
        assert_eq!(server.buffered_len("gone"), 0);
        assert_eq!(server.buffered_len("alive"), 1);
        assert_eq!(server.session_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_api_is_error_return() {
        let server = server();
        let response = server
            .handle(Request::call("missing", "anything", Vec::new()).with_call_index(1))
            .await;
        match &response.data[0] {
            ResponseData::MethodReturn { body, .. } => {
                assert!(body.error.as_deref().is_some_and(|e| e.contains("missing")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
