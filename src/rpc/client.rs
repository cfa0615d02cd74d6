//! RPC client: correlated calls, event listeners, subscription-driven
//! polling.
//!
//! On a push transport a pump task drains the push stream. On a polling
//! transport a poll loop runs for the endpoint while at least one event
//! subscription exists, and stops when the last one is removed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::rpc::envelope::{Request, RequestBody, RequestHeaders, ResponseData};
use crate::rpc::subscriptions::SubscriptionCounter;
use crate::rpc::transport::{Transport, TransportError};

/// Interval between polls on non-push transports.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Failure of a call made through [`RpcClient`].
#[derive(Debug, Error)]
pub enum RpcError {
    /// The transport rejected the exchange.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The server answered with an error.
    #[error("remote error: {0}")]
    Remote(String),
    /// The response had no `methodReturn` for the call.
    #[error("no return value for call {0}")]
    NoReturn(u64),
    /// The return value had an unexpected shape.
    #[error("cannot decode result: {0}")]
    Decode(String),
}

/// Callback for a published event.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ClientInner {
    transport: Arc<dyn Transport>,
    api_name: String,
    client_api_uuid: String,
    session_uuid: String,
    call_index: AtomicU64,
    next_listener: AtomicU64,
    listeners: RwLock<HashMap<String, Vec<(ListenerId, Listener)>>>,
    /// Events subscribed on the server.
    subscribed: Mutex<HashSet<String>>,
    subscriptions: Arc<SubscriptionCounter>,
    poll_interval: Duration,
    poll_loop: Mutex<Option<JoinHandle<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Client for one API behind one transport.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Client for `api_name` with its own subscription counter.
    /// Must be called inside a tokio runtime when the transport pushes.
    pub fn new(transport: Arc<dyn Transport>, api_name: impl Into<String>) -> Self {
        Self::with_subscriptions(
            transport,
            api_name,
            Arc::new(SubscriptionCounter::new()),
            DEFAULT_POLL_INTERVAL,
        )
    }

    /// Client sharing `subscriptions` with other clients of the same
    /// endpoints.
    pub fn with_subscriptions(
        transport: Arc<dyn Transport>,
        api_name: impl Into<String>,
        subscriptions: Arc<SubscriptionCounter>,
        poll_interval: Duration,
    ) -> Self {
        let inner = Arc::new(ClientInner {
            transport,
            api_name: api_name.into(),
            client_api_uuid: Uuid::new_v4().to_string(),
            session_uuid: Uuid::new_v4().to_string(),
            call_index: AtomicU64::new(0),
            next_listener: AtomicU64::new(1),
            listeners: RwLock::new(HashMap::new()),
            subscribed: Mutex::new(HashSet::new()),
            subscriptions,
            poll_interval,
            poll_loop: Mutex::new(None),
            pump: Mutex::new(None),
        });

        if let Some(mut stream) = inner.transport.take_push_stream() {
            let weak = Arc::downgrade(&inner);
            let pump = tokio::spawn(async move {
                while let Some(data) = stream.recv().await {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    inner.dispatch(data);
                }
            });
            *inner.pump.lock() = Some(pump);
        }

        Self { inner }
    }

    /// API this client talks to.
    pub fn api_name(&self) -> &str {
        &self.inner.api_name
    }

    /// Session used for requests.
    pub fn session_uuid(&self) -> &str {
        &self.inner.session_uuid
    }

    /// Transport endpoint.
    pub fn endpoint(&self) -> &str {
        self.inner.transport.endpoint()
    }

    /// Whether a poll loop is running.
    pub fn is_polling(&self) -> bool {
        self.inner.poll_loop.lock().is_some()
    }

    /// Invoke `method` and return its raw result.
    ///
    /// # Errors
    ///
    /// `Transport` if the exchange failed, `Remote` if the method failed.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let call_index = self.inner.call_index.fetch_add(1, Ordering::SeqCst) + 1;
        let request = self.inner.request(
            call_index,
            RequestBody::Call {
                method: method.to_string(),
                method_args: args,
            },
        );
        let response = self.inner.transport.exchange(request).await?;

        let mut result = None;
        for data in response.data {
            match data {
                ResponseData::MethodReturn { headers, body }
                    if headers.call_index == call_index =>
                {
                    result = Some(body);
                }
                other => self.inner.dispatch(other),
            }
        }

        match result {
            Some(body) => match body.error {
                Some(error) => Err(RpcError::Remote(error)),
                None => Ok(body.method_result),
            },
            None => Err(RpcError::NoReturn(call_index)),
        }
    }

    /// Invoke `method` and decode its result.
    ///
    /// # Errors
    ///
    /// As [`call`](Self::call), plus `Decode`.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<T, RpcError> {
        let value = self.call(method, args).await?;
        serde_json::from_value(value).map_err(|e| RpcError::Decode(e.to_string()))
    }

    /// Register a local listener without subscribing on the server. Used for
    /// events delivered to the session directly.
    pub fn on<F>(&self, event_name: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::SeqCst));
        self.inner
            .listeners
            .write()
            .entry(event_name.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener registered with [`on`](Self::on).
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.remove_listener(id).is_some()
    }

    /// Subscribe to `event_name` and register `listener` for it. The first
    /// subscription on a polling transport starts the poll loop.
    ///
    /// # Errors
    ///
    /// The subscribe request failed; the listener is not kept.
    pub async fn subscribe<F>(&self, event_name: &str, listener: F) -> Result<ListenerId, RpcError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let first = !self.inner.listeners.read().contains_key(event_name);
        let id = self.on(event_name, listener);
        if !first {
            return Ok(id);
        }

        let request = self.inner.request(
            0,
            RequestBody::Subscribe {
                event_name: event_name.to_string(),
            },
        );
        match self.inner.transport.exchange(request).await {
            Ok(response) => {
                for data in response.data {
                    self.inner.dispatch(data);
                }
            }
            Err(e) => {
                self.inner.remove_listener(id);
                return Err(e.into());
            }
        }

        self.inner.subscribed.lock().insert(event_name.to_string());
        let endpoint = self.endpoint().to_string();
        if self.inner.subscriptions.increment(&endpoint) == 1 {
            debug!(endpoint = %endpoint, event = event_name, "first subscription on endpoint");
        }
        if !self.inner.transport.supports_server_push() {
            ClientInner::start_poll_loop(&self.inner);
        }
        Ok(id)
    }

    /// Remove a subscribed listener. When it was the last listener of its
    /// event the server subscription is dropped; when the endpoint count
    /// reaches zero the poll loop stops.
    ///
    /// # Errors
    ///
    /// The unsubscribe request failed. Local state is updated regardless.
    pub async fn unsubscribe(&self, id: ListenerId) -> Result<(), RpcError> {
        let Some((event_name, now_empty)) = self.inner.remove_listener(id) else {
            return Ok(());
        };
        if !now_empty || !self.inner.subscribed.lock().remove(&event_name) {
            return Ok(());
        }

        let endpoint = self.endpoint().to_string();
        let remaining = self.inner.subscriptions.decrement(&endpoint);
        if remaining == 0 || self.inner.listeners.read().is_empty() {
            self.inner.stop_poll_loop();
        }

        let request = self.inner.request(0, RequestBody::Unsubscribe { event_name });
        let response = self.inner.transport.exchange(request).await?;
        for data in response.data {
            self.inner.dispatch(data);
        }
        Ok(())
    }

    /// One poll exchange; buffered events are dispatched to listeners.
    ///
    /// # Errors
    ///
    /// The transport rejected the poll.
    pub async fn poll(&self) -> Result<usize, RpcError> {
        Ok(self.inner.poll_once().await?)
    }
}

impl ClientInner {
    fn request(&self, call_index: u64, body: RequestBody) -> Request {
        Request {
            headers: RequestHeaders {
                call_index,
                api_name: self.api_name.clone(),
                client_api_uuid: Some(self.client_api_uuid.clone()),
                session_uuid: Some(self.session_uuid.clone()),
                ..RequestHeaders::default()
            },
            body,
        }
    }

    fn dispatch(&self, data: ResponseData) {
        match data {
            ResponseData::Publish { body } => {
                let listeners: Vec<Listener> = self
                    .listeners
                    .read()
                    .get(&body.event_name)
                    .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
                    .unwrap_or_default();
                if listeners.is_empty() {
                    debug!(event = %body.event_name, "event without listeners");
                }
                for listener in listeners {
                    listener(&body.event_data);
                }
            }
            ResponseData::MethodReturn { headers, .. } => {
                debug!(call_index = headers.call_index, "unmatched method return");
            }
            ResponseData::Subscribed { body } | ResponseData::Unsubscribed { body } => {
                debug!(event = %body.event_name, "subscription acknowledged");
            }
        }
    }

    /// Returns the event name and whether it has no listeners left.
    fn remove_listener(&self, id: ListenerId) -> Option<(String, bool)> {
        let mut listeners = self.listeners.write();
        let event_name = listeners
            .iter()
            .find(|(_, list)| list.iter().any(|(lid, _)| *lid == id))
            .map(|(name, _)| name.clone())?;
        let now_empty = listeners.get_mut(&event_name).is_some_and(|list| {
            list.retain(|(lid, _)| *lid != id);
            list.is_empty()
        });
        if now_empty {
            listeners.remove(&event_name);
        }
        Some((event_name, now_empty))
    }

    async fn poll_once(&self) -> Result<usize, TransportError> {
        let request = self.request(0, RequestBody::Poll);
        let response = self.transport.exchange(request).await?;
        let count = response.data.len();
        for data in response.data {
            self.dispatch(data);
        }
        Ok(count)
    }

    fn start_poll_loop(inner: &Arc<Self>) {
        let mut slot = inner.poll_loop.lock();
        if slot.is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(inner);
        let interval = inner.poll_interval;
        debug!(endpoint = inner.transport.endpoint(), "starting poll loop");
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = inner.poll_once().await {
                    warn!(endpoint = inner.transport.endpoint(), error = %e, "poll failed");
                }
            }
        }));
    }

    fn stop_poll_loop(&self) {
        if let Some(handle) = self.poll_loop.lock().take() {
            debug!(endpoint = self.transport.endpoint(), "stopping poll loop");
            handle.abort();
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(handle) = self.poll_loop.get_mut().take() {
            handle.abort();
        }
        if let Some(handle) = self.pump.get_mut().take() {
            handle.abort();
        }
        let endpoint = self.transport.endpoint();
        for _ in self.subscribed.get_mut().drain() {
            self.subscriptions.decrement(endpoint);
        }
        self.transport.close_session(&self.session_uuid);
    }
}
