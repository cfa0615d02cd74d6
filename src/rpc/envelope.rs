//! Request/response envelope shared by every transport.
//!
//! ```json
//! {"headers": {"Call-Index": 3, "Api-Name": "scheduler", "Session-Uuid": "..."},
//!  "body": {"type": "call", "method": "poll", "methodArgs": [...]}}
//!
//! {"data": [{"type": "methodReturn", "headers": {"Call-Index": 3},
//!            "body": {"methodResult": null}},
//!           {"type": "publish", "body": {"eventName": "workCompleted", "eventData": {...}}}]}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeaders {
    /// Correlates a call with its `methodReturn`.
    #[serde(rename = "Call-Index", default)]
    pub call_index: u64,
    /// Target API on the server.
    #[serde(rename = "Api-Name", default)]
    pub api_name: String,
    /// Identifies the calling client instance.
    #[serde(rename = "Client-Api-Uuid", default, skip_serializing_if = "Option::is_none")]
    pub client_api_uuid: Option<String>,
    /// Identifies the server API instance, once known.
    #[serde(rename = "Server-Api-Uuid", default, skip_serializing_if = "Option::is_none")]
    pub server_api_uuid: Option<String>,
    /// Session events are buffered or pushed to.
    #[serde(rename = "Session-Uuid", default, skip_serializing_if = "Option::is_none")]
    pub session_uuid: Option<String>,
    /// Opaque cookie map, passed through untouched.
    #[serde(rename = "Cookies", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cookies: BTreeMap<String, String>,
}

/// What a request asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RequestBody {
    /// Fetch buffered events only.
    Poll,
    /// Invoke a method.
    #[serde(rename_all = "camelCase")]
    Call {
        /// Method name.
        method: String,
        /// Positional arguments.
        #[serde(default)]
        method_args: Vec<Value>,
    },
    /// Start receiving an event.
    #[serde(rename_all = "camelCase")]
    Subscribe {
        /// Event name.
        event_name: String,
    },
    /// Stop receiving an event.
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        /// Event name.
        event_name: String,
    },
}

/// A client-to-server message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Routing and correlation headers.
    pub headers: RequestHeaders,
    /// Payload.
    pub body: RequestBody,
}

impl Request {
    fn new(api_name: impl Into<String>, body: RequestBody) -> Self {
        Self {
            headers: RequestHeaders {
                api_name: api_name.into(),
                ..RequestHeaders::default()
            },
            body,
        }
    }

    /// Method call on `api_name`.
    pub fn call(api_name: impl Into<String>, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self::new(
            api_name,
            RequestBody::Call {
                method: method.into(),
                method_args: args,
            },
        )
    }

    /// Empty poll.
    pub fn poll(api_name: impl Into<String>) -> Self {
        Self::new(api_name, RequestBody::Poll)
    }

    /// Subscribe to `event_name`.
    pub fn subscribe(api_name: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self::new(
            api_name,
            RequestBody::Subscribe {
                event_name: event_name.into(),
            },
        )
    }

    /// Unsubscribe from `event_name`.
    pub fn unsubscribe(api_name: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self::new(
            api_name,
            RequestBody::Unsubscribe {
                event_name: event_name.into(),
            },
        )
    }

    /// Set the `Call-Index` header.
    #[must_use]
    pub const fn with_call_index(mut self, call_index: u64) -> Self {
        self.headers.call_index = call_index;
        self
    }

    /// Set the `Session-Uuid` header.
    #[must_use]
    pub fn with_session(mut self, session_uuid: impl Into<String>) -> Self {
        self.headers.session_uuid = Some(session_uuid.into());
        self
    }
}

/// Headers of a `methodReturn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnHeaders {
    /// Index of the call being answered.
    #[serde(rename = "Call-Index")]
    pub call_index: u64,
}

/// Body of a `methodReturn`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodReturn {
    /// Return value; `null` on error.
    #[serde(default)]
    pub method_result: Value,
    /// Error text if the method failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of a `publish`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Published {
    /// Event name.
    pub event_name: String,
    /// Event payload.
    #[serde(default)]
    pub event_data: Value,
}

/// Body of `subscribed` / `unsubscribed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAck {
    /// Event name.
    pub event_name: String,
}

/// One item of a [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResponseData {
    /// Result of a call.
    MethodReturn {
        /// Correlation.
        headers: ReturnHeaders,
        /// Result or error.
        body: MethodReturn,
    },
    /// An event.
    Publish {
        /// Event name and payload.
        body: Published,
    },
    /// Subscription confirmed.
    Subscribed {
        /// Event name.
        body: EventAck,
    },
    /// Unsubscription confirmed.
    Unsubscribed {
        /// Event name.
        body: EventAck,
    },
}

impl ResponseData {
    /// `methodReturn` for `call_index`.
    pub fn method_return(call_index: u64, result: Result<Value, String>) -> Self {
        let body = match result {
            Ok(method_result) => MethodReturn {
                method_result,
                error: None,
            },
            Err(error) => MethodReturn {
                method_result: Value::Null,
                error: Some(error),
            },
        };
        Self::MethodReturn {
            headers: ReturnHeaders { call_index },
            body,
        }
    }

    /// `publish` of `event_name`.
    pub fn publish(event_name: impl Into<String>, event_data: Value) -> Self {
        Self::Publish {
            body: Published {
                event_name: event_name.into(),
                event_data,
            },
        }
    }
}

/// A server-to-client message: an ordered list of items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Returns and events, in delivery order.
    #[serde(default)]
    pub data: Vec<ResponseData>,
}
