//! Subscription bookkeeping per endpoint.
//!
//! A polling loop runs for an endpoint only while someone is subscribed to
//! it; the counter tells the client when the count crosses zero.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::rpc::transport::NO_ENDPOINT;

/// Counts live subscriptions per endpoint. Entries that reach zero are
/// removed.
#[derive(Debug, Default)]
pub struct SubscriptionCounter {
    counts: Mutex<HashMap<String, usize>>,
}

impl SubscriptionCounter {
    /// Empty counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoint key for an optional host name.
    pub fn endpoint_key(host: Option<&str>) -> &str {
        match host {
            Some(host) if !host.is_empty() => host,
            _ => NO_ENDPOINT,
        }
    }

    /// Add one subscription; returns the new count.
    pub fn increment(&self, endpoint: &str) -> usize {
        let mut counts = self.counts.lock();
        let count = counts.entry(endpoint.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Remove one subscription; returns the new count. Unknown endpoints
    /// stay at zero.
    pub fn decrement(&self, endpoint: &str) -> usize {
        let mut counts = self.counts.lock();
        let Some(count) = counts.get_mut(endpoint) else {
            return 0;
        };
        *count = count.saturating_sub(1);
        let remaining = *count;
        if remaining == 0 {
            counts.remove(endpoint);
        }
        remaining
    }

    /// Current count for `endpoint`.
    pub fn count(&self, endpoint: &str) -> usize {
        self.counts.lock().get(endpoint).copied().unwrap_or(0)
    }

    /// Endpoints with at least one subscription, sorted.
    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.counts.lock().keys().cloned().collect();
        endpoints.sort();
        endpoints
    }
}
