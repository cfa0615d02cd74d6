//! Per-item log stream and its batching buffer.

use serde::{Deserialize, Serialize};

use crate::util::{now_ms, WorkId};

/// Kind of a log/telemetry message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    /// Free-form progress line emitted by the work.
    Log,
    /// Terminal success marker.
    Success,
    /// Terminal failure marker.
    Failure,
}

/// One log line attributed to a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSpec {
    /// Work item that produced the message.
    pub caller: WorkId,
    /// Message text.
    pub message: String,
    /// Message kind.
    pub kind: MessageKind,
    /// Milliseconds since the Unix epoch.
    pub time: u64,
}

impl MessageSpec {
    /// Build a message stamped with the current time.
    pub fn now(caller: WorkId, kind: MessageKind, message: impl Into<String>) -> Self {
        Self {
            caller,
            message: message.into(),
            kind,
            time: now_ms(),
        }
    }

    /// Shorthand for a [`MessageKind::Log`] line.
    pub fn log(caller: WorkId, message: impl Into<String>) -> Self {
        Self::now(caller, MessageKind::Log, message)
    }
}

/// Append-only message buffer owned by a worker tracker.
///
/// `pending` holds lines not yet flushed to the scheduler; flushing hands out a
/// copy and forgets it, so the buffer never shares storage with the scheduler.
#[derive(Debug, Default)]
pub struct LogBuffer {
    pending: Vec<MessageSpec>,
    total: usize,
}

impl LogBuffer {
    /// Empty buffer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
            total: 0,
        }
    }

    /// Append a message.
    pub fn push(&mut self, message: MessageSpec) {
        self.pending.push(message);
        self.total += 1;
    }

    /// Take every unflushed message.
    pub fn drain(&mut self) -> Vec<MessageSpec> {
        std::mem::take(&mut self.pending)
    }

    /// Number of unflushed messages.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Messages appended over the buffer's lifetime.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_hands_out_pending_once() {
        let mut buf = LogBuffer::new();
        buf.push(MessageSpec::log("a".into(), "one"));
        buf.push(MessageSpec::log("a".into(), "two"));

        let batch = buf.drain();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].message, "two");
        assert_eq!(buf.pending_len(), 0);
        assert_eq!(buf.total(), 2);
        assert!(buf.drain().is_empty());
    }

    #[test]
    fn kind_serializes_lowercase() {
        let msg = MessageSpec::now("w".into(), MessageKind::Failure, "boom");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "failure");
        assert_eq!(json["caller"], "w");
    }
}
