//! In-memory completion mailbox.

use std::collections::{HashMap, VecDeque};

use crate::core::{Mailbox, WorkResult};
use crate::util::WorkId;

/// Bounded store of recent completions, evicting the oldest first.
///
/// Lets a producer that starts waiting after an item finished still observe
/// its terminal event.
pub struct InMemoryMailbox {
    capacity: usize,
    results: HashMap<WorkId, WorkResult>,
    order: VecDeque<WorkId>,
}

impl InMemoryMailbox {
    /// Create a new mailbox holding at most `capacity` results.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            results: HashMap::new(),
            order: VecDeque::new(),
        }
    }
}

impl Mailbox for InMemoryMailbox {
    fn deliver(&mut self, result: WorkResult) {
        if self.capacity == 0 {
            return;
        }
        if self.results.contains_key(&result.uuid) {
            self.order.retain(|id| id != &result.uuid);
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.results.remove(&oldest);
            }
        }
        self.order.push_back(result.uuid.clone());
        self.results.insert(result.uuid.clone(), result);
    }

    fn fetch(&self, uuid: &WorkId) -> Option<WorkResult> {
        self.results.get(uuid).cloned()
    }

    fn len(&self) -> usize {
        self.results.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::WorkOutcome;
    use serde_json::json;

    fn result(id: &str) -> WorkResult {
        WorkResult::new(id.into(), WorkOutcome::Success { result: json!(id) })
    }

    #[test]
    fn test_deliver_and_fetch() {
        let mut mailbox = InMemoryMailbox::new(4);
        mailbox.deliver(result("a"));
        assert_eq!(mailbox.fetch(&"a".into()).unwrap().uuid.as_str(), "a");
        assert!(mailbox.fetch(&"b".into()).is_none());
    }

    #[test]
    fn test_evicts_oldest() {
        let mut mailbox = InMemoryMailbox::new(2);
        mailbox.deliver(result("a"));
        mailbox.deliver(result("b"));
        mailbox.deliver(result("c"));
        assert_eq!(mailbox.len(), 2);
        assert!(mailbox.fetch(&"a".into()).is_none());
        assert!(mailbox.fetch(&"c".into()).is_some());
    }
}
