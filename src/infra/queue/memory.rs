//! In-memory FIFO queue with compatibility-aware claiming.

use std::collections::{HashSet, VecDeque};

use crate::core::SchedulerError;
use crate::core::{WorkQueue, WorkSpec};
use crate::util::WorkId;

/// In-memory FIFO queue of work specs.
///
/// Claiming scans from the head, so an earlier compatible item is always
/// returned before a later one. A side index keeps `contains` O(1) for
/// duplicate detection.
pub struct InMemoryQueue {
    max_depth: usize,
    specs: VecDeque<WorkSpec>,
    ids: HashSet<WorkId>,
}

impl InMemoryQueue {
    /// Create a new in-memory queue with a maximum depth.
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            specs: VecDeque::with_capacity(max_depth.min(1024)),
            ids: HashSet::new(),
        }
    }
}

impl WorkQueue for InMemoryQueue {
    fn enqueue(&mut self, spec: WorkSpec) -> Result<(), SchedulerError> {
        if self.len() >= self.max_depth() {
            return Err(SchedulerError::QueueFull("max queue depth reached".into()));
        }
        self.ids.insert(spec.uuid.clone());
        self.specs.push_back(spec);
        Ok(())
    }

    fn take_first(&mut self, matches: &dyn Fn(&WorkSpec) -> bool) -> Option<WorkSpec> {
        let idx = self.specs.iter().position(matches)?;
        let spec = self.specs.remove(idx)?;
        self.ids.remove(&spec.uuid);
        Some(spec)
    }

    fn count_matching(&self, matches: &dyn Fn(&WorkSpec) -> bool) -> usize {
        self.specs.iter().filter(|s| matches(s)).count()
    }

    fn contains(&self, uuid: &WorkId) -> bool {
        self.ids.contains(uuid)
    }

    fn remove(&mut self, uuid: &WorkId) -> Option<WorkSpec> {
        if !self.ids.remove(uuid) {
            return None;
        }
        let idx = self.specs.iter().position(|s| &s.uuid == uuid)?;
        self.specs.remove(idx)
    }

    fn max_depth(&self) -> usize {
        self.max_depth
    }

    fn len(&self) -> usize {
        self.specs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, pools: &[&str]) -> WorkSpec {
        WorkSpec::new(id, "Echo").with_compatibility(pools.iter().copied())
    }

    #[test]
    fn test_fifo_order() {
        let mut q = InMemoryQueue::new(100);
        q.enqueue(spec("1", &[])).unwrap();
        q.enqueue(spec("2", &[])).unwrap();
        q.enqueue(spec("3", &[])).unwrap();

        let any = |_: &WorkSpec| true;
        assert_eq!(q.take_first(&any).unwrap().uuid.as_str(), "1");
        assert_eq!(q.take_first(&any).unwrap().uuid.as_str(), "2");
        assert_eq!(q.take_first(&any).unwrap().uuid.as_str(), "3");
        assert!(q.take_first(&any).is_none());
    }

    #[test]
    fn test_take_first_skips_non_matching() {
        let mut q = InMemoryQueue::new(100);
        q.enqueue(spec("gpu-job", &["gpu"])).unwrap();
        q.enqueue(spec("cpu-job", &["cpu"])).unwrap();

        let cpu_only = |s: &WorkSpec| s.compatibility.contains("cpu");
        assert_eq!(q.take_first(&cpu_only).unwrap().uuid.as_str(), "cpu-job");
        assert_eq!(q.len(), 1);
        assert!(q.contains(&"gpu-job".into()));
        assert!(!q.contains(&"cpu-job".into()));
    }

    #[test]
    fn test_queue_full() {
        let mut q = InMemoryQueue::new(2);
        q.enqueue(spec("1", &[])).unwrap();
        q.enqueue(spec("2", &[])).unwrap();

        let result = q.enqueue(spec("3", &[]));
        assert!(matches!(result, Err(SchedulerError::QueueFull(_))));
    }

    #[test]
    fn test_remove_and_count() {
        let mut q = InMemoryQueue::new(10);
        q.enqueue(spec("1", &["a"])).unwrap();
        q.enqueue(spec("2", &["b"])).unwrap();
        q.enqueue(spec("3", &["a"])).unwrap();

        assert_eq!(q.count_matching(&|s| s.compatibility.contains("a")), 2);
        assert_eq!(q.remove(&"1".into()).unwrap().uuid.as_str(), "1");
        assert!(q.remove(&"1".into()).is_none());
        assert_eq!(q.count_matching(&|s| s.compatibility.contains("a")), 1);
    }

    #[test]
    fn test_empty_queue() {
        let mut q = InMemoryQueue::new(100);
        assert!(q.take_first(&|_| true).is_none());
        assert!(q.is_empty());
    }
}
