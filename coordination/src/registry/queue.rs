//! Stable priority queue
//!
//! Highest priority first, FIFO within a priority band. Removal is lazy: the
//! `live` map says which heap entry is current for each task, stale entries
//! are skipped when they surface.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use super::types::TaskId;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: i32,
    seq: u64,
    task_id: TaskId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<QueueEntry>,
    live: HashMap<TaskId, u64>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push with a fresh sequence number, returning it
    pub fn push(&mut self, task_id: TaskId, priority: i32) -> u64 {
        let seq = self.next_seq;
        self.push_with_seq(task_id, priority, seq);
        seq
    }

    /// Push keeping an earlier sequence number, so a requeued task returns
    /// to its original place in its priority band
    pub fn push_with_seq(&mut self, task_id: TaskId, priority: i32, seq: u64) {
        self.next_seq = self.next_seq.max(seq + 1);
        self.live.insert(task_id.clone(), seq);
        self.heap.push(QueueEntry {
            priority,
            seq,
            task_id,
        });
    }

    pub fn pop(&mut self) -> Option<TaskId> {
        self.pop_matching(|_| true)
    }

    /// Pop the best entry satisfying `pred`, leaving the rest in order
    pub fn pop_matching(&mut self, mut pred: impl FnMut(&str) -> bool) -> Option<TaskId> {
        let mut skipped = Vec::new();
        let mut found = None;

        while let Some(entry) = self.heap.pop() {
            if self.live.get(&entry.task_id) != Some(&entry.seq) {
                continue;
            }
            if pred(&entry.task_id) {
                self.live.remove(&entry.task_id);
                found = Some(entry.task_id);
                break;
            }
            skipped.push(entry);
        }

        self.heap.extend(skipped);
        found
    }

    /// Drop a task from the queue. Returns false if it was not queued.
    pub fn remove(&mut self, task_id: &str) -> bool {
        let removed = self.live.remove(task_id).is_some();
        if self.heap.len() > 2 * self.live.len() + 32 {
            self.compact();
        }
        removed
    }

    fn compact(&mut self) {
        let live = &self.live;
        self.heap
            .retain(|e| live.get(&e.task_id) == Some(&e.seq));
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.live.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Queued task ids in dequeue order
    pub fn ordered(&self) -> Vec<TaskId> {
        let mut entries: Vec<&QueueEntry> = self
            .heap
            .iter()
            .filter(|e| self.live.get(&e.task_id) == Some(&e.seq))
            .collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.dedup_by(|a, b| a.task_id == b.task_id);
        entries.into_iter().map(|e| e.task_id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = PriorityQueue::new();
        queue.push("low".to_string(), 1);
        queue.push("high-a".to_string(), 5);
        queue.push("high-b".to_string(), 5);
        queue.push("mid".to_string(), 3);

        assert_eq!(queue.ordered(), vec!["high-a", "high-b", "mid", "low"]);
        assert_eq!(queue.pop().as_deref(), Some("high-a"));
        assert_eq!(queue.pop().as_deref(), Some("high-b"));
        assert_eq!(queue.pop().as_deref(), Some("mid"));
        assert_eq!(queue.pop().as_deref(), Some("low"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_remove_is_lazy_but_exact() {
        let mut queue = PriorityQueue::new();
        queue.push("a".to_string(), 1);
        queue.push("b".to_string(), 1);
        assert!(queue.remove("a"));
        assert!(!queue.remove("a"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().as_deref(), Some("b"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_keeps_original_position() {
        let mut queue = PriorityQueue::new();
        let seq_a = queue.push("a".to_string(), 2);
        queue.push("b".to_string(), 2);

        assert_eq!(queue.pop().as_deref(), Some("a"));
        queue.push_with_seq("a".to_string(), 2, seq_a);
        assert_eq!(queue.pop().as_deref(), Some("a"));
    }

    #[test]
    fn test_pop_matching_skips_without_losing() {
        let mut queue = PriorityQueue::new();
        queue.push("review".to_string(), 9);
        queue.push("code".to_string(), 1);

        assert_eq!(queue.pop_matching(|id| id == "code").as_deref(), Some("code"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().as_deref(), Some("review"));
    }

    #[test]
    fn test_remove_then_repush_ignores_stale_entry() {
        let mut queue = PriorityQueue::new();
        queue.push("a".to_string(), 1);
        queue.remove("a");
        queue.push("a".to_string(), 7);
        queue.push("b".to_string(), 5);
        assert_eq!(queue.ordered(), vec!["a", "b"]);
        assert_eq!(queue.pop().as_deref(), Some("a"));
        assert_eq!(queue.pop().as_deref(), Some("b"));
        assert_eq!(queue.pop(), None);
    }
}
