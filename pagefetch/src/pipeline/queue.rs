//! Priority queue for fetch scheduling.
//!
//! Tasks are ordered by priority (higher values first), then by enqueue
//! order (FIFO within the same priority level). Ordering is evaluated only
//! at dispatch time; an in-flight task is never preempted by a newly queued
//! higher-priority one.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use super::{Priority, TaskId};

/// A fetch task waiting for a connection-pool slot.
#[derive(Debug)]
pub(super) struct QueuedFetch {
    pub task: TaskId,
    pub priority: Priority,
    /// FIFO tiebreaker within a priority level.
    sequence: u64,
    pub enqueued_at: Instant,
}

impl QueuedFetch {
    /// Time spent waiting for a slot so far.
    pub fn wait_time(&self) -> std::time::Duration {
        self.enqueued_at.elapsed()
    }
}

impl PartialEq for QueuedFetch {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedFetch {}

impl PartialOrd for QueuedFetch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedFetch {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority first, then the lower
        // (older) sequence first within a priority.
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ordering => ordering,
        }
    }
}

/// Queue of fetch tasks awaiting dispatch.
#[derive(Debug, Default)]
pub(super) struct FetchQueue {
    heap: BinaryHeap<QueuedFetch>,
    next_sequence: u64,
}

impl FetchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: TaskId, priority: Priority) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(QueuedFetch {
            task,
            priority,
            sequence,
            enqueued_at: Instant::now(),
        });
    }

    /// Removes and returns the highest-priority queued fetch.
    pub fn pop(&mut self) -> Option<QueuedFetch> {
        self.heap.pop()
    }

    /// Puts a popped fetch back without losing its place in FIFO order.
    pub fn requeue(&mut self, fetch: QueuedFetch) {
        self.heap.push(fetch);
    }

    /// Drops a specific task from the queue (cancellation while queued).
    pub fn remove(&mut self, task: TaskId) -> bool {
        let before = self.heap.len();
        let remaining: Vec<_> = self.heap.drain().filter(|q| q.task != task).collect();
        let removed = before != remaining.len();
        self.heap = BinaryHeap::from(remaining);
        removed
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
