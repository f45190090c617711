//! Bounded priority queue of ready tasks.
//!
//! A binary max-heap with an id -> position index so cancellation and
//! re-ranking touch a single entry in O(log n). Entries with equal effective
//! priority come out in enqueue order.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;

/// A ready task waiting for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub id: TaskId,
    /// Effective priority; higher runs first.
    pub priority: f64,
    /// Enqueue sequence number, assigned by the queue on push.
    pub seq: u64,
    pub deadline: Option<DateTime<Utc>>,
    pub capability: String,
}

impl QueueEntry {
    pub fn new(id: TaskId, priority: f64, capability: &str) -> Self {
        Self {
            id,
            priority,
            seq: 0,
            deadline: None,
            capability: capability.to_string(),
        }
    }

    pub fn with_deadline(mut self, deadline: Option<DateTime<Utc>>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Ordering used by the heap: `Greater` means `self` is dispatched first.
    fn rank(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| match (self.deadline, other.deadline) {
                (Some(a), Some(b)) => b.cmp(&a),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            })
    }
}

#[derive(Debug, Default)]
struct Heap {
    entries: Vec<QueueEntry>,
    positions: HashMap<TaskId, usize>,
    next_seq: u64,
}

impl Heap {
    fn insert(&mut self, entry: QueueEntry) {
        let index = self.entries.len();
        self.positions.insert(entry.id.clone(), index);
        self.entries.push(entry);
        self.sift_up(index);
    }

    fn remove_at(&mut self, index: usize) -> Option<QueueEntry> {
        if index >= self.entries.len() {
            return None;
        }
        let last = self.entries.len() - 1;
        self.swap(index, last);
        let entry = self.entries.pop()?;
        self.positions.remove(&entry.id);
        if index < self.entries.len() {
            self.sift_down(index);
            self.sift_up(index);
        }
        Some(entry)
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entries.swap(a, b);
        self.positions.insert(self.entries[a].id.clone(), a);
        self.positions.insert(self.entries[b].id.clone(), b);
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.entries[index].rank(&self.entries[parent]) != Ordering::Greater {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut best = index;
            if left < len && self.entries[left].rank(&self.entries[best]) == Ordering::Greater {
                best = left;
            }
            if right < len && self.entries[right].rank(&self.entries[best]) == Ordering::Greater {
                best = right;
            }
            if best == index {
                break;
            }
            self.swap(index, best);
            index = best;
        }
    }
}

/// Thread-safe bounded priority queue.
///
/// The lock is a `parking_lot::Mutex` and is never held across an `.await`.
#[derive(Debug)]
pub struct PriorityQueue {
    heap: Mutex<Heap>,
    capacity: usize,
}

impl PriorityQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(Heap::default()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admit a newly submitted task. Fails when the queue is at capacity.
    ///
    /// Returns the sequence number assigned to the entry.
    pub fn push(&self, entry: QueueEntry) -> Result<u64> {
        let mut heap = self.heap.lock();
        if heap.entries.len() >= self.capacity {
            return Err(Error::QueueFull {
                capacity: self.capacity,
            });
        }
        Self::insert_new(&mut heap, entry)
    }

    /// Re-feed work that was already accepted (dependents, retries,
    /// reassignments). Ignores capacity.
    pub fn force_push(&self, entry: QueueEntry) -> Result<u64> {
        let mut heap = self.heap.lock();
        Self::insert_new(&mut heap, entry)
    }

    fn insert_new(heap: &mut Heap, mut entry: QueueEntry) -> Result<u64> {
        if heap.positions.contains_key(&entry.id) {
            return Err(Error::DuplicateTaskId(entry.id));
        }
        let seq = heap.next_seq;
        heap.next_seq += 1;
        entry.seq = seq;
        heap.insert(entry);
        Ok(seq)
    }

    /// Put back an entry that was popped but could not be dispatched,
    /// keeping its original place in line.
    pub fn restore(&self, entry: QueueEntry) -> Result<()> {
        let mut heap = self.heap.lock();
        if heap.positions.contains_key(&entry.id) {
            return Err(Error::DuplicateTaskId(entry.id));
        }
        heap.insert(entry);
        Ok(())
    }

    pub fn pop(&self) -> Option<QueueEntry> {
        self.heap.lock().remove_at(0)
    }

    pub fn peek(&self) -> Option<QueueEntry> {
        self.heap.lock().entries.first().cloned()
    }

    pub fn remove(&self, id: &TaskId) -> Option<QueueEntry> {
        let mut heap = self.heap.lock();
        let index = *heap.positions.get(id)?;
        heap.remove_at(index)
    }

    /// Change an entry's effective priority. Returns false if the id is not
    /// queued.
    pub fn update_priority(&self, id: &TaskId, priority: f64) -> bool {
        let mut heap = self.heap.lock();
        let Some(&index) = heap.positions.get(id) else {
            return false;
        };
        let old = heap.entries[index].priority;
        heap.entries[index].priority = priority;
        match priority.total_cmp(&old) {
            Ordering::Greater => heap.sift_up(index),
            Ordering::Less => heap.sift_down(index),
            Ordering::Equal => {}
        }
        true
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.heap.lock().positions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().entries.is_empty()
    }

    /// Copy of every entry, in heap order (not dispatch order).
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.heap.lock().entries.clone()
    }

    /// Remove every entry, returned in dispatch order.
    pub fn drain(&self) -> Vec<QueueEntry> {
        let mut heap = self.heap.lock();
        let mut drained = Vec::with_capacity(heap.entries.len());
        while let Some(entry) = heap.remove_at(0) {
            drained.push(entry);
        }
        drained
    }
}
