//! Virtual clock and cancellable event queue
//!
//! The queue is generic over the event payload. Pending events are kept in a
//! binary heap ordered by `(timestamp, sequence)`; cancellation is lazy, the
//! entry stays in the heap and is dropped when it surfaces.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use crate::error::InvalidScheduling;

/// Virtual-time value, in simulation ticks
pub type Instant = u64;

/// Token identifying a scheduled event, accepted by [`EventQueue::cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

/// Pending event wrapper for priority queue ordering
#[derive(Debug)]
struct QueuedEvent<E> {
    time: Instant,
    sequence: u64,
    payload: E,
}

// Priority queue orders by (time, sequence), earliest first
impl<E> Ord for QueuedEvent<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse comparison for min-heap (BinaryHeap is max-heap by default)
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl<E> PartialOrd for QueuedEvent<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Eq for QueuedEvent<E> {}

impl<E> PartialEq for QueuedEvent<E> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.sequence == other.sequence
    }
}

/// Virtual clock plus the totally ordered set of pending events.
///
/// The clock never decreases: it only advances when [`pop`](Self::pop)
/// surfaces the next live event. Events scheduled for the same tick are
/// popped in submission order, never reordered for any other reason.
#[derive(Debug)]
pub struct EventQueue<E> {
    now: Instant,
    heap: BinaryHeap<QueuedEvent<E>>,
    /// Sequence numbers of scheduled-but-not-fired events
    live: HashSet<u64>,
    next_sequence: u64,
}

impl<E> EventQueue<E> {
    /// Create an empty queue with the clock at zero
    pub fn new() -> Self {
        EventQueue {
            now: 0,
            heap: BinaryHeap::new(),
            live: HashSet::new(),
            next_sequence: 0,
        }
    }

    /// Current virtual time
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Number of pending (not fired, not cancelled) events
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// True when no live event is pending
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Schedule a payload at an absolute timestamp.
    ///
    /// Scheduling at the current instant is allowed; the event fires after
    /// the one currently being processed. Scheduling in the past fails with
    /// [`InvalidScheduling`].
    pub fn schedule_at(&mut self, at: Instant, payload: E) -> Result<EventHandle, InvalidScheduling> {
        if at < self.now {
            return Err(InvalidScheduling { at, now: self.now });
        }
        Ok(self.push(at, payload))
    }

    /// Schedule a payload `delta` ticks from now
    pub fn schedule_after(&mut self, delta: u64, payload: E) -> EventHandle {
        self.push(self.now.saturating_add(delta), payload)
    }

    fn push(&mut self, at: Instant, payload: E) -> EventHandle {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.live.insert(sequence);
        self.heap.push(QueuedEvent {
            time: at,
            sequence,
            payload,
        });
        EventHandle(sequence)
    }

    /// Cancel a pending event.
    ///
    /// Returns `true` if the event was still pending. Cancelling an event
    /// that already fired, or cancelling twice, is a no-op returning `false`.
    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        self.live.remove(&handle.0)
    }

    /// Pop the earliest live event, advancing the clock to its timestamp.
    ///
    /// Cancelled entries surfacing before it are dropped silently.
    pub fn pop(&mut self) -> Option<(Instant, E)> {
        while let Some(entry) = self.heap.pop() {
            if self.live.remove(&entry.sequence) {
                self.now = entry.time;
                return Some((entry.time, entry.payload));
            }
        }
        None
    }

    /// Timestamp of the next live event, without firing it.
    ///
    /// Takes `&mut self` to purge cancelled entries from the top of the heap.
    pub fn peek_time(&mut self) -> Option<Instant> {
        while let Some(entry) = self.heap.peek() {
            if self.live.contains(&entry.sequence) {
                return Some(entry.time);
            }
            self.heap.pop();
        }
        None
    }
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}
