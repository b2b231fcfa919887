//! Cooperative callout queue.
//!
//! The queue keeps a millisecond clock that only moves when the host
//! advances it, and a set of scheduled events ordered by deadline. Event
//! payloads are opaque to the queue; the host pops due events from
//! [`CalloutQueue::advance`] and dispatches them itself. There is no
//! thread in here: in production the host calls `advance` from its timer
//! source, in tests the queue doubles as a virtual clock.
//!
//! Handles are monotonically increasing and never reused, so a stale
//! cancel or reschedule (after the event already fired) is a harmless
//! no-op.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

/// Handle of a scheduled event, unique for the queue's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventHandle(u64);

/// Scheduling capability handed to components that arm timers but do not
/// drive the clock.
pub trait Callout<E> {
    /// Schedule `event` to fire `delay` from now.
    fn schedule(&self, delay: Duration, event: E) -> EventHandle;
    /// Cancel a scheduled event. No-op if it already fired.
    fn cancel(&self, handle: EventHandle);
    /// Move a scheduled event to `delay` from now. No-op if it already
    /// fired.
    fn reschedule(&self, handle: EventHandle, delay: Duration);
    /// Current queue time in milliseconds.
    fn now_ms(&self) -> u64;
}

struct Entry<E> {
    fire_at: u64,
    event: E,
}

/// The callout queue proper.
pub struct CalloutQueue<E> {
    now: u64,
    next_handle: u64,
    entries: HashMap<u64, Entry<E>>,
    // Lazily pruned: rescheduling pushes a second heap slot, the stale one
    // is skipped when popped because its fire_at no longer matches.
    order: BinaryHeap<Reverse<(u64, u64)>>,
}

impl<E> CalloutQueue<E> {
    pub fn new() -> Self {
        Self {
            now: 0,
            next_handle: 1,
            entries: HashMap::new(),
            order: BinaryHeap::new(),
        }
    }

    /// Current queue time in milliseconds since creation.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Number of events still scheduled.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn schedule(&mut self, delay: Duration, event: E) -> EventHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        let fire_at = self.now.saturating_add(delay.as_millis() as u64);
        self.entries.insert(handle, Entry { fire_at, event });
        self.order.push(Reverse((fire_at, handle)));
        trace!(handle, fire_at, "scheduled callout event");
        EventHandle(handle)
    }

    pub fn cancel(&mut self, handle: EventHandle) {
        if self.entries.remove(&handle.0).is_some() {
            trace!(handle = handle.0, "cancelled callout event");
        }
    }

    pub fn reschedule(&mut self, handle: EventHandle, delay: Duration) {
        let fire_at = self.now.saturating_add(delay.as_millis() as u64);
        if let Some(entry) = self.entries.get_mut(&handle.0) {
            entry.fire_at = fire_at;
            self.order.push(Reverse((fire_at, handle.0)));
            trace!(handle = handle.0, fire_at, "rescheduled callout event");
        }
    }

    /// Advance the clock by `delta` milliseconds and collect every event
    /// that becomes due, in (deadline, handle) order.
    pub fn advance(&mut self, delta: u64) -> Vec<E> {
        self.advance_to(self.now.saturating_add(delta))
    }

    /// Advance the clock to an absolute time and collect due events.
    pub fn advance_to(&mut self, now: u64) -> Vec<E> {
        debug_assert!(now >= self.now);
        self.now = now.max(self.now);

        let mut due = Vec::new();
        while let Some(&Reverse((fire_at, handle))) = self.order.peek() {
            if fire_at > self.now {
                break;
            }
            self.order.pop();
            // Stale heap slots (cancelled, or left behind by a
            // reschedule) are skipped.
            let current = match self.entries.get(&handle) {
                Some(entry) => entry.fire_at == fire_at,
                None => false,
            };
            if !current {
                continue;
            }
            if let Some(entry) = self.entries.remove(&handle) {
                due.push(entry.event);
            }
        }
        due
    }

    /// Deadline of the next scheduled event, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.values().map(|e| e.fire_at).min()
    }
}

impl<E> Default for CalloutQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Callout<E> for Arc<Mutex<CalloutQueue<E>>> {
    fn schedule(&self, delay: Duration, event: E) -> EventHandle {
        self.lock().schedule(delay, event)
    }

    fn cancel(&self, handle: EventHandle) {
        self.lock().cancel(handle)
    }

    fn reschedule(&self, handle: EventHandle, delay: Duration) {
        self.lock().reschedule(handle, delay)
    }

    fn now_ms(&self) -> u64 {
        self.lock().now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut cq = CalloutQueue::new();
        cq.schedule(ms(30), "c");
        cq.schedule(ms(10), "a");
        cq.schedule(ms(20), "b");

        assert_eq!(cq.advance(5), Vec::<&str>::new());
        assert_eq!(cq.advance(25), vec!["a", "b", "c"]);
        assert!(cq.is_empty());
    }

    #[test]
    fn same_deadline_fires_in_schedule_order() {
        let mut cq = CalloutQueue::new();
        cq.schedule(ms(10), 1);
        cq.schedule(ms(10), 2);
        assert_eq!(cq.advance(10), vec![1, 2]);
    }

    #[test]
    fn cancel_prevents_delivery() {
        let mut cq = CalloutQueue::new();
        let h = cq.schedule(ms(10), "x");
        cq.cancel(h);
        assert_eq!(cq.advance(100), Vec::<&str>::new());
        // Cancelling again is harmless.
        cq.cancel(h);
    }

    #[test]
    fn reschedule_moves_deadline_both_ways() {
        let mut cq = CalloutQueue::new();
        let h = cq.schedule(ms(100), "later");
        cq.reschedule(h, ms(10));
        assert_eq!(cq.advance(10), vec!["later"]);

        let h = cq.schedule(ms(10), "sooner");
        cq.reschedule(h, ms(100));
        assert_eq!(cq.advance(50), Vec::<&str>::new());
        assert_eq!(cq.advance(60), vec!["sooner"]);
    }

    #[test]
    fn reschedule_after_fire_is_noop() {
        let mut cq = CalloutQueue::new();
        let h = cq.schedule(ms(10), "x");
        assert_eq!(cq.advance(10), vec!["x"]);
        cq.reschedule(h, ms(10));
        assert_eq!(cq.advance(100), Vec::<&str>::new());
    }

    #[test]
    fn next_deadline_tracks_minimum() {
        let mut cq = CalloutQueue::new();
        assert_eq!(cq.next_deadline(), None);
        cq.schedule(ms(50), ());
        let h = cq.schedule(ms(20), ());
        assert_eq!(cq.next_deadline(), Some(20));
        cq.cancel(h);
        assert_eq!(cq.next_deadline(), Some(50));
    }

    #[test]
    fn shared_handle_schedules_through_trait() {
        let cq = Arc::new(Mutex::new(CalloutQueue::new()));
        let handle = Callout::schedule(&cq, ms(5), 42u32);
        assert_eq!(cq.now_ms(), 0);
        Callout::cancel(&cq, handle);
        assert_eq!(cq.lock().advance(10), Vec::<u32>::new());
    }
}
