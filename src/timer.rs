//! The min-heap of scheduled timers plus the staging/immediate queues
//! described in §3/§4.2 of the design.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Weak;
use std::time::Duration;

use crate::task::TaskSlot;

/// Below this, a requested delay is treated as "immediate" rather than
/// being given a heap entry at all (§4.2: "one nanosecond, or zero meaning
/// immediate").
pub const MIN_TIMER: Duration = Duration::from_nanos(1);

/// The ceiling the hub clamps its kernel-wait bound to when no timer is
/// pending (§4.5 step 5).
pub const DEFAULT_SLEEP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Fire-and-forget callback invoked with no arguments; argument capture, if
/// any, lives in the closure itself (`schedule_call_global(seconds, cb,
/// *args)` in the source becomes a plain `FnOnce` capturing its args in
/// Rust).
pub type TimerCallback = Box<dyn FnOnce()>;

struct TimerEntry {
    id: TimerId,
    seq: u64,
    scheduled_at: Duration,
    callback: RefCellCallback,
    called: std::rc::Rc<std::cell::Cell<bool>>,
    owner: Option<Weak<TaskSlot>>,
}

type RefCellCallback = std::cell::RefCell<Option<TimerCallback>>;

impl TimerEntry {
    fn is_local_and_dead(&self) -> bool {
        match &self.owner {
            Some(owner) => owner.strong_count() == 0,
            None => false,
        }
    }
}

/// A handle to a scheduled timer. `cancel()` is idempotent and safe to call
/// more than once (§5: "Cancellation & timeouts").
#[derive(Clone)]
pub struct Timer {
    id: TimerId,
    called: std::rc::Rc<std::cell::Cell<bool>>,
}

impl Timer {
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Mark the timer as cancelled. Does not touch the heap (lazy
    /// deletion); a cancelled timer is simply skipped when it is popped.
    pub fn cancel(&self) {
        self.called.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.called.get()
    }
}

struct HeapKey {
    scheduled_at: Duration,
    seq: u64,
}

impl PartialEq for HeapKey {
    fn eq(&self, other: &Self) -> bool {
        self.scheduled_at == other.scheduled_at && self.seq == other.seq
    }
}
impl Eq for HeapKey {}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap; we want the earliest-due entry on top,
        // and same-`scheduled_at` timers must fire in insertion order (§5),
        // so reverse both comparisons.
        other
            .scheduled_at
            .cmp(&self.scheduled_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct HeapItem {
    key: HeapKey,
    entry: TimerEntry,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// The timer subsystem: a binary min-heap plus a staging list merged in at
/// the top of every tick, plus the immediate-timer fast path (§3, §4.2).
pub struct TimerWheel {
    heap: BinaryHeap<HeapItem>,
    next_timers: Vec<TimerEntry>,
    immediate_timers: Vec<TimerEntry>,
    next_id: u64,
    next_seq: u64,
    /// Exponential moving average of timer overdueness, pinned down per the
    /// Open Question resolution in SPEC_FULL.md §4.2: `delay = (due - now +
    /// delay) / 2`, always `<= 0`.
    delay: f64,
}

impl Default for TimerWheel {
    fn default() -> TimerWheel {
        TimerWheel::new()
    }
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel {
            heap: BinaryHeap::new(),
            next_timers: Vec::new(),
            immediate_timers: Vec::new(),
            next_id: 0,
            next_seq: 0,
            delay: 0.0,
        }
    }

    fn alloc_id(&mut self) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        TimerId(id)
    }

    fn alloc_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// `add_timer(seconds, cb, args, local)` from §4.2. `owner` is
    /// `Some(_)` for `schedule_call_local` (auto-cancel on owning-task
    /// death) and `None` for `schedule_call_global`.
    pub fn add_timer(
        &mut self,
        now: Duration,
        delay: Duration,
        callback: TimerCallback,
        owner: Option<Weak<TaskSlot>>,
    ) -> Timer {
        let id = self.alloc_id();
        let seq = self.alloc_seq();
        let called = std::rc::Rc::new(std::cell::Cell::new(false));
        let entry = TimerEntry {
            id,
            seq,
            scheduled_at: now + delay,
            callback: std::cell::RefCell::new(Some(callback)),
            called: std::rc::Rc::clone(&called),
            owner,
        };
        let handle = Timer { id, called };
        if delay < MIN_TIMER {
            self.immediate_timers.push(entry);
        } else {
            self.next_timers.push(entry);
        }
        handle
    }

    pub fn has_immediate(&self) -> bool {
        !self.immediate_timers.is_empty()
    }

    /// Drain `next_timers` into the heap, skipping entries already
    /// cancelled. Invoked at the top of every tick (§4.5 step 2).
    pub fn prepare_timers(&mut self) {
        for entry in self.next_timers.drain(..) {
            if entry.called.get() {
                continue;
            }
            let key = HeapKey {
                scheduled_at: entry.scheduled_at,
                seq: entry.seq,
            };
            self.heap.push(HeapItem { key, entry });
        }
    }

    /// Run every immediate timer unconditionally (mirroring "a tick
    /// containing immediate timers polls the backend with zero timeout").
    /// Exceptions are squelched (fire-and-forget, per §4.2).
    pub fn fire_immediate(&mut self) {
        for entry in self.immediate_timers.drain(..) {
            if entry.called.get() || entry.is_local_and_dead() {
                continue;
            }
            if let Some(cb) = entry.callback.borrow_mut().take() {
                cb();
            }
        }
    }

    /// Pop and fire every timer due at or before `now`, updating the
    /// overdueness average. Returns the next due instant, if any, plus
    /// whether at least one timer actually fired — a firing callback may
    /// have woken a task via its waker, and the caller must not then block
    /// on the backend before giving the executor a chance to run it.
    pub fn fire_due(&mut self, now: Duration) -> (Option<Duration>, bool) {
        let mut fired = false;
        while let Some(top) = self.heap.peek() {
            if top.entry.scheduled_at > now {
                break;
            }
            let HeapItem { entry, .. } = self.heap.pop().unwrap();
            if entry.called.get() || entry.is_local_and_dead() {
                continue;
            }
            let due = entry.scheduled_at;
            self.delay = (due.as_secs_f64() - now.as_secs_f64() + self.delay) / 2.0;
            if let Some(cb) = entry.callback.borrow_mut().take() {
                cb();
            }
            fired = true;
        }
        (self.heap.peek().map(|item| item.key.scheduled_at), fired)
    }

    /// The sleep bound derived from the next due timer and the current
    /// overdueness average, clamped to `[0, DEFAULT_SLEEP]` (§4.5 step 5).
    pub fn sleep_bound(&self, now: Duration, next_due: Option<Duration>) -> Duration {
        match next_due {
            Some(due) => {
                let raw = due.as_secs_f64() - now.as_secs_f64() + self.delay;
                let clamped = raw.clamp(0.0, DEFAULT_SLEEP.as_secs_f64());
                Duration::from_secs_f64(clamped)
            }
            None => DEFAULT_SLEEP,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty() && self.next_timers.is_empty() && self.immediate_timers.is_empty()
    }

    /// Cancel every outstanding timer (used by `abort`/teardown, §4.5).
    pub fn cancel_all(&mut self) {
        for item in self.heap.iter() {
            item.entry.called.set(true);
        }
        for entry in self.next_timers.iter().chain(self.immediate_timers.iter()) {
            entry.called.set(true);
        }
        self.next_timers.clear();
        self.immediate_timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn fires_in_scheduled_order() {
        let mut wheel = TimerWheel::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for id in [1, 2, 3] {
            let order = Rc::clone(&order);
            wheel.add_timer(
                Duration::ZERO,
                Duration::from_millis(10 * id),
                Box::new(move || order.borrow_mut().push(id)),
                None,
            );
        }
        wheel.prepare_timers();
        wheel.fire_due(Duration::from_millis(100));
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn cancel_is_idempotent_and_skips_firing() {
        let mut wheel = TimerWheel::new();
        let fired = Rc::new(std::cell::Cell::new(false));
        let fired2 = Rc::clone(&fired);
        let timer = wheel.add_timer(
            Duration::ZERO,
            Duration::from_millis(5),
            Box::new(move || fired2.set(true)),
            None,
        );
        timer.cancel();
        timer.cancel(); // idempotent
        wheel.prepare_timers();
        wheel.fire_due(Duration::from_millis(10));
        assert!(!fired.get());
    }

    #[test]
    fn sub_min_timer_goes_to_immediate_queue() {
        let mut wheel = TimerWheel::new();
        wheel.add_timer(Duration::ZERO, Duration::ZERO, Box::new(|| {}), None);
        assert!(wheel.has_immediate());
        wheel.prepare_timers();
        assert!(wheel.heap.is_empty());
    }
}
