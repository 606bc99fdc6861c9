//! The listener registry (§4.1): for each fd, who is waiting for read and
//! who for write, with primary/secondary ordering and the fd-recycling
//! defang protocol.

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::Weak;

use crate::error::MultipleWaitersError;
use crate::event::{Event, Interest};
use crate::listener::{Listener, Resume, Throw};
use crate::slab::{Slab, SlabKey};
use crate::task::TaskSlot;

/// Whether a registry mutation requires the backend to (re)subscribe,
/// drop, or leave alone its kernel registration for the affected fd. The
/// hub consults this after every [`Registry`] call to keep the backend
/// mirror in sync (invariant 2 in §8: "every fd appearing as a key in the
/// registry has a backend subscription whose mask equals...").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskChange {
    /// Nothing changed; no backend call needed.
    Unchanged,
    /// The fd has listeners and the backend should `register` (first time)
    /// or `modify` (already known) to `mask`.
    Subscribe(Interest),
    /// No listeners remain for this fd; the backend should `unregister` it.
    Unsubscribe,
}

/// Per-fd bookkeeping: the primary (front of queue) plus FIFO secondaries
/// for each direction.
#[derive(Default)]
struct FileDetails {
    readers: VecDeque<SlabKey>,
    writers: VecDeque<SlabKey>,
}

impl FileDetails {
    fn queue(&self, evtype: Event) -> &VecDeque<SlabKey> {
        match evtype {
            Event::Read => &self.readers,
            Event::Write => &self.writers,
        }
    }

    fn queue_mut(&mut self, evtype: Event) -> &mut VecDeque<SlabKey> {
        match evtype {
            Event::Read => &mut self.readers,
            Event::Write => &mut self.writers,
        }
    }

    fn is_empty(&self) -> bool {
        self.readers.is_empty() && self.writers.is_empty()
    }

    fn mask(&self) -> Interest {
        let mut mask = Interest::NONE;
        if !self.readers.is_empty() {
            mask |= Interest::READABLE;
        }
        if !self.writers.is_empty() {
            mask |= Interest::WRITABLE;
        }
        mask
    }
}

/// Owns every [`Listener`] and the per-fd primary/secondary queues. The
/// hub is the exclusive owner of a `Registry`; nothing else holds a
/// reference across a suspension point (§3: "Ownership").
pub struct Registry {
    listeners: Slab<Listener>,
    files: HashMap<RawFd, FileDetails>,
    /// FIFO of defanged listeners awaiting a throw of "fd recycled" into
    /// their task (§3: "Closed-listener queue").
    closed: VecDeque<SlabKey>,
    /// The "prevent multiple readers/writers" policy (§4.1), on by default.
    allow_secondary: bool,
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            listeners: Slab::new(),
            files: HashMap::new(),
            closed: VecDeque::new(),
            allow_secondary: false,
        }
    }

    /// Toggle the multiple-waiters policy. Off means a second waiter for
    /// the same `(fd, evtype)` queues as secondary instead of failing.
    pub fn set_allow_secondary(&mut self, allow: bool) {
        self.allow_secondary = allow;
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        evtype: Event,
        fileno: RawFd,
        cb: Resume,
        tb: Throw,
        mark_as_closed: Option<Box<dyn FnMut()>>,
        owning_task: Weak<TaskSlot>,
    ) -> Result<(SlabKey, MaskChange), MultipleWaitersError> {
        let details = self.files.entry(fileno).or_default();
        let is_primary_slot_free = details.queue(evtype).is_empty();
        if !is_primary_slot_free && !self.allow_secondary {
            return Err(MultipleWaitersError { fd: fileno, evtype });
        }

        let before_mask = details.mask();
        let listener = Listener::new(evtype, fileno, cb, tb, mark_as_closed, owning_task);
        let key = self.listeners.insert(listener);
        let details = self.files.get_mut(&fileno).unwrap();
        details.queue_mut(evtype).push_back(key);
        let after_mask = details.mask();

        let change = if before_mask.is_none() {
            MaskChange::Subscribe(after_mask)
        } else if before_mask != after_mask {
            MaskChange::Subscribe(after_mask)
        } else {
            MaskChange::Unchanged
        };
        Ok((key, change))
    }

    /// `remove(listener)` from §4.1. Defanged listeners are removed
    /// silently (trampoline's unwind path may double-remove); otherwise the
    /// next secondary is promoted to primary.
    pub fn remove(&mut self, key: SlabKey) -> MaskChange {
        let Some(listener) = self.listeners.get(key) else {
            return MaskChange::Unchanged;
        };
        if listener.spent {
            // Structurally still present (defang leaves it in place until
            // the closed-queue throw completes); a second remove from the
            // trampoline unwind path is a silent no-op. The stale key must
            // still come out of its queue, and once every defanged listener
            // for this fd has been removed this way the `files` entry has
            // to go too and the backend subscription dropped — otherwise a
            // later `add` for a *new* file the OS hands back this same fd
            // number sees `registered_fds` already containing it and calls
            // `modify` instead of `register` against a kernel subscription
            // that no longer exists.
            let fileno = listener.fileno;
            let evtype = listener.evtype;
            self.listeners.remove(key);
            let Some(details) = self.files.get_mut(&fileno) else {
                return MaskChange::Unchanged;
            };
            let queue = details.queue_mut(evtype);
            if let Some(pos) = queue.iter().position(|k| *k == key) {
                queue.remove(pos);
            }
            if details.is_empty() {
                self.files.remove(&fileno);
                return MaskChange::Unsubscribe;
            }
            return MaskChange::Unchanged;
        }

        let fileno = listener.fileno;
        let evtype = listener.evtype;
        self.listeners.remove(key);

        let Some(details) = self.files.get_mut(&fileno) else {
            return MaskChange::Unchanged;
        };
        let before_mask = details.mask();
        let queue = details.queue_mut(evtype);
        if let Some(pos) = queue.iter().position(|k| *k == key) {
            queue.remove(pos);
        }
        let after_mask = details.mask();
        let empty = details.is_empty();
        if empty {
            self.files.remove(&fileno);
            return MaskChange::Unsubscribe;
        }
        if before_mask != after_mask {
            MaskChange::Subscribe(after_mask)
        } else {
            MaskChange::Unchanged
        }
    }

    fn primary(&self, fileno: RawFd, evtype: Event) -> Option<SlabKey> {
        self.files.get(&fileno)?.queue(evtype).front().copied()
    }

    pub fn read_primary(&self, fileno: RawFd) -> Option<SlabKey> {
        self.primary(fileno, Event::Read)
    }

    pub fn write_primary(&self, fileno: RawFd) -> Option<SlabKey> {
        self.primary(fileno, Event::Write)
    }

    pub fn listener_mut(&mut self, key: SlabKey) -> Option<&mut Listener> {
        self.listeners.get_mut(key)
    }

    pub fn current_mask(&self, fileno: RawFd) -> Interest {
        self.files.get(&fileno).map_or(Interest::NONE, FileDetails::mask)
    }

    pub fn contains_fd(&self, fileno: RawFd) -> bool {
        self.files.contains_key(&fileno)
    }

    /// `remove_descriptor(fileno)` (§4.1): nudge every listener for this fd
    /// out of its wait (both primary and secondary, both directions) by
    /// invoking `cb`, then drop every entry. Used when the backend reports
    /// `POLLNVAL`.
    pub fn remove_descriptor(&mut self, fileno: RawFd) {
        let Some(details) = self.files.remove(&fileno) else {
            return;
        };
        for key in details.readers.into_iter().chain(details.writers) {
            if let Some(listener) = self.listeners.get_mut(key) {
                if !listener.spent {
                    (listener.cb)(fileno);
                }
            }
            self.listeners.remove(key);
        }
    }

    /// `mark_as_reopened(fileno)` (§4.1): defang every listener for this fd
    /// (both directions, primary and secondary) and enqueue each onto the
    /// closed FIFO for a subsequent `IOClosed` throw. The registry entry
    /// itself is left in place structurally until `remove` runs during the
    /// task's unwind (mirrors the source precisely: defanging does not
    /// immediately drop registry state).
    pub fn mark_as_reopened(&mut self, fileno: RawFd) {
        let Some(details) = self.files.get(&fileno) else {
            return;
        };
        let keys: Vec<SlabKey> = details
            .readers
            .iter()
            .chain(details.writers.iter())
            .copied()
            .collect();
        for key in keys {
            if let Some(listener) = self.listeners.get_mut(key) {
                if !listener.spent {
                    listener.defang();
                    self.closed.push_back(key);
                }
            }
        }
    }

    /// `notify_close(fileno)`: informational only, per the design rule
    /// resolving the Open Question in §9 ("recycling is the sole trigger
    /// for listener retirement"). Always a no-op.
    pub fn notify_close(&mut self, _fileno: RawFd) {}

    /// Drain the closed queue, delivering `tb(IOClosed)` to every listener
    /// whose owning task is still alive (§4.5 step 1).
    pub fn drain_closed(&mut self) {
        while let Some(key) = self.closed.pop_front() {
            if let Some(listener) = self.listeners.get_mut(key) {
                if listener.owner_alive() {
                    (listener.tb)(crate::error::HubError::io_closed());
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_listener() -> (Resume, Throw) {
        (Box::new(|_| {}), Box::new(|_| {}))
    }

    #[test]
    fn add_remove_restores_empty_state() {
        let mut reg = Registry::new();
        let (cb, tb) = noop_listener();
        let (key, change) = reg.add(Event::Read, 5, cb, tb, None, Weak::new()).unwrap();
        assert!(matches!(change, MaskChange::Subscribe(_)));
        assert!(reg.contains_fd(5));
        let change = reg.remove(key);
        assert_eq!(change, MaskChange::Unsubscribe);
        assert!(!reg.contains_fd(5));
        assert!(reg.is_empty());
    }

    #[test]
    fn second_waiter_rejected_by_default() {
        let mut reg = Registry::new();
        let (cb1, tb1) = noop_listener();
        let (_key, _) = reg.add(Event::Read, 5, cb1, tb1, None, Weak::new()).unwrap();
        let (cb2, tb2) = noop_listener();
        let err = reg.add(Event::Read, 5, cb2, tb2, None, Weak::new());
        assert!(err.is_err());
    }

    #[test]
    fn secondary_promotion_is_fifo() {
        let mut reg = Registry::new();
        reg.set_allow_secondary(true);
        let (cb1, tb1) = noop_listener();
        let (key1, _) = reg.add(Event::Read, 5, cb1, tb1, None, Weak::new()).unwrap();
        let (cb2, tb2) = noop_listener();
        let (key2, _) = reg.add(Event::Read, 5, cb2, tb2, None, Weak::new()).unwrap();
        let (cb3, tb3) = noop_listener();
        let (key3, _) = reg.add(Event::Read, 5, cb3, tb3, None, Weak::new()).unwrap();

        assert_eq!(reg.read_primary(5), Some(key1));
        reg.remove(key1);
        assert_eq!(reg.read_primary(5), Some(key2));
        reg.remove(key2);
        assert_eq!(reg.read_primary(5), Some(key3));
    }

    #[test]
    fn removing_a_defanged_listener_clears_its_file_entry() {
        let mut reg = Registry::new();
        let (cb, tb) = noop_listener();
        let (key, _) = reg.add(Event::Read, 5, cb, tb, None, Weak::new()).unwrap();
        reg.mark_as_reopened(5);
        assert!(reg.contains_fd(5));
        let change = reg.remove(key);
        assert_eq!(
            change,
            MaskChange::Unsubscribe,
            "the backend subscription for a recycled fd must be torn down, \
             or a later `add` on the reused fd number wrongly calls `modify`"
        );
        assert!(!reg.contains_fd(5), "a defanged fd's stale key must not linger in `files`");
        assert!(reg.is_empty());
    }

    #[test]
    fn mark_as_reopened_is_idempotent() {
        let mut reg = Registry::new();
        let (cb, tb) = noop_listener();
        let (key, _) = reg.add(Event::Read, 5, cb, tb, None, Weak::new()).unwrap();
        reg.mark_as_reopened(5);
        reg.mark_as_reopened(5);
        assert!(reg.listener_mut(key).unwrap().spent);
        assert_eq!(reg.closed.len(), 1);
    }
}
