//! The minimal single-threaded executor that drives tasks (futures) against
//! the hub. Not a teacher concept: the source's coroutine substrate makes no
//! distinction between "the thing the hub resumes" and "the thing that owns
//! a stack" because a greenlet is both. In the stackless port (§1 of the
//! design) those are split: a [`TaskSlot`] is a liveness marker the registry
//! and timer heap can hold a [`Weak`] reference to, and the executor below
//! is the thin glue that polls a task's future in response to wakeups.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

/// Liveness marker for a spawned task. The hub only ever sees a [`Weak`]
/// reference to this; when the task completes (or is dropped) the strong
/// count drops to zero and [`Weak::strong_count`] reports it as dead. Used
/// by [`crate::Listener::owner_alive`] and by local timers to auto-suppress
/// once their owning task is gone.
pub struct TaskSlot {
    id: TaskId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

thread_local! {
    static NEXT_TASK_ID: Cell<u64> = const { Cell::new(0) };
    static CURRENT: RefCell<Vec<Rc<TaskSlot>>> = const { RefCell::new(Vec::new()) };
}

impl TaskSlot {
    fn new() -> Rc<TaskSlot> {
        let id = NEXT_TASK_ID.with(|n| {
            let id = n.get();
            n.set(id + 1);
            TaskId(id)
        });
        Rc::new(TaskSlot { id })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }
}

/// The task the hub is *currently* polling, mirroring the source's
/// `getcurrent()` call on the stackful greenlet library. Valid only while a
/// task future is being polled; [`trampoline`](crate::trampoline) reads it
/// to stash a weak owning-task reference on the listener/timer it creates.
pub(crate) fn current_task() -> Weak<TaskSlot> {
    CURRENT.with(|c| c.borrow().last().map(Rc::downgrade).unwrap_or_default())
}

struct CurrentGuard;

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| {
            c.borrow_mut().pop();
        });
    }
}

fn push_current(slot: Rc<TaskSlot>) -> CurrentGuard {
    CURRENT.with(|c| c.borrow_mut().push(slot));
    CurrentGuard
}

/// One spawned task: a boxed future plus the liveness marker the rest of the
/// hub can weak-reference.
struct Task {
    slot: Rc<TaskSlot>,
    future: Pin<Box<dyn Future<Output = ()>>>,
}

/// Shared wake state for one task: a flag the waker sets and the shared
/// ready-queue it pushes the task id onto. `Rc`-based rather than
/// `Arc`-based because nothing here ever crosses a thread boundary (§5:
/// "the hub has no locks on its internal state because it is never
/// re-entered concurrently").
struct WakeState {
    id: TaskId,
    ready: Rc<RefCell<VecDeque<TaskId>>>,
    queued: Cell<bool>,
}

fn raw_waker(state: Rc<WakeState>) -> RawWaker {
    RawWaker::new(Rc::into_raw(state) as *const (), &VTABLE)
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop_waker);

unsafe fn clone(ptr: *const ()) -> RawWaker {
    let state = unsafe { Rc::from_raw(ptr as *const WakeState) };
    let cloned = Rc::clone(&state);
    std::mem::forget(state);
    raw_waker(cloned)
}

unsafe fn wake(ptr: *const ()) {
    let state = unsafe { Rc::from_raw(ptr as *const WakeState) };
    schedule(&state);
}

unsafe fn wake_by_ref(ptr: *const ()) {
    let state = unsafe { &*(ptr as *const WakeState) };
    schedule(state);
}

unsafe fn drop_waker(ptr: *const ()) {
    drop(unsafe { Rc::from_raw(ptr as *const WakeState) });
}

fn schedule(state: &WakeState) {
    if !state.queued.replace(true) {
        state.ready.borrow_mut().push_back(state.id);
    }
}

/// Handle to a task spawned on the hub's executor. Dropping it does not
/// cancel the task; the executor owns the future independently. Kept mainly
/// so embedders can inspect whether a task is still registered.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    slot: Weak<TaskSlot>,
}

impl TaskHandle {
    pub fn is_finished(&self) -> bool {
        self.slot.strong_count() == 0
    }

    pub fn id(&self) -> TaskId {
        self.id
    }
}

/// The hub's task table: every spawned task plus the queue of task ids a
/// waker has marked runnable. This is `pub(crate)` scaffolding for
/// [`crate::Hub`]; it is not part of the public API surface the design
/// calls out in §6 (that surface is `trampoline`/`sleep`/`schedule_call_*`).
#[derive(Default)]
pub(crate) struct Executor {
    tasks: std::collections::HashMap<TaskId, Task>,
    wake_states: std::collections::HashMap<TaskId, Rc<WakeState>>,
    ready: Rc<RefCell<VecDeque<TaskId>>>,
}

impl Executor {
    pub(crate) fn new() -> Executor {
        Executor {
            tasks: std::collections::HashMap::new(),
            wake_states: std::collections::HashMap::new(),
            ready: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    pub(crate) fn spawn<F>(&mut self, future: F) -> TaskHandle
    where
        F: Future<Output = ()> + 'static,
    {
        let slot = TaskSlot::new();
        let id = slot.id();
        let handle = TaskHandle {
            id,
            slot: Rc::downgrade(&slot),
        };
        let task = Task {
            slot,
            future: Box::pin(future),
        };
        let wake_state = Rc::new(WakeState {
            id,
            ready: Rc::clone(&self.ready),
            queued: Cell::new(true),
        });
        self.tasks.insert(id, task);
        self.wake_states.insert(id, wake_state);
        self.ready.borrow_mut().push_back(id);
        handle
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Poll every task currently marked runnable, once each. Returns the
    /// number of tasks polled (not the number still pending) so the hub's
    /// tick can decide whether it made forward progress without a kernel
    /// wait.
    pub(crate) fn run_ready(&mut self) -> usize {
        let mut polled = 0;
        loop {
            let id = match self.ready.borrow_mut().pop_front() {
                Some(id) => id,
                None => break,
            };
            let Some(wake_state) = self.wake_states.get(&id) else {
                continue;
            };
            wake_state.queued.set(false);
            let waker = unsafe { Waker::from_raw(raw_waker(Rc::clone(wake_state))) };
            let mut cx = Context::from_waker(&waker);
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            let slot = Rc::clone(&task.slot);
            let _guard = push_current(slot);
            let poll = task.future.as_mut().poll(&mut cx);
            polled += 1;
            if poll.is_ready() {
                self.tasks.remove(&id);
                self.wake_states.remove(&id);
            }
        }
        polled
    }
}
