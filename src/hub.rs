//! The hub main loop (§4.5): coordinates the registry, timer wheel, and
//! backend poller, and owns the executor that drives task futures.

use std::cell::{RefCell, RefMut};
use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::backend::{self, Backend};
use crate::clock::{AnyClock, Clock};
use crate::config::Config;
use crate::error::MultipleWaitersError;
use crate::event::Event;
use crate::listener::{Resume, Throw};
use crate::registry::{MaskChange, Registry};
use crate::slab::SlabKey;
use crate::task::{Executor, TaskHandle, TaskSlot};
use crate::timer::{Timer, TimerCallback, TimerWheel, DEFAULT_SLEEP};

/// The registry, timer wheel, backend mirror, and clock — everything a
/// [`crate::trampoline::Trampoline`] future needs to reach from inside a
/// task's `poll`. Lives behind a `Rc<RefCell<_>>` ([`HubHandle`]) rather
/// than directly on [`Hub`] so the executor can poll a task (which
/// borrows this) without also needing to borrow the executor itself.
pub struct HubCore {
    pub(crate) registry: Registry,
    pub(crate) timers: TimerWheel,
    backend: Box<dyn Backend>,
    clock: AnyClock,
    registered_fds: HashSet<RawFd>,
    stopping: bool,
    debug_blocking: Option<Duration>,
    /// The deadline last passed to `backend.arm_timer()`, so a tick whose
    /// next-due timer hasn't moved since the previous one doesn't redo the
    /// timerfd's delete+create+settime+epoll_ctl sequence for nothing.
    armed_timer_due: Option<Duration>,
}

impl HubCore {
    pub(crate) fn now(&self) -> Duration {
        self.clock.now()
    }

    pub(crate) fn add_listener(
        &mut self,
        evtype: Event,
        fileno: RawFd,
        cb: Resume,
        tb: Throw,
        mark_as_closed: Option<Box<dyn FnMut()>>,
        owning_task: Weak<TaskSlot>,
    ) -> Result<SlabKey, MultipleWaitersError> {
        let (key, change) = self
            .registry
            .add(evtype, fileno, cb, tb, mark_as_closed, owning_task)?;
        self.apply_mask_change(fileno, change);
        Ok(key)
    }

    pub(crate) fn remove_listener(&mut self, fileno: RawFd, key: SlabKey) {
        let change = self.registry.remove(key);
        self.apply_mask_change(fileno, change);
    }

    fn apply_mask_change(&mut self, fileno: RawFd, change: MaskChange) {
        match change {
            MaskChange::Unchanged => {}
            MaskChange::Subscribe(mask) => {
                let result = if self.registered_fds.insert(fileno) {
                    self.backend.register(fileno, mask)
                } else {
                    self.backend.modify(fileno, mask)
                };
                if let Err(err) = result {
                    log::warn!("greenhub: failed to update backend subscription for fd {fileno}: {err}");
                }
            }
            MaskChange::Unsubscribe => {
                if self.registered_fds.remove(&fileno) {
                    if let Err(err) = self.backend.unregister(fileno) {
                        log::warn!("greenhub: failed to unregister fd {fileno}: {err}");
                    }
                }
            }
        }
    }

    /// `schedule_call_global(seconds, cb, *args)` from §6.
    pub fn schedule_call_global(&mut self, delay: Duration, callback: TimerCallback) -> Timer {
        let now = self.now();
        self.timers.add_timer(now, delay, callback, None)
    }

    /// `schedule_call_local(seconds, cb, *args)` from §6: auto-cancelled
    /// once the owning task dies.
    pub fn schedule_call_local(
        &mut self,
        delay: Duration,
        callback: TimerCallback,
        owner: Weak<TaskSlot>,
    ) -> Timer {
        let now = self.now();
        self.timers.add_timer(now, delay, callback, Some(owner))
    }

    /// `notify_opened(fd)` / `mark_as_reopened(fd)` (§4.1/§6).
    pub fn notify_opened(&mut self, fileno: RawFd) {
        self.registry.mark_as_reopened(fileno);
    }

    /// `notify_close(fd)` (§4.1/§6): informational no-op.
    pub fn notify_close(&mut self, fileno: RawFd) {
        self.registry.notify_close(fileno);
    }

    pub fn request_shutdown(&mut self) {
        self.stopping = true;
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    fn dispatch_primary(&mut self, fileno: RawFd, evtype: Event) {
        let Some(key) = (match evtype {
            Event::Read => self.registry.read_primary(fileno),
            Event::Write => self.registry.write_primary(fileno),
        }) else {
            return;
        };

        let guard = self
            .debug_blocking
            .map(|budget| crate::blocking_detect::arm(budget, "listener callback"));

        let result = {
            let Some(listener) = self.registry.listener_mut(key) else {
                return;
            };
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (listener.cb)(fileno)))
        };
        drop(guard);

        if result.is_err() {
            log::error!("greenhub: listener callback for fd {fileno} panicked; removing fd");
            self.registry.remove_descriptor(fileno);
            self.apply_mask_change(fileno, MaskChange::Unsubscribe);
        }
    }

    /// Translate a ready batch into dispatches per the mask table in §4.3:
    /// RDHUP fires the write-primary then marks the fd recycled; ERR/HUP
    /// fires every primary registered for the fd; NVAL removes the
    /// descriptor outright.
    fn dispatch(&mut self, ready: Vec<crate::event::ReadyEvent>) {
        for ev in ready {
            if ev.invalid {
                self.registry.remove_descriptor(ev.fd);
                self.apply_mask_change(ev.fd, MaskChange::Unsubscribe);
                continue;
            }
            if ev.half_closed {
                self.dispatch_primary(ev.fd, Event::Write);
                self.registry.mark_as_reopened(ev.fd);
                continue;
            }
            if ev.error {
                self.dispatch_primary(ev.fd, Event::Read);
                self.dispatch_primary(ev.fd, Event::Write);
                continue;
            }
            if ev.readable {
                self.dispatch_primary(ev.fd, Event::Read);
            }
            if ev.writable {
                self.dispatch_primary(ev.fd, Event::Write);
            }
        }
    }

    /// One tick of the main loop (§4.5).
    fn tick(&mut self) -> io::Result<()> {
        // 1. Drain the closed-listener queue.
        self.registry.drain_closed();

        // 2. Merge staged timers into the heap.
        self.timers.prepare_timers();

        // 3. Fire immediate timers unconditionally.
        self.timers.fire_immediate();
        // A callback fired just now may have scheduled another immediate
        // timer; if so, don't let the backend block at all this tick.
        let more_immediate_pending = self.timers.has_immediate();

        // 4. Fire every timer due now.
        let now = self.now();
        let (next_due, fired_due) = self.timers.fire_due(now);
        // A just-fired timer's callback may have woken an executor task
        // (e.g. a trampoline timeout); don't let the backend block past
        // that before `run` gets a chance to poll it.
        let skip_wait = more_immediate_pending || fired_due;

        // 5. Compute the kernel-wait bound.
        let ready = if self.backend.owns_sleep_bound() {
            if skip_wait {
                // `arm_timer(Duration::ZERO)` would *disarm* the timerfd
                // per timerfd_settime(2), not fire it — an immediate
                // return has to come from the wake primitive instead.
                let _ = self.backend.wake();
            } else if let Some(due) = next_due {
                // Only touch the timerfd when the earliest deadline has
                // actually moved; re-arming every tick costs a
                // delete+create+settime+epoll_ctl sequence for nothing if
                // it hasn't.
                if self.armed_timer_due != Some(due) {
                    let bound = self.timers.sleep_bound(now, Some(due));
                    let _ = self.backend.arm_timer(bound);
                    self.armed_timer_due = Some(due);
                }
            } else {
                self.armed_timer_due = None;
            }
            self.backend.wait(None)?
        } else {
            let wait_seconds = if skip_wait {
                Duration::ZERO
            } else {
                match next_due {
                    Some(due) => self.timers.sleep_bound(now, Some(due)),
                    None => DEFAULT_SLEEP,
                }
            };
            self.backend.wait(Some(wait_seconds))?
        };

        // 6/7. Dispatch whatever came back.
        self.dispatch(ready);
        Ok(())
    }

    fn teardown(&mut self) {
        self.timers.cancel_all();
        let fds: Vec<RawFd> = self.registered_fds.drain().collect();
        for fd in fds {
            let _ = self.backend.unregister(fd);
        }
        let _ = self.backend.close();
    }

    pub fn is_idle(&self) -> bool {
        self.registry.is_empty() && self.timers.is_empty()
    }
}

/// A cheap, cloneable reference to a hub's core state. Every free function
/// in [`crate::trampoline`] takes one explicitly — there is no process-wide
/// "active hub" (§9: "No globals in the port").
#[derive(Clone)]
pub struct HubHandle(Rc<RefCell<HubCore>>);

impl HubHandle {
    pub(crate) fn core_mut(&self) -> RefMut<'_, HubCore> {
        self.0.borrow_mut()
    }

    pub fn request_shutdown(&self) {
        self.core_mut().request_shutdown();
    }
}

/// `schedule_call_global(seconds, cb, *args)` (§6): run `callback` once
/// after `delay`, independent of which task (if any) is current.
pub fn schedule_call_global(hub: &HubHandle, delay: Duration, callback: TimerCallback) -> Timer {
    hub.core_mut().schedule_call_global(delay, callback)
}

/// `schedule_call_local(seconds, cb, *args)` (§6): like
/// [`schedule_call_global`], but auto-cancelled if the calling task exits
/// before the timer fires.
pub fn schedule_call_local(hub: &HubHandle, delay: Duration, callback: TimerCallback) -> Timer {
    let owner = crate::task::current_task();
    hub.core_mut().schedule_call_local(delay, callback, owner)
}

/// `notify_opened(fd)` (§6): alias for `mark_as_reopened` — tell the hub a
/// fd number has been recycled to a new underlying file so any listener
/// still waiting on the old one should be thrown out.
pub fn notify_opened(hub: &HubHandle, fileno: RawFd) {
    hub.core_mut().notify_opened(fileno);
}

/// `notify_close(fd)` (§6): informational no-op, per the design note
/// resolving the open question of whether it should itself trigger
/// retirement (it doesn't; recycling is the sole trigger).
pub fn notify_close(hub: &HubHandle, fileno: RawFd) {
    hub.core_mut().notify_close(fileno);
}

/// The event hub: the single-threaded scheduler a green task yields to
/// when it must wait on I/O or time (§1). Owns the [`HubCore`] (registry,
/// timers, backend) and the task [`Executor`].
pub struct Hub {
    core: Rc<RefCell<HubCore>>,
    executor: Executor,
}

impl Hub {
    pub fn new() -> io::Result<Hub> {
        Hub::with_config(Config::from_env())
    }

    pub fn with_config(config: Config) -> io::Result<Hub> {
        let backend = backend::select_backend(config.backend_override.as_deref())?;
        let mut registry = Registry::new();
        registry.set_allow_secondary(config.allow_secondary_waiters);
        let core = HubCore {
            registry,
            timers: TimerWheel::new(),
            backend,
            clock: config.clock,
            registered_fds: HashSet::new(),
            stopping: false,
            debug_blocking: if config.debug_blocking {
                Some(Duration::from_secs(1))
            } else {
                None
            },
            armed_timer_due: None,
        };
        Ok(Hub {
            core: Rc::new(RefCell::new(core)),
            executor: Executor::new(),
        })
    }

    pub fn handle(&self) -> HubHandle {
        HubHandle(Rc::clone(&self.core))
    }

    /// Opt into the `SIGALRM`-based blocking-detection watchdog (§5),
    /// armed around every listener/timer callback invocation. Development
    /// aid only; never call this in production.
    pub fn set_debug_blocking(&mut self, budget: Option<Duration>) {
        self.core.borrow_mut().debug_blocking = budget;
    }

    pub fn spawn<F>(&mut self, future: F) -> TaskHandle
    where
        F: Future<Output = ()> + 'static,
    {
        self.executor.spawn(future)
    }

    /// `abort(wait)` (§4.5 "Termination"): requests the main loop stop.
    /// The in-flight tick (if any) always completes before `run` observes
    /// `stopping` — in this synchronous port there is no separate
    /// "finish the tick without waiting" mode to fall back to, so `wait`
    /// only documents that expectation rather than selecting between two
    /// behaviors.
    pub fn abort(&mut self, _wait: bool) {
        self.core.borrow_mut().request_shutdown();
    }

    /// Run the main loop until [`Hub::abort`] is called, or until there is
    /// no more work outstanding (no tasks, no timers, no listeners) —
    /// a pragmatic embedder convenience beyond what §4.5 specifies, since
    /// an idle hub with nothing left to do has no more ticks to perform.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            // Poll whatever is runnable *before* blocking on the backend: a
            // task spawned (or woken by the previous tick's dispatch) must
            // get to register its listener/timer before `tick` can compute
            // a meaningful wait bound for it.
            self.executor.run_ready();
            if self.core.borrow().is_stopping() {
                break;
            }
            if self.executor.is_empty() && self.core.borrow().is_idle() {
                break;
            }
            self.core.borrow_mut().tick()?;
        }
        self.core.borrow_mut().teardown();
        Ok(())
    }

    /// Spawn `future` and run the hub until it completes, returning its
    /// output. The usual entry point for embedding a single top-level
    /// task.
    pub fn block_on<F>(&mut self, future: F) -> io::Result<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let result: Rc<RefCell<Option<F::Output>>> = Rc::new(RefCell::new(None));
        let result_slot = Rc::clone(&result);
        self.spawn(async move {
            let output = future.await;
            *result_slot.borrow_mut() = Some(output);
        });

        loop {
            self.executor.run_ready();
            if result.borrow().is_some() {
                break;
            }
            if self.core.borrow().is_stopping() {
                break;
            }
            if self.executor.is_empty() && self.core.borrow().is_idle() {
                break;
            }
            self.core.borrow_mut().tick()?;
        }
        self.core.borrow_mut().teardown();

        Rc::try_unwrap(result)
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::Other,
                    "greenhub: block_on task still referenced on exit",
                )
            })?
            .into_inner()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::Other,
                    "greenhub: block_on task never completed",
                )
            })
    }
}
