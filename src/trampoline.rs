//! The task-side suspend-on-fd-or-timeout primitive (§4.4), implemented as
//! a named `Future` per the stackless task model chosen in SPEC_FULL.md §1
//! rather than the blocking function the source describes.

use std::cell::RefCell;
use std::future::Future;
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::error::HubError;
use crate::event::Event;
use crate::hub::HubHandle;
use crate::slab::SlabKey;
use crate::task::current_task;
use crate::timer::Timer;

struct Shared {
    outcome: Option<Result<(), HubError>>,
    waker: Option<Waker>,
}

/// The `Future` returned by [`trampoline`]. Polling it the first time
/// registers a listener (and, if a timeout was given, a timer) with the
/// hub; every poll after that just checks whether the listener's `cb`/`tb`
/// has recorded an outcome. Dropped in any state — resolved, pending, or
/// cancelled mid-wait — it always removes its listener and cancels its
/// timer (§4.4 step 5, "always"), which is strictly stronger than the
/// source's greenlet `finally` block since a Rust future can be dropped
/// without ever being polled to completion.
pub struct Trampoline {
    hub: HubHandle,
    fileno: RawFd,
    evtype: Event,
    timeout: Option<Duration>,
    mark_as_closed: Option<Box<dyn FnMut()>>,
    shared: Rc<RefCell<Shared>>,
    listener_key: Option<SlabKey>,
    timer: Option<Timer>,
    started: bool,
}

/// `trampoline(fd, *, read=.., write=.., timeout=.., mark_as_closed=..)`
/// from §4.4. The exactly-one-of-read/write precondition from the source
/// is expressed in Rust as a single `evtype: Event` parameter rather than
/// two booleans, so the precondition is a type-level guarantee instead of
/// a runtime check.
pub fn trampoline(
    hub: &HubHandle,
    source: &impl AsRawFd,
    evtype: Event,
    timeout: Option<Duration>,
) -> Trampoline {
    trampoline_with_close(hub, source.as_raw_fd(), evtype, timeout, None)
}

/// As [`trampoline`], but with an explicit `mark_as_closed` side effect
/// (§3: "lets the surrounding wrapper defuse its own close path"), for
/// callers that wrap a raw fd in their own close-tracking type.
pub fn trampoline_with_close(
    hub: &HubHandle,
    fileno: RawFd,
    evtype: Event,
    timeout: Option<Duration>,
    mark_as_closed: Option<Box<dyn FnMut()>>,
) -> Trampoline {
    Trampoline {
        hub: hub.clone(),
        fileno,
        evtype,
        timeout,
        mark_as_closed,
        shared: Rc::new(RefCell::new(Shared {
            outcome: None,
            waker: None,
        })),
        listener_key: None,
        timer: None,
        started: false,
    }
}

/// `sleep(seconds)` from §6: wait that many seconds with no fd involved,
/// implemented as `trampoline` on a timer-only wait (§5: "Suspension
/// points for user tasks").
pub fn sleep(hub: &HubHandle, duration: Duration) -> Sleep {
    Sleep {
        hub: hub.clone(),
        duration,
        timer: None,
        shared: Rc::new(RefCell::new(Shared {
            outcome: None,
            waker: None,
        })),
        started: false,
    }
}

pub struct Sleep {
    hub: HubHandle,
    duration: Duration,
    timer: Option<Timer>,
    shared: Rc<RefCell<Shared>>,
    started: bool,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if !this.started {
            this.started = true;
            let shared = Rc::clone(&this.shared);
            let mut core = this.hub.core_mut();
            let now = core.now();
            let timer = core.timers.add_timer(
                now,
                this.duration,
                Box::new(move || {
                    let mut shared = shared.borrow_mut();
                    shared.outcome = Some(Ok(()));
                    if let Some(waker) = shared.waker.take() {
                        waker.wake();
                    }
                }),
                None,
            );
            this.timer = Some(timer);
        }
        let mut shared = this.shared.borrow_mut();
        if shared.outcome.take().is_some() {
            return Poll::Ready(());
        }
        shared.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Future for Trampoline {
    type Output = Result<(), HubError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), HubError>> {
        let this = self.get_mut();

        if !this.started {
            this.started = true;
            let owning_task = current_task();
            let mut core = this.hub.core_mut();

            if let Some(timeout) = this.timeout {
                let shared = Rc::clone(&this.shared);
                let now = core.now();
                let timer = core.timers.add_timer(
                    now,
                    timeout,
                    Box::new(move || {
                        let mut shared = shared.borrow_mut();
                        if shared.outcome.is_none() {
                            shared.outcome = Some(Err(HubError::Timeout));
                        }
                        if let Some(waker) = shared.waker.take() {
                            waker.wake();
                        }
                    }),
                    None,
                );
                this.timer = Some(timer);
            }

            let resume_shared = Rc::clone(&this.shared);
            let cb: crate::listener::Resume = Box::new(move |_fileno| {
                let mut shared = resume_shared.borrow_mut();
                if shared.outcome.is_none() {
                    shared.outcome = Some(Ok(()));
                }
                if let Some(waker) = shared.waker.take() {
                    waker.wake();
                }
            });
            let throw_shared = Rc::clone(&this.shared);
            let tb: crate::listener::Throw = Box::new(move |err| {
                let mut shared = throw_shared.borrow_mut();
                shared.outcome = Some(Err(err));
                if let Some(waker) = shared.waker.take() {
                    waker.wake();
                }
            });

            match core.add_listener(
                this.evtype,
                this.fileno,
                cb,
                tb,
                this.mark_as_closed.take(),
                owning_task,
            ) {
                Ok(key) => this.listener_key = Some(key),
                Err(err) => return Poll::Ready(Err(err.into())),
            }
        }

        let mut shared = this.shared.borrow_mut();
        if let Some(outcome) = shared.outcome.take() {
            return Poll::Ready(outcome);
        }
        shared.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        if let Some(key) = self.listener_key.take() {
            let mut core = self.hub.core_mut();
            core.remove_listener(self.fileno, key);
        }
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}
