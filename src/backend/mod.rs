//! The pluggable backend contract (§4.3/§6): `register`/`modify`/
//! `unregister`/`wait`/`close`, plus the priority-ordered selection the hub
//! performs at construction time.

use std::env;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::event::{Interest, ReadyEvent};

mod epoll;
mod poll;
mod select;

#[cfg(all(target_os = "linux", feature = "timerfd"))]
mod timerfd;
#[cfg(all(target_os = "linux", feature = "waiter-thread"))]
mod waiter_thread;

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd",
))]
mod kqueue;

pub use epoll::EpollBackend;
pub use poll::PollBackend;
pub use select::SelectBackend;

#[cfg(all(target_os = "linux", feature = "timerfd"))]
pub use timerfd::TimerFdBackend;
#[cfg(all(target_os = "linux", feature = "waiter-thread"))]
pub use waiter_thread::ThreadedEpollBackend;

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd",
))]
pub use kqueue::KqueueBackend;

/// A pluggable kernel-readiness engine. `wait` blocks up to `timeout`
/// (`None` meaning infinite, `Some(Duration::ZERO)` meaning poll-only) and
/// returns every fd the kernel reported readiness for, translated into the
/// dispatch-relevant bits from the mask table in §4.3.
pub trait Backend {
    /// Subscribe `fileno` for `mask`. The registry has already computed
    /// `mask` from its primary listeners; the backend never sees secondary
    /// waiters.
    fn register(&mut self, fileno: RawFd, mask: Interest) -> io::Result<()>;

    /// Recompute the subscription for an already-registered fd.
    fn modify(&mut self, fileno: RawFd, mask: Interest) -> io::Result<()>;

    /// Drop the subscription for `fileno` entirely.
    fn unregister(&mut self, fileno: RawFd) -> io::Result<()>;

    /// Block for up to `timeout`, returning every ready fd.
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>>;

    /// Whether this backend drives its own sleep bound from the kernel
    /// (the timerfd+eventfd variant) rather than the hub computing one
    /// from the timer heap (§4.3: "the hub no longer computes a sleep
    /// bound"). Plain select/poll/epoll/kqueue answer `false`.
    fn owns_sleep_bound(&self) -> bool {
        false
    }

    /// Arm a kernel timer that will wake `wait` in `delay` (the
    /// timerfd+eventfd variant's replacement for a hub-computed sleep
    /// bound). No-op for backends that don't own their sleep bound.
    fn arm_timer(&mut self, _delay: Duration) -> io::Result<()> {
        Ok(())
    }

    /// Whether the armed timer fired during the most recent `wait`.
    /// Consumes the flag. No-op/`false` for backends that don't own their
    /// sleep bound.
    fn take_timer_fired(&mut self) -> bool {
        false
    }

    /// Wake a concurrent `wait` from outside the hub's own thread (used by
    /// the threaded-waiter variant's cross-thread signal and the
    /// timerfd+eventfd variant's eventfd). No-op elsewhere.
    fn wake(&self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()>;
}

/// A small `eventfd(2)` wrapper shared by the backends that need a
/// cross-thread or deferred wakeup primitive (the timerfd+eventfd variant's
/// "every cross-task wakeup uses an eventfd", and the threaded-waiter
/// variant's condition-variable analogue). Modeled on the teacher's own
/// `eventfd`-backed `Waker` (`src/sys/unix/waker/eventfd.rs`).
pub(crate) struct EventFd {
    fd: std::os::fd::OwnedFd,
}

impl EventFd {
    pub(crate) fn new() -> io::Result<EventFd> {
        use std::os::fd::FromRawFd;
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(EventFd {
            // SAFETY: `eventfd(2)` returned a valid, owned fd.
            fd: unsafe { std::os::fd::OwnedFd::from_raw_fd(fd) },
        })
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        self.fd.as_raw_fd()
    }

    pub(crate) fn notify(&self) -> io::Result<()> {
        use std::io::Write;
        let buf = 1u64.to_ne_bytes();
        let mut file = std::mem::ManuallyDrop::new(unsafe {
            use std::os::fd::{AsRawFd, FromRawFd};
            std::fs::File::from_raw_fd(self.fd.as_raw_fd())
        });
        match file.write(&buf) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Drain the counter. Call after observing readiness on this fd.
    pub(crate) fn ack(&self) {
        use std::io::Read;
        let mut buf = [0u8; 8];
        let mut file = std::mem::ManuallyDrop::new(unsafe {
            use std::os::fd::{AsRawFd, FromRawFd};
            std::fs::File::from_raw_fd(self.fd.as_raw_fd())
        });
        let _ = file.read(&mut buf);
    }
}

/// Backend identity, used both for the priority list and for the
/// `GREENHUB_BACKEND` override (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    TimerFd,
    Epoll,
    EpollWaiterThread,
    Kqueue,
    Poll,
    Select,
}

impl BackendKind {
    fn from_env_name(name: &str) -> Option<BackendKind> {
        match name {
            "timerfd" => Some(BackendKind::TimerFd),
            "epoll" => Some(BackendKind::Epoll),
            "epoll-waiter-thread" => Some(BackendKind::EpollWaiterThread),
            "kqueue" => Some(BackendKind::Kqueue),
            "poll" => Some(BackendKind::Poll),
            "select" => Some(BackendKind::Select),
            _ => None,
        }
    }
}

/// The priority list from §6: "timerfd+eventfd+epoll, epoll, kqueue, poll,
/// select", first available wins.
fn priority_order() -> &'static [BackendKind] {
    &[
        BackendKind::TimerFd,
        BackendKind::Epoll,
        BackendKind::Kqueue,
        BackendKind::Poll,
        BackendKind::Select,
    ]
}

fn construct(kind: BackendKind) -> io::Result<Box<dyn Backend>> {
    match kind {
        BackendKind::TimerFd => {
            #[cfg(all(target_os = "linux", feature = "timerfd"))]
            {
                Ok(Box::new(TimerFdBackend::new()?))
            }
            #[cfg(not(all(target_os = "linux", feature = "timerfd")))]
            {
                Err(io::Error::from(io::ErrorKind::Unsupported))
            }
        }
        BackendKind::Epoll => {
            #[cfg(target_os = "linux")]
            {
                Ok(Box::new(EpollBackend::new()?))
            }
            #[cfg(not(target_os = "linux"))]
            {
                Err(io::Error::from(io::ErrorKind::Unsupported))
            }
        }
        BackendKind::EpollWaiterThread => {
            #[cfg(all(target_os = "linux", feature = "waiter-thread"))]
            {
                Ok(Box::new(ThreadedEpollBackend::new()?))
            }
            #[cfg(not(all(target_os = "linux", feature = "waiter-thread")))]
            {
                Err(io::Error::from(io::ErrorKind::Unsupported))
            }
        }
        BackendKind::Kqueue => {
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd",
            ))]
            {
                Ok(Box::new(KqueueBackend::new()?))
            }
            #[cfg(not(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd",
            )))]
            {
                Err(io::Error::from(io::ErrorKind::Unsupported))
            }
        }
        BackendKind::Poll => Ok(Box::new(PollBackend::new()?)),
        BackendKind::Select => Ok(Box::new(SelectBackend::new()?)),
    }
}

/// Pick a backend: honor `GREENHUB_BACKEND` if set to a recognized name,
/// otherwise walk the priority list and construct the first one that
/// succeeds.
pub fn select_backend(override_name: Option<&str>) -> io::Result<Box<dyn Backend>> {
    let env_override = override_name
        .map(str::to_owned)
        .or_else(|| env::var("GREENHUB_BACKEND").ok());

    if let Some(name) = env_override.as_deref() {
        if name != "auto" {
            let kind = BackendKind::from_env_name(name).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unknown GREENHUB_BACKEND {name:?}"),
                )
            })?;
            return construct(kind);
        }
    }

    let mut last_err = None;
    for &kind in priority_order() {
        match construct(kind) {
            Ok(backend) => {
                log::debug!("greenhub: selected backend {kind:?}");
                return Ok(backend);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::Unsupported)))
}

/// Convert a [`Duration`] wait bound into the millisecond count `poll(2)`/
/// `epoll_wait(2)` expect, rounding sub-millisecond durations up so a
/// caller that asked for a nonzero wait never gets rounded down to a busy
/// spin (mirrors the teacher's own `Duration::as_millis` rounding in its
/// epoll selector).
pub(crate) fn millis_for(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => d
            .checked_add(Duration::from_nanos(999_999))
            .unwrap_or(d)
            .as_millis()
            .min(libc::c_int::MAX as u128) as libc::c_int,
    }
}
