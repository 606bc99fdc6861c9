//! The epoll(7) backend (§4.3): mirrors registry state the same way as
//! [`super::poll::PollBackend`], preferred on Linux. Edge-triggered would
//! require the caller to drain fds to exhaustion, which doesn't fit a
//! readiness-dispatch-then-suspend model, so registrations here are
//! level-triggered.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::event::{Interest, ReadyEvent};

use super::{millis_for, Backend};

macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)* )) => {{
        let res = unsafe { libc::$fn($($arg,)*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

fn epoll_bits(mask: Interest) -> u32 {
    let mut bits = 0u32;
    if mask.is_readable() {
        bits |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if mask.is_writable() {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

pub struct EpollBackend {
    epoll: OwnedFd,
}

impl EpollBackend {
    pub fn new() -> io::Result<EpollBackend> {
        let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(EpollBackend {
            // SAFETY: `epoll_create1` returned a valid, owned fd.
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn ctl(&self, op: libc::c_int, fileno: RawFd, mask: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: epoll_bits(mask),
            u64: fileno as u64,
        };
        syscall!(epoll_ctl(self.epoll.as_raw_fd(), op, fileno, &mut event)).map(|_| ())
    }
}

impl Backend for EpollBackend {
    fn register(&mut self, fileno: RawFd, mask: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fileno, mask)
    }

    fn modify(&mut self, fileno: RawFd, mask: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fileno, mask)
    }

    fn unregister(&mut self, fileno: RawFd) -> io::Result<()> {
        let rc = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fileno,
                std::ptr::null_mut(),
            )
        };
        if rc == -1 {
            let err = io::Error::last_os_error();
            // The fd may already be gone (closed underneath us); that's not
            // this backend's problem to raise.
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>> {
        let mut events: Vec<libc::epoll_event> = Vec::with_capacity(128);
        let millis = millis_for(timeout);
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.capacity() as i32,
                    millis,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            // SAFETY: `epoll_wait` initialized the first `n` entries.
            unsafe { events.set_len(n as usize) };
            break;
        }

        Ok(events
            .iter()
            .map(|ev| {
                let bits = ev.events as libc::c_int;
                ReadyEvent {
                    fd: ev.u64 as RawFd,
                    readable: bits & libc::EPOLLIN != 0,
                    writable: bits & libc::EPOLLOUT != 0,
                    error: bits & (libc::EPOLLERR | libc::EPOLLHUP) != 0,
                    half_closed: bits & libc::EPOLLRDHUP != 0,
                    invalid: false,
                }
            })
            .collect())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for EpollBackend {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }
}
