//! The kqueue(2) backend (§4.3): unlike poll/epoll, kqueue wants one
//! `kevent` per `(fd, evtype)` pair rather than a single combined mask, and
//! the control fd does not survive `fork(2)` — §5's fork-safety rule
//! detects the pid change and re-creates it, re-issuing every
//! currently-registered event from the registry.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::event::{Interest, ReadyEvent};

use super::Backend;

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

#[cfg(any(target_os = "macos", target_os = "ios"))]
type Filter = i16;
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
type Filter = libc::c_short;

fn kevent(ident: RawFd, filter: libc::c_int, flags: libc::c_int) -> libc::kevent {
    libc::kevent {
        ident: ident as libc::uintptr_t,
        filter: filter as Filter,
        flags: flags as u16,
        fflags: 0,
        data: 0,
        udata: std::ptr::null_mut(),
    }
}

/// What this backend currently believes is registered for one fd, so a
/// fork-recovery re-issue (or a `modify`) knows which kevents to replay.
#[derive(Clone, Copy, Default)]
struct Registered {
    read: bool,
    write: bool,
}

pub struct KqueueBackend {
    kq: OwnedFd,
    pid: libc::pid_t,
    registered: std::collections::HashMap<RawFd, Registered>,
}

impl KqueueBackend {
    pub fn new() -> io::Result<KqueueBackend> {
        let fd = syscall!(kqueue())?;
        Ok(KqueueBackend {
            // SAFETY: `kqueue(2)` returned a valid, owned fd.
            kq: unsafe { OwnedFd::from_raw_fd(fd) },
            pid: unsafe { libc::getpid() },
            registered: std::collections::HashMap::new(),
        })
    }

    fn submit(&self, changes: &mut [libc::kevent]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        syscall!(kevent(
            self.kq.as_raw_fd(),
            changes.as_ptr(),
            changes.len() as libc::c_int,
            std::ptr::null_mut(),
            0,
            std::ptr::null(),
        ))
        .map(|_| ())
    }

    fn apply(&mut self, fileno: RawFd, mask: Interest) -> io::Result<()> {
        let prev = self.registered.get(&fileno).copied().unwrap_or_default();
        let want_read = mask.is_readable();
        let want_write = mask.is_writable();
        let mut changes = Vec::with_capacity(2);
        if want_read != prev.read {
            let flags = if want_read {
                libc::EV_ADD | libc::EV_CLEAR
            } else {
                libc::EV_DELETE
            };
            changes.push(kevent(fileno, libc::EVFILT_READ, flags));
        }
        if want_write != prev.write {
            let flags = if want_write {
                libc::EV_ADD | libc::EV_CLEAR
            } else {
                libc::EV_DELETE
            };
            changes.push(kevent(fileno, libc::EVFILT_WRITE, flags));
        }
        self.submit(&mut changes)?;
        self.registered.insert(
            fileno,
            Registered {
                read: want_read,
                write: want_write,
            },
        );
        Ok(())
    }

    /// Detect a fork via pid change and re-create the kqueue, replaying
    /// every currently-registered event (§5: "Fork safety").
    fn recover_from_fork_if_needed(&mut self) -> io::Result<()> {
        let pid = unsafe { libc::getpid() };
        if pid == self.pid {
            return Ok(());
        }
        self.pid = pid;
        let fd = syscall!(kqueue())?;
        self.kq = unsafe { OwnedFd::from_raw_fd(fd) };
        let entries: Vec<(RawFd, Registered)> = self.registered.drain().collect();
        for (fileno, reg) in entries {
            let mask = match (reg.read, reg.write) {
                (true, true) => Interest::READABLE | Interest::WRITABLE,
                (true, false) => Interest::READABLE,
                (false, true) => Interest::WRITABLE,
                (false, false) => Interest::NONE,
            };
            self.apply(fileno, mask)?;
        }
        Ok(())
    }
}

impl Backend for KqueueBackend {
    fn register(&mut self, fileno: RawFd, mask: Interest) -> io::Result<()> {
        self.recover_from_fork_if_needed()?;
        self.apply(fileno, mask)
    }

    fn modify(&mut self, fileno: RawFd, mask: Interest) -> io::Result<()> {
        self.recover_from_fork_if_needed()?;
        self.apply(fileno, mask)
    }

    fn unregister(&mut self, fileno: RawFd) -> io::Result<()> {
        self.recover_from_fork_if_needed()?;
        self.apply(fileno, Interest::NONE)?;
        self.registered.remove(&fileno);
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>> {
        self.recover_from_fork_if_needed()?;
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);

        let mut events: Vec<libc::kevent> = vec![unsafe { std::mem::zeroed() }; 128];
        let n = loop {
            let n = unsafe {
                libc::kevent(
                    self.kq.as_raw_fd(),
                    std::ptr::null(),
                    0,
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    ts_ptr,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            break n;
        };

        let mut by_fd: std::collections::HashMap<RawFd, ReadyEvent> = std::collections::HashMap::new();
        for ev in &events[..n as usize] {
            let fd = ev.ident as RawFd;
            let entry = by_fd.entry(fd).or_insert(ReadyEvent {
                fd,
                readable: false,
                writable: false,
                error: false,
                half_closed: false,
                invalid: false,
            });
            let error = ev.flags & libc::EV_ERROR != 0;
            match ev.filter as libc::c_int {
                libc::EVFILT_READ => entry.readable = true,
                libc::EVFILT_WRITE => entry.writable = true,
                _ => {}
            }
            entry.error |= error;
        }
        Ok(by_fd.into_values().collect())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}
