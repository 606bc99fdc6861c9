//! The epoll + waiter-thread backend (§4.3): a dedicated OS thread blocks
//! in `epoll_wait` so the scheduler greenlet itself never sits in a
//! syscall; it sleeps on a condition variable the thread signals once it
//! has produced events. `epoll_ctl` and `epoll_wait` on the same epoll
//! instance from different threads is kernel-safe, so `register`/`modify`/
//! `unregister` below run directly on the shared fd with no command
//! channel needed — the only two objects actually shared per §5 are the
//! fd-event inbox and the wakeup.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::event::{Interest, ReadyEvent};
use crate::timer::DEFAULT_SLEEP;

use super::{Backend, EventFd};

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

struct Shared {
    inbox: Mutex<std::collections::VecDeque<ReadyEvent>>,
    cv: Condvar,
    stopping: AtomicBool,
}

pub struct ThreadedEpollBackend {
    epoll: Arc<OwnedFd>,
    wake: Arc<EventFd>,
    shared: Arc<Shared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ThreadedEpollBackend {
    pub fn new() -> io::Result<ThreadedEpollBackend> {
        let epoll_fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        // SAFETY: `epoll_create1` returned a valid, owned fd.
        let epoll = Arc::new(unsafe { OwnedFd::from_raw_fd(epoll_fd) });
        let wake = Arc::new(EventFd::new()?);

        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake.as_raw_fd() as u64,
        };
        syscall!(epoll_ctl(
            epoll.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            wake.as_raw_fd(),
            &mut event
        ))?;

        let shared = Arc::new(Shared {
            inbox: Mutex::new(std::collections::VecDeque::new()),
            cv: Condvar::new(),
            stopping: AtomicBool::new(false),
        });

        let thread_epoll = Arc::clone(&epoll);
        let thread_wake_fd = wake.as_raw_fd();
        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("greenhub-waiter".to_owned())
            .spawn(move || waiter_loop(thread_epoll, thread_wake_fd, thread_shared))?;

        Ok(ThreadedEpollBackend {
            epoll,
            wake,
            shared,
            thread: Some(thread),
        })
    }
}

fn waiter_loop(epoll: Arc<OwnedFd>, wake_fd: RawFd, shared: Arc<Shared>) {
    let mut events: Vec<libc::epoll_event> = vec![unsafe { std::mem::zeroed() }; 128];
    loop {
        if shared.stopping.load(Ordering::Acquire) {
            return;
        }
        let n = unsafe {
            libc::epoll_wait(
                epoll.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as i32,
                DEFAULT_SLEEP.as_millis() as i32,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            log::error!("greenhub: waiter thread epoll_wait failed: {err}");
            return;
        }
        if n == 0 {
            continue;
        }

        let mut produced = false;
        let mut batch = Vec::with_capacity(n as usize);
        for ev in &events[..n as usize] {
            let fd = ev.u64 as RawFd;
            if fd == wake_fd {
                // Drain the eventfd ourselves; nothing else touches it.
                let mut buf = [0u8; 8];
                let mut file = std::mem::ManuallyDrop::new(unsafe {
                    use std::os::fd::FromRawFd;
                    std::fs::File::from_raw_fd(wake_fd)
                });
                use std::io::Read;
                let _ = file.read(&mut buf);
                continue;
            }
            let bits = ev.events as libc::c_int;
            batch.push(ReadyEvent {
                fd,
                readable: bits & libc::EPOLLIN != 0,
                writable: bits & libc::EPOLLOUT != 0,
                error: bits & (libc::EPOLLERR | libc::EPOLLHUP) != 0,
                half_closed: bits & libc::EPOLLRDHUP != 0,
                invalid: false,
            });
            produced = true;
        }

        if produced {
            let mut inbox = shared.inbox.lock().unwrap();
            inbox.extend(batch);
            shared.cv.notify_one();
        }
    }
}

impl Backend for ThreadedEpollBackend {
    fn register(&mut self, fileno: RawFd, mask: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: epoll_bits(mask),
            u64: fileno as u64,
        };
        syscall!(epoll_ctl(
            self.epoll.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fileno,
            &mut event
        ))
        .map(|_| ())
    }

    fn modify(&mut self, fileno: RawFd, mask: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: epoll_bits(mask),
            u64: fileno as u64,
        };
        syscall!(epoll_ctl(
            self.epoll.as_raw_fd(),
            libc::EPOLL_CTL_MOD,
            fileno,
            &mut event
        ))
        .map(|_| ())
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
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>> {
        let mut guard = self.shared.inbox.lock().unwrap();
        if guard.is_empty() {
            guard = match timeout {
                None => self
                    .shared
                    .cv
                    .wait_while(guard, |inbox| inbox.is_empty())
                    .unwrap(),
                Some(d) => {
                    let (guard, _timed_out) = self
                        .shared
                        .cv
                        .wait_timeout_while(guard, d, |inbox| inbox.is_empty())
                        .unwrap();
                    guard
                }
            };
        }
        Ok(guard.drain(..).collect())
    }

    fn close(&mut self) -> io::Result<()> {
        self.shared.stopping.store(true, Ordering::Release);
        self.wake.notify()?;
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for ThreadedEpollBackend {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
