//! The epoll + timerfd + eventfd backend (§4.3): every timer is backed by
//! its own `timerfd` registered `EPOLLONESHOT`, and cross-task wakeups use
//! an `eventfd`. This backend owns its sleep bound entirely — `wait`
//! always blocks indefinitely in `epoll_wait` and relies on the kernel to
//! return when the armed timerfd or the eventfd (or a listener fd) becomes
//! ready; the hub never computes `wait_seconds` for it.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::event::{Interest, ReadyEvent};

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

/// What kind of kernel object an epoll-registered fd here actually is —
/// "effectively a tagged variant" per §9's design notes.
enum Kind {
    File,
    Timer,
    Waker,
}

pub struct TimerFdBackend {
    epoll: OwnedFd,
    waker: EventFd,
    /// The single currently-armed timerfd, replaced (not reused) whenever
    /// the hub arms a new nearer deadline.
    current_timer: Option<OwnedFd>,
    kinds: std::collections::HashMap<RawFd, Kind>,
    timer_fired: bool,
}

fn epoll_bits_for(kind_read: bool, kind_write: bool) -> u32 {
    let mut bits = 0u32;
    if kind_read {
        bits |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if kind_write {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

impl TimerFdBackend {
    pub fn new() -> io::Result<TimerFdBackend> {
        let epoll_fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        // SAFETY: `epoll_create1` returned a valid, owned fd.
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll_fd) };
        let waker = EventFd::new()?;

        let mut event = libc::epoll_event {
            events: epoll_bits_for(true, false),
            u64: waker.as_raw_fd() as u64,
        };
        syscall!(epoll_ctl(
            epoll.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            waker.as_raw_fd(),
            &mut event
        ))?;

        let mut kinds = std::collections::HashMap::new();
        kinds.insert(waker.as_raw_fd(), Kind::Waker);

        Ok(TimerFdBackend {
            epoll,
            waker,
            current_timer: None,
            kinds,
            timer_fired: false,
        })
    }

    fn ctl(&self, op: libc::c_int, fileno: RawFd, bits: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: bits,
            u64: fileno as u64,
        };
        syscall!(epoll_ctl(self.epoll.as_raw_fd(), op, fileno, &mut event)).map(|_| ())
    }
}

impl Backend for TimerFdBackend {
    fn register(&mut self, fileno: RawFd, mask: Interest) -> io::Result<()> {
        self.kinds.insert(fileno, Kind::File);
        self.ctl(
            libc::EPOLL_CTL_ADD,
            fileno,
            epoll_bits_for(mask.is_readable(), mask.is_writable()),
        )
    }

    fn modify(&mut self, fileno: RawFd, mask: Interest) -> io::Result<()> {
        self.ctl(
            libc::EPOLL_CTL_MOD,
            fileno,
            epoll_bits_for(mask.is_readable(), mask.is_writable()),
        )
    }

    fn unregister(&mut self, fileno: RawFd) -> io::Result<()> {
        self.kinds.remove(&fileno);
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

    fn wait(&mut self, _timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>> {
        let mut events: Vec<libc::epoll_event> = vec![unsafe { std::mem::zeroed() }; 128];
        let n = loop {
            // Always blocks indefinitely: the kernel wakes us via the
            // armed timerfd, the eventfd, or a registered listener fd.
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.len() as i32,
                    -1,
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

        let mut ready = Vec::new();
        for ev in &events[..n as usize] {
            let fd = ev.u64 as RawFd;
            match self.kinds.get(&fd) {
                Some(Kind::Waker) => self.waker.ack(),
                Some(Kind::Timer) => {
                    self.timer_fired = true;
                    // EPOLLONESHOT auto-disarmed it; drop our handle.
                    self.current_timer = None;
                }
                Some(Kind::File) | None => {
                    let bits = ev.events as libc::c_int;
                    ready.push(ReadyEvent {
                        fd,
                        readable: bits & libc::EPOLLIN != 0,
                        writable: bits & libc::EPOLLOUT != 0,
                        error: bits & (libc::EPOLLERR | libc::EPOLLHUP) != 0,
                        half_closed: bits & libc::EPOLLRDHUP != 0,
                        invalid: false,
                    });
                }
            }
        }
        Ok(ready)
    }

    fn owns_sleep_bound(&self) -> bool {
        true
    }

    fn arm_timer(&mut self, delay: Duration) -> io::Result<()> {
        if let Some(old) = self.current_timer.take() {
            let _ = unsafe {
                libc::epoll_ctl(
                    self.epoll.as_raw_fd(),
                    libc::EPOLL_CTL_DEL,
                    old.as_raw_fd(),
                    std::ptr::null_mut(),
                )
            };
            self.kinds.remove(&old.as_raw_fd());
        }

        let fd = syscall!(timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC))?;
        // SAFETY: `timerfd_create` returned a valid, owned fd.
        let timer = unsafe { OwnedFd::from_raw_fd(fd) };
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: delay.subsec_nanos() as libc::c_long,
            },
        };
        syscall!(timerfd_settime(
            timer.as_raw_fd(),
            0,
            &spec,
            std::ptr::null_mut()
        ))?;

        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLONESHOT) as u32,
            u64: timer.as_raw_fd() as u64,
        };
        syscall!(epoll_ctl(
            self.epoll.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            timer.as_raw_fd(),
            &mut event
        ))?;

        self.kinds.insert(timer.as_raw_fd(), Kind::Timer);
        self.current_timer = Some(timer);
        Ok(())
    }

    fn take_timer_fired(&mut self) -> bool {
        std::mem::take(&mut self.timer_fired)
    }

    fn wake(&self) -> io::Result<()> {
        self.waker.notify()
    }

    fn close(&mut self) -> io::Result<()> {
        self.current_timer = None;
        Ok(())
    }
}
