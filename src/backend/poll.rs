//! The poll(2) backend (§4.3): mirrors registry state into a `pollfd`
//! array via `register`/`modify`/`unregister`, unlike `select` which
//! rebuilds its fd sets from scratch every wait.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::event::{Interest, ReadyEvent};

use super::{millis_for, Backend};

fn poll_events(mask: Interest) -> libc::c_short {
    let mut events = 0;
    if mask.is_readable() {
        events |= libc::POLLIN;
    }
    if mask.is_writable() {
        events |= libc::POLLOUT;
    }
    events as libc::c_short
}

pub struct PollBackend {
    fds: Vec<libc::pollfd>,
}

impl PollBackend {
    pub fn new() -> io::Result<PollBackend> {
        Ok(PollBackend { fds: Vec::new() })
    }

    fn index_of(&self, fileno: RawFd) -> Option<usize> {
        self.fds.iter().position(|pfd| pfd.fd == fileno)
    }
}

impl Backend for PollBackend {
    fn register(&mut self, fileno: RawFd, mask: Interest) -> io::Result<()> {
        // A duplicate subscription is benign (§4.3: "EEXIST on register is
        // ignored"); just fold it into a modify.
        if self.index_of(fileno).is_some() {
            return self.modify(fileno, mask);
        }
        self.fds.push(libc::pollfd {
            fd: fileno,
            events: poll_events(mask),
            revents: 0,
        });
        Ok(())
    }

    fn modify(&mut self, fileno: RawFd, mask: Interest) -> io::Result<()> {
        match self.index_of(fileno) {
            Some(idx) => {
                self.fds[idx].events = poll_events(mask);
                Ok(())
            }
            None => self.register(fileno, mask),
        }
    }

    fn unregister(&mut self, fileno: RawFd) -> io::Result<()> {
        self.fds.retain(|pfd| pfd.fd != fileno);
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>> {
        if self.fds.is_empty() {
            // `poll` with an empty array is a legal, portable sleep.
            let millis = millis_for(timeout);
            if millis >= 0 {
                std::thread::sleep(Duration::from_millis(millis as u64));
            }
            return Ok(Vec::new());
        }

        let millis = millis_for(timeout);
        loop {
            let rc = unsafe { libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, millis) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            break;
        }

        let mut ready = Vec::new();
        for pfd in &self.fds {
            if pfd.revents == 0 {
                continue;
            }
            let invalid = pfd.revents & libc::POLLNVAL != 0;
            let error = pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0;
            let readable = pfd.revents & libc::POLLIN != 0;
            let writable = pfd.revents & libc::POLLOUT != 0;
            if invalid || error || readable || writable {
                ready.push(ReadyEvent {
                    fd: pfd.fd,
                    readable,
                    writable,
                    error,
                    half_closed: false,
                    invalid,
                });
            }
        }
        Ok(ready)
    }

    fn close(&mut self) -> io::Result<()> {
        self.fds.clear();
        Ok(())
    }
}
