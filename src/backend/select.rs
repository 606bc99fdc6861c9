//! The select(2) backend (§4.3): keeps no kernel registration at all and
//! rebuilds the read/write/error fd_sets from the registry on every
//! `wait`. The simplest backend, and the fallback of last resort.

use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::event::{Interest, ReadyEvent};

use super::{millis_for, Backend};

pub struct SelectBackend {
    /// fds the registry currently wants readable/writable readiness for.
    /// `select` has no notion of registering ahead of time, so this is
    /// just a plain set rebuilt into an `fd_set` every call.
    readers: Vec<RawFd>,
    writers: Vec<RawFd>,
}

impl SelectBackend {
    pub fn new() -> io::Result<SelectBackend> {
        Ok(SelectBackend {
            readers: Vec::new(),
            writers: Vec::new(),
        })
    }

    /// One-at-a-time probing for a bad fd (§4.3: `_remove_bad_fds`), used
    /// when `select` fails with `EBADF`.
    fn find_and_drop_bad_fd(&mut self) -> Option<RawFd> {
        for &fd in self.readers.iter().chain(self.writers.iter()) {
            let mut set: MaybeUninit<libc::fd_set> = MaybeUninit::uninit();
            unsafe {
                libc::FD_ZERO(set.as_mut_ptr());
                libc::FD_SET(fd, set.as_mut_ptr());
            }
            let mut timeout = libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            };
            let rc = unsafe {
                libc::select(
                    fd + 1,
                    set.as_mut_ptr(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    &mut timeout,
                )
            };
            if rc < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EBADF) {
                self.readers.retain(|&f| f != fd);
                self.writers.retain(|&f| f != fd);
                return Some(fd);
            }
        }
        None
    }
}

impl Backend for SelectBackend {
    fn register(&mut self, fileno: RawFd, mask: Interest) -> io::Result<()> {
        self.modify(fileno, mask)
    }

    fn modify(&mut self, fileno: RawFd, mask: Interest) -> io::Result<()> {
        self.readers.retain(|&f| f != fileno);
        self.writers.retain(|&f| f != fileno);
        if mask.is_readable() {
            self.readers.push(fileno);
        }
        if mask.is_writable() {
            self.writers.push(fileno);
        }
        Ok(())
    }

    fn unregister(&mut self, fileno: RawFd) -> io::Result<()> {
        self.readers.retain(|&f| f != fileno);
        self.writers.retain(|&f| f != fileno);
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>> {
        loop {
            let mut read_set: MaybeUninit<libc::fd_set> = MaybeUninit::uninit();
            let mut write_set: MaybeUninit<libc::fd_set> = MaybeUninit::uninit();
            let mut err_set: MaybeUninit<libc::fd_set> = MaybeUninit::uninit();
            let mut max_fd = -1;
            unsafe {
                libc::FD_ZERO(read_set.as_mut_ptr());
                libc::FD_ZERO(write_set.as_mut_ptr());
                libc::FD_ZERO(err_set.as_mut_ptr());
                for &fd in &self.readers {
                    libc::FD_SET(fd, read_set.as_mut_ptr());
                    libc::FD_SET(fd, err_set.as_mut_ptr());
                    max_fd = max_fd.max(fd);
                }
                for &fd in &self.writers {
                    libc::FD_SET(fd, write_set.as_mut_ptr());
                    libc::FD_SET(fd, err_set.as_mut_ptr());
                    max_fd = max_fd.max(fd);
                }
            }

            let millis = millis_for(timeout);
            let mut tv = libc::timeval {
                tv_sec: (millis / 1000) as libc::time_t,
                tv_usec: ((millis % 1000) * 1000) as libc::suseconds_t,
            };
            let tv_ptr = if millis < 0 {
                std::ptr::null_mut()
            } else {
                &mut tv as *mut _
            };

            let rc = unsafe {
                libc::select(
                    max_fd + 1,
                    read_set.as_mut_ptr(),
                    write_set.as_mut_ptr(),
                    err_set.as_mut_ptr(),
                    tv_ptr,
                )
            };

            if rc < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EBADF) => {
                        if let Some(fd) = self.find_and_drop_bad_fd() {
                            return Ok(vec![ReadyEvent {
                                fd,
                                readable: false,
                                writable: false,
                                error: false,
                                half_closed: false,
                                invalid: true,
                            }]);
                        }
                        continue;
                    }
                    _ => return Err(err),
                }
            }

            let (read_set, write_set, err_set) =
                unsafe { (read_set.assume_init(), write_set.assume_init(), err_set.assume_init()) };
            let mut ready = Vec::new();
            let mut seen = std::collections::HashSet::new();
            for &fd in self.readers.iter().chain(self.writers.iter()) {
                if !seen.insert(fd) {
                    continue;
                }
                let readable = unsafe { libc::FD_ISSET(fd, &read_set) };
                let writable = unsafe { libc::FD_ISSET(fd, &write_set) };
                let error = unsafe { libc::FD_ISSET(fd, &err_set) };
                if readable || writable || error {
                    ready.push(ReadyEvent {
                        fd,
                        readable,
                        writable,
                        error,
                        half_closed: false,
                        invalid: false,
                    });
                }
            }
            return Ok(ready);
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.readers.clear();
        self.writers.clear();
        Ok(())
    }
}
