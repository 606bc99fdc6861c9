//! Error taxonomy surfaced to tasks (see §7 of the design).
//!
//! Everything that originates inside a user callback (`CallbackFault`,
//! `TimerFault`) is contained by the hub and only logged; it never reaches a
//! task. What *can* reach a task waiting in [`crate::trampoline`] is exactly
//! one of [`HubError::Timeout`], [`HubError::IoClosed`] or
//! [`HubError::MultipleWaiters`].

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

use crate::event::Event;

/// Raised (synchronously, to the second caller) when a primary listener
/// already exists for `(fd, evtype)` and the "prevent multiple waiters"
/// policy is on.
#[derive(Debug)]
pub struct MultipleWaitersError {
    pub fd: RawFd,
    pub evtype: Event,
}

impl fmt::Display for MultipleWaitersError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "second simultaneous {} waiter on fd {} (use a pool or disable \
             the multiple-waiters guard if this is intentional)",
            self.evtype, self.fd
        )
    }
}

impl std::error::Error for MultipleWaitersError {}

/// The error a task sees out of [`crate::trampoline::trampoline`].
#[derive(Debug)]
pub enum HubError {
    /// The caller-supplied timeout elapsed before the fd became ready.
    Timeout,
    /// The fd was recycled out from under the waiting task, or the hub is
    /// shutting down. Carries `ENOTCONN`, matching the source's
    /// `IOClosed(errno.ENOTCONN)`.
    IoClosed(io::Error),
    /// Synchronous failure to even register the wait.
    MultipleWaiters(MultipleWaitersError),
}

impl HubError {
    pub fn io_closed() -> HubError {
        HubError::IoClosed(io::Error::from_raw_os_error(libc::ENOTCONN))
    }
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubError::Timeout => f.write_str("trampoline timed out"),
            HubError::IoClosed(e) => write!(f, "operation on closed file: {e}"),
            HubError::MultipleWaiters(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl std::error::Error for HubError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HubError::Timeout => None,
            HubError::IoClosed(e) => Some(e),
            HubError::MultipleWaiters(e) => Some(e),
        }
    }
}

impl From<MultipleWaitersError> for HubError {
    fn from(e: MultipleWaitersError) -> HubError {
        HubError::MultipleWaiters(e)
    }
}
