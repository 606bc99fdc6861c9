//! The readiness direction a listener (or a backend subscription) cares
//! about.

use std::fmt;
use std::ops;

/// Which direction of readiness a [`crate::Listener`] is waiting for.
///
/// A composite error/closed condition reported by a backend is never its own
/// variant — it is dispatched as a synthetic `Read` *and* `Write` wakeup (see
/// the dispatch mask table on [`crate::backend::Backend`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    pub(crate) fn index(self) -> usize {
        match self {
            Event::Read => 0,
            Event::Write => 1,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Event::Read => "read",
            Event::Write => "write",
        })
    }
}

/// Bitmask of readiness directions, used by backends translating kernel
/// readiness bits into the listener dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    bits: u8,
}

const READABLE: u8 = 0b001;
const WRITABLE: u8 = 0b010;

impl Interest {
    pub const READABLE: Interest = Interest { bits: READABLE };
    pub const WRITABLE: Interest = Interest { bits: WRITABLE };
    pub const NONE: Interest = Interest { bits: 0 };

    pub fn is_readable(self) -> bool {
        self.bits & READABLE != 0
    }

    pub fn is_writable(self) -> bool {
        self.bits & WRITABLE != 0
    }

    pub fn is_none(self) -> bool {
        self.bits == 0
    }

    pub fn from_event(evtype: Event) -> Interest {
        match evtype {
            Event::Read => Interest::READABLE,
            Event::Write => Interest::WRITABLE,
        }
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest {
            bits: self.bits | rhs.bits,
        }
    }
}

impl ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.bits |= rhs.bits;
    }
}

/// A readiness batch entry returned from [`crate::backend::Backend::wait`]:
/// a raw fd paired with which directions the kernel reported ready, plus the
/// two error conditions a backend can surface directly.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub fd: std::os::unix::io::RawFd,
    pub readable: bool,
    pub writable: bool,
    /// Error or hangup: dispatch to every primary registered for the fd.
    pub error: bool,
    /// Peer half-close (`EPOLLRDHUP`): dispatch the write-primary, then mark
    /// the fd as recycled.
    pub half_closed: bool,
    /// The fd itself was invalid (`POLLNVAL`): remove every listener for it.
    pub invalid: bool,
}
