//! A single-threaded readiness-multiplexing and timer hub for cooperative
//! tasks (see `SPEC_FULL.md` for the full design).
//!
//! A [`Hub`] owns a listener registry, a timer wheel, and one pluggable
//! [`backend`] poller. Tasks spawned onto it suspend with [`trampoline`] or
//! [`sleep`] rather than calling a blocking syscall directly; the hub's
//! main loop wakes each task back up once its fd becomes ready or its
//! timeout/timer elapses.
//!
//! ```no_run
//! use greenhub::{Event, Hub};
//! use std::os::unix::net::UnixStream;
//!
//! let mut hub = Hub::new().unwrap();
//! let handle = hub.handle();
//! let (a, _b) = UnixStream::pair().unwrap();
//! hub.spawn(async move {
//!     let _ = greenhub::trampoline(&handle, &a, Event::Read, None).await;
//! });
//! hub.run().unwrap();
//! ```

mod backend;
mod blocking_detect;
mod clock;
mod config;
mod error;
mod event;
mod hub;
mod listener;
mod registry;
mod slab;
mod task;
mod timer;
mod trampoline;

pub use backend::BackendKind;
pub use clock::{AnyClock, Clock, ManualClock, MonotonicClock};
pub use config::{Config, ConfigBuilder};
pub use error::{HubError, MultipleWaitersError};
pub use event::{Event, Interest, ReadyEvent};
pub use hub::{notify_close, notify_opened, schedule_call_global, schedule_call_local, Hub, HubHandle};
pub use task::{TaskHandle, TaskId};
pub use timer::{Timer, TimerId};
pub use trampoline::{sleep, trampoline, trampoline_with_close, Sleep, Trampoline};
