// Not all functions are used by all tests.
#![allow(dead_code)]

use std::sync::Once;

use greenhub::{Config, Hub};

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    })
}

/// A hub forced onto the `poll(2)` backend, so these tests exercise the same
/// code path regardless of which OS they happen to run on.
pub fn poll_hub() -> Hub {
    init();
    Hub::with_config(Config::builder().backend("poll").build()).expect("hub construction")
}

/// As [`poll_hub`], but with the "prevent multiple waiters" guard relaxed
/// so a second reader/writer on the same fd queues as secondary instead of
/// erroring out.
pub fn poll_hub_with_secondary_waiters() -> Hub {
    init();
    Hub::with_config(
        Config::builder()
            .backend("poll")
            .allow_secondary_waiters(true)
            .build(),
    )
    .expect("hub construction")
}

/// Every backend name a shared cross-backend harness should try. Not every
/// name is constructible on every OS (`kqueue` is BSD/Darwin-only,
/// `epoll`/`timerfd` are Linux-only); callers use [`try_hub`] and skip the
/// ones the current platform can't build instead of failing on them.
pub const ALL_BACKENDS: &[&str] = &["select", "poll", "epoll", "kqueue", "timerfd"];

/// Build a hub pinned to `backend`, or `None` if that backend isn't
/// available on this platform/build (wrong OS, or the Cargo feature that
/// gates it is off). Mirrors `Hub::with_config`'s own `io::Result`, just
/// collapsed to an `Option` since every caller's response to "unsupported
/// here" is the same: skip this backend and try the next.
pub fn try_hub(backend: &str) -> Option<Hub> {
    init();
    Hub::with_config(Config::builder().backend(backend).build()).ok()
}

/// As [`try_hub`], with secondary waiters allowed.
pub fn try_hub_with_secondary_waiters(backend: &str) -> Option<Hub> {
    init();
    Hub::with_config(
        Config::builder()
            .backend(backend)
            .allow_secondary_waiters(true)
            .build(),
    )
    .ok()
}
