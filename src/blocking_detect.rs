//! Optional blocking-detection watchdog (§5: "When enabled, the hub arms a
//! `SIGALRM`-style interval timer around each callback invocation; if the
//! callback does not return within the configured budget the alarm handler
//! raises a diagnostic."). Ported from the source's
//! `eventlet.hubs.hub.BaseHub.block_detect_pre`/`_post`, using
//! `timer_create`/`timer_settime` (a POSIX per-process interval timer)
//! rather than Python's `signal.setitimer` equivalent.
//!
//! True in-signal-handler unwinding is unsound in Rust, so unlike the
//! source (which raises inside the callback via a signal handler that
//! itself runs Python bytecode), this port's handler only flips an
//! `AtomicBool`; the budget violation is reported via `log::warn!` after
//! the callback returns. This is strictly a development aid — never
//! enabled by default (§5: "This is for development, not production").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use std::time::Duration;

static BLOCKED: AtomicBool = AtomicBool::new(false);
static HANDLER_INSTALLED: Once = Once::new();

extern "C" fn on_alarm(_signum: libc::c_int) {
    // Async-signal-safe: a single atomic store, nothing else.
    BLOCKED.store(true, Ordering::SeqCst);
}

fn ensure_handler_installed() {
    HANDLER_INSTALLED.call_once(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_alarm as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        libc::sigaction(libc::SIGALRM, &action, std::ptr::null_mut());
    });
}

/// Guards one callback invocation: arms a one-shot interval timer on
/// construction, disarms it and reports on drop.
pub(crate) struct BlockingGuard {
    timer: Option<libc::timer_t>,
    label: &'static str,
}

/// Arm the watchdog for `budget` around the callback the caller is about
/// to invoke. Returns `None` (no guard, no-op) if arming the POSIX timer
/// failed — this is a diagnostic aid, not something that should ever turn
/// a callback failure into a hub failure.
pub(crate) fn arm(budget: Duration, label: &'static str) -> Option<BlockingGuard> {
    ensure_handler_installed();
    BLOCKED.store(false, Ordering::SeqCst);

    let mut sev: libc::sigevent = unsafe { std::mem::zeroed() };
    sev.sigev_notify = libc::SIGEV_SIGNAL;
    sev.sigev_signo = libc::SIGALRM;

    let mut timer_id: libc::timer_t = std::ptr::null_mut();
    let rc = unsafe { libc::timer_create(libc::CLOCK_MONOTONIC, &mut sev, &mut timer_id) };
    if rc != 0 {
        log::warn!("greenhub: failed to arm blocking-detection timer: {rc}");
        return None;
    }

    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: budget.as_secs() as libc::time_t,
            tv_nsec: budget.subsec_nanos() as libc::c_long,
        },
    };
    let rc = unsafe { libc::timer_settime(timer_id, 0, &spec, std::ptr::null_mut()) };
    if rc != 0 {
        unsafe { libc::timer_delete(timer_id) };
        log::warn!("greenhub: failed to start blocking-detection timer: {rc}");
        return None;
    }

    Some(BlockingGuard {
        timer: Some(timer_id),
        label,
    })
}

impl Drop for BlockingGuard {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            unsafe {
                // Disarm before deleting so a signal can't land between.
                let disarm = libc::itimerspec {
                    it_interval: libc::timespec {
                        tv_sec: 0,
                        tv_nsec: 0,
                    },
                    it_value: libc::timespec {
                        tv_sec: 0,
                        tv_nsec: 0,
                    },
                };
                libc::timer_settime(timer, 0, &disarm, std::ptr::null_mut());
                libc::timer_delete(timer);
            }
        }
        if BLOCKED.swap(false, Ordering::SeqCst) {
            log::warn!(
                "greenhub: callback `{}` exceeded its blocking-detection budget",
                self.label
            );
        }
    }
}
