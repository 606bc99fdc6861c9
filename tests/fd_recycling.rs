//! End-to-end coverage for the fd-recycling defang protocol (§4.1): a task
//! parked in `trampoline` on a descriptor that gets recycled underneath it
//! (`notify_opened`) sees `HubError::IoClosed` instead of hanging forever.

use std::cell::RefCell;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use greenhub::{notify_opened, schedule_call_global, trampoline, Event, HubError};

mod util;

#[test]
fn a_recycled_fd_wakes_its_waiter_with_io_closed() {
    // Nothing ever becomes readable on this fd; the only thing that should
    // ever resolve the trampoline is the recycling notification below.
    let (_a, b) = UnixStream::pair().unwrap();
    let fileno = b.as_raw_fd();

    let mut hub = util::poll_hub();
    let handle = hub.handle();
    let outcome = Rc::new(RefCell::new(None));
    let outcome2 = Rc::clone(&outcome);

    hub.spawn(async move {
        let result = trampoline(&handle, &b, Event::Read, None).await;
        *outcome2.borrow_mut() = Some(result);
    });

    // Scheduled so it lands after the task's first poll has registered its
    // listener; `notify_opened` on a not-yet-registered fd is a no-op.
    let handle_for_notify = hub.handle();
    let handle_for_schedule = handle_for_notify.clone();
    schedule_call_global(
        &handle_for_schedule,
        Duration::from_millis(5),
        Box::new(move || notify_opened(&handle_for_notify, fileno)),
    );

    hub.run().unwrap();
    match outcome.borrow().as_ref() {
        Some(Err(HubError::IoClosed(_))) => {}
        other => panic!("expected IoClosed, got {other:?}"),
    }
}
