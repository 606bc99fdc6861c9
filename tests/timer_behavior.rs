//! Coverage for `schedule_call_global`/`schedule_call_local`: ordering,
//! idempotent cancellation, and auto-cancellation when the owning task dies.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use greenhub::{schedule_call_global, schedule_call_local, sleep};

mod util;

#[test]
fn timers_fire_in_scheduled_order() {
    let mut hub = util::poll_hub();
    let handle = hub.handle();
    let order = Rc::new(RefCell::new(Vec::new()));

    for id in [3u32, 1, 2] {
        let order = Rc::clone(&order);
        let delay = Duration::from_millis(5 * id as u64);
        schedule_call_global(&handle, delay, Box::new(move || order.borrow_mut().push(id)));
    }

    hub.run().unwrap();
    assert_eq!(*order.borrow(), vec![1, 2, 3]);
}

#[test]
fn a_cancelled_timer_never_fires() {
    let mut hub = util::poll_hub();
    let handle = hub.handle();
    let fired = Rc::new(RefCell::new(false));
    let fired2 = Rc::clone(&fired);

    let timer = schedule_call_global(
        &handle,
        Duration::from_millis(10),
        Box::new(move || *fired2.borrow_mut() = true),
    );
    timer.cancel();
    timer.cancel(); // idempotent

    // Give the hub something else to do so it doesn't idle out instantly
    // with nothing scheduled at all.
    hub.spawn({
        let handle = handle.clone();
        async move {
            sleep(&handle, Duration::from_millis(20)).await;
        }
    });

    hub.run().unwrap();
    assert!(!*fired.borrow());
}

#[test]
fn a_local_timer_is_suppressed_once_its_owning_task_is_gone() {
    let mut hub = util::poll_hub();
    let handle = hub.handle();
    let fired = Rc::new(RefCell::new(false));
    let fired2 = Rc::clone(&fired);

    hub.spawn(async move {
        // Scheduled from inside a task that exits immediately afterwards,
        // well before the 10ms delay elapses.
        schedule_call_local(
            &handle,
            Duration::from_millis(10),
            Box::new(move || *fired2.borrow_mut() = true),
        );
    });

    hub.run().unwrap();
    assert!(!*fired.borrow());
}
