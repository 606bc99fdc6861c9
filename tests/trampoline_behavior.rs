//! End-to-end coverage for `trampoline`: readiness resuming a waiting task,
//! a timeout firing when nothing ever becomes ready, and readiness winning
//! a race against an about-to-expire timeout.

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use greenhub::{trampoline, Event, HubError};

mod util;

#[test]
fn readiness_resumes_a_waiting_task() {
    let (mut a, b) = UnixStream::pair().unwrap();
    a.write_all(b"x").unwrap();

    let mut hub = util::poll_hub();
    let handle = hub.handle();
    let read_byte = Rc::new(Cell::new(0u8));
    let read_byte2 = Rc::clone(&read_byte);

    hub.spawn(async move {
        let mut b = b;
        let outcome = trampoline(&handle, &b, Event::Read, None).await;
        assert!(outcome.is_ok(), "expected readiness, got {outcome:?}");
        let mut buf = [0u8; 1];
        b.read_exact(&mut buf).unwrap();
        read_byte2.set(buf[0]);
    });

    hub.run().unwrap();
    assert_eq!(read_byte.get(), b'x');
}

#[test]
fn timeout_fires_when_nothing_becomes_ready() {
    let (_a, b) = UnixStream::pair().unwrap();

    let mut hub = util::poll_hub();
    let handle = hub.handle();
    let outcome = Rc::new(RefCell::new(None));
    let outcome2 = Rc::clone(&outcome);

    hub.spawn(async move {
        let result = trampoline(&handle, &b, Event::Read, Some(Duration::from_millis(20))).await;
        *outcome2.borrow_mut() = Some(result);
    });

    hub.run().unwrap();
    match outcome.borrow().as_ref() {
        Some(Err(HubError::Timeout)) => {}
        other => panic!("expected Timeout, got {other:?}"),
    }
}

#[test]
fn readiness_wins_a_race_against_an_about_to_expire_timeout() {
    let (mut a, b) = UnixStream::pair().unwrap();
    a.write_all(b"x").unwrap();

    let mut hub = util::poll_hub();
    let handle = hub.handle();
    let outcome = Rc::new(RefCell::new(None));
    let outcome2 = Rc::clone(&outcome);

    hub.spawn(async move {
        // The fd is already readable, so even a timeout scheduled in
        // parallel should lose the race: the first tick's `wait` reports
        // readiness before any timer could have fired.
        let result =
            trampoline(&handle, &b, Event::Read, Some(Duration::from_secs(30))).await;
        *outcome2.borrow_mut() = Some(result);
    });

    hub.run().unwrap();
    assert!(matches!(outcome.borrow().as_ref(), Some(Ok(()))));
}
