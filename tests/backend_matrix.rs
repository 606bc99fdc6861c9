//! A shared scenario run against every backend this platform can build
//! (`select`, `poll`, `epoll`, `kqueue`, `timerfd`), so a bug specific to
//! one backend's mask translation — register/modify/unregister, or the
//! read/write/error bits a `wait` call reports — doesn't hide behind the
//! other suites always pinning `Config::builder().backend("poll")`.
//! Backends unavailable on the current OS (or gated behind a disabled
//! Cargo feature) are skipped rather than failed.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use greenhub::{schedule_call_global, trampoline, Event};

mod util;

#[test]
fn readiness_round_trip_across_backends() {
    let mut ran = 0;
    for &backend in util::ALL_BACKENDS {
        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(b"x").unwrap();

        let Some(mut hub) = util::try_hub(backend) else {
            continue;
        };
        ran += 1;
        let handle = hub.handle();
        let read_byte = Rc::new(RefCell::new(0u8));
        let read_byte2 = Rc::clone(&read_byte);

        hub.spawn(async move {
            let mut b = b;
            let outcome = trampoline(&handle, &b, Event::Read, None).await;
            assert!(outcome.is_ok(), "{backend}: expected readiness, got {outcome:?}");
            let mut buf = [0u8; 1];
            b.read_exact(&mut buf).unwrap();
            *read_byte2.borrow_mut() = buf[0];
        });

        hub.run().unwrap_or_else(|e| panic!("{backend}: hub.run failed: {e}"));
        assert_eq!(*read_byte.borrow(), b'x', "backend {backend}");
    }
    assert!(ran > 0, "no backend in ALL_BACKENDS was constructible on this platform");
}

#[test]
fn read_and_write_masks_both_fire_on_the_same_fd_across_backends() {
    let mut ran = 0;
    for &backend in util::ALL_BACKENDS {
        let (a, b) = UnixStream::pair().unwrap();

        let Some(mut hub) = util::try_hub(backend) else {
            continue;
        };
        ran += 1;
        let handle = hub.handle();
        let saw_read = Rc::new(RefCell::new(false));
        let saw_write = Rc::new(RefCell::new(false));

        // The write side is ready the instant it's registered (an empty
        // socket send buffer is always writable); this exercises `modify`
        // growing the fd's subscription from READABLE to READABLE|WRITABLE
        // once the read listener is added right after.
        hub.spawn({
            let handle = handle.clone();
            let saw_write = Rc::clone(&saw_write);
            async move {
                let mut a = a;
                trampoline(&handle, &a, Event::Write, None)
                    .await
                    .unwrap_or_else(|e| panic!("{backend}: write readiness failed: {e:?}"));
                *saw_write.borrow_mut() = true;
                a.write_all(b"y").unwrap();
            }
        });

        hub.spawn({
            let handle = handle.clone();
            let saw_read = Rc::clone(&saw_read);
            let mut b = b;
            async move {
                trampoline(&handle, &b, Event::Read, None)
                    .await
                    .unwrap_or_else(|e| panic!("{backend}: read readiness failed: {e:?}"));
                let mut buf = [0u8; 1];
                b.read_exact(&mut buf).unwrap();
                *saw_read.borrow_mut() = true;
            }
        });

        hub.run().unwrap_or_else(|e| panic!("{backend}: hub.run failed: {e}"));
        assert!(*saw_write.borrow(), "backend {backend}: write listener never fired");
        assert!(*saw_read.borrow(), "backend {backend}: read listener never fired");
    }
    assert!(ran > 0, "no backend in ALL_BACKENDS was constructible on this platform");
}

#[test]
fn secondary_reader_promotion_across_backends() {
    let mut ran = 0;
    for &backend in util::ALL_BACKENDS {
        let (a, b) = UnixStream::pair().unwrap();
        a.write_all(b"A").unwrap();

        let Some(mut hub) = util::try_hub_with_secondary_waiters(backend) else {
            continue;
        };
        ran += 1;
        let handle = hub.handle();
        let b = Rc::new(b);
        let order = Rc::new(RefCell::new(Vec::new()));

        hub.spawn({
            let handle = handle.clone();
            let b = Rc::clone(&b);
            let order = Rc::clone(&order);
            async move {
                trampoline(&handle, &*b, Event::Read, None).await.unwrap();
                let mut buf = [0u8; 1];
                (&*b).read_exact(&mut buf).unwrap();
                order.borrow_mut().push(('1', buf[0]));
            }
        });

        hub.spawn({
            let handle = handle.clone();
            let b = Rc::clone(&b);
            let order = Rc::clone(&order);
            async move {
                trampoline(&handle, &*b, Event::Read, None).await.unwrap();
                let mut buf = [0u8; 1];
                (&*b).read_exact(&mut buf).unwrap();
                order.borrow_mut().push(('2', buf[0]));
            }
        });

        let a = RefCell::new(a);
        schedule_call_global(
            &handle,
            Duration::from_millis(5),
            Box::new(move || a.borrow_mut().write_all(b"B").unwrap()),
        );

        hub.run().unwrap_or_else(|e| panic!("{backend}: hub.run failed: {e}"));
        assert_eq!(
            *order.borrow(),
            vec![('1', b'A'), ('2', b'B')],
            "backend {backend}"
        );
    }
    assert!(ran > 0, "no backend in ALL_BACKENDS was constructible on this platform");
}
