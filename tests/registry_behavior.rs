//! End-to-end coverage for secondary-listener FIFO promotion (§4.1): with
//! the multiple-waiters guard relaxed, a second reader on the same fd
//! queues behind the first and only gets its turn once the first has read
//! and dropped its trampoline.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use greenhub::{schedule_call_global, trampoline, Event};

mod util;

#[test]
fn secondary_reader_is_promoted_in_fifo_order() {
    let (a, b) = UnixStream::pair().unwrap();
    a.write_all(b"A").unwrap();

    let mut hub = util::poll_hub_with_secondary_waiters();
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

    // Fires only once the first byte has been consumed and the second
    // listener has taken over as primary.
    let a = RefCell::new(a);
    schedule_call_global(
        &handle,
        Duration::from_millis(5),
        Box::new(move || a.borrow_mut().write_all(b"B").unwrap()),
    );

    hub.run().unwrap();
    assert_eq!(*order.borrow(), vec![('1', b'A'), ('2', b'B')]);
}
