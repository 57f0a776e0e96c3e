mod common;

use common::init_test_logging;
use fiberloop::{
    Fiber, Message, Runtime, RuntimeBuilder, call, current, pending_count, raise, read_inbox,
    read_inbox_timeout, write_inbox,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

#[test]
fn full_inbox_refuses_without_changes() {
    init_test_logging();
    let mut rt = Runtime::new().unwrap();

    rt.block_on(async {
        // A ring of three slots holds two messages.
        let idle = Fiber::create("idle", None, 3, async { Ok(()) });

        assert!(write_inbox(&idle, b"m1"));
        assert!(write_inbox(&idle, b"m2"));
        let before = idle.inbox_state();

        assert!(!write_inbox(&idle, b"m3"));
        assert_eq!(idle.inbox_state(), before);
        assert_eq!(pending_count(&idle), 2);

        let sender = current().fid();
        assert_eq!(idle.inbox_messages(), vec![
            Message {
                sender,
                payload: b"m1".to_vec()
            },
            Message {
                sender,
                payload: b"m2".to_vec()
            },
        ]);
    })
    .unwrap();
}

#[test]
fn default_capacity_holds_one_less_than_size() {
    let mut rt = RuntimeBuilder::new()
        .default_inbox_capacity(8)
        .build()
        .unwrap();

    rt.block_on(async {
        let idle = Fiber::create("idle", None, 0, async { Ok(()) });

        let accepted = (0..10).filter(|i| write_inbox(&idle, &[*i as u8])).count();
        assert_eq!(accepted, 7);
    })
    .unwrap();
}

#[test]
fn blocked_reader_runs_before_write_returns() {
    let mut rt = Runtime::new().unwrap();
    let events = Rc::new(RefCell::new(Vec::new()));

    let log = events.clone();
    rt.block_on(async move {
        let reader_log = log.clone();
        let reader = Fiber::create("reader", None, 0, async move {
            loop {
                let message = read_inbox().await?;
                reader_log
                    .borrow_mut()
                    .push(format!("read {}", String::from_utf8_lossy(&message.payload)));
                if message.payload == b"stop" {
                    return Ok(());
                }
            }
        });

        call(&reader);
        assert!(reader.is_reading_inbox());

        log.borrow_mut().push("write a".to_owned());
        assert!(write_inbox(&reader, b"a"));
        log.borrow_mut().push("write stop".to_owned());
        assert!(write_inbox(&reader, b"stop"));
        log.borrow_mut().push("done".to_owned());

        assert!(reader.is_zombie());
    })
    .unwrap();

    assert_eq!(*events.borrow(), vec![
        "write a", "read a", "write stop", "read stop", "done"
    ]);
}

#[test]
fn messages_arrive_in_order_with_sender_ids() {
    let mut rt = Runtime::new().unwrap();

    rt.block_on(async {
        let main = current();
        let received = Rc::new(RefCell::new(Vec::new()));

        let sink = received.clone();
        let reader = Fiber::create("reader", None, 0, async move {
            for _ in 0..4 {
                let message = read_inbox().await?;
                sink.borrow_mut().push((message.sender, message.payload));
            }
            Ok(())
        });

        let target = reader.clone();
        let first = Fiber::create("writer-a", None, 0, async move {
            write_inbox(&target, b"a1");
            write_inbox(&target, b"a2");
            Ok(())
        });
        let target = reader.clone();
        let second = Fiber::create("writer-b", None, 0, async move {
            write_inbox(&target, b"b1");
            Ok(())
        });
        let (a, b) = (first.fid(), second.fid());

        // Queue before the reader ever runs, then let it drain.
        call(&first);
        call(&second);
        write_inbox(&reader, b"m1");
        call(&reader);

        assert_eq!(*received.borrow(), vec![
            (a, b"a1".to_vec()),
            (a, b"a2".to_vec()),
            (b, b"b1".to_vec()),
            (main.fid(), b"m1".to_vec()),
        ]);
    })
    .unwrap();
}

#[test]
fn payload_is_copied_on_write() {
    let mut rt = Runtime::new().unwrap();

    rt.block_on(async {
        let idle = Fiber::create("idle", None, 0, async { Ok(()) });
        let mut payload = b"original".to_vec();

        write_inbox(&idle, &payload);
        payload.copy_from_slice(b"mutated!");

        assert_eq!(idle.inbox_messages()[0].payload, b"original");
    })
    .unwrap();
}

#[test]
fn raise_interrupts_read_inbox() {
    let mut rt = Runtime::new().unwrap();
    let signal = Rc::new(RefCell::new(None));

    let seen = signal.clone();
    rt.block_on(async move {
        let reader = Fiber::create("reader", None, 0, async move {
            if let Err(err) = read_inbox().await {
                *seen.borrow_mut() = err.raised_signal();
            }
            Ok(())
        });

        call(&reader);
        raise(&reader, 2);
        assert!(!reader.is_reading_inbox());
    })
    .unwrap();

    assert_eq!(*signal.borrow(), Some(2));
}

#[test]
fn zombie_inbox_is_emptied() {
    let mut rt = Runtime::new().unwrap();

    rt.block_on(async {
        let worker = Fiber::create("worker", None, 0, async {
            read_inbox().await?;
            Ok(())
        });
        write_inbox(&worker, b"first");
        write_inbox(&worker, b"left over");
        call(&worker);

        assert!(worker.is_zombie());
        assert_eq!(pending_count(&worker), 0);
    })
    .unwrap();
}

#[test]
fn reading_frees_room_for_later_writes() {
    let mut rt = Runtime::new().unwrap();

    rt.block_on(async {
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = received.clone();
        let a = Fiber::create("a", None, 3, async move {
            for _ in 0..3 {
                let message = read_inbox().await?;
                sink.borrow_mut().push(message.payload);
            }
            Ok(())
        });

        let target = a.clone();
        let b = Fiber::create("b", None, 0, async move {
            assert!(write_inbox(&target, b"x1"));
            assert!(write_inbox(&target, b"x2"));
            assert!(!write_inbox(&target, b"x3"));
            Ok(())
        });

        call(&b);
        call(&a);
        assert_eq!(*received.borrow(), vec![b"x1".to_vec(), b"x2".to_vec()]);
        assert!(a.is_reading_inbox());

        assert!(write_inbox(&a, b"x4"));
        assert_eq!(*received.borrow(), vec![
            b"x1".to_vec(),
            b"x2".to_vec(),
            b"x4".to_vec()
        ]);
        assert!(a.is_zombie());
    })
    .unwrap();
}

#[test]
fn read_inbox_timeout_expires_on_an_empty_inbox() {
    let mut rt = Runtime::new().unwrap();

    let outcomes = rt
        .block_on(async {
            let outcomes = Rc::new(RefCell::new(Vec::new()));
            let sink = outcomes.clone();
            let reader = Fiber::create("reader", None, 0, async move {
                let first = read_inbox_timeout(Duration::from_millis(10)).await;
                sink.borrow_mut()
                    .push(first.map(|m| m.payload).map_err(|err| err.is_timeout()));
                let second = read_inbox_timeout(Duration::from_secs(60)).await;
                sink.borrow_mut()
                    .push(second.map(|m| m.payload).map_err(|err| err.is_timeout()));
                Ok(())
            });

            call(&reader);
            assert!(reader.is_reading_inbox());
            while outcomes.borrow().is_empty() {
                fiberloop::io::sleep(Duration::from_millis(5)).await.unwrap();
            }
            assert!(reader.is_reading_inbox());

            assert!(write_inbox(&reader, b"late"));
            assert!(reader.is_zombie());
            outcomes.borrow().clone()
        })
        .unwrap();

    assert_eq!(outcomes, vec![Err(true), Ok(b"late".to_vec())]);
}
