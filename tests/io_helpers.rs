mod common;

use common::{init_test_logging, wait_until};
use fiberloop::fiber::pending_output_len;
use fiberloop::io::{
    connect, connect_timeout, flush_output, flush_output_timeout, read_at_least,
    read_at_least_timeout, read_full, read_full_timeout, sleep, unwait, wait_for, wait_for_child,
    wait_for_timeout, write_full, write_full_timeout,
};
use fiberloop::{Error, Fiber, Interest, Runtime, add_iov, call, current, raise};
use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::process::Command;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

const PATIENCE: Duration = Duration::from_secs(5);

fn fiber_end() -> (OwnedFd, UnixStream) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    ours.set_nonblocking(true).unwrap();
    (OwnedFd::from(ours), theirs)
}

#[test]
fn read_at_least_waits_for_enough_bytes() {
    init_test_logging();
    let mut rt = Runtime::new().unwrap();
    let (fd, mut peer) = fiber_end();

    let received = rt
        .block_on(async move {
            let result = Rc::new(RefCell::new(None));
            let slot = result.clone();
            let reader = Fiber::create("reader", Some(fd), 0, async move {
                let mut buf = Vec::new();
                let count = read_at_least(&mut buf, 10).await?;
                *slot.borrow_mut() = Some((count, buf));
                Ok(())
            });

            call(&reader);
            peer.write_all(b"hello ").unwrap();
            sleep(Duration::from_millis(20)).await.unwrap();
            assert!(result.borrow().is_none());

            peer.write_all(b"world").unwrap();
            assert!(wait_until(|| reader.is_zombie(), PATIENCE).await);
            result.borrow_mut().take()
        })
        .unwrap();

    assert_eq!(received, Some((11, b"hello world".to_vec())));
}

#[test]
fn read_at_least_returns_short_count_at_end_of_stream() {
    let mut rt = Runtime::new().unwrap();
    let (fd, mut peer) = fiber_end();
    peer.write_all(b"abc").unwrap();
    drop(peer);

    let received = rt
        .block_on(async move {
            let result = Rc::new(RefCell::new(None));
            let slot = result.clone();
            let reader = Fiber::create("reader", Some(fd), 0, async move {
                let mut buf = b">".to_vec();
                let count = read_at_least(&mut buf, 10).await?;
                *slot.borrow_mut() = Some((count, buf));
                Ok(())
            });

            call(&reader);
            assert!(wait_until(|| reader.is_zombie(), PATIENCE).await);
            result.borrow_mut().take()
        })
        .unwrap();

    assert_eq!(received, Some((3, b">abc".to_vec())));
}

#[test]
fn write_full_and_read_full_exchange_exact_sizes() {
    let mut rt = Runtime::new().unwrap();
    let (fd, mut peer) = fiber_end();

    let echo = thread::spawn(move || {
        let mut request = [0u8; 4];
        peer.read_exact(&mut request).unwrap();
        peer.write_all(b"pong").unwrap();
        request
    });

    let reply = rt
        .block_on(async move {
            let result = Rc::new(RefCell::new(None));
            let slot = result.clone();
            let client = Fiber::create("client", Some(fd), 0, async move {
                assert_eq!(write_full(b"ping").await?, 4);
                let mut reply = [0u8; 4];
                assert_eq!(read_full(&mut reply).await?, 4);
                *slot.borrow_mut() = Some(reply);
                Ok(())
            });

            call(&client);
            assert!(wait_until(|| client.is_zombie(), PATIENCE).await);
            result.borrow_mut().take()
        })
        .unwrap();

    assert_eq!(&echo.join().unwrap(), b"ping");
    assert_eq!(reply.as_ref().map(|r| &r[..]), Some(&b"pong"[..]));
}

#[test]
fn flush_output_writes_everything_queued() {
    const CHUNK: usize = 64 * 1024;
    const CHUNKS: usize = 16;

    let mut rt = Runtime::new().unwrap();
    let (fd, mut peer) = fiber_end();

    let drain = thread::spawn(move || {
        let mut all = Vec::new();
        peer.read_to_end(&mut all).unwrap();
        all
    });

    let written = rt
        .block_on(async move {
            let result = Rc::new(RefCell::new(None));
            let slot = result.clone();
            let writer = Fiber::create("writer", Some(fd), 0, async move {
                for i in 0..CHUNKS {
                    add_iov(&vec![i as u8; CHUNK]);
                }
                assert_eq!(pending_output_len(), CHUNK * CHUNKS);

                let written = flush_output().await?;
                assert_eq!(pending_output_len(), 0);
                *slot.borrow_mut() = Some(written);
                Ok(())
            });

            call(&writer);
            assert!(wait_until(|| writer.is_zombie(), PATIENCE).await);
            result.borrow_mut().take()
        })
        .unwrap();

    let all = drain.join().unwrap();
    assert_eq!(written, Some(CHUNK * CHUNKS));
    assert_eq!(all.len(), CHUNK * CHUNKS);
    assert!(all[..CHUNK].iter().all(|b| *b == 0));
    assert!(all[CHUNK * (CHUNKS - 1)..].iter().all(|b| *b == 15));
}

#[test]
fn flush_output_to_vanished_peer_reports_unsent_bytes() {
    let mut rt = Runtime::new().unwrap();
    let (fd, peer) = fiber_end();
    drop(peer);

    let outcome = rt
        .block_on(async move {
            let result = Rc::new(RefCell::new(None));
            let slot = result.clone();
            let writer = Fiber::create("writer", Some(fd), 0, async move {
                add_iov(b"lost ");
                add_iov(b"bytes");
                let outcome = flush_output().await;
                *slot.borrow_mut() = Some((outcome, pending_output_len()));
                Ok(())
            });

            call(&writer);
            assert!(wait_until(|| writer.is_zombie(), PATIENCE).await);
            result.borrow_mut().take()
        })
        .unwrap();

    let (outcome, left) = outcome.unwrap();
    assert!(matches!(outcome, Err(Error::Unsent { unsent: 10, .. })));
    assert_eq!(left, 0);
}

#[test]
fn connect_makes_socket_the_fiber_descriptor() {
    let mut rt = Runtime::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();

    rt.block_on(async move {
        let client = Fiber::create("client", None, 0, async move {
            connect(address).await?;
            assert!(current().fd().is_some());
            write_full(b"hi").await?;
            Ok(())
        });

        call(&client);
        assert!(wait_until(|| client.is_zombie(), PATIENCE).await);
    })
    .unwrap();

    let (mut accepted, _) = listener.accept().unwrap();
    let mut greeting = Vec::new();
    accepted.read_to_end(&mut greeting).unwrap();
    assert_eq!(greeting, b"hi");
}

#[test]
fn refused_connect_leaves_no_descriptor() {
    let mut rt = Runtime::new().unwrap();
    let address = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let (failed, fd) = rt
        .block_on(async move {
            let result = Rc::new(RefCell::new(None));
            let slot = result.clone();
            let client = Fiber::create("client", None, 0, async move {
                let outcome = connect(address).await;
                let failed = matches!(outcome, Err(Error::Io { .. }));
                *slot.borrow_mut() = Some((failed, current().fd()));
                Ok(())
            });

            call(&client);
            assert!(wait_until(|| client.is_zombie(), PATIENCE).await);
            result.borrow_mut().take().unwrap()
        })
        .unwrap();

    assert!(failed);
    assert_eq!(fd, None);
}

#[test]
fn wait_for_without_descriptor_fails() {
    let mut rt = Runtime::new().unwrap();

    let outcome = rt
        .block_on(async { wait_for(Interest::READ).await })
        .unwrap();

    assert!(matches!(outcome, Err(Error::Io { .. })));
}

#[test]
fn unwait_lets_a_readable_fiber_rest() {
    let mut rt = Runtime::new().unwrap();
    let (fd, mut peer) = fiber_end();

    rt.block_on(async move {
        let wakeups = Rc::new(RefCell::new(0));
        let counter = wakeups.clone();
        let waiter = Fiber::create("waiter", Some(fd), 0, async move {
            wait_for(Interest::READ).await?;
            *counter.borrow_mut() += 1;
            unwait(Interest::all());
            fiberloop::yield_now().await?;
            *counter.borrow_mut() += 1;
            Ok(())
        });

        call(&waiter);
        peer.write_all(b"x").unwrap();
        assert!(wait_until(|| *wakeups.borrow() == 1, PATIENCE).await);

        // Still readable, but nothing is armed any more.
        sleep(Duration::from_millis(30)).await.unwrap();
        assert_eq!(*wakeups.borrow(), 1);
        assert!(!waiter.is_zombie());

        call(&waiter);
        assert!(waiter.is_zombie());
        drop(peer);
    })
    .unwrap();
}

#[test]
fn sleep_suspends_for_at_least_the_duration() {
    let mut rt = Runtime::new().unwrap();

    let elapsed = rt
        .block_on(async {
            let started = Instant::now();
            sleep(Duration::from_millis(30)).await.unwrap();
            let elapsed = started.elapsed();
            sleep(Duration::ZERO).await.unwrap();
            elapsed
        })
        .unwrap();

    assert!(elapsed >= Duration::from_millis(30));
}

#[test]
fn raise_cuts_a_sleep_short() {
    let mut rt = Runtime::new().unwrap();

    let signal = rt
        .block_on(async {
            let result = Rc::new(RefCell::new(None));
            let slot = result.clone();
            let sleeper = Fiber::create("sleeper", None, 0, async move {
                let outcome = sleep(Duration::from_secs(60)).await;
                *slot.borrow_mut() = outcome.err().and_then(|err| err.raised_signal());
                Ok(())
            });

            call(&sleeper);
            raise(&sleeper, 14);
            assert!(sleeper.is_zombie());
            result.borrow_mut().take()
        })
        .unwrap();

    assert_eq!(signal, Some(14));
}

#[test]
fn wait_for_child_reports_exit_code() {
    let mut rt = Runtime::new().unwrap();
    let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
    let pid = child.id() as libc::pid_t;

    let status = rt.block_on(wait_for_child(pid)).unwrap().unwrap();

    assert_eq!(status, 3);
}

#[test]
fn wait_for_child_reports_fatal_signal() {
    let mut rt = Runtime::new().unwrap();
    let child = Command::new("sh").args(["-c", "kill -9 $$"]).spawn().unwrap();
    let pid = child.id() as libc::pid_t;

    let status = rt.block_on(wait_for_child(pid)).unwrap().unwrap();

    assert_eq!(status, 128 + 9);
}

#[test]
fn read_at_least_timeout_keeps_early_bytes() {
    let mut rt = Runtime::new().unwrap();
    let (fd, mut peer) = fiber_end();
    peer.write_all(b"early").unwrap();

    let (timed_out, buf, elapsed) = rt
        .block_on(async move {
            let result = Rc::new(RefCell::new(None));
            let slot = result.clone();
            let reader = Fiber::create("reader", Some(fd), 0, async move {
                let started = Instant::now();
                let mut buf = Vec::new();
                let outcome = read_at_least_timeout(&mut buf, 64, Duration::from_millis(30)).await;
                let timed_out = matches!(&outcome, Err(err) if err.is_timeout());
                *slot.borrow_mut() = Some((timed_out, buf, started.elapsed()));
                Ok(())
            });

            call(&reader);
            assert!(wait_until(|| reader.is_zombie(), PATIENCE).await);
            // The peer is still open: only the deadline ended the read.
            drop(peer);
            result.borrow_mut().take().unwrap()
        })
        .unwrap();

    assert!(timed_out);
    assert_eq!(buf, b"early");
    assert!(elapsed >= Duration::from_millis(30));
}

#[test]
fn read_full_timeout_succeeds_before_the_deadline() {
    let mut rt = Runtime::new().unwrap();
    let (fd, mut peer) = fiber_end();

    let received = rt
        .block_on(async move {
            let result = Rc::new(RefCell::new(None));
            let slot = result.clone();
            let reader = Fiber::create("reader", Some(fd), 0, async move {
                let mut buf = [0u8; 4];
                let count = read_full_timeout(&mut buf, PATIENCE).await?;
                *slot.borrow_mut() = Some((count, buf));
                Ok(())
            });

            call(&reader);
            peer.write_all(b"done").unwrap();
            assert!(wait_until(|| reader.is_zombie(), PATIENCE).await);
            result.borrow_mut().take()
        })
        .unwrap();

    assert_eq!(received, Some((4, *b"done")));
}

#[test]
fn write_full_timeout_gives_up_on_a_stuck_peer() {
    let mut rt = Runtime::new().unwrap();
    let (fd, peer) = fiber_end();

    let timed_out = rt
        .block_on(async move {
            let result = Rc::new(RefCell::new(None));
            let slot = result.clone();
            let writer = Fiber::create("writer", Some(fd), 0, async move {
                // Far more than a socket buffer; the peer never reads.
                let payload = vec![7u8; 16 * 1024 * 1024];
                let outcome = write_full_timeout(&payload, Duration::from_millis(30)).await;
                *slot.borrow_mut() = Some(matches!(&outcome, Err(err) if err.is_timeout()));
                Ok(())
            });

            call(&writer);
            assert!(wait_until(|| writer.is_zombie(), PATIENCE).await);
            drop(peer);
            result.borrow_mut().take()
        })
        .unwrap();

    assert_eq!(timed_out, Some(true));
}

#[test]
fn flush_output_timeout_discards_what_is_left() {
    let mut rt = Runtime::new().unwrap();
    let (fd, peer) = fiber_end();

    let (outcome, left) = rt
        .block_on(async move {
            let result = Rc::new(RefCell::new(None));
            let slot = result.clone();
            let writer = Fiber::create("writer", Some(fd), 0, async move {
                for _ in 0..64 {
                    add_iov(&vec![1u8; 256 * 1024]);
                }
                let outcome = flush_output_timeout(Duration::from_millis(30)).await;
                *slot.borrow_mut() = Some((outcome, pending_output_len()));
                Ok(())
            });

            call(&writer);
            assert!(wait_until(|| writer.is_zombie(), PATIENCE).await);
            drop(peer);
            result.borrow_mut().take().unwrap()
        })
        .unwrap();

    let err = outcome.unwrap_err();
    assert!(err.is_timeout());
    assert!(matches!(err, Error::Unsent { unsent, .. } if unsent > 0));
    assert_eq!(left, 0);
}

#[test]
fn wait_for_timeout_reports_readiness_or_deadline() {
    let mut rt = Runtime::new().unwrap();
    let (fd, mut peer) = fiber_end();

    let outcomes = rt
        .block_on(async move {
            let outcomes = Rc::new(RefCell::new(Vec::new()));
            let sink = outcomes.clone();
            let waiter = Fiber::create("waiter", Some(fd), 0, async move {
                let quiet = wait_for_timeout(Interest::READ, Duration::from_millis(20)).await;
                sink.borrow_mut().push(matches!(&quiet, Err(err) if err.is_timeout()));

                // Suspended until called again.
                fiberloop::yield_now().await?;
                let ready = wait_for_timeout(Interest::READ, PATIENCE).await;
                sink.borrow_mut().push(ready.is_ok());
                Ok(())
            });

            call(&waiter);
            assert!(wait_until(|| outcomes.borrow().len() == 1, PATIENCE).await);
            // A timed-out wait leaves nothing armed behind it.
            peer.write_all(b"x").unwrap();
            sleep(Duration::from_millis(20)).await.unwrap();
            assert_eq!(outcomes.borrow().len(), 1);

            call(&waiter);
            assert!(wait_until(|| waiter.is_zombie(), PATIENCE).await);
            outcomes.borrow().clone()
        })
        .unwrap();

    assert_eq!(outcomes, vec![true, true]);
}

#[test]
fn connect_timeout_connects_within_the_deadline() {
    let mut rt = Runtime::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();

    rt.block_on(async move {
        let client = Fiber::create("client", None, 0, async move {
            connect_timeout(address, PATIENCE).await?;
            write_full(b"on time").await?;
            Ok(())
        });

        call(&client);
        assert!(wait_until(|| client.is_zombie(), PATIENCE).await);
    })
    .unwrap();

    let (mut accepted, _) = listener.accept().unwrap();
    let mut greeting = Vec::new();
    accepted.read_to_end(&mut greeting).unwrap();
    assert_eq!(greeting, b"on time");
}
