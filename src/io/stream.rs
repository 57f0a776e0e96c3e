//! Blocking-style helpers on the current fiber's descriptor.
//!
//! Each helper loops `wait_for` + one system call, retries on `EAGAIN` and
//! `EINTR`, and disarms the watcher before returning.

use crate::error::{Error, Result};
use crate::fiber::current;
use crate::io::sys;
use crate::io::wait::{require_fd, unwait, wait_ready};
use crate::reactor::Interest;
use crate::runtime::{context, deadline_after};

use socket2::{Domain, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::time::{Duration, Instant};
use tracing::{error, trace};

/// Appends to `buf` until it holds at least `at_least` bytes or the peer
/// closes the stream. Returns the number of bytes appended by this call.
///
/// Reads are sized to the runtime's readahead, so `buf` may end up longer
/// than `at_least`. A short count means end of stream, or an error after
/// some bytes had already arrived.
///
/// # Errors
/// The underlying error when nothing could be read at all.
pub async fn read_at_least(buf: &mut Vec<u8>, at_least: usize) -> Result<usize> {
    read_at_least_until(buf, at_least, None).await
}

/// [`read_at_least`] that gives up after `timeout`.
///
/// # Errors
/// A timeout is reported even when some bytes arrived; those bytes are
/// still appended to `buf`.
pub async fn read_at_least_timeout(
    buf: &mut Vec<u8>,
    at_least: usize,
    timeout: Duration,
) -> Result<usize> {
    read_at_least_until(buf, at_least, deadline_after(timeout)).await
}

async fn read_at_least_until(
    buf: &mut Vec<u8>,
    at_least: usize,
    deadline: Option<Instant>,
) -> Result<usize> {
    let fiber = current();
    let fd = require_fd(&fiber)?;
    let readahead = context::scheduler().config().readahead;
    let start = buf.len();

    let outcome = loop {
        if buf.len() >= at_least {
            break Ok(());
        }
        if let Err(err) = wait_ready(Interest::READ, deadline).await {
            break Err(err);
        }

        let filled = buf.len();
        let chunk = readahead.max(at_least - filled);
        buf.resize(filled + chunk, 0);
        let result = sys::read(fd, &mut buf[filled..]);
        buf.truncate(filled + result.as_ref().copied().unwrap_or(0));

        match result {
            Ok(0) => break Ok(()),
            Ok(_) => {}
            Err(err) if sys::is_transient(&err) => {}
            Err(err) => break Err(Error::from(err)),
        }
    };
    unwait(Interest::READ);

    let appended = buf.len() - start;
    match outcome {
        Ok(()) => Ok(appended),
        Err(Error::Io { source }) if appended > 0 && source.kind() != io::ErrorKind::TimedOut => {
            trace!(fd, appended, error = %source, "read interrupted by error");
            Ok(appended)
        }
        Err(err) => Err(err),
    }
}

/// Fills `buf` completely unless the peer closes first. Returns the number
/// of bytes read.
///
/// # Errors
/// The underlying error when nothing could be read at all.
pub async fn read_full(buf: &mut [u8]) -> Result<usize> {
    read_full_until(buf, None).await
}

/// [`read_full`] that gives up after `timeout`. A timeout is reported even
/// when part of `buf` was filled.
pub async fn read_full_timeout(buf: &mut [u8], timeout: Duration) -> Result<usize> {
    read_full_until(buf, deadline_after(timeout)).await
}

async fn read_full_until(buf: &mut [u8], deadline: Option<Instant>) -> Result<usize> {
    let fiber = current();
    let fd = require_fd(&fiber)?;
    let mut done = 0;

    let outcome = loop {
        if done == buf.len() {
            break Ok(());
        }
        if let Err(err) = wait_ready(Interest::READ, deadline).await {
            break Err(err);
        }

        match sys::read(fd, &mut buf[done..]) {
            Ok(0) => break Ok(()),
            Ok(count) => done += count,
            Err(err) if sys::is_transient(&err) => {}
            Err(err) => break Err(Error::from(err)),
        }
    };
    unwait(Interest::READ);

    match outcome {
        Err(Error::Io { source }) if done > 0 && source.kind() != io::ErrorKind::TimedOut => {
            Ok(done)
        }
        Err(err) => Err(err),
        Ok(()) => Ok(done),
    }
}

/// Writes all of `buf` unless the peer goes away. Returns the number of
/// bytes written.
///
/// # Errors
/// The underlying error when nothing could be written at all.
pub async fn write_full(buf: &[u8]) -> Result<usize> {
    write_full_until(buf, None).await
}

/// [`write_full`] that gives up after `timeout`. A timeout is reported even
/// when part of `buf` was written.
pub async fn write_full_timeout(buf: &[u8], timeout: Duration) -> Result<usize> {
    write_full_until(buf, deadline_after(timeout)).await
}

async fn write_full_until(buf: &[u8], deadline: Option<Instant>) -> Result<usize> {
    let fiber = current();
    let fd = require_fd(&fiber)?;
    let mut done = 0;

    let outcome = loop {
        if done == buf.len() {
            break Ok(());
        }
        if let Err(err) = wait_ready(Interest::WRITE, deadline).await {
            break Err(err);
        }

        match sys::write(fd, &buf[done..]) {
            Ok(count) => done += count,
            Err(err) if sys::is_transient(&err) => {}
            Err(err) => break Err(Error::from(err)),
        }
    };
    unwait(Interest::WRITE);

    match outcome {
        Err(Error::Io { source }) if done > 0 && source.kind() != io::ErrorKind::TimedOut => {
            Ok(done)
        }
        Err(err) => Err(err),
        Ok(()) => Ok(done),
    }
}

/// Writes everything queued with [`add_iov`](crate::fiber::add_iov), using
/// gathered writes and trimming partially written buffers.
///
/// Returns the number of bytes written. The queue is empty afterwards in
/// every case.
///
/// # Errors
/// [`Error::Unsent`] when the descriptor fails for good; the remaining
/// bytes are discarded and logged.
pub async fn flush_output() -> Result<usize> {
    flush_output_until(None).await
}

/// [`flush_output`] that gives up after `timeout`.
///
/// # Errors
/// On timeout the remaining bytes are discarded as for any other failure;
/// the [`Error::Unsent`] carries a `TimedOut` source.
pub async fn flush_output_timeout(timeout: Duration) -> Result<usize> {
    flush_output_until(deadline_after(timeout)).await
}

async fn flush_output_until(deadline: Option<Instant>) -> Result<usize> {
    let fiber = current();
    let fd = require_fd(&fiber)?;
    let mut written = 0;

    let outcome = loop {
        if !fiber.has_pending_output() {
            break Ok(());
        }
        if let Err(err) = wait_ready(Interest::WRITE, deadline).await {
            break Err(err);
        }

        match fiber.write_pending(fd) {
            Ok(count) => written += count,
            Err(err) if sys::is_transient(&err) => {}
            Err(err) => break Err(Error::from(err)),
        }
    };
    unwait(Interest::WRITE);

    let unsent = fiber.discard_output();
    match outcome {
        Ok(()) => Ok(written),
        Err(Error::Io { source }) => {
            error!(
                fid = fiber.fid(),
                unsent,
                error = %source,
                "client unexpectedly gone, {unsent} bytes unwritten"
            );
            Err(Error::Unsent { unsent, source })
        }
        Err(err) => Err(err),
    }
}

/// Opens a non-blocking TCP connection to `address` and makes it the current
/// fiber's descriptor, closing whatever descriptor it had before.
///
/// # Errors
/// The connect or socket error; the new socket is closed on failure.
pub async fn connect(address: SocketAddr) -> Result<()> {
    connect_until(address, None).await
}

/// [`connect`] that gives up after `timeout`, closing the half-open socket.
pub async fn connect_timeout(address: SocketAddr, timeout: Duration) -> Result<()> {
    connect_until(address, deadline_after(timeout)).await
}

async fn connect_until(address: SocketAddr, deadline: Option<Instant>) -> Result<()> {
    let fiber = current();
    fiber.close()?;

    let socket = Socket::new(Domain::for_address(address), Type::STREAM, None)?;
    socket.set_nonblocking(true)?;

    match socket.connect(&address.into()) {
        Ok(()) => {}
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(err) => return Err(err.into()),
    }
    fiber.set_fd(Some(OwnedFd::from(socket)));

    let outcome = match wait_ready(Interest::WRITE, deadline).await {
        Ok(()) => match fiber.with_socket(|socket| socket.take_error()) {
            Ok(None) => Ok(()),
            Ok(Some(err)) | Err(err) => Err(Error::from(err)),
        },
        Err(err) => Err(err),
    };
    unwait(Interest::WRITE);

    if outcome.is_err() {
        let _ = fiber.close();
    }
    outcome
}
