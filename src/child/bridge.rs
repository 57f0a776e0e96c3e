use crate::child::blocking::{BlockingHandler, blocking_loop};
use crate::child::frame;
use crate::error::{Error, Result};
use crate::fiber::mailbox::write_inbox_as;
use crate::fiber::{Fiber, add_iov, current, fiber_find, gc, read_inbox};
use crate::io::{flush_output, read_at_least, sys, unwait};
use crate::reactor::Interest;
use crate::runtime::call;

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use tracing::{error, info, warn};

/// Parent-side handle on a forked child.
///
/// Messages written to [`outbound`](Self::outbound) are framed and sent to
/// the child with the writer's id. Replies are delivered to the fiber named
/// by the reply id, with the outbound fiber's id as sender.
#[derive(Debug)]
pub struct ChildBridge {
    pid: libc::pid_t,
    inbound: Rc<Fiber>,
    outbound: Rc<Fiber>,
}

impl ChildBridge {
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Fiber `"{name}/sock2inbox"`, reading replies from the child.
    pub fn inbound(&self) -> &Rc<Fiber> {
        &self.inbound
    }

    /// Fiber `"{name}/inbox2sock"`; write requests to its inbox.
    pub fn outbound(&self) -> &Rc<Fiber> {
        &self.outbound
    }
}

/// Forks a child that serves framed requests with `handler`.
///
/// In the child every descriptor except stderr and its end of the socket
/// pair is closed, the process is renamed to `name`, and `handler` runs
/// until the parent closes the socket. The child never returns from here.
///
/// In the parent two proxy fibers are created, each owning its own handle
/// on the socket: `"{name}/sock2inbox"` is started immediately and
/// `"{name}/inbox2sock"` waits on its inbox. `inbox_capacity` applies to
/// both; `0` selects the runtime default.
///
/// # Errors
/// Fails when the socket pair or the fork cannot be created.
///
/// # Panics
/// Panics when invoked outside of a runtime context.
pub fn spawn_child<H>(name: &str, inbox_capacity: usize, mut handler: H) -> Result<ChildBridge>
where
    H: BlockingHandler,
{
    let (parent_end, child_end) = UnixStream::pair()?;

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        let err = io::Error::last_os_error();
        error!(name, error = %err, "fork failed");
        return Err(err.into());
    }

    if pid == 0 {
        drop(parent_end);
        let socket = OwnedFd::from(child_end);
        sys::close_all_except(&[libc::STDERR_FILENO, socket.as_raw_fd()]);
        sys::set_proc_title(name);
        blocking_loop(socket, &mut handler);
    }

    drop(child_end);
    parent_end.set_nonblocking(true)?;
    let inbound_socket = OwnedFd::from(parent_end);
    let outbound_socket = inbound_socket.try_clone()?;

    let outbound = Fiber::create(
        &format!("{name}/inbox2sock"),
        Some(outbound_socket),
        inbox_capacity,
        outbound_proxy(),
    );
    let inbound = Fiber::create(
        &format!("{name}/sock2inbox"),
        Some(inbound_socket),
        inbox_capacity,
        inbound_proxy(outbound.fid()),
    );

    call(&inbound);
    outbound.set_reading_inbox(true);
    info!(name, pid, "child spawned");

    Ok(ChildBridge {
        pid,
        inbound,
        outbound,
    })
}

fn child_gone() -> Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "child is dead").into()
}

// Reads reply frames and routes each one to the fiber named by its id.
async fn inbound_proxy(sender: u32) -> Result<()> {
    let mut buf = Vec::new();

    loop {
        while let Some((reply, used)) = frame::decode(&buf)? {
            buf.drain(..used);
            match fiber_find(reply.id) {
                Some(recipient) => {
                    if !write_inbox_as(sender, &recipient, &reply.payload) {
                        warn!(fid = reply.id, "recipient inbox is full, reply dropped");
                    }
                }
                None => error!(fid = reply.id, "recipient is lost"),
            }
        }

        let needed = frame::needed(&buf);
        if read_at_least(&mut buf, needed).await? == 0 {
            return Err(child_gone());
        }
        gc();
    }
}

// Drains the inbox into one batch of frames and writes it to the child.
async fn outbound_proxy() -> Result<()> {
    let fiber = current();
    let mut batch = Vec::new();

    loop {
        batch.clear();
        loop {
            let request = read_inbox().await?;
            frame::encode(request.sender, &request.payload, &mut batch);
            if fiber.pending_count() == 0 {
                break;
            }
        }

        add_iov(&batch);
        if let Err(err) = flush_output().await {
            error!(error = %err, "writing to child failed");
            return Err(child_gone());
        }

        gc();
        unwait(Interest::all());
    }
}
