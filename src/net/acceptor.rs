//! Listening fibers for TCP and UDP services.
//!
//! [`serve`] spawns a fiber named `"{port}/acceptor"` that binds the port,
//! retrying while it is in use, then either accepts connections (one fiber
//! per connection, named `"{port}/handler"`) or hands every received datagram
//! to a callback.

use crate::error::Result;
use crate::fiber::{Fiber, current};
use crate::io::{sleep, wait_for};
use crate::reactor::Interest;
use crate::runtime::{call, context};

use socket2::{Domain, Protocol, Socket, Type};
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::mem::MaybeUninit;
use std::os::fd::OwnedFd;
use std::pin::Pin;
use std::process;
use std::rc::Rc;
use std::slice;
use std::time::Duration;
use tracing::{error, info, warn};

// sysexits.h EX_OSERR.
const EX_OSERR: i32 = 71;

type TcpHandler = Rc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<()>>>>>;
type UdpHandler = Rc<dyn Fn(&[u8], SocketAddr)>;

/// Callback invoked once the port is bound, with the bound address.
pub type OnBind = Box<dyn FnOnce(SocketAddr)>;

/// What to do with the traffic arriving on a served port.
#[derive(Clone)]
pub enum Service {
    /// Entry of the fiber spawned for each accepted connection. The fiber's
    /// descriptor is the connection.
    Tcp(TcpHandler),
    /// Called for every datagram with its payload and sender.
    Udp(UdpHandler),
}

impl Service {
    pub fn tcp<F, Fut>(handler: F) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        Service::Tcp(Rc::new(move || {
            Box::pin(handler()) as Pin<Box<dyn Future<Output = Result<()>>>>
        }))
    }

    pub fn udp<F>(handler: F) -> Self
    where
        F: Fn(&[u8], SocketAddr) + 'static,
    {
        Service::Udp(Rc::new(handler))
    }

    pub fn kind(&self) -> ServerKind {
        match self {
            Service::Tcp(_) => ServerKind::Tcp,
            Service::Udp(_) => ServerKind::Udp,
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Service").field(&self.kind()).finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerKind {
    Tcp,
    Udp,
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerKind::Tcp => f.write_str("TCP"),
            ServerKind::Udp => f.write_str("UDP"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptorState {
    /// Waiting for the port to become free.
    Binding,
    /// Bound and dispatching traffic.
    Listening,
}

#[derive(Debug)]
struct Shared {
    state: Cell<AcceptorState>,
    local_addr: Cell<Option<SocketAddr>>,
    bind_retries: Cell<u32>,
}

/// Handle on a served port.
#[derive(Debug)]
pub struct Acceptor {
    fiber: Rc<Fiber>,
    port: u16,
    kind: ServerKind,
    shared: Rc<Shared>,
}

impl Acceptor {
    /// The acceptor fiber; its descriptor is the listening socket.
    pub fn fiber(&self) -> &Rc<Fiber> {
        &self.fiber
    }

    /// Port as requested; `0` when an ephemeral port was asked for.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn kind(&self) -> ServerKind {
        self.kind
    }

    pub fn state(&self) -> AcceptorState {
        self.shared.state.get()
    }

    /// Bound address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr.get()
    }

    /// Bind attempts that failed because the port was in use.
    pub fn bind_retries(&self) -> u32 {
        self.shared.bind_retries.get()
    }
}

/// Serves `port` on every IPv4 interface and returns once the acceptor
/// fiber has had its first run.
///
/// `on_bind` runs inside the acceptor fiber right after the bind succeeds.
/// Errors other than "address in use" while binding, and any failure to set
/// up the socket, terminate the process with status 71.
///
/// # Panics
/// Panics when invoked outside of a runtime context.
pub fn serve(port: u16, service: Service, on_bind: Option<OnBind>) -> Acceptor {
    let shared = Rc::new(Shared {
        state: Cell::new(AcceptorState::Binding),
        local_addr: Cell::new(None),
        bind_retries: Cell::new(0),
    });
    let kind = service.kind();

    let fiber = Fiber::create(
        &format!("{port}/acceptor"),
        None,
        0,
        accept_loop(port, service, on_bind, shared.clone()),
    );
    call(&fiber);

    Acceptor {
        fiber,
        port,
        kind,
        shared,
    }
}

async fn accept_loop(
    port: u16,
    service: Service,
    on_bind: Option<OnBind>,
    shared: Rc<Shared>,
) -> Result<()> {
    let config = context::scheduler().config().clone();
    let kind = service.kind();

    let socket = bind_with_retry(
        kind,
        port,
        config.listen_backlog,
        config.bind_retry_interval,
        &shared,
    )
    .await?;
    let local = socket
        .local_addr()
        .ok()
        .and_then(|address| address.as_socket())
        .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));

    current().set_fd(Some(OwnedFd::from(socket)));
    shared.local_addr.set(Some(local));
    shared.state.set(AcceptorState::Listening);
    info!(port = local.port(), "bound to {kind} port {}", local.port());

    if let Some(on_bind) = on_bind {
        on_bind(local);
    }

    match service {
        Service::Tcp(handler) => serve_tcp(local.port(), handler).await,
        Service::Udp(handler) => serve_udp(handler, config.udp_max_datagram).await,
    }
}

async fn bind_with_retry(
    kind: ServerKind,
    port: u16,
    backlog: i32,
    retry_interval: Duration,
    shared: &Shared,
) -> Result<Socket> {
    loop {
        match bind_once(kind, port, backlog) {
            Ok(socket) => return Ok(socket),
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                if shared.bind_retries.get() == 0 {
                    warn!(
                        port,
                        "port {port} is already in use, will retry binding after {:?}",
                        retry_interval
                    );
                }
                shared.bind_retries.set(shared.bind_retries.get() + 1);
                sleep(retry_interval).await?;
            }
            Err(err) => {
                error!(port, error = %err, "can't bind {kind} port {port}");
                process::exit(EX_OSERR);
            }
        }
    }
}

fn bind_once(kind: ServerKind, port: u16, backlog: i32) -> io::Result<Socket> {
    let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

    let socket = match kind {
        ServerKind::Tcp => {
            let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
            socket.set_reuse_address(true)?;
            socket.set_keepalive(true)?;
            socket.set_nodelay(true)?;
            socket.set_linger(None)?;
            socket
        }
        ServerKind::Udp => Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?,
    };
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;

    if kind == ServerKind::Tcp {
        socket.listen(backlog)?;
    }
    Ok(socket)
}

async fn serve_tcp(port: u16, handler: TcpHandler) -> Result<()> {
    let acceptor = current();
    let name = format!("{port}/handler");

    loop {
        wait_for(Interest::READ).await?;

        loop {
            let client = match acceptor.with_socket(|listener| listener.accept()) {
                Ok((client, _)) => client,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(port, error = %err, "accept failed");
                    break;
                }
            };

            if let Err(err) = client.set_nonblocking(true) {
                error!(port, error = %err, "can't make client socket non-blocking, dropping it");
                continue;
            }
            if let Err(err) = client.set_nodelay(true) {
                warn!(port, error = %err, "setsockopt TCP_NODELAY failed");
            }

            let connection = Fiber::create(&name, Some(OwnedFd::from(client)), 0, handler());
            connection.set_has_peer(true);
            call(&connection);
        }
    }
}

async fn serve_udp(handler: UdpHandler, max_datagram: usize) -> Result<()> {
    let acceptor = current();
    let mut buf = vec![MaybeUninit::<u8>::uninit(); max_datagram];

    loop {
        wait_for(Interest::READ).await?;

        loop {
            match acceptor.with_socket(|socket| socket.recv_from(&mut buf)) {
                Ok((len, peer)) => {
                    // SAFETY: recv_from initialized the first `len` bytes.
                    let payload = unsafe { slice::from_raw_parts(buf.as_ptr().cast::<u8>(), len) };
                    match peer.as_socket() {
                        Some(peer) => handler(payload, peer),
                        None => warn!(len, "datagram from a non-inet peer dropped"),
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(error = %err, "recvfrom failed");
                    break;
                }
            }
        }
    }
}
