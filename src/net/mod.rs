//! Network services run by fibers.

mod acceptor;

pub use acceptor::{Acceptor, AcceptorState, OnBind, ServerKind, Service, serve};
