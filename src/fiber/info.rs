use crate::runtime::context;

use std::fmt::Write;
use std::os::fd::RawFd;

/// Point-in-time view of one allocated fiber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FiberInfo {
    pub fid: u32,
    pub csw: u64,
    pub name: String,
    /// Messages queued in the inbox.
    pub inbox: usize,
    pub fd: Option<RawFd>,
    pub peer: Option<String>,
    pub stack: Option<usize>,
}

/// Describes every fiber allocated by the current runtime, zombies
/// included, in allocation order.
///
/// # Panics
/// Panics when invoked outside of a runtime context.
pub fn fiber_info() -> Vec<FiberInfo> {
    context::scheduler()
        .allocated_fibers()
        .iter()
        .map(|fiber| FiberInfo {
            fid: fiber.fid(),
            csw: fiber.csw(),
            name: fiber.name(),
            inbox: fiber.pending_count(),
            fd: fiber.fd(),
            peer: fiber.peer_name(),
            stack: fiber.stack_id(),
        })
        .collect()
}

/// Renders a fiber listing as a YAML sequence with CRLF line endings.
pub fn render_fiber_info(fibers: &[FiberInfo]) -> String {
    let mut out = String::from("fibers:\r\n");

    for fiber in fibers {
        let _ = write!(out, "  - fid: {:4}\r\n", fiber.fid);
        let _ = write!(out, "    csw: {}\r\n", fiber.csw);
        let _ = write!(out, "    name: {}\r\n", fiber.name);
        let _ = write!(out, "    inbox: {}\r\n", fiber.inbox);
        let _ = write!(out, "    fd: {:4}\r\n", fiber.fd.unwrap_or(-1));
        let _ = write!(out, "    peer: {}\r\n", fiber.peer.as_deref().unwrap_or("~"));
        if let Some(stack) = fiber.stack {
            let _ = write!(out, "    stack: {stack:#x}\r\n");
        }
    }
    out
}
