use crate::child::frame::{self, PREFIX_LEN};

use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use tracing::error;

/// Request handler run inside a forked child.
///
/// The child reads one request at a time, blocking, and writes the reply
/// back before reading the next one.
pub trait BlockingHandler {
    /// Turns one request payload into the reply payload.
    fn handle(&mut self, request: &[u8]) -> Vec<u8>;

    /// Called once when the parent closes its end, before the child exits.
    fn finish(&mut self) {}
}

impl<F> BlockingHandler for F
where
    F: FnMut(&[u8]) -> Vec<u8>,
{
    fn handle(&mut self, request: &[u8]) -> Vec<u8> {
        self(request)
    }
}

/// Serves requests on `socket` until the parent goes away, then exits the
/// process without running destructors or atexit handlers.
pub(crate) fn blocking_loop(socket: OwnedFd, handler: &mut dyn BlockingHandler) -> ! {
    let mut stream = UnixStream::from(socket);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let served = serve_requests(&mut stream, &mut *handler);
        handler.finish();
        served
    }));

    let status = match outcome {
        Ok(Ok(())) => libc::EXIT_SUCCESS,
        Ok(Err(err)) => {
            error!(error = %err, "child request loop failed");
            libc::EXIT_FAILURE
        }
        Err(_) => libc::EXIT_FAILURE,
    };

    unsafe { libc::_exit(status) }
}

fn serve_requests<S>(stream: &mut S, handler: &mut dyn BlockingHandler) -> io::Result<()>
where
    S: Read + Write,
{
    let mut reply = Vec::new();

    loop {
        let mut prefix = [0u8; PREFIX_LEN];
        if stream.read_exact(&mut prefix).is_err() {
            return Ok(());
        }

        let mut body = vec![0u8; u32::from_be_bytes(prefix) as usize];
        if stream.read_exact(&mut body).is_err() {
            return Ok(());
        }

        let (id, request) = frame::decode_body(&body)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        let response = handler.handle(request);

        reply.clear();
        frame::encode(id, &response, &mut reply);
        stream.write_all(&reply)?;
    }
}
