//! Wire format between a parent and its forked child.
//!
//! ```text
//! +----------------+----------------+----------------+-------------+
//! | total: u32 BE  | id: u32 BE     | len: u32 BE    | payload     |
//! +----------------+----------------+----------------+-------------+
//!                  |<------------------ total ------------------->|
//! ```
//!
//! `total` covers everything after itself, so `total == 8 + len`. The id is
//! the fiber that sent the request; the child echoes it in the reply.

use crate::error::{Error, Result};

/// Bytes in the `total` prefix.
pub const PREFIX_LEN: usize = 4;

/// Bytes in the id and payload length fields that follow the prefix.
pub const HEADER_LEN: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub payload: Vec<u8>,
}

/// Appends one encoded frame to `out`.
pub fn encode(id: u32, payload: &[u8], out: &mut Vec<u8>) {
    let total = (HEADER_LEN + payload.len()) as u32;
    out.reserve(PREFIX_LEN + total as usize);
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
}

/// Total buffered bytes needed before the first frame in `buf` is complete.
pub fn needed(buf: &[u8]) -> usize {
    match buf.first_chunk::<PREFIX_LEN>() {
        Some(prefix) => PREFIX_LEN + u32::from_be_bytes(*prefix) as usize,
        None => PREFIX_LEN,
    }
}

/// Decodes the body of a frame, i.e. everything after the `total` prefix.
pub fn decode_body(body: &[u8]) -> Result<(u32, &[u8])> {
    let Some((header, payload)) = body.split_first_chunk::<HEADER_LEN>() else {
        return Err(Error::frame(format!(
            "body of {} bytes is shorter than the header",
            body.len()
        )));
    };

    let id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len != payload.len() {
        return Err(Error::frame(format!(
            "payload length {len} disagrees with the {} bytes framed",
            payload.len()
        )));
    }

    Ok((id, payload))
}

/// Splits the first complete frame off the front of `buf`.
///
/// Returns the frame and the number of bytes it occupied, or `None` while
/// the frame is still incomplete.
pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
    let needed = needed(buf);
    if buf.len() < PREFIX_LEN || buf.len() < needed {
        return Ok(None);
    }

    let (id, payload) = decode_body(&buf[PREFIX_LEN..needed])?;
    let frame = Frame {
        id,
        payload: payload.to_vec(),
    };
    Ok(Some((frame, needed)))
}
