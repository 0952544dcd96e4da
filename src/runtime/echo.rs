//! Echo processing for a ready connection.
//!
//! Works on any non-blocking `Read + Write` stream. Each call reads at
//! most one chunk, so a busy peer cannot hold the event loop; the loop
//! comes back to it on the next pass until the socket would block. Every
//! chunk is written back exactly as it was read, in a single write call;
//! whatever that call does not accept is queued on the connection and
//! flushed on the next writable event before any further input is read.

use crate::runtime::connection::{ConnState, Connection};
use std::io::{self, Read, Write};

/// What the event loop should do with a connection after servicing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Keep the connection; it is waiting for its next readiness event.
    Open,
    /// A chunk was echoed and more input may be waiting. Readiness is
    /// edge-triggered, so no new event will arrive for it.
    Busy,
    /// The peer closed its side.
    Closed,
}

/// Service a connection that was reported ready.
///
/// Flushes any pending echo first, then reads and echoes one chunk of up
/// to `chunk.len()` bytes.
pub fn service<S: Read + Write>(
    conn: &mut Connection<S>,
    chunk: &mut [u8],
) -> io::Result<Liveness> {
    if !flush(conn)? {
        return Ok(Liveness::Open);
    }

    let n = loop {
        match conn.stream.read(chunk) {
            Ok(0) => return Ok(Liveness::Closed),
            Ok(n) => break n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Liveness::Open),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    };

    let written = write_once(&mut conn.stream, &chunk[..n])?;
    if written < n {
        conn.queue(&chunk[written..n]);
        return Ok(Liveness::Open);
    }
    Ok(Liveness::Busy)
}

/// Write pending echo bytes until none are left or the socket would block.
///
/// Returns `true` once the connection is back in the reading state.
pub fn flush<S: Write>(conn: &mut Connection<S>) -> io::Result<bool> {
    while conn.state() == ConnState::Writing {
        match conn.write_pending() {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => conn.consume(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// A single send. Would-block counts as nothing accepted.
fn write_once<S: Write>(stream: &mut S, buf: &[u8]) -> io::Result<usize> {
    loop {
        match stream.write(buf) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => return Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
