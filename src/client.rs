//! Echo client for exercising the server by hand.
//!
//! Opens one connection, sends the configured message and copies every
//! byte that comes back to the output until the server closes the
//! connection or a read fails.

use crate::config::ClientConfig;
use bytes::{Bytes, BytesMut};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use tracing::{debug, info};

const READ_CHUNK: usize = 1024;

/// Client failures that stop it before anything could be received.
#[derive(Debug)]
pub enum ClientError {
    Connect { addr: String, source: io::Error },
    Send(io::Error),
    Output(io::Error),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Connect { addr, source } => {
                write!(f, "Failed to connect to {addr}: {source}")
            }
            ClientError::Send(e) => write!(f, "Failed to send message: {e}"),
            ClientError::Output(e) => write!(f, "Failed to write output: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

/// Send the configured message and copy the reply to `out`.
///
/// Returns everything received. A read error ends the exchange the same
/// way a closed connection does.
pub fn run<W: Write>(config: &ClientConfig, out: &mut W) -> Result<Bytes, ClientError> {
    let addr = format!("{}:{}", config.host, config.port);
    let connect_err = |source: io::Error| ClientError::Connect {
        addr: addr.clone(),
        source,
    };

    let mut stream = TcpStream::connect((config.host.as_str(), config.port)).map_err(connect_err)?;
    if config.timeout_ms > 0 {
        stream
            .set_read_timeout(Some(Duration::from_millis(config.timeout_ms)))
            .map_err(connect_err)?;
    }
    info!(addr = %addr, bytes = config.message.len(), "Connected, sending message");

    stream
        .write_all(config.message.as_bytes())
        .map_err(ClientError::Send)?;

    let mut received = BytesMut::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                debug!("Server closed connection");
                break;
            }
            Ok(n) => {
                out.write_all(&buf[..n]).map_err(ClientError::Output)?;
                out.flush().map_err(ClientError::Output)?;
                received.extend_from_slice(&buf[..n]);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "Read ended");
                break;
            }
        }
    }

    info!(received = received.len(), "Connection finished");
    Ok(received.freeze())
}
