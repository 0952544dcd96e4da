//! Readiness-based echo runtime.
//!
//! A single mio event loop (epoll on Linux, kqueue on macOS) multiplexes
//! the listening socket and every admitted peer:
//! - `Token`: slot 0 is the listener, peers are slab key + 1
//! - `ConnectionRegistry`: bounded slab of live connections
//! - `echo`: per-connection read/echo/flush processing

mod connection;
mod echo;
mod event_loop;
mod token;

pub use event_loop::Server;

use crate::config::ServerConfig;
use std::io;

/// Fatal errors while setting up the server. Anything that goes wrong
/// after setup is confined to the connection it happened on.
#[derive(Debug)]
pub enum SetupError {
    Bind { addr: String, source: io::Error },
    Listen { addr: String, source: io::Error },
    Poll(io::Error),
}

impl SetupError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            SetupError::Bind { .. } => 2,
            SetupError::Listen { .. } => 3,
            SetupError::Poll(_) => 4,
        }
    }
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupError::Bind { addr, source } => write!(f, "Failed to bind {addr}: {source}"),
            SetupError::Listen { addr, source } => {
                write!(f, "Failed to listen on {addr}: {source}")
            }
            SetupError::Poll(e) => write!(f, "Failed to set up poller: {e}"),
        }
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SetupError::Bind { source, .. } | SetupError::Listen { source, .. } => Some(source),
            SetupError::Poll(e) => Some(e),
        }
    }
}

/// Bind, listen and serve forever. Returns only if setup fails.
pub fn run(config: &ServerConfig) -> Result<(), SetupError> {
    let server = Server::bind(config)?;
    server.run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_and_nonzero() {
        let bind = SetupError::Bind {
            addr: "127.0.0.1:8000".to_string(),
            source: io::ErrorKind::AddrInUse.into(),
        };
        let listen = SetupError::Listen {
            addr: "127.0.0.1:8000".to_string(),
            source: io::ErrorKind::InvalidInput.into(),
        };
        let poll = SetupError::Poll(io::ErrorKind::Other.into());

        let codes = [bind.exit_code(), listen.exit_code(), poll.exit_code()];
        assert!(codes.iter().all(|&c| c != 0));
        assert_ne!(codes[0], codes[1]);
        assert_ne!(codes[1], codes[2]);
        assert_ne!(codes[0], codes[2]);
    }

    #[test]
    fn test_display_names_the_address() {
        let err = SetupError::Bind {
            addr: "127.0.0.1:8000".to_string(),
            source: io::ErrorKind::AddrInUse.into(),
        };
        assert!(err.to_string().contains("127.0.0.1:8000"));
    }
}
