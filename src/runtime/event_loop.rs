//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! One thread, one wait point. Each readiness pass gives every ready
//! connection one chunk of work. Connections that may still have input
//! are carried to the next pass, which then polls without blocking.
//! Connections that ended during the pass are collected and torn down
//! only after the pass.

use crate::config::ServerConfig;
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::echo::{self, Liveness};
use crate::runtime::token::{conn_id, conn_token, LISTENER_TOKEN};
use crate::runtime::SetupError;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Events drained per poll call. Anything beyond this is picked up by the next call.
const EVENTS_CAPACITY: usize = 1024;

/// Connections accepted per pass before the listener yields to peers.
const ACCEPT_BUDGET: usize = 64;

/// A bound echo server, ready to run.
pub struct Server {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: ConnectionRegistry<TcpStream>,
    chunk: Vec<u8>,
    /// Listener stopped on its accept budget and still has pending peers.
    accept_pending: bool,
    /// Connections to service next pass without waiting for an event.
    ready: Vec<usize>,
    /// Connections due this pass.
    due: Vec<usize>,
    closing: Vec<usize>,
}

impl Server {
    /// Bind and listen on the configured address and register the listener
    /// as slot 0.
    pub fn bind(config: &ServerConfig) -> Result<Self, SetupError> {
        let listener = create_listener(config)?;
        let local_addr = listener.local_addr().map_err(|source| SetupError::Bind {
            addr: format!("{}:{}", config.host, config.port),
            source,
        })?;

        let mut listener = TcpListener::from_std(listener);
        let poll = Poll::new().map_err(SetupError::Poll)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(SetupError::Poll)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            local_addr,
            connections: ConnectionRegistry::new(config.max_connections),
            chunk: vec![0u8; config.chunk_size.max(1)],
            accept_pending: false,
            ready: Vec::new(),
            due: Vec::new(),
            closing: Vec::new(),
        })
    }

    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve connections until the process is killed.
    pub fn run(mut self) -> ! {
        info!(
            addr = %self.local_addr,
            max_connections = self.connections.capacity(),
            chunk_size = self.chunk.len(),
            "Echo server listening"
        );

        loop {
            self.turn();
        }
    }

    /// One readiness pass: wait, give every ready connection one chunk of
    /// work, then close whatever ended during the pass.
    fn turn(&mut self) {
        let Self {
            poll,
            events,
            listener,
            connections,
            chunk,
            accept_pending,
            ready,
            due,
            closing,
            ..
        } = self;

        // Work left over from the last pass must not wait for an edge that
        // will never come
        let timeout = if ready.is_empty() && !*accept_pending {
            None
        } else {
            Some(Duration::ZERO)
        };

        if let Err(e) = poll.poll(events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                trace!("Poll interrupted");
            } else {
                debug!(error = %e, "Poll failed, retrying");
            }
            if timeout.is_none() {
                return;
            }
            events.clear();
        }

        due.append(ready);
        let mut listener_ready = *accept_pending;
        for event in events.iter() {
            match conn_id(event.token()) {
                None => listener_ready = true,
                Some(conn_id) => due.push(conn_id),
            }
        }

        if listener_ready {
            *accept_pending = accept_connections(listener, poll, connections);
        }

        due.sort_unstable();
        due.dedup();
        for conn_id in due.drain(..) {
            handle_connection_event(conn_id, poll, connections, chunk, ready, closing);
        }

        close_connections(poll, connections, closing);
    }
}

/// Accept up to `ACCEPT_BUDGET` peers, stopping early once the listener
/// would block. Peers beyond capacity are accepted and dropped straight
/// away.
///
/// Returns `true` if the budget ran out first.
fn accept_connections(
    listener: &TcpListener,
    poll: &Poll,
    connections: &mut ConnectionRegistry<TcpStream>,
) -> bool {
    for _ in 0..ACCEPT_BUDGET {
        match listener.accept() {
            Ok((stream, peer)) => {
                // A refused connection is dropped, and so closed, by the registry
                let Some(conn_id) = connections.insert(Connection::new(stream, peer)) else {
                    debug!(
                        peer = %peer,
                        capacity = connections.capacity(),
                        "Connection table full, dropping connection"
                    );
                    continue;
                };

                let registered = match connections.get_mut(conn_id) {
                    Some(conn) => {
                        let interest = conn.state().interest();
                        poll.registry()
                            .register(&mut conn.stream, conn_token(conn_id), interest)
                    }
                    None => continue,
                };

                if let Err(e) = registered {
                    warn!(conn_id, peer = %peer, error = %e, "Failed to register connection");
                    connections.remove(conn_id);
                    continue;
                }

                debug!(
                    conn_id,
                    peer = %peer,
                    active = connections.len(),
                    "Accepted connection"
                );
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Accept error");
                return false;
            }
        }
    }
    true
}

fn handle_connection_event(
    conn_id: usize,
    poll: &Poll,
    connections: &mut ConnectionRegistry<TcpStream>,
    chunk: &mut [u8],
    ready: &mut Vec<usize>,
    closing: &mut Vec<usize>,
) {
    let Some(conn) = connections.get_mut(conn_id) else {
        return;
    };

    let before = conn.state();
    match echo::service(conn, chunk) {
        Ok(liveness @ (Liveness::Open | Liveness::Busy)) => {
            if liveness == Liveness::Busy {
                ready.push(conn_id);
            }
            let after = conn.state();
            if after == before {
                return;
            }
            if let Err(e) =
                poll.registry()
                    .reregister(&mut conn.stream, conn_token(conn_id), after.interest())
            {
                debug!(conn_id, error = %e, "Failed to reregister connection");
                closing.push(conn_id);
            }
        }
        Ok(Liveness::Closed) => {
            trace!(conn_id, peer = %conn.peer, "Peer closed connection");
            closing.push(conn_id);
        }
        Err(e) => {
            debug!(conn_id, peer = %conn.peer, error = %e, "Connection error");
            closing.push(conn_id);
        }
    }
}

/// Tear down every connection marked during the pass. Their keys go back
/// to the slab for reuse.
fn close_connections(
    poll: &Poll,
    connections: &mut ConnectionRegistry<TcpStream>,
    closing: &mut Vec<usize>,
) {
    for conn_id in closing.drain(..) {
        if let Some(mut conn) = connections.remove(conn_id) {
            let _ = poll.registry().deregister(&mut conn.stream);
            debug!(
                conn_id,
                peer = %conn.peer,
                owed = conn.pending().len(),
                active = connections.len(),
                "Connection closed"
            );
        }
    }
}

/// Create the listening socket with the configured backlog.
fn create_listener(config: &ServerConfig) -> Result<std::net::TcpListener, SetupError> {
    let display = format!("{}:{}", config.host, config.port);
    let bind_err = |source: io::Error| SetupError::Bind {
        addr: display.clone(),
        source,
    };

    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(bind_err)?
        .next()
        .ok_or_else(|| {
            bind_err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "address resolved to nothing",
            ))
        })?;

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(bind_err)?;

    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket
        .listen(config.backlog)
        .map_err(|source| SetupError::Listen {
            addr: display.clone(),
            source,
        })?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream as StdStream};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn spawn_server(max_connections: usize) -> SocketAddr {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_connections,
            ..ServerConfig::default()
        };
        let server = Server::bind(&config).unwrap();
        let addr = server.local_addr();
        thread::spawn(move || {
            server.run();
        });
        addr
    }

    fn connect(addr: SocketAddr) -> StdStream {
        let stream = StdStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        stream
    }

    fn round_trip(stream: &mut StdStream, payload: &[u8]) {
        stream.write_all(payload).unwrap();
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf, payload);
    }

    /// True if the server closed the stream without ever sending a byte.
    fn closed_by_server(stream: &mut StdStream) -> bool {
        let mut buf = [0u8; 16];
        match stream.read(&mut buf) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
            ),
        }
    }

    #[test]
    fn test_ping() {
        let addr = spawn_server(100);
        let mut client = connect(addr);
        round_trip(&mut client, b"ping");
    }

    #[test]
    fn test_large_send_echoed_byte_for_byte() {
        let addr = spawn_server(100);
        let mut client = connect(addr);

        let payload: Vec<u8> = (0..2000u32).map(|i| (i * 7 % 256) as u8).collect();
        client.write_all(&payload).unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 512];
        while received.len() < payload.len() {
            let n = client.read(&mut buf).unwrap();
            assert!(n > 0, "server closed early");
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, payload);
    }

    #[test]
    fn test_echo_survives_slow_reader() {
        let addr = spawn_server(100);
        let mut client = connect(addr);
        let mut writer = client.try_clone().unwrap();

        // Big enough to fill both socket buffers and force queued echoes
        let payload: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 253) as u8).collect();
        let expected = payload.clone();
        let sender = thread::spawn(move || writer.write_all(&payload).unwrap());

        thread::sleep(Duration::from_millis(100));
        let mut received = vec![0u8; expected.len()];
        client.read_exact(&mut received).unwrap();
        sender.join().unwrap();
        assert!(received == expected);
    }

    #[test]
    fn test_connections_beyond_capacity_are_dropped() {
        let addr = spawn_server(2);

        let mut first = connect(addr);
        round_trip(&mut first, b"one");
        let mut second = connect(addr);
        round_trip(&mut second, b"two");

        let mut third = connect(addr);
        assert!(closed_by_server(&mut third));

        round_trip(&mut first, b"still one");
        round_trip(&mut second, b"still two");
    }

    #[test]
    fn test_closed_peer_frees_its_slot() {
        let addr = spawn_server(1);

        let mut first = connect(addr);
        round_trip(&mut first, b"first");
        drop(first);

        // The close and the next accept can land in the same pass, in
        // which case the accept is refused; retry until the slot is free.
        for _ in 0..50 {
            let mut next = connect(addr);
            if next.write_all(b"second").is_ok() {
                let mut buf = [0u8; 6];
                if next.read_exact(&mut buf).is_ok() {
                    assert_eq!(&buf, b"second");
                    return;
                }
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("freed slot was never reused");
    }

    #[test]
    fn test_abrupt_close_does_not_disturb_others() {
        let addr = spawn_server(100);

        let mut survivor = connect(addr);
        round_trip(&mut survivor, b"before");

        let quitter = connect(addr);
        drop(quitter);

        round_trip(&mut survivor, b"after");
        let mut newcomer = connect(addr);
        round_trip(&mut newcomer, b"hello");
    }

    #[test]
    fn test_many_clients_interleaved() {
        let addr = spawn_server(100);

        let mut clients: Vec<StdStream> = (0..10).map(|_| connect(addr)).collect();
        for round in 0..3 {
            for (i, client) in clients.iter_mut().enumerate() {
                let msg = format!("client {i} round {round}");
                round_trip(client, msg.as_bytes());
            }
        }
    }

    #[test]
    fn test_flooding_peer_does_not_starve_others() {
        let addr = spawn_server(100);

        // One peer sends and drains at full speed, so its socket never
        // runs dry
        let flood = connect(addr);
        let stop = Arc::new(AtomicBool::new(false));
        let writer = {
            let mut stream = flood.try_clone().unwrap();
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let block = vec![0xabu8; 64 * 1024];
                while !stop.load(Ordering::Relaxed) {
                    if stream.write_all(&block).is_err() {
                        break;
                    }
                }
            })
        };
        let reader = {
            let mut stream = flood.try_clone().unwrap();
            thread::spawn(move || {
                let mut buf = vec![0u8; 64 * 1024];
                while matches!(stream.read(&mut buf), Ok(n) if n > 0) {}
            })
        };
        thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        let mut other = connect(addr);
        round_trip(&mut other, b"ping");
        assert!(started.elapsed() < Duration::from_secs(2));

        stop.store(true, Ordering::Relaxed);
        flood.shutdown(Shutdown::Both).unwrap();
        writer.join().unwrap();
        reader.join().unwrap();
    }

    #[test]
    fn test_huge_capacity_is_a_policy_not_an_allocation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_connections: usize::MAX / 2,
            ..ServerConfig::default()
        };
        let server = Server::bind(&config).unwrap();
        let addr = server.local_addr();
        thread::spawn(move || {
            server.run();
        });

        let mut client = connect(addr);
        round_trip(&mut client, b"ping");
    }

    #[test]
    fn test_bind_conflict_is_bind_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..ServerConfig::default()
        };
        match Server::bind(&config) {
            Err(e @ SetupError::Bind { .. }) => assert_eq!(e.exit_code(), 2),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("bind to a taken port succeeded"),
        }
    }
}
