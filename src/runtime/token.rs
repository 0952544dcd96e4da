//! Mapping between poll tokens and connection slots.
//!
//! Slot 0 belongs to the listening socket for the lifetime of the server.
//! Peer connections live in a slab whose keys start at 0, so each key is
//! shifted up by one when it is turned into a token.

use mio::Token;

/// Token of the listening socket.
pub const LISTENER_TOKEN: Token = Token(0);

/// Token under which the connection with slab key `conn_id` is registered.
pub fn conn_token(conn_id: usize) -> Token {
    Token(conn_id + 1)
}

/// Slab key for a peer token, or `None` for the listener.
pub fn conn_id(token: Token) -> Option<usize> {
    token.0.checked_sub(1)
}
