//! echo-mux: a readiness-polled TCP echo server
//!
//! The crate ships three programs behind one binary:
//! - `serve`: single-threaded echo server multiplexing every connection
//!   through one mio poller, with a bounded connection table
//! - `client`: sends one message and prints whatever comes back
//! - `handoff`: producer/consumer demo over a blocking single-slot handoff
//!
//! Configuration comes from CLI arguments or a TOML file.

pub mod client;
pub mod config;
pub mod handoff;
pub mod runtime;
