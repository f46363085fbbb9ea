//! Concurrent TCP server that numbers every message it receives.
//!
//! Clients connect, write bytes, and disconnect. The server never writes back;
//! it logs each connection and every chunk it reads, tagging chunks with a
//! process-wide sequence number and the id of the client that sent them.
//!
//! - [`cli`] parses the command line into a [`server::ServerConfig`].
//! - [`counters`] holds the shared sequence and client id counters.
//! - [`server`] binds the listening socket, accepts connections, and
//!   supervises one handler task per client.
//! - [`handler`] reads from a single connection until it closes.
//! - [`event`] produces the lifecycle log records.
//! - [`error`] defines setup and serving failures.
//!
//! A "message" is whatever one read returns: writes may be merged or split
//! depending on timing and on the configured chunk size.

pub mod cli;
pub mod counters;
pub mod error;
pub mod event;
pub mod handler;
pub mod server;
