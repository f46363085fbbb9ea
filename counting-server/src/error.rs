use std::{io, net::SocketAddr};

use thiserror::Error;

/// Failures while creating the listening endpoint. None of these are recoverable.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to create listening socket for {addr}")]
    Create {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to listen on {addr} with backlog {backlog}")]
    Listen {
        addr: SocketAddr,
        backlog: u32,
        #[source]
        source: io::Error,
    },
}

/// Failures that stop a running dispatcher.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("listening endpoint failed while accepting connections")]
    Accept(#[source] io::Error),
}
