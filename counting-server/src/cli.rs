use std::{net::SocketAddr, num::NonZeroUsize, time::Duration};

use clap::Parser;

use crate::server::ServerConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:8000")]
    pub listen: SocketAddr,

    /// Length of the kernel's pending-connection queue.
    #[arg(long, default_value_t = 32, value_parser = clap::value_parser!(u32).range(1..))]
    pub backlog: u32,

    /// Maximum number of bytes taken from a connection per read. Each read is
    /// logged as one message.
    #[arg(long, default_value = "64")]
    pub chunk_size: NonZeroUsize,

    /// How long shutdown waits for open connections to stop before aborting them.
    #[arg(long, default_value_t = 5000)]
    pub drain_timeout_ms: u64,
}

impl From<Cli> for ServerConfig {
    fn from(cli: Cli) -> Self {
        Self {
            listen: cli.listen,
            backlog: cli.backlog,
            chunk_size: cli.chunk_size,
            drain_timeout: Duration::from_millis(cli.drain_timeout_ms),
        }
    }
}
