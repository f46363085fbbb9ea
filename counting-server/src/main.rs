use std::io::IsTerminal;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use counting_server::{
    cli::Cli,
    server::{Server, ServerConfig},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = ServerConfig::from(Cli::parse());
    let server = Server::bind(&config).context("server setup failed")?;
    let addr = server.local_addr()?;
    info!("listening on {}", addr);

    if let Err(err) = server.run_until_ctrl_c().await {
        error!("server exited with error: {err:?}");
        return Err(err.into());
    }

    Ok(())
}
