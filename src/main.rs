use anyhow::Result;
use clap::Parser;
use tracing::info;

use chat_relay::config::Config;
use chat_relay::server::Server;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::parse();

    let server = Server::bind(config).await?;
    info!("listening on {}", server.local_addr()?);

    server.run_until_ctrl_c().await
}
