use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("cabal_irc=info".parse()?)
                .add_directive("cabal_store=info".parse()?),
        )
        .init();

    let config = cabal_irc::config::GatewayConfig::parse();
    let store = config.open_store()?;
    tracing::info!("Starting cabal gateway on {}", config.listen_addr);
    if config.lazy_join {
        tracing::info!("Lazy join: channels are announced, not joined");
    }

    let server = cabal_irc::server::Server::new(config, Arc::new(store));
    server.run().await
}
