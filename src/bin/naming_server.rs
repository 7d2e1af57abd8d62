use std::sync::Arc;

use clap::Parser;
use dfs_naming::command::HttpCommandClient;
use dfs_naming::config::{Cli, NamingConfig};
use dfs_naming::server;
use dfs_naming::service::NamingCore;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let cli = Cli::parse();
    let config = NamingConfig::resolve(&cli).unwrap_or_else(|err| {
        eprintln!("failed to load configuration: {err}");
        std::process::exit(1);
    });

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let command_client = Arc::new(HttpCommandClient::new());
    let core = Arc::new(NamingCore::with_threshold(command_client, config.replication_threshold));

    server::serve(core, config.client_bind, config.registration_bind).await
}
