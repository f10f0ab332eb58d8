mod auth_token;
mod config;
mod counter;
mod middleware;
mod rate_limit;
mod routes;
mod server;
mod session;
mod ws;
mod wt;

use clap::Parser;
use std::sync::Arc;
use tracing::info;

use libwebpty::LocalCommandFactory;

use crate::config::Options;
use crate::server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webpty_server=info,libwebpty=info".into()),
        )
        .init();

    let options = Options::parse();
    let (command, args) = options.command_line();
    let (columns, rows) = options.terminal_size();
    info!(%command, "starting");

    let factory = Arc::new(LocalCommandFactory::new(command, args, columns, rows));
    let server = Server::new(options, factory)?;
    server.run().await
}
