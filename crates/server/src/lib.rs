mod cli_args;
mod http;

pub use cli_args::CliArgs;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Parse the command line and run the proxy.
pub async fn run() -> miette::Result<()> {
    init_tracing();
    CliArgs::parse().run().await
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}
