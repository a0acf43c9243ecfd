use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use palette_proxy::{serve, ProxyConfig, DEFAULT_BIND};

#[derive(Debug, Parser)]
#[command(
    name = "palette-proxy",
    version,
    about = "Forwards inference calls to the hosted API with a server-side token"
)]
struct Cli {
    #[arg(long, default_value = DEFAULT_BIND)]
    bind: SocketAddr,
    /// Overrides PALETTE_PROXY_UPSTREAM.
    #[arg(long)]
    upstream: Option<String>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run().await {
        eprintln!("palette-proxy error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = ProxyConfig::from_env(cli.bind);
    if let Some(upstream) = cli.upstream.filter(|value| !value.trim().is_empty()) {
        config.upstream_base = upstream.trim().trim_end_matches('/').to_string();
    }
    serve(config).await
}
