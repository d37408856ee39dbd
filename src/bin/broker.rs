use std::path::PathBuf;

use clap::Parser;
use h2_revdial::{serve_tls, tls, ReversePool};
use n0_error::Result;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Public broker: accepts reverse streams from agents and forwards
/// inbound requests onto them.
#[derive(Parser)]
#[command(name = "broker")]
struct Cli {
    /// Port to listen on.
    #[clap(short, long, default_value_t = 8443)]
    port: u16,
    /// Server certificate chain, PEM.
    #[clap(long)]
    cert: PathBuf,
    /// Server private key, PEM.
    #[clap(long)]
    key: PathBuf,
    /// Mount path for the tunnel handler.
    #[clap(long, default_value = "/")]
    base_path: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let tls = tls::server_config(&cli.cert, &cli.key)?;
    let pool = ReversePool::new();
    let listener = TcpListener::bind(("0.0.0.0", cli.port)).await?;
    let addr = listener.local_addr()?;
    info!("broker listening on https://{addr}{}", cli.base_path);

    let shutdown = CancellationToken::new();
    tokio::select! {
        res = serve_tls(listener, tls, pool.clone(), &cli.base_path, shutdown.clone()) => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("received signal, shutting down");
            shutdown.cancel();
            pool.close();
        }
    }
    Ok(())
}
