use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use h2_revdial::{tls, Listener, OriginProxy};
use n0_error::Result;
use tracing::info;

/// Private agent: keeps reverse streams open toward a broker and serves
/// the requests forwarded through them by relaying onto a target URL.
#[derive(Parser)]
#[command(name = "agent")]
struct Cli {
    /// Broker base URL, https only.
    #[clap(long)]
    url: String,
    /// Agent id to register under.
    #[clap(long)]
    id: String,
    /// Extra CA certificate for the broker connection, PEM.
    #[clap(long)]
    cert: Option<PathBuf>,
    /// Target URL requests are reverse proxied onto.
    target: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let tls = tls::client_config(cli.cert.as_deref())?;
    let origin = Arc::new(OriginProxy::new(&cli.target)?);
    let listener = Listener::connect(tls, &cli.url, &cli.id).await?;
    info!(id = %cli.id, "serving reverse streams from {}", cli.url);

    tokio::select! {
        res = origin.serve(&listener) => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("received signal, shutting down");
            listener.close();
        }
    }
    Ok(())
}
