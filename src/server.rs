use std::{convert::Infallible, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use http::StatusCode;
use hyper::service::service_fn;
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::conn::auto,
};
use n0_error::{Result, StdResultExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, warn, Instrument};

use crate::{pool::ReversePool, util};

/// Server-side HTTP/2 pings toward parked agents: send after 30s idle,
/// drop the connection after 15s without an ack. This is what detects
/// NATs that silently dropped an agent.
const H2_PING_INTERVAL: Duration = Duration::from_secs(30);
const H2_PING_TIMEOUT: Duration = Duration::from_secs(15);

/// Serves the broker handler over TLS until `shutdown` fires.
///
/// Agents arrive over HTTP/2; plain external clients may use either
/// HTTP/1.1 (required for `Upgrade` pass-through) or HTTP/2, so the
/// connection protocol is auto-detected after TLS. Requests outside
/// `base_path` are not routed. A panic in a handler is caught and
/// answered with a 500, leaving the other requests multiplexed on the
/// same connection untouched.
pub async fn serve_tls(
    listener: TcpListener,
    tls: Arc<rustls::ServerConfig>,
    pool: Arc<ReversePool>,
    base_path: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(tls);
    let base = base_path.trim_end_matches('/').to_string();
    let mut conn_id = 0u64;
    loop {
        let (stream, peer_addr) = tokio::select! {
            res = listener.accept() => res.anyerr()?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        conn_id += 1;
        let acceptor = acceptor.clone();
        let pool = pool.clone();
        let base = base.clone();
        tokio::spawn(
            async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        debug!("tls handshake failed: {err:#}");
                        return;
                    }
                };
                let service = service_fn(move |req| {
                    let pool = pool.clone();
                    let base = base.clone();
                    async move {
                        if !under_base(&base, req.uri().path()) {
                            return Ok(util::text_response(
                                StatusCode::NOT_FOUND,
                                "revdial: no handler for path",
                            ));
                        }
                        // One panicking handler must not take down the
                        // other requests multiplexed on this connection.
                        match AssertUnwindSafe(pool.handle(req)).catch_unwind().await {
                            Ok(res) => Ok::<_, Infallible>(res),
                            Err(payload) => {
                                let message = util::panic_message(payload.as_ref()).to_string();
                                warn!("request handler panicked: {message}");
                                Ok(util::text_response(
                                    StatusCode::INTERNAL_SERVER_ERROR,
                                    &message,
                                ))
                            }
                        }
                    }
                });
                let mut builder = auto::Builder::new(TokioExecutor::new());
                builder
                    .http2()
                    .timer(TokioTimer::new())
                    .keep_alive_interval(H2_PING_INTERVAL)
                    .keep_alive_timeout(H2_PING_TIMEOUT);
                if let Err(err) = builder
                    .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                    .await
                {
                    debug!("connection ended: {err:#}");
                }
            }
            .instrument(error_span!("conn", id = conn_id, peer = %peer_addr)),
        );
    }
}

fn under_base(base: &str, path: &str) -> bool {
    base.is_empty() || path == base || path.starts_with(&format!("{base}/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_path_scoping() {
        assert!(under_base("", "/anything"));
        assert!(under_base("/tunnels", "/tunnels/revdial"));
        assert!(under_base("/tunnels", "/tunnels"));
        assert!(!under_base("/tunnels", "/other/revdial"));
        assert!(!under_base("/tunnels", "/tunnelsish"));
    }
}
