use http::{header, HeaderValue, Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use hyper::{body::Incoming, upgrade::OnUpgrade};
use hyper_util::rt::TokioIo;
use n0_error::{anyerr, Result, StdResultExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::{
    dialer::Dialer,
    error::ProxyError,
    util::{self, BoxError, HttpBody},
};

/// Forwards one inbound request through a parked reverse stream.
///
/// This is the "reverse transport": each forward consumes exactly one
/// parked [`TunneledConn`](crate::TunneledConn) and performs a single
/// HTTP/1.1 exchange over it. The synthetic target `http://<id>` never
/// leaves the broker, the rewritten request only ever travels through a
/// stream that is already bound to the agent.
pub(crate) async fn forward(
    dialer: &Dialer,
    mut req: Request<Incoming>,
    subpath: &str,
) -> Result<Response<HttpBody>, ProxyError> {
    let upgrading = req.version() == Version::HTTP_11 && util::wants_upgrade(req.headers());
    let downstream_upgrade = upgrading.then(|| hyper::upgrade::on(&mut req));

    let conn = dialer.dial().await?;
    let outbound = rewrite_request(req, dialer.id(), subpath, upgrading)?;
    debug!(target = %outbound.uri(), "forwarding request through reverse stream");

    h1_round_trip(conn, outbound, downstream_upgrade)
        .await
        .map_err(ProxyError::bad_gateway)
}

/// Rewrites an inbound request for the tunneled hop: origin-form URI,
/// `Host` set to the agent id, hop-by-hop headers stripped. Without an
/// upgrade in play the exchange is pinned to one stream with
/// `Connection: close`; the tunnel is already HTTP/2, so the hop inside
/// it stays plain HTTP/1.1.
fn rewrite_request(
    req: Request<Incoming>,
    id: &str,
    subpath: &str,
    upgrading: bool,
) -> Result<Request<Incoming>, ProxyError> {
    let (parts, body) = req.into_parts();
    let path_and_query = match parts.uri.query() {
        Some(query) => format!("{subpath}?{query}"),
        None => subpath.to_string(),
    };
    let uri: Uri = path_and_query
        .parse()
        .map_err(|err| ProxyError::internal(anyerr!("invalid proxy subpath: {err}")))?;

    let mut headers = parts.headers;
    let upgrade_protocol = headers.get(header::UPGRADE).cloned();
    util::filter_hop_by_hop_headers(&mut headers);
    let host = HeaderValue::from_str(id)
        .map_err(|err| ProxyError::internal(anyerr!("invalid agent id for host header: {err}")))?;
    headers.insert(header::HOST, host);
    match upgrade_protocol {
        Some(protocol) if upgrading => {
            headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
            headers.insert(header::UPGRADE, protocol);
        }
        _ => {
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
    }

    let mut outbound = Request::builder()
        .method(parts.method)
        .uri(uri)
        .version(Version::HTTP_11)
        .body(body)
        .map_err(|err| ProxyError::internal(anyerr!(err)))?;
    *outbound.headers_mut() = headers;
    Ok(outbound)
}

/// One HTTP/1.1 client exchange over `io`, with optional upgrade
/// splicing back to the inbound side.
///
/// On a `101 Switching Protocols` answer the upgraded byte streams of
/// both sides are joined until either closes; otherwise the response is
/// relayed with hop-by-hop headers stripped and the body streamed.
pub(crate) async fn h1_round_trip<T>(
    io: T,
    outbound: Request<Incoming>,
    downstream_upgrade: Option<OnUpgrade>,
) -> Result<Response<HttpBody>>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .anyerr()?;
    tokio::spawn(async move {
        if let Err(err) = connection.with_upgrades().await {
            debug!("tunneled exchange ended: {err:#}");
        }
    });

    let mut response = sender.send_request(outbound).await.anyerr()?;

    if let Some(downstream) = downstream_upgrade {
        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let upstream = hyper::upgrade::on(&mut response);
            tokio::spawn(splice_upgraded(downstream, upstream));
            // Relay the 101 head verbatim; bytes flow on the upgraded
            // streams from here.
            let (parts, _body) = response.into_parts();
            let mut head = Response::new(util::empty_body());
            *head.status_mut() = parts.status;
            *head.headers_mut() = parts.headers;
            return Ok(head);
        }
    }

    let (mut parts, body) = response.into_parts();
    util::filter_hop_by_hop_headers(&mut parts.headers);
    let body = body.map_err(|err| Box::new(err) as BoxError).boxed_unsync();
    Ok(Response::from_parts(parts, body))
}

async fn splice_upgraded(downstream: OnUpgrade, upstream: OnUpgrade) {
    let downstream = match downstream.await {
        Ok(io) => io,
        Err(err) => {
            warn!("downstream upgrade failed: {err:#}");
            return;
        }
    };
    let upstream = match upstream.await {
        Ok(io) => io,
        Err(err) => {
            warn!("upstream upgrade failed: {err:#}");
            return;
        }
    };
    let (mut client_read, mut client_write) = tokio::io::split(TokioIo::new(downstream));
    let (mut upstream_read, mut upstream_write) = tokio::io::split(TokioIo::new(upstream));
    match util::splice(
        &mut client_read,
        &mut client_write,
        &mut upstream_read,
        &mut upstream_write,
    )
    .await
    {
        Ok(totals) => debug!(
            from_client = totals.from_client,
            from_upstream = totals.from_upstream,
            "upgraded exchange closed"
        ),
        Err(err) => debug!("upgraded exchange ended early: {err}"),
    }
}
