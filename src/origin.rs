use std::{convert::Infallible, sync::Arc};

use http::{header, HeaderValue, Request, Response, StatusCode, Uri, Version};
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper_util::rt::TokioIo;
use n0_error::{ensure_any, Result, StackResultExt, StdResultExt};
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::{
    error::AcceptError,
    listener::Listener,
    proxy,
    util::{self, BoxError, HttpBody},
};

/// Agent-side single-host forwarder.
///
/// Serves the reverse streams a [`Listener`] accepts and relays every
/// request onto one configured target URL, streaming bodies in both
/// directions. `Upgrade` requests are spliced straight through to the
/// target.
pub struct OriginProxy {
    target: Uri,
    client: reqwest::Client,
}

impl OriginProxy {
    pub fn new(target: &str) -> Result<Self> {
        let target: Uri = target.parse().std_context("invalid origin target url")?;
        ensure_any!(
            matches!(target.scheme_str(), Some("http") | Some("https")),
            "origin target must be an http(s) url"
        );
        ensure_any!(target.host().is_some(), "origin target must have a host");
        Ok(Self {
            target,
            client: reqwest::Client::new(),
        })
    }

    /// Serves accepted reverse streams until the listener closes.
    pub async fn serve(self: Arc<Self>, listener: &Listener) -> Result<(), AcceptError> {
        loop {
            let conn = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                let service = hyper::service::service_fn(move |req| {
                    let this = this.clone();
                    async move { Ok::<_, Infallible>(this.relay(req).await) }
                });
                if let Err(err) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(conn), service)
                    .with_upgrades()
                    .await
                {
                    debug!("reverse stream ended: {err:#}");
                }
            });
        }
    }

    async fn relay(&self, req: Request<Incoming>) -> Response<HttpBody> {
        let result = if req.version() == Version::HTTP_11 && util::wants_upgrade(req.headers()) {
            self.relay_upgrade(req).await
        } else {
            self.relay_request(req).await
        };
        result.unwrap_or_else(|err| {
            warn!("forwarding to origin failed: {err:#}");
            util::text_response(StatusCode::BAD_GATEWAY, "origin unreachable")
        })
    }

    /// Ordinary requests go through the shared HTTP client with the
    /// body streamed, hop-by-hop headers filtered on both legs.
    async fn relay_request(&self, req: Request<Incoming>) -> Result<Response<HttpBody>> {
        let (parts, body) = req.into_parts();
        let url = self.target_url(&parts.uri);
        debug!(%url, method = %parts.method, "forwarding request to origin");

        let mut headers = parts.headers;
        util::filter_hop_by_hop_headers(&mut headers);
        headers.remove(header::HOST);

        let body = reqwest::Body::wrap_stream(
            BodyStream::new(body)
                .map(|frame| frame.map(|frame| frame.into_data().unwrap_or_default())),
        );
        let response = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .anyerr()?;

        let status = response.status();
        let mut headers = response.headers().clone();
        util::filter_hop_by_hop_headers(&mut headers);
        let body = StreamBody::new(
            response
                .bytes_stream()
                .map(|chunk| chunk.map(Frame::data).map_err(|err| Box::new(err) as BoxError)),
        )
        .boxed_unsync();

        let mut out = Response::new(body);
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        Ok(out)
    }

    /// Upgrade requests bypass the HTTP client: one dedicated TCP
    /// connection to the target, relay the `101`, then splice raw bytes
    /// until either side closes.
    async fn relay_upgrade(&self, mut req: Request<Incoming>) -> Result<Response<HttpBody>> {
        ensure_any!(
            self.target.scheme_str() == Some("http"),
            "upgrade forwarding requires an http origin"
        );
        let host = self.target.host().context("origin target missing host")?;
        let port = self.target.port_u16().unwrap_or(80);
        let stream = TcpStream::connect((host, port))
            .await
            .std_context("connecting to origin for upgrade")?;
        debug!(path = %req.uri().path(), "forwarding upgrade request to origin");

        let downstream_upgrade = hyper::upgrade::on(&mut req);
        let outbound = self.rewrite_upgrade_request(req)?;
        proxy::h1_round_trip(stream, outbound, Some(downstream_upgrade)).await
    }

    fn rewrite_upgrade_request(&self, req: Request<Incoming>) -> Result<Request<Incoming>> {
        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = path_and_query.parse().anyerr()?;

        let mut headers = parts.headers;
        let protocol = headers
            .get(header::UPGRADE)
            .cloned()
            .context("upgrade request without upgrade header")?;
        util::filter_hop_by_hop_headers(&mut headers);
        let authority = self.target.authority().context("origin target missing authority")?;
        headers.insert(
            header::HOST,
            HeaderValue::from_str(authority.as_str()).anyerr()?,
        );
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, protocol);

        let mut outbound = Request::builder()
            .method(parts.method)
            .uri(uri)
            .version(Version::HTTP_11)
            .body(body)
            .anyerr()?;
        *outbound.headers_mut() = headers;
        Ok(outbound)
    }

    /// Joins the target base with the request path and query, single
    /// host reverse-proxy style.
    fn target_url(&self, uri: &Uri) -> String {
        let scheme = self.target.scheme_str().unwrap_or("http");
        let authority = self
            .target
            .authority()
            .map(|authority| authority.as_str())
            .unwrap_or_default();
        let base = self.target.path().trim_end_matches('/');
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        format!("{scheme}://{authority}{base}{path_and_query}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(target: &str) -> OriginProxy {
        OriginProxy::new(target).unwrap()
    }

    #[test]
    fn rejects_non_http_targets() {
        assert!(OriginProxy::new("ftp://host/").is_err());
        assert!(OriginProxy::new("host:8080").is_err());
        assert!(OriginProxy::new("http://127.0.0.1:8080").is_ok());
    }

    #[test]
    fn joins_target_and_request_paths() {
        let uri: Uri = "/api/v1?watch=true".parse().unwrap();
        assert_eq!(
            proxy("http://backend:8080").target_url(&uri),
            "http://backend:8080/api/v1?watch=true"
        );
        assert_eq!(
            proxy("http://backend:8080/base/").target_url(&uri),
            "http://backend:8080/base/api/v1?watch=true"
        );
    }

    #[test]
    fn root_requests_keep_a_path() {
        let uri: Uri = "/".parse().unwrap();
        assert_eq!(
            proxy("http://backend:8080").target_url(&uri),
            "http://backend:8080/"
        );
    }
}
