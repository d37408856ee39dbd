use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use http::{header, HeaderValue, Request, Response, StatusCode, Version};
use hyper::body::Incoming;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    conn::TunneledConn,
    dialer::Dialer,
    proxy,
    util::{self, BodyReader, ChannelWriter, HttpBody},
    PATH_PROXY, PATH_REVDIAL, URL_PARAM_ID,
};

/// Registry of agents currently holding reverse streams open, keyed by
/// agent id, plus the broker request handler that feeds it.
///
/// The pool exclusively owns its dialers. A dialer is created when an
/// agent's first `revdial` request arrives and lives until it closes or
/// [`ReversePool::close`] tears everything down.
pub struct ReversePool {
    dialers: Mutex<HashMap<String, Arc<Dialer>>>,
}

impl ReversePool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dialers: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the dialer for `id`, if that agent ever registered.
    pub fn get_dialer(&self, id: &str) -> Option<Arc<Dialer>> {
        self.dialers.lock().unwrap().get(id).cloned()
    }

    /// Registers a dialer bound to `control`. A live dialer for the same
    /// id wins and `control` is dropped; a closed one is replaced, so an
    /// agent can come back under its old id.
    pub fn create_dialer(&self, id: &str, control: TunneledConn) -> Arc<Dialer> {
        let mut dialers = self.dialers.lock().unwrap();
        if let Some(existing) = dialers.get(id) {
            if !existing.is_closed() {
                return existing.clone();
            }
        }
        debug!(id, "registering reverse dialer");
        let dialer = Dialer::new(id, control);
        dialers.insert(id.to_string(), dialer.clone());
        dialer
    }

    /// Closes every dialer. The registry itself lives until drop.
    pub fn close(&self) {
        for dialer in self.dialers.lock().unwrap().values() {
            dialer.close();
        }
    }

    /// Routes one broker request: reverse stream parking, control-plane
    /// registration, or forward proxying.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<HttpBody> {
        let mut res = match route_path(req.uri().path()) {
            Route::NotFound => {
                util::text_response(StatusCode::NOT_FOUND, "revdial: no handler for path")
            }
            Route::Invalid(msg) => util::text_response(StatusCode::INTERNAL_SERVER_ERROR, msg),
            Route::RevDial => self.handle_revdial(req).await,
            Route::Proxy { id, subpath } => self.handle_proxy(req, id, subpath).await,
        };
        res.headers_mut().insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=15768000; includeSubDomains"),
        );
        res
    }

    /// An agent parking a reverse stream. The first stream per id (or
    /// per returning agent) becomes the control plane; later ones are
    /// data streams delivered into the dialer's mailbox.
    ///
    /// Either way the response body stays open for the life of the
    /// wrapped conn; that streaming body is what keeps the HTTP/2
    /// stream, and with it the parked conn, alive.
    async fn handle_revdial(&self, req: Request<Incoming>) -> Response<HttpBody> {
        if req.version() != Version::HTTP_2 {
            return util::text_response(
                StatusCode::HTTP_VERSION_NOT_SUPPORTED,
                "reverse streams require HTTP/2",
            );
        }
        let id = match query_param(req.uri().query(), URL_PARAM_ID) {
            Some(id) if !id.is_empty() => id,
            _ => {
                return util::text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "only reverse connections with id supported",
                );
            }
        };

        let body = req.into_body();
        let (tx, rx) = mpsc::channel(util::BODY_CHANNEL_DEPTH);
        let conn = TunneledConn::new(BodyReader::new(body), ChannelWriter::new(tx));

        match self.get_dialer(&id) {
            Some(dialer) if !dialer.is_closed() => {
                debug!(id, "parking reverse stream");
                if dialer.deliver(conn).await.is_err() {
                    return util::text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "reverse dialer closed",
                    );
                }
            }
            _ => {
                self.create_dialer(&id, conn);
            }
        }

        Response::new(util::channel_body(rx))
    }

    async fn handle_proxy(
        &self,
        req: Request<Incoming>,
        id: String,
        subpath: String,
    ) -> Response<HttpBody> {
        let Some(dialer) = self.get_dialer(&id).filter(|dialer| !dialer.is_closed()) else {
            return util::text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "not reverse connections for this id available",
            );
        };
        match proxy::forward(&dialer, req, &subpath).await {
            Ok(res) => res,
            Err(err) => {
                warn!(id, "proxying through reverse stream failed: {err:#}");
                let status = err.response_status().unwrap_or(StatusCode::BAD_GATEWAY);
                util::text_response(status, "reverse stream unavailable")
            }
        }
    }
}

/// Which role a broker path selects.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Route {
    RevDial,
    Proxy { id: String, subpath: String },
    NotFound,
    Invalid(&'static str),
}

/// Scans path segments right to left for the `revdial` or `proxy`
/// token; the first match wins, which keeps the scheme agnostic to
/// whatever base path the handler is mounted under.
pub(crate) fn route_path(path: &str) -> Route {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    for (i, segment) in segments.iter().enumerate().rev() {
        if *segment == PATH_REVDIAL {
            if i != segments.len() - 1 {
                return Route::Invalid("revdial: only last element on path allowed");
            }
            return Route::RevDial;
        }
        if *segment == PATH_PROXY {
            if i == segments.len() - 1 {
                return Route::Invalid("proxy: reverse path id required");
            }
            let id = segments[i + 1].to_string();
            let mut subpath = String::from("/");
            subpath.push_str(&segments[i + 2..].join("/"));
            return Route::Proxy { id, subpath };
        }
    }
    Route::NotFound
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}
