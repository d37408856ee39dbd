use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{header, Request, StatusCode};
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use n0_error::{Result, StdResultExt};
use rustls::{pki_types::CertificateDer, RootCertStore};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_test::traced_test;

use crate::{server::serve_tls, tls, Listener, ListenerError, OriginProxy, ReversePool};

// -- Test helpers --

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct TestBroker {
    url: String,
    ca: CertificateDer<'static>,
    _task: AbortOnDrop,
}

/// Spawns a TLS broker with a self-signed localhost certificate.
async fn spawn_broker() -> Result<TestBroker> {
    tls::install_crypto_provider();
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).anyerr()?;
    let key = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.cert.der().clone()], key.into())
        .anyerr()?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    let listener = TcpListener::bind("localhost:0").await?;
    let addr = listener.local_addr()?;
    let pool = ReversePool::new();
    let task = tokio::spawn(async move {
        let _ = serve_tls(
            listener,
            Arc::new(config),
            pool,
            "/",
            CancellationToken::new(),
        )
        .await;
    });
    debug!(%addr, "spawned broker");
    Ok(TestBroker {
        url: format!("https://localhost:{}", addr.port()),
        ca: cert.cert.der().clone(),
        _task: AbortOnDrop(task),
    })
}

fn agent_tls(ca: &CertificateDer<'static>) -> Arc<rustls::ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add(ca.clone()).unwrap();
    Arc::new(tls::client_config_with_roots(roots))
}

fn broker_client(ca: &CertificateDer<'static>) -> reqwest::Client {
    reqwest::Client::builder()
        .add_root_certificate(reqwest::Certificate::from_der(ca.as_ref()).unwrap())
        .build()
        .unwrap()
}

/// Spawns an agent serving its reverse streams by proxying onto
/// `backend`.
async fn spawn_agent(
    broker: &TestBroker,
    id: &str,
    backend: SocketAddr,
) -> Result<(Arc<Listener>, AbortOnDrop)> {
    let listener = Arc::new(Listener::connect(agent_tls(&broker.ca), &broker.url, id).await?);
    let origin = Arc::new(OriginProxy::new(&format!("http://{backend}"))?);
    let task = tokio::spawn({
        let listener = listener.clone();
        async move {
            let _ = origin.serve(&listener).await;
        }
    });
    debug!(id, "spawned agent");
    Ok((listener, AbortOnDrop(task)))
}

async fn spawn_hello_backend() -> Result<(SocketAddr, AbortOnDrop)> {
    let listener = TcpListener::bind("localhost:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(backend::run_hello(listener));
    Ok((addr, AbortOnDrop(task)))
}

async fn spawn_backend(label: &'static str) -> Result<(SocketAddr, AbortOnDrop)> {
    let listener = TcpListener::bind("localhost:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(backend::run(listener, label));
    Ok((addr, AbortOnDrop(task)))
}

async fn spawn_echo_body_backend(label: &'static str) -> Result<(SocketAddr, AbortOnDrop)> {
    let listener = TcpListener::bind("localhost:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(backend::run_echo_body(listener, label));
    Ok((addr, AbortOnDrop(task)))
}

async fn spawn_upgrade_backend() -> Result<(SocketAddr, AbortOnDrop)> {
    let listener = TcpListener::bind("localhost:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(backend::run_upgrade_echo(listener));
    Ok((addr, AbortOnDrop(task)))
}

// -- Tests --

/// One request end to end: client -> broker -> reverse stream -> agent
/// -> backend and all the way back.
#[tokio::test]
#[traced_test]
async fn single_request_round_trip() -> Result {
    let broker = spawn_broker().await?;
    let (backend_addr, _backend) = spawn_hello_backend().await?;
    let (_listener, _agent) = spawn_agent(&broker, "d001", backend_addr).await?;

    let client = broker_client(&broker.ca);
    let res = client
        .get(format!("{}/proxy/d001/", broker.url))
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.anyerr()?, "Hello world");
    Ok(())
}

/// Pickup replenishment under load: every request consumes a parked
/// stream, so 100 in flight exercises the refill loop hard.
#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn hundred_concurrent_requests() -> Result {
    let broker = spawn_broker().await?;
    let (backend_addr, _backend) = spawn_backend("origin").await?;
    let (_listener, _agent) = spawn_agent(&broker, "d001", backend_addr).await?;

    let client = broker_client(&broker.ca);
    let mut handles = Vec::new();
    for i in 0..100 {
        let client = client.clone();
        let url = format!("{}/proxy/d001/request/{i}", broker.url);
        handles.push(tokio::spawn(async move {
            let res = client.get(&url).send().await?;
            let status = res.status();
            let text = res.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let (status, text) = handle.await.anyerr()?.anyerr()?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, format!("origin GET /request/{i}"));
    }
    Ok(())
}

/// Bad configuration fails before anything touches the network.
#[tokio::test]
async fn listener_rejects_bad_config() {
    tls::install_crypto_provider();
    let tls = Arc::new(tls::client_config_with_roots(RootCertStore::empty()));

    let err = Listener::connect(tls.clone(), "http://broker/", "d001")
        .await
        .unwrap_err();
    assert!(err.is_config());
    assert!(matches!(err, ListenerError::InvalidUrl { .. }));

    let err = Listener::connect(tls, "https://broker/", "")
        .await
        .unwrap_err();
    assert!(err.is_config());
    assert!(matches!(err, ListenerError::EmptyId { .. }));
}

/// The HTTP status contract of the broker paths.
#[tokio::test]
#[traced_test]
async fn broker_path_contract() -> Result {
    let broker = spawn_broker().await?;
    let client = broker_client(&broker.ca);

    let res = client
        .get(format!("{}/nowhere", broker.url))
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .get(format!("{}/proxy", broker.url))
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let res = client
        .get(format!("{}/revdial/extra", broker.url))
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // revdial without an id.
    let res = client
        .get(format!("{}/revdial", broker.url))
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // proxy toward an agent that never registered.
    let res = client
        .get(format!("{}/proxy/ghost/", broker.url))
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(res.headers().get(header::STRICT_TRANSPORT_SECURITY).is_some());
    Ok(())
}

/// Reverse streams only ride HTTP/2; an HTTP/1.1 registration attempt
/// is turned away with 505.
#[tokio::test]
#[traced_test]
async fn revdial_requires_http2() -> Result {
    let broker = spawn_broker().await?;
    let client = reqwest::Client::builder()
        .add_root_certificate(reqwest::Certificate::from_der(broker.ca.as_ref()).unwrap())
        .http1_only()
        .build()
        .unwrap();

    let res = client
        .get(format!("{}/revdial?id=d001", broker.url))
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::HTTP_VERSION_NOT_SUPPORTED);
    Ok(())
}

/// An agent can come back under the same id after its listener closed.
#[tokio::test]
#[traced_test]
async fn agent_reconnects_under_same_id() -> Result {
    let broker = spawn_broker().await?;
    let (backend_addr, _backend) = spawn_hello_backend().await?;
    let client = broker_client(&broker.ca);

    let (listener, agent_task) = spawn_agent(&broker, "d001", backend_addr).await?;
    let res = client
        .get(format!("{}/proxy/d001/", broker.url))
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::OK);

    listener.close();
    drop(agent_task);
    drop(listener);
    // Give the broker a moment to see the control stream die.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (_listener, _agent) = spawn_agent(&broker, "d001", backend_addr).await?;
    let res = client
        .get(format!("{}/proxy/d001/", broker.url))
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.anyerr()?, "Hello world");
    Ok(())
}

/// A request body streams through the tunnel unchanged.
#[tokio::test]
#[traced_test]
async fn post_body_streams_through() -> Result {
    let broker = spawn_broker().await?;
    let (backend_addr, _backend) = spawn_echo_body_backend("origin").await?;
    let (_listener, _agent) = spawn_agent(&broker, "d001", backend_addr).await?;

    let client = broker_client(&broker.ca);
    let res = client
        .post(format!("{}/proxy/d001/data", broker.url))
        .body("hello request body")
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.text().await.anyerr()?,
        "origin POST /data: hello request body"
    );
    Ok(())
}

/// Upgrade requests splice raw bytes in both directions until either
/// side closes.
#[tokio::test]
#[traced_test]
async fn upgrade_splices_both_directions() -> Result {
    let broker = spawn_broker().await?;
    let (backend_addr, _backend) = spawn_upgrade_backend().await?;
    let (_listener, _agent) = spawn_agent(&broker, "d001", backend_addr).await?;

    // Upgrades ride HTTP/1.1, so talk to the broker with a raw hyper
    // client instead of reqwest.
    let addr = broker.url.strip_prefix("https://").unwrap().to_string();
    let tcp = TcpStream::connect(&addr).await?;
    let connector = tokio_rustls::TlsConnector::from(agent_tls(&broker.ca));
    let server_name = rustls::pki_types::ServerName::try_from("localhost".to_string()).unwrap();
    let tls_stream = connector.connect(server_name, tcp).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls_stream))
        .await
        .anyerr()?;
    let conn_task = tokio::spawn(async move {
        let _ = conn.with_upgrades().await;
    });

    let req = Request::builder()
        .method(http::Method::GET)
        .uri("/proxy/d001/echo")
        .header(header::HOST, "localhost")
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "echo")
        .body(Empty::<Bytes>::new())
        .anyerr()?;
    let response = sender.send_request(req).await.anyerr()?;
    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);

    let upgraded = hyper::upgrade::on(response).await.anyerr()?;
    let mut io = TokioIo::new(upgraded);
    io.write_all(b"ping").await?;
    let mut buf = [0u8; 4];
    io.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"ping");
    io.write_all(b"pong").await?;
    io.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"pong");

    conn_task.abort();
    Ok(())
}

// -- Backend servers the agents proxy onto --

mod backend {
    use std::convert::Infallible;

    use http_body_util::{BodyExt, Full};
    use hyper::{body::Bytes, server::conn::http1, service::service_fn, Request, Response};
    use hyper_util::rt::TokioIo;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    /// Always answers `Hello world`.
    pub(super) async fn run_hello(listener: TcpListener) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            tokio::task::spawn(async move {
                let service = service_fn(|_req: Request<hyper::body::Incoming>| async {
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from("Hello world"))))
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    }

    /// Answers `{label} {METHOD} {PATH}`.
    pub(super) async fn run(listener: TcpListener, label: &'static str) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            tokio::task::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| async move {
                    let body = format!("{} {} {}", label, req.method(), req.uri().path());
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    }

    /// Answers `{label} {METHOD} {PATH}: {BODY}`.
    pub(super) async fn run_echo_body(listener: TcpListener, label: &'static str) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            tokio::task::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| async move {
                    let method = req.method().clone();
                    let path = req.uri().path().to_string();
                    let body = req.collect().await.unwrap().to_bytes();
                    let body = String::from_utf8_lossy(&body);
                    let response = format!("{} {} {}: {}", label, method, path, body);
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(response))))
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    }

    /// Upgrades any `Upgrade: echo` request and echoes raw bytes back.
    pub(super) async fn run_upgrade_echo(listener: TcpListener) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            tokio::task::spawn(async move {
                let service = service_fn(|mut req: Request<hyper::body::Incoming>| async move {
                    if !req.headers().contains_key(http::header::UPGRADE) {
                        let mut res = Response::new(Full::new(Bytes::from("no upgrade")));
                        *res.status_mut() = http::StatusCode::BAD_REQUEST;
                        return Ok::<_, Infallible>(res);
                    }
                    let on_upgrade = hyper::upgrade::on(&mut req);
                    tokio::spawn(async move {
                        let Ok(upgraded) = on_upgrade.await else {
                            return;
                        };
                        let mut io = TokioIo::new(upgraded);
                        let mut buf = [0u8; 1024];
                        loop {
                            match io.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => {
                                    if io.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    });
                    let mut res = Response::new(Full::new(Bytes::new()));
                    *res.status_mut() = http::StatusCode::SWITCHING_PROTOCOLS;
                    res.headers_mut().insert(
                        http::header::CONNECTION,
                        http::HeaderValue::from_static("Upgrade"),
                    );
                    res.headers_mut()
                        .insert(http::header::UPGRADE, http::HeaderValue::from_static("echo"));
                    Ok::<_, Infallible>(res)
                });
                let _ = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await;
            });
        }
    }
}
