use std::{convert::Infallible, net::IpAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{Method, Request, StatusCode, Uri};
use http_body_util::{combinators::BoxBody, BodyExt, StreamBody};
use hyper::{body::Frame, client::conn::http2};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use n0_error::{anyerr, e, AnyError, Result, StdResultExt};
use rand::Rng;
use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncBufReadExt, BufReader, ReadHalf},
    net::TcpStream,
    sync::{mpsc, Mutex, Semaphore},
    task::JoinHandle,
};
use tokio_rustls::TlsConnector;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error_span, warn, Instrument};

use crate::{
    conn::TunneledConn,
    control::{self, Command, ControlMsg},
    error::{AcceptError, ListenerError},
    util::{self, BodyReader, ChannelWriter},
    MAX_PARKED_CONNS, PATH_REVDIAL, URL_PARAM_ID,
};

/// Request body of a reverse stream: an open-ended byte channel.
type StreamRequestBody = BoxBody<Bytes, Infallible>;

/// Client-side HTTP/2 pings toward the broker: send after 30s idle,
/// give up after 15s without an ack, so dead NAT mappings surface.
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(15);

/// The control stream is considered dead after this long without any
/// traffic; the broker keep-alives every 15s.
const CONTROL_READ_IDLE: Duration = Duration::from_secs(45);

/// Ceiling for the linear pickup backoff, plus up to 500ms of jitter.
const MAX_PICKUP_BACKOFF: Duration = Duration::from_secs(30);

/// Agent-side reverse listener.
///
/// Keeps up to [`MAX_PARKED_CONNS`] outbound reverse streams open
/// against `<broker>/revdial?id=<id>`, multiplexed over one HTTP/2
/// connection, and yields each stream from [`accept`](Self::accept) as
/// a [`TunneledConn`] once the broker hands it a request. The listener
/// never parses the bytes it accepts; run any HTTP server on top.
pub struct Listener {
    shared: Arc<Shared>,
    accept_rx: Mutex<mpsc::Receiver<TunneledConn>>,
    driver: JoinHandle<()>,
}

struct Shared {
    url: Uri,
    sender: Mutex<http2::SendRequest<StreamRequestBody>>,
    accept_tx: mpsc::Sender<TunneledConn>,
    messages_tx: mpsc::Sender<ControlMsg>,
    done: CancellationToken,
    tasks: TaskTracker,
    pickup_permits: Arc<Semaphore>,
    retries: std::sync::Mutex<u32>,
    read_err: std::sync::Mutex<Option<AnyError>>,
}

impl Listener {
    /// Dials the broker, opens the control stream, and starts the
    /// control loop.
    ///
    /// `tls` supplies the trust configuration for the broker; the URL
    /// must be `https` and the id non-empty.
    pub async fn connect(
        tls: Arc<rustls::ClientConfig>,
        broker_url: &str,
        id: &str,
    ) -> Result<Self, ListenerError> {
        let url: Uri = server_url(broker_url, id)?.parse().map_err(|_| {
            e!(ListenerError::InvalidUrl {
                url: broker_url.to_string(),
            })
        })?;
        let host = url.host().unwrap_or_default().to_string();
        let port = url.port_u16().unwrap_or(443);

        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|source| e!(ListenerError::Connect { source }))?;
        let tls_stream = TlsConnector::from(tls)
            .connect(server_name(&host)?, tcp)
            .await
            .map_err(|source| e!(ListenerError::Tls { source }))?;

        let (mut sender, connection) = http2::Builder::new(TokioExecutor::new())
            .timer(TokioTimer::new())
            .keep_alive_interval(PING_INTERVAL)
            .keep_alive_timeout(PING_TIMEOUT)
            .keep_alive_while_idle(true)
            .handshake(TokioIo::new(tls_stream))
            .await
            .map_err(|err| e!(ListenerError::Dial, anyerr!(err)))?;

        let span = error_span!("listener", id = %id);
        let driver = tokio::spawn(
            async move {
                if let Err(err) = connection.await {
                    debug!("broker connection ended: {err:#}");
                }
            }
            .instrument(span.clone()),
        );

        let control = open_stream(&mut sender, &url)
            .await
            .map_err(|err| e!(ListenerError::Dial, err))?;
        debug!(parent: &span, "control stream established");

        let (accept_tx, accept_rx) = mpsc::channel(MAX_PARKED_CONNS);
        let (messages_tx, messages_rx) = mpsc::channel(MAX_PARKED_CONNS * 2);
        let shared = Arc::new(Shared {
            url,
            sender: Mutex::new(sender),
            accept_tx,
            messages_tx,
            done: CancellationToken::new(),
            tasks: TaskTracker::new(),
            pickup_permits: Arc::new(Semaphore::new(MAX_PARKED_CONNS)),
            retries: std::sync::Mutex::new(0),
            read_err: std::sync::Mutex::new(None),
        });
        tokio::spawn(shared.clone().run(control, messages_rx).instrument(span));

        Ok(Self {
            shared,
            accept_rx: Mutex::new(accept_rx),
            driver,
        })
    }

    /// Waits for the next reverse stream the broker routed a request
    /// onto. Fails once the listener is closed; a control stream
    /// failure that caused the shutdown is attached as the source.
    pub async fn accept(&self) -> Result<TunneledConn, AcceptError> {
        let mut accept_rx = self.accept_rx.lock().await;
        let conn = tokio::select! {
            conn = accept_rx.recv() => conn,
            _ = self.shared.done.cancelled() => None,
        };
        match conn {
            Some(conn) => {
                debug!("accepted reverse stream");
                Ok(conn)
            }
            None => match self.shared.read_err.lock().unwrap().take() {
                Some(source) => Err(e!(AcceptError::ControlFailed, source)),
                None => Err(e!(AcceptError::Closed)),
            },
        }
    }

    /// Closes the listener: pending accepts fail, in-flight pickups
    /// unwind, the broker connection is torn down. Idempotent.
    pub fn close(&self) {
        self.shared.close();
        self.driver.abort();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.done.is_cancelled()
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("url", &self.shared.url)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn close(&self) {
        if !self.done.is_cancelled() {
            debug!("closing listener");
            self.done.cancel();
            self.tasks.close();
        }
    }

    async fn run(self: Arc<Self>, control: TunneledConn, mut messages_rx: mpsc::Receiver<ControlMsg>) {
        let (reader, mut writer) = tokio::io::split(control);

        let write_task = tokio::spawn({
            let this = self.clone();
            async move {
                loop {
                    let msg = tokio::select! {
                        _ = this.done.cancelled() => return,
                        msg = messages_rx.recv() => match msg {
                            Some(msg) => msg,
                            None => return,
                        },
                    };
                    if let Err(err) = control::write_message(&mut writer, &msg).await {
                        warn!("error writing control message to broker: {err:#}");
                        this.close();
                        return;
                    }
                }
            }
            .instrument(tracing::Span::current())
        });

        if let Err(err) = Self::read_loop(&self, reader).await {
            warn!("control stream failed: {err:#}");
            *self.read_err.lock().unwrap() = Some(err);
        }
        self.close();
        write_task.abort();
    }

    async fn read_loop(this: &Arc<Shared>, reader: ReadHalf<TunneledConn>) -> Result<()> {
        let mut lines = BufReader::new(reader);
        let mut line = String::new();
        loop {
            line.clear();
            let read = tokio::select! {
                _ = this.done.cancelled() => return Ok(()),
                res = tokio::time::timeout(CONTROL_READ_IDLE, lines.read_line(&mut line)) => res,
            };
            let n = match read {
                Ok(res) => res.anyerr()?,
                Err(_) => {
                    return Err(anyerr!(
                        "no control traffic from broker for {:?}",
                        CONTROL_READ_IDLE
                    ));
                }
            };
            if n == 0 {
                return Err(anyerr!("control stream closed by broker"));
            }
            let msg: ControlMsg =
                serde_json::from_str(line.trim_end()).std_context("invalid control message")?;
            match msg.command {
                Command::ConnReady => Self::spawn_pickup(this),
                Command::KeepAlive => {}
                command => debug!(?command, "ignoring control message"),
            }
        }
    }

    /// Launches one pickup, gated by the permit bucket. A permit is held
    /// until the picked-up stream is spent, which is what caps how many
    /// reverse streams this agent keeps at the broker.
    fn spawn_pickup(this: &Arc<Shared>) {
        let this = this.clone();
        this.tasks.clone().spawn(
            async move {
                let permit = tokio::select! {
                    permit = this.pickup_permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                    _ = this.done.cancelled() => return,
                };
                this.pickup().await;
                drop(permit);
            }
            .instrument(error_span!("pickup")),
        );
    }

    async fn pickup(&self) {
        let conn = {
            let mut sender = self.sender.lock().await;
            open_stream(&mut sender, &self.url).await
        };
        let conn = match conn {
            Ok(conn) => {
                *self.retries.lock().unwrap() = 0;
                conn
            }
            Err(err) => {
                warn!("reverse stream pickup failed: {err:#}");
                self.send_message(ControlMsg::pickup_failed(format!("{err:#}")))
                    .await;
                let backoff = self.next_backoff();
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = self.done.cancelled() => {}
                }
                return;
            }
        };

        let conn_done = conn.done();
        tokio::select! {
            res = self.accept_tx.send(conn) => {
                if res.is_err() {
                    return;
                }
            }
            // Racing a close: the stream is dropped, not surfaced.
            _ = self.done.cancelled() => return,
        }
        debug!("reverse stream parked for accept");

        // Hold the pickup slot until the stream is spent.
        tokio::select! {
            _ = conn_done.cancelled() => {}
            _ = self.done.cancelled() => {}
        }
    }

    fn next_backoff(&self) -> Duration {
        let mut retries = self.retries.lock().unwrap();
        *retries += 1;
        pickup_backoff(*retries) + Duration::from_millis(rand::rng().random_range(0..500))
    }

    async fn send_message(&self, msg: ControlMsg) {
        let _ = self.messages_tx.send(msg).await;
    }
}

/// Opens one reverse stream: a GET with a streaming request body whose
/// response body becomes the read half of the conn.
async fn open_stream(
    sender: &mut http2::SendRequest<StreamRequestBody>,
    url: &Uri,
) -> Result<TunneledConn> {
    sender.ready().await.anyerr()?;
    let (tx, rx) = mpsc::channel::<Bytes>(util::BODY_CHANNEL_DEPTH);
    let body: StreamRequestBody =
        StreamBody::new(ReceiverStream::new(rx).map(|chunk| Ok::<_, Infallible>(Frame::data(chunk))))
            .boxed();
    let req = Request::builder()
        .method(Method::GET)
        .uri(url.clone())
        .body(body)
        .anyerr()?;
    let response = sender.send_request(req).await.anyerr()?;
    if response.status() != StatusCode::OK {
        return Err(anyerr!("status code {}", response.status().as_u16()));
    }
    Ok(TunneledConn::new(
        BodyReader::new(response.into_body()),
        ChannelWriter::new(tx),
    ))
}

/// Linear pickup backoff, capped; jitter comes on top.
fn pickup_backoff(retries: u32) -> Duration {
    Duration::from_secs(u64::from(retries) * 2).min(MAX_PICKUP_BACKOFF)
}

/// Builds `<base>/revdial?id=<id>`, validating the broker base URL.
pub fn server_url(host: &str, id: &str) -> Result<String, ListenerError> {
    if id.is_empty() {
        return Err(e!(ListenerError::EmptyId));
    }
    let parsed: Uri = host.parse().map_err(|_| {
        e!(ListenerError::InvalidUrl {
            url: host.to_string(),
        })
    })?;
    if parsed.scheme_str() != Some("https") || parsed.host().is_none() {
        return Err(e!(ListenerError::InvalidUrl {
            url: host.to_string(),
        }));
    }
    let trimmed = host.trim_end_matches('/');
    Ok(format!("{trimmed}/{PATH_REVDIAL}?{URL_PARAM_ID}={id}"))
}

fn server_name(host: &str) -> Result<ServerName<'static>, ListenerError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string()).map_err(|_| {
        e!(ListenerError::InvalidUrl {
            url: host.to_string(),
        })
    })
}
