use std::{io, sync::Arc, time::Duration};

use n0_error::{e, Result, StdResultExt};
use tokio::{
    io::{AsyncBufReadExt, BufReader, ReadHalf},
    sync::{mpsc, Mutex},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, warn, Instrument};

use crate::{
    conn::TunneledConn,
    control::{self, Command, ControlMsg},
    error::DialError,
    MAX_PARKED_CONNS,
};

/// How long `dial` waits for a parked reverse stream.
pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Cadence of keep-alive messages on the control stream. Paired with
/// the agent's read-idle cutoff so broken NATs surface on both ends.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Broker-side handle to one agent's reverse streams.
///
/// A `Dialer` owns the agent's control stream and a bounded mailbox of
/// parked [`TunneledConn`]s. `dial` pops a stream FIFO and asks the
/// agent for a replacement; the control loop keeps the agent alive
/// through NATs and keeps the mailbox topped up.
pub struct Dialer {
    id: String,
    parked_tx: mpsc::Sender<TunneledConn>,
    parked_rx: Mutex<mpsc::Receiver<TunneledConn>>,
    // Unbounded: a lost conn-ready would leave a parking slot empty for
    // good, and the agent's permit bucket already caps real pickups.
    messages_tx: mpsc::UnboundedSender<ControlMsg>,
    done: CancellationToken,
}

impl Dialer {
    /// Binds a dialer to an agent's control stream and starts its
    /// control loop.
    pub fn new(id: impl Into<String>, control: TunneledConn) -> Arc<Self> {
        let id = id.into();
        let (parked_tx, parked_rx) = mpsc::channel(MAX_PARKED_CONNS);
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            id: id.clone(),
            parked_tx,
            parked_rx: Mutex::new(parked_rx),
            messages_tx,
            done: CancellationToken::new(),
        });
        tokio::spawn(
            dialer
                .clone()
                .serve(control, messages_rx)
                .instrument(error_span!("control", id = %id)),
        );
        dialer
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Fires when the dialer closes, on purpose or after a control
    /// stream failure.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Closes the dialer. Pending dials and deliveries fail, parked
    /// streams are dropped, the control loop unwinds.
    pub fn close(&self) {
        if !self.done.is_cancelled() {
            debug!(id = %self.id, "closing reverse dialer");
        }
        self.done.cancel();
    }

    /// Parks one ready reverse stream for this agent. Blocks while the
    /// mailbox is at capacity.
    pub(crate) async fn deliver(&self, conn: TunneledConn) -> Result<(), DialError> {
        tokio::select! {
            res = self.parked_tx.send(conn) => res.map_err(|_| e!(DialError::Closed)),
            _ = self.done.cancelled() => Err(e!(DialError::Closed)),
        }
    }

    /// Pops a parked stream, FIFO. Waits up to [`DIAL_TIMEOUT`], then
    /// gives up so a stuck agent cannot park the proxy path forever.
    pub async fn dial(&self) -> Result<TunneledConn, DialError> {
        let mut parked = self.parked_rx.lock().await;
        let deadline = Instant::now() + DIAL_TIMEOUT;
        loop {
            let conn = tokio::select! {
                conn = parked.recv() => conn.ok_or_else(|| e!(DialError::Closed))?,
                _ = self.done.cancelled() => return Err(e!(DialError::Closed)),
                _ = tokio::time::sleep_until(deadline) => return Err(e!(DialError::Timeout)),
            };
            self.request_stream();
            // An agent that went away leaves dead streams behind.
            if conn.is_closed() {
                debug!(id = %self.id, "discarding dead parked stream");
                continue;
            }
            return Ok(conn);
        }
    }

    /// Asks the agent for one more reverse stream. Best effort, the
    /// write loop owns the control stream.
    fn request_stream(&self) {
        let _ = self.messages_tx.send(ControlMsg::conn_ready());
    }

    async fn serve(
        self: Arc<Self>,
        control: TunneledConn,
        mut messages_rx: mpsc::UnboundedReceiver<ControlMsg>,
    ) {
        let (reader, mut writer) = tokio::io::split(control);

        let read_task = tokio::spawn({
            let this = self.clone();
            async move {
                if let Err(err) = this.read_loop(reader).await {
                    debug!("control stream read ended: {err:#}");
                }
                this.close();
            }
            .instrument(tracing::Span::current())
        });

        // Fill the agent's parking slots.
        for _ in 0..MAX_PARKED_CONNS {
            self.request_stream();
        }

        let mut keep_alive = tokio::time::interval_at(
            Instant::now() + KEEP_ALIVE_INTERVAL,
            KEEP_ALIVE_INTERVAL,
        );
        loop {
            let msg = tokio::select! {
                _ = self.done.cancelled() => break,
                _ = keep_alive.tick() => ControlMsg::keep_alive(),
                msg = messages_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            if let Err(err) = control::write_message(&mut writer, &msg).await {
                warn!("error writing control message to agent: {err:#}");
                break;
            }
        }
        self.close();
        read_task.abort();

        // Drop anything still parked so the owning streams unwind.
        let mut parked = self.parked_rx.lock().await;
        parked.close();
        while let Ok(conn) = parked.try_recv() {
            drop(conn);
        }
    }

    async fn read_loop(&self, reader: ReadHalf<TunneledConn>) -> Result<()> {
        let mut lines = BufReader::new(reader);
        let mut line = String::new();
        loop {
            line.clear();
            let n = match lines.read_line(&mut line).await {
                Ok(n) => n,
                // Agent went away and the control conn closed under us.
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
                Err(err) => return Err(err).anyerr(),
            };
            if n == 0 {
                return Ok(());
            }
            let msg: ControlMsg = match serde_json::from_str(line.trim_end()) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!("invalid control message {line:?}: {err}");
                    return Ok(());
                }
            };
            match msg.command {
                Command::PickupFailed => {
                    warn!(
                        err = msg.err.as_deref().unwrap_or(""),
                        "agent failed to pick up reverse stream"
                    );
                    // Ask again; the agent paces itself with backoff.
                    self.request_stream();
                }
                Command::KeepAlive => {}
                command => debug!(?command, "ignoring control message"),
            }
        }
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
