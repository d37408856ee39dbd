use std::{
    io,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf},
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::util;

/// Chunks the read pump may hold before back-pressuring the peer.
const READ_PUMP_DEPTH: usize = 8;
const READ_CHUNK: usize = 16 * 1024;

/// A byte-oriented duplex connection over one reverse HTTP/2 stream.
///
/// The two halves are the stream's request and response bodies: on the
/// broker the reader is the inbound request body and the writer feeds
/// the response; on the agent the reader is the response body and the
/// writer feeds the outbound request. The conn owns exactly those two
/// halves, nothing below them.
///
/// Reads go through a pump task so they stay cancellable and honor
/// deadlines even while the underlying body blocks. Close is idempotent
/// and observable through [`TunneledConn::done`]; it fires before any
/// later deadline does.
pub struct TunneledConn {
    read_rx: mpsc::Receiver<io::Result<Bytes>>,
    read_buf: Bytes,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    pump: JoinHandle<()>,
    done: CancellationToken,
    closed: bool,
    read_deadline: Deadline,
    write_deadline: Deadline,
    write_waker: Arc<WakerSlot>,
}

impl TunneledConn {
    pub(crate) fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let (tx, rx) = mpsc::channel(READ_PUMP_DEPTH);
        let done = CancellationToken::new();
        let write_waker = Arc::new(WakerSlot::default());
        let pump = tokio::spawn(read_pump(
            Box::new(reader),
            tx,
            done.clone(),
            write_waker.clone(),
        ));
        Self {
            read_rx: rx,
            read_buf: Bytes::new(),
            writer: Box::new(writer),
            pump,
            done,
            closed: false,
            read_deadline: Deadline::new(),
            write_deadline: Deadline::new(),
            write_waker,
        }
    }

    /// A handle that fires once the conn is closed, by either side.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Arms the read deadline. `None` disarms, re-opening a fired latch;
    /// a past instant fails pending and future reads immediately.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.read_deadline.set(deadline);
    }

    /// Arms the write deadline, with the same semantics as reads.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.write_deadline.set(deadline);
    }

    /// Arms both deadlines at once.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.read_deadline.set(deadline);
        self.write_deadline.set(deadline);
    }

    /// Placeholder address, the conn has no socket of its own.
    pub fn local_addr(&self) -> TunnelAddr {
        TunnelAddr
    }

    pub fn peer_addr(&self) -> TunnelAddr {
        TunnelAddr
    }
}

impl std::fmt::Debug for TunneledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunneledConn")
            .field("closed", &self.is_closed())
            .field("buffered", &self.read_buf.len())
            .finish_non_exhaustive()
    }
}

impl Drop for TunneledConn {
    fn drop(&mut self) {
        self.done.cancel();
        self.pump.abort();
    }
}

/// Reads the underlying half into the conn's channel until EOF, error,
/// or the conn goes away. EOF and errors both close the conn: buffered
/// chunks were already handed off, so once the channel drains all
/// further I/O observes the closed pipe.
async fn read_pump(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    tx: mpsc::Sender<io::Result<Bytes>>,
    done: CancellationToken,
    write_waker: Arc<WakerSlot>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                break;
            }
        }
    }
    trace!("tunneled conn read side finished");
    done.cancel();
    write_waker.wake();
}

impl AsyncRead for TunneledConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(closed_pipe()));
        }
        if this.read_deadline.poll_expired(cx) {
            return Poll::Ready(Err(deadline_exceeded()));
        }
        if this.read_buf.is_empty() {
            match this.read_rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                // Pump gone and channel drained: the conn closed when
                // the underlying reader ended.
                Poll::Ready(None) => return Poll::Ready(Err(closed_pipe())),
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(err)),
                Poll::Ready(Some(Ok(chunk))) => this.read_buf = chunk,
            }
        }
        let n = this.read_buf.len().min(out.remaining());
        out.put_slice(&this.read_buf.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TunneledConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.write_waker.register(cx);
        if this.closed || this.done.is_cancelled() {
            return Poll::Ready(Err(closed_pipe()));
        }
        if this.write_deadline.poll_expired(cx) {
            return Poll::Ready(Err(deadline_exceeded()));
        }
        // The writer half runs inside a foreign response handler; a
        // panic there must not tear down whoever is writing through us.
        match panic::catch_unwind(AssertUnwindSafe(|| {
            Pin::new(&mut this.writer).poll_write(cx, buf)
        })) {
            Ok(poll) => poll,
            Err(payload) => {
                warn!(
                    "recovered panic writing to tunneled conn: {}",
                    util::panic_message(payload.as_ref())
                );
                Poll::Ready(Err(closed_pipe()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(closed_pipe()));
        }
        Pin::new(&mut this.writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.closed {
            this.closed = true;
            this.done.cancel();
            this.pump.abort();
        }
        Pin::new(&mut this.writer).poll_shutdown(cx)
    }
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "tunneled conn closed")
}

fn deadline_exceeded() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")
}

/// Placeholder address for [`TunneledConn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[display("tunnel")]
pub struct TunnelAddr;

#[derive(Default)]
struct WakerSlot(Mutex<Option<Waker>>);

impl WakerSlot {
    fn register(&self, cx: &Context<'_>) {
        *self.0.lock().unwrap() = Some(cx.waker().clone());
    }

    fn wake(&self) {
        if let Some(waker) = self.0.lock().unwrap().take() {
            waker.wake();
        }
    }
}

/// A resettable one-shot deadline latch.
///
/// Arming spawns a timer task; re-arming aborts the previous timer
/// before the new one starts. The epoch guards against a stale timer
/// firing a latch that was reset underneath it.
pub(crate) struct Deadline {
    inner: Arc<Mutex<DeadlineState>>,
}

#[derive(Default)]
struct DeadlineState {
    expired: bool,
    epoch: u64,
    timer: Option<JoinHandle<()>>,
    waker: Option<Waker>,
}

impl Deadline {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(DeadlineState::default())),
        }
    }

    fn set(&self, deadline: Option<Instant>) {
        let mut state = self.inner.lock().unwrap();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.epoch += 1;
        let Some(at) = deadline else {
            state.expired = false;
            return;
        };
        if at <= Instant::now() {
            if !state.expired {
                state.expired = true;
                if let Some(waker) = state.waker.take() {
                    waker.wake();
                }
            }
            return;
        }
        state.expired = false;
        let epoch = state.epoch;
        let inner = self.inner.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            fire(&inner, epoch);
        }));
    }

    /// True when the latch has fired. Otherwise parks the caller's waker
    /// so an expiry wakes the pending I/O.
    fn poll_expired(&self, cx: &mut Context<'_>) -> bool {
        let mut state = self.inner.lock().unwrap();
        if state.expired {
            true
        } else {
            state.waker = Some(cx.waker().clone());
            false
        }
    }
}

fn fire(inner: &Mutex<DeadlineState>, epoch: u64) {
    let mut state = inner.lock().unwrap();
    if state.epoch == epoch && !state.expired {
        state.expired = true;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    /// Conn over an in-memory pipe, far end returned for the peer role.
    fn pipe_conn() -> (TunneledConn, tokio::io::DuplexStream) {
        let (local, far) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(local);
        (TunneledConn::new(read, write), far)
    }

    #[tokio::test]
    async fn round_trips_bytes() {
        let (mut conn, mut far) = pipe_conn();
        far.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        conn.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_io() {
        let (mut conn, _far) = pipe_conn();
        let done = conn.done();
        conn.shutdown().await.unwrap();
        conn.shutdown().await.unwrap();
        assert!(done.is_cancelled());

        let err = conn.read(&mut [0u8; 4]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        let err = conn.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn past_read_deadline_fails_until_rearmed() {
        let (mut conn, mut far) = pipe_conn();
        far.write_all(b"data").await.unwrap();

        conn.set_read_deadline(Some(Instant::now() - Duration::from_secs(1)));
        let err = conn.read(&mut [0u8; 4]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        // Stays expired until disarmed.
        let err = conn.read(&mut [0u8; 4]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        conn.set_read_deadline(None);
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");
    }

    #[tokio::test]
    async fn future_read_deadline_interrupts_pending_read() {
        let (mut conn, _far) = pipe_conn();
        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));
        let err = conn.read(&mut [0u8; 4]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn past_write_deadline_fails_writes() {
        let (mut conn, _far) = pipe_conn();
        conn.set_write_deadline(Some(Instant::now() - Duration::from_secs(1)));
        let err = conn.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        conn.set_write_deadline(None);
        conn.write_all(b"x").await.unwrap();
    }

    struct PanicWriter;

    impl AsyncWrite for PanicWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            panic!("writer exploded");
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn write_panics_are_recovered() {
        let (local, _far) = tokio::io::duplex(64);
        let (read, _write) = tokio::io::split(local);
        let mut conn = TunneledConn::new(read, PanicWriter);

        let err = conn.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        // The conn survives the panic.
        let err = conn.write(b"y").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn peer_eof_closes_conn() {
        let (mut conn, mut far) = pipe_conn();
        let done = conn.done();
        far.write_all(b"bye").await.unwrap();
        drop(far);

        // Bytes delivered before the EOF still come out.
        let mut buf = [0u8; 3];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"bye");

        done.cancelled().await;
        let err = conn.read(&mut [0u8; 4]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        let err = conn.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
