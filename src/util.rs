use std::{
    convert::Infallible,
    io,
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Response, StatusCode};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::sync::PollSender;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body used everywhere on the broker and agent servers.
pub(crate) type HttpBody = UnsyncBoxBody<Bytes, BoxError>;

/// Frames buffered between a conn writer and the transport.
pub(crate) const BODY_CHANNEL_DEPTH: usize = 8;

/// Largest chunk a single conn write turns into one body frame.
const MAX_WRITE_CHUNK: usize = 16 * 1024;

/// Adapts a streaming HTTP body into an [`AsyncRead`] over its data frames.
///
/// Trailer frames are skipped; end of body reads as EOF.
pub(crate) struct BodyReader<B> {
    body: B,
    buf: Bytes,
}

impl<B> BodyReader<B> {
    pub(crate) fn new(body: B) -> Self {
        Self {
            body,
            buf: Bytes::new(),
        }
    }
}

impl<B> AsyncRead for BodyReader<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.buf.is_empty() {
            match ready!(Pin::new(&mut this.body).poll_frame(cx)) {
                None => return Poll::Ready(Ok(())),
                Some(Err(err)) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, err.into())));
                }
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        this.buf = data;
                    }
                }
            }
        }
        let n = this.buf.len().min(out.remaining());
        out.put_slice(&this.buf.split_to(n));
        Poll::Ready(Ok(()))
    }
}

/// Write half of a tunneled conn. Every write becomes one body frame and
/// is handed to the transport immediately, so nothing buffers between a
/// write and the peer beyond HTTP/2 flow control.
pub(crate) struct ChannelWriter {
    tx: PollSender<Bytes>,
}

impl ChannelWriter {
    pub(crate) fn new(tx: tokio::sync::mpsc::Sender<Bytes>) -> Self {
        Self {
            tx: PollSender::new(tx),
        }
    }
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = self.get_mut();
        if ready!(this.tx.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        let n = buf.len().min(MAX_WRITE_CHUNK);
        if this.tx.send_item(Bytes::copy_from_slice(&buf[..n])).is_err() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames leave on write.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().tx.close();
        Poll::Ready(Ok(()))
    }
}

/// Turns the receiving end of a [`ChannelWriter`] into a streaming body.
pub(crate) fn channel_body(rx: tokio::sync::mpsc::Receiver<Bytes>) -> HttpBody {
    let frames = ReceiverStream::new(rx).map(|chunk| Ok::<_, Infallible>(Frame::data(chunk)));
    StreamBody::new(frames)
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub(crate) fn full_body(text: impl Into<Bytes>) -> HttpBody {
    Full::new(text.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub(crate) fn empty_body() -> HttpBody {
    full_body(Bytes::new())
}

pub(crate) fn text_response(status: StatusCode, message: &str) -> Response<HttpBody> {
    let mut res = Response::new(full_body(message.to_string()));
    *res.status_mut() = status;
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// True when the request asks for a protocol upgrade.
pub(crate) fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Strips hop-by-hop headers per RFC 9110, including anything nominated
/// by `Connection`, before a request or response crosses the tunnel.
pub(crate) fn filter_hop_by_hop_headers(headers: &mut HeaderMap) {
    let nominated: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();
    for name in nominated {
        headers.remove(name.as_str());
    }
    for name in [
        "connection",
        "proxy-connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ] {
        headers.remove(name);
    }
}

/// Byte totals of one spliced exchange, per direction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SpliceTotals {
    pub(crate) from_client: u64,
    pub(crate) from_upstream: u64,
}

/// Splices an upgraded client connection with the far side of the same
/// exchange, copying raw bytes both ways until either end closes.
///
/// Each direction shuts its writer down once drained, so the peer sees
/// the close instead of hanging on a half-open stream. The first I/O
/// error wins; bytes already copied are reported through it regardless.
pub(crate) async fn splice(
    client_read: &mut (impl AsyncRead + Send + Unpin),
    client_write: &mut (impl AsyncWrite + Send + Unpin),
    upstream_read: &mut (impl AsyncRead + Send + Unpin),
    upstream_write: &mut (impl AsyncWrite + Send + Unpin),
) -> io::Result<SpliceTotals> {
    let client_to_upstream = async {
        let copied = tokio::io::copy(client_read, upstream_write).await;
        upstream_write.shutdown().await.ok();
        copied
    };
    let upstream_to_client = async {
        let copied = tokio::io::copy(upstream_read, client_write).await;
        client_write.shutdown().await.ok();
        copied
    };
    let (from_client, from_upstream) = tokio::join!(client_to_upstream, upstream_to_client);
    Ok(SpliceTotals {
        from_client: from_client?,
        from_upstream: from_upstream?,
    })
}
