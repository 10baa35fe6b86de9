//! Byte-stream adapters over HTTP bodies.
//!
//! # Responsibilities
//! - `BodyReader`: read any `http_body::Body` through `AsyncRead`, keeping trailers
//! - `body_channel`: a writer/body pair so a copy loop can produce a body that
//!   hyper (client or server side) consumes
//!
//! # Design Decisions
//! - The channel holds a single frame, so a flush means "the consumer took it"
//! - Aborting is out of band: a stalled consumer still sees the error as soon as it
//!   polls again, and a truncated body is never mistaken for a complete one
//! - A zero-length read on `BodyReader` waits for the next data frame, which is what
//!   the copier uses to probe without holding a buffer

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{ready, Context, Poll};

use axum::http::HeaderMap;
use bytes::{Buf, Bytes};
use futures_util::task::AtomicWaker;
use http_body::{Body as HttpBody, Frame};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{DropGuard, PollSender};

use crate::forwarder::BoxError;

type FrameResult = Result<Frame<Bytes>, io::Error>;

/// `AsyncRead` over the data frames of an HTTP body.
pub struct BodyReader<B> {
    body: B,
    chunk: Bytes,
    trailers: Option<HeaderMap>,
    done: bool,
}

impl<B> BodyReader<B>
where
    B: HttpBody<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    pub fn new(body: B) -> Self {
        Self {
            body,
            chunk: Bytes::new(),
            trailers: None,
            done: false,
        }
    }

    /// Trailers seen so far; complete once the reader has returned end of stream.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    pub fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }

    fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.chunk.is_empty() && !self.done {
            match ready!(Pin::new(&mut self.body).poll_frame(cx)) {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => self.chunk = data,
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            self.trailers.get_or_insert_with(HeaderMap::new).extend(trailers);
                        }
                    }
                },
                Some(Err(error)) => return Poll::Ready(Err(io::Error::other(error.into()))),
                None => self.done = true,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<B> AsyncRead for BodyReader<B>
where
    B: HttpBody<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_chunk(cx))?;

        let n = this.chunk.len().min(buf.remaining());
        buf.put_slice(&this.chunk[..n]);
        this.chunk.advance(n);
        Poll::Ready(Ok(()))
    }
}

#[derive(Default)]
struct AbortState {
    aborted: AtomicBool,
    error: Mutex<Option<io::Error>>,
    waker: AtomicWaker,
}

impl AbortState {
    fn abort(&self, error: io::Error) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
        self.aborted.store(true, Ordering::Release);
        self.waker.wake();
    }

    fn take_error(&self) -> io::Error {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::ConnectionAborted, "body aborted"))
    }
}

/// Create a connected writer and body.
pub fn body_channel() -> (ChannelWriter, ChannelBody) {
    let (tx, rx) = mpsc::channel(1);
    let abort = Arc::new(AbortState::default());
    let writer = ChannelWriter {
        tx: Some(PollSender::new(tx)),
        abort: abort.clone(),
    };
    let body = ChannelBody {
        rx,
        abort,
        done: false,
        on_drop: None,
    };
    (writer, body)
}

/// Writing half of [`body_channel`].
pub struct ChannelWriter {
    /// `None` once finished. Dropping the sender also drops any permit reserved by
    /// a flush, which is what lets the consumer see end of stream.
    tx: Option<PollSender<FrameResult>>,
    abort: Arc<AbortState>,
}

fn consumer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "body consumer went away")
}

impl ChannelWriter {
    fn sender(&mut self) -> io::Result<&mut PollSender<FrameResult>> {
        self.tx
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "body already finished"))
    }

    /// Send a trailers frame. The body ends after the writer is shut down.
    pub async fn send_trailers(&mut self, trailers: HeaderMap) -> io::Result<()> {
        let tx = self.sender()?;
        std::future::poll_fn(|cx| tx.poll_reserve(cx))
            .await
            .map_err(|_| consumer_gone())?;
        tx.send_item(Ok(Frame::trailers(trailers)))
            .map_err(|_| consumer_gone())
    }

    /// Fail the body. The consumer observes `error` on its next poll even if it has
    /// not drained earlier frames.
    pub fn abort(&mut self, error: io::Error) {
        self.abort.abort(error);
        self.tx = None;
    }
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let tx = self.sender()?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        ready!(tx.poll_reserve(cx)).map_err(|_| consumer_gone())?;
        tx.send_item(Ok(Frame::data(Bytes::copy_from_slice(buf))))
            .map_err(|_| consumer_gone())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Some(tx) = self.tx.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        // A free slot means every frame written so far has been taken.
        ready!(tx.poll_reserve(cx)).map_err(|_| consumer_gone())?;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx = None;
        Poll::Ready(Ok(()))
    }
}

/// Reading half of [`body_channel`]; an `http_body::Body`.
pub struct ChannelBody {
    rx: mpsc::Receiver<FrameResult>,
    abort: Arc<AbortState>,
    done: bool,
    on_drop: Option<DropGuard>,
}

impl ChannelBody {
    /// Cancel `guard`'s token if this body is dropped before it reaches its end.
    pub fn with_drop_guard(mut self, guard: DropGuard) -> Self {
        self.on_drop = Some(guard);
        self
    }

    /// Release the drop guard without cancelling.
    pub fn disarm(&mut self) {
        if let Some(guard) = self.on_drop.take() {
            guard.disarm();
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.disarm();
    }
}

impl HttpBody for ChannelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        this.abort.waker.register(cx.waker());
        if this.abort.aborted.load(Ordering::Acquire) {
            this.finish();
            return Poll::Ready(Some(Err(this.abort.take_error())));
        }

        match ready!(this.rx.poll_recv(cx)) {
            Some(Ok(frame)) => Poll::Ready(Some(Ok(frame))),
            Some(Err(error)) => {
                this.finish();
                Poll::Ready(Some(Err(error)))
            }
            None => {
                this.finish();
                if this.abort.aborted.load(Ordering::Acquire) {
                    return Poll::Ready(Some(Err(this.abort.take_error())));
                }
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done
    }
}
