//! Per-request state shared between the server handler and the forwarder.
//!
//! # Responsibilities
//! - Hold the inbound request head and body until the forwarder takes them
//! - Buffer the client response head until the first byte (or an explicit start)
//! - Expose the client-abort token, the upgrade handle and the error record
//!
//! # Data Flow
//! ```text
//! axum handler
//!     → HttpContext::new(request) → (context, ResponseReceiver)
//!     → forwarder runs with &mut context (spawned)
//!     → ClientResponse::start() sends the head through a oneshot
//!     → handler returns that head; the body streams from a ChannelBody
//! ```
//!
//! # Design Decisions
//! - The response head is not sent until something is written, flushed or completed,
//!   so a failure before the first byte can still become a clean 502
//! - Client abort is observed through drop guards: if hyper drops the handler or
//!   the response body before completion, `request_aborted` fires

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use axum::body::Body;
use axum::http::{request, HeaderMap, Request, Response, StatusCode, Version};
use http_body_util::Limited;
use hyper::upgrade::OnUpgrade;
use tokio::io::AsyncWrite;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::forwarder::ForwarderErrorFeature;
use crate::http::body::{body_channel, ChannelBody, ChannelWriter};
use crate::protocol::is_http2_or_greater;

/// HTTP/2 `CANCEL` error code.
pub const H2_CANCEL: u32 = 0x8;
/// HTTP/2 `INTERNAL_ERROR` error code.
pub const H2_INTERNAL_ERROR: u32 = 0x2;

/// How a client response ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseTermination {
    /// Body finished normally.
    Completed,
    /// HTTP/2+ stream reset with the given error code.
    Reset(u32),
    /// HTTP/1.x connection abort.
    Abort,
}

/// Everything the forwarder needs to know about one inbound request.
pub struct HttpContext {
    /// Inbound request head. `extensions` carries hyper's `OnUpgrade`.
    pub request: request::Parts,
    /// Client response under construction.
    pub response: ClientResponse,
    body: Option<Body>,
    can_have_body: Option<bool>,
    max_request_body_size: Option<usize>,
    request_aborted: CancellationToken,
    error: Option<ForwarderErrorFeature>,
}

impl HttpContext {
    /// Split an inbound request into a context and the receiver for its response.
    pub fn new(request: Request<Body>) -> (Self, ResponseReceiver) {
        let (parts, body) = request.into_parts();
        let request_aborted = CancellationToken::new();
        let (head_tx, head_rx) = oneshot::channel();

        let can_have_body = Some(!http_body::Body::is_end_stream(&body));
        let response = ClientResponse::new(parts.version, head_tx, request_aborted.clone());

        let context = Self {
            request: parts,
            response,
            body: Some(body),
            can_have_body,
            max_request_body_size: None,
            request_aborted: request_aborted.clone(),
            error: None,
        };
        let receiver = ResponseReceiver {
            rx: head_rx,
            _guard: request_aborted.drop_guard(),
        };
        (context, receiver)
    }

    /// Whether the server knows if the request has a body; `None` when unknown.
    pub fn can_have_body(&self) -> Option<bool> {
        self.can_have_body
    }

    /// Limit the request body. `None` lifts the limit.
    pub fn set_max_request_body_size(&mut self, limit: Option<usize>) {
        self.max_request_body_size = limit;
    }

    /// Take the request body, wrapped in the configured size limit.
    pub fn take_request_body(&mut self) -> Option<Body> {
        let body = self.body.take()?;
        Some(match self.max_request_body_size {
            Some(limit) => Body::new(Limited::new(body, limit)),
            None => body,
        })
    }

    /// Fires when the client goes away before the response completes.
    pub fn request_aborted(&self) -> &CancellationToken {
        &self.request_aborted
    }

    /// The server can switch this connection to another protocol.
    pub fn is_upgradable(&self) -> bool {
        self.request.extensions.get::<OnUpgrade>().is_some()
    }

    pub fn take_upgrade(&mut self) -> Option<OnUpgrade> {
        self.request.extensions.remove::<OnUpgrade>()
    }

    pub fn error_feature(&self) -> Option<&ForwarderErrorFeature> {
        self.error.as_ref()
    }

    pub fn set_error_feature(&mut self, feature: ForwarderErrorFeature) {
        self.error = Some(feature);
    }
}

/// Waits for the response head produced by the forwarder.
pub struct ResponseReceiver {
    rx: oneshot::Receiver<Response<Body>>,
    _guard: DropGuard,
}

impl ResponseReceiver {
    /// `None` when the context was dropped without producing a response.
    pub async fn recv(self) -> Option<Response<Body>> {
        let Self { rx, _guard } = self;
        let response = rx.await.ok();
        // The body's own guard takes over from here.
        _guard.disarm();
        response
    }
}

/// The response sent back to the client.
///
/// Status and headers are mutable until the head is sent. Writing through
/// `AsyncWrite` sends the head first.
pub struct ClientResponse {
    version: Version,
    status: StatusCode,
    headers: HeaderMap,
    trailers: HeaderMap,
    head_tx: Option<oneshot::Sender<Response<Body>>>,
    writer: ChannelWriter,
    body: Option<ChannelBody>,
    termination: Option<ResponseTermination>,
}

impl ClientResponse {
    fn new(
        version: Version,
        head_tx: oneshot::Sender<Response<Body>>,
        request_aborted: CancellationToken,
    ) -> Self {
        let (writer, body) = body_channel();
        Self {
            version,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            trailers: HeaderMap::new(),
            head_tx: Some(head_tx),
            writer,
            body: Some(body.with_drop_guard(request_aborted.drop_guard())),
            termination: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        if !self.has_started() {
            self.status = status;
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Trailers sent when the response completes.
    pub fn trailers_mut(&mut self) -> &mut HeaderMap {
        &mut self.trailers
    }

    /// The head has been handed to the server.
    pub fn has_started(&self) -> bool {
        self.head_tx.is_none()
    }

    /// Status or head differ from a fresh response.
    pub fn is_set(&self) -> bool {
        self.has_started() || self.status != StatusCode::OK
    }

    pub fn termination(&self) -> Option<ResponseTermination> {
        self.termination
    }

    /// Reset status, headers and trailers. No effect once started.
    pub fn clear(&mut self) {
        if self.has_started() {
            return;
        }
        self.status = StatusCode::OK;
        self.headers.clear();
        self.trailers.clear();
    }

    /// Send the head. The body follows through this writer.
    pub fn start(&mut self) {
        let Some(head_tx) = self.head_tx.take() else {
            return;
        };
        let Some(body) = self.body.take() else {
            return;
        };

        let mut response = Response::new(Body::new(body));
        *response.status_mut() = self.status;
        *response.headers_mut() = std::mem::take(&mut self.headers);
        // The receiver is gone when the client disconnected; writes then fail.
        let _ = head_tx.send(response);
    }

    /// Send a `101 Switching Protocols` head with no body.
    pub fn start_upgrade(&mut self) {
        let Some(head_tx) = self.head_tx.take() else {
            return;
        };
        if let Some(mut body) = self.body.take() {
            body.disarm();
        }

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *response.headers_mut() = std::mem::take(&mut self.headers);
        let _ = head_tx.send(response);
        self.termination = Some(ResponseTermination::Completed);
    }

    /// Send trailers and end the body. Starts the response if needed.
    pub async fn complete(&mut self) -> io::Result<()> {
        if self.termination.is_some() {
            return Ok(());
        }
        self.start();
        self.termination = Some(ResponseTermination::Completed);

        if !self.trailers.is_empty() {
            let trailers = std::mem::take(&mut self.trailers);
            self.writer.send_trailers(trailers).await?;
        }
        tokio::io::AsyncWriteExt::shutdown(&mut self.writer).await
    }

    /// Terminate the response so the client cannot mistake it for a complete one.
    ///
    /// HTTP/2+ records a stream reset (`CANCEL` when `canceled`, else
    /// `INTERNAL_ERROR`); older protocols abort the connection.
    pub fn reset_or_abort(&mut self, canceled: bool) {
        if matches!(
            self.termination,
            Some(ResponseTermination::Reset(_) | ResponseTermination::Abort)
        ) {
            return;
        }
        self.start();

        let termination = if is_http2_or_greater(self.version) {
            ResponseTermination::Reset(if canceled { H2_CANCEL } else { H2_INTERNAL_ERROR })
        } else {
            ResponseTermination::Abort
        };
        self.termination = Some(termination);

        let kind = if canceled {
            io::ErrorKind::Interrupted
        } else {
            io::ErrorKind::ConnectionAborted
        };
        self.writer.abort(io::Error::new(kind, "response aborted by the forwarder"));
    }
}

impl AsyncWrite for ClientResponse {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.start();
        Pin::new(&mut this.writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.start();
        ready!(Pin::new(&mut this.writer).poll_flush(cx))?;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.start();
        this.termination.get_or_insert(ResponseTermination::Completed);
        Pin::new(&mut this.writer).poll_shutdown(cx)
    }
}
