//! Outbound request body that streams the client's body on demand.
//!
//! # Responsibilities
//! - Hand the send primitive a body that starts copying the first time it is polled
//! - Run the copy in its own task so the response can arrive while the request
//!   body is still flowing (bidirectional streaming)
//! - Publish the copy result so the forwarder can reconcile it with the response
//!
//! # Design Decisions
//! - Starting twice is an error, never a silent second copy
//! - A copy that is never started never completes; callers check `started()`
//!   before waiting on it
//! - Input failures and cancellation fail the outbound body so the destination
//!   does not mistake a truncated upload for a complete one

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;

use crate::forwarder::activity::ActivityToken;
use crate::forwarder::copier::{StreamCopier, StreamCopyOutcome, StreamCopyResult};
use crate::http::body::{body_channel, BodyReader, ChannelBody, ChannelWriter};
use crate::observability::telemetry::ForwarderStage;

/// A request body copy was started more than once.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("the request body has already been consumed")]
pub struct BodyConsumedError;

struct CopyState {
    started: AtomicBool,
}

struct PendingCopy {
    source: BodyReader<Body>,
    copier: StreamCopier,
    activity: ActivityToken,
    promised_length: Option<u64>,
    auto_flush: bool,
    completion: oneshot::Sender<StreamCopyResult>,
}

impl PendingCopy {
    async fn run(mut self, mut writer: ChannelWriter) {
        self.copier.telemetry().forwarder_stage(ForwarderStage::RequestContentTransferStart);

        // Nothing is queued yet, so this only fails when the consumer already dropped the body.
        let result = match writer.flush().await {
            Err(error) => StreamCopyResult {
                outcome: StreamCopyOutcome::OutputError,
                error: Some(Arc::new(error)),
                bytes: 0,
            },
            Ok(()) => {
                self.copier
                    .copy(
                        true,
                        &mut self.source,
                        &mut writer,
                        self.promised_length,
                        &self.activity,
                        self.auto_flush,
                    )
                    .await
            }
        };

        match result.outcome {
            StreamCopyOutcome::Success => {
                let _ = writer.shutdown().await;
            }
            StreamCopyOutcome::InputError | StreamCopyOutcome::Canceled => {
                let kind = if result.outcome == StreamCopyOutcome::Canceled {
                    io::ErrorKind::Interrupted
                } else {
                    io::ErrorKind::ConnectionAborted
                };
                writer.abort(io::Error::new(kind, "request body copy failed"));
            }
            StreamCopyOutcome::OutputError => {}
        }

        let _ = self.completion.send(result);
    }
}

enum ContentState {
    Pending(Box<PendingCopy>),
    Streaming(ChannelBody),
    Done,
}

/// Body attached to the outbound request.
pub struct StreamCopyHttpContent {
    state: ContentState,
    shared: Arc<CopyState>,
    size_hint: SizeHint,
}

/// Forwarder-side view of the copy started by [`StreamCopyHttpContent`].
pub struct RequestBodyCopyTask {
    shared: Arc<CopyState>,
    completion: Option<oneshot::Receiver<StreamCopyResult>>,
    result: Option<StreamCopyResult>,
}

/// Build the outbound body and the handle used to observe its copy.
pub fn request_body_copy(
    source: Body,
    copier: StreamCopier,
    activity: ActivityToken,
    promised_length: Option<u64>,
    auto_flush: bool,
) -> (StreamCopyHttpContent, RequestBodyCopyTask) {
    let shared = Arc::new(CopyState {
        started: AtomicBool::new(false),
    });
    let (completion, completion_rx) = oneshot::channel();

    let pending = PendingCopy {
        source: BodyReader::new(source),
        copier,
        activity,
        promised_length,
        auto_flush,
        completion,
    };

    let content = StreamCopyHttpContent {
        state: ContentState::Pending(Box::new(pending)),
        shared: shared.clone(),
        size_hint: promised_length.map(SizeHint::with_exact).unwrap_or_default(),
    };
    let task = RequestBodyCopyTask {
        shared,
        completion: Some(completion_rx),
        result: None,
    };
    (content, task)
}

impl StreamCopyHttpContent {
    /// Start the copy. Called implicitly on the first poll.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<(), BodyConsumedError> {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Err(BodyConsumedError);
        }
        let ContentState::Pending(pending) = std::mem::replace(&mut self.state, ContentState::Done) else {
            return Err(BodyConsumedError);
        };

        let (writer, body) = body_channel();
        tokio::spawn(pending.run(writer));
        self.state = ContentState::Streaming(body);
        Ok(())
    }
}

impl HttpBody for StreamCopyHttpContent {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        let this = self.get_mut();
        if matches!(this.state, ContentState::Pending(_)) {
            if let Err(error) = this.start() {
                return Poll::Ready(Some(Err(io::Error::other(error))));
            }
        }

        match &mut this.state {
            ContentState::Streaming(body) => Pin::new(body).poll_frame(cx),
            ContentState::Pending(_) | ContentState::Done => Poll::Ready(None),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.state {
            ContentState::Streaming(body) => body.is_end_stream(),
            ContentState::Pending(_) => false,
            ContentState::Done => true,
        }
    }

    fn size_hint(&self) -> SizeHint {
        self.size_hint.clone()
    }
}

impl RequestBodyCopyTask {
    /// The send primitive asked for the body.
    pub fn started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    /// The copy has a result.
    pub fn is_completed(&mut self) -> bool {
        if self.result.is_some() {
            return true;
        }
        let Some(rx) = self.completion.as_mut() else {
            return false;
        };
        match rx.try_recv() {
            Ok(result) => {
                self.result = Some(result);
                self.completion = None;
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.result = Some(StreamCopyResult::canceled(0));
                self.completion = None;
                true
            }
        }
    }

    pub fn in_progress(&mut self) -> bool {
        self.started() && !self.is_completed()
    }

    /// Wait for the copy to finish. Only meaningful once `started()`.
    pub async fn consumption(&mut self) -> StreamCopyResult {
        if let Some(result) = &self.result {
            return result.clone();
        }
        let result = match self.completion.take() {
            Some(rx) => rx.await.unwrap_or_else(|_| StreamCopyResult::canceled(0)),
            None => StreamCopyResult::canceled(0),
        };
        self.result = Some(result.clone());
        result
    }
}
