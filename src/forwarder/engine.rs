//! The forwarding pipeline for one request.
//!
//! # Data Flow
//! ```text
//! rent activity timer (linked to client abort)
//!     → build outbound request (method, version, body copy, transform, URI)
//!     → send; wait for the response head
//!     → copy status + headers (transform); 101 → upgrade.rs
//!     → copy response body; copy trailers
//!     → wait for the request body copy if it started
//!     → return activity timer, report stop
//! ```
//!
//! # Design Decisions
//! - Never panics on I/O and never returns an error value to the caller: every
//!   failure is classified, recorded on the context and turned into a status, a
//!   reset or an abort
//! - When both body directions fail, the request body wins only if it had
//!   already finished before the response failure was seen
//! - The response head is sent lazily; a failure before the first byte can still
//!   produce a clean 502

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, StatusCode, Version};

use crate::forwarder::activity::{ActivityCancellation, ActivityTimeoutPool};
use crate::forwarder::client::ForwarderHttpClient;
use crate::forwarder::config::ForwarderRequestConfig;
use crate::forwarder::content::{request_body_copy, RequestBodyCopyTask, StreamCopyHttpContent};
use crate::forwarder::copier::{StreamCopier, StreamCopyOutcome, StreamCopyResult};
use crate::forwarder::error::{
    combine_causes, is_timeout, BoxError, ForwarderError, ForwarderErrorFeature, SharedError,
};
use crate::forwarder::upgrade;
use crate::http::body::BodyReader;
use crate::http::HttpContext;
use crate::observability::telemetry::{ForwarderStage, ForwarderTelemetry};
use crate::protocol::{
    content_length, get_http_method, is_http2_or_greater, is_streaming_request, is_upgrade_request,
    make_destination_address, request_has_body, restore_upgrade_headers, HttpVersionPolicy,
    MINIMUM_PREFIX_LEN,
};
use crate::transforms::{HttpTransformer, ProxyRequest};

/// Why the send step failed.
enum SendFailure {
    /// Building the outbound request failed.
    Creation(BoxError),
    /// The activity token fired while waiting for the response head.
    Canceled,
    /// The send primitive reported a timeout of its own.
    TimedOut(BoxError),
    Transport(BoxError),
}

impl SendFailure {
    fn from_client(error: BoxError) -> Self {
        if is_timeout(&*error) {
            SendFailure::TimedOut(error)
        } else {
            SendFailure::Transport(error)
        }
    }

    /// Classification used when neither the client nor the request body explain
    /// the failure.
    fn into_parts(self) -> (ForwarderError, StatusCode, SharedError) {
        match self {
            SendFailure::Creation(error) => (
                ForwarderError::RequestCreation,
                StatusCode::BAD_GATEWAY,
                SharedError::from(error),
            ),
            SendFailure::Canceled => (
                ForwarderError::RequestTimedOut,
                StatusCode::GATEWAY_TIMEOUT,
                Arc::new(io::Error::new(io::ErrorKind::TimedOut, "the request was canceled")),
            ),
            SendFailure::TimedOut(error) => (
                ForwarderError::RequestTimedOut,
                StatusCode::GATEWAY_TIMEOUT,
                SharedError::from(error),
            ),
            SendFailure::Transport(error) => (
                ForwarderError::Request,
                StatusCode::BAD_GATEWAY,
                SharedError::from(error),
            ),
        }
    }
}

fn shared(error: Arc<io::Error>) -> SharedError {
    error
}

/// Map a request body copy outcome to its error and fallback status.
fn request_body_error(outcome: StreamCopyOutcome) -> (ForwarderError, StatusCode) {
    match outcome {
        StreamCopyOutcome::InputError => (ForwarderError::RequestBodyClient, StatusCode::BAD_REQUEST),
        StreamCopyOutcome::OutputError => (ForwarderError::RequestBodyDestination, StatusCode::BAD_GATEWAY),
        StreamCopyOutcome::Canceled | StreamCopyOutcome::Success => {
            (ForwarderError::RequestBodyCanceled, StatusCode::BAD_GATEWAY)
        }
    }
}

fn response_body_error(outcome: StreamCopyOutcome) -> ForwarderError {
    match outcome {
        StreamCopyOutcome::InputError => ForwarderError::ResponseBodyDestination,
        StreamCopyOutcome::OutputError => ForwarderError::ResponseBodyClient,
        StreamCopyOutcome::Canceled | StreamCopyOutcome::Success => ForwarderError::ResponseBodyCanceled,
    }
}

/// Failures caused by the client or by cancellation are expected noise.
fn is_quiet(error: ForwarderError) -> bool {
    matches!(
        error,
        ForwarderError::RequestCanceled
            | ForwarderError::RequestBodyCanceled
            | ForwarderError::RequestBodyClient
            | ForwarderError::ResponseBodyCanceled
            | ForwarderError::ResponseBodyClient
            | ForwarderError::UpgradeRequestCanceled
            | ForwarderError::UpgradeRequestClient
            | ForwarderError::UpgradeResponseCanceled
            | ForwarderError::UpgradeResponseClient
    )
}

/// Forwards requests to a destination. One instance serves every request.
pub struct HttpForwarder {
    copier: StreamCopier,
    activity_pool: Arc<ActivityTimeoutPool>,
    telemetry: Arc<dyn ForwarderTelemetry>,
}

impl HttpForwarder {
    pub fn new(telemetry: Arc<dyn ForwarderTelemetry>) -> Self {
        Self {
            copier: StreamCopier::new(telemetry.clone()),
            activity_pool: Arc::new(ActivityTimeoutPool::new()),
            telemetry,
        }
    }

    pub(crate) fn copier(&self) -> &StreamCopier {
        &self.copier
    }

    pub(crate) fn telemetry(&self) -> &dyn ForwarderTelemetry {
        self.telemetry.as_ref()
    }

    /// Forward the request in `context` to `destination_prefix` and stream the
    /// response back.
    ///
    /// Always completes with an outcome; on failure the context carries a
    /// [`ForwarderErrorFeature`] and the client response reflects the failure.
    pub async fn send<C, T>(
        &self,
        context: &mut HttpContext,
        destination_prefix: &str,
        client: &C,
        request_config: &ForwarderRequestConfig,
        transformer: &T,
    ) -> ForwarderError
    where
        C: ForwarderHttpClient + ?Sized,
        T: HttpTransformer + ?Sized,
    {
        debug_assert!(destination_prefix.len() >= MINIMUM_PREFIX_LEN);

        self.telemetry.forwarder_start(destination_prefix);
        let activity = self
            .activity_pool
            .rent(request_config.activity_timeout, context.request_aborted());

        let error = self
            .forward(context, destination_prefix, client, request_config, transformer, &activity)
            .await;

        activity.return_to_pool();
        self.telemetry.forwarder_stop(context.response.status());
        error
    }

    async fn forward<C, T>(
        &self,
        context: &mut HttpContext,
        destination_prefix: &str,
        client: &C,
        request_config: &ForwarderRequestConfig,
        transformer: &T,
        activity: &ActivityCancellation,
    ) -> ForwarderError
    where
        C: ForwarderHttpClient + ?Sized,
        T: HttpTransformer + ?Sized,
    {
        let is_client_http2 = is_http2_or_greater(context.request.version);
        let is_streaming = is_streaming_request(context.request.version, &context.request.headers);

        let created = self
            .create_request(context, destination_prefix, request_config, transformer, activity, is_streaming)
            .await;
        let (request, mut content) = match created {
            Ok(Some(created)) => created,
            // A transform produced the response itself.
            Ok(None) => return ForwarderError::None,
            Err(error) => {
                return self
                    .handle_request_failure(context, None, SendFailure::Creation(error), transformer, activity)
                    .await
            }
        };

        self.telemetry.forwarder_stage(ForwarderStage::SendStart);
        let sent = tokio::select! {
            biased;
            _ = activity.token().cancelled() => Err(SendFailure::Canceled),
            sent = client.send(request) => sent.map_err(SendFailure::from_client),
        };
        let mut response = match sent {
            Ok(response) => response,
            Err(failure) => {
                return self
                    .handle_request_failure(context, content.as_mut(), failure, transformer, activity)
                    .await
            }
        };
        self.telemetry.forwarder_stage(ForwarderStage::SendStop);
        activity.reset_timeout();

        if is_client_http2 && response.version() != Version::HTTP_2 {
            tracing::debug!(
                version = ?response.version(),
                path = %context.request.uri.path(),
                "HTTP/2 request forwarded over an older protocol"
            );
        }

        context.response.set_status(response.status());
        let copy_body = transformer.transform_response(context, Some(&mut response)).await;
        match copy_body {
            Ok(true) => {}
            Ok(false) => {
                drop(response);
                self.cancel_request_body(content.as_mut(), activity).await;
                return ForwarderError::None;
            }
            Err(error) => {
                drop(response);
                self.cancel_request_body(content.as_mut(), activity).await;
                self.report(context, ForwarderError::ResponseHeaders, Some(SharedError::from(error)));
                context.response.clear();
                context.response.set_status(StatusCode::BAD_GATEWAY);
                return ForwarderError::ResponseHeaders;
            }
        }

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            return upgrade::handle_upgraded_response(self, context, response, activity).await;
        }

        // Without a declared length the destination may be streaming; pass bytes on
        // as they arrive.
        let auto_flush = is_streaming || content_length(response.headers()).is_none();
        let mut reader = BodyReader::new(response.into_body());

        self.telemetry.forwarder_stage(ForwarderStage::ResponseContentTransferStart);
        let result = self
            .copier
            .copy(false, &mut reader, &mut context.response, None, activity.handle(), auto_flush)
            .await;
        if !result.is_success() {
            return self
                .handle_response_body_error(context, content.as_mut(), result, transformer, activity)
                .await;
        }

        let trailers = reader.take_trailers();
        if let Err(error) = transformer.transform_response_trailers(context, trailers.as_ref()).await {
            self.cancel_request_body(content.as_mut(), activity).await;
            self.report(context, ForwarderError::ResponseHeaders, Some(SharedError::from(error)));
            if context.response.has_started() {
                context.response.reset_or_abort(false);
            } else {
                context.response.clear();
                context.response.set_status(StatusCode::BAD_GATEWAY);
            }
            return ForwarderError::ResponseHeaders;
        }

        if is_streaming {
            // Send the remaining bytes and trailers now; the client may be waiting
            // on them before it finishes its own body.
            if let Err(error) = context.response.complete().await {
                tracing::debug!(error = %error, "client went away while completing a streaming response");
            }
        }

        // An unstarted body copy never completes; only wait on one that started.
        if let Some(content) = content.as_mut() {
            if content.started() {
                let body = content.consumption().await;
                if !body.is_success() {
                    let (error, _) = request_body_error(body.outcome);
                    self.report(context, error, body.error.map(shared));
                    return error;
                }
            }
        }

        ForwarderError::None
    }

    async fn create_request<T>(
        &self,
        context: &mut HttpContext,
        destination_prefix: &str,
        request_config: &ForwarderRequestConfig,
        transformer: &T,
        activity: &ActivityCancellation,
        is_streaming: bool,
    ) -> Result<Option<(axum::http::Request<Body>, Option<RequestBodyCopyTask>)>, BoxError>
    where
        T: HttpTransformer + ?Sized,
    {
        let is_upgrade = is_upgrade_request(
            context.request.version,
            &context.request.headers,
            context.is_upgradable(),
        );
        let method = get_http_method(context.request.method.as_str())?;

        let (version, policy) = if is_upgrade {
            (Version::HTTP_11, HttpVersionPolicy::RequestVersionOrLower)
        } else {
            (request_config.version, request_config.version_policy)
        };
        let mut proxy_request = ProxyRequest::new(method, version);
        proxy_request.extensions.insert(policy);

        let content = self.setup_request_body_copy(context, is_streaming, activity);

        transformer
            .transform_request(context, &mut proxy_request, destination_prefix)
            .await?;
        if context.response.is_set() {
            return Ok(None);
        }

        // Transforms may have dropped them; an upgrade cannot work without them.
        if is_upgrade {
            restore_upgrade_headers(&context.request.headers, &mut proxy_request.headers);
        }

        let uri = match proxy_request.uri.take() {
            Some(uri) => uri,
            None => {
                let query = context
                    .request
                    .uri
                    .query()
                    .map(|query| format!("?{query}"))
                    .unwrap_or_default();
                make_destination_address(destination_prefix, context.request.uri.path(), &query)?
            }
        };

        let (body, task) = match content {
            Some((content, task)) => (Body::new(content), Some(task)),
            None => (Body::empty(), None),
        };
        Ok(Some((proxy_request.into_request(uri, body), task)))
    }

    fn setup_request_body_copy(
        &self,
        context: &mut HttpContext,
        is_streaming: bool,
        activity: &ActivityCancellation,
    ) -> Option<(StreamCopyHttpContent, RequestBodyCopyTask)> {
        let has_body = request_has_body(
            &context.request.method,
            context.request.version,
            &context.request.headers,
            context.can_have_body(),
        );
        if !has_body {
            return None;
        }

        if is_streaming {
            // Long-lived streams are not bound by the body size limit.
            context.set_max_request_body_size(None);
        }

        let promised_length = if context.request.headers.contains_key(header::TRANSFER_ENCODING) {
            None
        } else {
            content_length(&context.request.headers)
        };
        let source = context.take_request_body()?;

        Some(request_body_copy(
            source,
            self.copier.clone(),
            activity.handle().clone(),
            promised_length,
            is_streaming,
        ))
    }

    async fn handle_request_failure<T>(
        &self,
        context: &mut HttpContext,
        mut content: Option<&mut RequestBodyCopyTask>,
        failure: SendFailure,
        transformer: &T,
        activity: &ActivityCancellation,
    ) -> ForwarderError
    where
        T: HttpTransformer + ?Sized,
    {
        let (error, status, cause) = failure.into_parts();

        // A request body copy that already failed is the more specific cause, even
        // when the client has gone away since.
        let body_finished = content.as_deref_mut().is_some_and(|content| content.is_completed());
        if body_finished {
            if let Some(content) = content.as_deref_mut() {
                let body = content.consumption().await;
                if !body.is_success() {
                    return self
                        .handle_request_body_failure(context, body, Some(cause), transformer)
                        .await;
                }
            }
        }

        let (error, status) = if activity.cancelled_by_linked_token() {
            (ForwarderError::RequestCanceled, StatusCode::BAD_GATEWAY)
        } else {
            (error, status)
        };
        self.fail_request(context, content, error, Some(cause), status, transformer, activity)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail_request<T>(
        &self,
        context: &mut HttpContext,
        content: Option<&mut RequestBodyCopyTask>,
        error: ForwarderError,
        cause: Option<SharedError>,
        status: StatusCode,
        transformer: &T,
        activity: &ActivityCancellation,
    ) -> ForwarderError
    where
        T: HttpTransformer + ?Sized,
    {
        self.report(context, error, cause);
        context.response.clear();
        context.response.set_status(status);

        self.cancel_request_body(content, activity).await;

        // Let transforms react to a request that never reached the destination.
        if let Err(error) = transformer.transform_response(context, None).await {
            tracing::debug!(error = %error, "response transform failed after a request failure");
        }
        error
    }

    async fn handle_request_body_failure<T>(
        &self,
        context: &mut HttpContext,
        body: StreamCopyResult,
        additional: Option<SharedError>,
        transformer: &T,
    ) -> ForwarderError
    where
        T: HttpTransformer + ?Sized,
    {
        let (error, status) = request_body_error(body.outcome);
        let cause = combine_causes(body.error.map(shared), additional);
        self.report(context, error, cause);

        if context.response.has_started() {
            context
                .response
                .reset_or_abort(body.outcome == StreamCopyOutcome::Canceled);
        } else {
            context.response.clear();
            context.response.set_status(status);
            if let Err(error) = transformer.transform_response(context, None).await {
                tracing::debug!(error = %error, "response transform failed after a request body failure");
            }
        }
        error
    }

    async fn handle_response_body_error<T>(
        &self,
        context: &mut HttpContext,
        content: Option<&mut RequestBodyCopyTask>,
        result: StreamCopyResult,
        transformer: &T,
        activity: &ActivityCancellation,
    ) -> ForwarderError
    where
        T: HttpTransformer + ?Sized,
    {
        let error = response_body_error(result.outcome);
        let cause = result.error.map(shared);

        if let Some(content) = content {
            if content.started() {
                let already_finished = content.is_completed();
                if !already_finished {
                    activity.cancel();
                }
                let body = content.consumption().await;
                if already_finished && !body.is_success() {
                    return self
                        .handle_request_body_failure(context, body, cause, transformer)
                        .await;
                }
            }
        }

        self.report(context, error, cause);
        if context.response.has_started() {
            context
                .response
                .reset_or_abort(result.outcome == StreamCopyOutcome::Canceled);
        } else {
            context.response.clear();
            context.response.set_status(StatusCode::BAD_GATEWAY);
        }
        error
    }

    async fn cancel_request_body(&self, content: Option<&mut RequestBodyCopyTask>, activity: &ActivityCancellation) {
        if let Some(content) = content {
            if content.in_progress() {
                activity.cancel();
                content.consumption().await;
            }
        }
    }

    /// Record `error` on the context, log it and count it.
    pub(crate) fn report(&self, context: &mut HttpContext, error: ForwarderError, cause: Option<SharedError>) {
        let cause_text = cause.as_ref().map(|c| c.to_string()).unwrap_or_default();
        if is_quiet(error) {
            tracing::info!(
                error = %error,
                cause = %cause_text,
                method = %context.request.method,
                path = %context.request.uri.path(),
                "Forwarding stopped"
            );
        } else {
            tracing::warn!(
                error = %error,
                cause = %cause_text,
                method = %context.request.method,
                path = %context.request.uri.path(),
                "Forwarding failed"
            );
        }

        self.telemetry.forwarder_failed(error);
        context.set_error_feature(ForwarderErrorFeature::new(error, cause));
    }
}
