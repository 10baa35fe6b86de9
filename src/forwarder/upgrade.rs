//! Protocol upgrades: switch both connections and pump bytes both ways.
//!
//! # Data Flow
//! ```text
//! destination 101 head
//!     → restore Connection/Upgrade on the client response
//!     → destination connection upgraded (hyper::upgrade::on)
//!     → client 101 sent, client connection upgraded
//!     → two copies: client → destination, destination → client
//! ```
//!
//! # Design Decisions
//! - Whichever direction finishes first decides: a failure cancels the other
//!   direction, a success half-closes the peer and waits for the other side
//! - The loser is always awaited before returning, so no copy outlives the
//!   activity rental

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::forwarder::activity::{ActivityCancellation, ActivityToken};
use crate::forwarder::copier::{StreamCopier, StreamCopyOutcome, StreamCopyResult};
use crate::forwarder::engine::HttpForwarder;
use crate::forwarder::error::{ForwarderError, SharedError};
use crate::http::HttpContext;
use crate::observability::telemetry::ForwarderStage;
use crate::protocol::restore_upgrade_headers;

/// Complete a `101 Switching Protocols` exchange and run the duplex pump.
pub(crate) async fn handle_upgraded_response(
    forwarder: &HttpForwarder,
    context: &mut HttpContext,
    response: Response<Body>,
    activity: &ActivityCancellation,
) -> ForwarderError {
    let Some(client_upgrade) = context.take_upgrade() else {
        return fail_before_start(
            forwarder,
            context,
            ForwarderError::UpgradeResponseDestination,
            io::Error::other("the client connection cannot be upgraded"),
        );
    };

    restore_upgrade_headers(response.headers(), context.response.headers_mut());

    let destination = tokio::select! {
        biased;
        _ = activity.token().cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "upgrade canceled")),
        upgraded = hyper::upgrade::on(response) => upgraded.map_err(io::Error::other),
    };
    let destination = match destination {
        Ok(upgraded) => upgraded,
        Err(error) => {
            return fail_before_start(forwarder, context, ForwarderError::UpgradeResponseDestination, error)
        }
    };

    forwarder.telemetry().forwarder_stage(ForwarderStage::ResponseUpgrade);
    context.response.start_upgrade();

    let client = tokio::select! {
        biased;
        _ = activity.token().cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "upgrade canceled")),
        upgraded = client_upgrade => upgraded.map_err(io::Error::other),
    };
    let client = match client {
        Ok(upgraded) => upgraded,
        Err(error) => {
            let error_kind = ForwarderError::UpgradeResponseClient;
            forwarder.report(context, error_kind, Some(Arc::new(error)));
            return error_kind;
        }
    };

    let (client_read, client_write) = tokio::io::split(TokioIo::new(client));
    let (destination_read, destination_write) = tokio::io::split(TokioIo::new(destination));

    let (error, cause) = copy_duplex(
        forwarder.copier(),
        activity.handle(),
        client_read,
        client_write,
        destination_read,
        destination_write,
    )
    .await;

    if error.is_error() {
        forwarder.report(context, error, cause);
    }
    error
}

fn fail_before_start(
    forwarder: &HttpForwarder,
    context: &mut HttpContext,
    error: ForwarderError,
    cause: io::Error,
) -> ForwarderError {
    forwarder.report(context, error, Some(Arc::new(cause)));
    context.response.clear();
    context.response.set_status(StatusCode::BAD_GATEWAY);
    error
}

/// Classify a failed direction of the duplex pump.
pub fn upgrade_error(is_request: bool, outcome: StreamCopyOutcome) -> ForwarderError {
    match (is_request, outcome) {
        (_, StreamCopyOutcome::Success) => ForwarderError::None,
        (true, StreamCopyOutcome::InputError) => ForwarderError::UpgradeRequestClient,
        (true, StreamCopyOutcome::OutputError) => ForwarderError::UpgradeRequestDestination,
        (true, StreamCopyOutcome::Canceled) => ForwarderError::UpgradeRequestCanceled,
        (false, StreamCopyOutcome::InputError) => ForwarderError::UpgradeResponseDestination,
        (false, StreamCopyOutcome::OutputError) => ForwarderError::UpgradeResponseClient,
        (false, StreamCopyOutcome::Canceled) => ForwarderError::UpgradeResponseCanceled,
    }
}

async fn pump<R, W>(
    copier: &StreamCopier,
    activity: &ActivityToken,
    is_request: bool,
    mut source: R,
    mut destination: W,
) -> StreamCopyResult
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = copier
        .copy(is_request, &mut source, &mut destination, None, activity, true)
        .await;
    if result.is_success() {
        // Pass the half-close on to the peer.
        if let Err(error) = destination.shutdown().await {
            tracing::debug!(is_request, error = %error, "Half-close after upgraded copy failed");
        }
    }
    result
}

/// Copy both directions until both finish or one fails.
pub async fn copy_duplex<CR, CW, DR, DW>(
    copier: &StreamCopier,
    activity: &ActivityToken,
    client_read: CR,
    client_write: CW,
    destination_read: DR,
    destination_write: DW,
) -> (ForwarderError, Option<SharedError>)
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    DR: AsyncRead + Unpin,
    DW: AsyncWrite + Unpin,
{
    let request = pump(copier, activity, true, client_read, destination_write);
    let response = pump(copier, activity, false, destination_read, client_write);
    tokio::pin!(request, response);

    let (first_is_request, first) = tokio::select! {
        result = &mut request => (true, result),
        result = &mut response => (false, result),
    };

    if !first.is_success() {
        activity.cancel();
        // Await the other side so it stops touching its streams.
        let _ = if first_is_request {
            (&mut response).await
        } else {
            (&mut request).await
        };
        return (
            upgrade_error(first_is_request, first.outcome),
            first.error.map(|e| e as SharedError),
        );
    }

    let second = if first_is_request {
        response.await
    } else {
        request.await
    };
    (
        upgrade_error(!first_is_request, second.outcome),
        second.error.map(|e| e as SharedError),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::activity::ActivityTimeoutPool;
    use crate::observability::telemetry::NoopTelemetry;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, ReadBuf};
    use tokio_util::sync::CancellationToken;

    struct ResetReader;

    impl AsyncRead for ResetReader {
        fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
        }
    }

    fn setup() -> (StreamCopier, Arc<ActivityTimeoutPool>) {
        (
            StreamCopier::new(Arc::new(NoopTelemetry)),
            Arc::new(ActivityTimeoutPool::new()),
        )
    }

    #[tokio::test]
    async fn both_directions_complete() {
        let (copier, pool) = setup();
        let activity = pool.rent(Duration::from_secs(10), &CancellationToken::new());

        let (client_proxy, mut client) = tokio::io::duplex(1024);
        let (destination_proxy, mut destination) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_proxy);
        let (destination_read, destination_write) = tokio::io::split(destination_proxy);

        let peers = tokio::spawn(async move {
            client.write_all(b"ping").await.unwrap();
            client.shutdown().await.unwrap();
            destination.write_all(b"pong").await.unwrap();
            destination.shutdown().await.unwrap();

            let mut at_destination = Vec::new();
            destination.read_to_end(&mut at_destination).await.unwrap();
            let mut at_client = Vec::new();
            client.read_to_end(&mut at_client).await.unwrap();
            (at_client, at_destination)
        });

        let (error, cause) = copy_duplex(
            &copier,
            activity.handle(),
            client_read,
            client_write,
            destination_read,
            destination_write,
        )
        .await;
        assert_eq!(error, ForwarderError::None);
        assert!(cause.is_none());

        let (at_client, at_destination) = peers.await.unwrap();
        assert_eq!(at_client, b"pong");
        assert_eq!(at_destination, b"ping");
    }

    #[tokio::test]
    async fn client_failure_cancels_the_other_direction() {
        let (copier, pool) = setup();
        let activity = pool.rent(Duration::from_secs(10), &CancellationToken::new());

        // The destination never sends anything and never closes.
        let (destination_proxy, _destination) = tokio::io::duplex(1024);
        let (destination_read, destination_write) = tokio::io::split(destination_proxy);

        let (error, cause) = tokio::time::timeout(
            Duration::from_secs(5),
            copy_duplex(
                &copier,
                activity.handle(),
                ResetReader,
                tokio::io::sink(),
                destination_read,
                destination_write,
            ),
        )
        .await
        .expect("the idle direction must be canceled");

        assert_eq!(error, ForwarderError::UpgradeRequestClient);
        assert!(cause.is_some());
        assert!(activity.is_cancelled());
    }

    #[tokio::test]
    async fn destination_failure_is_a_response_error() {
        let (copier, pool) = setup();
        let activity = pool.rent(Duration::from_secs(10), &CancellationToken::new());

        let (client_proxy, _client) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_proxy);

        let (error, _) = copy_duplex(
            &copier,
            activity.handle(),
            client_read,
            client_write,
            ResetReader,
            tokio::io::sink(),
        )
        .await;
        assert_eq!(error, ForwarderError::UpgradeResponseDestination);
    }

    #[tokio::test]
    async fn vanished_client_is_a_client_error() {
        let (copier, pool) = setup();
        let activity = pool.rent(Duration::from_secs(10), &CancellationToken::new());

        let (client_proxy, client) = tokio::io::duplex(16);
        let (destination_proxy, mut destination) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_proxy);
        let (destination_read, destination_write) = tokio::io::split(destination_proxy);
        drop(client);

        let feeder = tokio::spawn(async move {
            // Keep writing until the pump gives up.
            while destination.write_all(&[7u8; 256]).await.is_ok() {}
        });

        let (error, _) = copy_duplex(
            &copier,
            activity.handle(),
            client_read,
            client_write,
            destination_read,
            destination_write,
        )
        .await;
        assert_eq!(error, ForwarderError::UpgradeResponseClient);
        feeder.await.unwrap();
    }

    #[test]
    fn classification_is_symmetric() {
        use StreamCopyOutcome::*;
        assert_eq!(upgrade_error(true, InputError), ForwarderError::UpgradeRequestClient);
        assert_eq!(upgrade_error(true, OutputError), ForwarderError::UpgradeRequestDestination);
        assert_eq!(upgrade_error(true, Canceled), ForwarderError::UpgradeRequestCanceled);
        assert_eq!(upgrade_error(false, InputError), ForwarderError::UpgradeResponseDestination);
        assert_eq!(upgrade_error(false, OutputError), ForwarderError::UpgradeResponseClient);
        assert_eq!(upgrade_error(false, Canceled), ForwarderError::UpgradeResponseCanceled);
        assert_eq!(upgrade_error(false, Success), ForwarderError::None);
    }
}
