//! Forwarding outcomes and the error record attached to a request.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Boxed error produced by send primitives, bodies and transforms.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Shareable error cause; recorded once, read by any number of observers.
pub type SharedError = Arc<dyn StdError + Send + Sync>;

/// Outcome of a forwarding attempt.
///
/// `None` is success; every other variant names the stage and the side that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwarderError {
    None,
    Request,
    RequestCreation,
    RequestTimedOut,
    RequestCanceled,
    RequestBodyCanceled,
    RequestBodyClient,
    RequestBodyDestination,
    ResponseHeaders,
    ResponseBodyCanceled,
    ResponseBodyClient,
    ResponseBodyDestination,
    UpgradeRequestCanceled,
    UpgradeRequestClient,
    UpgradeRequestDestination,
    UpgradeResponseCanceled,
    UpgradeResponseClient,
    UpgradeResponseDestination,
    NoAvailableDestinations,
}

impl ForwarderError {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwarderError::None => "none",
            ForwarderError::Request => "request",
            ForwarderError::RequestCreation => "request_creation",
            ForwarderError::RequestTimedOut => "request_timed_out",
            ForwarderError::RequestCanceled => "request_canceled",
            ForwarderError::RequestBodyCanceled => "request_body_canceled",
            ForwarderError::RequestBodyClient => "request_body_client",
            ForwarderError::RequestBodyDestination => "request_body_destination",
            ForwarderError::ResponseHeaders => "response_headers",
            ForwarderError::ResponseBodyCanceled => "response_body_canceled",
            ForwarderError::ResponseBodyClient => "response_body_client",
            ForwarderError::ResponseBodyDestination => "response_body_destination",
            ForwarderError::UpgradeRequestCanceled => "upgrade_request_canceled",
            ForwarderError::UpgradeRequestClient => "upgrade_request_client",
            ForwarderError::UpgradeRequestDestination => "upgrade_request_destination",
            ForwarderError::UpgradeResponseCanceled => "upgrade_response_canceled",
            ForwarderError::UpgradeResponseClient => "upgrade_response_client",
            ForwarderError::UpgradeResponseDestination => "upgrade_response_destination",
            ForwarderError::NoAvailableDestinations => "no_available_destinations",
        }
    }

    /// True for every variant except `None`.
    pub fn is_error(&self) -> bool {
        *self != ForwarderError::None
    }
}

impl fmt::Display for ForwarderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error record attached to the request context when forwarding fails.
///
/// At most one is recorded per forwarding attempt.
#[derive(Debug, Clone)]
pub struct ForwarderErrorFeature {
    pub error: ForwarderError,
    pub cause: Option<SharedError>,
}

impl ForwarderErrorFeature {
    pub fn new(error: ForwarderError, cause: Option<SharedError>) -> Self {
        Self { error, cause }
    }
}

/// Two failures that happened together, reported as one cause.
#[derive(Debug, Error)]
#[error("{primary}; {secondary}")]
pub struct AggregateError {
    pub primary: SharedError,
    pub secondary: SharedError,
}

/// Combine two optional causes, keeping both when present.
pub fn combine_causes(first: Option<SharedError>, second: Option<SharedError>) -> Option<SharedError> {
    match (first, second) {
        (Some(primary), Some(secondary)) => Some(Arc::new(AggregateError { primary, secondary })),
        (Some(cause), None) | (None, Some(cause)) => Some(cause),
        (None, None) => None,
    }
}

/// Walk an error's source chain looking for an I/O timeout.
pub fn is_timeout(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return true;
            }
        }
        current = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn names_are_snake_case() {
        assert_eq!(ForwarderError::RequestBodyClient.to_string(), "request_body_client");
        assert_eq!(ForwarderError::None.as_str(), "none");
        assert!(!ForwarderError::None.is_error());
        assert!(ForwarderError::UpgradeResponseClient.is_error());
    }

    #[test]
    fn causes_are_aggregated() {
        let first: SharedError = Arc::new(io::Error::other("first"));
        let second: SharedError = Arc::new(io::Error::other("second"));

        let combined = combine_causes(Some(first.clone()), Some(second)).unwrap();
        assert_eq!(combined.to_string(), "first; second");

        let single = combine_causes(None, Some(first)).unwrap();
        assert_eq!(single.to_string(), "first");
        assert!(combine_causes(None, None).is_none());
    }

    #[test]
    fn timeouts_are_found_in_the_source_chain() {
        #[derive(Debug, Error)]
        #[error("connect failed")]
        struct Wrapper(#[source] io::Error);

        let wrapped = Wrapper(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(is_timeout(&wrapped));

        let refused = Wrapper(io::Error::new(io::ErrorKind::ConnectionRefused, "no"));
        assert!(!is_timeout(&refused));
    }
}
