//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router with the catch-all forwarding handler
//! - Wire up middleware (tracing, request ID)
//! - Look up the route for each request and hand it to the forwarder
//! - Serve until the shutdown coordinator fires, then drain

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::ProxyConfig;
use crate::forwarder::{
    build_http_client, ForwarderError, ForwarderErrorFeature, ForwarderHttpClient, ForwarderRequestConfig,
    HttpForwarder,
};
use crate::http::context::HttpContext;
use crate::lifecycle::{drain_with_grace, Shutdown};
use crate::observability::{metrics, ForwarderTelemetry, MetricsTelemetry, NoopTelemetry};
use crate::routing::Router as ProxyRouter;
use crate::transforms::{HeaderTransformer, HttpTransformer};

const X_REQUEST_ID: &str = "x-request-id";

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<ProxyRouter>,
    pub forwarder: Arc<HttpForwarder>,
    pub client: Arc<dyn ForwarderHttpClient>,
    pub transformer: Arc<dyn HttpTransformer>,
    pub request_config: ForwarderRequestConfig,
    pub max_request_body_bytes: usize,
}

impl AppState {
    /// State for `config` with the real outbound client.
    pub fn from_config(config: &ProxyConfig) -> Self {
        let telemetry: Arc<dyn ForwarderTelemetry> = if config.observability.metrics_enabled {
            Arc::new(MetricsTelemetry)
        } else {
            Arc::new(NoopTelemetry)
        };

        Self {
            router: Arc::new(ProxyRouter::from_config(&config.routes)),
            forwarder: Arc::new(HttpForwarder::new(telemetry)),
            client: Arc::new(build_http_client(&config.client)),
            transformer: Arc::new(HeaderTransformer {
                skip_tracing_headers: config.forwarder.skip_tracing_headers,
            }),
            request_config: ForwarderRequestConfig::from(&config.forwarder),
            max_request_body_bytes: config.listener.max_request_body_bytes,
        }
    }
}

/// HTTP server hosting the forwarder.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ProxyConfig) -> Self {
        let state = AppState::from_config(&config);
        Self::with_state(config, state)
    }

    /// Create a server around prepared state (custom client or transformer).
    pub fn with_state(config: ProxyConfig, state: AppState) -> Self {
        tracing::info!(routes = state.router.len(), "Route table compiled");
        Self {
            router: build_router(state),
            config,
        }
    }

    /// Run the server, accepting connections on the given listener until
    /// `shutdown` is triggered.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let grace = Duration::from_secs(self.config.listener.shutdown_grace_secs);
        let serve = axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown.triggered())
            .into_future();
        tokio::pin!(serve);

        // Drain is bounded only once shutdown has started.
        tokio::select! {
            result = &mut serve => result?,
            _ = shutdown.triggered() => {
                tracing::info!(grace_secs = grace.as_secs(), "Draining in-flight requests");
                let drained = drain_with_grace(
                    async {
                        if let Err(error) = (&mut serve).await {
                            tracing::error!(error = %error, "Server error while draining");
                        }
                    },
                    grace,
                )
                .await;
                if !drained {
                    tracing::warn!("In-flight requests abandoned");
                }
            }
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// The axum router, for serving on a custom listener.
    pub fn into_router(self) -> Router {
        self.router
    }
}

/// Build the Axum router with all middleware layers.
pub fn build_router(state: AppState) -> Router {
    let request_id = HeaderName::from_static(X_REQUEST_ID);
    Router::new()
        .route("/{*path}", any(forward_handler))
        .route("/", any(forward_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id)),
        )
}

/// Catch-all handler: route lookup, then forward.
///
/// The forwarder runs in its own task so the response head can be returned as
/// soon as it is produced while the body keeps streaming.
async fn forward_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let start = Instant::now();

    let Some(route) = state.router.match_request(&request).cloned() else {
        tracing::warn!(
            method = %request.method(),
            path = %request.uri().path(),
            "No route matched"
        );
        metrics::record_request("none", 503, ForwarderError::NoAvailableDestinations, start);
        let mut response = (StatusCode::SERVICE_UNAVAILABLE, "No available destinations").into_response();
        response.extensions_mut().insert(ForwarderErrorFeature::new(
            ForwarderError::NoAvailableDestinations,
            None,
        ));
        return response;
    };

    let (mut context, receiver) = HttpContext::new(request);
    context.set_max_request_body_size(Some(state.max_request_body_bytes));

    tokio::spawn(async move {
        let outcome = state
            .forwarder
            .send(
                &mut context,
                &route.destination,
                state.client.as_ref(),
                &state.request_config,
                state.transformer.as_ref(),
            )
            .await;

        if let Err(error) = context.response.complete().await {
            tracing::debug!(route = %route.name, error = %error, "Client response not completed");
        }

        let status = context.response.status().as_u16();
        tracing::debug!(route = %route.name, status, outcome = %outcome, "Forward finished");
        metrics::record_request(&route.name, status, outcome, start);
    });

    match receiver.recv().await {
        Some(response) => response,
        None => {
            tracing::error!("Forwarder ended without a response");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn config_with_route(path_prefix: &str) -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.routes.push(RouteConfig {
            name: "api".into(),
            host: None,
            path_prefix: Some(path_prefix.into()),
            destination: "http://127.0.0.1:9".into(),
            priority: 0,
        });
        config
    }

    #[tokio::test]
    async fn unmatched_request_is_service_unavailable() {
        let app = build_router(AppState::from_config(&config_with_route("/api")));

        let response = app
            .oneshot(Request::builder().uri("/other").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().contains_key(X_REQUEST_ID));
        assert_eq!(
            response
                .extensions()
                .get::<ForwarderErrorFeature>()
                .map(|feature| feature.error),
            Some(ForwarderError::NoAvailableDestinations)
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"No available destinations");
    }

    #[tokio::test]
    async fn inbound_request_id_is_kept() {
        let app = build_router(AppState::from_config(&ProxyConfig::default()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(X_REQUEST_ID, "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers()[X_REQUEST_ID], "abc-123");
    }

    #[tokio::test]
    async fn state_follows_the_config() {
        let mut config = config_with_route("/api");
        config.forwarder.activity_timeout_secs = 5;
        config.listener.max_request_body_bytes = 1024;

        let state = AppState::from_config(&config);

        assert_eq!(state.router.len(), 1);
        assert_eq!(state.request_config.activity_timeout, Duration::from_secs(5));
        assert_eq!(state.max_request_body_bytes, 1024);
    }
}
