//! Route lookup.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Look up the matching route for a request
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - Ordered by priority, then by configuration order
//! - Explicit no-match (`None`) rather than a silent default

use axum::http::Request;

use crate::config::RouteConfig;
use crate::routing::matcher::RouteMatcher;

/// A compiled route.
#[derive(Debug, Clone)]
pub struct Route {
    pub name: String,
    /// Absolute destination prefix.
    pub destination: String,
    matcher: RouteMatcher,
}

/// Immutable route table.
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn from_config(configs: &[RouteConfig]) -> Self {
        let mut ordered: Vec<&RouteConfig> = configs.iter().collect();
        // Stable: equal priorities keep configuration order.
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let routes = ordered
            .into_iter()
            .map(|config| Route {
                name: config.name.clone(),
                destination: config.destination.clone(),
                matcher: RouteMatcher::new(config.host.as_deref(), config.path_prefix.as_deref()),
            })
            .collect();
        Self { routes }
    }

    /// First route whose conditions all hold.
    pub fn match_request<B>(&self, req: &Request<B>) -> Option<&Route> {
        self.routes.iter().find(|route| route.matcher.matches(req))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn config(name: &str, host: Option<&str>, prefix: Option<&str>, priority: u32) -> RouteConfig {
        RouteConfig {
            name: name.into(),
            host: host.map(Into::into),
            path_prefix: prefix.map(Into::into),
            destination: format!("http://{name}.internal"),
            priority,
        }
    }

    fn request(host: &str, path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header("Host", host)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn higher_priority_wins() {
        let router = Router::from_config(&[
            config("catch-all", None, None, 0),
            config("api", None, Some("/api"), 10),
        ]);
        assert_eq!(router.match_request(&request("h", "/api/x")).unwrap().name, "api");
        assert_eq!(router.match_request(&request("h", "/web")).unwrap().name, "catch-all");
    }

    #[test]
    fn equal_priority_keeps_order() {
        let router = Router::from_config(&[
            config("first", None, Some("/a"), 1),
            config("second", None, Some("/a"), 1),
        ]);
        assert_eq!(router.match_request(&request("h", "/a")).unwrap().name, "first");
    }

    #[test]
    fn no_match_is_none() {
        let router = Router::from_config(&[config("api", Some("api.example"), None, 0)]);
        assert!(router.match_request(&request("web.example", "/")).is_none());
        assert_eq!(
            router.match_request(&request("api.example", "/")).unwrap().destination,
            "http://api.internal"
        );
    }
}
