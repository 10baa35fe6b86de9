//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, addresses parse)
//! - Check destination prefixes are absolute http(s) URIs
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ProxyConfig;
use crate::protocol::{parse_version, MINIMUM_PREFIX_LEN};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid {field}: '{value}' is not a socket address")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("unsupported forwarder version '{0}'")]
    UnsupportedVersion(String),

    #[error("route '{route}': destination '{destination}' is not an absolute http(s) URI")]
    InvalidDestination { route: String, destination: String },

    #[error("route '{route}': path prefix '{prefix}' must start with '/'")]
    InvalidPathPrefix { route: String, prefix: String },

    #[error("duplicate route name '{0}'")]
    DuplicateRoute(String),
}

/// Check every semantic rule, collecting all failures.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "listener.bind_address",
            value: config.listener.bind_address.clone(),
        });
    }
    if config.listener.max_request_body_bytes == 0 {
        errors.push(ValidationError::Zero {
            field: "listener.max_request_body_bytes",
        });
    }
    if config.forwarder.activity_timeout_secs == 0 {
        errors.push(ValidationError::Zero {
            field: "forwarder.activity_timeout_secs",
        });
    }
    if config.client.connect_timeout_secs == 0 {
        errors.push(ValidationError::Zero {
            field: "client.connect_timeout_secs",
        });
    }
    if parse_version(&config.forwarder.version).is_none() {
        errors.push(ValidationError::UnsupportedVersion(config.forwarder.version.clone()));
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }

    let mut names = HashSet::new();
    for route in &config.routes {
        if !names.insert(route.name.as_str()) {
            errors.push(ValidationError::DuplicateRoute(route.name.clone()));
        }
        if !is_valid_destination(&route.destination) {
            errors.push(ValidationError::InvalidDestination {
                route: route.name.clone(),
                destination: route.destination.clone(),
            });
        }
        if let Some(prefix) = &route.path_prefix {
            if !prefix.starts_with('/') {
                errors.push(ValidationError::InvalidPathPrefix {
                    route: route.name.clone(),
                    prefix: prefix.clone(),
                });
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn is_valid_destination(destination: &str) -> bool {
    if destination.len() < MINIMUM_PREFIX_LEN {
        return false;
    }
    match url::Url::parse(destination) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host_str().is_some(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RouteConfig;

    fn route(name: &str, destination: &str) -> RouteConfig {
        RouteConfig {
            name: name.to_string(),
            host: None,
            path_prefix: None,
            destination: destination.to_string(),
            priority: 0,
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&ProxyConfig::default()), Ok(()));
    }

    #[test]
    fn all_errors_are_reported() {
        let mut config = ProxyConfig::default();
        config.listener.bind_address = "nowhere".into();
        config.forwarder.activity_timeout_secs = 0;
        config.forwarder.version = "1.2".into();
        config.routes = vec![
            route("a", "http://"),
            route("a", "ftp://files.example"),
            RouteConfig {
                path_prefix: Some("api".into()),
                ..route("b", "http://localhost:3000")
            },
        ];

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 7, "{errors:?}");
        assert!(errors.contains(&ValidationError::DuplicateRoute("a".into())));
        assert!(errors.contains(&ValidationError::UnsupportedVersion("1.2".into())));
    }

    #[test]
    fn destinations_must_be_absolute_http() {
        assert!(is_valid_destination("http://a"));
        assert!(is_valid_destination("https://example.com/base/"));
        assert!(!is_valid_destination("http://"));
        assert!(!is_valid_destination("/relative/path"));
        assert!(!is_valid_destination("ws://example.com"));
    }
}
