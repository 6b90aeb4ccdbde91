use std::net::SocketAddr;

use eyre::Result;

use crate::{
    config::models::{
        CollectorConfig, DiscoveryConfig, GatewayConfig, MaintenanceConfig, RateLimitConfig,
        UpstreamConfig,
    },
    core::admission::IpNetwork,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire gateway configuration
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if let Err(mut discovery_errors) = Self::validate_discovery(&config.discovery) {
            errors.append(&mut discovery_errors);
        }

        if let Err(mut maintenance_errors) = Self::validate_maintenance(&config.maintenance) {
            errors.append(&mut maintenance_errors);
        }

        if config.backend.request_timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "backend.request_timeout_secs".to_string(),
                message: "Backend calls must have a bounded, non-zero timeout".to_string(),
            });
        }

        if let Err(mut rate_limit_errors) = Self::validate_rate_limit(&config.rate_limit) {
            errors.append(&mut rate_limit_errors);
        }

        if config.websocket.enabled && config.websocket.serve_subscriptions {
            if let Err(e) = Self::validate_upstream(&config.upstream) {
                errors.push(e);
            }
        }

        if let Err(e) = Self::validate_collector(&config.collector) {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_discovery(config: &DiscoveryConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        match &config.archiver_url {
            Some(url) => {
                if let Err(e) = Self::validate_url(url, "discovery.archiver_url") {
                    errors.push(e);
                }
            }
            None if config.seed_nodes.is_empty() => {
                errors.push(ValidationError::MissingField {
                    field: "discovery.archiver_url or discovery.seed_nodes".to_string(),
                });
            }
            None => {}
        }

        for (i, node) in config.seed_nodes.iter().enumerate() {
            if crate::core::node::NodeAddress::parse(node).is_err() {
                errors.push(ValidationError::InvalidField {
                    field: format!("discovery.seed_nodes[{i}]"),
                    message: format!("Expected 'host:port', got '{node}'"),
                });
            }
        }

        if config.refresh_interval_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "discovery.refresh_interval_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if config.request_timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "discovery.request_timeout_secs".to_string(),
                message: "Discovery and probe calls must have a bounded, non-zero timeout"
                    .to_string(),
            });
        }

        if config.unhealthy_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: "discovery.unhealthy_threshold".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if !config.probe_path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: "discovery.probe_path".to_string(),
                message: "Must start with '/'".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_maintenance(config: &MaintenanceConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        for (field, value) in [
            (
                "maintenance.health_check_interval_secs",
                config.health_check_interval_secs,
            ),
            (
                "maintenance.bad_node_prune_interval_secs",
                config.bad_node_prune_interval_secs,
            ),
            ("maintenance.tx_flush_interval_secs", config.tx_flush_interval_secs),
        ] {
            if value == 0 {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "Must be greater than 0".to_string(),
                });
            }
        }

        if config.bad_node_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: "maintenance.bad_node_threshold".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate rate limit configuration
    fn validate_rate_limit(config: &RateLimitConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if config.threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: "rate_limit.threshold".to_string(),
                message: "Rate limit threshold must be greater than 0".to_string(),
            });
        }

        match humantime::parse_duration(&config.window) {
            Ok(window) if window.is_zero() => errors.push(ValidationError::InvalidField {
                field: "rate_limit.window".to_string(),
                message: "Window must be longer than zero".to_string(),
            }),
            Ok(_) => {}
            Err(e) => errors.push(ValidationError::InvalidField {
                field: "rate_limit.window".to_string(),
                message: format!("Invalid duration '{}': {e}", config.window),
            }),
        }

        for (method, weight) in &config.method_weights {
            if *weight == 0 {
                errors.push(ValidationError::InvalidField {
                    field: format!("rate_limit.method_weights.{method}"),
                    message: "Weights must be positive".to_string(),
                });
            }
        }

        if config.broad_query_multiplier == 0 {
            errors.push(ValidationError::InvalidField {
                field: "rate_limit.broad_query_multiplier".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if config.soft_reject_min_delay_ms > config.soft_reject_max_delay_ms {
            errors.push(ValidationError::InvalidField {
                field: "rate_limit.soft_reject_min_delay_ms".to_string(),
                message: "Must not exceed soft_reject_max_delay_ms".to_string(),
            });
        }

        if config.max_tracked_sources == 0 {
            errors.push(ValidationError::InvalidField {
                field: "rate_limit.max_tracked_sources".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        for (list_name, entries) in [
            ("rate_limit.block_list", &config.block_list),
            ("rate_limit.spammer_list", &config.spammer_list),
        ] {
            for entry in entries {
                if let Err(message) = IpNetwork::parse(entry) {
                    errors.push(ValidationError::InvalidField {
                        field: format!("{list_name} entry '{entry}'"),
                        message,
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

    fn validate_upstream(config: &UpstreamConfig) -> ValidationResult<()> {
        if !config.enabled {
            return Ok(());
        }
        Self::validate_websocket_url(&config.url, "upstream.url")
    }

    fn validate_collector(config: &CollectorConfig) -> ValidationResult<()> {
        if !config.enabled {
            return Ok(());
        }
        Self::validate_url(&config.base_url, "collector.base_url")
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    /// Validate WebSocket URL format
    fn validate_websocket_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "ws" && url.scheme() != "wss" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "WebSocket URL scheme must be 'ws' or 'wss', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "WebSocket URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid WebSocket URL format: {e}"),
            }),
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_valid_config() -> GatewayConfig {
        GatewayConfig::builder()
            .listen_addr("127.0.0.1:8080")
            .seed_nodes(["10.0.0.1:9001"])
            .build()
    }

    #[test]
    fn validate_accepts_minimal_config() {
        assert!(ServerConfigValidator::validate(&minimal_valid_config()).is_ok());
    }

    #[test]
    fn validate_requires_a_discovery_source() {
        let config = GatewayConfig::builder()
            .listen_addr("127.0.0.1:8080")
            .build();
        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_bad_seed_node() {
        let config = GatewayConfig::builder()
            .listen_addr("127.0.0.1:8080")
            .seed_nodes(["not-a-node"])
            .build();
        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_bad_window() {
        let mut config = minimal_valid_config();
        config.rate_limit.window = "soon".to_string();
        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_bad_block_list_entry() {
        let mut config = minimal_valid_config();
        config.rate_limit.block_list = vec!["10.0.0.0/99".to_string()];
        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_http_upstream_url() {
        let mut config = minimal_valid_config();
        config.upstream.url = "http://logs:4446".to_string();
        assert!(ServerConfigValidator::validate(&config).is_err());

        config.websocket.serve_subscriptions = false;
        assert!(ServerConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn validate_rejects_inverted_soft_reject_delays() {
        let mut config = minimal_valid_config();
        config.rate_limit.soft_reject_min_delay_ms = 500;
        config.rate_limit.soft_reject_max_delay_ms = 100;
        assert!(ServerConfigValidator::validate(&config).is_err());
    }
}
