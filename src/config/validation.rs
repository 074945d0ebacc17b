//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate addresses and value ranges (limits and timeouts > 0)
//! - Keep the disk index inside the cache directory
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ProxyConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: invalid socket address {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("cache.index_file must be a plain file name, got {0:?}")]
    InvalidIndexFile(String),

    #[error("admin.api_key must not be empty when the admin API is enabled")]
    EmptyApiKey,
}

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut check_addr = |field: &'static str, value: &str| {
        if value.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidAddress {
                field,
                value: value.to_string(),
            });
        }
    };
    check_addr("listener.bind_address", &config.listener.bind_address);
    if config.observability.metrics_enabled {
        check_addr("observability.metrics_address", &config.observability.metrics_address);
    }
    if config.admin.enabled {
        check_addr("admin.bind_address", &config.admin.bind_address);
    }

    if config.listener.max_connections == 0 {
        errors.push(ValidationError::Zero("listener.max_connections"));
    }
    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::Zero("timeouts.connect_secs"));
    }
    if config.timeouts.idle_secs == 0 {
        errors.push(ValidationError::Zero("timeouts.idle_secs"));
    }

    let index = &config.cache.index_file;
    if index.is_empty() || index.contains(['/', '\\']) || index == "." || index == ".." {
        errors.push(ValidationError::InvalidIndexFile(index.clone()));
    }

    if config.admin.enabled && config.admin.api_key.trim().is_empty() {
        errors.push(ValidationError::EmptyApiKey);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&ProxyConfig::default()), Ok(()));
    }

    #[test]
    fn collects_all_errors() {
        let mut config = ProxyConfig::default();
        config.listener.bind_address = "nowhere".into();
        config.listener.max_connections = 0;
        config.timeouts.idle_secs = 0;
        config.cache.index_file = "../list.txt".into();
        config.admin.enabled = true;
        config.admin.api_key = " ".into();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 5);
        assert!(errors.contains(&ValidationError::Zero("listener.max_connections")));
        assert!(errors.contains(&ValidationError::EmptyApiKey));
    }

    #[test]
    fn disabled_sections_are_not_checked() {
        let mut config = ProxyConfig::default();
        config.observability.metrics_address = "bogus".into();
        config.admin.bind_address = "bogus".into();
        assert_eq!(validate_config(&config), Ok(()));
    }
}
