//! Client configuration

use crate::errors::{Result, TetherError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the query engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Timeout for `call` round trips in milliseconds (default: 10s)
    pub call_timeout_ms: u64,
    /// Timeout for `dispatch_event` round trips in milliseconds (default: 30s)
    pub dispatch_timeout_ms: u64,
    /// Maximum envelopes kept per view change log (default: 1000)
    pub max_history_per_view: usize,
    /// `sourceId` stamped on locally synthesized envelopes
    pub source_id: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 10_000,
            dispatch_timeout_ms: 30_000,
            max_history_per_view: 1_000,
            source_id: "local".to_string(),
        }
    }
}

impl ClientConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.call_timeout_ms == 0 {
            return Err(TetherError::config("call_timeout_ms must be positive"));
        }
        if self.dispatch_timeout_ms == 0 {
            return Err(TetherError::config("dispatch_timeout_ms must be positive"));
        }
        if self.max_history_per_view == 0 {
            return Err(TetherError::config("max_history_per_view must be positive"));
        }
        Ok(())
    }

    /// `call_timeout_ms` as a duration.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// `dispatch_timeout_ms` as a duration.
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn toml_overrides_selected_keys() {
        let config = ClientConfig::from_toml_str("call_timeout_ms = 250\n").unwrap();
        assert_eq!(config.call_timeout(), Duration::from_millis(250));
        assert_eq!(config.max_history_per_view, 1_000);
    }

    #[test]
    fn zero_history_is_rejected() {
        let err = ClientConfig::from_toml_str("max_history_per_view = 0").unwrap_err();
        assert!(matches!(err, TetherError::Config { .. }));
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = ClientConfig::from_toml_str("call_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, TetherError::Config { .. }));
    }
}
