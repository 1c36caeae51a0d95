//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; the binary embedding CADENCE
//! decides where they go. [`init_tracing`] is the default wiring: an
//! `EnvFilter` (honouring `RUST_LOG`) over either JSON or compact output.

use cadence_core::{CadenceError, CadenceResult, ConfigError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "cadence_core=info,cadence_cache=info,cadence_compliance=info,warn";

/// Log line layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event, for log shippers.
    Json,
    /// Human-readable single line per event.
    Compact,
}

impl LogFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "compact" | "text" | "pretty" => Some(Self::Compact),
            _ => None,
        }
    }
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub format: LogFormat,
    /// Service name attached to the startup event.
    pub service_name: String,
    /// Environment (production, staging, development)
    pub environment: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            service_name: "cadence".to_string(),
            environment: "development".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Read `CADENCE_LOG_FORMAT`, `CADENCE_SERVICE_NAME` and `CADENCE_ENVIRONMENT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            format: lookup("CADENCE_LOG_FORMAT")
                .and_then(|raw| LogFormat::parse(&raw))
                .unwrap_or(defaults.format),
            service_name: lookup("CADENCE_SERVICE_NAME")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.service_name),
            environment: lookup("CADENCE_ENVIRONMENT")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.environment),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup. A second call fails with
/// [`ConfigError::SubscriberInit`] because a global subscriber already exists.
pub fn init_tracing(config: &TelemetryConfig) -> CadenceResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match config.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
    };
    installed.map_err(|e| {
        CadenceError::Config(ConfigError::SubscriberInit {
            reason: e.to_string(),
        })
    })?;

    tracing::info!(
        service_name = %config.service_name,
        environment = %config.environment,
        format = ?config.format,
        "Telemetry initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_telemetry_config_default() {
        let config = TelemetryConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config, TelemetryConfig::default());
        assert_eq!(config.service_name, "cadence");
    }

    #[test]
    fn test_telemetry_config_overrides() {
        let config = TelemetryConfig::from_lookup(lookup_from(&[
            ("CADENCE_LOG_FORMAT", "JSON"),
            ("CADENCE_SERVICE_NAME", "compliance-api"),
            ("CADENCE_ENVIRONMENT", "production"),
        ]));
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.service_name, "compliance-api");
        assert_eq!(config.environment, "production");
    }

    #[test]
    fn test_unknown_format_falls_back() {
        let config = TelemetryConfig::from_lookup(lookup_from(&[("CADENCE_LOG_FORMAT", "xml")]));
        assert_eq!(config.format, LogFormat::Compact);
    }

    #[test]
    fn test_second_init_is_an_error() {
        let config = TelemetryConfig::default();
        // The first call may race with other tests installing a subscriber;
        // only the second call's outcome is deterministic.
        let _ = init_tracing(&config);
        assert!(matches!(
            init_tracing(&config),
            Err(CadenceError::Config(ConfigError::SubscriberInit { .. }))
        ));
    }
}
