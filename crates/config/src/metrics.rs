//! Metrics collection settings.

use std::time::Duration;

use serde::Deserialize;

/// Rolling-window metrics configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// Lookback horizon for provider samples.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub window: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
        }
    }
}
