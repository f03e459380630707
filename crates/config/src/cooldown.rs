//! Cooldown duration configuration.

use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;

/// Why a provider was placed on cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownReason {
    /// Upstream returned 429.
    RateLimit,
    /// Upstream returned 401 or 403.
    AuthError,
    /// Upstream returned 408 or timed out.
    Timeout,
    /// Upstream returned 5xx.
    ServerError,
    /// The connection itself failed before or during the exchange.
    ConnectionError,
}

impl CooldownReason {
    /// All reasons, for building the default duration table.
    pub const ALL: [CooldownReason; 5] = [
        CooldownReason::RateLimit,
        CooldownReason::AuthError,
        CooldownReason::Timeout,
        CooldownReason::ServerError,
        CooldownReason::ConnectionError,
    ];

    /// Stable snake_case name used in logs and stored records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::AuthError => "auth_error",
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::ConnectionError => "connection_error",
        }
    }
}

impl std::fmt::Display for CooldownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Global cooldown durations. Every applied cooldown is clamped to
/// `[min, max]` regardless of where its duration came from.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CooldownsConfig {
    /// Lower clamp.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub min: Duration,
    /// Upper clamp.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub max: Duration,
    /// Default duration per reason, used when neither an explicit duration,
    /// a provider override, nor a Retry-After header applies.
    pub defaults: IndexMap<CooldownReason, DefaultDuration>,
}

/// Duration newtype so the defaults table parses "60s"-style strings.
#[derive(Clone, Copy, Deserialize)]
pub struct DefaultDuration(#[serde(deserialize_with = "duration_str::deserialize_duration")] pub Duration);

impl std::fmt::Debug for DefaultDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::ops::Deref for DefaultDuration {
    type Target = Duration;

    fn deref(&self) -> &Duration {
        &self.0
    }
}

impl Default for CooldownsConfig {
    fn default() -> Self {
        let defaults = [
            (CooldownReason::RateLimit, Duration::from_secs(60)),
            (CooldownReason::AuthError, Duration::from_secs(300)),
            (CooldownReason::Timeout, Duration::from_secs(30)),
            (CooldownReason::ServerError, Duration::from_secs(30)),
            (CooldownReason::ConnectionError, Duration::from_secs(30)),
        ]
        .into_iter()
        .map(|(reason, duration)| (reason, DefaultDuration(duration)))
        .collect();

        Self {
            min: Duration::from_secs(5),
            max: Duration::from_secs(3600),
            defaults,
        }
    }
}

impl CooldownsConfig {
    /// The default duration for a reason, falling back to 30 seconds for
    /// reasons removed from the configured table.
    pub fn default_for(&self, reason: CooldownReason) -> Duration {
        self.defaults
            .get(&reason)
            .map(|duration| duration.0)
            .unwrap_or(Duration::from_secs(30))
    }

    /// Clamp an arbitrary duration into the configured bounds.
    pub fn clamp(&self, duration: Duration) -> Duration {
        duration.clamp(self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_override_keeps_other_defaults() {
        let config: CooldownsConfig = toml::from_str(indoc::indoc! {r#"
            min = "1s"

            [defaults]
            rate_limit = "2m"
        "#})
        .unwrap();

        assert_eq!(config.min, Duration::from_secs(1));
        assert_eq!(config.default_for(CooldownReason::RateLimit), Duration::from_secs(120));
        // The defaults table was replaced wholesale, so missing reasons use
        // the hardcoded fallback.
        assert_eq!(config.default_for(CooldownReason::Timeout), Duration::from_secs(30));
    }

    #[test]
    fn clamps_into_bounds() {
        let config = CooldownsConfig::default();

        assert_eq!(config.clamp(Duration::from_secs(1)), Duration::from_secs(5));
        assert_eq!(config.clamp(Duration::from_secs(7200)), Duration::from_secs(3600));
        assert_eq!(config.clamp(Duration::from_secs(60)), Duration::from_secs(60));
    }
}
