//! Upstream provider configuration.

use indexmap::IndexMap;
use secrecy::SecretString;
use serde::Deserialize;
use std::{collections::BTreeMap, time::Duration};

use crate::cooldown::CooldownReason;

/// API dialect spoken on a provider endpoint or by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiDialect {
    /// OpenAI-style chat completions.
    Chat,
    /// Anthropic-style messages.
    Messages,
    /// Google-style generateContent.
    Gemini,
}

impl ApiDialect {
    /// Stable lowercase name used in logs and stored records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Messages => "messages",
            Self::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for ApiDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How requests to the provider are authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderAuthScheme {
    /// `Authorization: Bearer <secret>`.
    #[default]
    Bearer,
    /// `x-api-key: <secret>`.
    XApiKey,
}

/// Provider credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderAuthConfig {
    /// Header scheme to use.
    #[serde(default)]
    pub scheme: ProviderAuthScheme,
    /// The credential itself. Never logged.
    pub secret: SecretString,
    /// Optional account identifier, used to scope cooldowns when a provider
    /// is configured multiple times with different credentials.
    #[serde(default)]
    pub account_id: Option<String>,
}

/// Configuration for a single upstream provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Whether this provider may be selected at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// The dialects this provider natively speaks.
    pub dialects: Vec<ApiDialect>,

    /// Endpoint URL per dialect. A provider must have an endpoint for every
    /// dialect it declares.
    pub endpoints: IndexMap<ApiDialect, String>,

    /// Upstream credentials.
    pub auth: Option<ProviderAuthConfig>,

    /// Models this provider serves, as the provider names them.
    #[serde(default)]
    pub models: Vec<String>,

    /// Extra headers sent verbatim with every request to this provider.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// JSON object merged into every outbound request body, provider keys
    /// winning over transformed keys.
    #[serde(default)]
    pub extra_body: Option<serde_json::Map<String, serde_json::Value>>,

    /// Per-reason cooldown duration overrides for this provider.
    #[serde(default)]
    pub cooldowns: BTreeMap<CooldownReason, CooldownDuration>,

    /// Price discount factor in `[0, 1)` applied to the pricing table for
    /// this provider's models.
    #[serde(default)]
    pub discount: Option<f64>,
}

impl ProviderConfig {
    /// The endpoint for a dialect, if this provider speaks it.
    pub fn endpoint(&self, dialect: ApiDialect) -> Option<&str> {
        self.endpoints.get(&dialect).map(String::as_str)
    }

    /// Whether the provider natively speaks the given dialect.
    pub fn speaks(&self, dialect: ApiDialect) -> bool {
        self.dialects.contains(&dialect)
    }

    /// Account id for cooldown scoping, when credentials carry one.
    pub fn account_id(&self) -> Option<&str> {
        self.auth.as_ref().and_then(|auth| auth.account_id.as_deref())
    }
}

/// Human-readable duration wrapper for cooldown overrides.
#[derive(Clone, Copy, Deserialize)]
pub struct CooldownDuration(#[serde(deserialize_with = "duration_str::deserialize_duration")] pub Duration);

impl std::fmt::Debug for CooldownDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_endpoint_per_dialect() {
        let config: ProviderConfig = toml::from_str(indoc::indoc! {r#"
            dialects = ["chat", "messages"]

            [endpoints]
            chat = "https://api.acme.dev/v1/chat/completions"
            messages = "https://api.acme.dev/v1/messages"

            [auth]
            scheme = "x-api-key"
            secret = "sk-test"
            account_id = "team-a"
        "#})
        .unwrap();

        assert!(config.enabled);
        assert!(config.speaks(ApiDialect::Messages));
        assert!(!config.speaks(ApiDialect::Gemini));
        assert_eq!(
            config.endpoint(ApiDialect::Chat),
            Some("https://api.acme.dev/v1/chat/completions")
        );
        assert_eq!(config.account_id(), Some("team-a"));
    }

    #[test]
    fn cooldown_overrides_parse_durations() {
        let config: ProviderConfig = toml::from_str(indoc::indoc! {r#"
            dialects = ["chat"]

            [endpoints]
            chat = "https://api.acme.dev/v1/chat/completions"

            [cooldowns]
            rate_limit = "2m"
        "#})
        .unwrap();

        let duration = config.cooldowns.get(&CooldownReason::RateLimit).unwrap();
        assert_eq!(duration.0, Duration::from_secs(120));
    }
}
