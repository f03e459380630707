//! Gateway API key configuration.

use indexmap::IndexMap;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

/// A named gateway API key.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiKeyConfig {
    /// The secret clients present. Never logged.
    pub secret: SecretString,
    /// Disabled keys fail authentication without being removed.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Inbound authentication configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Named API keys; the name ends up on usage records.
    pub keys: IndexMap<String, ApiKeyConfig>,
}

impl AuthConfig {
    /// Resolve a presented secret to its key name, enabled keys only.
    pub fn resolve(&self, presented: &str) -> Option<&str> {
        self.keys
            .iter()
            .find(|(_, key)| key.enabled && key.secret.expose_secret() == presented)
            .map(|(name, _)| name.as_str())
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_enabled_keys_only() {
        let config: AuthConfig = toml::from_str(indoc::indoc! {r#"
            [keys.alice]
            secret = "sk-alice"

            [keys.bob]
            secret = "sk-bob"
            enabled = false
        "#})
        .unwrap();

        assert_eq!(config.resolve("sk-alice"), Some("alice"));
        assert_eq!(config.resolve("sk-bob"), None);
        assert_eq!(config.resolve("sk-nobody"), None);
    }
}
