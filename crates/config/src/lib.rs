//! Prism configuration structures to map the prism.toml configuration.

#![deny(missing_docs)]

mod alias;
mod auth;
mod cooldown;
mod loader;
mod metrics;
mod pricing;
mod provider;
mod server;
mod shared;
mod storage;

use std::path::Path;

pub use alias::{AliasBehavior, AliasConfig, AliasKind, AliasPriority, SelectorStrategy, TargetConfig};
pub use auth::{ApiKeyConfig, AuthConfig};
pub use cooldown::{CooldownReason, CooldownsConfig};
pub use loader::watch;
pub use metrics::MetricsConfig;
pub use pricing::ModelPricing;
pub use provider::{ApiDialect, ProviderAuthConfig, ProviderAuthScheme, ProviderConfig};
pub use server::ServerConfig;
pub use shared::SharedConfig;
pub use storage::StorageConfig;

use indexmap::IndexMap;
use serde::Deserialize;

/// Main configuration structure for the Prism application.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    pub server: ServerConfig,
    /// Gateway API key configuration.
    pub auth: AuthConfig,
    /// Map of upstream provider configurations, in file order.
    pub providers: IndexMap<String, ProviderConfig>,
    /// Map of model alias configurations, keyed by the primary alias id.
    pub aliases: IndexMap<String, AliasConfig>,
    /// Cooldown durations and clamps.
    pub cooldowns: CooldownsConfig,
    /// Metrics window settings.
    pub metrics: MetricsConfig,
    /// On-disk storage locations for usage, error, debug and cooldown state.
    pub storage: StorageConfig,
    /// Static per-model pricing table, cost per million tokens.
    pub pricing: IndexMap<String, ModelPricing>,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validates alias targets against providers and checks auth keys exist.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate(self)
    }

    /// Whether any provider is configured and enabled.
    pub fn has_providers(&self) -> bool {
        self.providers.values().any(|provider| provider.enabled)
    }
}
