//! Alias resolution and target candidate construction.

use std::{collections::HashMap, sync::Arc};

use config::{AliasConfig, AliasPriority, Config};
use itertools::Itertools;

use crate::{
    dialect::DialectTag,
    error::{GatewayError, GatewayResult},
};

/// A resolved alias: the primary id plus its configuration.
#[derive(Debug)]
pub struct ResolvedAlias {
    /// The primary alias id, regardless of which secondary matched.
    pub id: String,
    /// The alias configuration.
    pub config: AliasConfig,
}

/// One selectable `(provider, model, dialect)` candidate.
#[derive(Debug, Clone)]
pub struct TargetCandidate {
    /// Position in the alias target list, used for in-order selection and
    /// attempt bookkeeping.
    pub index: usize,
    /// Provider name.
    pub provider: String,
    /// Model as the provider knows it.
    pub model: String,
    /// Dialect the provider call will speak.
    pub dialect: DialectTag,
    /// Relative weight for random selection.
    pub weight: f64,
    /// Expected input+output cost per million tokens, discount applied.
    pub cost_per_mtok: Option<f64>,
    /// Account scope for cooldown matching.
    pub account_id: Option<String>,
}

/// Case-insensitive index from every alias id to its configuration.
pub struct AliasRouter {
    index: HashMap<String, Arc<ResolvedAlias>>,
    /// Every alias id in configuration order, for the models listing.
    ids: Vec<String>,
}

impl AliasRouter {
    pub fn new(config: &Config) -> Self {
        let mut index = HashMap::new();
        let mut ids = Vec::new();

        for (primary, alias_config) in &config.aliases {
            let resolved = Arc::new(ResolvedAlias {
                id: primary.clone(),
                config: alias_config.clone(),
            });

            for id in std::iter::once(primary).chain(alias_config.aliases.iter()) {
                ids.push(id.clone());

                if index.insert(id.to_ascii_lowercase(), resolved.clone()).is_some() {
                    // The loader rejects duplicates; a reload race could
                    // still produce one, last wins.
                    log::warn!("Alias id '{id}' shadows an earlier alias");
                }
            }
        }

        Self { index, ids }
    }

    /// Resolve an incoming model name to its alias, case-insensitively.
    pub fn resolve(&self, name: &str) -> GatewayResult<Arc<ResolvedAlias>> {
        self.index.get(&name.to_ascii_lowercase()).cloned().ok_or_else(|| {
            log::debug!(
                "Model '{name}' not found. Configured aliases: [{ids}]",
                ids = self.ids.iter().join(", ")
            );

            GatewayError::ModelNotFound(name.to_string())
        })
    }

    /// Every alias id, primaries and secondaries, in configuration order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Build the candidate list for an alias: disabled providers and
    /// disabled targets drop out, each target resolves to a concrete
    /// dialect, and with `api_match` priority candidates natively speaking
    /// the client dialect move ahead of ones needing transformation.
    ///
    /// Cooldown filtering happens in the dispatcher, which owns the manager.
    pub fn candidates(
        &self,
        alias: &ResolvedAlias,
        config: &Config,
        client_dialect: DialectTag,
    ) -> Vec<TargetCandidate> {
        let mut candidates = Vec::with_capacity(alias.config.targets.len());

        for (index, target) in alias.config.targets.iter().enumerate() {
            if !target.enabled {
                continue;
            }

            let Some(provider) = config.providers.get(&target.provider) else {
                log::warn!(
                    "Alias '{alias}' target references unknown provider '{provider}'",
                    alias = alias.id,
                    provider = target.provider
                );
                continue;
            };

            if !provider.enabled {
                continue;
            }

            let dialect = resolve_target_dialect(target.api_type, provider, client_dialect);

            let Some(dialect) = dialect else {
                log::warn!(
                    "Alias '{alias}' target '{model}' has no usable dialect on provider '{provider}'",
                    alias = alias.id,
                    model = target.model,
                    provider = target.provider
                );
                continue;
            };

            let cost_per_mtok = config.pricing.get(&target.model).map(|pricing| {
                let discount = provider.discount.unwrap_or(0.0);
                pricing.combined() * (1.0 - discount)
            });

            candidates.push(TargetCandidate {
                index,
                provider: target.provider.clone(),
                model: target.model.clone(),
                dialect,
                weight: target.weight.unwrap_or(1.0),
                cost_per_mtok,
                account_id: provider.account_id().map(str::to_string),
            });
        }

        if alias.config.priority == AliasPriority::ApiMatch {
            // Stable partition: dialect matches first, config order preserved
            // within each group.
            let (matching, other): (Vec<_>, Vec<_>) = candidates
                .into_iter()
                .partition(|candidate| candidate.dialect == client_dialect);

            candidates = matching;
            candidates.extend(other);
        }

        candidates
    }
}

fn resolve_target_dialect(
    api_type: Option<config::ApiDialect>,
    provider: &config::ProviderConfig,
    client_dialect: DialectTag,
) -> Option<DialectTag> {
    if let Some(api_type) = api_type {
        return provider.speaks(api_type).then(|| DialectTag::from(api_type));
    }

    // Prefer the identity path when the provider natively speaks the
    // client's dialect.
    let native = provider
        .dialects
        .iter()
        .find(|dialect| DialectTag::from(**dialect) == client_dialect);

    native
        .or_else(|| provider.dialects.first())
        .copied()
        .map(DialectTag::from)
}
