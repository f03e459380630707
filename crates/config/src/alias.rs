//! Model alias configuration.
//!
//! An alias is the model name a client sends; it maps to an ordered list of
//! `(provider, model)` targets plus a selection strategy.

use serde::Deserialize;

use crate::provider::ApiDialect;

/// Target selection strategy for an alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorStrategy {
    /// Weighted random pick, default weight 1.
    #[default]
    Random,
    /// First target not previously attempted, wrapping to the start.
    InOrder,
    /// Lowest expected input+output cost per million tokens.
    Cost,
    /// Lowest observed average time to first token.
    Latency,
    /// Highest observed tokens per second.
    Performance,
    /// Lowest recent request count.
    Usage,
}

/// Whether dialect compatibility outranks the selector strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasPriority {
    /// Order targets purely by the selector strategy.
    #[default]
    Selector,
    /// Move targets natively speaking the client dialect ahead of targets
    /// that would require transformation.
    ApiMatch,
}

/// What kind of API surface an alias serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasKind {
    /// Chat/messages/generateContent inference. The only kind the dispatch
    /// pipeline serves.
    #[default]
    Chat,
    /// Embeddings endpoint alias.
    Embeddings,
    /// Audio transcription alias.
    Transcriptions,
    /// Speech synthesis alias.
    Speech,
    /// Image generation alias.
    Image,
    /// OpenAI responses API alias.
    Responses,
}

/// Request-munging behaviors an alias can opt into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasBehavior {
    /// Remove a `thinking` field equal to `{"type":"adaptive"}` from outbound
    /// messages-dialect requests.
    StripAdaptiveThinking,
}

/// One concrete `(provider, model)` candidate for an alias.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// Provider name, referencing `[providers.<name>]`.
    pub provider: String,
    /// Model name as the provider knows it.
    pub model: String,
    /// Relative weight for random selection. Defaults to 1.
    #[serde(default)]
    pub weight: Option<f64>,
    /// Whether this target may be selected. Defaults to true.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Dialect override when the provider speaks several and this model is
    /// only reachable through one of them.
    #[serde(default)]
    pub api_type: Option<ApiDialect>,
}

/// Configuration for one model alias.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AliasConfig {
    /// Secondary alias ids resolving to the same configuration.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Ordered candidate targets.
    pub targets: Vec<TargetConfig>,
    /// Selection strategy, defaults to weighted random.
    #[serde(default)]
    pub strategy: SelectorStrategy,
    /// Whether dialect match outranks the strategy.
    #[serde(default)]
    pub priority: AliasPriority,
    /// Alias kind; only `chat` is served by the dispatch pipeline.
    #[serde(default)]
    pub kind: AliasKind,
    /// Opt-in behaviors.
    #[serde(default)]
    pub behaviors: Vec<AliasBehavior>,
}

impl AliasConfig {
    /// Whether a behavior is enabled on this alias.
    pub fn has_behavior(&self, behavior: AliasBehavior) -> bool {
        self.behaviors.contains(&behavior)
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_defaults() {
        let config: AliasConfig = toml::from_str(indoc::indoc! {r#"
            [[targets]]
            provider = "acme"
            model = "gpt-4o"
        "#})
        .unwrap();

        assert_eq!(config.strategy, SelectorStrategy::Random);
        assert_eq!(config.priority, AliasPriority::Selector);
        assert_eq!(config.kind, AliasKind::Chat);
        assert!(config.targets[0].enabled);
        assert!(config.targets[0].weight.is_none());
    }

    #[test]
    fn behaviors_and_api_type() {
        let config: AliasConfig = toml::from_str(indoc::indoc! {r#"
            strategy = "in_order"
            priority = "api_match"
            behaviors = ["strip_adaptive_thinking"]

            [[targets]]
            provider = "acme"
            model = "claude-sonnet-4"
            api_type = "messages"
            weight = 3.0
        "#})
        .unwrap();

        assert!(config.has_behavior(AliasBehavior::StripAdaptiveThinking));
        assert_eq!(config.targets[0].api_type, Some(ApiDialect::Messages));
        assert_eq!(config.strategy, SelectorStrategy::InOrder);
        assert_eq!(config.priority, AliasPriority::ApiMatch);
    }
}
