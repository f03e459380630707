//! Per-request context threaded through the dispatch pipeline.

use std::sync::OnceLock;

use jiff::Timestamp;

use crate::{dialect::DialectTag, tap::TapRole};

/// Effective per-token pricing for the selected target, captured at dispatch
/// so a config reload mid-stream cannot change what the request is billed.
#[derive(Debug, Clone, Copy)]
pub struct CostRates {
    /// USD per million input tokens, discount applied.
    pub input: f64,
    /// USD per million output tokens, discount applied.
    pub output: f64,
}

impl CostRates {
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input + output_tokens as f64 * self.output) / 1_000_000.0
    }
}

/// Context for one dispatch, created at intake and filled as the pipeline
/// proceeds. Shared immutably once streaming starts; the first-token marks
/// are the only late writes and go through `OnceLock`.
#[derive(Debug)]
pub struct RequestContext {
    /// Request id, a v4 UUID unless the caller supplied one.
    pub id: String,
    /// Intake time.
    pub start_time: Timestamp,
    /// Client socket address, when known.
    pub client_ip: Option<String>,
    /// Name of the gateway API key that authenticated the request.
    pub api_key_name: Option<String>,
    /// Dialect the client spoke.
    pub client_dialect: DialectTag,
    /// Whether the client asked for a streaming response.
    pub streaming: bool,

    /// Alias the model name resolved to.
    pub alias: Option<String>,
    /// Selected provider.
    pub provider: Option<String>,
    /// Selected model, as the provider knows it.
    pub model: Option<String>,
    /// Dialect of the provider call.
    pub target_dialect: Option<DialectTag>,
    /// Pricing captured for the selected model.
    pub cost_rates: Option<CostRates>,

    first_token_provider: OnceLock<Timestamp>,
    first_token_client: OnceLock<Timestamp>,
}

impl RequestContext {
    pub fn new(
        id: String,
        client_dialect: DialectTag,
        client_ip: Option<String>,
        api_key_name: Option<String>,
        streaming: bool,
    ) -> Self {
        Self {
            id,
            start_time: Timestamp::now(),
            client_ip,
            api_key_name,
            client_dialect,
            streaming,
            alias: None,
            provider: None,
            model: None,
            target_dialect: None,
            cost_rates: None,
            first_token_provider: OnceLock::new(),
            first_token_client: OnceLock::new(),
        }
    }

    /// Record the first-token time for a role. Returns true on the first
    /// call for that role, false on any repeat.
    pub fn mark_first_token(&self, role: TapRole) -> bool {
        let cell = match role {
            TapRole::Provider => &self.first_token_provider,
            TapRole::Client => &self.first_token_client,
        };

        cell.set(Timestamp::now()).is_ok()
    }

    /// The recorded first-token time for a role.
    pub fn first_token_at(&self, role: TapRole) -> Option<Timestamp> {
        match role {
            TapRole::Provider => self.first_token_provider.get().copied(),
            TapRole::Client => self.first_token_client.get().copied(),
        }
    }

    /// Milliseconds from intake to the first token for a role.
    pub fn ttft_ms(&self, role: TapRole) -> Option<f64> {
        self.first_token_at(role).map(|at| {
            (at - self.start_time)
                .total(jiff::Unit::Millisecond)
                .unwrap_or_default()
        })
    }

    /// Milliseconds since intake.
    pub fn elapsed_ms(&self) -> f64 {
        (Timestamp::now() - self.start_time)
            .total(jiff::Unit::Millisecond)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_token_marks_only_once_per_role() {
        let context = RequestContext::new("req_1".into(), DialectTag::Chat, None, None, true);

        assert!(context.mark_first_token(TapRole::Provider));
        assert!(!context.mark_first_token(TapRole::Provider));
        assert!(context.mark_first_token(TapRole::Client));

        assert!(context.first_token_at(TapRole::Provider).is_some());
        assert!(context.ttft_ms(TapRole::Client).is_some());
    }

    #[test]
    fn cost_rates_scale_per_million() {
        let rates = CostRates { input: 2.0, output: 10.0 };
        assert!((rates.cost(500_000, 100_000) - 2.0).abs() < f64::EPSILON);
    }
}
