//! One-shot post-stream finalization.
//!
//! Whichever trigger arrives first wins: normal completion, client
//! cancellation, or the watchdog. The work itself runs on a spawned task so
//! triggers can fire from synchronous contexts (including `Drop`).

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::{
    metrics::MetricsCollector,
    request::RequestContext,
    store::DebugLogger,
    tap::TapRole,
    unified::{UnifiedResponse, UnifiedUsage},
    usage::UsageLogger,
};

/// What caused finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeTrigger {
    /// The client-side stream drained normally.
    Complete,
    /// The client disconnected mid-stream.
    Cancelled,
    /// The watchdog budget elapsed with no completion.
    Watchdog,
}

/// One-per-request finalization handle, shared by both taps.
pub struct Finalizer {
    pub(crate) fired: AtomicBool,
    context: Arc<RequestContext>,
    usage: Arc<UsageLogger>,
    debug: Arc<DebugLogger>,
    metrics: Arc<MetricsCollector>,
}

impl Finalizer {
    pub fn new(
        context: Arc<RequestContext>,
        usage: Arc<UsageLogger>,
        debug: Arc<DebugLogger>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            fired: AtomicBool::new(false),
            context,
            usage,
            debug,
            metrics,
        }
    }

    /// Fire finalization. Every call after the first is a no-op.
    pub fn trigger(&self, trigger: FinalizeTrigger) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }

        log::debug!(
            "Finalizing request {id} ({trigger:?})",
            id = self.context.id
        );

        let context = self.context.clone();
        let usage = self.usage.clone();
        let debug = self.debug.clone();
        let metrics = self.metrics.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    run(context, usage, debug, metrics, trigger).await;
                });
            }
            Err(_) => {
                log::warn!(
                    "No async runtime available, request {id} not finalized",
                    id = self.context.id
                );
            }
        }
    }
}

async fn run(
    context: Arc<RequestContext>,
    usage_logger: Arc<UsageLogger>,
    debug: Arc<DebugLogger>,
    metrics: Arc<MetricsCollector>,
    trigger: FinalizeTrigger,
) {
    let client_dialect = context.client_dialect;
    let target_dialect = context.target_dialect.unwrap_or(client_dialect);

    let client_capture = debug.captured(&context.id, TapRole::Client);
    let provider_capture = debug.captured(&context.id, TapRole::Provider);

    let client_response = client_capture
        .as_deref()
        .and_then(|text| client_dialect.reconstruct_from_stream(text));
    let provider_response = provider_capture
        .as_deref()
        .and_then(|text| target_dialect.reconstruct_from_stream(text));

    // Consistency signal only: a mismatch is logged, never fatal.
    if let (Some(client), Some(provider)) = (&client_response, &provider_response) {
        compare_reconstructions(&context.id, client, provider);
    }

    // The client-side view is authoritative: it is what the client was
    // actually told.
    let usage = client_response
        .as_ref()
        .map(|response| response.usage)
        .filter(has_counts)
        .or_else(|| provider_response.as_ref().map(|response| response.usage).filter(has_counts));

    let cancelled = trigger != FinalizeTrigger::Complete;

    if !cancelled && let Some(provider) = &context.provider {
        let usage = usage.unwrap_or_default();
        let cost = context
            .cost_rates
            .map(|rates| rates.cost(usage.input_tokens, usage.output_tokens))
            .unwrap_or(0.0);

        metrics.record_success(
            provider,
            context.elapsed_ms(),
            usage.input_tokens,
            usage.output_tokens,
            cost,
        );
    }

    usage_logger
        .update_usage_from_reconstructed(&context, usage, cancelled)
        .await;

    debug.flush(&context.id).await;
}

fn has_counts(usage: &UnifiedUsage) -> bool {
    usage.input_tokens > 0 || usage.output_tokens > 0 || usage.total_tokens > 0
}

fn compare_reconstructions(request_id: &str, client: &UnifiedResponse, provider: &UnifiedResponse) {
    if client.tool_calls.len() != provider.tool_calls.len() {
        log::warn!(
            "Reconstruction mismatch for {request_id}: client has {client_calls} tool calls, provider has {provider_calls}",
            client_calls = client.tool_calls.len(),
            provider_calls = provider.tool_calls.len(),
        );
    }

    let client_len = client.content.as_deref().map(str::len).unwrap_or(0);
    let provider_len = provider.content.as_deref().map(str::len).unwrap_or(0);

    if client_len != provider_len {
        log::debug!(
            "Reconstruction content length differs for {request_id}: client {client_len}, provider {provider_len}"
        );
    }
}
