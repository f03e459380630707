//! Usage accounting.
//!
//! Streaming requests get a pending zero-token record at stream start and an
//! accurate rewrite after finalization reconstructs the response. Non-stream
//! and error paths emit a single closed record.

use std::sync::Arc;

use dashmap::DashMap;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::{
    dialect::DialectTag,
    request::RequestContext,
    store::UsageStore,
    tap::TapRole,
    unified::UnifiedUsage,
};

/// One usage record, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub timestamp: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub client_dialect: DialectTag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_dialect: Option<DialectTag>,
    pub streaming: bool,
    /// True while a streaming request awaits reconstruction.
    pub pending: bool,
    pub usage: UnifiedUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttft_provider_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttft_client_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// Set when the stream ended by client cancellation or watchdog.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<bool>,
}

impl UsageRecord {
    fn from_context(context: &RequestContext) -> Self {
        Self {
            request_id: context.id.clone(),
            timestamp: context.start_time,
            api_key_name: context.api_key_name.clone(),
            client_ip: context.client_ip.clone(),
            alias: context.alias.clone(),
            provider: context.provider.clone(),
            model: context.model.clone(),
            client_dialect: context.client_dialect,
            target_dialect: context.target_dialect,
            streaming: context.streaming,
            pending: false,
            usage: UnifiedUsage::default(),
            cost: None,
            duration_ms: None,
            ttft_provider_ms: None,
            ttft_client_ms: None,
            error_type: None,
            http_status: None,
            cancelled: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test() -> Self {
        Self {
            request_id: "req_test".into(),
            timestamp: Timestamp::now(),
            api_key_name: None,
            client_ip: None,
            alias: None,
            provider: None,
            model: None,
            client_dialect: DialectTag::Chat,
            target_dialect: None,
            streaming: false,
            pending: false,
            usage: UnifiedUsage::default(),
            cost: None,
            duration_ms: None,
            ttft_provider_ms: None,
            ttft_client_ms: None,
            error_type: None,
            http_status: None,
            cancelled: None,
        }
    }
}

/// Emits and maintains usage records.
pub struct UsageLogger {
    store: Arc<dyn UsageStore>,
    /// In-memory pending records, keyed by request id. Mutations are
    /// serialized per id by the single owning pipeline task.
    pending: DashMap<String, UsageRecord>,
}

impl UsageLogger {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self {
            store,
            pending: DashMap::new(),
        }
    }

    /// Emit a closed record for a completed non-stream response.
    pub fn log_completed(&self, context: &RequestContext, usage: UnifiedUsage) {
        let mut record = UsageRecord::from_context(context);
        record.usage = usage;
        record.cost = context
            .cost_rates
            .map(|rates| rates.cost(usage.input_tokens, usage.output_tokens));
        record.duration_ms = Some(context.elapsed_ms());

        self.append(record);
    }

    /// Emit the initial pending record at stream start, zero tokens.
    pub fn log_stream_started(&self, context: &RequestContext) {
        let mut record = UsageRecord::from_context(context);
        record.pending = true;

        self.pending.insert(record.request_id.clone(), record.clone());
        self.append(record);
    }

    /// Emit a closed record for a failed request, carrying whatever partial
    /// usage was captured.
    pub fn log_error(&self, context: &RequestContext, error_type: &str, http_status: Option<u16>) {
        let mut record = self
            .pending
            .remove(&context.id)
            .map(|(_, record)| record)
            .unwrap_or_else(|| UsageRecord::from_context(context));

        record.pending = false;
        record.error_type = Some(error_type.to_string());
        record.http_status = http_status;
        record.duration_ms = Some(context.elapsed_ms());

        self.append(record);
    }

    /// Update the in-memory record's first-token timestamp.
    pub fn mark_first_token(&self, context: &RequestContext, role: TapRole) {
        if let Some(mut record) = self.pending.get_mut(&context.id) {
            match role {
                TapRole::Provider => record.ttft_provider_ms = context.ttft_ms(role),
                TapRole::Client => record.ttft_client_ms = context.ttft_ms(role),
            }
        }
    }

    /// Rewrite the pending record with reconstructed counts and computed
    /// cost; clears the pending flag. Absent usage keeps the zeros.
    pub async fn update_usage_from_reconstructed(
        &self,
        context: &RequestContext,
        usage: Option<UnifiedUsage>,
        cancelled: bool,
    ) {
        let mut record = self
            .pending
            .remove(&context.id)
            .map(|(_, record)| record)
            .unwrap_or_else(|| UsageRecord::from_context(context));

        if let Some(usage) = usage {
            record.usage = usage;
            record.cost = context
                .cost_rates
                .map(|rates| rates.cost(usage.input_tokens, usage.output_tokens));
        }

        record.pending = false;
        record.cancelled = cancelled.then_some(true);
        record.duration_ms = Some(context.elapsed_ms());
        record.ttft_provider_ms = context.ttft_ms(TapRole::Provider);
        record.ttft_client_ms = context.ttft_ms(TapRole::Client);

        if let Err(e) = self.store.update_usage(&record).await {
            log::error!(
                "Failed to update usage record for {id}: {e}",
                id = record.request_id
            );
        }
    }

    fn append(&self, record: UsageRecord) {
        let store = self.store.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.append(&record).await {
                        log::error!(
                            "Failed to append usage record for {id}: {e}",
                            id = record.request_id
                        );
                    }
                });
            }
            Err(_) => log::warn!("No async runtime available, usage record not persisted"),
        }
    }
}
