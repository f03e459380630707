//! The per-request dispatch pipeline.
//!
//! One logical task carries a request from intake to completion:
//! route → select → transform in → call → tap/transform/tap → respond.
//! Observability (usage records, error records, debug traces, metrics)
//! hangs off the side of that path, never in front of it.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{HeaderValue, header},
    response::Response,
};
use bytes::Bytes;
use config::{AliasBehavior, AliasKind, Config, SharedConfig};
use serde::Deserialize;

use crate::{
    cooldown::{self, CooldownManager, SetCooldown},
    dialect::{ByteStream, DialectTag},
    error::{DialectError, DialectResult, GatewayError},
    finalize::Finalizer,
    metrics::MetricsCollector,
    provider::{self, ProviderClient, RawBody, RawResponse},
    request::{CostRates, RequestContext},
    router::{AliasRouter, TargetCandidate},
    sanitize,
    selector::{self, SelectionContext},
    store::{DebugLogger, ErrorRecord, ErrorStore, EventBus},
    tap::{DEFAULT_WATCHDOG, StreamTap, TapRole},
    usage::UsageLogger,
};

/// An inbound inference request, already authenticated.
pub struct InboundRequest {
    pub body: Bytes,
    pub dialect: DialectTag,
    /// Model from the URL path (gemini); `None` means read it from the body.
    pub model: Option<String>,
    /// Streaming flag from the URL action (gemini); `None` means read it
    /// from the body.
    pub stream: Option<bool>,
    pub client_ip: Option<String>,
    pub api_key_name: Option<String>,
}

/// Minimal body peek for routing, before any full parse.
#[derive(Deserialize)]
struct BodyPeek {
    model: Option<String>,
    stream: Option<bool>,
}

/// The dispatcher and its collaborators.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    config: SharedConfig,
    router: std::sync::RwLock<Arc<AliasRouter>>,
    client: ProviderClient,
    cooldowns: Arc<CooldownManager>,
    metrics: Arc<MetricsCollector>,
    usage: Arc<UsageLogger>,
    errors: Arc<dyn ErrorStore>,
    debug: Arc<DebugLogger>,
    events: EventBus,
    watchdog: Option<Duration>,
}

impl Dispatcher {
    #[expect(clippy::too_many_arguments)]
    pub fn from_parts(
        config: SharedConfig,
        cooldowns: Arc<CooldownManager>,
        metrics: Arc<MetricsCollector>,
        usage: Arc<UsageLogger>,
        errors: Arc<dyn ErrorStore>,
        debug: Arc<DebugLogger>,
        events: EventBus,
        watchdog: Option<Duration>,
    ) -> Self {
        let router = Arc::new(AliasRouter::new(&config.get()));

        Self {
            inner: Arc::new(DispatcherInner {
                config,
                router: std::sync::RwLock::new(router),
                client: ProviderClient::default(),
                cooldowns,
                metrics,
                usage,
                errors,
                debug,
                events,
                watchdog,
            }),
        }
    }

    /// Swap in a reloaded configuration; in-flight requests keep the
    /// snapshot they started with.
    pub fn reload(&self, config: Config) {
        let router = Arc::new(AliasRouter::new(&config));
        self.inner.config.replace(config);
        *self.inner.router.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = router;

        self.inner.events.emit("config_reloaded", serde_json::json!({}));
    }

    /// The alias ids served, for the models listing.
    pub fn model_ids(&self) -> Vec<String> {
        self.router().ids().to_vec()
    }

    /// The cooldown manager, surfaced for observers.
    pub fn cooldowns(&self) -> &Arc<CooldownManager> {
        &self.inner.cooldowns
    }

    /// The metrics collector, surfaced for observers.
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.inner.metrics
    }

    /// The event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    fn router(&self) -> Arc<AliasRouter> {
        self.inner
            .router
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Run the full pipeline for one request.
    pub async fn dispatch(&self, inbound: InboundRequest) -> DialectResult<Response> {
        let dialect = inbound.dialect;

        self.dispatch_inner(inbound)
            .await
            .map_err(|(context, error)| self.fail(context.as_deref(), dialect, error))
    }

    async fn dispatch_inner(
        &self,
        inbound: InboundRequest,
    ) -> Result<Response, (Option<Arc<RequestContext>>, GatewayError)> {
        // Read once; this snapshot serves the whole request.
        let config = self.inner.config.get();
        let router = self.router();

        let peek: BodyPeek = sonic_rs::from_slice(&inbound.body).unwrap_or(BodyPeek {
            model: None,
            stream: None,
        });

        let Some(model) = inbound.model.clone().or(peek.model) else {
            return Err((None, GatewayError::InvalidRequest("missing required field 'model'".into())));
        };

        let streaming = inbound.stream.or(peek.stream).unwrap_or(false);

        let mut context = RequestContext::new(
            uuid::Uuid::new_v4().to_string(),
            inbound.dialect,
            inbound.client_ip,
            inbound.api_key_name,
            streaming,
        );

        log::debug!(
            "Dispatch {id}: dialect={dialect} model={model} streaming={streaming}",
            id = context.id,
            dialect = inbound.dialect,
        );

        // Route.
        let alias = match router.resolve(&model) {
            Ok(alias) => alias,
            Err(e) => return Err((Some(Arc::new(context)), e)),
        };

        context.alias = Some(alias.id.clone());

        if alias.config.kind != AliasKind::Chat {
            let error = GatewayError::UnsupportedAliasKind {
                alias: alias.id.clone(),
                kind: format!("{:?}", alias.config.kind).to_lowercase(),
            };
            return Err((Some(Arc::new(context)), error));
        }

        // Filter.
        let mut candidates = router.candidates(&alias, &config, inbound.dialect);
        candidates.retain(|candidate| {
            !self
                .inner
                .cooldowns
                .matches(&candidate.provider, &candidate.model, candidate.account_id.as_deref())
        });

        if candidates.is_empty() {
            return Err((Some(Arc::new(context)), GatewayError::NoHealthyTarget(alias.id.clone())));
        }

        // Select.
        let stats = self.inner.metrics.snapshot();
        let selection = SelectionContext {
            strategy: alias.config.strategy,
            previous_attempts: &[],
            stats: &stats,
        };

        let target = {
            let mut rng = rand::rng();
            selector::select(&candidates, &selection, &mut rng)
                .cloned()
                .ok_or_else(|| GatewayError::NoHealthyTarget(alias.id.clone()))
        };
        let target = match target {
            Ok(target) => target,
            Err(e) => return Err((Some(Arc::new(context)), e)),
        };

        context.provider = Some(target.provider.clone());
        context.model = Some(target.model.clone());
        context.target_dialect = Some(target.dialect);
        context.cost_rates = config.pricing.get(&target.model).map(|pricing| {
            let discount = config
                .providers
                .get(&target.provider)
                .and_then(|provider| provider.discount)
                .unwrap_or(0.0);

            CostRates {
                input: pricing.input * (1.0 - discount),
                output: pricing.output * (1.0 - discount),
            }
        });

        log::debug!(
            "Dispatch {id}: selected provider={provider} model={model} dialect={dialect}",
            id = context.id,
            provider = target.provider,
            model = target.model,
            dialect = target.dialect,
        );

        // Transform in/out.
        let identity = inbound.dialect == target.dialect;

        let outbound_body = match self.build_outbound_body(&inbound.body, &alias.config, &target, inbound.dialect, streaming, identity) {
            Ok(body) => body,
            Err(e) => return Err((Some(Arc::new(context)), e)),
        };

        let Some(provider_config) = config.providers.get(&target.provider) else {
            // Candidates come from this same snapshot, so this only fires on
            // a logic error.
            let error = GatewayError::Internal(None);
            return Err((Some(Arc::new(context)), error));
        };

        let outbound_body = match provider::merge_extra_body(outbound_body, provider_config.extra_body.as_ref()) {
            Ok(body) => body,
            Err(e) => return Err((Some(Arc::new(context)), e)),
        };

        let url = match build_url(provider_config, &target, streaming) {
            Ok(url) => url,
            Err(e) => return Err((Some(Arc::new(context)), e)),
        };

        // Call.
        self.inner.metrics.record_start(&target.provider);

        let response = match self
            .inner
            .client
            .request(provider_config, &url, outbound_body, &context.id)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.inner.metrics.record_failure(&target.provider, 0);

                if matches!(e, GatewayError::Connection(_)) || cooldown::is_connection_error(&e.to_string()) {
                    self.set_cooldown_for(&target, None, None, Some(e.to_string()));
                }

                return Err((Some(Arc::new(context)), e));
            }
        };

        // Upstream failure: classify, cool down, surface in client dialect.
        if !response.is_success() {
            return Err((Some(Arc::new(context)), self.handle_upstream_failure(&target, response).await));
        }

        let context = Arc::new(context);

        match response.body {
            RawBody::Buffered(upstream_body) => self
                .respond_buffered(&context, inbound.dialect, target.dialect, identity, upstream_body)
                .map_err(|e| (Some(context.clone()), e)),
            RawBody::Stream(stream) => {
                Ok(self.respond_streaming(&context, inbound.dialect, target.dialect, identity, stream))
            }
        }
    }

    fn build_outbound_body(
        &self,
        raw: &Bytes,
        alias: &config::AliasConfig,
        target: &TargetCandidate,
        client_dialect: DialectTag,
        streaming: bool,
        identity: bool,
    ) -> Result<Vec<u8>, GatewayError> {
        let strip_adaptive = alias.has_behavior(AliasBehavior::StripAdaptiveThinking)
            && target.dialect == DialectTag::Messages;

        if identity {
            // Forward verbatim apart from the model rewrite (the alias name
            // is meaningless upstream) and any behavior edits. Gemini
            // carries the model in the URL, so its body passes untouched.
            if target.dialect == DialectTag::Gemini {
                return Ok(raw.to_vec());
            }

            let mut value: serde_json::Value = serde_json::from_slice(raw)
                .map_err(|e| GatewayError::InvalidRequest(format!("Failed to parse request body: {e}")))?;

            if let Some(object) = value.as_object_mut() {
                object.insert("model".to_string(), serde_json::Value::String(target.model.clone()));

                if strip_adaptive {
                    strip_adaptive_thinking(object);
                }
            }

            return serde_json::to_vec(&value).map_err(|e| GatewayError::Transform(e.to_string()));
        }

        let mut unified = client_dialect.parse_request(raw)?;
        unified.model = target.model.clone();
        unified.stream = Some(streaming);

        if strip_adaptive
            && let Some(reasoning) = &unified.reasoning
            && reasoning.mode.as_deref() == Some("adaptive")
            && reasoning.budget_tokens.is_none()
        {
            unified.reasoning = None;
        }

        target.dialect.format_request(&unified)
    }

    async fn handle_upstream_failure(&self, target: &TargetCandidate, response: RawResponse) -> GatewayError {
        let status = response.status;
        let retry_after = response.retry_after;

        self.inner.metrics.record_failure(&target.provider, status);

        let message = match &response.body {
            RawBody::Buffered(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            RawBody::Stream(_) => String::new(),
        };

        log::warn!(
            "Provider '{provider}' returned {status}: {preview}",
            provider = target.provider,
            preview = truncate(&message, 256),
        );

        if cooldown::reason_for_status(status).is_some() {
            self.set_cooldown_for(target, Some(status), retry_after, Some(truncate(&message, 512)));
        }

        GatewayError::Upstream { status, message }
    }

    fn set_cooldown_for(
        &self,
        target: &TargetCandidate,
        http_status: Option<u16>,
        retry_after: Option<Duration>,
        message: Option<String>,
    ) {
        let reason = match http_status {
            Some(status) => cooldown::reason_for_status(status),
            None => Some(config::CooldownReason::ConnectionError),
        };

        let Some(reason) = reason else { return };

        let entry = self.inner.cooldowns.set_cooldown(SetCooldown {
            provider: target.provider.clone(),
            model: Some(target.model.clone()),
            account: target.account_id.clone(),
            reason: Some(reason),
            duration: None,
            http_status,
            message,
            retry_after,
        });

        self.inner.events.emit(
            "cooldown_set",
            serde_json::json!({
                "provider": entry.provider,
                "model": entry.model,
                "reason": entry.reason,
                "end_time": entry.end_time,
            }),
        );
    }

    fn respond_buffered(
        &self,
        context: &Arc<RequestContext>,
        client_dialect: DialectTag,
        target_dialect: DialectTag,
        identity: bool,
        upstream_body: Bytes,
    ) -> Result<Response, GatewayError> {
        // Usage comes from the provider's own dialect either way.
        let unified = target_dialect.parse_response(&upstream_body)?;

        let client_body = if identity {
            upstream_body.to_vec()
        } else {
            client_dialect.format_response(&unified)?
        };

        self.inner.usage.log_completed(context, unified.usage);

        if let Some(provider) = &context.provider {
            let cost = context
                .cost_rates
                .map(|rates| rates.cost(unified.usage.input_tokens, unified.usage.output_tokens))
                .unwrap_or(0.0);

            self.inner.metrics.record_success(
                provider,
                context.elapsed_ms(),
                unified.usage.input_tokens,
                unified.usage.output_tokens,
                cost,
            );
        }

        Response::builder()
            .status(200)
            .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(Body::from(client_body))
            .map_err(|e| GatewayError::Internal(Some(e.to_string())))
    }

    fn respond_streaming(
        &self,
        context: &Arc<RequestContext>,
        client_dialect: DialectTag,
        target_dialect: DialectTag,
        identity: bool,
        upstream: ByteStream,
    ) -> Response {
        let config = self.inner.config.get();

        self.inner.usage.log_stream_started(context);

        let finalizer = Arc::new(Finalizer::new(
            context.clone(),
            self.inner.usage.clone(),
            self.inner.debug.clone(),
            self.inner.metrics.clone(),
        ));

        // Provider-side tap on the raw upstream bytes.
        let provider_tap: ByteStream = Box::pin(StreamTap::new(
            upstream,
            TapRole::Provider,
            context.clone(),
            self.inner.debug.clone(),
            self.inner.usage.clone(),
            self.inner.metrics.clone(),
            finalizer.clone(),
            None,
        ));

        let client_bytes: ByteStream = if identity {
            if config.server.sanitize_streams {
                sanitize::sanitize_stream(provider_tap)
            } else {
                provider_tap
            }
        } else {
            let events = target_dialect.transform_stream(provider_tap);
            client_dialect.format_stream(events)
        };

        // Client-side tap on the formatted bytes; this one owns finalization
        // and the watchdog.
        let client_tap = StreamTap::new(
            client_bytes,
            TapRole::Client,
            context.clone(),
            self.inner.debug.clone(),
            self.inner.usage.clone(),
            self.inner.metrics.clone(),
            finalizer,
            self.inner.watchdog.or(Some(DEFAULT_WATCHDOG)),
        );

        Response::builder()
            .status(200)
            .header(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"))
            .header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"))
            .header(header::CONNECTION, HeaderValue::from_static("keep-alive"))
            .body(Body::from_stream(client_tap))
            .unwrap_or_else(|e| {
                log::error!("Failed to build streaming response: {e}");
                Response::new(Body::empty())
            })
    }

    /// Terminal failure handling: record the error, close the usage record,
    /// and render the error in the client's dialect.
    fn fail(&self, context: Option<&RequestContext>, dialect: DialectTag, error: GatewayError) -> DialectError {
        log::debug!("Dispatch failed: {error}");

        if let Some(context) = context {
            let status = error.status_code().as_u16();

            self.inner.usage.log_error(context, error.error_type(), Some(status));

            let record = ErrorRecord {
                request_id: context.id.clone(),
                timestamp: jiff::Timestamp::now(),
                error_type: error.error_type().to_string(),
                message: error.client_message(),
                http_status: Some(status),
                alias: context.alias.clone(),
                provider: context.provider.clone(),
                model: context.model.clone(),
            };

            let errors = self.inner.errors.clone();

            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = errors.append(&record).await {
                        log::error!("Failed to append error record: {e}");
                    }
                });
            }
        }

        DialectError::new(error, dialect)
    }
}

fn build_url(
    provider: &config::ProviderConfig,
    target: &TargetCandidate,
    streaming: bool,
) -> Result<String, GatewayError> {
    let endpoint = provider
        .endpoint(target.dialect.into())
        .ok_or_else(|| {
            GatewayError::Internal(Some(format!(
                "Provider '{provider}' has no endpoint for dialect '{dialect}'",
                provider = target.provider,
                dialect = target.dialect,
            )))
        })?
        .trim_end_matches('/');

    // Gemini endpoints are a base URL; the model and action live in the
    // path. The other dialects configure the full endpoint.
    let url = if target.dialect == DialectTag::Gemini {
        let action = if streaming {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };

        format!("{endpoint}/models/{model}:{action}", model = target.model)
    } else {
        endpoint.to_string()
    };

    Ok(url)
}

fn strip_adaptive_thinking(object: &mut serde_json::Map<String, serde_json::Value>) {
    let is_adaptive = object
        .get("thinking")
        .and_then(|thinking| thinking.as_object())
        .is_some_and(|thinking| {
            thinking.len() == 1 && thinking.get("type").and_then(|t| t.as_str()) == Some("adaptive")
        });

    if is_adaptive {
        object.remove("thinking");
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        text.to_string()
    } else {
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}
