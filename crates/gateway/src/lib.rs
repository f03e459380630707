//! The request dispatch pipeline: authentication context, alias routing,
//! target selection, dialect transformation, streaming taps, cooldowns and
//! usage accounting behind the inference endpoints.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    http::request::Parts,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Serialize;

pub mod cooldown;
pub mod dialect;
pub mod dispatch;
mod error;
pub mod finalize;
mod http_client;
pub mod metrics;
pub mod provider;
pub mod request;
pub mod router;
mod sanitize;
pub mod selector;
pub mod store;
pub mod tap;
pub mod unified;
pub mod usage;

pub use dialect::DialectTag;
pub use dispatch::{Dispatcher, InboundRequest};
pub use error::{DialectError, DialectResult, GatewayError, GatewayResult};

use crate::{
    cooldown::CooldownManager,
    metrics::MetricsCollector,
    store::{DebugLogger, EventBus, JsonCooldownStore, JsonlErrorStore, JsonlUsageStore},
    usage::UsageLogger,
};

/// Name of the gateway API key a request authenticated with, inserted as a
/// request extension by the server's auth layer.
#[derive(Debug, Clone)]
pub struct ApiKeyName(pub String);

/// Owner string reported for aliases in the models listing.
const MODEL_OWNER: &str = "prism";

/// Build a dispatcher with file-backed stores at the configured locations
/// and cooldown state loaded from disk.
pub async fn build(config: config::SharedConfig) -> anyhow::Result<Dispatcher> {
    let snapshot = config.get();

    let usage_store = Arc::new(JsonlUsageStore::new(snapshot.storage.usage_log()));
    let error_store = Arc::new(JsonlErrorStore::new(snapshot.storage.error_log()));
    let debug = Arc::new(DebugLogger::new(snapshot.storage.debug_dir()));
    let cooldown_store = Arc::new(JsonCooldownStore::new(snapshot.storage.cooldown_state()));

    let cooldowns = Arc::new(CooldownManager::new(config.clone(), cooldown_store));
    cooldowns.load().await;

    let metrics = Arc::new(MetricsCollector::new(snapshot.metrics.window));
    let usage = Arc::new(UsageLogger::new(usage_store));

    Ok(Dispatcher::from_parts(
        config,
        cooldowns,
        metrics,
        usage,
        error_store,
        debug,
        EventBus::default(),
        None,
    ))
}

/// The inference endpoints, state included. Auth, CORS and health live with
/// the server assembly.
pub fn api_router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(messages))
        .route("/v1beta/models/{model_action}", post(gemini_generate))
        .route("/v1/models", get(list_models))
        .with_state(dispatcher)
}

async fn chat_completions(
    State(dispatcher): State<Dispatcher>,
    parts: Parts,
    body: Bytes,
) -> DialectResult<Response> {
    dispatch_request(dispatcher, DialectTag::Chat, None, None, &parts, body).await
}

async fn messages(State(dispatcher): State<Dispatcher>, parts: Parts, body: Bytes) -> DialectResult<Response> {
    dispatch_request(dispatcher, DialectTag::Messages, None, None, &parts, body).await
}

async fn gemini_generate(
    State(dispatcher): State<Dispatcher>,
    Path(model_action): Path<String>,
    parts: Parts,
    body: Bytes,
) -> DialectResult<Response> {
    let Some((model, action)) = model_action.split_once(':') else {
        return Err(DialectError::new(
            GatewayError::InvalidRequest(format!(
                "expected path of the form models/{{model}}:{{action}}, got 'models/{model_action}'"
            )),
            DialectTag::Gemini,
        ));
    };

    let stream = match action {
        "generateContent" => false,
        action if action.contains("streamGenerateContent") => true,
        _ => {
            return Err(DialectError::new(
                GatewayError::InvalidRequest(format!("unsupported action '{action}'")),
                DialectTag::Gemini,
            ));
        }
    };

    dispatch_request(
        dispatcher,
        DialectTag::Gemini,
        Some(model.to_string()),
        Some(stream),
        &parts,
        body,
    )
    .await
}

async fn dispatch_request(
    dispatcher: Dispatcher,
    dialect: DialectTag,
    model: Option<String>,
    stream: Option<bool>,
    parts: &Parts,
    body: Bytes,
) -> DialectResult<Response> {
    let client_ip = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    let api_key_name = parts
        .extensions
        .get::<ApiKeyName>()
        .map(|ApiKeyName(name)| name.clone());

    dispatcher
        .dispatch(InboundRequest {
            body,
            dialect,
            model,
            stream,
            client_ip,
            api_key_name,
        })
        .await
}

#[derive(Serialize)]
struct ModelsResponse {
    object: &'static str,
    data: Vec<ModelEntry>,
}

#[derive(Serialize)]
struct ModelEntry {
    id: String,
    object: &'static str,
    created: u64,
    owned_by: &'static str,
}

async fn list_models(State(dispatcher): State<Dispatcher>) -> impl IntoResponse {
    let data = dispatcher
        .model_ids()
        .into_iter()
        .map(|id| ModelEntry {
            id,
            object: "model",
            created: 0,
            owned_by: MODEL_OWNER,
        })
        .collect();

    Json(ModelsResponse {
        object: "list",
        data,
    })
}
