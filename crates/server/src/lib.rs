//! Prism server library.
//!
//! Provides a reusable server function to serve Prism either for the binary,
//! or for tests that want the full HTTP surface.

#![deny(missing_docs)]

mod auth;
mod cors;
mod logger;

use std::{net::SocketAddr, path::PathBuf};

use anyhow::anyhow;
use auth::AuthLayer;
use axum::{Json, Router, routing::get};
use config::SharedConfig;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Configuration for serving Prism.
pub struct ServeConfig {
    /// The socket address (IP and port) the server will bind to.
    pub listen_address: SocketAddr,
    /// The shared configuration handle; reloads swing this pointer.
    pub config: SharedConfig,
    /// Path of the configuration file to watch for reloads, when any.
    pub config_path: Option<PathBuf>,
    /// Cancellation token for graceful shutdown.
    pub shutdown_signal: CancellationToken,
    /// Log filter string (e.g., "info" or "server=debug,gateway=debug").
    pub log_filter: String,
    /// The version string to log on startup.
    pub version: String,
    /// Optional oneshot sender to send back the bound address (useful if
    /// port 0 was specified).
    pub bound_addr_sender: Option<tokio::sync::oneshot::Sender<SocketAddr>>,
}

/// Starts and runs the Prism server with the provided configuration.
pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        config_path,
        shutdown_signal,
        log_filter,
        version,
        bound_addr_sender,
    }: ServeConfig,
) -> anyhow::Result<()> {
    logger::init(&log_filter);

    log::info!("Prism {version}");

    if !config.get().has_providers() {
        log::warn!("No enabled providers configured; every dispatch will fail routing");
    }

    let dispatcher = gateway::build(config.clone())
        .await
        .map_err(|e| anyhow!("Failed to initialize gateway: {e}"))?;

    // Keep the watcher alive for the lifetime of the server; dropping it
    // stops reloads.
    let _watcher = match config_path {
        Some(path) => {
            let dispatcher = dispatcher.clone();

            match config::watch(path, move |new_config| dispatcher.reload(new_config)) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    log::warn!("Configuration watching disabled: {e}");
                    None
                }
            }
        }
        None => None,
    };

    let api = gateway::api_router(dispatcher.clone()).layer(AuthLayer::new(config.clone()));

    let app = Router::new()
        .merge(api)
        .route("/health", get(health))
        .route("/ready", get(ready))
        .layer(cors::new_layer());

    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|e| anyhow!("Failed to bind to {listen_address}: {e}"))?;

    let bound = listener.local_addr()?;

    if let Some(sender) = bound_addr_sender
        && sender.send(bound).is_err()
    {
        log::warn!("Nobody listening for the bound address");
    }

    log::info!("Chat endpoint:     http://{bound}/v1/chat/completions");
    log::info!("Messages endpoint: http://{bound}/v1/messages");
    log::info!("Gemini endpoint:   http://{bound}/v1beta/models/{{model}}:generateContent");

    tokio::select! {
        result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()) => {
            result.map_err(|e| anyhow!("Failed to start HTTP server: {e}"))?;
        }
        _ = shutdown_signal.cancelled() => {
            log::info!("Received shutdown signal, shutting down gracefully...");
        }
    }

    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn ready() -> Json<serde_json::Value> {
    // Serving at all means the configuration loaded and the gateway built.
    Json(serde_json::json!({"status": "ready"}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn spawn_prism(config_toml: &str) -> (SocketAddr, CancellationToken, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config: config::Config = toml::from_str(config_toml).unwrap();
        config.storage.path = dir.path().to_path_buf();

        let shutdown = CancellationToken::new();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let serve_config = ServeConfig {
            listen_address: "127.0.0.1:0".parse().unwrap(),
            config: SharedConfig::new(config),
            config_path: None,
            shutdown_signal: shutdown.clone(),
            log_filter: "info".to_string(),
            version: "test".to_string(),
            bound_addr_sender: Some(tx),
        };

        tokio::spawn(async move {
            serve(serve_config).await.unwrap();
        });

        let bound = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();

        (bound, shutdown, dir)
    }

    const MINIMAL: &str = indoc::indoc! {r#"
        [auth.keys.alice]
        secret = "sk-alice"

        [providers.acme]
        dialects = ["chat"]
        [providers.acme.endpoints]
        chat = "http://127.0.0.1:1/v1/chat/completions"

        [aliases.smart]
        [[aliases.smart.targets]]
        provider = "acme"
        model = "gpt-4o"
    "#};

    #[tokio::test]
    async fn health_and_ready_are_unauthenticated() {
        let (address, shutdown, _dir) = spawn_prism(MINIMAL).await;

        let health: serde_json::Value = reqwest::get(format!("http://{address}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");

        let ready = reqwest::get(format!("http://{address}/ready")).await.unwrap();
        assert_eq!(ready.status(), 200);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn models_require_auth_and_list_aliases() {
        let (address, shutdown, _dir) = spawn_prism(MINIMAL).await;
        let client = reqwest::Client::new();

        let unauthenticated = client
            .get(format!("http://{address}/v1/models"))
            .send()
            .await
            .unwrap();
        assert_eq!(unauthenticated.status(), 401);

        let models: serde_json::Value = client
            .get(format!("http://{address}/v1/models"))
            .bearer_auth("sk-alice")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(models["object"], "list");
        assert_eq!(models["data"][0]["id"], "smart");
        assert_eq!(models["data"][0]["owned_by"], "prism");

        shutdown.cancel();
    }

    #[tokio::test]
    async fn cors_preflight_allows_everything() {
        let (address, shutdown, _dir) = spawn_prism(MINIMAL).await;
        let client = reqwest::Client::new();

        let response = client
            .request(reqwest::Method::OPTIONS, format!("http://{address}/v1/chat/completions"))
            .header("origin", "https://app.example")
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "content-type, authorization")
            .send()
            .await
            .unwrap();

        let headers = response.headers();
        assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
        assert!(
            headers
                .get("access-control-allow-methods")
                .unwrap()
                .to_str()
                .unwrap()
                .contains("POST")
        );

        shutdown.cancel();
    }

    #[tokio::test]
    async fn unknown_model_renders_dialect_error_end_to_end() {
        let (address, shutdown, _dir) = spawn_prism(MINIMAL).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("http://{address}/v1/messages"))
            .bearer_auth("sk-alice")
            .json(&serde_json::json!({
                "model": "ghost",
                "max_tokens": 16,
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 404);

        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "invalid_request_error");

        shutdown.cancel();
    }
}
