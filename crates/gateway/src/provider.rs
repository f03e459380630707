//! Upstream provider HTTP client.
//!
//! One generic client serves every provider: the dialect decided the body
//! shape upstream of here, this module only adds credentials and custom
//! headers, merges the configured extra body, sends, and classifies what
//! came back as a bounded payload or a byte stream.

use std::time::Duration;

use bytes::Bytes;
use config::{ProviderAuthScheme, ProviderConfig};
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use secrecy::ExposeSecret;

use crate::{
    dialect::ByteStream,
    error::{GatewayError, GatewayResult},
    http_client::http_client,
};

/// Response body: either fully buffered or streaming.
pub enum RawBody {
    Buffered(Bytes),
    Stream(ByteStream),
}

/// What the upstream returned, before any dialect interpretation.
pub struct RawResponse {
    pub status: u16,
    pub headers: reqwest::header::HeaderMap,
    pub body: RawBody,
    /// Parsed `Retry-After`, seconds or HTTP-date.
    pub retry_after: Option<Duration>,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The buffered body, for non-stream handling. Empty for streams.
    pub fn into_buffered(self) -> Bytes {
        match self.body {
            RawBody::Buffered(bytes) => bytes,
            RawBody::Stream(_) => Bytes::new(),
        }
    }
}

/// Thin wrapper over the shared reqwest client.
#[derive(Clone)]
pub struct ProviderClient {
    client: reqwest::Client,
}

impl Default for ProviderClient {
    fn default() -> Self {
        Self { client: http_client() }
    }
}

impl ProviderClient {
    /// Send a dialect-formatted body to a provider endpoint.
    ///
    /// Network failures surface as errors, never as responses; HTTP error
    /// statuses come back as responses for the dispatcher to classify.
    pub async fn request(
        &self,
        provider: &ProviderConfig,
        url: &str,
        body: Vec<u8>,
        request_id: &str,
    ) -> GatewayResult<RawResponse> {
        let mut builder = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header("x-request-id", request_id);

        if let Some(auth) = &provider.auth {
            builder = match auth.scheme {
                ProviderAuthScheme::Bearer => {
                    builder.header(AUTHORIZATION, format!("Bearer {}", auth.secret.expose_secret()))
                }
                ProviderAuthScheme::XApiKey => builder.header("x-api-key", auth.secret.expose_secret()),
            };
        }

        for (name, value) in &provider.headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .body(body)
            .send()
            .await
            .map_err(|e| GatewayError::Connection(format!("Failed to send request to provider: {}", error_chain(&e))))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let retry_after = parse_retry_after(&headers);

        let is_event_stream = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));

        let body = if is_event_stream {
            let stream = response.bytes_stream().map(|chunk| {
                chunk.map_err(|e| GatewayError::Connection(format!("Upstream stream failed: {}", error_chain(&e))))
            });

            RawBody::Stream(Box::pin(stream))
        } else {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| GatewayError::Connection(format!("Failed to read provider response: {e}")))?;

            RawBody::Buffered(bytes)
        };

        Ok(RawResponse {
            status,
            headers,
            body,
            retry_after,
        })
    }
}

/// Render an error with its full source chain; reqwest's `Display` alone
/// hides the transport-level cause the cooldown classifier matches on.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();

    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    message
}

/// Parse `Retry-After`, both delta-seconds and HTTP-date forms.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let parsed = jiff::fmt::rfc2822::DateTimeParser::new()
        .parse_timestamp(value)
        .ok()?;

    let until = (parsed - jiff::Timestamp::now())
        .total(jiff::Unit::Second)
        .unwrap_or(0.0);

    (until > 0.0).then(|| Duration::from_secs_f64(until))
}

/// Merge the provider's configured extra body into an outbound JSON body.
/// Provider keys win over transformed keys.
pub fn merge_extra_body(
    body: Vec<u8>,
    extra: Option<&serde_json::Map<String, serde_json::Value>>,
) -> GatewayResult<Vec<u8>> {
    let Some(extra) = extra.filter(|extra| !extra.is_empty()) else {
        return Ok(body);
    };

    let mut value: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::Transform(format!("Outbound body is not valid JSON: {e}")))?;

    let Some(object) = value.as_object_mut() else {
        return Err(GatewayError::Transform("Outbound body is not a JSON object".to_string()));
    };

    for (key, extra_value) in extra {
        object.insert(key.clone(), extra_value.clone());
    }

    serde_json::to_vec(&value).map_err(|e| GatewayError::Transform(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, extract::State, http::HeaderMap, response::IntoResponse, routing::post};
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    #[derive(Clone, Default)]
    struct Captured {
        headers: Arc<Mutex<Option<HeaderMap>>>,
    }

    async fn capture_handler(State(state): State<Captured>, headers: HeaderMap, Json(_): Json<Value>) -> impl IntoResponse {
        *state.headers.lock().unwrap() = Some(headers);
        Json(json!({"ok": true}))
    }

    async fn spawn_server(app: Router) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        address
    }

    fn provider_config(toml: &str) -> ProviderConfig {
        toml::from_str(toml).unwrap()
    }

    #[tokio::test]
    async fn sends_auth_and_custom_headers() {
        let captured = Captured::default();
        let app = Router::new()
            .route("/v1/chat/completions", post(capture_handler))
            .with_state(captured.clone());
        let address = spawn_server(app).await;

        let config = provider_config(indoc::indoc! {r#"
            dialects = ["chat"]

            [endpoints]
            chat = "unused"

            [auth]
            scheme = "x-api-key"
            secret = "sk-upstream"

            [headers]
            x-title = "prism"
        "#});

        let client = ProviderClient::default();
        let response = client
            .request(
                &config,
                &format!("http://{address}/v1/chat/completions"),
                b"{}".to_vec(),
                "req_1",
            )
            .await
            .unwrap();

        assert!(response.is_success());

        let headers = captured.headers.lock().unwrap().clone().unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-upstream");
        assert_eq!(headers.get("x-title").unwrap(), "prism");
        assert_eq!(headers.get("x-request-id").unwrap(), "req_1");
    }

    #[tokio::test]
    async fn bearer_scheme_sets_authorization() {
        let captured = Captured::default();
        let app = Router::new()
            .route("/v1/chat/completions", post(capture_handler))
            .with_state(captured.clone());
        let address = spawn_server(app).await;

        let config = provider_config(indoc::indoc! {r#"
            dialects = ["chat"]

            [endpoints]
            chat = "unused"

            [auth]
            secret = "sk-upstream"
        "#});

        ProviderClient::default()
            .request(
                &config,
                &format!("http://{address}/v1/chat/completions"),
                b"{}".to_vec(),
                "req_1",
            )
            .await
            .unwrap();

        let headers = captured.headers.lock().unwrap().clone().unwrap();
        assert_eq!(headers.get("authorization").unwrap(), "Bearer sk-upstream");
    }

    #[tokio::test]
    async fn retry_after_seconds_parses() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                (
                    axum::http::StatusCode::TOO_MANY_REQUESTS,
                    [(axum::http::header::RETRY_AFTER, "7")],
                    "slow down",
                )
            }),
        );
        let address = spawn_server(app).await;

        let config = provider_config(indoc::indoc! {r#"
            dialects = ["chat"]
            [endpoints]
            chat = "unused"
        "#});

        let response = ProviderClient::default()
            .request(
                &config,
                &format!("http://{address}/v1/chat/completions"),
                b"{}".to_vec(),
                "req_1",
            )
            .await
            .unwrap();

        assert_eq!(response.status, 429);
        assert_eq!(response.retry_after, Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn connection_refused_is_an_error() {
        let config = provider_config(indoc::indoc! {r#"
            dialects = ["chat"]
            [endpoints]
            chat = "unused"
        "#});

        // Nothing listens on this port.
        let result = ProviderClient::default()
            .request(&config, "http://127.0.0.1:1/v1/chat/completions", b"{}".to_vec(), "req_1")
            .await;
        let err = match result {
            Ok(_) => panic!("expected a connection error"),
            Err(e) => e,
        };

        assert!(matches!(err, GatewayError::Connection(_)));
    }

    #[test]
    fn retry_after_http_date_parses() {
        let future = jiff::Timestamp::now() + Duration::from_secs(120);
        let formatted = jiff::fmt::rfc2822::to_string(&future.to_zoned(jiff::tz::TimeZone::UTC)).unwrap();

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(RETRY_AFTER, formatted.parse().unwrap());

        let parsed = parse_retry_after(&headers).unwrap();
        assert!((Duration::from_secs(110)..=Duration::from_secs(121)).contains(&parsed));
    }

    #[test]
    fn extra_body_merges_with_provider_keys_winning() {
        let extra: serde_json::Map<String, Value> =
            serde_json::from_str(r#"{"transforms": ["middle-out"], "temperature": 0.1}"#).unwrap();

        let merged = merge_extra_body(br#"{"model":"m","temperature":0.9}"#.to_vec(), Some(&extra)).unwrap();
        let value: Value = serde_json::from_slice(&merged).unwrap();

        assert_eq!(value["transforms"][0], "middle-out");
        assert_eq!(value["temperature"], 0.1);
        assert_eq!(value["model"], "m");
    }
}
