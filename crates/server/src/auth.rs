//! Gateway API key authentication.
//!
//! Clients present either `Authorization: Bearer <secret>` or
//! `x-goog-api-key: <secret>`; exactly one presented credential must
//! resolve to an enabled key. The resolved key name rides along as a
//! request extension for usage attribution.

use std::{
    fmt::Display,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use axum::body::Body;
use axum::response::IntoResponse;
use config::SharedConfig;
use gateway::{ApiKeyName, DialectError, DialectTag, GatewayError};
use http::{Request, Response};
use tower::Layer;

#[derive(Clone)]
pub struct AuthLayer {
    config: SharedConfig,
}

impl AuthLayer {
    pub fn new(config: SharedConfig) -> Self {
        Self { config }
    }
}

impl<Service> Layer<Service> for AuthLayer
where
    Service: Send + Clone,
{
    type Service = AuthService<Service>;

    fn layer(&self, next: Service) -> Self::Service {
        AuthService {
            next,
            config: self.config.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthService<Service> {
    next: Service,
    config: SharedConfig,
}

impl<Service, ReqBody> tower::Service<Request<ReqBody>> for AuthService<Service>
where
    Service: tower::Service<Request<ReqBody>, Response = Response<Body>> + Send + Clone + 'static,
    Service::Future: Send,
    Service::Error: Display + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response<Body>;
    type Error = Service::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.next.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let mut next = self.next.clone();
        let config = self.config.get();

        Box::pin(async move {
            let dialect = dialect_for_path(req.uri().path());

            let bearer = req
                .headers()
                .get(http::header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::trim);

            let goog = req
                .headers()
                .get("x-goog-api-key")
                .and_then(|value| value.to_str().ok())
                .map(str::trim);

            let mut resolved: Vec<&str> = [bearer, goog]
                .into_iter()
                .flatten()
                .filter_map(|secret| config.auth.resolve(secret))
                .collect();
            resolved.dedup();

            match resolved.as_slice() {
                [name] => {
                    let name = name.to_string();
                    let (mut parts, body) = req.into_parts();
                    parts.extensions.insert(ApiKeyName(name));
                    next.call(Request::from_parts(parts, body)).await
                }
                [] => {
                    let message = if bearer.is_none() && goog.is_none() {
                        "missing API key"
                    } else {
                        "unknown API key"
                    };

                    Ok(unauthorized(dialect, message))
                }
                _ => Ok(unauthorized(dialect, "ambiguous credentials: more than one API key validated")),
            }
        })
    }
}

fn dialect_for_path(path: &str) -> DialectTag {
    if path.starts_with("/v1/messages") {
        DialectTag::Messages
    } else if path.starts_with("/v1beta/") {
        DialectTag::Gemini
    } else {
        DialectTag::Chat
    }
}

fn unauthorized(dialect: DialectTag, message: &str) -> Response<Body> {
    DialectError::new(GatewayError::AuthenticationFailed(message.to_string()), dialect).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, routing::post};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app() -> Router {
        let config: config::Config = toml::from_str(indoc::indoc! {r#"
            [auth.keys.alice]
            secret = "sk-alice"

            [auth.keys.bob]
            secret = "sk-bob"
            enabled = false
        "#})
        .unwrap();

        Router::new()
            .route(
                "/v1/chat/completions",
                post(|axum::extract::Extension(ApiKeyName(name)): axum::extract::Extension<ApiKeyName>| async move {
                    name
                }),
            )
            .layer(AuthLayer::new(SharedConfig::new(config)))
    }

    async fn send(request: Request<Body>) -> (http::StatusCode, String) {
        let response = app().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn bearer_key_resolves_to_name() {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("authorization", "Bearer sk-alice")
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(request).await;
        assert_eq!(status, http::StatusCode::OK);
        assert_eq!(body, "alice");
    }

    #[tokio::test]
    async fn goog_header_also_authenticates() {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("x-goog-api-key", "sk-alice")
            .body(Body::empty())
            .unwrap();

        let (status, _) = send(request).await;
        assert_eq!(status, http::StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_and_unknown_keys_fail() {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(request).await;
        assert_eq!(status, http::StatusCode::UNAUTHORIZED);
        assert!(body.contains("authentication_error"));

        let request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("authorization", "Bearer sk-nobody")
            .body(Body::empty())
            .unwrap();

        let (status, _) = send(request).await;
        assert_eq!(status, http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn disabled_key_fails() {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("authorization", "Bearer sk-bob")
            .body(Body::empty())
            .unwrap();

        let (status, _) = send(request).await;
        assert_eq!(status, http::StatusCode::UNAUTHORIZED);
    }
}
