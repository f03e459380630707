use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::dialect::DialectTag;

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Gateway errors with appropriate HTTP status codes.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed body or missing required field.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The requested model matches no configured alias.
    #[error("Model '{0}' is not configured")]
    ModelNotFound(String),

    /// The alias exists but serves a surface the pipeline does not dispatch.
    #[error("Alias '{alias}' is configured for '{kind}' requests and cannot serve this endpoint")]
    UnsupportedAliasKind {
        /// The resolved alias.
        alias: String,
        /// Its configured kind.
        kind: String,
    },

    /// Missing, malformed or unknown gateway credentials.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Every target was disabled or cooling down.
    #[error("No healthy target available for model '{0}'")]
    NoHealthyTarget(String),

    /// Upstream returned a non-success status; surfaced with that status.
    #[error("Provider error ({status}): {message}")]
    Upstream {
        status: u16,
        message: String,
    },

    /// The connection to the provider failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Request or response transformation failed.
    #[error("Transformation failed: {0}")]
    Transform(String),

    /// Internal failure. `Some` messages came from a provider and may be
    /// shown; `None` must not leak details.
    #[error("Internal server error")]
    Internal(Option<String>),
}

impl GatewayError {
    /// HTTP status returned to the client.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::UnsupportedAliasKind { .. } => StatusCode::BAD_REQUEST,
            Self::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            Self::ModelNotFound(_) => StatusCode::NOT_FOUND,
            Self::NoHealthyTarget(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Connection(_) | Self::Transform(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable error type string used in every dialect's envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) | Self::ModelNotFound(_) | Self::UnsupportedAliasKind { .. } => {
                "invalid_request_error"
            }
            Self::AuthenticationFailed(_) => "authentication_error",
            Self::NoHealthyTarget(_) | Self::Connection(_) | Self::Transform(_) | Self::Internal(_) => "api_error",
            Self::Upstream { status, .. } => match status {
                400..=499 => "invalid_request_error",
                _ => "api_error",
            },
        }
    }

    /// Machine-readable code, when one exists for the variant.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::ModelNotFound(_) => Some("model_not_found"),
            Self::NoHealthyTarget(_) => Some("no_healthy_target"),
            Self::UnsupportedAliasKind { .. } => Some("unsupported_alias_kind"),
            _ => None,
        }
    }

    /// Message safe to expose to API consumers.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(Some(provider_msg)) => provider_msg.clone(),
            Self::Internal(None) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Chat dialect envelope: `{"error": {...}}`.
#[derive(Debug, Serialize)]
struct ChatErrorBody {
    error: ChatErrorDetails,
}

#[derive(Debug, Serialize)]
struct ChatErrorDetails {
    message: String,
    r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

/// Messages dialect envelope: `{"type":"error","error":{...}}`.
#[derive(Debug, Serialize)]
struct MessagesErrorBody {
    r#type: &'static str,
    error: MessagesErrorDetails,
}

#[derive(Debug, Serialize)]
struct MessagesErrorDetails {
    r#type: String,
    message: String,
}

/// Gemini dialect envelope: `{"error":{"code":...,"message":...,"status":...}}`.
#[derive(Debug, Serialize)]
struct GeminiErrorBody {
    error: GeminiErrorDetails,
}

#[derive(Debug, Serialize)]
struct GeminiErrorDetails {
    code: u16,
    message: String,
    status: String,
}

/// A gateway error bound to the dialect it must be rendered in.
#[derive(Debug)]
pub struct DialectError {
    pub error: GatewayError,
    pub dialect: DialectTag,
}

impl DialectError {
    pub fn new(error: GatewayError, dialect: DialectTag) -> Self {
        Self { error, dialect }
    }
}

pub type DialectResult<T> = std::result::Result<T, DialectError>;

impl IntoResponse for DialectError {
    fn into_response(self) -> Response {
        let status = self.error.status_code();
        let message = self.error.client_message();

        match self.dialect {
            DialectTag::Chat => {
                let body = ChatErrorBody {
                    error: ChatErrorDetails {
                        message,
                        r#type: self.error.error_type().to_string(),
                        code: self.error.code().map(str::to_string),
                    },
                };

                (status, Json(body)).into_response()
            }
            DialectTag::Messages => {
                let body = MessagesErrorBody {
                    r#type: "error",
                    error: MessagesErrorDetails {
                        r#type: match self.error.error_type() {
                            "invalid_request_error" => "invalid_request_error".to_string(),
                            "authentication_error" => "authentication_error".to_string(),
                            _ => "api_error".to_string(),
                        },
                        message,
                    },
                };

                (status, Json(body)).into_response()
            }
            DialectTag::Gemini => {
                let body = GeminiErrorBody {
                    error: GeminiErrorDetails {
                        code: status.as_u16(),
                        message,
                        status: status
                            .canonical_reason()
                            .unwrap_or("UNKNOWN")
                            .to_ascii_uppercase()
                            .replace(' ', "_"),
                    },
                };

                (status, Json(body)).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            GatewayError::InvalidRequest("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::ModelNotFound("smart".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::NoHealthyTarget("smart".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Connection("refused".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn upstream_status_passes_through() {
        let error = GatewayError::Upstream {
            status: 429,
            message: "slow down".into(),
        };

        assert_eq!(error.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(error.error_type(), "invalid_request_error");
    }

    #[test]
    fn internal_error_hides_details_without_provider_message() {
        let error = GatewayError::Internal(None);
        assert_eq!(error.client_message(), "Internal server error");

        let error = GatewayError::Internal(Some("upstream exploded".into()));
        assert_eq!(error.client_message(), "upstream exploded");
    }

    #[test]
    fn model_not_found_carries_code() {
        assert_eq!(GatewayError::ModelNotFound("x".into()).code(), Some("model_not_found"));
        assert_eq!(GatewayError::InvalidRequest("x".into()).code(), None);
    }

    #[test]
    fn envelopes_match_each_dialect() {
        let error = GatewayError::ModelNotFound("smart".into());

        let chat = ChatErrorBody {
            error: ChatErrorDetails {
                message: error.client_message(),
                r#type: error.error_type().to_string(),
                code: error.code().map(str::to_string),
            },
        };

        insta::assert_json_snapshot!(chat, @r#"
        {
          "error": {
            "message": "Model 'smart' is not configured",
            "type": "invalid_request_error",
            "code": "model_not_found"
          }
        }
        "#);

        let messages = MessagesErrorBody {
            r#type: "error",
            error: MessagesErrorDetails {
                r#type: error.error_type().to_string(),
                message: error.client_message(),
            },
        };

        insta::assert_json_snapshot!(messages, @r#"
        {
          "type": "error",
          "error": {
            "type": "invalid_request_error",
            "message": "Model 'smart' is not configured"
          }
        }
        "#);

        let gemini = GeminiErrorBody {
            error: GeminiErrorDetails {
                code: 404,
                message: error.client_message(),
                status: "NOT_FOUND".to_string(),
            },
        };

        insta::assert_json_snapshot!(gemini, @r#"
        {
          "error": {
            "code": 404,
            "message": "Model 'smart' is not configured",
            "status": "NOT_FOUND"
          }
        }
        "#);
    }
}
