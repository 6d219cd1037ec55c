use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use consent_engine::ConsentEngineError;

// Error handling
#[derive(Debug)]
pub enum GatewayError {
    Unauthorized(String),
    BadRequest(String),
    NotFound(String),
    Timeout(String),
    Upstream(String),
    Internal(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            GatewayError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            GatewayError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            GatewayError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            GatewayError::Timeout(msg) => (StatusCode::REQUEST_TIMEOUT, msg),
            GatewayError::Upstream(msg) => (StatusCode::BAD_GATEWAY, format!("Bank error: {}", msg)),
            GatewayError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("Internal error: {}", msg))
            }
        };

        (
            status,
            Json(serde_json::json!({
                "error": message,
                "timestamp": Utc::now(),
            })),
        )
            .into_response()
    }
}

impl From<ConsentEngineError> for GatewayError {
    fn from(err: ConsentEngineError) -> Self {
        match err {
            ConsentEngineError::UnknownBank(_) | ConsentEngineError::Validation(_) => {
                GatewayError::BadRequest(err.to_string())
            }
            ConsentEngineError::UserNotFound(_) => GatewayError::NotFound(err.to_string()),
            ConsentEngineError::BankRejected { .. }
            | ConsentEngineError::Credential(_)
            | ConsentEngineError::Http(_) => GatewayError::Upstream(err.to_string()),
            ConsentEngineError::Database(_)
            | ConsentEngineError::Cache(_)
            | ConsentEngineError::Serialization(_)
            | ConsentEngineError::Config(_)
            | ConsentEngineError::Internal(_) => GatewayError::Internal(err.to_string()),
        }
    }
}
