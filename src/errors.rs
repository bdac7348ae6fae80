// src/errors.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("M-Pesa authentication failed: {0}")]
    ProviderAuthError(String),

    #[error("M-Pesa request failed: {0}")]
    ProviderRequestError(String),

    #[error("Invalid callback payload: {0}")]
    CallbackParseError(String),

    #[error("Duplicate transaction: {0}")]
    DuplicateTransaction(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Service error: {0}")]
    ServiceError(String),

    #[error("MongoDB error: {0}")]
    MongoDB(#[from] mongodb::error::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::ConfigurationError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Payment service is not configured".to_string(),
            ),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::ProviderAuthError(_) => (
                StatusCode::BAD_GATEWAY,
                "Could not authenticate with M-Pesa, please retry".to_string(),
            ),
            AppError::ProviderRequestError(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::CallbackParseError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::DuplicateTransaction(_) => (
                StatusCode::CONFLICT,
                "A payment for this order is already in progress".to_string(),
            ),
            AppError::TransactionNotFound(_) => {
                (StatusCode::NOT_FOUND, "Transaction not found".to_string())
            }
            AppError::ServiceError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Service error".to_string(),
            ),
            AppError::MongoDB(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            ),
        };

        let body = Json(json!({
            "success": false,
            "error": error_message,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        (status, body).into_response()
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::CallbackParseError(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::ValidationError(err.to_string())
    }
}

// Helper conversion functions
impl AppError {
    pub fn invalid_data(msg: impl Into<String>) -> Self {
        AppError::ValidationError(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        AppError::ConfigurationError(msg.into())
    }

    pub fn provider_auth(msg: impl Into<String>) -> Self {
        AppError::ProviderAuthError(msg.into())
    }

    pub fn provider_request(msg: impl Into<String>) -> Self {
        AppError::ProviderRequestError(msg.into())
    }

    pub fn callback_parse(msg: impl Into<String>) -> Self {
        AppError::CallbackParseError(msg.into())
    }

    pub fn service(msg: impl Into<String>) -> Self {
        AppError::ServiceError(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_error_kind() {
        let cases = [
            (AppError::invalid_data("bad phone"), StatusCode::BAD_REQUEST),
            (AppError::configuration("MPESA_PASSKEY must be set"), StatusCode::INTERNAL_SERVER_ERROR),
            (AppError::provider_auth("401"), StatusCode::BAD_GATEWAY),
            (AppError::provider_request("rejected"), StatusCode::BAD_GATEWAY),
            (AppError::callback_parse("missing Body"), StatusCode::INTERNAL_SERVER_ERROR),
            (AppError::TransactionNotFound("ws_CO_1".into()), StatusCode::NOT_FOUND),
            (AppError::service("task panicked"), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[tokio::test]
    async fn body_carries_success_false_and_message() {
        let response = AppError::provider_request("Invalid PhoneNumber").into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Invalid PhoneNumber");
    }
}
