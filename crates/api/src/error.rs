//! HTTP error mapping
//!
//! Every error leaves the API as `{"error": {"message", "code"}}` with a
//! stable machine-readable code. Internal detail (database errors,
//! provider responses) is logged, never echoed to the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use vinoclub_billing::BillingError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION_ERROR",
            message: message.into(),
        }
    }

    pub fn not_found(what: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: format!("{what} not found"),
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "UNAUTHORIZED",
            message: "unauthorized".to_string(),
        }
    }

    pub fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR",
            message: "internal server error".to_string(),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Validation(message) => Self {
                status: StatusCode::BAD_REQUEST,
                code: "VALIDATION_ERROR",
                message,
            },
            BillingError::InvalidTier(message) => Self {
                status: StatusCode::BAD_REQUEST,
                code: "VALIDATION_ERROR",
                message: message.to_string(),
            },
            BillingError::NotFound(what) => Self::not_found(what),
            BillingError::Conflict(message) => Self {
                status: StatusCode::CONFLICT,
                code: "CONFLICT",
                message,
            },
            BillingError::Expired => Self {
                status: StatusCode::GONE,
                code: "EXPIRED",
                message: "token has expired".to_string(),
            },
            BillingError::Provider(message) => {
                tracing::error!(error = %message, "payment provider error");
                Self {
                    status: StatusCode::BAD_GATEWAY,
                    code: "STRIPE_ERROR",
                    message: "payment provider error".to_string(),
                }
            }
            BillingError::SignatureInvalid => Self {
                status: StatusCode::BAD_REQUEST,
                code: "INVALID_SIGNATURE",
                message: "invalid webhook signature".to_string(),
            },
            BillingError::PayloadInvalid(message) => Self {
                status: StatusCode::BAD_REQUEST,
                code: "VALIDATION_ERROR",
                message,
            },
            BillingError::Database(e) => {
                tracing::error!(error = %e, "database error");
                Self::internal()
            }
            BillingError::Config(e) => {
                tracing::error!(error = %e, "configuration error");
                Self::internal()
            }
            BillingError::Internal(e) => {
                tracing::error!(error = %e, "internal billing error");
                Self::internal()
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!(error = %err, "database error");
        Self::internal()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.message,
                "code": self.code,
            }
        });
        (self.status, Json(body)).into_response()
    }
}
