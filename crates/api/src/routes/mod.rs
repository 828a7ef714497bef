//! Route definitions and shared response helpers

pub mod invitations;
pub mod onboarding;
pub mod webhook;

use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use time::format_description::well_known::Rfc3339;
use vinoclub_billing::{Tier, Token};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/stripe", post(webhook::stripe_webhook))
        .route("/api/onboarding/tokens", post(onboarding::generate_token))
        .route(
            "/api/onboarding/tokens/{token}",
            get(onboarding::validate_token),
        )
        .route("/api/onboarding/checkout", post(onboarding::create_checkout))
        .route(
            "/api/invitations/business",
            post(invitations::generate_business_invitation),
        )
        .route(
            "/api/invitations/business/{token}",
            get(invitations::validate_business_invitation),
        )
        .route(
            "/api/invitations/business/checkout",
            post(invitations::business_invitation_checkout),
        )
        .route(
            "/api/invitations/customer",
            post(invitations::generate_customer_invitation),
        )
        .route(
            "/api/invitations/customer/{token}",
            get(invitations::validate_customer_invitation),
        )
        .route(
            "/api/invitations/customer/checkout",
            post(invitations::customer_membership_checkout),
        )
        .route(
            "/api/invitations/customer/private-checkout",
            post(invitations::private_invitation_checkout),
        )
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn not_found() -> ApiError {
    ApiError::not_found("route")
}

async fn method_not_allowed() -> ApiError {
    ApiError {
        status: axum::http::StatusCode::METHOD_NOT_ALLOWED,
        code: "METHOD_NOT_ALLOWED",
        message: "method not allowed".to_string(),
    }
}

/// Wrap response data in the success envelope.
pub(crate) fn success(data: Value) -> Json<Value> {
    Json(json!({"success": true, "data": data}))
}

/// Constant-time check of the `x-admin-key` header against the
/// configured admin key. A missing configuration disables the endpoint
/// rather than opening it.
pub(crate) fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.config.admin_api_key.as_deref() else {
        return Err(ApiError::unauthorized());
    };
    let provided = headers
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(ApiError::unauthorized())
    }
}

pub(crate) fn token_json(token: &Token) -> ApiResult<Value> {
    let expires_at = token
        .expires_at
        .format(&Rfc3339)
        .map_err(|_| ApiError::internal())?;

    Ok(json!({
        "token": token.token,
        "kind": token.kind.as_str(),
        "status": token.status.as_str(),
        "email": token.email,
        "business_name": token.business_name,
        "business_id": token.business_id,
        "suggested_tier_id": token.suggested_tier_id,
        "expires_at": expires_at,
    }))
}

pub(crate) fn tier_json(tier: &Tier) -> Value {
    json!({
        "id": tier.id,
        "business_id": tier.business_id,
        "name": tier.name,
        "description": tier.description,
        "price_cents": tier.price_cents,
        "billing_interval": tier.billing_interval,
        "is_custom": tier.is_custom,
        "can_checkout": tier.checkout_price_id().is_ok(),
    })
}
