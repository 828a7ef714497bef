//! Business onboarding routes
//!
//! Token generation is admin-gated; validation and checkout are public,
//! keyed by the opaque token credential.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;
use vinoclub_billing::TokenKind;

use crate::error::{ApiError, ApiResult};
use crate::routes::{require_admin, success, tier_json, token_json};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct GenerateTokenRequest {
    pub email: String,
    pub business_name: Option<String>,
    pub suggested_tier_id: Option<Uuid>,
}

/// POST /api/onboarding/tokens
pub async fn generate_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<GenerateTokenRequest>,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers)?;

    let token = state
        .billing
        .issuer
        .issue_onboarding(
            &request.email,
            request.business_name.as_deref(),
            request.suggested_tier_id,
        )
        .await?;

    tracing::info!(email = %request.email, "onboarding token issued");
    Ok(success(token_json(&token)?))
}

/// GET /api/onboarding/tokens/{token}
///
/// Validates the credential and returns it together with the platform
/// tiers the holder can pick from.
pub async fn validate_token(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<Json<Value>> {
    let record = state.billing.tokens.get_by_token(&token).await?;
    if record.kind != TokenKind::BusinessOnboarding {
        return Err(ApiError::not_found("token"));
    }

    let tiers = state.billing.tiers.list_active(None).await?;
    Ok(success(json!({
        "token": token_json(&record)?,
        "tiers": tiers.iter().map(tier_json).collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub token: String,
    pub tier_id: Option<Uuid>,
}

/// POST /api/onboarding/checkout
pub async fn create_checkout(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<Json<Value>> {
    let session = state
        .billing
        .checkout
        .business_onboarding(&request.token, request.tier_id)
        .await?;

    Ok(success(json!({
        "session_id": session.session_id,
        "checkout_url": session.checkout_url,
    })))
}
