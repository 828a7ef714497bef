//! Invitation routes
//!
//! Business invitations (admin-issued, lead to a business subscription)
//! and customer invitations (business-issued, lead to a membership).
//! The public membership checkout also lives here; it is the only flow
//! that takes no token.

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
pub struct GenerateBusinessInvitationRequest {
    pub email: String,
    pub business_name: Option<String>,
    pub suggested_tier_id: Option<Uuid>,
}

/// POST /api/invitations/business
pub async fn generate_business_invitation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<GenerateBusinessInvitationRequest>,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers)?;

    let token = state
        .billing
        .issuer
        .issue_business_invitation(
            &request.email,
            request.business_name.as_deref(),
            request.suggested_tier_id,
        )
        .await?;

    tracing::info!(email = %request.email, "business invitation issued");
    Ok(success(token_json(&token)?))
}

/// GET /api/invitations/business/{token}
pub async fn validate_business_invitation(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<Json<Value>> {
    let record = state.billing.tokens.get_by_token(&token).await?;
    if record.kind != TokenKind::BusinessInvitation {
        return Err(ApiError::not_found("invitation"));
    }

    let tiers = state.billing.tiers.list_active(None).await?;
    Ok(success(json!({
        "invitation": token_json(&record)?,
        "tiers": tiers.iter().map(tier_json).collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct TokenCheckoutRequest {
    pub token: String,
    pub tier_id: Option<Uuid>,
}

/// POST /api/invitations/business/checkout
pub async fn business_invitation_checkout(
    State(state): State<AppState>,
    Json(request): Json<TokenCheckoutRequest>,
) -> ApiResult<Json<Value>> {
    let session = state
        .billing
        .checkout
        .business_invitation(&request.token, request.tier_id)
        .await?;

    Ok(success(json!({
        "session_id": session.session_id,
        "checkout_url": session.checkout_url,
    })))
}

#[derive(Debug, Deserialize)]
pub struct GenerateCustomerInvitationRequest {
    pub business_id: Uuid,
    pub email: String,
    pub tier_id: Uuid,
}

/// POST /api/invitations/customer
pub async fn generate_customer_invitation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<GenerateCustomerInvitationRequest>,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers)?;

    let token = state
        .billing
        .issuer
        .issue_customer_invitation(request.business_id, &request.email, request.tier_id)
        .await?;

    tracing::info!(
        business_id = %request.business_id,
        email = %request.email,
        "customer invitation issued"
    );
    Ok(success(token_json(&token)?))
}

/// GET /api/invitations/customer/{token}
///
/// Returns the invitation together with the inviting business and its
/// active membership tiers, everything the join page needs.
pub async fn validate_customer_invitation(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<Json<Value>> {
    let record = state.billing.tokens.get_by_token(&token).await?;
    if record.kind != TokenKind::CustomerInvitation {
        return Err(ApiError::not_found("invitation"));
    }
    let business_id = record
        .business_id
        .ok_or_else(|| ApiError::not_found("business"))?;

    let business: Option<(Uuid, String)> =
        sqlx::query_as("SELECT id, name FROM businesses WHERE id = $1")
            .bind(business_id)
            .fetch_optional(&state.pool)
            .await?;
    let (business_id, business_name) = business.ok_or_else(|| ApiError::not_found("business"))?;

    let tiers = state.billing.tiers.list_active(Some(business_id)).await?;
    Ok(success(json!({
        "invitation": token_json(&record)?,
        "business": {"id": business_id, "name": business_name},
        "tiers": tiers.iter().map(tier_json).collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct MembershipCheckoutRequest {
    pub business_id: Uuid,
    pub tier_id: Uuid,
    pub customer_email: String,
}

/// POST /api/invitations/customer/checkout
///
/// Public join flow, no token required.
pub async fn customer_membership_checkout(
    State(state): State<AppState>,
    Json(request): Json<MembershipCheckoutRequest>,
) -> ApiResult<Json<Value>> {
    let session = state
        .billing
        .checkout
        .customer_membership(request.business_id, request.tier_id, &request.customer_email)
        .await?;

    Ok(success(json!({
        "session_id": session.session_id,
        "checkout_url": session.checkout_url,
    })))
}

/// POST /api/invitations/customer/private-checkout
pub async fn private_invitation_checkout(
    State(state): State<AppState>,
    Json(request): Json<TokenCheckoutRequest>,
) -> ApiResult<Json<Value>> {
    let session = state
        .billing
        .checkout
        .private_invitation(&request.token, request.tier_id)
        .await?;

    Ok(success(json!({
        "session_id": session.session_id,
        "checkout_url": session.checkout_url,
    })))
}
