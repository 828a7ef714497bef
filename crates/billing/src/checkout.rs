//! Checkout session builder
//!
//! Four flows share one skeleton: validate the entry credential, resolve
//! an eligible tier, make exactly one provider call, then advance the
//! token with a compare-and-swap that stores the session id. A provider
//! failure leaves the token untouched so the caller can retry.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{CheckoutRequest, CheckoutSessionRef, PaymentGateway};
use crate::tiers::{resolve_checkout_tier, Tier, TierStore};
use crate::tokens::{Token, TokenKind, TokenStatus, TokenStore};

pub struct CheckoutService {
    tokens: Arc<dyn TokenStore>,
    tiers: Arc<dyn TierStore>,
    gateway: Arc<dyn PaymentGateway>,
    app_url: String,
}

impl CheckoutService {
    pub fn new(
        tokens: Arc<dyn TokenStore>,
        tiers: Arc<dyn TierStore>,
        gateway: Arc<dyn PaymentGateway>,
        app_url: String,
    ) -> Self {
        Self {
            tokens,
            tiers,
            gateway,
            app_url,
        }
    }

    /// Open a checkout for a business signing up through the public
    /// onboarding flow.
    pub async fn business_onboarding(
        &self,
        token: &str,
        selected_tier_id: Option<Uuid>,
    ) -> BillingResult<CheckoutSessionRef> {
        let record = self.checkout_ready_token(token, TokenKind::BusinessOnboarding).await?;
        let tier = self.platform_tier(&record, selected_tier_id).await?;
        self.open_business_checkout(record, tier).await
    }

    /// Open a checkout for an admin-invited business.
    pub async fn business_invitation(
        &self,
        token: &str,
        selected_tier_id: Option<Uuid>,
    ) -> BillingResult<CheckoutSessionRef> {
        let record = self.checkout_ready_token(token, TokenKind::BusinessInvitation).await?;
        let tier = self.platform_tier(&record, selected_tier_id).await?;
        self.open_business_checkout(record, tier).await
    }

    /// Open a membership checkout for the public join flow. No token;
    /// correlation travels on business and tier ids alone.
    pub async fn customer_membership(
        &self,
        business_id: Uuid,
        tier_id: Uuid,
        customer_email: &str,
    ) -> BillingResult<CheckoutSessionRef> {
        validate_email(customer_email)?;

        let tier = self.tiers.get(tier_id).await?;
        if tier.business_id != Some(business_id) {
            return Err(BillingError::InvalidTier("tier does not belong to this business"));
        }
        let price_id = tier.checkout_price_id()?.to_string();

        let mut metadata = HashMap::new();
        metadata.insert("business_id".to_string(), business_id.to_string());
        metadata.insert("tier_id".to_string(), tier.id.to_string());

        let session = self
            .gateway
            .create_checkout_session(CheckoutRequest {
                price_id,
                customer_email: Some(customer_email.to_string()),
                success_url: format!(
                    "{}/membership/success?session_id={{CHECKOUT_SESSION_ID}}",
                    self.app_url
                ),
                cancel_url: format!("{}/business/{business_id}/join", self.app_url),
                metadata,
                allow_promotion_codes: false,
            })
            .await?;

        tracing::info!(
            business_id = %business_id,
            tier_id = %tier_id,
            session_id = %session.session_id,
            "membership checkout session created"
        );
        Ok(session)
    }

    /// Open a checkout for an invited customer. The invitation carries
    /// the email and the suggested tier; promotion codes are allowed.
    pub async fn private_invitation(
        &self,
        token: &str,
        selected_tier_id: Option<Uuid>,
    ) -> BillingResult<CheckoutSessionRef> {
        let record = self.checkout_ready_token(token, TokenKind::CustomerInvitation).await?;

        let business_id = record
            .business_id
            .ok_or_else(|| BillingError::Internal("customer invitation without business".to_string()))?;
        let email = record
            .email
            .clone()
            .ok_or_else(|| BillingError::Internal("customer invitation without email".to_string()))?;

        let tier =
            resolve_checkout_tier(self.tiers.as_ref(), selected_tier_id, record.suggested_tier_id)
                .await?;
        if tier.business_id != Some(business_id) {
            return Err(BillingError::InvalidTier("tier does not belong to this business"));
        }
        let price_id = tier.checkout_price_id()?.to_string();

        let mut metadata = HashMap::new();
        metadata.insert("invitation_token".to_string(), record.token.clone());
        metadata.insert("business_id".to_string(), business_id.to_string());
        metadata.insert("tier_id".to_string(), tier.id.to_string());
        metadata.insert("token_kind".to_string(), record.kind.as_str().to_string());

        let session = self
            .gateway
            .create_checkout_session(CheckoutRequest {
                price_id,
                customer_email: Some(email),
                success_url: format!(
                    "{}/membership/success?session_id={{CHECKOUT_SESSION_ID}}",
                    self.app_url
                ),
                cancel_url: format!("{}/invitation/{}", self.app_url, record.token),
                metadata,
                allow_promotion_codes: true,
            })
            .await?;

        self.advance_to_checkout_created(&record, &session).await?;
        Ok(session)
    }

    /// Load and gate a token for checkout: right kind, not expired, in a
    /// state that permits (re)opening a session. Runs before the provider
    /// call so a dead token costs no outbound request.
    async fn checkout_ready_token(&self, token: &str, kind: TokenKind) -> BillingResult<Token> {
        let record = self.tokens.get_by_token(token).await?;

        if record.kind != kind {
            return Err(BillingError::NotFound("token"));
        }
        match record.status {
            TokenStatus::Pending | TokenStatus::CheckoutCreated => Ok(record),
            TokenStatus::Expired => Err(BillingError::Expired),
            other => Err(BillingError::Conflict(format!(
                "token is {}, checkout is no longer available",
                other.as_str()
            ))),
        }
    }

    /// Business flows price against platform tiers only.
    async fn platform_tier(
        &self,
        record: &Token,
        selected_tier_id: Option<Uuid>,
    ) -> BillingResult<Tier> {
        let tier =
            resolve_checkout_tier(self.tiers.as_ref(), selected_tier_id, record.suggested_tier_id)
                .await?;
        if tier.business_id.is_some() {
            return Err(BillingError::InvalidTier("not a business pricing tier"));
        }
        Ok(tier)
    }

    async fn open_business_checkout(
        &self,
        record: Token,
        tier: Tier,
    ) -> BillingResult<CheckoutSessionRef> {
        let price_id = tier.checkout_price_id()?.to_string();

        let mut metadata = HashMap::new();
        metadata.insert("onboarding_token".to_string(), record.token.clone());
        metadata.insert("tier_id".to_string(), tier.id.to_string());
        metadata.insert("token_kind".to_string(), record.kind.as_str().to_string());

        let session = self
            .gateway
            .create_checkout_session(CheckoutRequest {
                price_id,
                customer_email: record.email.clone(),
                success_url: format!(
                    "{}/onboarding/success?session_id={{CHECKOUT_SESSION_ID}}",
                    self.app_url
                ),
                cancel_url: format!("{}/onboarding?token={}", self.app_url, record.token),
                metadata,
                allow_promotion_codes: false,
            })
            .await?;

        self.advance_to_checkout_created(&record, &session).await?;
        Ok(session)
    }

    /// CAS the token forward and attach the session id in the same write.
    /// `checkout_created` is an accepted starting state so an abandoned
    /// session can be replaced.
    async fn advance_to_checkout_created(
        &self,
        record: &Token,
        session: &CheckoutSessionRef,
    ) -> BillingResult<()> {
        self.tokens
            .transition(
                &record.token,
                &[TokenStatus::Pending, TokenStatus::CheckoutCreated],
                TokenStatus::CheckoutCreated,
                Some(&session.session_id),
            )
            .await?;

        tracing::info!(
            token_kind = record.kind.as_str(),
            session_id = %session.session_id,
            "checkout session created"
        );
        Ok(())
    }
}

pub(crate) fn validate_email(email: &str) -> BillingResult<()> {
    let trimmed = email.trim();
    if trimmed.is_empty() || !trimmed.contains('@') || trimmed.len() > 320 {
        return Err(BillingError::Validation("invalid email address".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_validation_accepts_plausible_addresses() {
        assert!(validate_email("owner@vineyard.test").is_ok());
        assert!(validate_email(" padded@vineyard.test ").is_ok());
    }

    #[test]
    fn email_validation_rejects_garbage() {
        assert!(validate_email("").is_err());
        assert!(validate_email("   ").is_err());
        assert!(validate_email("no-at-sign").is_err());
    }
}
