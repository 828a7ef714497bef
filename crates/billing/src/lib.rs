#![allow(clippy::too_many_arguments)] // Some checkout operations take many correlation fields
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Vinoclub Billing Core
//!
//! Onboarding tokens, checkout sessions, and payment reconciliation for
//! the wine-club platform.
//!
//! ## Components
//!
//! - **Tokens**: bearer credentials driving business onboarding and
//!   customer invitations, with a compare-and-swap status machine
//! - **Tiers**: platform pricing tiers and per-business membership tiers,
//!   checkout eligibility rules
//! - **Checkout**: subscription-mode checkout session creation with
//!   correlation metadata
//! - **Webhooks**: signature verification and idempotent event processing
//! - **Projector**: subscription and membership read models, upserted by
//!   provider subscription id
//!
//! Persistence and the payment provider sit behind traits (`TokenStore`,
//! `TierStore`, `Projector`, `IdentityResolver`, `PaymentGateway`) so the
//! whole flow runs against in-memory fakes in tests.

pub mod checkout;
pub mod client;
pub mod error;
pub mod events;
pub mod gateway;
pub mod identity;
pub mod projector;
pub mod tiers;
pub mod tokens;
pub mod webhooks;

#[cfg(test)]
pub mod test_support;


// Checkout
pub use checkout::CheckoutService;

// Client
pub use client::{StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{Correlation, Event, WebhookEvent};

// Gateway
pub use gateway::{
    CheckoutRequest, CheckoutSessionRef, PaymentGateway, StripeGateway, SubscriptionSnapshot,
};

// Identity
pub use identity::{IdentityResolver, PgIdentityResolver};

// Projector
pub use projector::{
    MembershipUpsert, OwnerType, PgProjector, Projector, SubscriptionUpsert,
};

// Tiers
pub use tiers::{PgTierStore, Tier, TierStore};

// Tokens
pub use tokens::{
    PgTokenStore, Token, TokenIssuer, TokenKind, TokenPayload, TokenStatus, TokenStore,
};

// Webhooks
pub use webhooks::WebhookProcessor;

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service wiring the seams to their Postgres and Stripe
/// implementations.
pub struct BillingService {
    pub tokens: Arc<dyn TokenStore>,
    pub tiers: Arc<dyn TierStore>,
    pub issuer: TokenIssuer,
    pub checkout: CheckoutService,
    pub webhooks: WebhookProcessor,
}

impl BillingService {
    /// Create a billing service from environment variables.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?, pool))
    }

    /// Create a billing service with explicit config.
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let stripe = StripeClient::new(config);
        let app_url = stripe.config().app_url.clone();
        let webhook_secret = stripe.config().webhook_secret.clone();

        let tokens: Arc<dyn TokenStore> = Arc::new(PgTokenStore::new(pool.clone()));
        let tiers: Arc<dyn TierStore> = Arc::new(PgTierStore::new(pool.clone()));
        let projector: Arc<dyn Projector> = Arc::new(PgProjector::new(pool.clone()));
        let identity: Arc<dyn IdentityResolver> = Arc::new(PgIdentityResolver::new(pool));
        let gateway: Arc<dyn PaymentGateway> = Arc::new(StripeGateway::new(stripe));

        Self {
            issuer: TokenIssuer::new(tokens.clone()),
            checkout: CheckoutService::new(
                tokens.clone(),
                tiers.clone(),
                gateway.clone(),
                app_url,
            ),
            webhooks: WebhookProcessor::new(
                tokens.clone(),
                projector,
                identity,
                gateway,
                webhook_secret,
            ),
            tokens,
            tiers,
        }
    }
}
