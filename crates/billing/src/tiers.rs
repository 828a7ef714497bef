//! Tier store and pricing resolver
//!
//! Tiers come in two populations sharing one table: platform tiers
//! (`business_id IS NULL`) priced for business subscriptions, and
//! per-business membership tiers priced for customer memberships.
//! Checkout eligibility is decided here and nowhere else.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct Tier {
    pub id: Uuid,
    /// `None` for platform tiers, `Some` for a business's membership tiers
    pub business_id: Option<Uuid>,
    pub name: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub billing_interval: String,
    pub stripe_price_id: Option<String>,
    pub is_active: bool,
    /// Custom tiers are negotiated offline and never flow through checkout
    pub is_custom: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Tier {
    /// A tier can enter checkout only when it is active, not custom, and
    /// carries a Stripe price. Returns the price id on success.
    pub fn checkout_price_id(&self) -> BillingResult<&str> {
        if !self.is_active {
            return Err(BillingError::InvalidTier("tier is not active"));
        }
        if self.is_custom {
            return Err(BillingError::InvalidTier(
                "custom tiers cannot be purchased through checkout",
            ));
        }
        self.stripe_price_id
            .as_deref()
            .ok_or(BillingError::InvalidTier("tier has no payment price configured"))
    }
}

/// Persistence seam for tiers.
#[async_trait]
pub trait TierStore: Send + Sync {
    async fn get(&self, id: Uuid) -> BillingResult<Tier>;

    /// Active tiers for one population: platform tiers when
    /// `business_id` is `None`, a business's membership tiers otherwise.
    async fn list_active(&self, business_id: Option<Uuid>) -> BillingResult<Vec<Tier>>;
}

/// Resolve the tier a checkout should use.
///
/// An explicitly selected tier always wins over the token's suggestion;
/// with neither present the flow cannot proceed.
pub async fn resolve_checkout_tier(
    store: &dyn TierStore,
    selected: Option<Uuid>,
    suggested: Option<Uuid>,
) -> BillingResult<Tier> {
    let tier_id = selected
        .or(suggested)
        .ok_or_else(|| BillingError::Validation("no tier selected".to_string()))?;
    store.get(tier_id).await
}

/// Postgres-backed tier store.
pub struct PgTierStore {
    pool: PgPool,
}

impl PgTierStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const TIER_COLUMNS: &str = "id, business_id, name, description, price_cents, billing_interval, \
     stripe_price_id, is_active, is_custom, created_at, updated_at";

#[async_trait]
impl TierStore for PgTierStore {
    async fn get(&self, id: Uuid) -> BillingResult<Tier> {
        let tier: Option<Tier> =
            sqlx::query_as(&format!("SELECT {TIER_COLUMNS} FROM tiers WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        tier.ok_or(BillingError::NotFound("tier"))
    }

    async fn list_active(&self, business_id: Option<Uuid>) -> BillingResult<Vec<Tier>> {
        let tiers: Vec<Tier> = sqlx::query_as(&format!(
            r#"
            SELECT {TIER_COLUMNS} FROM tiers
            WHERE business_id IS NOT DISTINCT FROM $1 AND is_active = TRUE
            ORDER BY price_cents ASC
            "#
        ))
        .bind(business_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(tiers)
    }
}
