//! Subscription and membership projections
//!
//! Webhook processing never mutates provider state; it projects provider
//! facts into local rows. Every write here is an upsert keyed on the
//! provider subscription id, so deliveries can arrive twice or out of
//! order without corrupting the projection.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Who a platform subscription belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerType {
    Business,
    Customer,
}

impl OwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerType::Business => "business",
            OwnerType::Customer => "customer",
        }
    }
}

/// One provider subscription fact to fold into the `subscriptions` row.
#[derive(Debug, Clone)]
pub struct SubscriptionUpsert {
    pub stripe_subscription_id: String,
    pub owner_type: OwnerType,
    /// Unknown during onboarding; linked once the business exists. An
    /// existing link is never overwritten with `None`.
    pub owner_id: Option<Uuid>,
    /// Back-reference to the onboarding token that opened the checkout
    pub onboarding_token: Option<String>,
    pub tier_id: Option<Uuid>,
    pub status: String,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
}

/// One provider subscription fact to fold into a membership row.
#[derive(Debug, Clone)]
pub struct MembershipUpsert {
    pub stripe_subscription_id: String,
    pub business_id: Uuid,
    pub tier_id: Option<Uuid>,
    /// `None` when no account matched the payer email; the membership is
    /// still recorded and linked later.
    pub customer_id: Option<Uuid>,
    pub customer_email: Option<String>,
    pub invitation_token: Option<String>,
    pub status: String,
}

/// Collapse a provider subscription status into the local projection
/// status. Trial periods count as active; every in-arrears state counts
/// as past_due.
pub fn projected_status(provider_status: &str) -> &'static str {
    match provider_status {
        "active" | "trialing" => "active",
        "past_due" | "unpaid" | "incomplete" => "past_due",
        "canceled" | "incomplete_expired" => "canceled",
        "paused" => "paused",
        _ => "unknown",
    }
}

#[async_trait]
pub trait Projector: Send + Sync {
    /// Upsert the `subscriptions` row keyed by provider subscription id.
    async fn upsert_subscription(&self, upsert: SubscriptionUpsert) -> BillingResult<()>;

    /// Upsert the membership row keyed by provider subscription id.
    async fn upsert_membership(&self, upsert: MembershipUpsert) -> BillingResult<()>;

    /// Propagate a status change to the subscription row and everything
    /// hanging off it (business standing, memberships).
    async fn cascade_status(
        &self,
        stripe_subscription_id: &str,
        provider_status: &str,
    ) -> BillingResult<()>;
}

pub struct PgProjector {
    pool: PgPool,
}

impl PgProjector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn period(ts: Option<i64>) -> Option<OffsetDateTime> {
    ts.and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
}

#[async_trait]
impl Projector for PgProjector {
    async fn upsert_subscription(&self, upsert: SubscriptionUpsert) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, stripe_subscription_id, owner_type, owner_id, onboarding_token,
                tier_id, status, current_period_start, current_period_end,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                status = EXCLUDED.status,
                owner_id = COALESCE(subscriptions.owner_id, EXCLUDED.owner_id),
                onboarding_token = COALESCE(subscriptions.onboarding_token, EXCLUDED.onboarding_token),
                tier_id = COALESCE(EXCLUDED.tier_id, subscriptions.tier_id),
                current_period_start = COALESCE(EXCLUDED.current_period_start, subscriptions.current_period_start),
                current_period_end = COALESCE(EXCLUDED.current_period_end, subscriptions.current_period_end),
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&upsert.stripe_subscription_id)
        .bind(upsert.owner_type.as_str())
        .bind(upsert.owner_id)
        .bind(&upsert.onboarding_token)
        .bind(upsert.tier_id)
        .bind(&upsert.status)
        .bind(period(upsert.current_period_start))
        .bind(period(upsert.current_period_end))
        .execute(&self.pool)
        .await?;

        tracing::info!(
            stripe_subscription_id = %upsert.stripe_subscription_id,
            status = %upsert.status,
            "subscription projected"
        );
        Ok(())
    }

    async fn upsert_membership(&self, upsert: MembershipUpsert) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO customer_memberships (
                id, stripe_subscription_id, business_id, tier_id, customer_id,
                customer_email, invitation_token, status, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW())
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                status = EXCLUDED.status,
                tier_id = COALESCE(EXCLUDED.tier_id, customer_memberships.tier_id),
                customer_id = COALESCE(customer_memberships.customer_id, EXCLUDED.customer_id),
                customer_email = COALESCE(EXCLUDED.customer_email, customer_memberships.customer_email),
                invitation_token = COALESCE(customer_memberships.invitation_token, EXCLUDED.invitation_token),
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&upsert.stripe_subscription_id)
        .bind(upsert.business_id)
        .bind(upsert.tier_id)
        .bind(upsert.customer_id)
        .bind(&upsert.customer_email)
        .bind(&upsert.invitation_token)
        .bind(&upsert.status)
        .execute(&self.pool)
        .await?;

        if upsert.customer_id.is_none() {
            tracing::warn!(
                stripe_subscription_id = %upsert.stripe_subscription_id,
                business_id = %upsert.business_id,
                "membership recorded without a linked customer account"
            );
        }
        Ok(())
    }

    async fn cascade_status(
        &self,
        stripe_subscription_id: &str,
        provider_status: &str,
    ) -> BillingResult<()> {
        let status = projected_status(provider_status);

        // The subscription row is the primary record; a failure here must
        // surface so the delivery gets retried.
        sqlx::query(
            r#"
            UPDATE subscriptions SET status = $2, updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .bind(status)
        .execute(&self.pool)
        .await?;

        // Downstream standing is derivable from the subscription row, so
        // these writes log on failure instead of failing the delivery.
        if let Err(e) = sqlx::query(
            r#"
            UPDATE businesses SET subscription_status = $2, updated_at = NOW()
            WHERE id = (
                SELECT owner_id FROM subscriptions
                WHERE stripe_subscription_id = $1 AND owner_type = 'business'
            )
            "#,
        )
        .bind(stripe_subscription_id)
        .bind(status)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                stripe_subscription_id,
                error = %e,
                "failed to cascade status to business"
            );
        }

        if let Err(e) = sqlx::query(
            r#"
            UPDATE customer_memberships SET status = $2, updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .bind(status)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                stripe_subscription_id,
                error = %e,
                "failed to cascade status to memberships"
            );
        }

        tracing::info!(
            stripe_subscription_id,
            provider_status,
            projected = status,
            "subscription status cascaded"
        );
        Ok(())
    }
}
