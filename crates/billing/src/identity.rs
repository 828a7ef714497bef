//! Account lookup seam
//!
//! Webhook processing links a paying customer to an existing account by
//! email. A missing account is not an error; the membership is recorded
//! unlinked and reconciled when the account appears.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn account_id_by_email(&self, email: &str) -> BillingResult<Option<Uuid>>;
}

pub struct PgIdentityResolver {
    pool: PgPool,
}

impl PgIdentityResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityResolver for PgIdentityResolver {
    async fn account_id_by_email(&self, email: &str) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM accounts WHERE lower(email) = lower($1)")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id,)| id))
    }
}
