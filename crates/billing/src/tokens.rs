//! Token store
//!
//! Persisted bearer tokens driving the onboarding and invitation flows.
//! All three variants (business onboarding, business invitation, customer
//! invitation) share one record shape and one status machine; they differ
//! in payload and in which terminal state ends the flow.
//!
//! Every state-changing operation goes through compare-and-swap
//! transitions, and expiry is evaluated lazily on every read. Neither
//! correctness property depends on a background sweep.

use async_trait::async_trait;
use rand::RngCore;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Token variant discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Public business signup flow (token generated per signup email)
    BusinessOnboarding,
    /// Admin-issued invitation for a specific business
    BusinessInvitation,
    /// Business-issued invitation for a customer to join a membership tier
    CustomerInvitation,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::BusinessOnboarding => "business_onboarding",
            TokenKind::BusinessInvitation => "business_invitation",
            TokenKind::CustomerInvitation => "customer_invitation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "business_onboarding" => Some(TokenKind::BusinessOnboarding),
            "business_invitation" => Some(TokenKind::BusinessInvitation),
            "customer_invitation" => Some(TokenKind::CustomerInvitation),
            _ => None,
        }
    }
}

/// Token lifecycle status.
///
/// Business variants travel `pending → checkout_created →
/// payment_completed → business_created`; customer invitations end in
/// `used`. `expired` and `canceled` are reachable from any non-terminal
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Pending,
    CheckoutCreated,
    PaymentCompleted,
    BusinessCreated,
    Used,
    Expired,
    Canceled,
}

impl TokenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStatus::Pending => "pending",
            TokenStatus::CheckoutCreated => "checkout_created",
            TokenStatus::PaymentCompleted => "payment_completed",
            TokenStatus::BusinessCreated => "business_created",
            TokenStatus::Used => "used",
            TokenStatus::Expired => "expired",
            TokenStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TokenStatus::Pending),
            "checkout_created" => Some(TokenStatus::CheckoutCreated),
            "payment_completed" => Some(TokenStatus::PaymentCompleted),
            "business_created" => Some(TokenStatus::BusinessCreated),
            "used" => Some(TokenStatus::Used),
            "expired" => Some(TokenStatus::Expired),
            "canceled" => Some(TokenStatus::Canceled),
            _ => None,
        }
    }

    /// Terminal states are never left again; a token that reaches one is
    /// never reused.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TokenStatus::BusinessCreated
                | TokenStatus::Used
                | TokenStatus::Expired
                | TokenStatus::Canceled
        )
    }
}

/// A persisted token record.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Token {
    pub id: Uuid,
    pub kind: TokenKind,
    /// Opaque bearer credential (32 random bytes, hex encoded)
    pub token: String,
    pub status: TokenStatus,
    pub email: Option<String>,
    pub business_name: Option<String>,
    pub business_id: Option<Uuid>,
    pub suggested_tier_id: Option<Uuid>,
    pub stripe_session_id: Option<String>,
    pub expires_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Token {
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }
}

/// Variant-specific payload supplied at creation time.
#[derive(Debug, Clone, Default)]
pub struct TokenPayload {
    pub email: Option<String>,
    pub business_name: Option<String>,
    pub business_id: Option<Uuid>,
    pub suggested_tier_id: Option<Uuid>,
}

/// Generate an opaque token string: 32 bytes from the OS RNG, hex encoded.
pub fn generate_token_string() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Persistence seam for tokens.
///
/// Implementations must provide compare-and-swap `transition` semantics
/// and enforce expiry before any state change.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Create a token with a freshly generated credential and
    /// `status = pending`.
    async fn create(
        &self,
        kind: TokenKind,
        payload: TokenPayload,
        ttl: Duration,
    ) -> BillingResult<Token>;

    /// Look a token up by its opaque credential.
    ///
    /// Lazy expiry: a non-terminal token past `expires_at` is returned
    /// with (and persisted as) status `expired`.
    async fn get_by_token(&self, token: &str) -> BillingResult<Token>;

    /// Find an existing pending token of `kind` for `email`, if any.
    /// Used to re-issue instead of accumulating pending tokens.
    async fn find_pending_by_email(
        &self,
        kind: TokenKind,
        email: &str,
    ) -> BillingResult<Option<Token>>;

    /// Replace the credential, expiry, and suggested tier of an existing
    /// pending token (re-issue).
    async fn reissue(
        &self,
        id: Uuid,
        suggested_tier_id: Option<Uuid>,
        ttl: Duration,
    ) -> BillingResult<Token>;

    /// Compare-and-swap status transition.
    ///
    /// Fails with `Conflict` when the current status is not in `expected`,
    /// with `Expired` when `expires_at` has passed (regardless of stored
    /// status), and with `NotFound` when the credential is unknown.
    /// `stripe_session_id`, when given, is stored in the same write.
    async fn transition(
        &self,
        token: &str,
        expected: &[TokenStatus],
        new_status: TokenStatus,
        stripe_session_id: Option<&str>,
    ) -> BillingResult<Token>;
}

/// Postgres-backed token store.
pub struct PgTokenStore {
    pool: PgPool,
}

impl PgTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct TokenRow {
    id: Uuid,
    kind: String,
    token: String,
    status: String,
    email: Option<String>,
    business_name: Option<String>,
    business_id: Option<Uuid>,
    suggested_tier_id: Option<Uuid>,
    stripe_session_id: Option<String>,
    expires_at: OffsetDateTime,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<TokenRow> for Token {
    type Error = BillingError;

    fn try_from(row: TokenRow) -> BillingResult<Token> {
        let kind = TokenKind::parse(&row.kind)
            .ok_or_else(|| BillingError::Internal(format!("unknown token kind '{}'", row.kind)))?;
        let status = TokenStatus::parse(&row.status).ok_or_else(|| {
            BillingError::Internal(format!("unknown token status '{}'", row.status))
        })?;
        Ok(Token {
            id: row.id,
            kind,
            token: row.token,
            status,
            email: row.email,
            business_name: row.business_name,
            business_id: row.business_id,
            suggested_tier_id: row.suggested_tier_id,
            stripe_session_id: row.stripe_session_id,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const TOKEN_COLUMNS: &str = "id, kind, token, status, email, business_name, business_id, \
     suggested_tier_id, stripe_session_id, expires_at, created_at, updated_at";

#[async_trait]
impl TokenStore for PgTokenStore {
    async fn create(
        &self,
        kind: TokenKind,
        payload: TokenPayload,
        ttl: Duration,
    ) -> BillingResult<Token> {
        let credential = generate_token_string();
        let expires_at = OffsetDateTime::now_utc() + ttl;

        let row: TokenRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO tokens (
                id, kind, token, status, email, business_name, business_id,
                suggested_tier_id, expires_at, created_at, updated_at
            ) VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7, $8, NOW(), NOW())
            RETURNING {TOKEN_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(kind.as_str())
        .bind(&credential)
        .bind(&payload.email)
        .bind(&payload.business_name)
        .bind(payload.business_id)
        .bind(payload.suggested_tier_id)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_by_token(&self, token: &str) -> BillingResult<Token> {
        // Lazy expiry: flip a stale non-terminal token to expired before
        // reading it back. Correctness does not depend on this persisting;
        // `transition` re-checks expiry on every write.
        sqlx::query(
            r#"
            UPDATE tokens SET status = 'expired', updated_at = NOW()
            WHERE token = $1
              AND expires_at <= NOW()
              AND status IN ('pending', 'checkout_created', 'payment_completed')
            "#,
        )
        .bind(token)
        .execute(&self.pool)
        .await?;

        let row: Option<TokenRow> =
            sqlx::query_as(&format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE token = $1"))
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Token::try_from)
            .transpose()?
            .ok_or(BillingError::NotFound("token"))
    }

    async fn find_pending_by_email(
        &self,
        kind: TokenKind,
        email: &str,
    ) -> BillingResult<Option<Token>> {
        let row: Option<TokenRow> = sqlx::query_as(&format!(
            r#"
            SELECT {TOKEN_COLUMNS} FROM tokens
            WHERE kind = $1 AND email = $2 AND status = 'pending' AND expires_at > NOW()
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(kind.as_str())
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Token::try_from).transpose()
    }

    async fn reissue(
        &self,
        id: Uuid,
        suggested_tier_id: Option<Uuid>,
        ttl: Duration,
    ) -> BillingResult<Token> {
        let credential = generate_token_string();
        let expires_at = OffsetDateTime::now_utc() + ttl;

        let row: Option<TokenRow> = sqlx::query_as(&format!(
            r#"
            UPDATE tokens
            SET token = $2,
                suggested_tier_id = COALESCE($3, suggested_tier_id),
                expires_at = $4,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {TOKEN_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&credential)
        .bind(suggested_tier_id)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Token::try_from)
            .transpose()?
            .ok_or(BillingError::NotFound("token"))
    }

    async fn transition(
        &self,
        token: &str,
        expected: &[TokenStatus],
        new_status: TokenStatus,
        stripe_session_id: Option<&str>,
    ) -> BillingResult<Token> {
        let expected_strs: Vec<&str> = expected.iter().map(TokenStatus::as_str).collect();

        // Single-statement CAS: the WHERE clause is the entire concurrency
        // story. Two racing transitions see exactly one row updated.
        let row: Option<TokenRow> = sqlx::query_as(&format!(
            r#"
            UPDATE tokens
            SET status = $3,
                stripe_session_id = COALESCE($4, stripe_session_id),
                updated_at = NOW()
            WHERE token = $1
              AND status = ANY($2)
              AND expires_at > NOW()
            RETURNING {TOKEN_COLUMNS}
            "#
        ))
        .bind(token)
        .bind(&expected_strs)
        .bind(new_status.as_str())
        .bind(stripe_session_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return row.try_into();
        }

        // Zero rows updated: probe once to report why.
        let current: Option<TokenRow> =
            sqlx::query_as(&format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE token = $1"))
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;

        match current {
            None => Err(BillingError::NotFound("token")),
            Some(row) => {
                let current: Token = row.try_into()?;
                if current.is_expired_at(OffsetDateTime::now_utc()) {
                    Err(BillingError::Expired)
                } else {
                    Err(BillingError::Conflict(format!(
                        "token is {}, expected one of {:?}",
                        current.status.as_str(),
                        expected_strs
                    )))
                }
            }
        }
    }
}

/// How long each token variant stays redeemable.
pub const ONBOARDING_TOKEN_TTL: Duration = Duration::days(7);
pub const BUSINESS_INVITATION_TTL: Duration = Duration::days(7);
pub const CUSTOMER_INVITATION_TTL: Duration = Duration::days(30);

/// Issues tokens with the per-variant payload rules.
pub struct TokenIssuer {
    store: std::sync::Arc<dyn TokenStore>,
}

impl TokenIssuer {
    pub fn new(store: std::sync::Arc<dyn TokenStore>) -> Self {
        Self { store }
    }

    /// Issue an onboarding token for a signup email.
    ///
    /// An email with a live pending token gets that token re-issued (new
    /// credential, fresh expiry) instead of a second row; repeated signup
    /// attempts must not accumulate redeemable credentials.
    pub async fn issue_onboarding(
        &self,
        email: &str,
        business_name: Option<&str>,
        suggested_tier_id: Option<Uuid>,
    ) -> BillingResult<Token> {
        crate::checkout::validate_email(email)?;

        if let Some(existing) = self
            .store
            .find_pending_by_email(TokenKind::BusinessOnboarding, email)
            .await?
        {
            tracing::info!(email, "re-issuing pending onboarding token");
            return self
                .store
                .reissue(existing.id, suggested_tier_id, ONBOARDING_TOKEN_TTL)
                .await;
        }

        self.store
            .create(
                TokenKind::BusinessOnboarding,
                TokenPayload {
                    email: Some(email.to_string()),
                    business_name: business_name.map(str::to_string),
                    business_id: None,
                    suggested_tier_id,
                },
                ONBOARDING_TOKEN_TTL,
            )
            .await
    }

    pub async fn issue_business_invitation(
        &self,
        email: &str,
        business_name: Option<&str>,
        suggested_tier_id: Option<Uuid>,
    ) -> BillingResult<Token> {
        crate::checkout::validate_email(email)?;

        self.store
            .create(
                TokenKind::BusinessInvitation,
                TokenPayload {
                    email: Some(email.to_string()),
                    business_name: business_name.map(str::to_string),
                    business_id: None,
                    suggested_tier_id,
                },
                BUSINESS_INVITATION_TTL,
            )
            .await
    }

    /// Customer invitations are anchored to the inviting business and
    /// carry the tier the business picked for the invitee.
    pub async fn issue_customer_invitation(
        &self,
        business_id: Uuid,
        email: &str,
        suggested_tier_id: Uuid,
    ) -> BillingResult<Token> {
        crate::checkout::validate_email(email)?;

        self.store
            .create(
                TokenKind::CustomerInvitation,
                TokenPayload {
                    email: Some(email.to_string()),
                    business_name: None,
                    business_id: Some(business_id),
                    suggested_tier_id: Some(suggested_tier_id),
                },
                CUSTOMER_INVITATION_TTL,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_strings_are_unique_and_opaque() {
        let a = generate_token_string();
        let b = generate_token_string();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            TokenStatus::Pending,
            TokenStatus::CheckoutCreated,
            TokenStatus::PaymentCompleted,
            TokenStatus::BusinessCreated,
            TokenStatus::Used,
            TokenStatus::Expired,
            TokenStatus::Canceled,
        ] {
            assert_eq!(TokenStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TokenStatus::parse("nonsense"), None);
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(!TokenStatus::Pending.is_terminal());
        assert!(!TokenStatus::CheckoutCreated.is_terminal());
        assert!(!TokenStatus::PaymentCompleted.is_terminal());
        assert!(TokenStatus::BusinessCreated.is_terminal());
        assert!(TokenStatus::Used.is_terminal());
        assert!(TokenStatus::Expired.is_terminal());
        assert!(TokenStatus::Canceled.is_terminal());
    }

    #[test]
    fn expiry_is_a_pure_timestamp_comparison() {
        let now = OffsetDateTime::now_utc();
        let token = Token {
            id: Uuid::new_v4(),
            kind: TokenKind::BusinessOnboarding,
            token: generate_token_string(),
            status: TokenStatus::Pending,
            email: Some("a@b.com".to_string()),
            business_name: None,
            business_id: None,
            suggested_tier_id: None,
            stripe_session_id: None,
            expires_at: now - Duration::seconds(1),
            created_at: now - Duration::hours(25),
            updated_at: now - Duration::hours(25),
        };
        assert!(token.is_expired_at(now));
        assert!(!token.is_expired_at(now - Duration::seconds(2)));
    }
}
