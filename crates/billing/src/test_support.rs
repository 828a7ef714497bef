//! In-memory implementations of the persistence and provider seams.
//!
//! These mirror the semantics the Postgres implementations get from SQL
//! (CAS transitions, natural-key upserts with COALESCE field merging) so
//! the full webhook and checkout flows can be exercised without a
//! database or network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{CheckoutRequest, CheckoutSessionRef, PaymentGateway, SubscriptionSnapshot};
use crate::identity::IdentityResolver;
use crate::projector::{MembershipUpsert, Projector, SubscriptionUpsert};
use crate::tiers::{Tier, TierStore};
use crate::tokens::{
    generate_token_string, Token, TokenKind, TokenPayload, TokenStatus, TokenStore,
};

#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, Token>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, credential: &str) -> Option<Token> {
        self.tokens.lock().unwrap().get(credential).cloned()
    }

    pub fn insert(&self, token: Token) {
        self.tokens.lock().unwrap().insert(token.token.clone(), token);
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn create(
        &self,
        kind: TokenKind,
        payload: TokenPayload,
        ttl: Duration,
    ) -> BillingResult<Token> {
        let now = OffsetDateTime::now_utc();
        let token = Token {
            id: Uuid::new_v4(),
            kind,
            token: generate_token_string(),
            status: TokenStatus::Pending,
            email: payload.email,
            business_name: payload.business_name,
            business_id: payload.business_id,
            suggested_tier_id: payload.suggested_tier_id,
            stripe_session_id: None,
            expires_at: now + ttl,
            created_at: now,
            updated_at: now,
        };
        self.insert(token.clone());
        Ok(token)
    }

    async fn get_by_token(&self, token: &str) -> BillingResult<Token> {
        let mut tokens = self.tokens.lock().unwrap();
        let record = tokens.get_mut(token).ok_or(BillingError::NotFound("token"))?;
        if record.is_expired_at(OffsetDateTime::now_utc()) && !record.status.is_terminal() {
            record.status = TokenStatus::Expired;
        }
        Ok(record.clone())
    }

    async fn find_pending_by_email(
        &self,
        kind: TokenKind,
        email: &str,
    ) -> BillingResult<Option<Token>> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .tokens
            .lock()
            .unwrap()
            .values()
            .find(|t| {
                t.kind == kind
                    && t.status == TokenStatus::Pending
                    && !t.is_expired_at(now)
                    && t.email.as_deref() == Some(email)
            })
            .cloned())
    }

    async fn reissue(
        &self,
        id: Uuid,
        suggested_tier_id: Option<Uuid>,
        ttl: Duration,
    ) -> BillingResult<Token> {
        let mut tokens = self.tokens.lock().unwrap();
        let old_credential = tokens
            .values()
            .find(|t| t.id == id && t.status == TokenStatus::Pending)
            .map(|t| t.token.clone())
            .ok_or(BillingError::NotFound("token"))?;

        let mut record = tokens.remove(&old_credential).ok_or(BillingError::NotFound("token"))?;
        record.token = generate_token_string();
        record.suggested_tier_id = suggested_tier_id.or(record.suggested_tier_id);
        record.expires_at = OffsetDateTime::now_utc() + ttl;
        record.updated_at = OffsetDateTime::now_utc();
        tokens.insert(record.token.clone(), record.clone());
        Ok(record)
    }

    async fn transition(
        &self,
        token: &str,
        expected: &[TokenStatus],
        new_status: TokenStatus,
        stripe_session_id: Option<&str>,
    ) -> BillingResult<Token> {
        let mut tokens = self.tokens.lock().unwrap();
        let record = tokens.get_mut(token).ok_or(BillingError::NotFound("token"))?;

        if record.is_expired_at(OffsetDateTime::now_utc()) {
            record.status = TokenStatus::Expired;
            return Err(BillingError::Expired);
        }
        if !expected.contains(&record.status) {
            return Err(BillingError::Conflict(format!(
                "token is {}, expected one of {:?}",
                record.status.as_str(),
                expected.iter().map(TokenStatus::as_str).collect::<Vec<_>>()
            )));
        }

        record.status = new_status;
        if let Some(session_id) = stripe_session_id {
            record.stripe_session_id = Some(session_id.to_string());
        }
        record.updated_at = OffsetDateTime::now_utc();
        Ok(record.clone())
    }
}

#[derive(Default)]
pub struct MemoryTierStore {
    tiers: Mutex<HashMap<Uuid, Tier>>,
}

impl MemoryTierStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tier: Tier) {
        self.tiers.lock().unwrap().insert(tier.id, tier);
    }
}

#[async_trait]
impl TierStore for MemoryTierStore {
    async fn get(&self, id: Uuid) -> BillingResult<Tier> {
        self.tiers
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(BillingError::NotFound("tier"))
    }

    async fn list_active(&self, business_id: Option<Uuid>) -> BillingResult<Vec<Tier>> {
        let mut tiers: Vec<Tier> = self
            .tiers
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.business_id == business_id && t.is_active)
            .cloned()
            .collect();
        tiers.sort_by_key(|t| t.price_cents);
        Ok(tiers)
    }
}

/// Recording projector with the same merge semantics as the SQL upserts.
#[derive(Default)]
pub struct MemoryProjector {
    pub subscriptions: Mutex<HashMap<String, SubscriptionUpsert>>,
    pub memberships: Mutex<HashMap<String, MembershipUpsert>>,
    pub cascades: Mutex<Vec<(String, String)>>,
    pub fail_subscriptions: std::sync::atomic::AtomicBool,
}

impl MemoryProjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscription(&self, id: &str) -> Option<SubscriptionUpsert> {
        self.subscriptions.lock().unwrap().get(id).cloned()
    }

    pub fn membership(&self, id: &str) -> Option<MembershipUpsert> {
        self.memberships.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl Projector for MemoryProjector {
    async fn upsert_subscription(&self, upsert: SubscriptionUpsert) -> BillingResult<()> {
        if self.fail_subscriptions.load(Ordering::SeqCst) {
            return Err(BillingError::Internal("subscription projection down".to_string()));
        }
        let mut subscriptions = self.subscriptions.lock().unwrap();
        match subscriptions.get_mut(&upsert.stripe_subscription_id) {
            Some(existing) => {
                existing.status = upsert.status;
                existing.owner_id = existing.owner_id.or(upsert.owner_id);
                existing.onboarding_token = existing
                    .onboarding_token
                    .take()
                    .or(upsert.onboarding_token);
                existing.tier_id = upsert.tier_id.or(existing.tier_id);
                existing.current_period_start = upsert
                    .current_period_start
                    .or(existing.current_period_start);
                existing.current_period_end =
                    upsert.current_period_end.or(existing.current_period_end);
            }
            None => {
                subscriptions.insert(upsert.stripe_subscription_id.clone(), upsert);
            }
        }
        Ok(())
    }

    async fn upsert_membership(&self, upsert: MembershipUpsert) -> BillingResult<()> {
        let mut memberships = self.memberships.lock().unwrap();
        match memberships.get_mut(&upsert.stripe_subscription_id) {
            Some(existing) => {
                existing.status = upsert.status;
                existing.tier_id = upsert.tier_id.or(existing.tier_id);
                existing.customer_id = existing.customer_id.or(upsert.customer_id);
                existing.customer_email =
                    upsert.customer_email.or(existing.customer_email.take());
                existing.invitation_token = existing
                    .invitation_token
                    .take()
                    .or(upsert.invitation_token);
            }
            None => {
                memberships.insert(upsert.stripe_subscription_id.clone(), upsert);
            }
        }
        Ok(())
    }

    async fn cascade_status(
        &self,
        stripe_subscription_id: &str,
        provider_status: &str,
    ) -> BillingResult<()> {
        let status = crate::projector::projected_status(provider_status).to_string();
        if let Some(sub) = self
            .subscriptions
            .lock()
            .unwrap()
            .get_mut(stripe_subscription_id)
        {
            sub.status = status.clone();
        }
        if let Some(membership) = self
            .memberships
            .lock()
            .unwrap()
            .get_mut(stripe_subscription_id)
        {
            membership.status = status.clone();
        }
        self.cascades
            .lock()
            .unwrap()
            .push((stripe_subscription_id.to_string(), status));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryIdentityResolver {
    accounts: Mutex<HashMap<String, Uuid>>,
}

impl MemoryIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, email: &str, id: Uuid) {
        self.accounts
            .lock()
            .unwrap()
            .insert(email.to_lowercase(), id);
    }
}

#[async_trait]
impl IdentityResolver for MemoryIdentityResolver {
    async fn account_id_by_email(&self, email: &str) -> BillingResult<Option<Uuid>> {
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .get(&email.to_lowercase())
            .copied())
    }
}

/// Gateway fake that counts outbound calls and serves canned
/// subscriptions.
#[derive(Default)]
pub struct FakeGateway {
    pub sessions_created: AtomicUsize,
    pub last_request: Mutex<Option<CheckoutRequest>>,
    pub subscriptions: Mutex<HashMap<String, SubscriptionSnapshot>>,
    pub fail_create: std::sync::atomic::AtomicBool,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_subscription(&self, snapshot: SubscriptionSnapshot) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(snapshot.id.clone(), snapshot);
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_checkout_session(
        &self,
        request: CheckoutRequest,
    ) -> BillingResult<CheckoutSessionRef> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(BillingError::Provider("provider unavailable".to_string()));
        }
        let n = self.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_request.lock().unwrap() = Some(request);
        Ok(CheckoutSessionRef {
            session_id: format!("cs_test_{n}"),
            checkout_url: format!("https://checkout.stripe.com/c/pay/cs_test_{n}"),
        })
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        self.subscriptions
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::Provider(format!("no such subscription {subscription_id}")))
    }
}

pub fn platform_tier(price_id: Option<&str>) -> Tier {
    let now = OffsetDateTime::now_utc();
    Tier {
        id: Uuid::new_v4(),
        business_id: None,
        name: "Estate".to_string(),
        description: None,
        price_cents: 9900,
        billing_interval: "month".to_string(),
        stripe_price_id: price_id.map(str::to_string),
        is_active: true,
        is_custom: false,
        created_at: now,
        updated_at: now,
    }
}

pub fn membership_tier(business_id: Uuid, price_id: &str) -> Tier {
    let mut tier = platform_tier(Some(price_id));
    tier.business_id = Some(business_id);
    tier.name = "Club Rouge".to_string();
    tier.price_cents = 4900;
    tier
}
