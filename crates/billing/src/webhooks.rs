//! Webhook event processor
//!
//! Verifies, classifies, and applies provider deliveries. Idempotency
//! comes entirely from token compare-and-swap plus natural-key upserts;
//! there is no delivery dedup table, so every handler must converge when
//! run twice or out of order.
//!
//! Failure semantics: an error returned from `process` means the primary
//! mutation did not land and the provider should redeliver. Outcomes a
//! redelivery cannot fix (duplicate, expired token, uncorrelated event)
//! are logged and acknowledged.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{
    self, CheckoutSessionPayload, Correlation, Event, InvoicePayload, SubscriptionPayload,
    WebhookEvent,
};
use crate::gateway::PaymentGateway;
use crate::identity::IdentityResolver;
use crate::projector::{
    projected_status, MembershipUpsert, OwnerType, Projector, SubscriptionUpsert,
};
use crate::tokens::{TokenStatus, TokenStore};

pub struct WebhookProcessor {
    tokens: Arc<dyn TokenStore>,
    projector: Arc<dyn Projector>,
    identity: Arc<dyn IdentityResolver>,
    gateway: Arc<dyn PaymentGateway>,
    webhook_secret: String,
}

impl WebhookProcessor {
    pub fn new(
        tokens: Arc<dyn TokenStore>,
        projector: Arc<dyn Projector>,
        identity: Arc<dyn IdentityResolver>,
        gateway: Arc<dyn PaymentGateway>,
        webhook_secret: String,
    ) -> Self {
        Self {
            tokens,
            projector,
            identity,
            gateway,
            webhook_secret,
        }
    }

    /// Verify the delivery signature and parse the event. Fails closed:
    /// any verification problem rejects the whole delivery.
    pub fn verify_and_parse(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|_| BillingError::SignatureInvalid)?
            .as_secs() as i64;

        events::verify_signature(payload, signature, &self.webhook_secret, now)?;
        events::parse_event(payload)
    }

    /// Apply a verified event.
    pub async fn process(&self, event: Event) -> BillingResult<()> {
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "processing webhook event"
        );

        match event.kind {
            WebhookEvent::CheckoutCompleted(session) => self.checkout_completed(session).await,
            WebhookEvent::CheckoutExpired(session) => self.checkout_expired(session).await,
            WebhookEvent::InvoicePaid(invoice) => self.invoice_status(invoice, "active").await,
            WebhookEvent::InvoicePaymentFailed(invoice) => {
                self.invoice_status(invoice, "past_due").await
            }
            WebhookEvent::SubscriptionUpserted(subscription) => {
                self.subscription_upserted(subscription).await
            }
            WebhookEvent::SubscriptionDeleted(subscription) => {
                self.subscription_deleted(subscription).await
            }
            WebhookEvent::Ignored => {
                tracing::info!(event_type = %event.event_type, "ignoring unhandled event type");
                Ok(())
            }
        }
    }

    async fn checkout_completed(&self, session: CheckoutSessionPayload) -> BillingResult<()> {
        let Some(correlation) = Correlation::from_metadata(&session.metadata) else {
            tracing::warn!(
                session_id = %session.id,
                "checkout completed without correlation metadata, acknowledging"
            );
            return Ok(());
        };

        match correlation {
            Correlation::Onboarding { token } => self.onboarding_completed(session, token).await,
            Correlation::PrivateInvitation {
                token,
                business_id,
                tier_id,
            } => {
                self.invitation_completed(session, token, business_id, tier_id)
                    .await
            }
            Correlation::Membership {
                business_id,
                tier_id,
            } => self.membership_completed(session, business_id, tier_id).await,
        }
    }

    /// Business onboarding or business invitation payment landed.
    /// Primary: advance the token. Secondary: project the subscription.
    async fn onboarding_completed(
        &self,
        session: CheckoutSessionPayload,
        token: String,
    ) -> BillingResult<()> {
        let transition = self
            .tokens
            .transition(
                &token,
                &[TokenStatus::Pending, TokenStatus::CheckoutCreated],
                TokenStatus::PaymentCompleted,
                Some(&session.id),
            )
            .await;

        match transition {
            Ok(_) => {}
            Err(e) if e.is_benign_conflict() => {
                tracing::info!(
                    session_id = %session.id,
                    "onboarding token already past payment, duplicate delivery"
                );
            }
            Err(BillingError::Expired) => {
                // Payment was captured against a token that lapsed in the
                // meantime. Redelivery cannot fix the token; flag it for
                // operator reconciliation but still fall through to the
                // projection so the paid subscription has a row.
                tracing::error!(
                    session_id = %session.id,
                    "payment completed for an expired onboarding token"
                );
            }
            Err(BillingError::NotFound(_)) => {
                tracing::error!(
                    session_id = %session.id,
                    "payment completed for an unknown onboarding token"
                );
            }
            Err(e) => return Err(e),
        }

        let tier_id = metadata_uuid(&session, "tier_id");
        self.project_session_subscription(&session, OwnerType::Business, None, Some(token), tier_id)
            .await;
        Ok(())
    }

    /// Invited-customer payment landed. Primary: record the membership.
    /// The invitation token transition is benign-on-conflict; a missing
    /// or lapsed invitation never drops a captured payment.
    async fn invitation_completed(
        &self,
        session: CheckoutSessionPayload,
        token: String,
        business_id: Option<Uuid>,
        tier_id: Option<Uuid>,
    ) -> BillingResult<()> {
        let invitation = match self
            .tokens
            .transition(
                &token,
                &[TokenStatus::Pending, TokenStatus::CheckoutCreated],
                TokenStatus::Used,
                Some(&session.id),
            )
            .await
        {
            Ok(record) => Some(record),
            Err(e) if e.is_benign_conflict() => {
                tracing::info!(session_id = %session.id, "invitation already consumed");
                self.tokens.get_by_token(&token).await.ok()
            }
            Err(BillingError::Expired) | Err(BillingError::NotFound(_)) => {
                tracing::error!(
                    session_id = %session.id,
                    "payment completed for a dead invitation token"
                );
                self.tokens.get_by_token(&token).await.ok()
            }
            Err(e) => return Err(e),
        };

        let business_id = business_id
            .or_else(|| invitation.as_ref().and_then(|t| t.business_id))
            .ok_or_else(|| {
                BillingError::PayloadInvalid("invitation checkout without business id".to_string())
            })?;
        let tier_id = tier_id.or_else(|| invitation.as_ref().and_then(|t| t.suggested_tier_id));
        let email = session
            .customer_email
            .clone()
            .or_else(|| invitation.as_ref().and_then(|t| t.email.clone()));

        self.record_membership(&session, business_id, tier_id, email, Some(token))
            .await
    }

    /// Public join-flow payment landed. Primary: record the membership.
    async fn membership_completed(
        &self,
        session: CheckoutSessionPayload,
        business_id: Uuid,
        tier_id: Option<Uuid>,
    ) -> BillingResult<()> {
        let email = session.customer_email.clone();
        self.record_membership(&session, business_id, tier_id, email, None)
            .await
    }

    async fn record_membership(
        &self,
        session: &CheckoutSessionPayload,
        business_id: Uuid,
        tier_id: Option<Uuid>,
        email: Option<String>,
        invitation_token: Option<String>,
    ) -> BillingResult<()> {
        let Some(subscription_id) = session.subscription.as_ref().map(|s| s.id().to_string())
        else {
            // Subscription-mode sessions always carry one; without it the
            // membership has no natural key and redelivery will not grow
            // one. Flag and acknowledge.
            tracing::error!(
                session_id = %session.id,
                business_id = %business_id,
                "membership checkout completed without a subscription id"
            );
            return Ok(());
        };

        let customer_id = match &email {
            Some(email) => match self.identity.account_id_by_email(email).await {
                Ok(id) => id,
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        "account lookup failed, recording membership unlinked"
                    );
                    None
                }
            },
            None => None,
        };
        if customer_id.is_none() {
            tracing::error!(
                session_id = %session.id,
                business_id = %business_id,
                "no account matched the payer, membership recorded unlinked"
            );
        }

        self.projector
            .upsert_membership(MembershipUpsert {
                stripe_subscription_id: subscription_id,
                business_id,
                tier_id,
                customer_id,
                customer_email: email,
                invitation_token,
                status: "active".to_string(),
            })
            .await?;

        self.project_session_subscription(session, OwnerType::Customer, customer_id, None, tier_id)
            .await;
        Ok(())
    }

    /// Secondary projection after a completed checkout: pull the fresh
    /// subscription from the provider and fold it in. Failures here are
    /// logged, never surfaced; subscription.* deliveries converge the
    /// row later.
    async fn project_session_subscription(
        &self,
        session: &CheckoutSessionPayload,
        owner_type: OwnerType,
        owner_id: Option<Uuid>,
        onboarding_token: Option<String>,
        tier_id: Option<Uuid>,
    ) {
        let Some(subscription_id) = session.subscription.as_ref().map(|s| s.id().to_string())
        else {
            tracing::warn!(session_id = %session.id, "completed session carries no subscription");
            return;
        };

        let snapshot = match self.gateway.retrieve_subscription(&subscription_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(
                    stripe_subscription_id = %subscription_id,
                    error = %e,
                    "could not retrieve subscription after checkout"
                );
                return;
            }
        };

        let upsert = SubscriptionUpsert {
            stripe_subscription_id: snapshot.id.clone(),
            owner_type,
            owner_id,
            onboarding_token,
            tier_id,
            status: projected_status(&snapshot.status).to_string(),
            current_period_start: Some(snapshot.current_period_start),
            current_period_end: Some(snapshot.current_period_end),
        };

        if let Err(e) = self.projector.upsert_subscription(upsert).await {
            tracing::error!(
                stripe_subscription_id = %subscription_id,
                error = %e,
                "subscription projection after checkout failed"
            );
        }
    }

    /// An abandoned checkout session lapsed. Release the token back to
    /// pending so the holder can start over; the token's own expiry
    /// still bounds the flow.
    async fn checkout_expired(&self, session: CheckoutSessionPayload) -> BillingResult<()> {
        let token = match Correlation::from_metadata(&session.metadata) {
            Some(Correlation::Onboarding { token }) => token,
            Some(Correlation::PrivateInvitation { token, .. }) => token,
            _ => return Ok(()),
        };

        match self
            .tokens
            .transition(
                &token,
                &[TokenStatus::CheckoutCreated],
                TokenStatus::Pending,
                None,
            )
            .await
        {
            Ok(_) => {
                tracing::info!(session_id = %session.id, "token released after session expiry");
                Ok(())
            }
            Err(e) if e.is_benign_conflict() => Ok(()),
            Err(BillingError::Expired) | Err(BillingError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn invoice_status(&self, invoice: InvoicePayload, status: &str) -> BillingResult<()> {
        let Some(subscription_id) = invoice.subscription.as_ref().map(|s| s.id()) else {
            tracing::info!(invoice_id = %invoice.id, "invoice without subscription, ignoring");
            return Ok(());
        };

        self.projector.cascade_status(subscription_id, status).await
    }

    /// subscription.created / subscription.updated. Pure projection from
    /// the duplicated metadata; token state is never driven from here, so
    /// these may arrive before the checkout completion without harm.
    async fn subscription_upserted(&self, subscription: SubscriptionPayload) -> BillingResult<()> {
        let Some(correlation) = Correlation::from_metadata(&subscription.metadata) else {
            tracing::warn!(
                stripe_subscription_id = %subscription.id,
                "uncorrelated subscription event, acknowledging"
            );
            return Ok(());
        };

        let tier_id = subscription
            .metadata
            .get("tier_id")
            .and_then(|v| Uuid::parse_str(v).ok());
        let status = projected_status(&subscription.status).to_string();

        let (owner_type, onboarding_token, membership) = match correlation {
            Correlation::Onboarding { token } => (OwnerType::Business, Some(token), None),
            Correlation::PrivateInvitation {
                token, business_id, ..
            } => (
                OwnerType::Customer,
                None,
                business_id.map(|b| (b, Some(token))),
            ),
            Correlation::Membership { business_id, .. } => {
                (OwnerType::Customer, None, Some((business_id, None)))
            }
        };

        self.projector
            .upsert_subscription(SubscriptionUpsert {
                stripe_subscription_id: subscription.id.clone(),
                owner_type,
                owner_id: None,
                onboarding_token,
                tier_id,
                status: status.clone(),
                current_period_start: subscription.current_period_start,
                current_period_end: subscription.current_period_end,
            })
            .await?;

        if let Some((business_id, invitation_token)) = membership {
            let upsert = MembershipUpsert {
                stripe_subscription_id: subscription.id.clone(),
                business_id,
                tier_id,
                customer_id: None,
                customer_email: None,
                invitation_token,
                status,
            };
            if let Err(e) = self.projector.upsert_membership(upsert).await {
                tracing::error!(
                    stripe_subscription_id = %subscription.id,
                    error = %e,
                    "membership projection from subscription event failed"
                );
            }
        }

        Ok(())
    }

    async fn subscription_deleted(&self, subscription: SubscriptionPayload) -> BillingResult<()> {
        self.projector.cascade_status(&subscription.id, "canceled").await
    }
}

fn metadata_uuid(session: &CheckoutSessionPayload, key: &str) -> Option<Uuid> {
    session.metadata.get(key).and_then(|v| Uuid::parse_str(v).ok())
}
