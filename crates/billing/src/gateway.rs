//! Payment gateway seam
//!
//! The billing core talks to Stripe only through `PaymentGateway`, so
//! checkout and webhook logic can be exercised against an in-memory
//! implementation. The production implementation wraps `async-stripe`
//! with a per-call timeout and a single retry on transport failures;
//! API-level rejections are never retried.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Hard ceiling on any single Stripe call.
const PROVIDER_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to open a hosted checkout for one recurring price.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub price_id: String,
    pub customer_email: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
    /// Correlation metadata, attached to the session and duplicated onto
    /// the subscription Stripe creates from it.
    pub metadata: HashMap<String, String>,
    pub allow_promotion_codes: bool,
}

/// Reference to a created checkout session.
#[derive(Debug, Clone)]
pub struct CheckoutSessionRef {
    pub session_id: String,
    pub checkout_url: String,
}

/// Provider-side view of a subscription, as much of it as the billing
/// core needs.
#[derive(Debug, Clone)]
pub struct SubscriptionSnapshot {
    pub id: String,
    /// Provider status string (`active`, `past_due`, ...)
    pub status: String,
    pub metadata: HashMap<String, String>,
    pub current_period_start: i64,
    pub current_period_end: i64,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: CheckoutRequest,
    ) -> BillingResult<CheckoutSessionRef>;

    async fn retrieve_subscription(&self, subscription_id: &str)
        -> BillingResult<SubscriptionSnapshot>;
}

enum CallError {
    Timeout,
    Api(stripe::StripeError),
}

impl CallError {
    /// Transport problems and timeouts get one retry; an answer from the
    /// API, even a rejection, is final.
    fn is_transient(&self) -> bool {
        match self {
            CallError::Timeout => true,
            CallError::Api(err) => !matches!(err, stripe::StripeError::Stripe(_)),
        }
    }
}

async fn call_with_retry<T, F, Fut>(op: &'static str, mut attempt: F) -> BillingResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, stripe::StripeError>>,
{
    let strategy = FixedInterval::from_millis(500).take(1);

    let result = RetryIf::spawn(
        strategy,
        || {
            let fut = attempt();
            async move {
                match tokio::time::timeout(PROVIDER_CALL_TIMEOUT, fut).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(CallError::Api(err)),
                    Err(_) => Err(CallError::Timeout),
                }
            }
        },
        CallError::is_transient,
    )
    .await;

    match result {
        Ok(value) => Ok(value),
        Err(CallError::Timeout) => {
            tracing::error!(operation = op, "payment provider call timed out");
            Err(BillingError::Provider(format!("{op} timed out")))
        }
        Err(CallError::Api(err)) => {
            tracing::error!(operation = op, error = %err, "payment provider call failed");
            Err(err.into())
        }
    }
}

/// Stripe-backed gateway.
#[derive(Clone)]
pub struct StripeGateway {
    client: StripeClient,
}

impl StripeGateway {
    pub fn new(client: StripeClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_checkout_session(
        &self,
        request: CheckoutRequest,
    ) -> BillingResult<CheckoutSessionRef> {
        let session = call_with_retry("create_checkout_session", || {
            let client = self.client.clone();
            let request = request.clone();
            async move {
                let params = stripe::CreateCheckoutSession {
                    mode: Some(stripe::CheckoutSessionMode::Subscription),
                    line_items: Some(vec![stripe::CreateCheckoutSessionLineItems {
                        price: Some(request.price_id.clone()),
                        quantity: Some(1),
                        ..Default::default()
                    }]),
                    success_url: Some(&request.success_url),
                    cancel_url: Some(&request.cancel_url),
                    customer_email: request.customer_email.as_deref(),
                    metadata: Some(request.metadata.clone()),
                    // Stripe does not copy session metadata onto the
                    // subscription; duplicate it so subscription events
                    // stay correlatable on their own.
                    subscription_data: Some(stripe::CreateCheckoutSessionSubscriptionData {
                        metadata: Some(request.metadata.clone()),
                        ..Default::default()
                    }),
                    allow_promotion_codes: if request.allow_promotion_codes {
                        Some(true)
                    } else {
                        None
                    },
                    ..Default::default()
                };

                stripe::CheckoutSession::create(client.inner(), params).await
            }
        })
        .await?;

        let checkout_url = session
            .url
            .ok_or_else(|| BillingError::Provider("checkout session has no url".to_string()))?;

        Ok(CheckoutSessionRef {
            session_id: session.id.to_string(),
            checkout_url,
        })
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        let parsed_id = subscription_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|_| {
                BillingError::Validation(format!("invalid subscription id '{subscription_id}'"))
            })?;

        let subscription = call_with_retry("retrieve_subscription", || {
            let client = self.client.clone();
            let id = parsed_id.clone();
            async move { stripe::Subscription::retrieve(client.inner(), &id, &[]).await }
        })
        .await?;

        Ok(SubscriptionSnapshot {
            id: subscription.id.to_string(),
            status: subscription.status.to_string(),
            metadata: subscription.metadata,
            current_period_start: subscription.current_period_start,
            current_period_end: subscription.current_period_end,
        })
    }
}
