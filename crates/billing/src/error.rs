//! Billing error types

use thiserror::Error;

/// Errors produced by the billing core.
///
/// The taxonomy deliberately distinguishes caller mistakes (`Validation`,
/// `NotFound`), benign races (`Conflict`), expiry (`Expired`), payment
/// provider failures (`Provider`, `SignatureInvalid`) and persistence
/// failures (`Database`), because each class propagates differently at the
/// HTTP boundary.
#[derive(Debug, Error)]
pub enum BillingError {
    /// Malformed or missing input. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Token, tier, invitation or business does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Compare-and-swap failure on a token transition. Treated as benign
    /// by webhook processing ("already handled"), 409 at the HTTP boundary.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Token is past its `expires_at`. Checked before every state-changing
    /// operation, independent of the stored status.
    #[error("token has expired")]
    Expired,

    /// Tier exists but is not eligible for checkout (inactive, custom, or
    /// missing a Stripe price).
    #[error("invalid tier: {0}")]
    InvalidTier(&'static str),

    /// Stripe API call failed or could not be reached.
    #[error("payment provider error: {0}")]
    Provider(String),

    /// Webhook signature verification failed. The whole delivery is
    /// rejected; no partial processing.
    #[error("webhook signature verification failed")]
    SignatureInvalid,

    /// Webhook payload could not be parsed after the signature verified.
    #[error("webhook payload invalid: {0}")]
    PayloadInvalid(String),

    /// Missing or unusable configuration (environment variables).
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::Provider(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

impl BillingError {
    /// True for compare-and-swap losses, which webhook processing treats
    /// as "another delivery already did this".
    pub fn is_benign_conflict(&self) -> bool {
        matches!(self, BillingError::Conflict(_))
    }
}
