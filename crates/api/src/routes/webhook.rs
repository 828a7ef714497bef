//! Stripe webhook endpoint
//!
//! Takes the raw body so the signature is verified over exactly the
//! bytes Stripe signed. Response contract: 200 acknowledges, 400 rejects
//! a bad signature, 500 asks Stripe to redeliver.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// POST /webhook/stripe
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError {
            status: axum::http::StatusCode::BAD_REQUEST,
            code: "INVALID_SIGNATURE",
            message: "missing stripe-signature header".to_string(),
        })?;

    let event = state.billing.webhooks.verify_and_parse(&body, signature)?;

    if let Err(e) = state.billing.webhooks.process(event).await {
        // Primary mutation failed; a 500 makes Stripe redeliver.
        tracing::error!(error = %e, "webhook processing failed");
        return Err(ApiError::internal());
    }

    Ok(Json(json!({"received": true})))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use sqlx::postgres::PgPoolOptions;
    use tower::ServiceExt;
    use vinoclub_billing::{BillingService, StripeConfig};

    use crate::config::Config;
    use crate::routes::create_router;
    use crate::state::AppState;

    const WEBHOOK_SECRET: &str = "whsec_test_secret";

    fn test_state() -> AppState {
        // Lazy pool: never actually connects for the cases tested here.
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/vinoclub_test")
            .unwrap();
        let config = Config {
            database_url: "postgres://localhost/vinoclub_test".to_string(),
            bind_address: "127.0.0.1:0".to_string(),
            admin_api_key: Some("admin_test_key".to_string()),
        };
        let billing = BillingService::new(
            StripeConfig {
                secret_key: "sk_test_key".to_string(),
                webhook_secret: WEBHOOK_SECRET.to_string(),
                app_url: "https://app.vinoclub.test".to_string(),
            },
            pool.clone(),
        );
        AppState {
            pool,
            config,
            billing: std::sync::Arc::new(billing),
        }
    }

    fn sign(payload: &str) -> String {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let mut mac = Hmac::<Sha256>::new_from_slice(b"test_secret").unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("t={timestamp},v1={sig}")
    }

    #[tokio::test]
    async fn rejects_bad_signature_with_400() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::post("/webhook/stripe")
                    .header("stripe-signature", "t=1,v1=deadbeef")
                    .body(Body::from(r#"{"id":"evt_1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "INVALID_SIGNATURE");
    }

    #[tokio::test]
    async fn rejects_missing_signature_with_400() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::post("/webhook/stripe")
                    .body(Body::from(r#"{"id":"evt_1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn acknowledges_signed_unhandled_event() {
        let payload =
            r#"{"id":"evt_1","type":"charge.refunded","created":1700000000,"data":{"object":{}}}"#;
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::post("/webhook/stripe")
                    .header("stripe-signature", sign(payload))
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["received"], true);
    }

    #[tokio::test]
    async fn admin_endpoints_require_the_admin_key() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::post("/api/onboarding/tokens")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"email":"owner@vineyard.test"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
