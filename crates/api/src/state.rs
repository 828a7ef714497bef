//! Application state

use std::sync::Arc;

use sqlx::PgPool;
use vinoclub_billing::BillingService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let billing = Arc::new(BillingService::from_env(pool.clone())?);
        tracing::info!("billing service initialized");

        if config.admin_api_key.is_none() {
            tracing::warn!("ADMIN_API_KEY not set, token generation endpoints are disabled");
        }

        Ok(Self {
            pool,
            config,
            billing,
        })
    }
}
