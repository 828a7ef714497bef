//! Server configuration

/// Configuration loaded from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Shared secret gating token and invitation generation endpoints.
    /// Unset means those endpoints are disabled.
    pub admin_api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is not set"))?;
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let admin_api_key = std::env::var("ADMIN_API_KEY").ok().filter(|k| !k.is_empty());

        Ok(Self {
            database_url,
            bind_address,
            admin_api_key,
        })
    }
}
