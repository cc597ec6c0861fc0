use std::collections::HashMap;
use std::env;

/// Paid plans whose Stripe price id comes from `STRIPE_PRICE_<PLAN>`
const PRICED_PLANS: [&str; 2] = ["pro", "business"];

/// OAuth client credentials for one identity or calendar provider
#[derive(Debug, Clone)]
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub database_url: String,
    pub database_max_connections: u32,
    pub allowed_origins: Vec<String>,
    pub environment: String,
    pub jwt_secret: String,
    pub frontend_url: String,
    pub public_api_url: String,
    pub google: Option<OAuthCredentials>,
    pub microsoft: Option<OAuthCredentials>,
    pub microsoft_tenant: String,
    pub apple: Option<OAuthCredentials>,
    pub yahoo: Option<OAuthCredentials>,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub stripe_api_base: String,
    /// Stripe price ids for the paid plans, keyed by plan id
    pub stripe_prices: HashMap<String, String>,
    pub llm_api_key: Option<String>,
    pub llm_api_base: String,
    pub llm_model: String,
    pub enable_cron_jobs: bool,
    pub sync_cron: String,
    pub trial_expiry_cron: String,
    pub token_cleanup_cron: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, String> {
        // Load .env file if it exists (development)
        dotenvy::dotenv().ok();

        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| "Invalid SERVER_PORT")?;

        let database_url = env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set")?;
        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| "Invalid DATABASE_MAX_CONNECTIONS")?;

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let jwt_secret =
            env::var("JWT_SECRET").map_err(|_| "JWT_SECRET must be set for token signing")?;

        let frontend_url = env::var("FRONTEND_URL")
            .unwrap_or_else(|_| "http://localhost:5173".to_string())
            .trim_end_matches('/')
            .to_string();
        let public_api_url = env::var("PUBLIC_API_URL")
            .unwrap_or_else(|_| "http://localhost:8080".to_string())
            .trim_end_matches('/')
            .to_string();

        let enable_cron_jobs = env::var("ENABLE_CRON_JOBS")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .map_err(|_| "Invalid ENABLE_CRON_JOBS")?;

        Ok(Config {
            server_host,
            server_port,
            database_url,
            database_max_connections,
            allowed_origins,
            environment,
            jwt_secret,
            frontend_url,
            public_api_url,
            google: credentials("GOOGLE"),
            microsoft: credentials("MICROSOFT"),
            microsoft_tenant: env::var("MICROSOFT_TENANT").unwrap_or_else(|_| "common".to_string()),
            apple: credentials("APPLE"),
            yahoo: credentials("YAHOO"),
            stripe_secret_key: optional("STRIPE_SECRET_KEY"),
            stripe_webhook_secret: optional("STRIPE_WEBHOOK_SECRET"),
            stripe_api_base: env::var("STRIPE_API_BASE")
                .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
            stripe_prices: stripe_prices(),
            llm_api_key: optional("LLM_API_KEY"),
            llm_api_base: env::var("LLM_API_BASE")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            llm_model: env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            enable_cron_jobs,
            sync_cron: env::var("SYNC_CRON").unwrap_or_else(|_| "0 */15 * * * *".to_string()),
            trial_expiry_cron: env::var("TRIAL_EXPIRY_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
            token_cleanup_cron: env::var("TOKEN_CLEANUP_CRON")
                .unwrap_or_else(|_| "0 30 3 * * *".to_string()),
        })
    }

    /// Get server address as string
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Configured Stripe price for a plan, if any
    pub fn stripe_price_for(&self, plan_id: &str) -> Option<&str> {
        self.stripe_prices.get(plan_id).map(String::as_str)
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// A provider is configured only when both its id and secret are present
fn credentials(prefix: &str) -> Option<OAuthCredentials> {
    let client_id = optional(&format!("{prefix}_CLIENT_ID"))?;
    let client_secret = optional(&format!("{prefix}_CLIENT_SECRET"))?;
    Some(OAuthCredentials {
        client_id,
        client_secret,
    })
}

fn stripe_prices() -> HashMap<String, String> {
    PRICED_PLANS
        .iter()
        .filter_map(|plan| {
            let price = optional(&format!("STRIPE_PRICE_{}", plan.to_ascii_uppercase()))?;
            Some((plan.to_string(), price))
        })
        .collect()
}
