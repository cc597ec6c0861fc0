//! NeuroCal Server Library
//!
//! Calendar backend: accounts and OAuth login, event CRUD, Google/Outlook
//! sync, Stripe billing, an LLM-backed assistant and a small CRM.

pub mod ai;
pub mod auth;
pub mod billing;
pub mod config;
pub mod constants;
pub mod crm;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod scheduler;
pub mod security;
pub mod sync;

pub use config::Config;
pub use db::create_pool;
pub use error::{AppError, Result};
pub use routes::router;

use sqlx::PgPool;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub http: reqwest::Client,
}

impl AppState {
    /// Create a new AppState with the given pool and configuration
    pub fn new(pool: PgPool, config: Config) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("neurocal-server/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self { pool, config, http }
    }
}
