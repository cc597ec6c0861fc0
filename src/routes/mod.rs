pub mod ai;
pub mod auth;
pub mod billing;
pub mod calendar;
pub mod crm;
pub mod health;
pub mod oauth;
pub mod sync;
pub mod users;
pub mod validation;
pub mod webhooks;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

pub use health::health_check;

use crate::AppState;

/// Build the full HTTP surface; CORS is layered on by the binary
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/api/auth", auth::routes())
        .nest("/api/users", users::routes())
        .nest("/api/calendar", calendar::routes())
        .nest("/api/sync", sync::routes())
        .nest("/api/billing", billing::routes())
        .nest("/api/ai", ai::routes())
        .nest("/api/crm", crm::routes())
        .nest("/webhooks", webhooks::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
