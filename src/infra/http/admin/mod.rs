mod cache;
mod state;

pub use state::AdminState;

use axum::{
    Router, middleware,
    routing::{get, post, put},
};

use super::middleware::log_responses;

/// Administrative surface over the query result cache.
///
/// Index paths accept a comma-separated list for stats and clear.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/_qrc/health", get(cache::health))
        .route("/_qrc/stats", get(cache::stats_all))
        .route("/_qrc/clear", post(cache::clear_all))
        .route("/{index}/_qrc/stats", get(cache::stats_indices))
        .route("/{index}/_qrc/clear", post(cache::clear_indices))
        .route("/{index}/_qrc/settings", put(cache::update_index_settings))
        .layer(middleware::from_fn(log_responses))
        .with_state(state)
}
