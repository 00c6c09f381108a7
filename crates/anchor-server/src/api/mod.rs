//! JSON HTTP API.

mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use tower_http::trace::TraceLayer;

use crate::context::AppContext;

pub use error::ApiError;

/// Build the API router over a shared context.
pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/task/{task_id}", get(routes::task_status))
        .route(
            "/account/{account}/{region}",
            post(routes::refresh_account)
                .get(routes::get_account)
                .delete(routes::delete_account),
        )
        .route(
            "/account/{account}/{region}/server/{server_id}",
            put(routes::add_server).get(routes::get_server),
        )
        .route("/lookup", post(routes::submit_lookup))
        .route("/lookup/{task_id}", get(routes::lookup_result))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
