//! Read-side HTTP API.

pub mod caller;
pub mod error;
pub mod handler;

pub use caller::{CallerResolver, RoleHeaderResolver};
pub use error::ApiError;
pub use handler::{DeltaEntryResponse, DeltasResponse};

use crate::delta::DeltaQueryService;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<DeltaQueryService>,
    pub caller_resolver: Arc<dyn CallerResolver>,
}

/// REST API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handler::healthz))
        .route("/deltas", get(handler::get_deltas))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
