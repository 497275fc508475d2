//! HTTP route definitions.

mod conflicts;
mod health;
mod records;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(records::routes())
        .merge(conflicts::routes())
}
