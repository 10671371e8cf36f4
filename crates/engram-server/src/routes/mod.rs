pub mod agents;
pub mod audit;
pub mod jobs;
pub mod messages;
pub mod sources;

use axum::Router;

use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/agents", agents::router().merge(messages::router()))
        .nest("/sources", sources::router())
        .nest("/jobs", jobs::router())
        .nest("/audit", audit::router())
}
