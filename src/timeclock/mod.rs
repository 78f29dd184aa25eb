//! Job-site timeclock: QR scan resolution, clock-in/out with breaks,
//! geofence checks, supervisor approval and the dashboard aggregates.

pub mod dto;
pub mod geofence;
pub mod handlers;
pub mod memory;
pub mod qr;
pub mod repo;
pub mod repo_types;
pub mod services;
pub mod state_machine;
pub mod stats;

use crate::state::AppState;
use axum::Router;

pub fn router() -> Router<AppState> {
    Router::new().nest(
        "/timeclock",
        Router::new()
            .merge(handlers::job_site_routes())
            .merge(handlers::clock_routes()),
    )
}
