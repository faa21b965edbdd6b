pub mod auth;
pub mod conversations;
pub mod devices;
pub mod events;
pub mod middleware;

use courier_core::CoreError;
use courier_core::registry::DeviceRegistry;

use axum::http::StatusCode;
use std::sync::Arc;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub registry: DeviceRegistry,
    pub jwt_secret: String,
    pub operator: String,
    pub password_hash: String,
}

/// Map core errors onto HTTP statuses. Not-found conditions are typed
/// results from the core, never pipeline crashes.
pub fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::DeviceNotFound(_) | CoreError::ConversationNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        CoreError::BackfillUnavailable => StatusCode::CONFLICT,
        CoreError::DeviceClosed => StatusCode::SERVICE_UNAVAILABLE,
    }
}
