//! Application error type and its HTTP mapping.
//!
//! Every handler returns [`AppResult`]. Guard failures from the timeclock
//! state machine surface as [`AppError::InvalidState`] with the specific
//! guard in the `reason` field, so clients can render an accurate message.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::timeclock::{geofence::GeofenceRejection, state_machine::TransitionError};

pub type AppResult<T> = Result<T, AppError>;

/// Uniqueness conflicts detected by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Conflict {
    #[error("user is already clocked in; clock out first")]
    AlreadyClockedIn { active_time_entry_id: Option<Uuid> },
    #[error("rejected entry already has a correction")]
    AlreadyCorrected,
    #[error("qr token already bound to another job site")]
    QrTokenTaken,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication required: {0}")]
    Unauthenticated(String),

    #[error("not allowed: {0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(Conflict),

    #[error("{0}")]
    InvalidState(#[from] TransitionError),

    #[error("{0}")]
    Geofence(#[from] GeofenceRejection),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AppError::Unauthorized(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) | AppError::InvalidState(_) => StatusCode::CONFLICT,
            AppError::Geofence(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable kind, serialized as `error`.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::Unauthenticated(_) => "unauthenticated",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::InvalidState(_) => "invalid_state",
            AppError::Geofence(_) => "geofence_rejected",
            AppError::Database(_) | AppError::Internal(_) => "internal_error",
        }
    }
}

impl From<Conflict> for AppError {
    fn from(c: Conflict) -> Self {
        AppError::Conflict(c)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let body = match &self {
            AppError::Conflict(conflict) => {
                let mut body = json!({ "error": kind, "message": self.to_string() });
                if let (Some(obj), Ok(serde_json::Value::Object(extra))) =
                    (body.as_object_mut(), serde_json::to_value(conflict))
                {
                    obj.extend(extra);
                }
                body
            }
            AppError::InvalidState(guard) => json!({
                "error": kind,
                "reason": guard.reason(),
                "state": guard.state(),
                "message": self.to_string(),
            }),
            AppError::Geofence(rejection) => json!({
                "error": kind,
                "reason": rejection.reason(),
                "geofence": rejection.verdict(),
                "message": self.to_string(),
            }),
            AppError::Database(e) => {
                error!(target: "database", error = %e, "database error");
                json!({ "error": kind, "message": "database error" })
            }
            AppError::Internal(e) => {
                error!(target: "internal", error = %e, "internal error");
                json!({ "error": kind, "message": "internal server error" })
            }
            _ => json!({ "error": kind, "message": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
