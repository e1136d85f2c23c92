//! Shared API types and the sequence handlers.

use crate::AppState;
use arsip_db::{DbError, StatementError};
use axum::{
    extract::{Extension, Json, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        if let DbError::InvalidDocumentNumber(msg) = &e {
            return ApiError::BadRequest(msg.clone());
        }
        if let Some(stmt) = e.as_statement() {
            if stmt.is_unique_violation() {
                return ApiError::Conflict(constraint_message(stmt));
            }
            if stmt.is_foreign_key_violation() {
                return ApiError::BadRequest(constraint_message(stmt));
            }
        }

        tracing::error!(error = %e, "database operation failed");
        ApiError::InternalServerError("database error".to_string())
    }
}

/// The driver's message without the SQL text, which stays in the logs.
fn constraint_message(stmt: &StatementError) -> String {
    tracing::debug!(sql = %stmt.sql, error = %stmt.source, "constraint violation");
    stmt.source.to_string()
}

/// Wraps user input as a `%...%` pattern for `LIKE ... ESCAPE '\'`, so `%`
/// and `_` in the input match themselves.
pub(crate) fn like_pattern(search: &str) -> String {
    let mut pattern = String::with_capacity(search.len() + 2);
    pattern.push('%');
    for c in search.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Response body for sequence inspection.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceResponse {
    /// The scope key that was looked up.
    pub scope_key: String,
    /// Last value handed out for the scope, 0 if none has been.
    pub value: i64,
}

/// Handler for `GET /api/sequences/{scope_key}`.
pub async fn get_sequence_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(scope_key): Path<String>,
) -> Result<Json<SequenceResponse>, ApiError> {
    let value = state
        .db
        .current_sequence_value(&scope_key)
        .await?
        .unwrap_or(0);

    Ok(Json(SequenceResponse { scope_key, value }))
}
