//! Arsip server library logic.

pub mod api;
pub mod api_categories;
pub mod api_mails;
pub mod config;

use arsip_db::Database;
use axum::{
    routing::get,
    Extension, Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The process-wide database. Opened lazily on the first request.
    pub db: Database,
}

/// Health check handler.
///
/// Returns `200 OK` with server status and version. Does not touch the
/// database, so it answers before the store has been opened.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/mails",
            get(api_mails::list_mails_handler).post(api_mails::create_mail_handler),
        )
        .route("/api/mails/export", get(api_mails::export_mails_handler))
        .route(
            "/api/mails/{id}",
            get(api_mails::get_mail_handler)
                .patch(api_mails::update_mail_handler)
                .delete(api_mails::delete_mail_handler),
        )
        .route(
            "/api/mail-categories",
            get(api_categories::list_categories_handler)
                .post(api_categories::create_category_handler),
        )
        .route(
            "/api/mail-categories/{id}",
            get(api_categories::get_category_handler)
                .patch(api_categories::update_category_handler)
                .delete(api_categories::delete_category_handler),
        )
        .route(
            "/api/sequences/{scope_key}",
            get(api::get_sequence_handler),
        )
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
