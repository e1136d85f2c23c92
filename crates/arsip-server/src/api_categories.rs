//! Mail category handlers.
//!
//! A category's code becomes the second segment of every mail number filed
//! under it, so codes are validated with the same rules the number formatter
//! applies.

use crate::api::{like_pattern, ApiError};
use crate::AppState;
use arsip_db::{validate_category_code, DbError, Row, Scalar, Transaction};
use axum::{
    extract::{Extension, Json, Path, Query},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

const CATEGORY_COLUMNS: &str = "id, name, code, description, created_at";

/// A mail category as returned by the API.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub description: Option<String>,
    pub created_at: String,
}

impl Category {
    fn from_row(row: &Row) -> Result<Self, DbError> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            code: row.get("code")?,
            description: row.get("description")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Request body for category creation.
#[derive(Debug, Deserialize)]
pub struct CreateCategoryRequest {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Request body for `PATCH /api/mail-categories/{id}`. Absent fields are left
/// as they are; a blank description clears it.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateCategoryRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Query parameters for category listing.
#[derive(Debug, Default, Deserialize)]
pub struct ListCategoriesQuery {
    /// Case-insensitive substring matched against name and code.
    #[serde(default)]
    pub search: Option<String>,
}

/// Handler for `GET /api/mail-categories`.
pub async fn list_categories_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<ListCategoriesQuery>,
) -> Result<Json<Vec<Category>>, ApiError> {
    let rows = match query.search.as_deref().map(str::trim) {
        Some(search) if !search.is_empty() => {
            let pattern = Scalar::Text(like_pattern(search));
            state
                .db
                .fetch_all(
                    &format!(
                        "SELECT {CATEGORY_COLUMNS} FROM mail_categories
                         WHERE name LIKE ?1 ESCAPE '\\' OR code LIKE ?1 ESCAPE '\\'
                         ORDER BY name ASC"
                    ),
                    &[pattern],
                )
                .await?
        }
        _ => {
            state
                .db
                .fetch_all(
                    &format!("SELECT {CATEGORY_COLUMNS} FROM mail_categories ORDER BY name ASC"),
                    &[],
                )
                .await?
        }
    };

    let categories = rows
        .iter()
        .map(Category::from_row)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(categories))
}

/// Handler for `POST /api/mail-categories`.
///
/// Returns `409 Conflict` when the code is already taken.
pub async fn create_category_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<CreateCategoryRequest>,
) -> Result<(StatusCode, Json<Category>), ApiError> {
    let name = payload.name.trim();
    let code = payload.code.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("name is required".to_string()));
    }
    validate_category_code(code)?;

    let description = payload
        .description
        .filter(|d| !d.trim().is_empty())
        .map_or(Scalar::Null, Scalar::Text);

    let inserted = state
        .db
        .execute(
            "INSERT INTO mail_categories (name, code, description) VALUES (?1, ?2, ?3)",
            &[
                Scalar::Text(name.to_string()),
                Scalar::Text(code.to_string()),
                description,
            ],
        )
        .await?;

    let category = fetch_category(&state, inserted.last_insert_id)
        .await?
        .ok_or_else(|| ApiError::InternalServerError("created category not found".to_string()))?;

    tracing::info!(id = category.id, code = %category.code, "created mail category");
    Ok((StatusCode::CREATED, Json(category)))
}

/// Handler for `GET /api/mail-categories/{id}`.
pub async fn get_category_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Category>, ApiError> {
    fetch_category(&state, id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("category {id} not found")))
}

/// Handler for `PATCH /api/mail-categories/{id}`.
///
/// Renaming a code does not touch mail numbers already issued under the old
/// one. Returns `409 Conflict` when the new code is taken.
pub async fn update_category_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateCategoryRequest>,
) -> Result<Json<Category>, ApiError> {
    let mut assignments: Vec<(&'static str, Scalar)> = Vec::new();
    if let Some(name) = payload.name {
        let name = name.trim();
        if name.is_empty() {
            return Err(ApiError::BadRequest("name is required".to_string()));
        }
        assignments.push(("name", Scalar::Text(name.to_string())));
    }
    if let Some(code) = payload.code {
        let code = code.trim();
        validate_category_code(code)?;
        assignments.push(("code", Scalar::Text(code.to_string())));
    }
    if let Some(description) = payload.description {
        let value = if description.trim().is_empty() {
            Scalar::Null
        } else {
            Scalar::Text(description)
        };
        assignments.push(("description", value));
    }

    let category = state
        .db
        .run_in_transaction(move |tx| -> Result<Category, ApiError> {
            select_category(tx, id)?
                .ok_or_else(|| ApiError::NotFound(format!("category {id} not found")))?;

            if !assignments.is_empty() {
                let set_clause = assignments
                    .iter()
                    .enumerate()
                    .map(|(i, (column, _))| format!("{column} = ?{}", i + 1))
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut params: Vec<Scalar> =
                    assignments.into_iter().map(|(_, value)| value).collect();
                params.push(Scalar::Integer(id));
                tx.execute(
                    &format!(
                        "UPDATE mail_categories SET {set_clause} WHERE id = ?{}",
                        params.len()
                    ),
                    &params,
                )?;
            }

            select_category(tx, id)?.ok_or_else(|| {
                ApiError::InternalServerError("updated category not found".to_string())
            })
        })
        .await?;

    tracing::info!(id, code = %category.code, "updated mail category");
    Ok(Json(category))
}

/// Handler for `DELETE /api/mail-categories/{id}`.
///
/// A category that still has mails filed under it cannot be deleted.
pub async fn delete_category_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    state
        .db
        .run_in_transaction(move |tx| -> Result<(), ApiError> {
            select_category(tx, id)?
                .ok_or_else(|| ApiError::NotFound(format!("category {id} not found")))?;

            let mails: i64 = tx
                .fetch_one(
                    "SELECT COUNT(*) AS total FROM mails WHERE category_id = ?1",
                    &[Scalar::Integer(id)],
                )?
                .map(|row| row.get("total"))
                .transpose()?
                .unwrap_or(0);
            if mails > 0 {
                return Err(ApiError::Conflict(format!(
                    "category {id} still has {mails} mail(s)"
                )));
            }

            tx.execute(
                "DELETE FROM mail_categories WHERE id = ?1",
                &[Scalar::Integer(id)],
            )?;
            Ok(())
        })
        .await?;

    tracing::info!(id, "deleted mail category");
    Ok(Json(json!({ "status": "deleted" })))
}

fn select_category(tx: &Transaction<'_>, id: i64) -> Result<Option<Category>, DbError> {
    let row = tx.fetch_one(
        &format!("SELECT {CATEGORY_COLUMNS} FROM mail_categories WHERE id = ?1"),
        &[Scalar::Integer(id)],
    )?;
    row.as_ref().map(Category::from_row).transpose()
}

async fn fetch_category(state: &AppState, id: i64) -> Result<Option<Category>, ApiError> {
    let row = state
        .db
        .fetch_one(
            &format!("SELECT {CATEGORY_COLUMNS} FROM mail_categories WHERE id = ?1"),
            &[Scalar::Integer(id)],
        )
        .await?;

    Ok(row.as_ref().map(Category::from_row).transpose()?)
}
