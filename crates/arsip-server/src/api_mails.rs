//! Mail record handlers.
//!
//! Creating a mail allocates its number and inserts the row in one
//! transaction: if the insert fails, the counter increment rolls back with it
//! and the number is never seen by anyone. Editing or deleting a mail never
//! gives its number back.

use crate::api::{like_pattern, ApiError};
use crate::AppState;
use arsip_db::{sequence, Database, DbError, DocumentNumber, Page, Row, Scalar, Transaction};
use axum::{
    body::{Body, Bytes},
    extract::{Extension, Json, Path, Query},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

const MAIL_SELECT: &str = "SELECT m.id, m.mail_number, m.subject, m.description, m.content,
        m.mail_type, m.status, m.mail_date, m.reference_number, m.sender,
        m.recipient, m.category_id, c.name AS category_name,
        c.code AS category_code, m.created_at
     FROM mails m
     JOIN mail_categories c ON c.id = m.category_id";

/// Buffered NDJSON lines between the export query and the response body.
const EXPORT_BUFFER: usize = 64;

/// Rows read per export query. The connection is free between batches.
const EXPORT_BATCH: i64 = 100;

/// Direction of a mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MailType {
    Incoming,
    Outgoing,
}

impl MailType {
    fn as_str(self) -> &'static str {
        match self {
            MailType::Incoming => "INCOMING",
            MailType::Outgoing => "OUTGOING",
        }
    }
}

/// The category a mail is filed under.
#[derive(Debug, Serialize, Deserialize)]
pub struct MailCategoryRef {
    pub id: i64,
    pub name: String,
    pub code: String,
}

/// A mail record as returned by the API.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mail {
    pub id: i64,
    pub mail_number: String,
    pub subject: String,
    pub description: Option<String>,
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub mail_type: String,
    pub status: String,
    pub date: String,
    pub reference_number: Option<String>,
    pub sender: String,
    pub recipient: String,
    pub category: MailCategoryRef,
    pub created_at: String,
}

impl Mail {
    fn from_row(row: &Row) -> Result<Self, DbError> {
        Ok(Self {
            id: row.get("id")?,
            mail_number: row.get("mail_number")?,
            subject: row.get("subject")?,
            description: row.get("description")?,
            content: row.get("content")?,
            mail_type: row.get("mail_type")?,
            status: row.get("status")?,
            date: row.get("mail_date")?,
            reference_number: row.get("reference_number")?,
            sender: row.get("sender")?,
            recipient: row.get("recipient")?,
            category: MailCategoryRef {
                id: row.get("category_id")?,
                name: row.get("category_name")?,
                code: row.get("category_code")?,
            },
            created_at: row.get("created_at")?,
        })
    }
}

/// Request body for mail creation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMailRequest {
    pub subject: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub mail_type: MailType,
    #[serde(default)]
    pub status: Option<String>,
    /// `YYYY-MM-DD` or an RFC 3339 timestamp.
    pub date: String,
    #[serde(default)]
    pub reference_number: Option<String>,
    pub sender: String,
    pub recipient: String,
    pub category_id: i64,
}

/// Request body for `PATCH /api/mails/{id}`. Absent fields are left as they
/// are; blank optional text fields are cleared.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMailRequest {
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, rename = "type")]
    pub mail_type: Option<MailType>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub reference_number: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub category_id: Option<i64>,
}

/// Query parameters for mail listing.
#[derive(Debug, Default, Deserialize)]
pub struct ListMailsQuery {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default, alias = "pageSize")]
    pub limit: Option<u32>,
    #[serde(default, rename = "type")]
    pub mail_type: Option<MailType>,
    #[serde(default)]
    pub status: Option<String>,
    /// Case-insensitive substring matched against subject, mail number,
    /// sender and recipient.
    #[serde(default)]
    pub search: Option<String>,
}

/// One page of mails.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailPage {
    pub items: Vec<Mail>,
    pub page: u32,
    pub limit: u32,
    pub total_items: i64,
    pub total_pages: i64,
}

fn parse_mail_date(raw: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|dt| dt.date_naive()))
        .map_err(|_| ApiError::BadRequest(format!("invalid date '{raw}'")))
}

fn required(field: &str, value: &str) -> Result<String, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

fn optional(value: Option<String>) -> Scalar {
    value
        .filter(|v| !v.trim().is_empty())
        .map_or(Scalar::Null, Scalar::Text)
}

/// Handler for `POST /api/mails`.
///
/// The mail number counter is keyed by the year of the mail's date, so
/// numbering restarts every year. Returns `404` if the category does not
/// exist.
pub async fn create_mail_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<CreateMailRequest>,
) -> Result<(StatusCode, Json<Mail>), ApiError> {
    let subject = required("subject", &payload.subject)?;
    let sender = required("sender", &payload.sender)?;
    let recipient = required("recipient", &payload.recipient)?;
    let date = parse_mail_date(&payload.date)?;
    let year = date.year();
    let month = date.month() as u8;
    let category_id = payload.category_id;

    let params_tail = [
        Scalar::Text(subject),
        optional(payload.description),
        optional(payload.content),
        Scalar::Text(payload.mail_type.as_str().to_string()),
        Scalar::Text(
            payload
                .status
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "DRAFT".to_string()),
        ),
        Scalar::Text(date.format("%Y-%m-%d").to_string()),
        optional(payload.reference_number),
        Scalar::Text(sender),
        Scalar::Text(recipient),
        Scalar::Integer(category_id),
    ];

    let mail = state
        .db
        .run_in_transaction(move |tx| -> Result<Mail, ApiError> {
            let category = tx
                .fetch_one(
                    "SELECT code FROM mail_categories WHERE id = ?1",
                    &[Scalar::Integer(category_id)],
                )?
                .ok_or_else(|| ApiError::NotFound(format!("category {category_id} not found")))?;
            let code: String = category.get("code")?;

            let counter = sequence::allocate(tx, &year.to_string())?;
            let number = DocumentNumber::new(counter, code, month, year)?;

            let mut params = Vec::with_capacity(params_tail.len() + 1);
            params.push(Scalar::Text(number.to_string()));
            params.extend(params_tail);

            let inserted = tx.execute(
                "INSERT INTO mails (mail_number, subject, description, content, mail_type,
                     status, mail_date, reference_number, sender, recipient, category_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                &params,
            )?;

            let row = tx
                .fetch_one(
                    &format!("{MAIL_SELECT} WHERE m.id = ?1"),
                    &[Scalar::Integer(inserted.last_insert_id)],
                )?
                .ok_or_else(|| {
                    ApiError::InternalServerError("created mail not found".to_string())
                })?;
            Ok(Mail::from_row(&row)?)
        })
        .await?;

    tracing::info!(id = mail.id, mail_number = %mail.mail_number, "created mail");
    Ok((StatusCode::CREATED, Json(mail)))
}

/// Handler for `GET /api/mails`.
///
/// Newest mail date first. `page` is clamped to at least 1 and `limit` to
/// `1..=100`.
pub async fn list_mails_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<ListMailsQuery>,
) -> Result<Json<MailPage>, ApiError> {
    let window = Page::new(
        query.page.unwrap_or(Page::default().page()),
        query.limit.unwrap_or(Page::default().limit()),
    );

    let mut filters = Vec::new();
    let mut params = Vec::new();
    if let Some(mail_type) = query.mail_type {
        params.push(Scalar::Text(mail_type.as_str().to_string()));
        filters.push(format!("m.mail_type = ?{}", params.len()));
    }
    if let Some(status) = query.status.filter(|s| !s.is_empty()) {
        params.push(Scalar::Text(status));
        filters.push(format!("m.status = ?{}", params.len()));
    }
    if let Some(search) = query.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        params.push(Scalar::Text(like_pattern(search)));
        let n = params.len();
        filters.push(format!(
            "(m.subject LIKE ?{n} ESCAPE '\\' OR m.mail_number LIKE ?{n} ESCAPE '\\' \
             OR m.sender LIKE ?{n} ESCAPE '\\' OR m.recipient LIKE ?{n} ESCAPE '\\')"
        ));
    }
    let where_clause = if filters.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", filters.join(" AND "))
    };

    let total_items: i64 = state
        .db
        .fetch_one(
            &format!("SELECT COUNT(*) AS total FROM mails m{where_clause}"),
            &params,
        )
        .await?
        .map(|row| row.get("total"))
        .transpose()?
        .unwrap_or(0);

    let limit_idx = params.len() + 1;
    params.extend(window.params());
    let rows = state
        .db
        .fetch_all(
            &format!(
                "{MAIL_SELECT}{where_clause}
                 ORDER BY m.mail_date DESC, m.id DESC
                 LIMIT ?{limit_idx} OFFSET ?{}",
                limit_idx + 1
            ),
            &params,
        )
        .await?;

    let items = rows
        .iter()
        .map(Mail::from_row)
        .collect::<Result<Vec<_>, _>>()?;
    let limit = i64::from(window.limit());

    Ok(Json(MailPage {
        items,
        page: window.page(),
        limit: window.limit(),
        total_items,
        total_pages: (total_items + limit - 1) / limit,
    }))
}

/// Handler for `GET /api/mails/{id}`.
pub async fn get_mail_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Mail>, ApiError> {
    let row = state
        .db
        .fetch_one(
            &format!("{MAIL_SELECT} WHERE m.id = ?1"),
            &[Scalar::Integer(id)],
        )
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("mail {id} not found")))?;

    Ok(Json(Mail::from_row(&row)?))
}

/// Handler for `PATCH /api/mails/{id}`.
///
/// The mail number stays as issued even when the date or category changes.
/// Returns `404` for an unknown mail or an unknown new category.
pub async fn update_mail_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateMailRequest>,
) -> Result<Json<Mail>, ApiError> {
    let mut assignments: Vec<(&'static str, Scalar)> = Vec::new();
    for (column, value) in [
        ("subject", payload.subject),
        ("sender", payload.sender),
        ("recipient", payload.recipient),
        ("status", payload.status),
    ] {
        if let Some(value) = value {
            assignments.push((column, Scalar::Text(required(column, &value)?)));
        }
    }
    for (column, value) in [
        ("description", payload.description),
        ("content", payload.content),
        ("reference_number", payload.reference_number),
    ] {
        if value.is_some() {
            assignments.push((column, optional(value)));
        }
    }
    if let Some(mail_type) = payload.mail_type {
        assignments.push(("mail_type", Scalar::Text(mail_type.as_str().to_string())));
    }
    if let Some(date) = payload.date {
        let date = parse_mail_date(&date)?;
        assignments.push(("mail_date", Scalar::Text(date.format("%Y-%m-%d").to_string())));
    }
    let category_id = payload.category_id;
    if let Some(category_id) = category_id {
        assignments.push(("category_id", Scalar::Integer(category_id)));
    }

    let mail = state
        .db
        .run_in_transaction(move |tx| -> Result<Mail, ApiError> {
            select_mail(tx, id)?
                .ok_or_else(|| ApiError::NotFound(format!("mail {id} not found")))?;

            if let Some(category_id) = category_id {
                tx.fetch_one(
                    "SELECT id FROM mail_categories WHERE id = ?1",
                    &[Scalar::Integer(category_id)],
                )?
                .ok_or_else(|| ApiError::NotFound(format!("category {category_id} not found")))?;
            }

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
                    &format!("UPDATE mails SET {set_clause} WHERE id = ?{}", params.len()),
                    &params,
                )?;
            }

            select_mail(tx, id)?
                .ok_or_else(|| ApiError::InternalServerError("updated mail not found".to_string()))
        })
        .await?;

    tracing::info!(id, mail_number = %mail.mail_number, "updated mail");
    Ok(Json(mail))
}

/// Handler for `DELETE /api/mails/{id}`.
///
/// The year's counter is left alone, so the deleted number is not reissued.
pub async fn delete_mail_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let deleted = state
        .db
        .execute("DELETE FROM mails WHERE id = ?1", &[Scalar::Integer(id)])
        .await?;
    if deleted.affected_rows == 0 {
        return Err(ApiError::NotFound(format!("mail {id} not found")));
    }

    tracing::info!(id, "deleted mail");
    Ok(Json(json!({ "status": "deleted" })))
}

fn select_mail(tx: &Transaction<'_>, id: i64) -> Result<Option<Mail>, DbError> {
    let row = tx.fetch_one(
        &format!("{MAIL_SELECT} WHERE m.id = ?1"),
        &[Scalar::Integer(id)],
    )?;
    row.as_ref().map(Mail::from_row).transpose()
}

#[derive(Debug, Error)]
enum ExportError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("failed to encode mail: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("client disconnected")]
    Disconnected,
}

/// Handler for `GET /api/mails/export`.
///
/// Streams every mail as newline-delimited JSON, oldest first. Rows are read
/// in keyset batches and each batch is released before its lines are sent,
/// so a slow client never holds the connection. Mails committed while the
/// export runs appear in it if they sort after the last line sent.
pub async fn export_mails_handler(Extension(state): Extension<Arc<AppState>>) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(EXPORT_BUFFER);
    let db = state.db.clone();

    tokio::spawn(async move {
        match export_batches(&db, &tx).await {
            Ok(count) => tracing::info!(count, "exported mails"),
            Err(ExportError::Disconnected) => tracing::debug!("mail export abandoned by client"),
            Err(e) => tracing::error!(error = %e, "mail export failed"),
        }
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    ([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response()
}

async fn export_batches(db: &Database, tx: &mpsc::Sender<Bytes>) -> Result<usize, ExportError> {
    let sql = format!(
        "{MAIL_SELECT}
         WHERE m.mail_date > ?1 OR (m.mail_date = ?1 AND m.id > ?2)
         ORDER BY m.mail_date ASC, m.id ASC
         LIMIT ?3"
    );
    let mut last_date = String::new();
    let mut last_id = 0;
    let mut sent = 0;

    loop {
        let rows = db
            .fetch_all(
                &sql,
                &[
                    Scalar::Text(last_date.clone()),
                    Scalar::Integer(last_id),
                    Scalar::Integer(EXPORT_BATCH),
                ],
            )
            .await?;
        let exhausted = (rows.len() as i64) < EXPORT_BATCH;

        for row in &rows {
            let mail = Mail::from_row(row)?;
            let mut line = serde_json::to_vec(&mail)?;
            line.push(b'\n');
            tx.send(Bytes::from(line))
                .await
                .map_err(|_| ExportError::Disconnected)?;
            last_id = mail.id;
            last_date = mail.date;
            sent += 1;
        }

        if exhausted {
            return Ok(sent);
        }
    }
}
