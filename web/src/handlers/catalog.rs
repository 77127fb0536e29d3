//! Worker read API: queries against the materialized catalog.
//!
//! Reads go straight to the store; they never consult the log, so a
//! just-published command is visible only after the consumer loop has
//! materialized it.

use crate::error::AppError;
use crate::state::WorkerState;
use axum::{Json, extract::Path, extract::State};
use catalog_postgres::{CatalogItem, DeadLetter};
use serde::Serialize;

/// List all catalog items.
///
/// # Endpoint
///
/// ```text
/// GET /products
/// ```
///
/// # Errors
///
/// Returns 500 when the store query fails.
pub async fn list_products(
    State(state): State<WorkerState>,
) -> Result<Json<Vec<CatalogItem>>, AppError> {
    Ok(Json(state.store.list().await?))
}

/// Fetch one catalog item by internal key.
///
/// # Endpoint
///
/// ```text
/// GET /products/{id}
/// ```
///
/// # Errors
///
/// Returns 404 when no row has that key.
pub async fn get_product(
    State(state): State<WorkerState>,
    Path(id): Path<i64>,
) -> Result<Json<CatalogItem>, AppError> {
    state
        .store
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found("product", id))
}

/// A dead-lettered record, shaped for the API.
///
/// The raw payload is rendered lossily as UTF-8; the byte-exact form
/// stays in the store.
#[derive(Debug, Serialize)]
pub struct DeadLetterView {
    /// Entry id.
    pub id: i64,
    /// Stage at which processing failed.
    pub stage: String,
    /// The failed payload, lossily decoded.
    pub payload: String,
    /// Why processing failed.
    pub reason: String,
    /// When the record failed (RFC 3339).
    pub failed_at: String,
}

impl From<DeadLetter> for DeadLetterView {
    fn from(entry: DeadLetter) -> Self {
        Self {
            id: entry.id,
            stage: entry.stage.as_str().to_string(),
            payload: String::from_utf8_lossy(&entry.raw_payload).into_owned(),
            reason: entry.reason,
            failed_at: entry.failed_at.to_rfc3339(),
        }
    }
}

/// List pending dead letters, oldest first.
///
/// # Endpoint
///
/// ```text
/// GET /dead-letters
/// ```
///
/// # Errors
///
/// Returns 500 when the store query fails.
pub async fn list_dead_letters(
    State(state): State<WorkerState>,
) -> Result<Json<Vec<DeadLetterView>>, AppError> {
    let pending = state.dead_letters.list_pending(100).await?;
    Ok(Json(pending.into_iter().map(DeadLetterView::from).collect()))
}
