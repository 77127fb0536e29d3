//! Write-edge handlers: HTTP mutations become published commands.
//!
//! The edge validates shape, publishes exactly one command per request,
//! and answers from the broker ack. It never retries a failed publish
//! (the client owns retry policy) and never reads or writes the database.
//! 202 Accepted is deliberate: accepted onto the log is not yet applied.

use crate::error::AppError;
use crate::state::EdgeState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use catalog_core::command::Command;
use serde::{Deserialize, Serialize};

/// Body of a product create or update request.
///
/// Both operations carry the full attribute set; an update overwrites
/// every field of the addressed row.
#[derive(Debug, Deserialize)]
pub struct ProductRequest {
    /// Business identity of the product.
    pub product_id: String,
    /// Product name.
    pub name: String,
    /// Product description.
    pub description: String,
    /// Product price (non-negative).
    pub price: f64,
    /// Product category.
    pub category: String,
}

/// Acknowledgement that a command landed on the log.
#[derive(Debug, Serialize)]
pub struct PublishedResponse {
    /// The operation that was published.
    pub operation: String,
    /// Partition the command landed on.
    pub partition: i32,
    /// Offset within that partition.
    pub offset: i64,
}

/// Publish a CREATE command.
///
/// # Endpoint
///
/// ```text
/// POST /products
/// ```
///
/// # Errors
///
/// - 422 when the price is negative
/// - 502 when the broker refuses the publish
pub async fn create_product(
    State(state): State<EdgeState>,
    Json(body): Json<ProductRequest>,
) -> Result<(StatusCode, Json<PublishedResponse>), AppError> {
    validate(&body)?;

    let command = Command::create(
        body.product_id,
        body.name,
        body.description,
        body.price,
        body.category,
    );
    publish(&state, command).await
}

/// Publish an UPDATE command addressing the row with internal key `id`.
///
/// # Endpoint
///
/// ```text
/// PUT /products/{id}
/// ```
///
/// # Errors
///
/// - 422 when the price is negative
/// - 502 when the broker refuses the publish
pub async fn update_product(
    State(state): State<EdgeState>,
    Path(id): Path<i64>,
    Json(body): Json<ProductRequest>,
) -> Result<(StatusCode, Json<PublishedResponse>), AppError> {
    validate(&body)?;

    let command = Command::update(
        id,
        body.product_id,
        body.name,
        body.description,
        body.price,
        body.category,
    );
    publish(&state, command).await
}

/// Optional parameters of a delete request.
#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    /// Business identity of the item being deleted. When supplied, the
    /// DELETE is keyed onto the same partition as the item's CREATE and
    /// UPDATE commands, so it cannot be applied ahead of them.
    pub product_id: Option<String>,
}

/// Publish a DELETE command addressing the row with internal key `id`.
///
/// Clients that know the item's business identity should pass it as the
/// `product_id` query parameter so the delete stays ordered with the
/// item's earlier commands; without it the record publishes unkeyed.
///
/// # Endpoint
///
/// ```text
/// DELETE /products/{id}?product_id={identity}
/// ```
///
/// # Errors
///
/// Returns 502 when the broker refuses the publish.
pub async fn delete_product(
    State(state): State<EdgeState>,
    Path(id): Path<i64>,
    Query(params): Query<DeleteParams>,
) -> Result<(StatusCode, Json<PublishedResponse>), AppError> {
    let command = match params.product_id {
        Some(product_id) => Command::delete_keyed(id, product_id),
        None => Command::delete(id),
    };
    publish(&state, command).await
}

fn validate(body: &ProductRequest) -> Result<(), AppError> {
    if body.price < 0.0 {
        return Err(AppError::validation("price must be non-negative"));
    }
    if body.product_id.is_empty() {
        return Err(AppError::validation("product_id must not be empty"));
    }
    Ok(())
}

/// Single publish attempt, ack-gated. A refusal surfaces to the client
/// as 502; nothing is buffered or retried on its behalf.
async fn publish(
    state: &EdgeState,
    command: Command,
) -> Result<(StatusCode, Json<PublishedResponse>), AppError> {
    let operation = command.operation.as_tag().to_string();

    let ack = state
        .bus
        .publish(&state.topic, &command)
        .await
        .map_err(|e| AppError::bad_gateway(format!("failed to publish command: {e}")))?;

    tracing::info!(
        operation = %operation,
        partition = ack.partition,
        offset = ack.offset,
        "Command published"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishedResponse {
            operation,
            partition: ack.partition,
            offset: ack.offset,
        }),
    ))
}
