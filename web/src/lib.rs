//! # Catalog Web
//!
//! The two HTTP surfaces of the catalog pipeline:
//!
//! - the **edge** ([`edge_router`]): accepts product mutations and
//!   publishes them as commands, one publish per request, answering
//!   from the broker ack
//! - the **worker read API** ([`worker_router`]): serves the
//!   materialized catalog and the pending dead letters
//!
//! The corresponding binaries live in `src/bin/edge.rs` and
//! `src/bin/worker.rs`; the worker binary also runs the consumer loop.

pub mod error;
pub mod handlers;
pub mod state;

pub use error::AppError;
pub use state::{EdgeState, WorkerState};

use axum::Router;
use axum::routing::{delete, get, post, put};
use tower_http::trace::TraceLayer;

/// Build the write-edge router.
#[must_use]
pub fn edge_router(state: EdgeState) -> Router {
    Router::new()
        .route("/products", post(handlers::products::create_product))
        .route("/products/:id", put(handlers::products::update_product))
        .route("/products/:id", delete(handlers::products::delete_product))
        .route("/health", get(handlers::health::health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Build the worker read-API router.
#[must_use]
pub fn worker_router(state: WorkerState) -> Router {
    Router::new()
        .route("/products", get(handlers::catalog::list_products))
        .route("/products/:id", get(handlers::catalog::get_product))
        .route("/dead-letters", get(handlers::catalog::list_dead_letters))
        .route("/health", get(handlers::health::health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use catalog_core::command::{Command, Operation};
    use catalog_core::command_bus::{
        CommandBus, CommandBusError, CommandStream, PublishAck,
    };
    use catalog_core::config::PipelineConfig;
    use catalog_testing::InMemoryCommandBus;
    use serde_json::json;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;

    fn edge_server(bus: Arc<dyn CommandBus>) -> TestServer {
        let state = EdgeState::new(&PipelineConfig::default(), bus);
        TestServer::new(edge_router(state)).expect("server should build")
    }

    #[tokio::test]
    async fn create_publishes_a_keyed_create_command() {
        let bus = InMemoryCommandBus::new();
        let server = edge_server(Arc::new(bus.clone()));

        let response = server
            .post("/products")
            .json(&json!({
                "product_id": "p1",
                "name": "Widget",
                "description": "d",
                "price": 9.99,
                "category": "tools"
            }))
            .await;
        response.assert_status(StatusCode::ACCEPTED);

        let published = bus.published("catalog-commands");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key_str(), Some("p1"));

        let command = Command::decode(&published[0].payload).unwrap();
        assert_eq!(command.operation, Operation::Create);
        assert_eq!(command.name.as_deref(), Some("Widget"));
    }

    #[tokio::test]
    async fn update_carries_the_internal_key() {
        let bus = InMemoryCommandBus::new();
        let server = edge_server(Arc::new(bus.clone()));

        let response = server
            .put("/products/7")
            .json(&json!({
                "product_id": "p1",
                "name": "Widget2",
                "description": "d2",
                "price": 12.5,
                "category": "tools"
            }))
            .await;
        response.assert_status(StatusCode::ACCEPTED);

        let command = Command::decode(&bus.published("catalog-commands")[0].payload).unwrap();
        assert_eq!(command.operation, Operation::Update);
        assert_eq!(command.id, Some(7));
    }

    #[tokio::test]
    async fn delete_publishes_without_a_body() {
        let bus = InMemoryCommandBus::new();
        let server = edge_server(Arc::new(bus.clone()));

        let response = server.delete("/products/7").await;
        response.assert_status(StatusCode::ACCEPTED);

        let command = Command::decode(&bus.published("catalog-commands")[0].payload).unwrap();
        assert_eq!(command.operation, Operation::Delete);
        assert_eq!(command.id, Some(7));
    }

    #[tokio::test]
    async fn delete_with_identity_is_keyed_onto_the_item_partition() {
        let bus = InMemoryCommandBus::new();
        let server = edge_server(Arc::new(bus.clone()));

        let response = server
            .delete("/products/7")
            .add_query_param("product_id", "p1")
            .await;
        response.assert_status(StatusCode::ACCEPTED);

        // Keyed like the item's CREATE/UPDATE, so it cannot overtake them.
        let published = bus.published("catalog-commands");
        assert_eq!(published[0].key_str(), Some("p1"));

        let command = Command::decode(&published[0].payload).unwrap();
        assert_eq!(command.operation, Operation::Delete);
        assert_eq!(command.id, Some(7));
        assert_eq!(command.product_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn negative_price_is_rejected_before_publishing() {
        let bus = InMemoryCommandBus::new();
        let server = edge_server(Arc::new(bus.clone()));

        let response = server
            .post("/products")
            .json(&json!({
                "product_id": "p1",
                "name": "Widget",
                "description": "d",
                "price": -1.0,
                "category": "tools"
            }))
            .await;
        response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        assert!(bus.published("catalog-commands").is_empty());
    }

    /// A bus whose publishes always fail, for exercising the 502 path.
    struct RefusingBus;

    impl CommandBus for RefusingBus {
        fn publish(
            &self,
            topic: &str,
            _command: &Command,
        ) -> Pin<Box<dyn Future<Output = Result<PublishAck, CommandBusError>> + Send + '_>>
        {
            let topic = topic.to_string();
            Box::pin(async move {
                Err(CommandBusError::PublishFailed {
                    topic,
                    reason: "broker unreachable".to_string(),
                })
            })
        }

        fn subscribe(
            &self,
            topic: &str,
            _group: &str,
        ) -> Pin<Box<dyn Future<Output = Result<CommandStream, CommandBusError>> + Send + '_>>
        {
            let topic = topic.to_string();
            Box::pin(async move {
                Err(CommandBusError::SubscriptionFailed {
                    topic,
                    reason: "broker unreachable".to_string(),
                })
            })
        }
    }

    #[tokio::test]
    async fn publish_refusal_surfaces_as_bad_gateway() {
        let server = edge_server(Arc::new(RefusingBus));

        let response = server.delete("/products/1").await;
        response.assert_status(StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn health_is_served_on_the_edge() {
        let bus = InMemoryCommandBus::new();
        let server = edge_server(Arc::new(bus));

        let response = server.get("/health").await;
        response.assert_status_ok();
    }
}
