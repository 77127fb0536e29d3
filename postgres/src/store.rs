//! The materialized catalog table.
//!
//! `catalog_items` holds current queryable state, derived from the command
//! log by the materializer. The internal `id` key is assigned by the store
//! on insert; `product_id` is the business identity and carries a UNIQUE
//! constraint so duplicate CREATE deliveries collapse into an upsert
//! instead of duplicate rows.
//!
//! Write operations take an explicit transaction: the materializer opens
//! one unit of work per record and commits (or rolls back) before moving
//! to the next record. Read-side queries run against the pool directly.

use crate::StoreError;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

/// One materialized catalog row.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct CatalogItem {
    /// Internal numeric key, assigned by the store.
    pub id: i64,
    /// Business identity.
    pub product_id: String,
    /// Item name.
    pub name: String,
    /// Item description.
    pub description: String,
    /// Item price.
    pub price: f64,
    /// Item category.
    pub category: String,
}

/// The full attribute set written by CREATE and UPDATE.
///
/// Both operations write every field (full overwrite, not merge), so the
/// store takes them as one borrowed bundle.
#[derive(Debug, Clone, Copy)]
pub struct ItemFields<'a> {
    /// Business identity.
    pub product_id: &'a str,
    /// Item name.
    pub name: &'a str,
    /// Item description.
    pub description: &'a str,
    /// Item price.
    pub price: f64,
    /// Item category.
    pub category: &'a str,
}

/// Postgres-backed catalog store.
#[derive(Clone)]
pub struct CatalogStore {
    pool: PgPool,
}

impl CatalogStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database and create a store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Database(format!("failed to connect: {e}")))?;

        Ok(Self::new(pool))
    }

    /// Create the catalog table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if table creation fails.
    pub async fn bootstrap(&self) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS catalog_items (
                id BIGSERIAL PRIMARY KEY,
                product_id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                price DOUBLE PRECISION NOT NULL,
                category TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("failed to bootstrap catalog_items: {e}")))?;

        tracing::info!("Catalog table ready");
        Ok(())
    }

    /// Begin a transaction for one unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a connection cannot be acquired.
    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(format!("failed to begin transaction: {e}")))
    }

    /// Insert an item, or overwrite it if the business identity already
    /// exists. Returns the row's internal key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the statement fails.
    pub async fn upsert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        fields: ItemFields<'_>,
    ) -> Result<i64, StoreError> {
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO catalog_items (product_id, name, description, price, category)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (product_id) DO UPDATE
            SET name = EXCLUDED.name,
                description = EXCLUDED.description,
                price = EXCLUDED.price,
                category = EXCLUDED.category,
                updated_at = now()
            RETURNING id
            ",
        )
        .bind(fields.product_id)
        .bind(fields.name)
        .bind(fields.description)
        .bind(fields.price)
        .bind(fields.category)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| StoreError::Database(format!("failed to upsert item: {e}")))?;

        Ok(id)
    }

    /// Overwrite every attribute field of the row with internal key `id`.
    ///
    /// Returns `false` when no row matched (a no-op for the caller to log,
    /// not an error).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the statement fails.
    pub async fn overwrite(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
        fields: ItemFields<'_>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE catalog_items
            SET product_id = $2,
                name = $3,
                description = $4,
                price = $5,
                category = $6,
                updated_at = now()
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(fields.product_id)
        .bind(fields.name)
        .bind(fields.description)
        .bind(fields.price)
        .bind(fields.category)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::Database(format!("failed to overwrite item: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove the row with internal key `id`.
    ///
    /// Returns `false` when no row matched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the statement fails.
    pub async fn remove(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM catalog_items WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Database(format!("failed to remove item: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// List all catalog items, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list(&self) -> Result<Vec<CatalogItem>, StoreError> {
        sqlx::query_as(
            "SELECT id, product_id, name, description, price, category
             FROM catalog_items ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("failed to list items: {e}")))
    }

    /// Fetch one item by internal key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn get(&self, id: i64) -> Result<Option<CatalogItem>, StoreError> {
        sqlx::query_as(
            "SELECT id, product_id, name, description, price, category
             FROM catalog_items WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("failed to get item: {e}")))
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}
