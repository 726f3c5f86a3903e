//! PostgreSQL document store
//!
//! Documents live in a single JSONB table keyed by `(collection, id)`.
//! Collections are rows in `nvdsync_collections`. Each bulk item is its own
//! statement so one bad row does not fail the rest of the batch.

use async_trait::async_trait;
use nvdsync_common::WriteError;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::time::Duration;
use tracing::{debug, info};

use super::{BulkItemResult, BulkResponse, DocumentStore, WriteOperation};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS nvdsync_collections (
        name TEXT PRIMARY KEY,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS nvdsync_documents (
        collection TEXT NOT NULL,
        id TEXT NOT NULL,
        doc_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        version BIGINT,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (collection, id)
    )
    "#,
];

const UPSERT: &str = r#"
    INSERT INTO nvdsync_documents (collection, id, doc_type, payload, version)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (collection, id) DO UPDATE SET
        doc_type = EXCLUDED.doc_type,
        payload = EXCLUDED.payload,
        updated_at = NOW()
"#;

const VERSIONED_UPSERT: &str = r#"
    INSERT INTO nvdsync_documents (collection, id, doc_type, payload, version)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (collection, id) DO UPDATE SET
        doc_type = EXCLUDED.doc_type,
        payload = EXCLUDED.payload,
        version = EXCLUDED.version,
        updated_at = NOW()
    WHERE nvdsync_documents.version IS NULL OR nvdsync_documents.version < EXCLUDED.version
"#;

/// [`DocumentStore`] backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and make sure the tables exist
    pub async fn connect(url: &str, max_connections: u32, timeout: Duration) -> Result<Self, WriteError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(timeout)
            .connect(url)
            .await
            .map_err(db_error)?;

        let store = Self { pool };
        store.ensure_schema().await?;
        info!("PostgreSQL document store ready");

        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<(), WriteError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await.map_err(db_error)?;
        }
        Ok(())
    }

    async fn write_one(&self, conn: &mut sqlx::PgConnection, op: &WriteOperation) -> Result<(), String> {
        let version = op
            .version
            .map(i64::try_from)
            .transpose()
            .map_err(|_| format!("version {:?} out of range", op.version))?;

        let sql = if version.is_some() { VERSIONED_UPSERT } else { UPSERT };

        let result = sqlx::query(sql)
            .bind(&op.collection)
            .bind(&op.id)
            .bind(&op.doc_type)
            .bind(Json(&op.payload))
            .bind(version)
            .execute(&mut *conn)
            .await
            .map_err(|e| e.to_string())?;

        if result.rows_affected() == 0 {
            return Err(format!(
                "version conflict, stored version is higher or equal to the one provided [{}]",
                version.unwrap_or_default()
            ));
        }

        Ok(())
    }
}

fn db_error(err: sqlx::Error) -> WriteError {
    WriteError::Transport(err.to_string())
}

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn create_collection(&self, name: &str) -> Result<(), WriteError> {
        let result = sqlx::query("INSERT INTO nvdsync_collections (name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(WriteError::CollectionExists(name.to_string()));
        }
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, WriteError> {
        let payload: Option<Json<Value>> =
            sqlx::query_scalar("SELECT payload FROM nvdsync_documents WHERE collection = $1 AND id = $2")
                .bind(collection)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;

        Ok(payload.map(|Json(value)| value))
    }

    async fn bulk(&self, operations: &[WriteOperation]) -> Result<BulkResponse, WriteError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        let mut items = Vec::with_capacity(operations.len());

        for op in operations {
            let item = match self.write_one(&mut conn, op).await {
                Ok(()) => BulkItemResult::ok(&op.collection, &op.id),
                Err(reason) => BulkItemResult::failed(&op.collection, &op.id, reason),
            };
            items.push(item);
        }

        debug!(operations = operations.len(), "PostgreSQL bulk applied");
        Ok(BulkResponse { items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versioned_upsert_is_guarded() {
        assert!(VERSIONED_UPSERT.contains("nvdsync_documents.version < EXCLUDED.version"));
        assert!(!UPSERT.contains("WHERE"));
    }
}
