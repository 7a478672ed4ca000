use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Error as SqlxError, Row};
use std::time::Duration;
use tracing::{error, info};

use super::store::OpStore;
use crate::error::SyncError;
use crate::models::{AcceptedOperation, Edit, Operation};

const CREATE_OPERATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS document_operations (
        doc_id TEXT NOT NULL,
        sequence BIGINT NOT NULL,
        op_id UUID NOT NULL,
        author_id TEXT NOT NULL,
        base_version BIGINT NOT NULL,
        payload JSONB NOT NULL,
        edits JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (doc_id, sequence),
        UNIQUE (doc_id, op_id)
    )
"#;

/// PostgreSQL backed operation store
pub struct DbColab {
    pool: PgPool,
}

impl DbColab {
    /// Create a new database connection pool and make sure the schema exists
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    pub async fn new(database_url: &str) -> Result<Self, SqlxError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await?;

        sqlx::query(CREATE_OPERATIONS_TABLE).execute(&pool).await?;

        info!("Database connection pool created successfully");

        Ok(Self { pool })
    }

    fn log_pool_state(&self, action: &str, doc_id: &str) {
        let pool_idle = self.pool.num_idle() as u32;
        let pool_size = self.pool.size();
        info!(
            "{} operations for doc {}. Pool connections: {} idle, {} in use",
            action,
            doc_id,
            pool_idle,
            pool_size.saturating_sub(pool_idle)
        );
    }

    /// Load every stored operation of a document, ordered by sequence
    pub async fn load_operations(&self, doc_id: &str) -> Result<Vec<AcceptedOperation>, SqlxError> {
        self.log_pool_state("Loading", doc_id);

        let query_sql = r#"
            SELECT sequence, op_id, author_id, base_version, payload, edits, created_at
            FROM document_operations
            WHERE doc_id = $1
            ORDER BY sequence ASC
        "#;

        let rows = sqlx::query(query_sql).bind(doc_id).fetch_all(&self.pool).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let sequence: i64 = row.try_get("sequence")?;
            let base_version: i64 = row.try_get("base_version")?;
            let Json(payload): Json<serde_json::Value> = row.try_get("payload")?;
            let Json(edits): Json<Vec<Edit>> = row.try_get("edits")?;
            let timestamp: DateTime<Utc> = row.try_get("created_at")?;
            records.push(AcceptedOperation {
                sequence: sequence as u64,
                operation: Operation {
                    op_id: row.try_get("op_id")?,
                    doc_id: doc_id.to_string(),
                    author_id: row.try_get("author_id")?,
                    base_version: base_version as u64,
                    payload,
                    timestamp,
                },
                edits,
            });
        }

        Ok(records)
    }

    /// Insert one accepted operation
    pub async fn insert_operation(&self, doc_id: &str, record: &AcceptedOperation) -> Result<(), SqlxError> {
        let query_sql = r#"
            INSERT INTO document_operations
                (doc_id, sequence, op_id, author_id, base_version, payload, edits, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#;

        sqlx::query(query_sql)
            .bind(doc_id)
            .bind(record.sequence as i64)
            .bind(record.operation.op_id)
            .bind(&record.operation.author_id)
            .bind(record.operation.base_version as i64)
            .bind(Json(&record.operation.payload))
            .bind(Json(&record.edits))
            .bind(record.operation.timestamp)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl OpStore for DbColab {
    async fn load(&self, doc_id: &str) -> Result<Vec<AcceptedOperation>, SyncError> {
        self.load_operations(doc_id).await.map_err(|e| {
            error!("Failed to load operations for doc {}: {}", doc_id, e);
            SyncError::from(e)
        })
    }

    async fn append(&self, doc_id: &str, record: &AcceptedOperation) -> Result<(), SyncError> {
        self.insert_operation(doc_id, record).await.map_err(|e| {
            error!(
                "Failed to store operation {} at sequence {} for doc {}: {}",
                record.operation.op_id, record.sequence, doc_id, e
            );
            SyncError::from(e)
        })
    }
}
