use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as _};
use std::str::FromStr;
use tracing::info;

use super::{Row, SqlStore};
use crate::config::DataStoreConfig;
use crate::error::{StoreError, StoreResult};

/// SQLite-backed analytics store.
///
/// The collector/scheduler side of the system owns writes to this file;
/// the orchestrator opens it read-only.
#[derive(Clone)]
pub struct SqliteDataStore {
    pool: SqlitePool,
}

impl SqliteDataStore {
    /// Open the analytics database read-only
    pub async fn new(config: &DataStoreConfig) -> StoreResult<Self> {
        let database_url = format!("sqlite://{}", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StoreError::Sql {
                message: format!("Invalid data store URL: {}", e),
            })?
            .read_only(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Sql {
                message: format!("Failed to open data store: {}", e),
            })?;

        info!(path = %config.path.display(), "Analytics data store opened");

        Ok(Self { pool })
    }

    /// Create an in-memory store (writable, for tests and fixtures)
    pub async fn new_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
            StoreError::Sql {
                message: format!("Invalid in-memory URL: {}", e),
            }
        })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Sql {
                message: format!("Failed to open in-memory store: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// Get the underlying pool (fixture seeding in tests)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn convert_row(row: &SqliteRow) -> Row {
        let mut out = Row::new();
        for column in row.columns() {
            let idx = column.ordinal();
            let value = if let Ok(Some(i)) = row.try_get::<Option<i64>, _>(idx) {
                serde_json::json!(i)
            } else if let Ok(Some(f)) = row.try_get::<Option<f64>, _>(idx) {
                serde_json::json!(f)
            } else if let Ok(Some(s)) = row.try_get::<Option<String>, _>(idx) {
                serde_json::json!(s)
            } else {
                serde_json::Value::Null
            };
            out.insert(column.name(), value);
        }
        out
    }
}

#[async_trait]
impl SqlStore for SqliteDataStore {
    async fn query(&self, sql: &str, binds: &[String]) -> StoreResult<Vec<Row>> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = query.bind(bind);
        }

        let rows = query.fetch_all(&self.pool).await?;

        Ok(rows.iter().map(Self::convert_row).collect())
    }
}
