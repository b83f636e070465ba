use crate::types::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::debug;

/// Durable key-value storage consumed by the pipeline. Only get/set plus
/// an atomic counter are exposed; the engine behind them is a collaborator
/// detail.
///
/// Namespaces in use: `poll` (cursor), `topic/{kind}/{topicId}`,
/// `redditAvatar/{author}`, and `messageCount/{userId}` (counter owned by
/// the activity-role feature, which lives outside this pipeline).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: String) -> Result<()>;
    /// Add `by` to a numeric key (initializing at zero) and return the
    /// new value, atomically.
    async fn increment(&self, key: &str, by: i64) -> Result<i64>;
}

impl dyn KvStore {
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn put_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        self.put(key, serde_json::to_string(value)?).await
    }
}

/// SQLite-backed store: one `kv` table, JSON values as text.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url`, e.g.
    /// `sqlite://relay.db`.
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
            .execute(&pool)
            .await?;
        debug!(url, "opened state database");
        Ok(Self { pool })
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        let value: i64 = sqlx::query_scalar(
            "INSERT INTO kv (key, value) VALUES (?1, CAST(?2 AS TEXT)) \
             ON CONFLICT(key) DO UPDATE SET \
               value = CAST(CAST(kv.value AS INTEGER) + ?2 AS TEXT) \
             RETURNING CAST(value AS INTEGER)",
        )
        .bind(key)
        .bind(by)
        .fetch_one(&self.pool)
        .await?;
        Ok(value)
    }
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        self.map.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        let mut map = self.map.lock().await;
        let current = map
            .get(key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + by;
        map.insert(key.to_string(), next.to_string());
        Ok(next)
    }
}
