//! Key/value record store: backend contract, in-memory and Postgres
//! implementations, and the typed portfolio facade over the key layout.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use farp_core::{keys, FacultyProfile, Source, SourceRecord, StatisticsSnapshot, SyncSchedule};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

pub const CRATE_NAME: &str = "farp-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store backend unavailable: {0}")]
    Unavailable(String),
}

/// Persistence contract for the whole system.
///
/// Lookups are by exact key or key-prefix scan only; there are no joins and
/// no cross-key transactions. Every write is scoped to a single key.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// All entries whose key starts with `prefix`, ordered by key.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError>;
}

/// Ordered in-memory backend used by tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Postgres backend: one JSONB table keyed by the composite record key.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_records (
                key        TEXT PRIMARY KEY,
                value      JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn escape_like_pattern(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 4);
    for ch in prefix.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

#[async_trait]
impl RecordStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let value = sqlx::query_scalar::<_, Value>("SELECT value FROM kv_records WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv_records (key, value, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (key) DO UPDATE
               SET value = EXCLUDED.value,
                   updated_at = now()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv_records WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT key, value FROM kv_records WHERE key LIKE $1 ESCAPE '\' ORDER BY key"#,
        )
        .bind(escape_like_pattern(prefix))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key")?;
            let value: Value = row.try_get("value")?;
            out.push((key, value));
        }
        Ok(out)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(value)?)
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    Ok(serde_json::from_value(value)?)
}

/// Typed facade over the KV backend that owns the composite-key layout.
///
/// Cheap to clone; constructed once at wiring time and passed into the
/// aggregator, scheduler, and web state.
#[derive(Clone)]
pub struct PortfolioStore {
    inner: Arc<dyn RecordStore>,
}

impl PortfolioStore {
    pub fn new(inner: Arc<dyn RecordStore>) -> Self {
        Self { inner }
    }

    pub async fn profile(&self, user_id: &str) -> Result<Option<FacultyProfile>, StoreError> {
        match self.inner.get(&keys::faculty_profile(user_id)).await? {
            Some(value) => Ok(Some(decode(value)?)),
            None => Ok(None),
        }
    }

    pub async fn put_profile(&self, profile: &FacultyProfile) -> Result<(), StoreError> {
        self.inner
            .put(&keys::faculty_profile(&profile.user_id), encode(profile)?)
            .await
    }

    pub async fn put_record(&self, record: &SourceRecord) -> Result<(), StoreError> {
        self.inner.put(&record.key(), encode(record)?).await
    }

    /// All of the user's records across every source, by prefix scan.
    pub async fn records(&self, user_id: &str) -> Result<Vec<SourceRecord>, StoreError> {
        let entries = self.inner.scan_prefix(&keys::user_records(user_id)).await?;
        debug!(user_id, count = entries.len(), "scanned source records");
        entries.into_iter().map(|(_, v)| decode(v)).collect()
    }

    pub async fn records_for_source(
        &self,
        user_id: &str,
        source: Source,
    ) -> Result<Vec<SourceRecord>, StoreError> {
        let entries = self
            .inner
            .scan_prefix(&keys::source_records(user_id, source))
            .await?;
        entries.into_iter().map(|(_, v)| decode(v)).collect()
    }

    pub async fn stats(&self, user_id: &str) -> Result<Option<StatisticsSnapshot>, StoreError> {
        match self.inner.get(&keys::stats(user_id)).await? {
            Some(value) => Ok(Some(decode(value)?)),
            None => Ok(None),
        }
    }

    pub async fn put_stats(
        &self,
        user_id: &str,
        snapshot: &StatisticsSnapshot,
    ) -> Result<(), StoreError> {
        self.inner.put(&keys::stats(user_id), encode(snapshot)?).await
    }

    pub async fn schedule(&self, user_id: &str) -> Result<Option<SyncSchedule>, StoreError> {
        match self.inner.get(&keys::schedule(user_id)).await? {
            Some(value) => Ok(Some(decode(value)?)),
            None => Ok(None),
        }
    }

    pub async fn put_schedule(&self, schedule: &SyncSchedule) -> Result<(), StoreError> {
        self.inner
            .put(&keys::schedule(&schedule.user_id), encode(schedule)?)
            .await
    }

    /// Every user's schedule, for the sweep's due-user enumeration.
    pub async fn schedules(&self) -> Result<Vec<SyncSchedule>, StoreError> {
        let entries = self.inner.scan_prefix(keys::SCHEDULE_PREFIX).await?;
        entries.into_iter().map(|(_, v)| decode(v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use farp_core::RecordKind;

    fn record(user_id: &str, source: Source, stable_key: &str, citations: u32) -> SourceRecord {
        SourceRecord {
            user_id: user_id.to_string(),
            source,
            stable_key: stable_key.to_string(),
            title: format!("Title {stable_key}"),
            year: 2025,
            citations,
            kind: RecordKind::Journal,
            venue_scope: None,
            venue: None,
            authors: vec![],
            fetched_at: Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).single().unwrap(),
        }
    }

    #[tokio::test]
    async fn memory_store_overwrites_in_place() {
        let store = MemoryStore::new();
        store
            .put("record:u1:scopus:a", serde_json::json!({"v": 1}))
            .await
            .unwrap();
        store
            .put("record:u1:scopus:a", serde_json::json!({"v": 2}))
            .await
            .unwrap();
        assert_eq!(store.len().await, 1);
        let value = store.get("record:u1:scopus:a").await.unwrap().unwrap();
        assert_eq!(value["v"], 2);
    }

    #[tokio::test]
    async fn prefix_scan_returns_all_sources_for_one_user_only() {
        let store = PortfolioStore::new(Arc::new(MemoryStore::new()));
        store
            .put_record(&record("u1", Source::GoogleScholar, "k1", 3))
            .await
            .unwrap();
        store
            .put_record(&record("u1", Source::Orcid, "k2", 0))
            .await
            .unwrap();
        store
            .put_record(&record("u2", Source::GoogleScholar, "k3", 9))
            .await
            .unwrap();

        let records = store.records("u1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.user_id == "u1"));

        let scholar_only = store
            .records_for_source("u1", Source::GoogleScholar)
            .await
            .unwrap();
        assert_eq!(scholar_only.len(), 1);
        assert_eq!(scholar_only[0].stable_key, "k1");
    }

    #[tokio::test]
    async fn scan_is_key_ordered() {
        let store = MemoryStore::new();
        for key in ["record:u1:scopus:b", "record:u1:orcid:a", "record:u1:scopus:a"] {
            store.put(key, Value::Null).await.unwrap();
        }
        let keys: Vec<String> = store
            .scan_prefix("record:u1:")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(
            keys,
            vec![
                "record:u1:orcid:a".to_string(),
                "record:u1:scopus:a".to_string(),
                "record:u1:scopus:b".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn schedules_scan_covers_all_users() {
        let store = PortfolioStore::new(Arc::new(MemoryStore::new()));
        for user in ["u1", "u2"] {
            store
                .put_schedule(&SyncSchedule {
                    user_id: user.to_string(),
                    enabled: true,
                    next_due_at: Utc.with_ymd_and_hms(2026, 8, 2, 2, 0, 0).single().unwrap(),
                    last_run_at: None,
                    last_outcome: None,
                })
                .await
                .unwrap();
        }
        let schedules = store.schedules().await.unwrap();
        assert_eq!(schedules.len(), 2);
    }

    #[tokio::test]
    async fn stats_round_trip_defaults_absent() {
        let store = PortfolioStore::new(Arc::new(MemoryStore::new()));
        assert!(store.stats("u1").await.unwrap().is_none());

        let snapshot = StatisticsSnapshot::default();
        store.put_stats("u1", &snapshot).await.unwrap();
        assert_eq!(store.stats("u1").await.unwrap(), Some(snapshot));
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(escape_like_pattern("record:u_1:"), "record:u\\_1:%");
        assert_eq!(escape_like_pattern("a%b\\c"), "a\\%b\\\\c%");
    }
}
