//! Shared key-value store for agent coordination, backed by SQLite.
//!
//! Keys follow the `agent_id.purpose.detail` convention; the namespace
//! column holds the first two dotted segments and exists purely for
//! filtering. Values are JSON; plain strings are stored bare for backward
//! compatibility with older writers. Expired rows are filtered on read and
//! removed by a lazy sweep.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ksi_protocol::commands::KvScope;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS agent_shared_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    namespace TEXT,
    owner_agent_id TEXT NOT NULL,
    scope TEXT DEFAULT 'shared',
    created_at TEXT NOT NULL,
    expires_at TEXT,
    metadata TEXT
);
CREATE INDEX IF NOT EXISTS idx_namespace ON agent_shared_state(namespace);
CREATE INDEX IF NOT EXISTS idx_owner ON agent_shared_state(owner_agent_id);
CREATE INDEX IF NOT EXISTS idx_expires ON agent_shared_state(expires_at);
";

/// One row of the shared store, decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvEntry {
    pub key: String,
    pub value: Value,
    pub namespace: Option<String>,
    pub owner_agent_id: String,
    pub scope: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl KvEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match &self.expires_at {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc) <= now)
                .unwrap_or(false),
            None => false,
        }
    }
}

/// SQLite-backed store. Every call runs the blocking SQLite work on the
/// blocking pool so connection handlers never stall the runtime.
#[derive(Clone)]
pub struct SharedStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SharedStateStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database {}", path.display()))?;
        conn.execute_batch(SCHEMA)
            .context("failed to apply agent_shared_state schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory SQLite")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Namespace is the first two dotted segments of the key, or nothing
    /// for single-segment keys.
    pub fn namespace_of(key: &str) -> Option<String> {
        let parts: Vec<&str> = key.split('.').collect();
        if parts.len() >= 2 {
            Some(format!("{}.{}", parts[0], parts[1]))
        } else {
            None
        }
    }

    /// Upsert one entry. Returns the stored row as written.
    pub async fn set(
        &self,
        key: String,
        value: Value,
        owner_agent_id: String,
        scope: KvScope,
        expires_at: Option<String>,
        metadata: Option<Value>,
    ) -> Result<KvEntry> {
        if let Some(raw) = &expires_at {
            DateTime::parse_from_rfc3339(raw)
                .with_context(|| format!("expires_at is not RFC-3339: {raw}"))?;
        }
        let entry = KvEntry {
            namespace: Self::namespace_of(&key),
            key,
            value,
            owner_agent_id,
            scope: scope.as_str().to_string(),
            created_at: ksi_protocol::timestamp_utc(),
            expires_at,
            metadata,
        };
        let stored = entry.clone();
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.lock().expect("kv connection poisoned");
            conn.execute(
                "INSERT INTO agent_shared_state
                     (key, value, namespace, owner_agent_id, scope, created_at, expires_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(key) DO UPDATE SET
                     value = excluded.value,
                     namespace = excluded.namespace,
                     owner_agent_id = excluded.owner_agent_id,
                     scope = excluded.scope,
                     created_at = excluded.created_at,
                     expires_at = excluded.expires_at,
                     metadata = excluded.metadata",
                params![
                    entry.key,
                    encode_value(&entry.value),
                    entry.namespace,
                    entry.owner_agent_id,
                    entry.scope,
                    entry.created_at,
                    entry.expires_at,
                    entry.metadata.as_ref().map(|m| m.to_string()),
                ],
            )?;
            Ok(())
        })
        .await
        .context("kv write task panicked")??;
        Ok(stored)
    }

    /// Fetch one entry; expired rows read as absent.
    pub async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let key = key.to_string();
        let conn = Arc::clone(&self.conn);
        let entry = tokio::task::spawn_blocking(move || -> Result<Option<KvEntry>> {
            let conn = conn.lock().expect("kv connection poisoned");
            let row = conn
                .query_row(
                    "SELECT key, value, namespace, owner_agent_id, scope, created_at,
                            expires_at, metadata
                     FROM agent_shared_state WHERE key = ?1",
                    params![key],
                    row_to_entry,
                )
                .optional()?;
            Ok(row)
        })
        .await
        .context("kv read task panicked")??;

        Ok(entry.filter(|e| !e.is_expired(Utc::now())))
    }

    /// List entries, optionally filtered by namespace and/or owner.
    /// Expired rows are skipped.
    pub async fn list(
        &self,
        namespace: Option<String>,
        owner_agent_id: Option<String>,
    ) -> Result<Vec<KvEntry>> {
        let conn = Arc::clone(&self.conn);
        let entries = tokio::task::spawn_blocking(move || -> Result<Vec<KvEntry>> {
            let conn = conn.lock().expect("kv connection poisoned");
            let mut sql = String::from(
                "SELECT key, value, namespace, owner_agent_id, scope, created_at,
                        expires_at, metadata
                 FROM agent_shared_state WHERE 1=1",
            );
            let mut binds: Vec<String> = Vec::new();
            if let Some(ns) = namespace {
                sql.push_str(" AND namespace = ?");
                binds.push(ns);
            }
            if let Some(owner) = owner_agent_id {
                sql.push_str(" AND owner_agent_id = ?");
                binds.push(owner);
            }
            sql.push_str(" ORDER BY key");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(binds.iter()), row_to_entry)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
        .context("kv list task panicked")??;

        let now = Utc::now();
        Ok(entries.into_iter().filter(|e| !e.is_expired(now)).collect())
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        let conn = Arc::clone(&self.conn);
        let removed = tokio::task::spawn_blocking(move || -> Result<usize> {
            let conn = conn.lock().expect("kv connection poisoned");
            Ok(conn.execute("DELETE FROM agent_shared_state WHERE key = ?1", params![key])?)
        })
        .await
        .context("kv delete task panicked")??;
        Ok(removed > 0)
    }

    /// Delete rows whose expiry has passed. Returns how many went.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = ksi_protocol::timestamp_utc();
        let conn = Arc::clone(&self.conn);
        let swept = tokio::task::spawn_blocking(move || -> Result<usize> {
            let conn = conn.lock().expect("kv connection poisoned");
            Ok(conn.execute(
                "DELETE FROM agent_shared_state
                 WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )?)
        })
        .await
        .context("kv sweep task panicked")??;
        Ok(swept)
    }

    pub async fn len(&self) -> Result<usize> {
        let conn = Arc::clone(&self.conn);
        let count = tokio::task::spawn_blocking(move || -> Result<i64> {
            let conn = conn.lock().expect("kv connection poisoned");
            Ok(conn.query_row("SELECT COUNT(*) FROM agent_shared_state", [], |r| r.get(0))?)
        })
        .await
        .context("kv count task panicked")??;
        Ok(count as usize)
    }
}

/// Strings are stored bare so older readers keep working; everything else
/// is stored as JSON text.
fn encode_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Decode JSON when it parses, else keep the raw string.
fn decode_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<KvEntry> {
    let raw_value: String = row.get(1)?;
    let raw_metadata: Option<String> = row.get(7)?;
    Ok(KvEntry {
        key: row.get(0)?,
        value: decode_value(&raw_value),
        namespace: row.get(2)?,
        owner_agent_id: row.get(3)?,
        scope: row.get(4)?,
        created_at: row.get(5)?,
        expires_at: row.get(6)?,
        metadata: raw_metadata.and_then(|m| serde_json::from_str(&m).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_then_get_round_trips_json() {
        let store = SharedStateStore::open_in_memory().unwrap();
        store
            .set(
                "analyst.findings.latest".into(),
                json!({"rows": 3, "ok": true}),
                "analyst".into(),
                KvScope::Shared,
                None,
                Some(json!({"source": "test"})),
            )
            .await
            .unwrap();

        let entry = store.get("analyst.findings.latest").await.unwrap().unwrap();
        assert_eq!(entry.value["rows"], 3);
        assert_eq!(entry.namespace.as_deref(), Some("analyst.findings"));
        assert_eq!(entry.scope, "shared");
        assert_eq!(entry.metadata.unwrap()["source"], "test");
    }

    #[tokio::test]
    async fn plain_strings_are_stored_bare() {
        let store = SharedStateStore::open_in_memory().unwrap();
        store
            .set(
                "note".into(),
                json!("just text"),
                "a1".into(),
                KvScope::Private,
                None,
                None,
            )
            .await
            .unwrap();
        let entry = store.get("note").await.unwrap().unwrap();
        assert_eq!(entry.value, json!("just text"));
        assert_eq!(entry.namespace, None);
    }

    #[tokio::test]
    async fn upsert_replaces_the_row() {
        let store = SharedStateStore::open_in_memory().unwrap();
        for v in [json!(1), json!(2)] {
            store
                .set("a.b".into(), v, "a".into(), KvScope::Shared, None, None)
                .await
                .unwrap();
        }
        assert_eq!(store.len().await.unwrap(), 1);
        assert_eq!(store.get("a.b").await.unwrap().unwrap().value, json!(2));
    }

    #[tokio::test]
    async fn expired_entries_are_invisible_and_sweepable() {
        let store = SharedStateStore::open_in_memory().unwrap();
        let past = (Utc::now() - chrono::Duration::seconds(10)).to_rfc3339();
        let future = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        store
            .set("x.old.1".into(), json!(1), "x".into(), KvScope::Shared, Some(past), None)
            .await
            .unwrap();
        store
            .set("x.new.1".into(), json!(2), "x".into(), KvScope::Shared, Some(future), None)
            .await
            .unwrap();

        assert!(store.get("x.old.1").await.unwrap().is_none());
        assert!(store.get("x.new.1").await.unwrap().is_some());
        assert_eq!(store.list(None, None).await.unwrap().len(), 1);

        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_filters_by_namespace_and_owner() {
        let store = SharedStateStore::open_in_memory().unwrap();
        store
            .set("a.plan.step".into(), json!(1), "a".into(), KvScope::Shared, None, None)
            .await
            .unwrap();
        store
            .set("b.plan.step".into(), json!(2), "b".into(), KvScope::Shared, None, None)
            .await
            .unwrap();

        let ns = store.list(Some("a.plan".into()), None).await.unwrap();
        assert_eq!(ns.len(), 1);
        assert_eq!(ns[0].key, "a.plan.step");

        let owner = store.list(None, Some("b".into())).await.unwrap();
        assert_eq!(owner.len(), 1);
        assert_eq!(owner[0].owner_agent_id, "b");
    }

    #[test]
    fn invalid_expiry_is_rejected() {
        let store = SharedStateStore::open_in_memory().unwrap();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let result = rt.block_on(store.set(
            "k".into(),
            json!(1),
            "a".into(),
            KvScope::Shared,
            Some("tomorrow-ish".into()),
            None,
        ));
        assert!(result.is_err());
    }
}
