//! The durable key-value collaborator holding checkpoints.
//!
//! Values are JSON documents; keys are flat strings with `:`-separated
//! prefixes. Reads are strongly consistent within a job, writes are
//! last-writer-wins. Backends are constructed from a URL via
//! [from_addr]:
//!
//! - `memory://` keeps everything in process, for tests and dry runs.
//! - `redb:///absolute/path` persists to a single-file redb database.
//! - `redb://` uses redb's in-memory backend.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use tokio::sync::RwLock;
use tracing::instrument;
use url::Url;

use crate::error::Error;

const KV_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("kv");

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, Error>;
    async fn put(&self, key: &str, value: serde_json::Value) -> Result<(), Error>;
    async fn delete(&self, key: &str) -> Result<(), Error>;
    /// All `(key, value)` pairs whose key starts with `prefix`, in key
    /// order.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>, Error>;
}

/// Constructs a [KvStore] from a URL.
pub async fn from_addr(uri: &str) -> Result<Arc<dyn KvStore>, Error> {
    let url = Url::parse(uri).map_err(|e| Error::InvalidRequest(e.to_string()))?;
    match url.scheme() {
        "memory" => Ok(Arc::new(MemoryKvStore::default())),
        "redb" => {
            if url.has_host() {
                return Err(Error::InvalidRequest(
                    "redb:// does not take a host".to_string(),
                ));
            }
            if url.path().is_empty() || url.path() == "/" {
                Ok(Arc::new(RedbKvStore::new_temporary()?))
            } else {
                Ok(Arc::new(RedbKvStore::new(url.path().into()).await?))
            }
        }
        scheme => Err(Error::InvalidRequest(format!(
            "unknown key-value store scheme {:?}",
            scheme
        ))),
    }
}

/// In-process [KvStore].
#[derive(Default)]
pub struct MemoryKvStore {
    inner: RwLock<BTreeMap<String, serde_json::Value>>,
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, Error> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<(), Error> {
        self.inner.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.inner.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>, Error> {
        Ok(self
            .inner
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// [KvStore] implementation using redb under the hood.
///
/// All data lives in a single file with one table mapping keys to their
/// JSON-encoded values. Blocking database work runs on the blocking pool.
pub struct RedbKvStore {
    // Wrapped in an Arc to move into spawn_blocking closures.
    db: Arc<Database>,
}

impl RedbKvStore {
    /// Opens (or creates) a database at the given file system path.
    pub async fn new(path: PathBuf) -> Result<Self, Error> {
        if path == PathBuf::from("/") {
            return Err(Error::StorageError(
                "cowardly refusing to open / with redb".to_string(),
            ));
        }

        let db = tokio::task::spawn_blocking(|| -> Result<_, redb::Error> {
            let db = redb::Database::create(path)?;
            create_schema(&db)?;
            Ok(db)
        })
        .await??;

        Ok(Self { db: Arc::new(db) })
    }

    /// Constructs a new instance using the in-memory backend.
    pub fn new_temporary() -> Result<Self, Error> {
        let db =
            redb::Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        create_schema(&db)?;
        Ok(Self { db: Arc::new(db) })
    }
}

/// Ensures all tables are present.
fn create_schema(db: &redb::Database) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    txn.open_table(KV_TABLE)?;
    txn.commit()?;
    Ok(())
}

#[async_trait]
impl KvStore for RedbKvStore {
    #[instrument(level = "trace", skip_all, fields(key))]
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, Error> {
        let db = self.db.clone();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read()?;
            let table = txn.open_table(KV_TABLE)?;
            match table.get(key.as_str())? {
                Some(bytes) => Ok(Some(serde_json::from_slice(&bytes.value())?)),
                None => Ok(None),
            }
        })
        .await?
    }

    #[instrument(level = "trace", skip_all, fields(key))]
    async fn put(&self, key: &str, value: serde_json::Value) -> Result<(), Error> {
        let db = self.db.clone();
        let key = key.to_string();
        let encoded = serde_json::to_vec(&value)?;

        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(KV_TABLE)?;
                table.insert(key.as_str(), encoded)?;
            }
            Ok(txn.commit()?)
        })
        .await?
    }

    #[instrument(level = "trace", skip_all, fields(key))]
    async fn delete(&self, key: &str) -> Result<(), Error> {
        let db = self.db.clone();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(KV_TABLE)?;
                table.remove(key.as_str())?;
            }
            Ok(txn.commit()?)
        })
        .await?
    }

    #[instrument(level = "trace", skip_all, fields(prefix))]
    async fn list(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>, Error> {
        let db = self.db.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read()?;
            let table = txn.open_table(KV_TABLE)?;
            let mut out = Vec::new();
            for entry in table.range(prefix.as_str()..)? {
                let (key, value) = entry?;
                if !key.value().starts_with(&prefix) {
                    break;
                }
                out.push((
                    key.value().to_string(),
                    serde_json::from_slice(&value.value())?,
                ));
            }
            Ok(out)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn stores() -> Vec<Arc<dyn KvStore>> {
        vec![
            Arc::new(MemoryKvStore::default()),
            Arc::new(RedbKvStore::new_temporary().unwrap()),
        ]
    }

    #[tokio::test]
    async fn put_get_delete() {
        for store in stores() {
            assert!(store.get("k").await.unwrap().is_none());
            store.put("k", json!({"a": 1})).await.unwrap();
            assert_eq!(Some(json!({"a": 1})), store.get("k").await.unwrap());
            store.put("k", json!({"a": 2})).await.unwrap();
            assert_eq!(Some(json!({"a": 2})), store.get("k").await.unwrap());
            store.delete("k").await.unwrap();
            assert!(store.get("k").await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn list_respects_prefix_and_order() {
        for store in stores() {
            store.put("checkpoint:b", json!(2)).await.unwrap();
            store.put("checkpoint:a", json!(1)).await.unwrap();
            store.put("other:c", json!(3)).await.unwrap();

            let listed = store.list("checkpoint:").await.unwrap();
            assert_eq!(
                vec![
                    ("checkpoint:a".to_string(), json!(1)),
                    ("checkpoint:b".to_string(), json!(2)),
                ],
                listed
            );
        }
    }

    #[tokio::test]
    async fn redb_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.redb");

        {
            let store = RedbKvStore::new(path.clone()).await.unwrap();
            store.put("k", json!("v")).await.unwrap();
        }

        let store = RedbKvStore::new(path).await.unwrap();
        assert_eq!(Some(json!("v")), store.get("k").await.unwrap());
    }

    #[rstest]
    #[case::memory("memory://", true)]
    #[case::redb_temporary("redb://", true)]
    #[case::unknown("sled://x", false)]
    #[tokio::test]
    async fn from_addr(#[case] uri: &str, #[case] ok: bool) {
        assert_eq!(ok, super::from_addr(uri).await.is_ok());
    }
}
