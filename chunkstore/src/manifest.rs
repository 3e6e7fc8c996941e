//! The per-namespace chunk index.
//!
//! A manifest lists every chunk written into a namespace, in flush order,
//! together with aggregate stats and the serialized combined bloom
//! filter. It is a single JSON object at a well-known path next to the
//! chunks; whoever writes it last publishes the namespace's state, so
//! writers into one namespace must not run concurrently.

use std::sync::Arc;

use chrono::Utc;
use object_store::{path::Path, ObjectStore};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use graphlake_graphcol::ident::Namespace;

use crate::error::Error;
use crate::path::manifest_path;

/// Manifest format version.
const VERSION: u32 = 1;

/// Millisecond timestamps are serialized as decimal strings, so JSON
/// consumers without 64-bit integers read them losslessly.
mod u64_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One chunk, as listed in the manifest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDescriptor {
    pub id: String,
    pub path: String,
    pub triple_count: u64,
    #[serde(with = "u64_string")]
    pub min_time: u64,
    #[serde(with = "u64_string")]
    pub max_time: u64,
    pub bytes: u64,
    /// The chunk's own membership filter in its JSON form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bloom: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestStats {
    pub total_triples: u64,
    pub total_chunks: u64,
    pub total_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkManifest {
    pub namespace: String,
    pub chunks: Vec<ChunkDescriptor>,
    pub stats: ManifestStats,
    /// Combined filter over every entity in the namespace, JSON form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combined_bloom: Option<serde_json::Value>,
    /// ISO-8601 UTC.
    pub created_at: String,
    pub updated_at: String,
    pub version: u32,
}

impl ChunkManifest {
    pub fn new(
        namespace: &Namespace,
        chunks: Vec<ChunkDescriptor>,
        combined_bloom: Option<serde_json::Value>,
    ) -> Self {
        let stats = ManifestStats {
            total_triples: chunks.iter().map(|c| c.triple_count).sum(),
            total_chunks: chunks.len() as u64,
            total_bytes: chunks.iter().map(|c| c.bytes).sum(),
        };
        let now = Utc::now().to_rfc3339();
        Self {
            namespace: namespace.as_str().to_string(),
            chunks,
            stats,
            combined_bloom,
            created_at: now.clone(),
            updated_at: now,
            version: VERSION,
        }
    }

    /// Publishes the manifest at the namespace's well-known path.
    /// Last-writer-wins; there is no merge with a concurrently written
    /// manifest.
    #[instrument(skip_all, fields(namespace = %namespace, chunks = self.chunks.len()), err)]
    pub async fn write_to(
        &self,
        object_store: &Arc<dyn ObjectStore>,
        namespace: &Namespace,
    ) -> Result<Path, Error> {
        let path = manifest_path(namespace);
        let encoded = serde_json::to_vec(self)?;
        object_store.put(&path, encoded.into()).await?;
        Ok(path)
    }

    /// Reads the manifest of `namespace`, or [None] when the namespace
    /// has never been finalized.
    #[instrument(skip_all, fields(namespace = %namespace), err)]
    pub async fn read_from(
        object_store: &Arc<dyn ObjectStore>,
        namespace: &Namespace,
    ) -> Result<Option<Self>, Error> {
        let path = manifest_path(namespace);
        match object_store.get(&path).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Checks that every listed chunk object exists, returning the paths
    /// that don't. A non-empty result means the store and the manifest
    /// have diverged.
    pub async fn verify_chunks(
        &self,
        object_store: &Arc<dyn ObjectStore>,
    ) -> Result<Vec<String>, Error> {
        let mut missing = Vec::new();
        for chunk in &self.chunks {
            match object_store.head(&Path::from(chunk.path.as_str())).await {
                Ok(_) => {}
                Err(object_store::Error::NotFound { .. }) => {
                    warn!(chunk.path = %chunk.path, "chunk listed in manifest is missing");
                    missing.push(chunk.path.clone());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;
    use pretty_assertions::assert_eq;

    use super::*;

    fn ns(s: &str) -> Namespace {
        Namespace::parse(s).unwrap()
    }

    fn descriptor(id: &str) -> ChunkDescriptor {
        ChunkDescriptor {
            id: id.to_string(),
            path: format!(".com/.example/_chunks/{}.gcol", id),
            triple_count: 1000,
            min_time: 1_700_000_000_000,
            max_time: 1_700_000_000_999,
            bytes: 4096,
            bloom: None,
        }
    }

    #[test]
    fn stats_are_sums() {
        let namespace = ns("https://example.com/");
        let manifest = ChunkManifest::new(
            &namespace,
            vec![descriptor("a"), descriptor("b"), descriptor("c")],
            None,
        );
        assert_eq!(3000, manifest.stats.total_triples);
        assert_eq!(3, manifest.stats.total_chunks);
        assert_eq!(3 * 4096, manifest.stats.total_bytes);
    }

    #[test]
    fn json_roundtrip() {
        let manifest =
            ChunkManifest::new(&ns("https://example.com/"), vec![descriptor("a")], None);
        let encoded = serde_json::to_string(&manifest).unwrap();
        let decoded: ChunkManifest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(manifest, decoded);
    }

    #[test]
    fn timestamps_serialize_as_strings() {
        let manifest =
            ChunkManifest::new(&ns("https://example.com/"), vec![descriptor("a")], None);
        let json: serde_json::Value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(
            "1700000000000",
            json["chunks"][0]["minTime"].as_str().unwrap()
        );
        assert_eq!(
            "1700000000999",
            json["chunks"][0]["maxTime"].as_str().unwrap()
        );
    }

    #[tokio::test]
    async fn write_then_read() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let namespace = ns("https://example.com/");
        let manifest = ChunkManifest::new(&namespace, vec![descriptor("a")], None);

        let path = manifest.write_to(&store, &namespace).await.unwrap();
        assert_eq!(".com/.example/_chunks/_manifest.json", path.as_ref());

        let read = ChunkManifest::read_from(&store, &namespace)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manifest, read);
    }

    #[tokio::test]
    async fn read_missing_is_none() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        assert!(
            ChunkManifest::read_from(&store, &ns("https://example.com/"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn verify_reports_missing_chunks() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let namespace = ns("https://example.com/");
        let present = descriptor("present");
        store
            .put(&Path::from(present.path.as_str()), vec![0u8; 4].into())
            .await
            .unwrap();

        let manifest =
            ChunkManifest::new(&namespace, vec![present, descriptor("missing")], None);
        let missing = manifest.verify_chunks(&store).await.unwrap();
        assert_eq!(vec![".com/.example/_chunks/missing.gcol".to_string()], missing);
    }
}
