//! Lookup routing over a namespace's membership filters.
//!
//! Given a manifest, the router answers "which chunks could hold this
//! entity" from the bloom filters alone, without touching chunk bodies.
//! The combined filter short-circuits entities the namespace has never
//! seen; per-chunk filters narrow the rest down to a candidate list that
//! is usually one or two chunks deep. Only then does a caller pay for
//! [ChunkRouter::read_chunk].

use std::sync::Arc;

use object_store::{path::Path, ObjectStore};
use tracing::{instrument, warn};

use graphlake_graphcol::codec::{self, Batch};

use crate::bloom::{BloomFilter, Membership};
use crate::error::Error;
use crate::manifest::{ChunkDescriptor, ChunkManifest};

pub struct ChunkRouter {
    manifest: ChunkManifest,
    combined: Option<BloomFilter>,
    /// One filter per manifest chunk, in the same order. Chunks without
    /// a filter are always candidates.
    chunk_filters: Vec<Option<BloomFilter>>,
}

impl ChunkRouter {
    /// Builds a router from a manifest, deserializing its embedded
    /// filters once up-front.
    pub fn new(manifest: ChunkManifest) -> Result<Self, Error> {
        let combined = manifest
            .combined_bloom
            .as_ref()
            .map(|value| parse_filter(value))
            .transpose()?;
        let chunk_filters = manifest
            .chunks
            .iter()
            .map(|chunk| chunk.bloom.as_ref().map(parse_filter).transpose())
            .collect::<Result<_, _>>()?;

        Ok(Self {
            manifest,
            combined,
            chunk_filters,
        })
    }

    /// Loads the manifest of `namespace` and builds a router over it.
    /// [None] when the namespace has never been finalized.
    pub async fn load(
        object_store: &Arc<dyn ObjectStore>,
        namespace: &graphlake_graphcol::ident::Namespace,
    ) -> Result<Option<Self>, Error> {
        match ChunkManifest::read_from(object_store, namespace).await? {
            Some(manifest) => Ok(Some(Self::new(manifest)?)),
            None => Ok(None),
        }
    }

    pub fn manifest(&self) -> &ChunkManifest {
        &self.manifest
    }

    /// Namespace-level membership: [Membership::Absent] is definitive,
    /// and cheap enough to gate any lookup with.
    pub fn might_contain(&self, entity: &str) -> Membership {
        match &self.combined {
            Some(filter) => filter.might_contain(entity),
            // Without a combined filter, nothing can be ruled out.
            None => Membership::MaybePresent,
        }
    }

    /// The chunks that could hold triples about `entity`, in manifest
    /// (flush) order. Empty when the combined filter rules the entity
    /// out entirely.
    pub fn candidates(&self, entity: &str) -> Vec<&ChunkDescriptor> {
        if self.might_contain(entity) == Membership::Absent {
            return Vec::new();
        }
        self.manifest
            .chunks
            .iter()
            .zip(&self.chunk_filters)
            .filter(|(_, filter)| match filter {
                Some(f) => f.might_contain(entity) == Membership::MaybePresent,
                None => true,
            })
            .map(|(chunk, _)| chunk)
            .collect()
    }

    /// Fetches and decodes one chunk body. The frame's CRC and length
    /// are verified by the decoder; a count that disagrees with the
    /// manifest is logged as drift but the decoded batch wins.
    #[instrument(skip(self, object_store), fields(chunk.path = %chunk.path), err)]
    pub async fn read_chunk(
        &self,
        object_store: &Arc<dyn ObjectStore>,
        chunk: &ChunkDescriptor,
    ) -> Result<Batch, Error> {
        let bytes = object_store
            .get(&Path::from(chunk.path.as_str()))
            .await?
            .bytes()
            .await?;
        let batch = codec::decode(&bytes)?;
        if batch.triples.len() as u64 != chunk.triple_count {
            warn!(
                manifest_count = chunk.triple_count,
                decoded_count = batch.triples.len(),
                "manifest and chunk disagree on triple count"
            );
        }
        Ok(batch)
    }
}

fn parse_filter(value: &serde_json::Value) -> Result<BloomFilter, Error> {
    let json = serde_json::from_value(value.clone())?;
    BloomFilter::from_json(&json).map_err(|e| Error::InvalidRequest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;
    use pretty_assertions::assert_eq;

    use graphlake_graphcol::ident::{EntityUrl, Namespace, Predicate};
    use graphlake_graphcol::triple::Triple;
    use graphlake_graphcol::value::Value;

    use crate::writer::{BatchWriterConfig, BatchedTripleWriter};

    use super::*;

    fn namespace() -> Namespace {
        Namespace::parse("https://example.com/").unwrap()
    }

    fn triple(i: usize) -> Triple {
        Triple::new(
            EntityUrl::parse(&format!("https://example.com/e/{}", i)).unwrap(),
            Predicate::parse("n").unwrap(),
            Value::Int64(i as i64),
            1 + i as u64,
            "01ARZ3NDEKTSV4RRFFQ69G5FAV".parse().unwrap(),
        )
        .unwrap()
    }

    /// Writes 100 triples in four chunks and publishes the manifest.
    async fn populated_store() -> (Arc<dyn ObjectStore>, ChunkManifest) {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut writer = BatchedTripleWriter::new(
            store.clone(),
            namespace(),
            BatchWriterConfig {
                batch_size: 25,
                ..Default::default()
            },
        )
        .unwrap();
        writer.add_triples((0..100).map(triple)).await.unwrap();
        let summary = writer.finalize().await.unwrap();
        let combined = serde_json::to_value(summary.combined_bloom.to_json()).unwrap();
        let manifest = ChunkManifest::new(&namespace(), summary.chunks, Some(combined));
        manifest.write_to(&store, &namespace()).await.unwrap();
        (store, manifest)
    }

    #[tokio::test]
    async fn written_entities_route_to_their_chunk() {
        let (store, _) = populated_store().await;
        let router = ChunkRouter::load(&store, &namespace())
            .await
            .unwrap()
            .expect("manifest published");

        for i in [0usize, 37, 99] {
            let entity = format!("https://example.com/e/{}", i);
            let candidates = router.candidates(&entity);
            assert!(!candidates.is_empty());

            // The entity's triple really is in one of the candidates.
            let mut found = false;
            for chunk in candidates {
                let batch = router.read_chunk(&store, chunk).await.unwrap();
                found |= batch.triples.iter().any(|t| t.subject.as_str() == entity);
            }
            assert!(found, "entity {} not found via routing", entity);
        }
    }

    #[tokio::test]
    async fn unknown_entities_are_ruled_out_cheaply() {
        let (_, manifest) = populated_store().await;
        let router = ChunkRouter::new(manifest).unwrap();

        // With 100 members at a 1% target, the combined filter rules
        // essentially all foreign entities out without any chunk reads.
        let ruled_out = (0..1000)
            .filter(|i| {
                router
                    .candidates(&format!("https://example.com/absent/{}", i))
                    .is_empty()
            })
            .count();
        assert!(ruled_out > 950, "only {} of 1000 ruled out", ruled_out);
    }

    #[tokio::test]
    async fn candidates_keep_manifest_order() {
        let (_, manifest) = populated_store().await;
        let router = ChunkRouter::new(manifest.clone()).unwrap();

        // An entity in the first chunk: its candidate list starts there.
        let candidates = router.candidates("https://example.com/e/0");
        assert_eq!(manifest.chunks[0].id, candidates[0].id);
    }

    #[tokio::test]
    async fn corrupted_chunks_fail_to_read() {
        let (store, manifest) = populated_store().await;
        let router = ChunkRouter::new(manifest.clone()).unwrap();
        let chunk = &manifest.chunks[0];

        // Truncate the stored object.
        let bytes = store
            .get(&Path::from(chunk.path.as_str()))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        store
            .put(
                &Path::from(chunk.path.as_str()),
                bytes.slice(..bytes.len() / 2).into(),
            )
            .await
            .unwrap();

        assert!(matches!(
            router.read_chunk(&store, chunk).await,
            Err(Error::StorageError(_))
        ));
    }

    #[tokio::test]
    async fn missing_manifest_is_none() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        assert!(ChunkRouter::load(&store, &namespace())
            .await
            .unwrap()
            .is_none());
    }
}
