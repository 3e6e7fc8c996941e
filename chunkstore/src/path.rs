//! Chunk ids and the reversed-host storage layout.
//!
//! A namespace `https://blog.example.com/posts` maps to the object-store
//! prefix `.com/.example/.blog/posts`, so related hosts cluster under a
//! shared prefix. Chunk bodies live under `_chunks/` inside that prefix,
//! next to the namespace manifest.

use object_store::path::Path;
use rand::Rng;

use graphlake_graphcol::ident::{reversed_host_segments, Namespace};

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Characters of randomness after the time part.
const RANDOM_LEN: usize = 6;

/// An opaque chunk identifier: base36 milliseconds, a dash, six base36
/// random characters. Unique by construction, sortable by creation time.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn generate(now_ms: u64) -> Self {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..RANDOM_LEN)
            .map(|_| BASE36[rng.gen_range(0..36)] as char)
            .collect();
        Self(format!("{}-{}", to_base36(now_ms), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn to_base36(mut v: u64) -> String {
    if v == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while v > 0 {
        digits.push(BASE36[(v % 36) as usize]);
        v /= 36;
    }
    digits.reverse();
    // Digits are ASCII.
    String::from_utf8(digits).unwrap()
}

/// The object-store prefix of a namespace: reversed host segments, each
/// prefixed with a dot, followed by the URL path segments.
fn namespace_prefix(namespace: &Namespace) -> Path {
    let mut path = Path::default();
    for segment in reversed_host_segments(&namespace.host()) {
        path = path.child(format!(".{}", segment));
    }
    for segment in namespace.path_segments() {
        path = path.child(segment);
    }
    path
}

/// Where a chunk body lives.
pub fn storage_path(namespace: &Namespace, chunk_id: &ChunkId) -> Path {
    namespace_prefix(namespace)
        .child("_chunks")
        .child(format!("{}.gcol", chunk_id))
}

/// Where the namespace manifest lives, next to its chunks.
pub fn manifest_path(namespace: &Namespace) -> Path {
    namespace_prefix(namespace)
        .child("_chunks")
        .child("_manifest.json")
}

#[cfg(test)]
mod tests {
    use graphlake_graphcol::ident::Namespace;

    use super::*;

    #[test]
    fn chunk_path_reverses_the_host() {
        let ns = Namespace::parse("https://blog.example.com/posts").unwrap();
        let id = ChunkId("abc123-x9y8z7".to_string());
        assert_eq!(
            ".com/.example/.blog/posts/_chunks/abc123-x9y8z7.gcol",
            storage_path(&ns, &id).as_ref()
        );
    }

    #[test]
    fn bare_host_namespace() {
        let ns = Namespace::parse("https://example.com/").unwrap();
        let id = ChunkId("abc-defghi".to_string());
        assert_eq!(
            ".com/.example/_chunks/abc-defghi.gcol",
            storage_path(&ns, &id).as_ref()
        );
    }

    #[test]
    fn manifest_sits_next_to_chunks() {
        let ns = Namespace::parse("https://example.com/").unwrap();
        assert_eq!(
            ".com/.example/_chunks/_manifest.json",
            manifest_path(&ns).as_ref()
        );
    }

    #[test]
    fn generated_ids_are_unique_and_sortable() {
        let a = ChunkId::generate(1_700_000_000_000);
        let b = ChunkId::generate(1_700_000_000_000);
        assert_ne!(a, b);
        // Eight base36 time digits, a dash, six random characters.
        assert_eq!(15, a.as_str().len());

        let earlier = ChunkId::generate(1_000_000);
        assert!(earlier.as_str().len() < a.as_str().len());
    }

    #[test]
    fn base36() {
        assert_eq!("0", super::to_base36(0));
        assert_eq!("z", super::to_base36(35));
        assert_eq!("10", super::to_base36(36));
        assert_eq!("rs", super::to_base36(1000));
    }
}
