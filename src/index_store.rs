//! # Index store
//!
//! Durable per-user storage of a [`FlatIndex`] and the parallel document list.
//!
//! Each user owns two files in the store directory, named after a sanitised
//! storage key (see [`storage_key`]):
//!
//! - `{key}_docs.json`: JSON array of the documents, in position order.
//! - `{key}_index.bin`: bincode envelope holding the index, the owning user id,
//!   the document count and the blake3 digest of the documents file.
//!
//! [`IndexStore::save`] writes each file to a temporary sibling, syncs it and
//! renames it into place, documents first and index last. The index rename is
//! the commit point. A crash between the two renames leaves an envelope whose
//! digest no longer matches the documents file, which [`IndexStore::load`]
//! reports as [`RagError::Corruption`] instead of serving a misaligned pair.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{RagError, Result};
use crate::vector_index::FlatIndex;

/// Bumped whenever the envelope layout changes.
const FORMAT_VERSION: u32 = 1;
const SLUG_MAX: usize = 48;

static UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_-]").unwrap());

/// Filesystem-safe key for `user_id`.
///
/// A readable slug of at most 48 `[A-Za-z0-9_-]` characters followed by the
/// first 16 hex digits of the id's SHA-256, so ids that slug identically still
/// map to different files.
///
/// ```rust
/// use awful_rag::index_store::storage_key;
///
/// let key = storage_key("../../etc/passwd");
/// assert!(!key.contains('/') && !key.contains(".."));
/// assert_ne!(storage_key("a/b"), storage_key("a?b"));
/// ```
pub fn storage_key(user_id: &str) -> String {
    let slug: String = UNSAFE_CHARS
        .replace_all(user_id, "_")
        .chars()
        .take(SLUG_MAX)
        .collect();
    let slug = if slug.is_empty() { "user".to_string() } else { slug };
    let digest = sha256::digest(user_id);
    format!("{}-{}", slug, &digest[..16])
}

#[derive(Serialize, Deserialize)]
struct IndexEnvelope {
    format: u32,
    user_id: String,
    count: usize,
    documents_blake3: String,
    saved_at: DateTime<Utc>,
    index: FlatIndex,
}

/// A user's record as read back from disk.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub index: FlatIndex,
    pub documents: Vec<String>,
    pub saved_at: DateTime<Utc>,
}

/// Directory of per-user index records.
#[derive(Debug, Clone)]
pub struct IndexStore {
    dir: PathBuf,
}

impl IndexStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `(index file, documents file)` for `user_id`.
    pub fn paths(&self, user_id: &str) -> (PathBuf, PathBuf) {
        let key = storage_key(user_id);
        (
            self.dir.join(format!("{key}_index.bin")),
            self.dir.join(format!("{key}_docs.json")),
        )
    }

    /// Whether any file of `user_id`'s record is present.
    pub fn exists(&self, user_id: &str) -> bool {
        let (index_path, docs_path) = self.paths(user_id);
        index_path.exists() || docs_path.exists()
    }

    /// Persist `index` and `documents` as `user_id`'s record, replacing any previous one.
    ///
    /// # Errors
    /// [`RagError::InvalidInput`] if the index and document counts differ; I/O
    /// and serialization errors otherwise. A failed save leaves the previous
    /// record loadable or detectably inconsistent, never silently misaligned.
    pub fn save(&self, user_id: &str, index: &FlatIndex, documents: &[String]) -> Result<()> {
        if index.len() != documents.len() {
            return Err(RagError::InvalidInput(format!(
                "refusing to save {} documents with an index of {} vectors",
                documents.len(),
                index.len()
            )));
        }

        let docs_bytes = serde_json::to_vec(documents)?;
        let envelope = IndexEnvelope {
            format: FORMAT_VERSION,
            user_id: user_id.to_string(),
            count: documents.len(),
            documents_blake3: blake3::hash(&docs_bytes).to_hex().to_string(),
            saved_at: Utc::now(),
            index: index.clone(),
        };
        let index_bytes = bincode::serde::encode_to_vec(&envelope, bincode::config::standard())?;

        let (index_path, docs_path) = self.paths(user_id);
        self.write_atomic(&docs_path, &docs_bytes)?;
        self.write_atomic(&index_path, &index_bytes)?;

        info!(
            "Saved {} documents for {} to {}",
            documents.len(),
            user_id,
            index_path.display()
        );
        Ok(())
    }

    /// Read back `user_id`'s record.
    ///
    /// Returns `Ok(None)` when the user has no record at all.
    ///
    /// # Errors
    /// [`RagError::Corruption`] when only one file exists, either file cannot be
    /// decoded, the stored index is internally inconsistent, the envelope belongs to another user, or the envelope's count or
    /// digest disagrees with the documents file.
    pub fn load(&self, user_id: &str) -> Result<Option<StoredRecord>> {
        let (index_path, docs_path) = self.paths(user_id);
        match (index_path.exists(), docs_path.exists()) {
            (false, false) => return Ok(None),
            (true, false) => {
                warn!("Index file for {} has no documents file", user_id);
                return Err(RagError::corruption(user_id, "documents file is missing"));
            }
            (false, true) => {
                warn!("Documents file for {} has no index file", user_id);
                return Err(RagError::corruption(user_id, "index file is missing"));
            }
            (true, true) => {}
        }

        let docs_bytes = fs::read(&docs_path)?;
        let documents: Vec<String> = serde_json::from_slice(&docs_bytes).map_err(|e| {
            RagError::corruption(user_id, format!("documents file is not a JSON string array: {e}"))
        })?;

        let index_bytes = fs::read(&index_path)?;
        let (envelope, _): (IndexEnvelope, usize) =
            bincode::serde::decode_from_slice(&index_bytes, bincode::config::standard())
                .map_err(|e| RagError::corruption(user_id, format!("index file is unreadable: {e}")))?;

        if envelope.format != FORMAT_VERSION {
            return Err(RagError::corruption(
                user_id,
                format!("unsupported index format {}", envelope.format),
            ));
        }
        if envelope.user_id != user_id {
            return Err(RagError::corruption(
                user_id,
                format!("index file belongs to user {}", envelope.user_id),
            ));
        }
        envelope
            .index
            .check()
            .map_err(|reason| RagError::corruption(user_id, reason))?;
        if envelope.count != documents.len() || envelope.index.len() != documents.len() {
            return Err(RagError::corruption(
                user_id,
                format!(
                    "{} documents but index holds {} vectors (envelope count {})",
                    documents.len(),
                    envelope.index.len(),
                    envelope.count
                ),
            ));
        }
        if envelope.documents_blake3 != blake3::hash(&docs_bytes).to_hex().as_str() {
            return Err(RagError::corruption(
                user_id,
                "documents file does not match the digest recorded with the index",
            ));
        }

        debug!("Loaded {} documents for {}", documents.len(), user_id);
        Ok(Some(StoredRecord {
            index: envelope.index,
            documents,
            saved_at: envelope.saved_at,
        }))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut file = NamedTempFile::new_in(&self.dir)?;
        file.write_all(bytes)?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> (FlatIndex, Vec<String>) {
        let mut index = FlatIndex::new();
        index
            .build(vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.5, 0.5]])
            .unwrap();
        let docs = vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()];
        (index, docs)
    }

    #[test]
    fn test_round_trip_preserves_positions() {
        let dir = tempdir().unwrap();
        let store = IndexStore::new(dir.path()).unwrap();
        let (index, docs) = sample();

        store.save("u1", &index, &docs).unwrap();
        let record = store.load("u1").unwrap().unwrap();

        assert_eq!(record.documents, docs);
        assert_eq!(record.index, index);
        assert_eq!(record.index.vector(2), Some(&[0.5, 0.5][..]));
    }

    #[test]
    fn test_absent_user_is_none() {
        let dir = tempdir().unwrap();
        let store = IndexStore::new(dir.path()).unwrap();
        assert!(store.load("nobody").unwrap().is_none());
        assert!(!store.exists("nobody"));
    }

    #[test]
    fn test_save_overwrites_previous_record() {
        let dir = tempdir().unwrap();
        let store = IndexStore::new(dir.path()).unwrap();
        let (index, docs) = sample();
        store.save("u1", &index, &docs).unwrap();

        let mut smaller = FlatIndex::new();
        smaller.build(vec![vec![9.0, 9.0]]).unwrap();
        store.save("u1", &smaller, &["only".to_string()]).unwrap();

        let record = store.load("u1").unwrap().unwrap();
        assert_eq!(record.documents, vec!["only".to_string()]);
        assert_eq!(record.index.len(), 1);
    }

    #[test]
    fn test_save_rejects_misaligned_pair() {
        let dir = tempdir().unwrap();
        let store = IndexStore::new(dir.path()).unwrap();
        let (index, _) = sample();
        let err = store.save("u1", &index, &["one".to_string()]).unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
        assert!(!store.exists("u1"));
    }

    #[test]
    fn test_storage_keys_do_not_escape_or_alias() {
        for user in ["../../etc/passwd", "a/b", "..", "", "C:\\Windows", "ユーザー"] {
            let key = storage_key(user);
            assert!(!key.contains('/'), "{key}");
            assert!(!key.contains('\\'), "{key}");
            assert!(!key.contains(".."), "{key}");
        }
        assert_ne!(storage_key("a/b"), storage_key("a_b"));
        assert_ne!(storage_key("a b"), storage_key("a?b"));
        assert!(storage_key("alice").starts_with("alice-"));
        assert!(storage_key(&"x".repeat(500)).len() <= SLUG_MAX + 17);
    }

    #[test]
    fn test_traversal_ids_stay_inside_store() {
        let dir = tempdir().unwrap();
        let store = IndexStore::new(dir.path()).unwrap();
        let (index, docs) = sample();
        store.save("../escape", &index, &docs).unwrap();

        let (index_path, docs_path) = store.paths("../escape");
        assert_eq!(index_path.parent(), Some(dir.path()));
        assert_eq!(docs_path.parent(), Some(dir.path()));
        assert_eq!(store.load("../escape").unwrap().unwrap().documents, docs);
    }

    #[test]
    fn test_users_are_isolated() {
        let dir = tempdir().unwrap();
        let store = IndexStore::new(dir.path()).unwrap();
        let (index, docs) = sample();
        store.save("a/b", &index, &docs).unwrap();
        assert!(store.load("a_b").unwrap().is_none());
    }

    #[test]
    fn test_missing_half_is_corruption() {
        let dir = tempdir().unwrap();
        let store = IndexStore::new(dir.path()).unwrap();
        let (index, docs) = sample();

        store.save("u1", &index, &docs).unwrap();
        fs::remove_file(store.paths("u1").1).unwrap();
        assert!(matches!(store.load("u1"), Err(RagError::Corruption { .. })));

        store.save("u2", &index, &docs).unwrap();
        fs::remove_file(store.paths("u2").0).unwrap();
        assert!(matches!(store.load("u2"), Err(RagError::Corruption { .. })));
    }

    #[test]
    fn test_count_mismatch_is_corruption() {
        let dir = tempdir().unwrap();
        let store = IndexStore::new(dir.path()).unwrap();
        let (index, docs) = sample();
        store.save("u1", &index, &docs).unwrap();

        fs::write(store.paths("u1").1, r#"["alpha","beta"]"#).unwrap();
        let err = store.load("u1").unwrap_err();
        assert!(matches!(err, RagError::Corruption { .. }));
        assert!(err.to_string().contains("2 documents but index holds 3 vectors"));
    }

    #[test]
    fn test_edited_documents_fail_digest_check() {
        let dir = tempdir().unwrap();
        let store = IndexStore::new(dir.path()).unwrap();
        let (index, docs) = sample();
        store.save("u1", &index, &docs).unwrap();

        fs::write(store.paths("u1").1, r#"["alpha","beta","delta"]"#).unwrap();
        let err = store.load("u1").unwrap_err();
        assert!(err.to_string().contains("digest"));
    }

    #[test]
    fn test_garbage_index_file_is_corruption() {
        let dir = tempdir().unwrap();
        let store = IndexStore::new(dir.path()).unwrap();
        let (index, docs) = sample();
        store.save("u1", &index, &docs).unwrap();

        fs::write(store.paths("u1").0, b"\xff\xff\xff").unwrap();
        assert!(matches!(store.load("u1"), Err(RagError::Corruption { .. })));
    }

    fn write_envelope(store: &IndexStore, user_id: &str, index: serde_json::Value, docs: &[&str]) {
        let docs_bytes = serde_json::to_vec(docs).unwrap();
        let envelope = IndexEnvelope {
            format: FORMAT_VERSION,
            user_id: user_id.to_string(),
            count: docs.len(),
            documents_blake3: blake3::hash(&docs_bytes).to_hex().to_string(),
            saved_at: Utc::now(),
            index: serde_json::from_value(index).unwrap(),
        };
        let index_bytes =
            bincode::serde::encode_to_vec(&envelope, bincode::config::standard()).unwrap();
        let (index_path, docs_path) = store.paths(user_id);
        fs::write(docs_path, docs_bytes).unwrap();
        fs::write(index_path, index_bytes).unwrap();
    }

    #[test]
    fn test_zero_dimension_index_is_corruption() {
        let dir = tempdir().unwrap();
        let store = IndexStore::new(dir.path()).unwrap();
        write_envelope(&store, "u1", serde_json::json!({ "dimension": 0, "data": [] }), &[]);

        let err = store.load("u1").unwrap_err();
        assert!(matches!(err, RagError::Corruption { .. }));
        assert!(err.to_string().contains("dimension is zero"));
    }

    #[test]
    fn test_ragged_index_data_is_corruption() {
        let dir = tempdir().unwrap();
        let store = IndexStore::new(dir.path()).unwrap();
        write_envelope(
            &store,
            "u1",
            serde_json::json!({ "dimension": 2, "data": [1.0, 2.0, 3.0] }),
            &["alpha"],
        );

        assert!(matches!(store.load("u1"), Err(RagError::Corruption { .. })));
    }

    #[test]
    fn test_envelope_of_another_user_is_rejected() {
        let dir = tempdir().unwrap();
        let store = IndexStore::new(dir.path()).unwrap();
        let (index, docs) = sample();
        store.save("alice", &index, &docs).unwrap();

        let (alice_index, alice_docs) = store.paths("alice");
        let (bob_index, bob_docs) = store.paths("bob");
        fs::copy(alice_index, bob_index).unwrap();
        fs::copy(alice_docs, bob_docs).unwrap();

        let err = store.load("bob").unwrap_err();
        assert!(err.to_string().contains("belongs to user alice"));
    }
}
