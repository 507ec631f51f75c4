//! Persisted index snapshot: vectors, the aligned fragment list and metadata.
//!
//! The three files are written and read as a unit. If any one of them is
//! missing, there is no snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::fragment::Fragment;
use crate::vector_index::VectorIndex;

pub const VECTORS_FILE: &str = "vectors.bin";
pub const FRAGMENTS_FILE: &str = "fragments.json";
pub const META_FILE: &str = "meta.json";

/// Repo-relative path to content hash.
pub type FileHashes = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub repo_path: String,
    pub total_fragments: usize,
    pub dimension: usize,
    /// Embedding model identifier.
    pub model: String,
    #[serde(default)]
    pub file_hashes: FileHashes,
}

impl SnapshotMeta {
    /// Read only the metadata of the snapshot in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if `meta.json` exists but cannot be read or parsed.
    pub async fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(META_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    pub index: VectorIndex,
    pub fragments: Vec<Fragment>,
    pub meta: SnapshotMeta,
}

impl IndexSnapshot {
    /// Pair fragments with their vectors.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotMismatch` if the two lists are not aligned.
    pub fn new(
        index: VectorIndex,
        fragments: Vec<Fragment>,
        repo_path: String,
        file_hashes: FileHashes,
    ) -> Result<Self> {
        if index.len() != fragments.len() {
            return Err(IndexError::SnapshotMismatch(format!(
                "{} vectors for {} fragments",
                index.len(),
                fragments.len()
            )));
        }
        let meta = SnapshotMeta {
            repo_path,
            total_fragments: fragments.len(),
            dimension: index.dimension(),
            model: index.model().to_owned(),
            file_hashes,
        };
        Ok(Self {
            index,
            fragments,
            meta,
        })
    }

    /// Whether all three snapshot files exist under `dir`.
    #[must_use]
    pub fn exists(dir: &Path) -> bool {
        [VECTORS_FILE, FRAGMENTS_FILE, META_FILE]
            .iter()
            .all(|name| dir.join(name).is_file())
    }

    /// Write the snapshot into `dir`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if any file cannot be written.
    pub async fn save(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let snapshot = self.clone();
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || snapshot.save_blocking(&dir))
            .await
            .map_err(|e| IndexError::Other(format!("snapshot writer panicked: {e}")))?
    }

    fn save_blocking(&self, dir: &Path) -> Result<()> {
        let vectors_tmp = temp_path(dir, VECTORS_FILE);
        self.index.save(&vectors_tmp)?;
        let fragments_tmp = temp_path(dir, FRAGMENTS_FILE);
        std::fs::write(&fragments_tmp, serde_json::to_vec(&self.fragments)?)?;
        let meta_tmp = temp_path(dir, META_FILE);
        std::fs::write(&meta_tmp, serde_json::to_vec_pretty(&self.meta)?)?;

        std::fs::rename(vectors_tmp, dir.join(VECTORS_FILE))?;
        std::fs::rename(fragments_tmp, dir.join(FRAGMENTS_FILE))?;
        std::fs::rename(meta_tmp, dir.join(META_FILE))?;
        tracing::debug!(
            dir = %dir.display(),
            fragments = self.fragments.len(),
            dimension = self.index.dimension(),
            "snapshot written"
        );
        Ok(())
    }

    /// Load the snapshot in `dir`. Returns `None` unless all three files exist.
    ///
    /// # Errors
    ///
    /// Returns an error if a file is unreadable or the files disagree.
    pub async fn load(dir: &Path) -> Result<Option<Self>> {
        if !Self::exists(dir) {
            return Ok(None);
        }
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || Self::load_blocking(&dir).map(Some))
            .await
            .map_err(|e| IndexError::Other(format!("snapshot reader panicked: {e}")))?
    }

    fn load_blocking(dir: &Path) -> Result<Self> {
        let index = VectorIndex::load(&dir.join(VECTORS_FILE))?;
        let fragments: Vec<Fragment> =
            serde_json::from_slice(&std::fs::read(dir.join(FRAGMENTS_FILE))?)?;
        let meta: SnapshotMeta = serde_json::from_slice(&std::fs::read(dir.join(META_FILE))?)?;

        if index.len() != fragments.len() || meta.total_fragments != fragments.len() {
            return Err(IndexError::SnapshotMismatch(format!(
                "{} vectors, {} fragments, metadata says {}",
                index.len(),
                fragments.len(),
                meta.total_fragments
            )));
        }
        if !index.is_empty() && meta.dimension != index.dimension() {
            return Err(IndexError::SnapshotMismatch(format!(
                "metadata dimension {} but vectors have {}",
                meta.dimension,
                index.dimension()
            )));
        }
        Ok(Self {
            index,
            fragments,
            meta,
        })
    }
}

fn temp_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!(".{name}.tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::extract_document;

    fn sample() -> IndexSnapshot {
        let fragments: Vec<Fragment> = ["a.md", "b.md"]
            .iter()
            .map(|p| extract_document("hello\n", p).remove(0).fragment)
            .collect();
        let index = VectorIndex::build(vec![vec![1.0, 0.0], vec![0.0, 2.0]], "embed").unwrap();
        let mut hashes = FileHashes::new();
        hashes.insert("a.md".into(), "h1".into());
        IndexSnapshot::new(index, fragments, "/repo".into(), hashes).unwrap()
    }

    #[tokio::test]
    async fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = sample();
        snapshot.save(dir.path()).await.unwrap();

        let loaded = IndexSnapshot::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.fragments, snapshot.fragments);
        assert_eq!(loaded.meta, snapshot.meta);
        assert_eq!(loaded.meta.total_fragments, 2);
        assert_eq!(loaded.meta.dimension, 2);
        assert_eq!(loaded.meta.model, "embed");
        assert_eq!(loaded.meta.file_hashes["a.md"], "h1");
        assert_eq!(loaded.index.len(), 2);
    }

    #[tokio::test]
    async fn absent_directory_is_no_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        assert!(IndexSnapshot::load(&dir.path().join("nope")).await.unwrap().is_none());
        assert!(SnapshotMeta::load(&dir.path().join("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn meta_loads_alone() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = sample();
        snapshot.save(dir.path()).await.unwrap();
        let meta = SnapshotMeta::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(meta, snapshot.meta);
    }

    #[tokio::test]
    async fn partial_presence_is_no_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        sample().save(dir.path()).await.unwrap();
        std::fs::remove_file(dir.path().join(FRAGMENTS_FILE)).unwrap();
        assert!(!IndexSnapshot::exists(dir.path()));
        assert!(IndexSnapshot::load(dir.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn misaligned_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        sample().save(dir.path()).await.unwrap();
        let one = vec![extract_document("x\n", "c.md").remove(0).fragment];
        std::fs::write(dir.path().join(FRAGMENTS_FILE), serde_json::to_vec(&one).unwrap()).unwrap();
        let err = IndexSnapshot::load(dir.path()).await.unwrap_err();
        assert!(matches!(err, IndexError::SnapshotMismatch(_)), "{err}");
    }

    #[test]
    fn new_rejects_misaligned_lists() {
        let index = VectorIndex::build(vec![vec![1.0]], "m").unwrap();
        assert!(IndexSnapshot::new(index, Vec::new(), "/r".into(), FileHashes::new()).is_err());
    }

    #[tokio::test]
    async fn empty_snapshot_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = IndexSnapshot::new(
            VectorIndex::empty(0, "embed"),
            Vec::new(),
            "/repo".into(),
            FileHashes::new(),
        )
        .unwrap();
        snapshot.save(dir.path()).await.unwrap();
        let loaded = IndexSnapshot::load(dir.path()).await.unwrap().unwrap();
        assert!(loaded.fragments.is_empty());
        assert!(loaded.index.is_empty());
    }
}
