//! Content-addressed store of full fragment text, one file per fragment.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use crate::error::Result;
use crate::fragment::Fragment;

/// Subdirectory of the index directory holding fragment bodies.
pub const STORE_DIR: &str = "full_fragments";

/// Extensions probed when a fragment carries no stored path.
const FALLBACK_EXTENSIONS: &[&str] = &[
    ".py", ".js", ".ts", ".tsx", ".java", ".c", ".cpp", ".go", ".rs", ".md", ".txt",
];

/// Index-relative store path of a fragment body.
#[must_use]
pub fn stored_path(fragment_id: &str, ext: &str) -> String {
    format!("{STORE_DIR}/{fragment_id}{ext}")
}

#[derive(Debug, Clone)]
pub struct FragmentStore {
    index_dir: PathBuf,
}

impl FragmentStore {
    #[must_use]
    pub fn new(index_dir: impl Into<PathBuf>) -> Self {
        Self {
            index_dir: index_dir.into(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> PathBuf {
        self.index_dir.join(STORE_DIR)
    }

    fn resolve(&self, relative: &str) -> Option<PathBuf> {
        let path = Path::new(relative);
        path.components()
            .all(|c| matches!(c, Component::Normal(_)))
            .then(|| self.index_dir.join(path))
    }

    fn candidates(&self, fragment: &Fragment) -> Vec<PathBuf> {
        let m = &fragment.metadata;
        if let Some(path) = m.full_code_path.as_deref().and_then(|p| self.resolve(p)) {
            return vec![path];
        }
        let Some(id) = m.fragment_id.as_deref() else {
            return Vec::new();
        };
        FALLBACK_EXTENSIONS
            .iter()
            .filter_map(|ext| self.resolve(&stored_path(id, ext)))
            .collect()
    }

    /// Write the full text of `fragment`. Fragments without a store path are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn save(&self, fragment: &Fragment, body: &str) -> Result<()> {
        let Some(path) = fragment
            .metadata
            .full_code_path
            .as_deref()
            .and_then(|p| self.resolve(p))
        else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body).await?;
        Ok(())
    }

    /// Read the full text of `fragment`, or `None` if it was never stored.
    ///
    /// # Errors
    ///
    /// Returns an error on IO failures other than a missing file.
    pub async fn load(&self, fragment: &Fragment) -> Result<Option<String>> {
        for path in self.candidates(fragment) {
            match tokio::fs::read_to_string(&path).await {
                Ok(body) => return Ok(Some(body)),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Delete the stored text of `fragment`. Missing files are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error on IO failures other than a missing file.
    pub async fn remove(&self, fragment: &Fragment) -> Result<()> {
        for path in self.candidates(fragment) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Delete every stored body not named in `live` (store paths as written
    /// in fragment metadata). Returns how many files were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store directory cannot be listed.
    pub async fn retain(&self, live: &HashSet<String>) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(self.dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if live.contains(&format!("{STORE_DIR}/{name}")) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    file = %entry.path().display(),
                    error = %e,
                    "stale fragment body not removed"
                ),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::extract_document;

    fn doc(path: &str, body: &str) -> Fragment {
        extract_document(body, path).remove(0).fragment
    }

    #[test]
    fn stored_path_layout() {
        assert_eq!(stored_path("abc", ".py"), "full_fragments/abc.py");
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::new(dir.path());
        let fragment = doc("notes/readme.md", "# Notes\n");

        store.save(&fragment, "# Notes\n").await.unwrap();
        assert_eq!(store.load(&fragment).await.unwrap().as_deref(), Some("# Notes\n"));
        let id = fragment.metadata.fragment_id.clone().unwrap();
        assert!(dir.path().join("full_fragments").join(format!("{id}.md")).exists());
    }

    #[tokio::test]
    async fn missing_entry_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::new(dir.path());
        assert_eq!(store.load(&doc("a.md", "x\n")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn load_falls_back_to_id_with_known_extension() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::new(dir.path());
        let mut fragment = doc("a.md", "body\n");
        store.save(&fragment, "body\n").await.unwrap();
        fragment.metadata.full_code_path = None;
        assert_eq!(store.load(&fragment).await.unwrap().as_deref(), Some("body\n"));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::new(dir.path());
        let fragment = doc("a.md", "body\n");
        store.save(&fragment, "body\n").await.unwrap();
        store.remove(&fragment).await.unwrap();
        store.remove(&fragment).await.unwrap();
        assert_eq!(store.load(&fragment).await.unwrap(), None);
    }

    #[tokio::test]
    async fn escaping_paths_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::new(dir.path().join("index"));
        let mut fragment = doc("a.md", "body\n");
        fragment.metadata.full_code_path = Some("../outside.txt".into());
        store.save(&fragment, "body\n").await.unwrap();
        assert!(!dir.path().join("outside.txt").exists());
    }

    #[tokio::test]
    async fn retain_keeps_only_live_bodies() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::new(dir.path());
        let kept = doc("kept.md", "kept\n");
        let stale = doc("stale.md", "stale\n");
        store.save(&kept, "kept\n").await.unwrap();
        store.save(&stale, "stale\n").await.unwrap();

        let live: HashSet<String> = kept.metadata.full_code_path.iter().cloned().collect();
        assert_eq!(store.retain(&live).await.unwrap(), 1);
        assert!(store.load(&kept).await.unwrap().is_some());
        assert!(store.load(&stale).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retain_without_store_dir_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::new(dir.path().join("fresh"));
        assert_eq!(store.retain(&HashSet::new()).await.unwrap(), 0);
    }
}
