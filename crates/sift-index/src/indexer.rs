//! Incremental indexing orchestrator.
//!
//! A run walks the repository, classifies files against the previous
//! snapshot, re-extracts only what changed, regenerates folder summaries,
//! embeds fragments that have no vector yet and persists the merged result.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use sift_llm::LlmProvider;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::embedding::{EmbeddingConfig, EmbeddingOutcome, EmbeddingPipeline};
use crate::error::Result;
use crate::extractor::{ExtractorConfig, extract_fragments};
use crate::fragment::{Fragment, FragmentLevel};
use crate::languages::{Lang, detect_language};
use crate::registry::GrammarRegistry;
use crate::snapshot::{FileHashes, IndexSnapshot};
use crate::store::FragmentStore;
use crate::summarizer::{Summarizer, SummaryConfig, group_by_folder};
use crate::vector_index::VectorIndex;

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub extractor: ExtractorConfig,
    pub embedding: EmbeddingConfig,
    pub summary: SummaryConfig,
    /// File extensions to index, without the leading dot.
    pub supported_extensions: Vec<String>,
    /// Directory names skipped at any depth.
    pub ignored_dirs: Vec<String>,
    /// Glob patterns matched against file names.
    pub ignored_files: Vec<String>,
    /// Concurrent extraction and summary workers (default: 8).
    pub file_workers: usize,
    pub respect_gitignore: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            extractor: ExtractorConfig::default(),
            embedding: EmbeddingConfig::default(),
            summary: SummaryConfig::default(),
            supported_extensions: ["py", "js", "ts", "java", "c", "cpp", "go", "rs", "md"]
                .map(String::from)
                .to_vec(),
            ignored_dirs: [
                ".git",
                "node_modules",
                "__pycache__",
                "venv",
                ".venv",
                "build",
                "static",
                ".cudavenv",
            ]
            .map(String::from)
            .to_vec(),
            ignored_files: [
                "package-lock.json",
                "yarn.lock",
                "pnpm-lock.yaml",
                "bun.lockb",
                "Gemfile.lock",
                "Cargo.lock",
            ]
            .map(String::from)
            .to_vec(),
            file_workers: 8,
            respect_gitignore: true,
        }
    }
}

/// Summary of an indexing run.
#[derive(Debug, Default, Clone)]
pub struct IndexReport {
    pub files_scanned: usize,
    pub files_added: usize,
    pub files_modified: usize,
    pub files_unchanged: usize,
    pub files_deleted: usize,
    /// Code and document fragments produced by re-extraction.
    pub fragments_extracted: usize,
    /// Fragments that received a new vector this run.
    pub fragments_embedded: usize,
    /// Fragments left out of the snapshot because they have no vector.
    pub fragments_skipped: usize,
    pub fragments_total: usize,
    /// File and folder summaries written this run.
    pub summaries_generated: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
    /// Nothing changed since the previous snapshot.
    pub noop: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileStatus {
    Added,
    Modified,
    Unchanged,
}

struct DiscoveredFile {
    rel_path: String,
    lang: Lang,
    hash: String,
    status: FileStatus,
    /// Content, kept only for files that will be re-extracted.
    content: Option<String>,
}

#[derive(Default)]
struct FileOutcome {
    fragments: Vec<Fragment>,
    extracted: usize,
    summarized: bool,
    error: Option<String>,
    /// The file must be retried on the next run.
    retry: bool,
}

/// A fragment headed for the snapshot, with its vector once known.
struct Entry {
    fragment: Fragment,
    vector: Option<Vec<f32>>,
    reused: bool,
}

struct FileContext<P> {
    registry: Arc<GrammarRegistry>,
    summarizer: Summarizer<P>,
    store: FragmentStore,
    extractor: ExtractorConfig,
}

/// Orchestrates incremental indexing of one repository into one index directory.
pub struct CodeIndexer<P> {
    registry: Arc<GrammarRegistry>,
    provider: Arc<P>,
    config: IndexerConfig,
}

impl<P: LlmProvider + 'static> CodeIndexer<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, config: IndexerConfig) -> Self {
        Self::with_registry(Arc::new(GrammarRegistry::new()), provider, config)
    }

    #[must_use]
    pub fn with_registry(
        registry: Arc<GrammarRegistry>,
        provider: Arc<P>,
        config: IndexerConfig,
    ) -> Self {
        Self {
            registry,
            provider,
            config,
        }
    }

    /// Bring the snapshot in `index_dir` up to date with `repo`.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository cannot be walked or the snapshot
    /// cannot be written. Per-file and per-batch failures are reported in
    /// [`IndexReport::errors`] and [`IndexReport::fragments_skipped`] instead.
    pub async fn index_repo(&self, repo: &Path, index_dir: &Path) -> Result<IndexReport> {
        let start = Instant::now();
        let mut report = IndexReport::default();
        let repo = tokio::fs::canonicalize(repo).await?;

        let prior = self.load_prior(index_dir).await;
        let old_hashes = prior
            .as_ref()
            .map(|s| s.meta.file_hashes.clone())
            .unwrap_or_default();

        let mut files = self.discover(&repo, &old_hashes, &mut report).await?;
        report.files_scanned = files.len();

        let current: HashSet<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();
        let known: HashSet<String> = old_hashes
            .keys()
            .cloned()
            .chain(prior.iter().flat_map(|s| {
                s.fragments
                    .iter()
                    .filter_map(|f| f.file().map(str::to_owned))
            }))
            .collect();
        let deleted: HashSet<String> = known
            .into_iter()
            .filter(|f| !current.contains(f.as_str()))
            .collect();

        for file in &files {
            match file.status {
                FileStatus::Added => report.files_added += 1,
                FileStatus::Modified => report.files_modified += 1,
                FileStatus::Unchanged => report.files_unchanged += 1,
            }
        }
        report.files_deleted = deleted.len();

        let changed = report.files_added + report.files_modified + report.files_deleted;
        if let Some(prior) = &prior
            && changed == 0
        {
            report.noop = true;
            report.fragments_total = prior.fragments.len();
            report.duration_ms = elapsed_ms(start);
            tracing::info!(files = report.files_scanned, "index up to date");
            return Ok(report);
        }

        tracing::info!(
            added = report.files_added,
            modified = report.files_modified,
            unchanged = report.files_unchanged,
            deleted = report.files_deleted,
            "indexing started"
        );

        // Prune fragments of re-extracted or deleted files and every folder summary.
        let mut pruned = 0usize;
        let mut kept = Vec::new();
        if let Some(prior) = prior {
            let reextracted: HashSet<&str> = files
                .iter()
                .filter(|f| f.status != FileStatus::Unchanged)
                .map(|f| f.rel_path.as_str())
                .collect();
            for (fragment, vector) in prior.fragments.into_iter().zip(prior.index.vectors()) {
                let stale = fragment.level() == FragmentLevel::FolderSummary
                    || fragment
                        .file()
                        .is_some_and(|f| reextracted.contains(f) || deleted.contains(f));
                if stale {
                    pruned += 1;
                } else {
                    kept.push(Entry {
                        fragment,
                        vector: Some(vector.to_vec()),
                        reused: true,
                    });
                }
            }
        }
        tracing::debug!(kept = kept.len(), pruned, "prior fragments pruned");

        let store = FragmentStore::new(index_dir);
        let mut retry_files = HashSet::new();
        let mut entries = kept;
        let changed_files: Vec<(String, Lang, String)> = files
            .iter_mut()
            .filter_map(|f| {
                f.content
                    .take()
                    .map(|content| (f.rel_path.clone(), f.lang, content))
            })
            .collect();
        let changed_paths: Vec<String> = changed_files.iter().map(|f| f.0.clone()).collect();
        let outcomes = self.process_files(changed_files, &store).await;
        for (rel_path, outcome) in changed_paths.iter().zip(outcomes) {
            let Some(outcome) = outcome else {
                report.errors.push(format!("{rel_path}: worker failed"));
                retry_files.insert(rel_path.clone());
                continue;
            };
            if let Some(error) = outcome.error {
                report.errors.push(error);
            }
            if outcome.retry {
                retry_files.insert(rel_path.clone());
            }
            report.fragments_extracted += outcome.extracted;
            report.summaries_generated += usize::from(outcome.summarized);
            entries.extend(outcome.fragments.into_iter().map(|fragment| Entry {
                fragment,
                vector: None,
                reused: false,
            }));
        }

        let folders = self.summarize_folders(&entries).await;
        report.summaries_generated += folders.len();
        entries.extend(folders.into_iter().map(|fragment| Entry {
            fragment,
            vector: None,
            reused: false,
        }));

        self.embed_entries(&mut entries).await;

        let mut fragments = Vec::with_capacity(entries.len());
        let mut vectors = Vec::with_capacity(entries.len());
        let mut dropped = 0usize;
        for entry in entries {
            match entry.vector {
                Some(vector) => {
                    if !entry.reused {
                        report.fragments_embedded += 1;
                    }
                    fragments.push(entry.fragment);
                    vectors.push(vector);
                }
                None => {
                    if entry.fragment.level() != FragmentLevel::FolderSummary
                        && let Some(file) = entry.fragment.file()
                    {
                        retry_files.insert(file.to_owned());
                    }
                    dropped += 1;
                }
            }
        }
        report.fragments_skipped = dropped;
        if dropped > 0 {
            tracing::warn!(
                skipped = dropped,
                files = retry_files.len(),
                "fragments without embeddings left out of the snapshot"
            );
        }

        remove_orphans(&store, &fragments, &mut report).await;

        let file_hashes: FileHashes = files
            .into_iter()
            .filter(|f| !retry_files.contains(&f.rel_path))
            .map(|f| (f.rel_path, f.hash))
            .collect();
        let index = VectorIndex::build(vectors, self.provider.embedding_model())?;
        let snapshot = IndexSnapshot::new(
            index,
            fragments,
            repo.to_string_lossy().into_owned(),
            file_hashes,
        )?;
        snapshot.save(index_dir).await?;

        report.fragments_total = snapshot.fragments.len();
        report.duration_ms = elapsed_ms(start);
        tracing::info!(
            total = report.fragments_total,
            embedded = report.fragments_embedded,
            skipped = report.fragments_skipped,
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "indexing finished"
        );
        Ok(report)
    }

    async fn load_prior(&self, index_dir: &Path) -> Option<IndexSnapshot> {
        let snapshot = match IndexSnapshot::load(index_dir).await {
            Ok(snapshot) => snapshot?,
            Err(e) => {
                tracing::warn!(error = %e, "unusable snapshot, rebuilding from scratch");
                return None;
            }
        };
        let model = self.provider.embedding_model();
        if snapshot.meta.model != model {
            tracing::warn!(
                previous = %snapshot.meta.model,
                current = model,
                "embedding model changed, rebuilding from scratch"
            );
            return None;
        }
        Some(snapshot)
    }

    async fn discover(
        &self,
        repo: &Path,
        old_hashes: &FileHashes,
        report: &mut IndexReport,
    ) -> Result<Vec<DiscoveredFile>> {
        let ignored_files: Vec<glob::Pattern> = self
            .config
            .ignored_files
            .iter()
            .filter_map(|p| match glob::Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "invalid ignored_files pattern");
                    None
                }
            })
            .collect();
        let ignored_dirs = self.config.ignored_dirs.clone();

        let mut paths: Vec<(String, Lang, std::path::PathBuf)> = ignore::WalkBuilder::new(repo)
            .hidden(false)
            .git_ignore(self.config.respect_gitignore)
            .filter_entry(move |e| {
                let is_dir = e.file_type().is_some_and(|ft| ft.is_dir());
                !(is_dir
                    && e.file_name()
                        .to_str()
                        .is_some_and(|name| ignored_dirs.iter().any(|d| d == name)))
            })
            .build()
            .flatten()
            .filter(|e| e.file_type().is_some_and(|ft| ft.is_file()))
            .filter_map(|e| {
                let path = e.into_path();
                let name = path.file_name()?.to_str()?;
                if ignored_files.iter().any(|p| p.matches(name)) {
                    return None;
                }
                let ext = path.extension()?.to_str()?;
                if !self.config.supported_extensions.iter().any(|s| s == ext) {
                    return None;
                }
                let lang = detect_language(&path)?;
                let rel_path = relative_path(repo, &path)?;
                Some((rel_path, lang, path))
            })
            .collect();
        paths.sort_by(|a, b| a.0.cmp(&b.0));

        let mut files = Vec::with_capacity(paths.len());
        for (rel_path, lang, path) in paths {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(file = %rel_path, error = %e, "unreadable file skipped");
                    report.errors.push(format!("{rel_path}: {e}"));
                    continue;
                }
            };
            let hash = blake3::hash(&bytes).to_hex().to_string();
            let status = match old_hashes.get(&rel_path) {
                None => FileStatus::Added,
                Some(old) if *old != hash => FileStatus::Modified,
                Some(_) => FileStatus::Unchanged,
            };
            let content = (status != FileStatus::Unchanged)
                .then(|| String::from_utf8_lossy(&bytes).into_owned());
            files.push(DiscoveredFile {
                rel_path,
                lang,
                hash,
                status,
                content,
            });
        }
        Ok(files)
    }

    async fn process_files(
        &self,
        files: Vec<(String, Lang, String)>,
        store: &FragmentStore,
    ) -> Vec<Option<FileOutcome>> {
        let ctx = Arc::new(FileContext {
            registry: Arc::clone(&self.registry),
            summarizer: Summarizer::new(Arc::clone(&self.provider), self.config.summary.clone()),
            store: store.clone(),
            extractor: self.config.extractor.clone(),
        });
        run_pool(files, self.config.file_workers, move |(rel_path, lang, content)| {
            let ctx = Arc::clone(&ctx);
            async move { process_file(&ctx, &rel_path, lang, &content).await }
        })
        .await
    }

    async fn summarize_folders(&self, entries: &[Entry]) -> Vec<Fragment> {
        let fragments: Vec<Fragment> = entries
            .iter()
            .filter(|e| e.fragment.level() == FragmentLevel::FileSummary)
            .map(|e| e.fragment.clone())
            .collect();
        let groups: Vec<(String, Vec<(String, String)>)> =
            group_by_folder(&fragments).into_iter().collect();
        if groups.is_empty() {
            return Vec::new();
        }
        tracing::info!(folders = groups.len(), "generating folder summaries");

        let summarizer = Arc::new(Summarizer::new(
            Arc::clone(&self.provider),
            self.config.summary.clone(),
        ));
        run_pool(groups, self.config.file_workers, move |(folder, files)| {
            let summarizer = Arc::clone(&summarizer);
            async move { summarizer.summarize_folder(&folder, &files).await }
        })
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    /// Embed every entry without a vector, then make all vectors agree on one
    /// dimension. Reused vectors of a different dimension are re-embedded.
    async fn embed_entries(&self, entries: &mut [Entry]) {
        self.embed_missing(entries).await;

        let fresh = entries
            .iter()
            .filter(|e| !e.reused)
            .find_map(|e| e.vector.as_ref().map(Vec::len));
        let reused = entries
            .iter()
            .filter(|e| e.reused)
            .find_map(|e| e.vector.as_ref().map(Vec::len));
        if let (Some(fresh), Some(reused)) = (fresh, reused)
            && fresh != reused
        {
            tracing::warn!(
                previous = reused,
                current = fresh,
                "embedding dimension changed, re-embedding reused fragments"
            );
            for entry in entries.iter_mut().filter(|e| e.reused) {
                entry.vector = None;
                entry.reused = false;
            }
            self.embed_missing(entries).await;
        }

        let mut check = EmbeddingOutcome {
            vectors: entries.iter_mut().map(|e| e.vector.take()).collect(),
            failed_batches: 0,
        };
        check.retain_valid(fresh.or(reused));
        for (entry, vector) in entries.iter_mut().zip(check.vectors) {
            entry.vector = vector;
        }
    }

    async fn embed_missing(&self, entries: &mut [Entry]) {
        let positions: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.vector.is_none())
            .map(|(i, _)| i)
            .collect();
        if positions.is_empty() {
            return;
        }
        let texts = positions
            .iter()
            .map(|&i| entries[i].fragment.text.clone())
            .collect();
        let outcome = EmbeddingPipeline::new(Arc::clone(&self.provider), self.config.embedding.clone())
            .embed_all(texts)
            .await;
        for (position, vector) in positions.into_iter().zip(outcome.vectors) {
            entries[position].vector = vector;
        }
    }
}

/// Shrink the fragment store to the bodies of `live` fragments. Covers
/// pruned and unembedded fragments as well as leftovers of a discarded
/// snapshot.
async fn remove_orphans(store: &FragmentStore, live: &[Fragment], report: &mut IndexReport) {
    let live_paths: HashSet<String> = live
        .iter()
        .filter(|f| f.level().is_stored())
        .filter_map(|f| f.metadata.full_code_path.clone())
        .collect();
    match store.retain(&live_paths).await {
        Ok(0) => {}
        Ok(removed) => tracing::debug!(removed, "orphaned fragment bodies deleted"),
        Err(e) => report.errors.push(format!("fragment store cleanup: {e}")),
    }
}

async fn process_file<P: LlmProvider>(
    ctx: &FileContext<P>,
    rel_path: &str,
    lang: Lang,
    content: &str,
) -> FileOutcome {
    let mut outcome = FileOutcome::default();
    let extractions = match extract_fragments(&ctx.registry, content, rel_path, lang, &ctx.extractor)
    {
        Ok(extractions) => extractions,
        Err(e) => {
            tracing::warn!(file = rel_path, error = %e, "extraction failed");
            outcome.error = Some(format!("{rel_path}: {e}"));
            Vec::new()
        }
    };

    for extraction in &extractions {
        if let Err(e) = ctx.store.save(&extraction.fragment, &extraction.body).await {
            tracing::warn!(file = rel_path, error = %e, "fragment store write failed");
            outcome.error = Some(format!("{rel_path}: {e}"));
            outcome.retry = true;
            return outcome;
        }
    }
    outcome.extracted = extractions.len();
    outcome.fragments = extractions.into_iter().map(|e| e.fragment).collect();

    if !lang.is_document()
        && let Some(summary) = ctx.summarizer.summarize_file(rel_path, content).await
    {
        outcome.fragments.push(summary);
        outcome.summarized = true;
    }
    tracing::debug!(file = rel_path, fragments = outcome.fragments.len(), "file processed");
    outcome
}

/// Run `f` over `jobs` on at most `workers` concurrent tasks. The output is
/// positional; a slot stays `None` only if its task panicked.
async fn run_pool<T, F, Fut>(jobs: Vec<T>, workers: usize, f: F) -> Vec<Option<Fut::Output>>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let slots: Arc<Mutex<Vec<Option<Fut::Output>>>> =
        Arc::new(Mutex::new((0..jobs.len()).map(|_| None).collect()));
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let f = Arc::new(f);
    let mut tasks = JoinSet::new();

    for (position, job) in jobs.into_iter().enumerate() {
        let slots = Arc::clone(&slots);
        let semaphore = Arc::clone(&semaphore);
        let f = Arc::clone(&f);
        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            let output = f(job).await;
            slots.lock().unwrap_or_else(PoisonError::into_inner)[position] = Some(output);
        });
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::warn!("indexing worker failed: {e:#}");
        }
    }

    match Arc::try_unwrap(slots) {
        Ok(mutex) => mutex.into_inner().unwrap_or_else(PoisonError::into_inner),
        Err(shared) => {
            let mut slots = shared.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *slots)
        }
    }
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    Some(parts.join("/"))
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}

/// Group the hashes of a snapshot by folder, for reporting.
#[must_use]
pub fn files_by_folder(hashes: &FileHashes) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for path in hashes.keys() {
        *counts.entry(crate::summarizer::folder_of(path)).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use sift_llm::mock::MockProvider;

    fn fast_config() -> IndexerConfig {
        let mut config = IndexerConfig::default();
        config.embedding.retry.base_delay = std::time::Duration::from_millis(1);
        config
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    const SERVICE: &str = "def load_config(path):\n    \"\"\"Read the service configuration.\"\"\"\n    with open(path) as f:\n        return f.read()\n\n\ndef start_server(port):\n    return serve_forever(port, handler=None)\n";

    #[tokio::test]
    async fn discovery_honours_ignores_and_extensions() {
        let repo = tempfile::tempdir().unwrap();
        write(repo.path(), "app/main.py", SERVICE);
        write(repo.path(), "node_modules/lib/index.js", "function x() {}\n");
        write(repo.path(), "Cargo.lock", "lock\n");
        write(repo.path(), "notes.txt", "text\n");
        write(repo.path(), "README.md", "# Readme\n");

        let indexer = CodeIndexer::new(Arc::new(MockProvider::default()), fast_config());
        let mut report = IndexReport::default();
        let root = std::fs::canonicalize(repo.path()).unwrap();
        let files = indexer
            .discover(&root, &FileHashes::new(), &mut report)
            .await
            .unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "app/main.py"]);
        assert!(files.iter().all(|f| f.status == FileStatus::Added));
    }

    #[tokio::test]
    async fn first_run_builds_aligned_snapshot() {
        let repo = tempfile::tempdir().unwrap();
        let index = tempfile::tempdir().unwrap();
        write(repo.path(), "svc/service.py", SERVICE);
        write(repo.path(), "README.md", "# Service\n\nRuns the thing.\n");

        let mock = Arc::new(MockProvider::default());
        let indexer = CodeIndexer::new(Arc::clone(&mock), fast_config());
        let report = indexer.index_repo(repo.path(), index.path()).await.unwrap();

        assert!(!report.noop);
        assert_eq!(report.files_added, 2);
        assert_eq!(report.fragments_skipped, 0);
        assert!(report.errors.is_empty(), "{:?}", report.errors);

        let snapshot = IndexSnapshot::load(index.path()).await.unwrap().unwrap();
        assert_eq!(snapshot.index.len(), snapshot.fragments.len());
        assert_eq!(report.fragments_total, snapshot.fragments.len());
        assert_eq!(snapshot.meta.file_hashes.len(), 2);
        assert_eq!(snapshot.meta.model, "mock-embedding");

        let levels: HashSet<FragmentLevel> = snapshot.fragments.iter().map(Fragment::level).collect();
        assert!(levels.contains(&FragmentLevel::CodeFragment));
        assert!(levels.contains(&FragmentLevel::Document));
        assert!(levels.contains(&FragmentLevel::FileSummary));
        assert!(levels.contains(&FragmentLevel::FolderSummary));

        let store = FragmentStore::new(index.path());
        for fragment in snapshot.fragments.iter().filter(|f| f.level().is_stored()) {
            assert!(store.load(fragment).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn unchanged_repo_is_a_noop() {
        let repo = tempfile::tempdir().unwrap();
        let index = tempfile::tempdir().unwrap();
        write(repo.path(), "service.py", SERVICE);

        let mock = Arc::new(MockProvider::default());
        let indexer = CodeIndexer::new(Arc::clone(&mock), fast_config());
        let first = indexer.index_repo(repo.path(), index.path()).await.unwrap();
        mock.clear_history();

        let second = indexer.index_repo(repo.path(), index.path()).await.unwrap();
        assert!(second.noop);
        assert_eq!(second.files_unchanged, 1);
        assert_eq!(second.fragments_total, first.fragments_total);
        assert_eq!(mock.embed_calls(), 0);
        assert_eq!(mock.chat_calls(), 0);
    }

    #[tokio::test]
    async fn deleted_file_fragments_and_bodies_are_removed() {
        let repo = tempfile::tempdir().unwrap();
        let index = tempfile::tempdir().unwrap();
        write(repo.path(), "keep.py", SERVICE);
        write(repo.path(), "gone.py", &SERVICE.replace("load_config", "drop_config"));

        let indexer = CodeIndexer::new(Arc::new(MockProvider::default()), fast_config());
        indexer.index_repo(repo.path(), index.path()).await.unwrap();
        let before = IndexSnapshot::load(index.path()).await.unwrap().unwrap();
        let gone: Vec<Fragment> = before
            .fragments
            .iter()
            .filter(|f| f.file() == Some("gone.py"))
            .cloned()
            .collect();
        assert!(!gone.is_empty());

        std::fs::remove_file(repo.path().join("gone.py")).unwrap();
        let report = indexer.index_repo(repo.path(), index.path()).await.unwrap();
        assert_eq!(report.files_deleted, 1);

        let after = IndexSnapshot::load(index.path()).await.unwrap().unwrap();
        assert!(after.fragments.iter().all(|f| f.file() != Some("gone.py")));
        assert!(!after.meta.file_hashes.contains_key("gone.py"));
        let store = FragmentStore::new(index.path());
        for fragment in gone.iter().filter(|f| f.level().is_stored()) {
            assert!(store.load(fragment).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn failed_embeddings_keep_file_out_of_hashes() {
        let repo = tempfile::tempdir().unwrap();
        let index = tempfile::tempdir().unwrap();
        write(repo.path(), "good.py", SERVICE);
        write(repo.path(), "bad.md", "# POISON\n\nThis document never embeds.\n");

        let mut config = fast_config();
        config.embedding.batch_size = 1;
        let mock = Arc::new(MockProvider::default().with_poisoned("POISON"));
        let indexer = CodeIndexer::new(Arc::clone(&mock), config);
        let report = indexer.index_repo(repo.path(), index.path()).await.unwrap();

        assert_eq!(report.fragments_skipped, 1);
        let snapshot = IndexSnapshot::load(index.path()).await.unwrap().unwrap();
        assert!(snapshot.fragments.iter().all(|f| f.file() != Some("bad.md")));
        assert!(snapshot.meta.file_hashes.contains_key("good.py"));
        assert!(!snapshot.meta.file_hashes.contains_key("bad.md"));

        // The failed file is retried and nothing is duplicated.
        let second = indexer.index_repo(repo.path(), index.path()).await.unwrap();
        assert!(!second.noop);
        assert_eq!(second.files_added, 1);
        assert_eq!(second.fragments_total, snapshot.fragments.len());
    }

    #[tokio::test]
    async fn model_change_forces_full_reindex() {
        let repo = tempfile::tempdir().unwrap();
        let index = tempfile::tempdir().unwrap();
        write(repo.path(), "service.py", SERVICE);

        let indexer = CodeIndexer::new(Arc::new(MockProvider::default()), fast_config());
        indexer.index_repo(repo.path(), index.path()).await.unwrap();

        let snapshot = IndexSnapshot::load(index.path()).await.unwrap().unwrap();
        let retagged = IndexSnapshot::new(
            VectorIndex::build(
                snapshot.index.vectors().map(<[f32]>::to_vec).collect(),
                "older-model",
            )
            .unwrap(),
            snapshot.fragments.clone(),
            snapshot.meta.repo_path.clone(),
            snapshot.meta.file_hashes.clone(),
        )
        .unwrap();
        retagged.save(index.path()).await.unwrap();

        let report = indexer.index_repo(repo.path(), index.path()).await.unwrap();
        assert!(!report.noop);
        assert_eq!(report.files_added, 1);
        assert_eq!(report.fragments_embedded, report.fragments_total);
    }

    #[tokio::test]
    async fn dimension_change_reembeds_everything() {
        let repo = tempfile::tempdir().unwrap();
        let index = tempfile::tempdir().unwrap();
        write(repo.path(), "a.py", SERVICE);
        write(repo.path(), "b.py", &SERVICE.replace("start_server", "stop_server"));

        CodeIndexer::new(Arc::new(MockProvider::default()), fast_config())
            .index_repo(repo.path(), index.path())
            .await
            .unwrap();

        write(repo.path(), "b.py", &SERVICE.replace("start_server", "halt_server"));
        let wider = Arc::new(MockProvider::default().with_dimension(96));
        let report = CodeIndexer::new(wider, fast_config())
            .index_repo(repo.path(), index.path())
            .await
            .unwrap();
        assert_eq!(report.fragments_skipped, 0);
        assert_eq!(report.fragments_embedded, report.fragments_total);

        let snapshot = IndexSnapshot::load(index.path()).await.unwrap().unwrap();
        assert_eq!(snapshot.meta.dimension, 96);
    }

    #[tokio::test]
    async fn dot_directories_are_indexed_unless_ignored() {
        let repo = tempfile::tempdir().unwrap();
        let index = tempfile::tempdir().unwrap();
        write(repo.path(), "src/app.py", SERVICE);
        write(repo.path(), ".ci/deploy.py", &SERVICE.replace("start_server", "deploy"));
        write(repo.path(), ".git/hooks/pre_commit.py", SERVICE);
        write(repo.path(), ".venv/lib/site.py", SERVICE);

        let indexer = CodeIndexer::new(Arc::new(MockProvider::default()), fast_config());
        let report = indexer.index_repo(repo.path(), index.path()).await.unwrap();
        assert_eq!(report.files_scanned, 2);

        let snapshot = IndexSnapshot::load(index.path()).await.unwrap().unwrap();
        let hashed: Vec<&str> = snapshot.meta.file_hashes.keys().map(String::as_str).collect();
        assert_eq!(hashed, vec![".ci/deploy.py", "src/app.py"]);
        assert!(snapshot.fragments.iter().any(|f| f.file() == Some(".ci/deploy.py")));
    }

    #[tokio::test]
    async fn rebuild_after_unusable_snapshot_clears_stale_bodies() {
        let repo = tempfile::tempdir().unwrap();
        let index = tempfile::tempdir().unwrap();
        write(repo.path(), "a.py", SERVICE);
        write(repo.path(), "b.py", &SERVICE.replace("load_config", "read_settings"));

        let indexer = CodeIndexer::new(Arc::new(MockProvider::default()), fast_config());
        indexer.index_repo(repo.path(), index.path()).await.unwrap();

        std::fs::remove_file(repo.path().join("b.py")).unwrap();
        std::fs::write(index.path().join(crate::snapshot::FRAGMENTS_FILE), "[]").unwrap();
        assert!(IndexSnapshot::load(index.path()).await.is_err());

        let report = indexer.index_repo(repo.path(), index.path()).await.unwrap();
        assert_eq!(report.files_added, 1);

        let snapshot = IndexSnapshot::load(index.path()).await.unwrap().unwrap();
        let live: HashSet<String> = snapshot
            .fragments
            .iter()
            .filter(|f| f.level().is_stored())
            .filter_map(|f| f.metadata.full_code_path.clone())
            .collect();
        let on_disk: HashSet<String> = std::fs::read_dir(FragmentStore::new(index.path()).dir())
            .unwrap()
            .map(|e| format!("full_fragments/{}", e.unwrap().file_name().to_string_lossy()))
            .collect();
        assert!(!live.is_empty());
        assert_eq!(on_disk, live);
    }

    #[tokio::test]
    async fn model_change_drops_bodies_of_vanished_files() {
        let repo = tempfile::tempdir().unwrap();
        let index = tempfile::tempdir().unwrap();
        write(repo.path(), "keep.py", SERVICE);
        write(repo.path(), "gone.py", &SERVICE.replace("load_config", "drop_config"));

        CodeIndexer::new(Arc::new(MockProvider::default()), fast_config())
            .index_repo(repo.path(), index.path())
            .await
            .unwrap();
        let before = IndexSnapshot::load(index.path()).await.unwrap().unwrap();
        let gone: Vec<Fragment> = before
            .fragments
            .into_iter()
            .filter(|f| f.file() == Some("gone.py") && f.level().is_stored())
            .collect();
        assert!(!gone.is_empty());

        let snapshot = IndexSnapshot::load(index.path()).await.unwrap().unwrap();
        IndexSnapshot::new(
            VectorIndex::build(
                snapshot.index.vectors().map(<[f32]>::to_vec).collect(),
                "older-model",
            )
            .unwrap(),
            snapshot.fragments,
            snapshot.meta.repo_path,
            snapshot.meta.file_hashes,
        )
        .unwrap()
        .save(index.path())
        .await
        .unwrap();

        std::fs::remove_file(repo.path().join("gone.py")).unwrap();
        CodeIndexer::new(Arc::new(MockProvider::default()), fast_config())
            .index_repo(repo.path(), index.path())
            .await
            .unwrap();

        let store = FragmentStore::new(index.path());
        for fragment in &gone {
            assert!(store.load(fragment).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn run_pool_keeps_positions() {
        let out = run_pool((0..20u64).collect(), 3, |n| async move {
            tokio::time::sleep(std::time::Duration::from_millis(20 - n)).await;
            n * 2
        })
        .await;
        let values: Vec<u64> = out.into_iter().map(Option::unwrap).collect();
        assert_eq!(values, (0..20).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn folder_counts() {
        let mut hashes = FileHashes::new();
        hashes.insert("a.py".into(), "1".into());
        hashes.insert("src/b.py".into(), "2".into());
        hashes.insert("src/c.py".into(), "3".into());
        let counts = files_by_folder(&hashes);
        assert_eq!(counts["."], 1);
        assert_eq!(counts["src"], 2);
    }
}
