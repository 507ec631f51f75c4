use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sift_index::embedding::{EmbeddingConfig, RetryPolicy};
use sift_index::extractor::ExtractorConfig;
use sift_index::summarizer::SummaryConfig;
use sift_index::{CacheConfig, IndexerConfig, RetrievalConfig};

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub retrieval: RetrievalSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(skip)]
    pub secrets: ResolvedSecrets,
}

/// Provider backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    Ollama,
}

impl ProviderKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}

fn default_chat_model() -> String {
    "openai/gpt-4o-mini".into()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    5
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Rate-limit retries inside the HTTP adapter.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// OpenRouter `provider.only` whitelist for chat calls.
    #[serde(default)]
    pub chat_providers: Vec<String>,
    #[serde(default)]
    pub embedding_providers: Vec<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            base_url: default_base_url(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            chat_providers: Vec::new(),
            embedding_providers: Vec::new(),
        }
    }
}

fn default_supported_extensions() -> Vec<String> {
    IndexerConfig::default().supported_extensions
}

fn default_ignored_dirs() -> Vec<String> {
    IndexerConfig::default().ignored_dirs
}

fn default_ignored_files() -> Vec<String> {
    IndexerConfig::default().ignored_files
}

fn default_gap_window_lines() -> usize {
    50
}

fn default_min_fragment_chars() -> usize {
    20
}

fn default_file_workers() -> usize {
    8
}

fn default_embed_workers() -> usize {
    32
}

fn default_embed_batch_size() -> usize {
    32
}

fn default_embed_attempts() -> u32 {
    3
}

fn default_embed_backoff_ms() -> u64 {
    500
}

fn default_summary_min_chars() -> usize {
    100
}

fn default_summary_input_chars() -> usize {
    3500
}

fn default_folder_summary_files() -> usize {
    8
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexingConfig {
    #[serde(default = "default_supported_extensions")]
    pub supported_extensions: Vec<String>,
    #[serde(default = "default_ignored_dirs")]
    pub ignored_dirs: Vec<String>,
    /// Glob patterns matched against file names.
    #[serde(default = "default_ignored_files")]
    pub ignored_files: Vec<String>,
    #[serde(default = "default_gap_window_lines")]
    pub gap_window_lines: usize,
    #[serde(default = "default_min_fragment_chars")]
    pub min_fragment_chars: usize,
    #[serde(default = "default_file_workers")]
    pub file_workers: usize,
    #[serde(default = "default_embed_workers")]
    pub embed_workers: usize,
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
    #[serde(default = "default_embed_attempts")]
    pub embed_attempts: u32,
    #[serde(default = "default_embed_backoff_ms")]
    pub embed_backoff_ms: u64,
    #[serde(default = "default_summary_min_chars")]
    pub summary_min_chars: usize,
    #[serde(default = "default_summary_input_chars")]
    pub summary_input_chars: usize,
    #[serde(default = "default_folder_summary_files")]
    pub folder_summary_files: usize,
    #[serde(default = "default_true")]
    pub respect_gitignore: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            supported_extensions: default_supported_extensions(),
            ignored_dirs: default_ignored_dirs(),
            ignored_files: default_ignored_files(),
            gap_window_lines: default_gap_window_lines(),
            min_fragment_chars: default_min_fragment_chars(),
            file_workers: default_file_workers(),
            embed_workers: default_embed_workers(),
            embed_batch_size: default_embed_batch_size(),
            embed_attempts: default_embed_attempts(),
            embed_backoff_ms: default_embed_backoff_ms(),
            summary_min_chars: default_summary_min_chars(),
            summary_input_chars: default_summary_input_chars(),
            folder_summary_files: default_folder_summary_files(),
            respect_gitignore: true,
        }
    }
}

impl IndexingConfig {
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.embed_attempts.max(1),
            base_delay: Duration::from_millis(self.embed_backoff_ms),
        }
    }

    #[must_use]
    pub fn to_indexer_config(&self) -> IndexerConfig {
        IndexerConfig {
            extractor: ExtractorConfig {
                min_fragment_chars: self.min_fragment_chars,
                gap_window_lines: self.gap_window_lines.max(1),
            },
            embedding: EmbeddingConfig {
                batch_size: self.embed_batch_size.max(1),
                workers: self.embed_workers.max(1),
                retry: self.retry_policy(),
            },
            summary: SummaryConfig {
                min_chars: self.summary_min_chars,
                input_chars: self.summary_input_chars,
                folder_files: self.folder_summary_files,
            },
            supported_extensions: self.supported_extensions.clone(),
            ignored_dirs: self.ignored_dirs.clone(),
            ignored_files: self.ignored_files.clone(),
            file_workers: self.file_workers.max(1),
            respect_gitignore: self.respect_gitignore,
        }
    }
}

fn default_top_k() -> usize {
    20
}

fn default_output_k() -> usize {
    5
}

fn default_score_threshold() -> f32 {
    0.3
}

fn default_rerank_candidates() -> usize {
    25
}

fn default_rerank_score() -> f32 {
    5.0
}

fn default_token_budget() -> usize {
    15_000
}

fn default_fragment_preview_chars() -> usize {
    1500
}

fn default_cache_key_results() -> usize {
    5
}

fn default_cache_key_prefix_chars() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalSection {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_output_k")]
    pub output_k: usize,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    #[serde(default = "default_rerank_candidates")]
    pub rerank_candidates: usize,
    #[serde(default = "default_rerank_score")]
    pub default_rerank_score: f32,
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_fragment_preview_chars")]
    pub fragment_preview_chars: usize,
    #[serde(default = "default_cache_key_results")]
    pub cache_key_results: usize,
    #[serde(default = "default_cache_key_prefix_chars")]
    pub cache_key_prefix_chars: usize,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            output_k: default_output_k(),
            score_threshold: default_score_threshold(),
            rerank_candidates: default_rerank_candidates(),
            default_rerank_score: default_rerank_score(),
            token_budget: default_token_budget(),
            fragment_preview_chars: default_fragment_preview_chars(),
            cache_key_results: default_cache_key_results(),
            cache_key_prefix_chars: default_cache_key_prefix_chars(),
        }
    }
}

impl RetrievalSection {
    /// Query embeddings reuse the batch retry policy of `[indexing]`.
    #[must_use]
    pub fn to_retrieval_config(&self, embed_retry: RetryPolicy) -> RetrievalConfig {
        RetrievalConfig {
            top_k: self.top_k.max(1),
            output_k: self.output_k.max(1),
            score_threshold: self.score_threshold,
            rerank_candidates: self.rerank_candidates.max(1),
            default_rerank_score: self.default_rerank_score,
            token_budget: self.token_budget,
            fragment_preview_chars: self.fragment_preview_chars,
            cache_key_results: self.cache_key_results,
            cache_key_prefix_chars: self.cache_key_prefix_chars,
            embed_retry,
        }
    }
}

fn default_ttl_secs() -> u64 {
    86_400
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Defaults to `<index_root>/cache.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_index_root() -> PathBuf {
    PathBuf::from(".sift/indexes")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_index_root")]
    pub index_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            index_root: default_index_root(),
        }
    }
}

/// Values that never come from the config file.
#[derive(Default)]
pub struct ResolvedSecrets {
    pub api_key: Option<String>,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Config {
    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            enabled: self.cache.enabled,
            path: self
                .cache
                .path
                .clone()
                .unwrap_or_else(|| self.storage.index_root.join("cache.db")),
            ttl: Duration::from_secs(self.cache.ttl_secs),
        }
    }
}
