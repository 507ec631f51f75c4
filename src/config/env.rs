use std::path::PathBuf;

use super::{Config, ProviderKind};

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_llm();
        self.apply_env_overrides_indexing();
        self.apply_env_overrides_retrieval();
        self.apply_env_overrides_storage();
        if let Ok(v) = std::env::var("SIFT_API_KEY")
            && !v.is_empty()
        {
            self.secrets.api_key = Some(v);
        }
    }

    fn apply_env_overrides_llm(&mut self) {
        if let Ok(v) = std::env::var("SIFT_LLM_PROVIDER") {
            match v.to_ascii_lowercase().as_str() {
                "openai" => self.llm.provider = ProviderKind::OpenAi,
                "ollama" => self.llm.provider = ProviderKind::Ollama,
                other => tracing::warn!(value = other, "ignoring unknown SIFT_LLM_PROVIDER"),
            }
        }
        if let Ok(v) = std::env::var("SIFT_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("SIFT_LLM_CHAT_MODEL") {
            self.llm.chat_model = v;
        }
        if let Ok(v) = std::env::var("SIFT_LLM_EMBEDDING_MODEL") {
            self.llm.embedding_model = v;
        }
        if let Ok(v) = std::env::var("SIFT_LLM_TIMEOUT")
            && let Ok(secs) = v.parse::<u64>()
        {
            self.llm.timeout_secs = secs;
        }
        if let Ok(v) = std::env::var("SIFT_LLM_MAX_RETRIES")
            && let Ok(n) = v.parse::<u32>()
        {
            self.llm.max_retries = n;
        }
        if let Ok(v) = std::env::var("SIFT_LLM_CHAT_PROVIDERS") {
            self.llm.chat_providers = split_list(&v);
        }
        if let Ok(v) = std::env::var("SIFT_LLM_EMBEDDING_PROVIDERS") {
            self.llm.embedding_providers = split_list(&v);
        }
    }

    fn apply_env_overrides_indexing(&mut self) {
        if let Ok(v) = std::env::var("SIFT_INDEX_FILE_WORKERS")
            && let Ok(n) = v.parse::<usize>()
        {
            self.indexing.file_workers = n;
        }
        if let Ok(v) = std::env::var("SIFT_INDEX_EMBED_WORKERS")
            && let Ok(n) = v.parse::<usize>()
        {
            self.indexing.embed_workers = n;
        }
        if let Ok(v) = std::env::var("SIFT_INDEX_EMBED_BATCH_SIZE")
            && let Ok(n) = v.parse::<usize>()
        {
            self.indexing.embed_batch_size = n;
        }
        if let Ok(v) = std::env::var("SIFT_INDEX_GAP_WINDOW_LINES")
            && let Ok(n) = v.parse::<usize>()
        {
            self.indexing.gap_window_lines = n;
        }
        if let Ok(v) = std::env::var("SIFT_INDEX_RESPECT_GITIGNORE")
            && let Ok(enabled) = v.parse::<bool>()
        {
            self.indexing.respect_gitignore = enabled;
        }
    }

    fn apply_env_overrides_retrieval(&mut self) {
        if let Ok(v) = std::env::var("SIFT_RETRIEVAL_TOP_K")
            && let Ok(n) = v.parse::<usize>()
        {
            self.retrieval.top_k = n;
        }
        if let Ok(v) = std::env::var("SIFT_RETRIEVAL_OUTPUT_K")
            && let Ok(n) = v.parse::<usize>()
        {
            self.retrieval.output_k = n;
        }
        if let Ok(v) = std::env::var("SIFT_RETRIEVAL_SCORE_THRESHOLD")
            && let Ok(t) = v.parse::<f32>()
        {
            self.retrieval.score_threshold = t.clamp(-1.0, 1.0);
        }
        if let Ok(v) = std::env::var("SIFT_RETRIEVAL_TOKEN_BUDGET")
            && let Ok(n) = v.parse::<usize>()
        {
            self.retrieval.token_budget = n;
        }
    }

    fn apply_env_overrides_storage(&mut self) {
        if let Ok(v) = std::env::var("SIFT_INDEX_ROOT") {
            self.storage.index_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SIFT_CACHE_ENABLED")
            && let Ok(enabled) = v.parse::<bool>()
        {
            self.cache.enabled = enabled;
        }
        if let Ok(v) = std::env::var("SIFT_CACHE_PATH") {
            self.cache.path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("SIFT_CACHE_TTL")
            && let Ok(secs) = v.parse::<u64>()
        {
            self.cache.ttl_secs = secs;
        }
    }
}
