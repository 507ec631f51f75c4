//! Query pipeline: embed, search, filter, cache, rerank, synthesize.

use std::path::Path;
use std::sync::Arc;

use sift_llm::{LlmError, LlmProvider};

use crate::cache::{BestEffortCache, cache_key};
use crate::embedding::{RetryPolicy, embed_with_retry};
use crate::error::{IndexError, Result};
use crate::fragment::Fragment;
use crate::rerank::rerank;
use crate::snapshot::IndexSnapshot;
use crate::store::FragmentStore;
use crate::synthesis::{Synthesis, SynthesisConfig, synthesize};

/// Retrieval configuration.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Nearest neighbours fetched from the vector index.
    pub top_k: usize,
    /// Fragments kept after reranking.
    pub output_k: usize,
    /// Hits must score strictly above this cosine similarity.
    pub score_threshold: f32,
    /// Hits sent to the reranker.
    pub rerank_candidates: usize,
    /// Score given to candidates the reranker did not score.
    pub default_rerank_score: f32,
    pub token_budget: usize,
    pub fragment_preview_chars: usize,
    /// Leading results that take part in the cache key.
    pub cache_key_results: usize,
    pub cache_key_prefix_chars: usize,
    /// Retry policy of the query embedding.
    pub embed_retry: RetryPolicy,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 20,
            output_k: 5,
            score_threshold: 0.3,
            rerank_candidates: 25,
            default_rerank_score: 5.0,
            token_budget: 15_000,
            fragment_preview_chars: 1500,
            cache_key_results: 5,
            cache_key_prefix_chars: 100,
            embed_retry: RetryPolicy::default(),
        }
    }
}

/// Per-query overrides of [`RetrievalConfig`].
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub top_k: Option<usize>,
    pub output_k: Option<usize>,
    pub token_budget: Option<usize>,
    pub use_cache: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top_k: None,
            output_k: None,
            token_budget: None,
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOrigin {
    /// Served from the result cache.
    Cache,
    /// Model synthesis with expanded fragments.
    Synthesized,
    /// Rendered fragments without model prose.
    Rendered,
}

#[derive(Debug, Clone)]
pub struct ContextAnswer {
    pub text: String,
    pub origin: AnswerOrigin,
    /// Fragments whose full section is in `text`. Empty for cached answers.
    pub fragments: Vec<Fragment>,
}

#[derive(Debug, Clone)]
pub enum RetrievalOutcome {
    /// No hit cleared the similarity threshold.
    NoRelevantContext,
    Answer(ContextAnswer),
}

/// Retrieves curated context from one persisted snapshot.
pub struct ContextRetriever<P> {
    snapshot: IndexSnapshot,
    store: FragmentStore,
    provider: Arc<P>,
    cache: BestEffortCache,
    config: RetrievalConfig,
}

impl<P: LlmProvider> ContextRetriever<P> {
    /// Load the snapshot in `index_dir`. Returns `None` when there is no
    /// index, or when its files disagree with each other.
    ///
    /// # Errors
    ///
    /// Returns an error if a snapshot file exists but cannot be read.
    pub async fn open(
        index_dir: &Path,
        provider: Arc<P>,
        cache: BestEffortCache,
        config: RetrievalConfig,
    ) -> Result<Option<Self>> {
        let snapshot = match IndexSnapshot::load(index_dir).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(None),
            Err(IndexError::SnapshotMismatch(detail)) => {
                tracing::warn!(%detail, "inconsistent index snapshot, treating as absent");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if snapshot.meta.model != provider.embedding_model() {
            tracing::warn!(
                index = %snapshot.meta.model,
                provider = provider.embedding_model(),
                "index was built with a different embedding model"
            );
        }
        tracing::debug!(fragments = snapshot.fragments.len(), "index loaded");
        Ok(Some(Self {
            snapshot,
            store: FragmentStore::new(index_dir),
            provider,
            cache,
            config,
        }))
    }

    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.snapshot.fragments.len()
    }

    /// Answer `query` from the index.
    ///
    /// # Errors
    ///
    /// Returns an error only if the query cannot be embedded or its dimension
    /// does not match the index. Rerank, synthesis and cache failures degrade
    /// the answer instead.
    pub async fn retrieve(&self, query: &str, options: &QueryOptions) -> Result<RetrievalOutcome> {
        let top_k = options.top_k.unwrap_or(self.config.top_k);
        let output_k = options.output_k.unwrap_or(self.config.output_k);
        let token_budget = options.token_budget.unwrap_or(self.config.token_budget);

        let query_vector = self.embed_query(query).await?;
        let hits = self.snapshot.index.search(&query_vector, top_k)?;
        let results: Vec<&Fragment> = hits
            .iter()
            .filter(|hit| hit.score > self.config.score_threshold)
            .filter_map(|hit| self.snapshot.fragments.get(hit.position))
            .collect();
        tracing::info!(hits = hits.len(), relevant = results.len(), "search finished");
        if results.is_empty() {
            return Ok(RetrievalOutcome::NoRelevantContext);
        }

        let key = cache_key(
            query,
            results.iter().map(|f| f.text.as_str()),
            self.config.cache_key_results,
            self.config.cache_key_prefix_chars,
        );
        if options.use_cache
            && let Some(text) = self.cache.get(&key).await
        {
            tracing::info!("cache hit");
            return Ok(RetrievalOutcome::Answer(ContextAnswer {
                text,
                origin: AnswerOrigin::Cache,
                fragments: Vec::new(),
            }));
        }

        let candidates: Vec<Fragment> = results
            .iter()
            .take(self.config.rerank_candidates.max(1))
            .map(|f| (*f).clone())
            .collect();
        let ranking = rerank(
            self.provider.as_ref(),
            query,
            &candidates,
            self.config.default_rerank_score,
        )
        .await;
        let working: Vec<Fragment> = ranking
            .order()
            .into_iter()
            .take(output_k.max(1))
            .map(|i| candidates[i].clone())
            .collect();

        let synthesis = synthesize(
            self.provider.as_ref(),
            &self.store,
            query,
            &working,
            &SynthesisConfig {
                token_budget,
                preview_chars: self.config.fragment_preview_chars,
            },
        )
        .await;
        let origin = match synthesis {
            Synthesis::Synthesized { .. } => AnswerOrigin::Synthesized,
            Synthesis::Degraded { .. } => AnswerOrigin::Rendered,
        };
        let fragments = synthesis
            .included()
            .iter()
            .filter_map(|&i| working.get(i).cloned())
            .collect();
        let text = synthesis.text().to_owned();

        if options.use_cache {
            self.cache.put(&key, &text).await;
        }
        tracing::info!(
            origin = ?origin,
            reranked = !ranking.is_degraded(),
            "context assembled"
        );
        Ok(RetrievalOutcome::Answer(ContextAnswer {
            text,
            origin,
            fragments,
        }))
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let mut vectors = embed_with_retry(
            self.provider.as_ref(),
            &[query.to_owned()],
            self.config.embed_retry,
        )
        .await?;
        vectors.pop().ok_or_else(|| {
            LlmError::EmptyResponse {
                provider: self.provider.name().to_owned(),
            }
            .into()
        })
    }
}
