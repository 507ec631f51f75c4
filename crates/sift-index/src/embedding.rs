//! Concurrent batch embedding with per-batch retry.
//!
//! Batches run on a bounded pool and write into pre-sized slots keyed by
//! their offset, so the output order never depends on completion order. A
//! batch that keeps failing leaves its slots empty and the run continues.

use std::sync::{Arc, Mutex, PoisonError};

pub use sift_llm::RetryPolicy;
use sift_llm::retry::Step;
use sift_llm::{LlmError, LlmProvider};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::vector_index::l2_norm;

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub batch_size: usize,
    pub workers: usize,
    pub retry: RetryPolicy,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            workers: 32,
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of embedding a list of texts; `vectors[i]` belongs to input `i`.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingOutcome {
    pub vectors: Vec<Option<Vec<f32>>>,
    pub failed_batches: usize,
}

impl EmbeddingOutcome {
    /// Inputs left without a vector.
    #[must_use]
    pub fn missing(&self) -> usize {
        self.vectors.iter().filter(|v| v.is_none()).count()
    }

    /// Drop vectors that cannot enter an index: wrong dimension, zero or
    /// non-finite. The dimension is `expected`, or that of the first vector.
    /// Returns the dimension used, if any vector was present.
    pub fn retain_valid(&mut self, expected: Option<usize>) -> Option<usize> {
        let dimension = expected.or_else(|| self.vectors.iter().flatten().map(Vec::len).next())?;
        for slot in &mut self.vectors {
            let invalid = slot.as_ref().is_some_and(|v| {
                let norm = l2_norm(v);
                v.len() != dimension || norm == 0.0 || !norm.is_finite()
            });
            if invalid {
                tracing::warn!(dimension, "discarding unusable embedding");
                *slot = None;
            }
        }
        Some(dimension)
    }
}

/// Embed one batch under `policy`. A reply with the wrong number of vectors
/// counts as a failed attempt.
///
/// # Errors
///
/// Returns the last provider error once every attempt has failed.
pub async fn embed_with_retry<P: LlmProvider>(
    provider: &P,
    texts: &[String],
    policy: RetryPolicy,
) -> Result<Vec<Vec<f32>>, LlmError> {
    policy
        .run(provider.name(), || async move {
            let error = match provider.embed_batch(texts).await {
                Ok(vectors) if vectors.len() == texts.len() => return Step::Done(vectors),
                Ok(vectors) => LlmError::EmbeddingCountMismatch {
                    provider: provider.name().to_owned(),
                    expected: texts.len(),
                    actual: vectors.len(),
                },
                Err(e) => e,
            };
            Step::Retry { error, wait: None }
        })
        .await
}

pub struct EmbeddingPipeline<P> {
    provider: Arc<P>,
    config: EmbeddingConfig,
}

impl<P: LlmProvider + 'static> EmbeddingPipeline<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, config: EmbeddingConfig) -> Self {
        Self { provider, config }
    }

    /// Embed `texts` in batches on a bounded worker pool.
    pub async fn embed_all(&self, texts: Vec<String>) -> EmbeddingOutcome {
        let total = texts.len();
        if total == 0 {
            return EmbeddingOutcome::default();
        }
        let batch_size = self.config.batch_size.max(1);
        let slots: Arc<Mutex<Vec<Option<Vec<f32>>>>> = Arc::new(Mutex::new(vec![None; total]));
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks = JoinSet::new();

        tracing::info!(
            texts = total,
            batches = total.div_ceil(batch_size),
            "embedding started"
        );

        for (batch_index, chunk) in texts.chunks(batch_size).enumerate() {
            let offset = batch_index * batch_size;
            let batch = chunk.to_vec();
            let provider = Arc::clone(&self.provider);
            let slots = Arc::clone(&slots);
            let semaphore = Arc::clone(&semaphore);
            let policy = self.config.retry;

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return false;
                };
                match embed_with_retry(provider.as_ref(), &batch, policy).await {
                    Ok(vectors) => {
                        let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
                        for (i, vector) in vectors.into_iter().enumerate() {
                            slots[offset + i] = Some(vector);
                        }
                        true
                    }
                    Err(e) => {
                        tracing::warn!(
                            offset,
                            size = batch.len(),
                            error = %e,
                            "embedding batch skipped after retries"
                        );
                        false
                    }
                }
            });
        }

        let mut failed_batches = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => {}
                Ok(false) => failed_batches += 1,
                Err(e) => {
                    tracing::warn!("embedding worker failed: {e:#}");
                    failed_batches += 1;
                }
            }
        }

        let vectors = match Arc::try_unwrap(slots) {
            Ok(mutex) => mutex.into_inner().unwrap_or_else(PoisonError::into_inner),
            Err(shared) => shared
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        };
        let outcome = EmbeddingOutcome {
            vectors,
            failed_batches,
        };
        tracing::info!(
            embedded = total - outcome.missing(),
            skipped = outcome.missing(),
            failed_batches,
            "embedding finished"
        );
        outcome
    }
}
