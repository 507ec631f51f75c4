//! Test-only mock LLM provider.

use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use schemars::JsonSchema;
use serde::de::DeserializeOwned;

use crate::error::LlmError;
use crate::provider::{ChatOptions, LlmProvider, Message};
use crate::schema::parse_structured;

#[derive(Debug, Clone)]
pub struct MockProvider {
    responses: Arc<Mutex<VecDeque<String>>>,
    pub default_response: String,
    pub dimension: usize,
    pub fail_chat: bool,
    pub fail_embed: bool,
    /// Texts containing any of these markers never embed.
    pub poisoned: Vec<String>,
    /// Milliseconds to sleep before answering.
    pub delay_ms: u64,
    pending_embed_failures: Arc<AtomicUsize>,
    chat_calls: Arc<AtomicUsize>,
    embed_calls: Arc<AtomicUsize>,
    embedded: Arc<Mutex<Vec<String>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            default_response: "mock response".into(),
            dimension: 64,
            fail_chat: false,
            fail_embed: false,
            poisoned: Vec::new(),
            delay_ms: 0,
            pending_embed_failures: Arc::new(AtomicUsize::new(0)),
            chat_calls: Arc::new(AtomicUsize::new(0)),
            embed_calls: Arc::new(AtomicUsize::new(0)),
            embedded: Arc::new(Mutex::new(Vec::new())),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl MockProvider {
    /// Chat replies are served in order, then `default_response` forever.
    #[must_use]
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failing_chat() -> Self {
        Self {
            fail_chat: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_default_response(mut self, response: impl Into<String>) -> Self {
        self.default_response = response.into();
        self
    }

    #[must_use]
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    /// Make the next `count` calls to `embed_batch` fail.
    #[must_use]
    pub fn with_embed_failures(self, count: usize) -> Self {
        self.pending_embed_failures.store(count, Ordering::SeqCst);
        self
    }

    #[must_use]
    pub fn with_poisoned(mut self, marker: impl Into<String>) -> Self {
        self.poisoned.push(marker.into());
        self
    }

    #[must_use]
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    #[must_use]
    pub fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    /// Every text successfully embedded so far, in call order.
    #[must_use]
    pub fn embedded_texts(&self) -> Vec<String> {
        self.embedded.lock().map(|g| g.clone()).unwrap_or_default()
    }

    /// Concatenated contents of every chat request, in call order.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn clear_history(&self) {
        if let Ok(mut embedded) = self.embedded.lock() {
            embedded.clear();
        }
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.clear();
        }
        self.chat_calls.store(0, Ordering::SeqCst);
        self.embed_calls.store(0, Ordering::SeqCst);
    }

    /// Deterministic bag-of-words vector: texts sharing words point the same way.
    #[must_use]
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimension.max(1)];
        let buckets = vector.len();
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            let bucket = usize::try_from(hasher.finish() % buckets as u64).unwrap_or(0);
            vector[bucket] += 1.0;
        }
        vector[buckets - 1] += 0.05;
        vector
    }

    async fn pause(&self) {
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
    }

    fn next_reply(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            let joined: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
            prompts.push(joined.join("\n"));
        }
        if self.fail_chat {
            return Err(LlmError::Other("mock LLM error".into()));
        }
        let mut responses = self
            .responses
            .lock()
            .map_err(|_| LlmError::Other("mock response queue poisoned".into()))?;
        Ok(responses
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone()))
    }
}

impl LlmProvider for MockProvider {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "mock"
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn embedding_model(&self) -> &str {
        "mock-embedding"
    }

    async fn chat(&self, messages: &[Message], _options: ChatOptions) -> Result<String, LlmError> {
        self.pause().await;
        self.next_reply(messages)
    }

    async fn chat_typed<T>(&self, messages: &[Message], _options: ChatOptions) -> Result<T, LlmError>
    where
        T: DeserializeOwned + JsonSchema + Send + 'static,
    {
        self.pause().await;
        let reply = self.next_reply(messages)?;
        parse_structured(&reply)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        self.pause().await;
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_embed {
            return Err(LlmError::Other("mock embedding error".into()));
        }
        let pending = self.pending_embed_failures.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
        if pending.is_ok() {
            return Err(LlmError::Other("mock transient embedding error".into()));
        }
        if texts
            .iter()
            .any(|t| self.poisoned.iter().any(|marker| t.contains(marker.as_str())))
        {
            return Err(LlmError::Other("mock poisoned batch".into()));
        }
        if let Ok(mut embedded) = self.embedded.lock() {
            embedded.extend(texts.iter().cloned());
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}
