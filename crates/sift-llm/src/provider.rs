//! Provider-neutral chat and embedding interface.
//!
//! Every backend adapter normalizes its wire responses into plain strings,
//! typed values or vectors, so callers never see provider-specific shapes.

use std::future::Future;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Per-call generation knobs.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
}

impl ChatOptions {
    #[must_use]
    pub fn with_temperature(temperature: f32) -> Self {
        Self {
            temperature: Some(temperature),
        }
    }
}

pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Identifier of the model used by [`LlmProvider::embed_batch`], recorded
    /// as index provenance.
    fn embedding_model(&self) -> &str;

    /// Send a chat completion and return the assistant text.
    fn chat(
        &self,
        messages: &[Message],
        options: ChatOptions,
    ) -> impl Future<Output = Result<String, LlmError>> + Send;

    /// Send a chat completion constrained to the JSON schema of `T`.
    fn chat_typed<T>(
        &self,
        messages: &[Message],
        options: ChatOptions,
    ) -> impl Future<Output = Result<T, LlmError>> + Send
    where
        T: DeserializeOwned + JsonSchema + Send + 'static;

    /// Embed `texts`, returning one vector per input in input order.
    fn embed_batch(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, LlmError>> + Send;

    fn embed(&self, text: &str) -> impl Future<Output = Result<Vec<f32>, LlmError>> + Send {
        let batch = [text.to_owned()];
        async move {
            let mut vectors = self.embed_batch(&batch).await?;
            vectors.pop().ok_or_else(|| LlmError::EmptyResponse {
                provider: self.name().to_owned(),
            })
        }
    }
}

/// Reject embedding responses whose length does not match the request.
///
/// # Errors
///
/// Returns `LlmError::EmbeddingCountMismatch` when the counts differ.
pub fn ensure_embedding_count(
    provider: &str,
    expected: usize,
    vectors: &[Vec<f32>],
) -> Result<(), LlmError> {
    if vectors.len() == expected {
        Ok(())
    } else {
        Err(LlmError::EmbeddingCountMismatch {
            provider: provider.to_owned(),
            expected,
            actual: vectors.len(),
        })
    }
}
