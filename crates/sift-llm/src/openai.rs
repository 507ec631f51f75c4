use std::fmt;
use std::time::Duration;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::provider::{ChatOptions, LlmProvider, Message, ensure_embedding_count};
use crate::retry::{RetryPolicy, send_with_retry};
use crate::schema::{schema_name, strict_schema};

const DEFAULT_MAX_RETRIES: u32 = 5;
const RATE_LIMIT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Adapter for OpenAI-compatible `/chat/completions` and `/embeddings`
/// endpoints (OpenAI, OpenRouter and self-hosted gateways).
#[derive(Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    chat_model: String,
    embedding_model: String,
    retry: RetryPolicy,
    chat_providers: Vec<String>,
    embedding_providers: Vec<String>,
}

impl fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("client", &"<reqwest::Client>")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("chat_model", &self.chat_model)
            .field("embedding_model", &self.embedding_model)
            .field("retry", &self.retry)
            .field("chat_providers", &self.chat_providers)
            .field("embedding_providers", &self.embedding_providers)
            .finish()
    }
}

impl OpenAiProvider {
    #[must_use]
    pub fn new(
        api_key: String,
        mut base_url: String,
        chat_model: String,
        embedding_model: String,
    ) -> Self {
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            chat_model,
            embedding_model,
            retry: RetryPolicy {
                attempts: DEFAULT_MAX_RETRIES + 1,
                base_delay: RATE_LIMIT_BASE_DELAY,
            },
            chat_providers: Vec::new(),
            embedding_providers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry.attempts = max_retries.saturating_add(1);
        self
    }

    /// Restrict upstream routing to the named providers (OpenRouter `provider.only`).
    /// Empty lists leave routing to the gateway.
    #[must_use]
    pub fn with_provider_routing(
        mut self,
        chat_providers: Vec<String>,
        embedding_providers: Vec<String>,
    ) -> Self {
        self.chat_providers = chat_providers;
        self.embedding_providers = embedding_providers;
        self
    }

    async fn post<B: Serialize + ?Sized>(&self, endpoint: &str, body: &B) -> Result<String, LlmError> {
        let url = format!("{}/{endpoint}", self.base_url);
        let response = send_with_retry(&self.retry, "openai", || {
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
        })
        .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            tracing::error!(%status, endpoint, "OpenAI-compatible API error: {text}");
            return Err(LlmError::Api {
                provider: "openai".into(),
                status: status.as_u16(),
            });
        }
        Ok(text)
    }

    async fn complete(
        &self,
        messages: &[Message],
        options: ChatOptions,
        response_format: Option<ResponseFormat<'_>>,
    ) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: &self.chat_model,
            messages,
            temperature: options.temperature,
            response_format,
            provider: routing(&self.chat_providers),
        };
        let text = self.post("chat/completions", &body).await?;
        let resp: ChatResponse = serde_json::from_str(&text)?;
        resp.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|content| !content.is_empty())
            .ok_or_else(|| LlmError::EmptyResponse {
                provider: "openai".into(),
            })
    }
}

fn routing(providers: &[String]) -> Option<ProviderRouting<'_>> {
    (!providers.is_empty()).then_some(ProviderRouting { only: providers })
}

impl LlmProvider for OpenAiProvider {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "openai"
    }

    fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    async fn chat(&self, messages: &[Message], options: ChatOptions) -> Result<String, LlmError> {
        self.complete(messages, options, None).await
    }

    async fn chat_typed<T>(&self, messages: &[Message], options: ChatOptions) -> Result<T, LlmError>
    where
        T: DeserializeOwned + JsonSchema + Send + 'static,
    {
        let format = ResponseFormat {
            r#type: "json_schema",
            json_schema: JsonSchemaFormat {
                name: schema_name::<T>(),
                schema: strict_schema::<T>()?,
                strict: true,
            },
        };
        let content = self.complete(messages, options, Some(format)).await?;
        crate::schema::parse_structured(&content)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = EmbeddingRequest {
            input: texts,
            model: &self.embedding_model,
            provider: routing(&self.embedding_providers),
        };
        let text = self.post("embeddings", &body).await?;
        let mut resp: EmbeddingResponse = serde_json::from_str(&text)?;
        resp.data.sort_by_key(|d| d.index);
        let vectors: Vec<Vec<f32>> = resp.data.into_iter().map(|d| d.embedding).collect();
        ensure_embedding_count("openai", texts.len(), &vectors)?;
        Ok(vectors)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<ProviderRouting<'a>>,
}

#[derive(Serialize)]
struct ProviderRouting<'a> {
    only: &'a [String],
}

#[derive(Serialize)]
struct ResponseFormat<'a> {
    r#type: &'a str,
    json_schema: JsonSchemaFormat<'a>,
}

#[derive(Serialize)]
struct JsonSchemaFormat<'a> {
    name: &'a str,
    schema: serde_json::Value,
    strict: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<ProviderRouting<'a>>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}
