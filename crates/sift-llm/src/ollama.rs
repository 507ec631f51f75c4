use ollama_rs::Ollama;
use ollama_rs::generation::chat::ChatMessage;
use ollama_rs::generation::chat::request::ChatMessageRequest;
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;

use crate::error::LlmError;
use crate::provider::{ChatOptions, LlmProvider, Message, Role, ensure_embedding_count};
use crate::schema::{parse_structured, strict_schema};

/// Adapter for a local Ollama server.
///
/// Ollama applies the model's own sampling defaults, so `ChatOptions` are
/// accepted but not forwarded.
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    client: Ollama,
    chat_model: String,
    embedding_model: String,
}

impl OllamaProvider {
    #[must_use]
    pub fn new(base_url: &str, chat_model: String, embedding_model: String) -> Self {
        let (host, port) = parse_host_port(base_url);
        Self {
            client: Ollama::new(host, port),
            chat_model,
            embedding_model,
        }
    }

    async fn send(&self, messages: Vec<ChatMessage>) -> Result<String, LlmError> {
        let request = ChatMessageRequest::new(self.chat_model.clone(), messages);
        let response = self
            .client
            .send_chat_messages(request)
            .await
            .map_err(|e| LlmError::Other(format!("Ollama chat request failed: {e}")))?;

        let content = response.message.content;
        if content.trim().is_empty() {
            return Err(LlmError::EmptyResponse {
                provider: "ollama".into(),
            });
        }
        Ok(content)
    }
}

impl LlmProvider for OllamaProvider {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "ollama"
    }

    fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    async fn chat(&self, messages: &[Message], _options: ChatOptions) -> Result<String, LlmError> {
        self.send(messages.iter().map(convert_message).collect()).await
    }

    async fn chat_typed<T>(&self, messages: &[Message], _options: ChatOptions) -> Result<T, LlmError>
    where
        T: DeserializeOwned + JsonSchema + Send + 'static,
    {
        let schema = strict_schema::<T>()?;
        let mut converted = vec![ChatMessage::system(format!(
            "Respond with a single JSON object matching this JSON schema and nothing else:\n{schema}"
        ))];
        converted.extend(messages.iter().map(convert_message));
        let content = self.send(converted).await?;
        parse_structured(&content)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = GenerateEmbeddingsRequest::new(
            self.embedding_model.clone(),
            EmbeddingsInput::Multiple(texts.to_vec()),
        );

        let response = self
            .client
            .generate_embeddings(request)
            .await
            .map_err(|e| LlmError::Other(format!("Ollama embedding request failed: {e}")))?;

        ensure_embedding_count("ollama", texts.len(), &response.embeddings)?;
        Ok(response.embeddings)
    }
}

fn convert_message(msg: &Message) -> ChatMessage {
    let text = msg.content.clone();
    match msg.role {
        Role::System => ChatMessage::system(text),
        Role::User => ChatMessage::user(text),
        Role::Assistant => ChatMessage::assistant(text),
    }
}

fn parse_host_port(url: &str) -> (String, u16) {
    let url = url.trim_end_matches('/');
    if let Some(colon_pos) = url.rfind(':') {
        let port_str = &url[colon_pos + 1..];
        if let Ok(port) = port_str.parse::<u16>() {
            let host = url[..colon_pos].to_string();
            return (host, port);
        }
    }
    (url.to_string(), 11434)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port_with_port() {
        let (host, port) = parse_host_port("http://localhost:11434");
        assert_eq!(host, "http://localhost");
        assert_eq!(port, 11434);
    }

    #[test]
    fn parse_host_port_custom_port_and_slash() {
        let (host, port) = parse_host_port("http://gpu-box:9000/");
        assert_eq!(host, "http://gpu-box");
        assert_eq!(port, 9000);
    }

    #[test]
    fn parse_host_port_without_port_defaults() {
        let (host, port) = parse_host_port("http://ollama.internal");
        assert_eq!(host, "http://ollama.internal");
        assert_eq!(port, 11434);
    }

    #[test]
    fn reports_models() {
        let provider = OllamaProvider::new(
            "http://localhost:11434",
            "gemma3:1b".into(),
            "qwen3-embedding:0.6b".into(),
        );
        assert_eq!(provider.name(), "ollama");
        assert_eq!(provider.embedding_model(), "qwen3-embedding:0.6b");
        assert_eq!(provider.chat_model, "gemma3:1b");
    }

    #[tokio::test]
    async fn empty_batch_skips_request() {
        let provider = OllamaProvider::new("http://127.0.0.1:1", "m".into(), "e".into());
        assert!(provider.embed_batch(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_server_is_an_error() {
        let provider = OllamaProvider::new("http://127.0.0.1:1", "m".into(), "e".into());
        let result = provider.embed_batch(&["text".to_owned()]).await;
        assert!(result.is_err());
    }
}
