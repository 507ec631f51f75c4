//! Embedding and completion providers behind one normalized interface.

pub mod any;
pub mod error;
pub mod http;
#[cfg(feature = "mock")]
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod provider;
pub mod retry;
pub mod schema;

pub use any::AnyProvider;
pub use error::LlmError;
pub use provider::{ChatOptions, LlmProvider, Message, Role};
pub use retry::RetryPolicy;
