//! Chat-completion access: the HTTP client, prompts and the model catalogue.

pub mod client;
pub mod models;
pub mod prompts;

pub use client::{
    classify, completions_url, AiSettings, ChatMessage, CompletionClient, CompletionRequest,
    OpenAiClient, DEFAULT_MODEL, DEFAULT_REQUEST_TIMEOUT_SECS,
};
pub use models::{default_models, fetch_models, list_models, ModelInfo, DEFAULT_MODELS};
