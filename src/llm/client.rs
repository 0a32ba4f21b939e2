use super::prompts;
use crate::error::{Error, Result};
use crate::smart::planner::BatchEntry;
use crate::util::{one_line, truncate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const COMPLETIONS_PATH: &str = "/chat/completions";
/// Per-request timeout unless the config overrides it.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
const TEMPERATURE: f32 = 0.7;
/// Provider error bodies are cut to this many characters in messages.
const ERROR_BODY_MAX_CHARS: usize = 200;

/// Everything needed to talk to an OpenAI-compatible endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiSettings {
    pub api_key: String,
    pub api_url: String,
    pub model: String,
    pub request_timeout_secs: u64,
}

impl AiSettings {
    pub fn new(
        api_key: impl Into<String>,
        api_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            api_url: api_url.into(),
            model: model.into(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// One chat completion call. The model is chosen by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            temperature: TEMPERATURE,
        }
    }

    /// Text of the user turn, if any.
    pub fn user_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
    }
}

/// Transport seam for chat completions.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Send one request and return the assistant's text.
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

#[async_trait]
impl<C: CompletionClient + ?Sized> CompletionClient for &C {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        (**self).complete(request).await
    }
}

#[async_trait]
impl<C: CompletionClient + ?Sized> CompletionClient for Box<C> {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        (**self).complete(request).await
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// Chat completions over HTTP against an OpenAI-compatible API.
pub struct OpenAiClient {
    http: reqwest::Client,
    settings: AiSettings,
    url: String,
}

impl OpenAiClient {
    /// Validate settings and build the HTTP client. Fails with
    /// `Error::Configuration` before any request is made.
    pub fn new(settings: AiSettings) -> Result<Self> {
        if settings.api_key.trim().is_empty() {
            return Err(Error::Configuration("API key is missing".to_string()));
        }
        if settings.model.trim().is_empty() {
            return Err(Error::Configuration("model is not set".to_string()));
        }
        let url = completions_url(&settings.api_url)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::Configuration(format!("could not build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            settings,
            url,
        })
    }

    pub fn settings(&self) -> &AiSettings {
        &self.settings
    }

    /// The resolved completions endpoint.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn transport_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout {
                secs: self.settings.request_timeout_secs,
            }
        } else {
            Error::request(err.status().map(|s| s.as_u16()), err.to_string())
        }
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = ChatRequest {
            model: &self.settings.model,
            messages: &request.messages,
            temperature: request.temperature,
        };

        let response = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.settings.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "completion request failed");
            return Err(Error::request(
                Some(status.as_u16()),
                provider_error_message(&text),
            ));
        }

        parse_completion(status.as_u16(), &text)
    }
}

/// Classify one planned batch, returning the raw model text.
pub async fn classify<C>(client: &C, batch: &[BatchEntry]) -> Result<String>
where
    C: CompletionClient + ?Sized,
{
    let request = prompts::categorize_request(batch);
    tracing::debug!(bookmarks = batch.len(), "sending classification batch");
    client.complete(&request).await
}

/// Resolve `<apiUrl>/chat/completions`, keeping an url that already has it.
pub fn completions_url(api_url: &str) -> Result<String> {
    let base = api_url.trim().trim_end_matches('/');
    if base.is_empty() {
        return Err(Error::Configuration("API url is missing".to_string()));
    }
    let full = if base.contains(COMPLETIONS_PATH) {
        base.to_string()
    } else {
        format!("{}{}", base, COMPLETIONS_PATH)
    };
    validate_url(&full)?;
    Ok(full)
}

/// Base url without the completions suffix, e.g. for `/models`.
pub fn api_base(api_url: &str) -> Result<String> {
    let base = api_url
        .trim()
        .trim_end_matches('/')
        .replace(COMPLETIONS_PATH, "");
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        return Err(Error::Configuration("API url is missing".to_string()));
    }
    validate_url(base)?;
    Ok(base.to_string())
}

fn validate_url(candidate: &str) -> Result<()> {
    let parsed = url::Url::parse(candidate)
        .map_err(|e| Error::Configuration(format!("API url '{}' is invalid: {}", candidate, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::Configuration(format!(
            "API url must use http or https, not '{}'",
            other
        ))),
    }
}

fn parse_completion(status: u16, text: &str) -> Result<String> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|_| Error::Parse("endpoint returned a non-JSON body".to_string()))?;

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        return Err(Error::request(Some(status), error_text(error)));
    }

    let parsed: ChatResponse = serde_json::from_value(value)
        .map_err(|_| Error::Parse("endpoint returned an unexpected body".to_string()))?;

    parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content.unwrap_or_default())
        .ok_or_else(|| Error::Parse("response contained no choices".to_string()))
}

/// Pull a readable message out of a provider error body.
fn provider_error_message(body: &str) -> String {
    let from_json = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").map(error_text));
    let message = from_json.unwrap_or_else(|| body.to_string());
    let message = one_line(&message);
    if message.is_empty() {
        "empty response body".to_string()
    } else {
        truncate(&message, ERROR_BODY_MAX_CHARS)
    }
}

fn error_text(error: &serde_json::Value) -> String {
    match error {
        serde_json::Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}
