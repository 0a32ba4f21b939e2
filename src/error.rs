//! Error taxonomy for smartmarks
//!
//! Every variant renders as a human-readable sentence that names the stage
//! that failed. Parser internals never leak through `Display`.

/// Errors surfaced by the categorization engine, tagging, and the store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// API key or url missing/invalid. Short-circuits before any AI work.
    #[error("AI configuration is incomplete: {0}")]
    Configuration(String),

    /// Nothing was handed in to process.
    #[error("No bookmarks to process")]
    EmptyInput,

    /// The completion endpoint answered with a non-success status (or a
    /// success status carrying an error body).
    #[error("{}", request_message(.status, .message))]
    Request {
        status: Option<u16>,
        message: String,
        rate_limited: bool,
    },

    /// The endpoint did not answer within the per-request window.
    #[error("AI request timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Model output could not be turned into structured data.
    #[error("Could not understand the AI response: {0}")]
    Parse(String),

    /// The caller asked the run to stop between batches.
    #[error("Classification was cancelled")]
    Cancelled,

    /// The durable store could not be read or flushed.
    #[error("Storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn request_message(status: &Option<u16>, message: &str) -> String {
    match *status {
        Some(401) => "AI request was rejected: the API key is invalid".to_string(),
        Some(413) => "AI request was too large for the endpoint (HTTP 413)".to_string(),
        Some(429) => format!("AI endpoint is rate limiting requests: {}", message),
        Some(code @ 500..=599) => format!(
            "AI endpoint server error ({}). The service may be temporarily unavailable",
            code
        ),
        Some(code) => format!("AI request failed ({}): {}", code, message),
        None => format!("AI request failed: {}", message),
    }
}

impl Error {
    /// Build a `Request` error, flagging throttling from status or message text.
    pub fn request(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        let rate_limited = status == Some(429) || looks_rate_limited(&message);
        Error::Request {
            status,
            message,
            rate_limited,
        }
    }

    /// True when the endpoint signalled throttling (HTTP 429 or equivalent text).
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::Request { rate_limited: true, .. })
    }

    /// Failures that only cost one batch; everything else aborts the run.
    pub fn is_batch_local(&self) -> bool {
        matches!(self, Error::Request { .. } | Error::Timeout { .. } | Error::Parse(_))
    }
}

/// Detect throttling wording in a provider error message.
pub fn looks_rate_limited(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate-limit")
        || lower.contains("ratelimit")
        || lower.contains("too many requests")
        || lower.contains("throttl")
}
