use super::client::{api_base, AiSettings};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::time::Duration;

/// Offered when the endpoint cannot list its models.
pub const DEFAULT_MODELS: [&str; 3] = ["gpt-3.5-turbo", "gpt-4", "gpt-4-turbo"];

/// A model the endpoint can serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

pub fn default_models() -> Vec<ModelInfo> {
    DEFAULT_MODELS
        .iter()
        .map(|id| ModelInfo { id: id.to_string() })
        .collect()
}

/// List models from `<base>/models`, falling back to [`DEFAULT_MODELS`].
pub async fn fetch_models(settings: &AiSettings) -> Vec<ModelInfo> {
    match list_models(settings).await {
        Ok(models) if !models.is_empty() => models,
        Ok(_) => {
            tracing::warn!("endpoint listed no models; using defaults");
            default_models()
        }
        Err(err) => {
            tracing::warn!(error = %err, "could not list models; using defaults");
            default_models()
        }
    }
}

/// List models without the fallback. Sorted by id.
pub async fn list_models(settings: &AiSettings) -> Result<Vec<ModelInfo>> {
    if settings.api_key.trim().is_empty() {
        return Err(Error::Configuration("API key is missing".to_string()));
    }
    let url = format!("{}/models", api_base(&settings.api_url)?);

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.request_timeout_secs.max(1)))
        .build()
        .map_err(|e| Error::Configuration(format!("could not build HTTP client: {}", e)))?;

    let response = http
        .get(&url)
        .header("Authorization", format!("Bearer {}", settings.api_key))
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                Error::Timeout {
                    secs: settings.request_timeout_secs,
                }
            } else {
                Error::request(None, e.to_string())
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::request(
            Some(status.as_u16()),
            status.canonical_reason().unwrap_or("model listing failed"),
        ));
    }

    let list: ModelList = response
        .json()
        .await
        .map_err(|_| Error::Parse("model list was not valid JSON".to_string()))?;

    let mut models: Vec<ModelInfo> = list
        .data
        .into_iter()
        .map(|m| ModelInfo { id: m.id })
        .collect();
    models.sort_by(|a, b| a.id.cmp(&b.id));
    models.dedup();
    Ok(models)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_models() {
        let ids: Vec<String> = default_models().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["gpt-3.5-turbo", "gpt-4", "gpt-4-turbo"]);
    }

    #[tokio::test]
    async fn test_fetch_models_falls_back_without_key() {
        let settings = AiSettings::new("", "https://api.openai.com/v1", "gpt-4");
        assert_eq!(fetch_models(&settings).await, default_models());
    }
}
