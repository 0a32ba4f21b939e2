//! Configuration management for smartmarks
//!
//! Stores settings in ~/.config/smartmarks/config.json. The API key lives in
//! the system keychain; `SMARTMARKS_API_KEY` overrides it.

use crate::crawler::{PageFetcher, DEFAULT_FETCH_TIMEOUT_SECS};
use crate::error::{Error, Result};
use crate::llm::{AiSettings, OpenAiClient, DEFAULT_MODEL, DEFAULT_REQUEST_TIMEOUT_SECS};
use crate::smart::{BackoffPolicy, SmartCategorizer, DEFAULT_BATCH_SIZE};
use crate::store::FileBackend;
use anyhow::Context;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "smartmarks";
const API_KEY_ENV: &str = "SMARTMARKS_API_KEY";
const DISABLE_KEYRING_ENV: &str = "SMARTMARKS_DISABLE_KEYRING";
const KEYRING_SERVICE: &str = "smartmarks";
const KEYRING_USERNAME: &str = "api_key";

/// Pacing settings as stored on disk, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub initial_delay_ms: u64,
    pub inter_batch_delay_ms: u64,
    pub rate_limit_delay_ms: u64,
    pub max_retries_per_batch: u32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self::from(BackoffPolicy::default())
    }
}

impl From<BackoffPolicy> for BackoffSettings {
    fn from(policy: BackoffPolicy) -> Self {
        Self {
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            inter_batch_delay_ms: policy.inter_batch_delay.as_millis() as u64,
            rate_limit_delay_ms: policy.rate_limit_delay.as_millis() as u64,
            max_retries_per_batch: policy.max_retries_per_batch,
        }
    }
}

impl From<BackoffSettings> for BackoffPolicy {
    fn from(settings: BackoffSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            inter_batch_delay: Duration::from_millis(settings.inter_batch_delay_ms),
            rate_limit_delay: Duration::from_millis(settings.rate_limit_delay_ms),
            max_retries_per_batch: settings.max_retries_per_batch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base url of an OpenAI-compatible API, e.g. https://api.openai.com/v1
    pub api_url: Option<String>,
    pub model: String,
    /// Legacy plaintext key; moved into the keychain on first read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub batch_size: usize,
    pub request_timeout_secs: u64,
    /// Send bookmarks with neither tags nor summary straight to "uncategorized".
    pub bucket_untagged: bool,
    /// Read each bookmark's page before asking for tags and a summary.
    pub use_web_content: bool,
    pub page_fetch_timeout_secs: u64,
    pub backoff: BackoffSettings,
    /// Where store documents live. Defaults to the platform data dir.
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: None,
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            batch_size: DEFAULT_BATCH_SIZE,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            bucket_untagged: true,
            use_web_content: true,
            page_fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            backoff: BackoffSettings::default(),
            data_dir: None,
        }
    }
}

fn keyring_disabled() -> bool {
    if cfg!(test) {
        return true;
    }
    matches!(
        std::env::var(DISABLE_KEYRING_ENV)
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
        "1" | "true" | "yes"
    )
}

fn keyring_entry() -> std::result::Result<Entry, keyring::Error> {
    Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)
}

fn read_keyring_key() -> std::result::Result<Option<String>, keyring::Error> {
    if keyring_disabled() {
        return Ok(None);
    }
    match keyring_entry()?.get_password() {
        Ok(key) => Ok(Some(key)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(err),
    }
}

fn write_keyring_key(key: &str) -> std::result::Result<(), keyring::Error> {
    if keyring_disabled() {
        return Err(keyring::Error::NoStorageAccess(
            "keychain access is disabled".into(),
        ));
    }
    keyring_entry()?.set_password(key)
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(APP_DIR))
    }

    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from the default location, or return defaults
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load config from `path`. A file that does not parse is kept as
    /// `config.json.corrupt` and defaults are returned.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                    tracing::warn!(error = %e, "failed to set config directory permissions");
                }
            }
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        write_config_atomic(path, &content).context("Failed to write config")?;
        Ok(())
    }

    /// Get the API key (environment, then keychain, then legacy config field)
    pub fn get_api_key(&mut self) -> Option<String> {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                return Some(key.trim().to_string());
            }
        }

        match read_keyring_key() {
            Ok(Some(key)) => return Some(key),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "failed to read API key from system keychain; set {} as a workaround",
                    API_KEY_ENV
                );
            }
        }

        let key = self.api_key.clone()?;
        match write_keyring_key(&key) {
            Ok(()) => {
                if let Ok(Some(stored)) = read_keyring_key() {
                    if stored == key {
                        self.api_key = None;
                        if let Err(err) = self.save() {
                            tracing::warn!(
                                error = %err,
                                "could not save config after key migration"
                            );
                        } else {
                            tracing::info!("migrated API key from config file to system keychain");
                        }
                    }
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "API key stays in the config file");
            }
        }
        Some(key)
    }

    /// Store the API key in the system keychain
    pub fn set_api_key(&mut self, key: &str) -> Result<()> {
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::Configuration("API key is empty".to_string()));
        }

        write_keyring_key(key).map_err(|err| {
            Error::Configuration(format!(
                "Failed to store API key in system keychain: {}. You can set {} instead.",
                err, API_KEY_ENV
            ))
        })?;

        match read_keyring_key() {
            Ok(Some(stored)) if stored == key => {
                self.api_key = None;
                self.save()
            }
            Ok(_) => Err(Error::Configuration(format!(
                "API key verification failed: key was not persisted to keychain. You can set {} instead.",
                API_KEY_ENV
            ))),
            Err(err) => Err(Error::Configuration(format!(
                "API key verification failed: couldn't read back from keychain ({}). You can set {} instead.",
                err, API_KEY_ENV
            ))),
        }
    }

    /// Check if an API key is configured
    pub fn has_api_key(&self) -> bool {
        if std::env::var(API_KEY_ENV).is_ok_and(|k| !k.trim().is_empty()) {
            return true;
        }
        if let Ok(Some(_)) = read_keyring_key() {
            return true;
        }
        self.api_key.is_some()
    }

    /// Validated endpoint settings, or `Error::Configuration` naming what is missing.
    pub fn ai_settings(&mut self) -> Result<AiSettings> {
        let api_url = self
            .api_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| Error::Configuration("API url is missing".to_string()))?;
        crate::llm::completions_url(&api_url)?;

        let api_key = self
            .get_api_key()
            .ok_or_else(|| Error::Configuration("API key is missing".to_string()))?;

        let model = if self.model.trim().is_empty() {
            DEFAULT_MODEL.to_string()
        } else {
            self.model.trim().to_string()
        };

        Ok(AiSettings::new(api_key, api_url.trim(), model)
            .with_timeout_secs(self.request_timeout_secs))
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        self.backoff.into()
    }

    /// A categorizer wired to the configured endpoint and pacing.
    pub fn categorizer(&mut self) -> Result<SmartCategorizer<OpenAiClient>> {
        let client = OpenAiClient::new(self.ai_settings()?)?;
        Ok(SmartCategorizer::new(client)
            .with_policy(self.backoff_policy())
            .with_batch_size(self.batch_size)
            .with_bucket_untagged(self.bucket_untagged))
    }

    /// The page fetcher for tagging, or `None` when page reading is off.
    pub fn page_fetcher(&self) -> Result<Option<PageFetcher>> {
        if !self.use_web_content {
            return Ok(None);
        }
        PageFetcher::with_timeout_secs(self.page_fetch_timeout_secs).map(Some)
    }

    /// Directory for store documents
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|p| p.join(APP_DIR)))
    }

    pub fn file_backend(&self) -> Result<FileBackend> {
        let dir = self
            .data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
        Ok(FileBackend::new(dir))
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| format!("~/.config/{}/config.json", APP_DIR))
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

fn write_config_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    use std::fs::OpenOptions;
    use std::io::Write;

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
            tracing::warn!(error = %e, "failed to set temp config file permissions");
        }
    }

    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    drop(file);

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}
