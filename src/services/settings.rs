use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use super::storage::KeyValueStore;
use crate::config::{
    BASE_URL_ENV, DEFAULT_BASE_URL, DEFAULT_MAX_TOKENS, DEFAULT_MODEL, DEFAULT_SYSTEM_PROMPT,
    DEFAULT_TEMPERATURE, LOG_FILE_ENV, MODEL_ENV, SETTINGS_KEY,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub stream_responses: bool,
    /// Overrides the built-in instruction injected when a turn has no system message.
    pub system_prompt: Option<String>,
    /// Write logs to this file instead of stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: Some(DEFAULT_MAX_TOKENS),
            stream_responses: true,
            system_prompt: None,
            log_file: None,
        }
    }
}

impl AppSettings {
    pub fn effective_system_prompt(&self) -> &str {
        self.system_prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }

    /// Apply environment overrides from a lookup function.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base_url) = lookup(BASE_URL_ENV) {
            self.base_url = base_url;
        }
        if let Some(model) = lookup(MODEL_ENV) {
            self.model = model;
        }
        if let Some(path) = lookup(LOG_FILE_ENV) {
            self.log_file = Some(PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.base_url)
            .with_context(|| format!("Invalid base URL: {}", self.base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("Base URL must use http or https: {}", self.base_url);
        }
        if self.model.trim().is_empty() {
            anyhow::bail!("Model name must not be empty");
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            anyhow::bail!("Temperature must be between 0 and 2, got {}", self.temperature);
        }
        Ok(())
    }
}

pub struct SettingsService;

impl SettingsService {
    pub async fn load(store: &dyn KeyValueStore) -> AppSettings {
        match store.get(SETTINGS_KEY).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable settings: {}", e);
                AppSettings::default()
            }),
            Ok(None) => AppSettings::default(),
            Err(e) => {
                tracing::warn!("Failed to read settings: {}", e);
                AppSettings::default()
            }
        }
    }

    pub async fn save(store: &dyn KeyValueStore, settings: &AppSettings) -> Result<()> {
        let json = serde_json::to_string(settings)?;
        store.set(SETTINGS_KEY, &json).await
    }
}
