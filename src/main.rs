use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use murmur::app::ChatApp;
use murmur::config::API_KEY_ENV;
use murmur::providers::OpenAiProvider;
use murmur::services::{KeyValueStore, MemoryStore, SettingsService, SqliteStore, StreamConsumer};
use murmur::ui;

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env());

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }

    Ok(())
}

/// Open the on-disk store, falling back to memory so the client still runs.
fn open_store() -> (Arc<dyn KeyValueStore>, Option<anyhow::Error>) {
    match SqliteStore::open_default() {
        Ok(store) => (Arc::new(store), None),
        Err(e) => (Arc::new(MemoryStore::new()), Some(e)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let (store, store_error) = open_store();

    let mut settings = SettingsService::load(store.as_ref()).await;
    settings.apply_env(|key| std::env::var(key).ok());
    init_logging(settings.log_file.as_deref())?;

    if let Some(e) = store_error {
        tracing::warn!("Chat history will only be kept in memory: {:#}", e);
    }
    settings.validate()?;

    let api_key = std::env::var(API_KEY_ENV).unwrap_or_default();
    if api_key.is_empty() {
        tracing::warn!("{} is not set; requests are sent without credentials", API_KEY_ENV);
    }

    let consumer = StreamConsumer::new(Arc::new(OpenAiProvider::new()), settings, api_key);
    let mut app = ChatApp::new(consumer, store);
    app.init().await;

    ui::repl::run(&mut app).await
}
