pub mod chat;
pub mod export;
pub mod sessions;
pub mod settings;
pub mod storage;

pub use chat::{ChatEvent, StreamConsumer, StreamOutcome};
pub use sessions::SessionStore;
pub use settings::{AppSettings, SettingsService};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
