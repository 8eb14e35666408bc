pub const APP_NAME: &str = "murmur";

/// Storage key holding the serialized session mapping.
pub const CHAT_HISTORY_KEY: &str = "chatHistory";

/// Storage key holding the JSON-encoded `AppSettings`.
pub const SETTINGS_KEY: &str = "app_settings";

pub const DEFAULT_SESSION_TITLE: &str = "New chat";

/// Number of characters of the first user message kept in a session title.
pub const TITLE_MAX_CHARS: usize = 30;

pub const TITLE_ELLIPSIS: &str = "...";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. \
Answer the user's questions kindly and accurately.\n\
Keep your answers as concise as possible without leaving out important information.";

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

pub const API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const BASE_URL_ENV: &str = "MURMUR_BASE_URL";
pub const MODEL_ENV: &str = "MURMUR_MODEL";
pub const LOG_FILE_ENV: &str = "MURMUR_LOG_FILE";
