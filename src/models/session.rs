use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::{Message, Role};
use crate::config::{DEFAULT_SESSION_TITLE, TITLE_ELLIPSIS, TITLE_MAX_CHARS};

/// One persisted conversation thread.
///
/// Field names are camelCase on disk so a mapping written by older clients
/// (`createdAt`/`updatedAt` as ISO-8601 strings) restores unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: DEFAULT_SESSION_TITLE.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Refresh `updated_at`, never letting it fall behind `created_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now().max(self.created_at);
    }

    pub fn last_message_preview(&self, max_chars: usize) -> Option<String> {
        self.messages
            .last()
            .map(|m| m.content.chars().take(max_chars).collect())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Title for a message list, or `None` while fewer than two messages exist
/// or no user message is present.
pub fn derive_title(messages: &[Message]) -> Option<String> {
    if messages.len() <= 1 {
        return None;
    }
    messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| truncate_title(&m.content))
}

/// Keep the first `TITLE_MAX_CHARS` characters, appending an ellipsis when cut.
pub fn truncate_title(text: &str) -> String {
    match text.char_indices().nth(TITLE_MAX_CHARS) {
        Some((boundary, _)) => format!("{}{}", &text[..boundary], TITLE_ELLIPSIS),
        None => text.to_string(),
    }
}
