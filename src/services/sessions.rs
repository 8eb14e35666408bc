use std::collections::HashSet;
use std::sync::Arc;

use crate::config::CHAT_HISTORY_KEY;
use crate::error::ChatError;
use crate::models::session::derive_title;
use crate::models::{Message, Session};
use crate::services::storage::KeyValueStore;

/// Owns the session mapping (newest first) and keeps it in sync with storage.
///
/// Every mutation rewrites the whole mapping under a single storage key.
/// Storage failures are logged and remembered in `storage_error`; the
/// in-memory mapping stays authoritative.
pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
    sessions: Vec<Session>,
    loading: bool,
    storage_error: Option<ChatError>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            sessions: Vec::new(),
            loading: false,
            storage_error: None,
        }
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Last storage failure, if persistence is currently degraded.
    pub fn storage_error(&self) -> Option<&ChatError> {
        self.storage_error.as_ref()
    }

    /// Replace the in-memory mapping with the persisted one.
    ///
    /// Missing, unreadable or malformed data yields an empty mapping.
    pub async fn restore(&mut self) {
        self.loading = true;

        self.sessions = match self.store.get(CHAT_HISTORY_KEY).await {
            Ok(Some(json)) => match decode(&json) {
                Ok(sessions) => sessions,
                Err(e) => {
                    tracing::warn!("Discarding unreadable chat history: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::error!("Failed to read chat history: {}", e);
                self.storage_error = Some(ChatError::StorageFailure(e.to_string()));
                Vec::new()
            }
        };

        tracing::debug!(sessions = self.sessions.len(), "Chat history restored");
        self.loading = false;
    }

    /// Insert an empty session at the front and return its id.
    pub async fn create_session(&mut self) -> String {
        let session = Session::new();
        let id = session.id.clone();
        self.sessions.insert(0, session);
        self.persist().await;
        id
    }

    /// Stored messages for `id`, or `None` if no such session exists.
    pub fn load_session(&self, id: &str) -> Option<Vec<Message>> {
        self.get(id).map(|s| s.messages.clone())
    }

    /// Remove the session. Returns whether anything was removed.
    pub async fn delete_session(&mut self, id: &str) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.id != id);
        let removed = self.sessions.len() != before;
        if removed {
            self.persist().await;
        }
        removed
    }

    /// Write a completed turn back into its session.
    ///
    /// Messages are replaced wholesale and `updated_at` refreshed; the title is
    /// recomputed once more than one message exists. Unknown ids are ignored.
    pub async fn reconcile(&mut self, id: &str, messages: &[Message]) -> bool {
        let Some(session) = self.sessions.iter_mut().find(|s| s.id == id) else {
            tracing::debug!(session = id, "Reconcile for unknown session ignored");
            return false;
        };

        session.messages = messages.to_vec();
        session.touch();
        if let Some(title) = derive_title(messages) {
            session.title = title;
        }

        self.persist().await;
        true
    }

    async fn persist(&mut self) {
        let result = if self.sessions.is_empty() {
            self.store.remove(CHAT_HISTORY_KEY).await
        } else {
            match encode(&self.sessions) {
                Ok(json) => self.store.set(CHAT_HISTORY_KEY, &json).await,
                Err(e) => Err(e.into()),
            }
        };

        match result {
            Ok(()) => self.storage_error = None,
            Err(e) => {
                tracing::error!("Failed to save chat history: {}", e);
                self.storage_error = Some(ChatError::StorageFailure(e.to_string()));
            }
        }
    }
}

pub fn encode(sessions: &[Session]) -> serde_json::Result<String> {
    serde_json::to_string(sessions)
}

/// Parse a persisted mapping, dropping sessions whose id was already seen.
pub fn decode(json: &str) -> serde_json::Result<Vec<Session>> {
    let sessions: Vec<Session> = serde_json::from_str(json)?;
    let mut seen = HashSet::new();
    Ok(sessions
        .into_iter()
        .filter(|s| {
            let fresh = seen.insert(s.id.clone());
            if !fresh {
                tracing::warn!(session = %s.id, "Dropping duplicate session");
            }
            fresh
        })
        .collect())
}
