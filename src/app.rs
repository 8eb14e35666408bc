use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ChatError;
use crate::models::{Message, Role, Session};
use crate::services::export::export_to_markdown;
use crate::services::{
    AppSettings, ChatEvent, KeyValueStore, SessionStore, SettingsService, StreamConsumer,
    StreamOutcome,
};

/// State the front-end binds to, plus the actions it can trigger.
///
/// The live message list is the source of truth for the active session until
/// a turn finishes and is reconciled into the `SessionStore`.
pub struct ChatApp {
    consumer: StreamConsumer,
    sessions: SessionStore,
    store: Arc<dyn KeyValueStore>,
    active_session_id: Option<String>,
    messages: Vec<Message>,
    input: String,
    is_loading: bool,
    error: Option<ChatError>,
}

impl ChatApp {
    pub fn new(consumer: StreamConsumer, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            consumer,
            sessions: SessionStore::new(store.clone()),
            store,
            active_session_id: None,
            messages: Vec::new(),
            input: String::new(),
            is_loading: false,
            error: None,
        }
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn set_input(&mut self, text: impl Into<String>) {
        self.input = text.into();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn error(&self) -> Option<&ChatError> {
        self.error.as_ref()
    }

    pub fn sessions(&self) -> &[Session] {
        self.sessions.sessions()
    }

    pub fn is_history_loading(&self) -> bool {
        self.sessions.is_loading()
    }

    pub fn active_session_id(&self) -> Option<&str> {
        self.active_session_id.as_deref()
    }

    pub fn storage_error(&self) -> Option<&ChatError> {
        self.sessions.storage_error()
    }

    pub fn settings(&self) -> &AppSettings {
        self.consumer.settings()
    }

    /// Restore history and pick the newest session, creating one if none exist.
    pub async fn init(&mut self) {
        self.sessions.restore().await;
        self.activate_next_session().await;
    }

    pub async fn new_session(&mut self) -> String {
        let id = self.sessions.create_session().await;
        self.active_session_id = Some(id.clone());
        self.messages.clear();
        self.error = None;
        id
    }

    /// Make `id` active. Unknown ids leave the current state untouched.
    pub fn select_session(&mut self, id: &str) -> bool {
        match self.sessions.load_session(id) {
            Some(messages) => {
                self.messages = messages;
                self.active_session_id = Some(id.to_string());
                self.error = None;
                true
            }
            None => false,
        }
    }

    pub async fn delete_session(&mut self, id: &str) -> bool {
        if !self.sessions.delete_session(id).await {
            return false;
        }
        if self.active_session_id.as_deref() == Some(id) {
            self.active_session_id = None;
            self.activate_next_session().await;
        }
        true
    }

    /// Select the newest remaining session, or a fresh one when none remain.
    pub async fn activate_next_session(&mut self) -> String {
        let next = self.sessions.sessions().first().map(|s| s.id.clone());
        match next {
            Some(id) if self.select_session(&id) => id,
            _ => self.new_session().await,
        }
    }

    /// Send the current input as a new user turn.
    pub async fn submit<F>(
        &mut self,
        cancel: CancellationToken,
        on_event: F,
    ) -> Result<StreamOutcome, ChatError>
    where
        F: FnMut(ChatEvent) + Send,
    {
        let text = self.input.trim().to_string();
        if text.is_empty() {
            return Err(ChatError::InvalidInput("Nothing to send".to_string()));
        }

        let message = Message::user(text);
        let message_id = message.id.clone();
        self.messages.push(message);

        let result = self.run_turn(cancel, on_event).await;
        match &result {
            Err(_) if self.messages.last().is_some_and(|m| m.id == message_id) => {
                // Rejected before sending; the text goes back to the input
                if let Some(message) = self.messages.pop() {
                    self.input = message.content;
                }
            }
            _ => self.input.clear(),
        }
        result
    }

    /// Regenerate the last reply, discarding a trailing assistant message.
    pub async fn retry<F>(
        &mut self,
        cancel: CancellationToken,
        on_event: F,
    ) -> Result<StreamOutcome, ChatError>
    where
        F: FnMut(ChatEvent) + Send,
    {
        if self
            .messages
            .last()
            .is_some_and(|m| m.role == Role::Assistant)
        {
            self.messages.pop();
        }
        self.run_turn(cancel, on_event).await
    }

    async fn run_turn<F>(
        &mut self,
        cancel: CancellationToken,
        mut on_event: F,
    ) -> Result<StreamOutcome, ChatError>
    where
        F: FnMut(ChatEvent) + Send,
    {
        self.error = None;
        self.is_loading = true;

        let history = self.messages.clone();
        let assistant_id = Uuid::new_v4().to_string();
        let consumer = &self.consumer;
        let live = &mut self.messages;

        let result = consumer
            .run(&history, cancel, |event| {
                if let ChatEvent::Fragment { accumulated, .. } = &event {
                    match live.last_mut() {
                        Some(last) if last.id == assistant_id => {
                            last.content.clone_from(accumulated);
                        }
                        _ => live.push(Message {
                            id: assistant_id.clone(),
                            role: Role::Assistant,
                            content: accumulated.clone(),
                        }),
                    }
                }
                on_event(event);
            })
            .await;

        self.is_loading = false;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.error = Some(e.clone());
                return Err(e);
            }
        };

        match &outcome {
            StreamOutcome::Completed { .. } => self.reconcile_active().await,
            StreamOutcome::Failed { error, .. } => {
                self.error = Some(error.clone());
                self.reconcile_active().await;
            }
            StreamOutcome::Cancelled { partial } => {
                tracing::debug!(kept = partial.len(), "Turn cancelled, not saved");
            }
        }

        Ok(outcome)
    }

    async fn reconcile_active(&mut self) {
        if let Some(id) = &self.active_session_id {
            self.sessions.reconcile(id, &self.messages).await;
        }
    }

    /// Validate, persist and apply new settings. A failed save is logged and
    /// the settings still apply for this run.
    pub async fn update_settings(&mut self, settings: AppSettings) -> Result<(), ChatError> {
        settings
            .validate()
            .map_err(|e| ChatError::InvalidInput(e.to_string()))?;

        if let Err(e) = SettingsService::save(self.store.as_ref(), &settings).await {
            tracing::error!("Failed to save settings: {}", e);
        }
        self.consumer.set_settings(settings);
        Ok(())
    }

    /// Change only the system prompt, in both the stored and the running settings.
    ///
    /// The stored settings are reloaded first so environment overrides in the
    /// running settings are not written back.
    pub async fn set_system_prompt(&mut self, prompt: Option<String>) {
        let mut stored = SettingsService::load(self.store.as_ref()).await;
        stored.system_prompt.clone_from(&prompt);
        if let Err(e) = SettingsService::save(self.store.as_ref(), &stored).await {
            tracing::error!("Failed to save settings: {}", e);
        }

        let running = AppSettings {
            system_prompt: prompt,
            ..self.consumer.settings().clone()
        };
        self.consumer.set_settings(running);
    }

    pub fn export_session(&self, id: &str) -> Option<String> {
        self.sessions
            .get(id)
            .map(|s| export_to_markdown(s, &self.settings().model))
    }
}
