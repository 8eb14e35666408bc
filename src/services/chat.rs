use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::ChatError;
use crate::models::{Message, Role};
use crate::providers::{AiProvider, ChatMessage, ChatRequest, StreamEvent};
use crate::services::settings::AppSettings;

const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Events emitted while a turn is being generated.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Fragment { delta: String, accumulated: String },
    Complete { content: String },
    Error { error: ChatError, partial: String },
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed { content: String },
    Failed { error: ChatError, partial: String },
    /// Abandoned by the caller. No terminal event is emitted for this case.
    Cancelled { partial: String },
}

/// Turns a message list into a request against the completion endpoint and
/// consumes the reply.
pub struct StreamConsumer {
    provider: Arc<dyn AiProvider>,
    settings: AppSettings,
    api_key: String,
}

impl StreamConsumer {
    pub fn new(provider: Arc<dyn AiProvider>, settings: AppSettings, api_key: String) -> Self {
        Self {
            provider,
            settings,
            api_key,
        }
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: AppSettings) {
        self.settings = settings;
    }

    /// Validate `messages` and build the outgoing request.
    pub fn build_request(&self, messages: &[Message]) -> Result<ChatRequest, ChatError> {
        validate_messages(messages)?;

        let chat_messages = with_system_prompt(
            messages_to_chat_messages(messages),
            self.settings.effective_system_prompt(),
        );

        Ok(ChatRequest {
            api_key: self.api_key.clone(),
            model: self.settings.model.clone(),
            messages: chat_messages,
            base_url: self.settings.base_url.clone(),
            temperature: Some(self.settings.temperature),
            max_tokens: self.settings.max_tokens,
        })
    }

    /// Generate the assistant reply to `messages`.
    ///
    /// `InvalidInput` is returned before any request is made. Every other
    /// failure is reported as `ChatEvent::Error` and `StreamOutcome::Failed`
    /// with whatever text had arrived. Once `cancel` fires nothing more is
    /// delivered to `on_event`.
    pub async fn run<F>(
        &self,
        messages: &[Message],
        cancel: CancellationToken,
        on_event: F,
    ) -> Result<StreamOutcome, ChatError>
    where
        F: FnMut(ChatEvent) + Send,
    {
        let request = self.build_request(messages)?;
        tracing::debug!(
            provider = self.provider.name(),
            model = %request.model,
            messages = request.messages.len(),
            stream = self.settings.stream_responses,
            "Dispatching chat request"
        );

        if self.settings.stream_responses {
            Ok(self.run_streaming(request, cancel, on_event).await)
        } else {
            Ok(self.run_single(request, cancel, on_event).await)
        }
    }

    async fn run_streaming<F>(
        &self,
        request: ChatRequest,
        cancel_token: CancellationToken,
        mut on_event: F,
    ) -> StreamOutcome
    where
        F: FnMut(ChatEvent) + Send,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<StreamEvent>(STREAM_CHANNEL_CAPACITY);

        let provider = self.provider.clone();
        let stream_handle = tokio::spawn(async move {
            if let Err(e) = provider.stream_message(request, tx.clone()).await {
                let _ = tx.send(StreamEvent::Error(e)).await;
            }
        });

        let mut accumulated = String::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => {
                    tracing::debug!(received = accumulated.len(), "Stream abandoned");
                    stream_handle.abort();
                    return StreamOutcome::Cancelled { partial: accumulated };
                }
                event = rx.recv() => {
                    match event {
                        Some(StreamEvent::Token(token)) => {
                            accumulated.push_str(&token);
                            on_event(ChatEvent::Fragment {
                                delta: token,
                                accumulated: accumulated.clone(),
                            });
                        }
                        Some(StreamEvent::Done) => {
                            on_event(ChatEvent::Complete {
                                content: accumulated.clone(),
                            });
                            return StreamOutcome::Completed { content: accumulated };
                        }
                        Some(StreamEvent::Error(e)) => {
                            tracing::warn!("Stream failed: {}", e);
                            return fail(ChatError::from(e), accumulated, &mut on_event);
                        }
                        None => {
                            return fail(
                                ChatError::NetworkFailure("Stream ended unexpectedly".to_string()),
                                accumulated,
                                &mut on_event,
                            );
                        }
                    }
                }
            }
        }
    }

    /// Single JSON payload: reported as one fragment followed by completion.
    async fn run_single<F>(
        &self,
        request: ChatRequest,
        cancel_token: CancellationToken,
        mut on_event: F,
    ) -> StreamOutcome
    where
        F: FnMut(ChatEvent) + Send,
    {
        let result = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                return StreamOutcome::Cancelled { partial: String::new() };
            }
            result = self.provider.send_message(request) => result,
        };

        match result {
            Ok(response) => {
                tracing::debug!(model = %response.model, "Received complete reply");
                on_event(ChatEvent::Fragment {
                    delta: response.content.clone(),
                    accumulated: response.content.clone(),
                });
                on_event(ChatEvent::Complete {
                    content: response.content.clone(),
                });
                StreamOutcome::Completed {
                    content: response.content,
                }
            }
            Err(e) => {
                tracing::warn!("Request failed: {}", e);
                fail(ChatError::from(e), String::new(), &mut on_event)
            }
        }
    }
}

fn fail<F>(error: ChatError, partial: String, on_event: &mut F) -> StreamOutcome
where
    F: FnMut(ChatEvent),
{
    on_event(ChatEvent::Error {
        error: error.clone(),
        partial: partial.clone(),
    });
    StreamOutcome::Failed { error, partial }
}

/// A turn needs a non-empty list ending in a non-blank user message.
///
/// Earlier messages are sent as stored; a whitespace-only reply is still content.
pub fn validate_messages(messages: &[Message]) -> Result<(), ChatError> {
    let last = messages
        .last()
        .ok_or_else(|| ChatError::InvalidInput("Message list is empty".to_string()))?;

    if last.role != Role::User {
        return Err(ChatError::InvalidInput(format!(
            "Last message must come from the user, not {}",
            last.role.as_str()
        )));
    }

    if last.content.trim().is_empty() {
        return Err(ChatError::InvalidInput(format!(
            "Message {} has no content",
            last.id
        )));
    }

    Ok(())
}

/// Prepend a system message unless the list already carries one.
pub fn with_system_prompt(mut messages: Vec<ChatMessage>, prompt: &str) -> Vec<ChatMessage> {
    if !messages.iter().any(|m| m.role == Role::System) {
        messages.insert(
            0,
            ChatMessage {
                role: Role::System,
                content: prompt.to_string(),
            },
        );
    }
    messages
}

/// Convert `Message` list to `ChatMessage` list for the provider API.
pub fn messages_to_chat_messages(messages: &[Message]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| ChatMessage {
            role: m.role,
            content: m.content.clone(),
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::DEFAULT_SYSTEM_PROMPT;
    use crate::providers::{ChatResponse, ProviderError};

    /// Replays a fixed script of stream events and records what it was asked.
    pub(crate) struct ScriptedProvider {
        script: Vec<StreamEvent>,
        open_error: Option<ProviderError>,
        pub calls: AtomicUsize,
        pub last_request: Mutex<Option<ChatRequest>>,
    }

    impl ScriptedProvider {
        pub(crate) fn new(script: Vec<StreamEvent>) -> Self {
            Self {
                script,
                open_error: None,
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            }
        }

        pub(crate) fn tokens(tokens: &[&str]) -> Self {
            let mut script: Vec<StreamEvent> = tokens
                .iter()
                .map(|t| StreamEvent::Token(t.to_string()))
                .collect();
            script.push(StreamEvent::Done);
            Self::new(script)
        }

        pub(crate) fn failing(error: ProviderError) -> Self {
            Self {
                open_error: Some(error),
                ..Self::new(Vec::new())
            }
        }

        fn record(&self, request: &ChatRequest) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request.clone());
        }
    }

    #[async_trait]
    impl AiProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.record(&request);
            if let Some(e) = &self.open_error {
                return Err(e.clone());
            }
            let content = self
                .script
                .iter()
                .filter_map(|e| match e {
                    StreamEvent::Token(t) => Some(t.as_str()),
                    _ => None,
                })
                .collect();
            Ok(ChatResponse {
                content,
                model: request.model,
            })
        }

        async fn stream_message(
            &self,
            request: ChatRequest,
            tx: mpsc::Sender<StreamEvent>,
        ) -> Result<(), ProviderError> {
            self.record(&request);
            if let Some(e) = &self.open_error {
                return Err(e.clone());
            }
            for event in &self.script {
                if tx.send(event.clone()).await.is_err() {
                    break;
                }
            }
            Ok(())
        }
    }

    fn consumer(provider: Arc<ScriptedProvider>) -> StreamConsumer {
        StreamConsumer::new(provider, AppSettings::default(), "sk-test".to_string())
    }

    async fn run_collect(
        consumer: &StreamConsumer,
        messages: &[Message],
    ) -> (Result<StreamOutcome, ChatError>, Vec<ChatEvent>) {
        let mut events = Vec::new();
        let outcome = consumer
            .run(messages, CancellationToken::new(), |e| events.push(e))
            .await;
        (outcome, events)
    }

    #[test]
    fn test_system_prompt_injected_once() {
        let messages = messages_to_chat_messages(&[Message::user("hi")]);
        let sent = with_system_prompt(messages, "be brief");
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].role, Role::System);
        assert_eq!(sent[0].content, "be brief");
        assert_eq!(sent.iter().filter(|m| m.role == Role::System).count(), 1);
    }

    #[test]
    fn test_existing_system_message_kept() {
        let messages = messages_to_chat_messages(&[
            Message::user("hi"),
            Message::system("custom"),
            Message::user("again"),
        ]);
        let sent = with_system_prompt(messages.clone(), "default");
        assert_eq!(sent, messages);
    }

    #[test]
    fn test_validate_messages() {
        assert!(matches!(
            validate_messages(&[]),
            Err(ChatError::InvalidInput(_))
        ));
        assert!(matches!(
            validate_messages(&[Message::user("q"), Message::assistant("a")]),
            Err(ChatError::InvalidInput(_))
        ));
        assert!(matches!(
            validate_messages(&[Message::user("   ")]),
            Err(ChatError::InvalidInput(_))
        ));
        assert!(validate_messages(&[Message::user("q")]).is_ok());
        assert!(validate_messages(&[
            Message::user("q"),
            Message::assistant("\n"),
            Message::user("next"),
        ])
        .is_ok());
    }

    #[tokio::test]
    async fn test_invalid_input_makes_no_request() {
        let provider = Arc::new(ScriptedProvider::tokens(&["x"]));
        let consumer = consumer(provider.clone());

        let (outcome, events) = run_collect(&consumer, &[]).await;
        assert!(matches!(outcome, Err(ChatError::InvalidInput(_))));
        assert!(events.is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fragments_concatenate_in_order() {
        let provider = Arc::new(ScriptedProvider::tokens(&["\n\n", "Hel", "lo", ", ", "world"]));
        let consumer = consumer(provider.clone());

        let (outcome, events) = run_collect(&consumer, &[Message::user("hi")]).await;
        assert_eq!(
            outcome.unwrap(),
            StreamOutcome::Completed {
                content: "\n\nHello, world".to_string()
            }
        );

        let deltas: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Fragment { delta, .. } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["\n\n", "Hel", "lo", ", ", "world"]);
        assert_eq!(
            events[2],
            ChatEvent::Fragment {
                delta: "lo".to_string(),
                accumulated: "\n\nHello".to_string()
            }
        );
        assert_eq!(
            events.last(),
            Some(&ChatEvent::Complete {
                content: "\n\nHello, world".to_string()
            })
        );

        let request = provider.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages[0].content, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(request.max_tokens, Some(1000));
    }

    #[tokio::test]
    async fn test_error_keeps_partial_content() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            StreamEvent::Token("part".to_string()),
            StreamEvent::Token("ial".to_string()),
            StreamEvent::Error(ProviderError::InvalidResponse("bad chunk".to_string())),
        ]));
        let consumer = consumer(provider);

        let (outcome, events) = run_collect(&consumer, &[Message::user("hi")]).await;
        let expected_error = ChatError::StreamDecodeFailure("bad chunk".to_string());
        assert_eq!(
            outcome.unwrap(),
            StreamOutcome::Failed {
                error: expected_error.clone(),
                partial: "partial".to_string()
            }
        );
        assert_eq!(
            events.last(),
            Some(&ChatEvent::Error {
                error: expected_error,
                partial: "partial".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_http_failure_becomes_error_event() {
        let provider = Arc::new(ScriptedProvider::failing(ProviderError::RequestFailed(
            "HTTP 500: boom".to_string(),
        )));
        let consumer = consumer(provider.clone());

        let (outcome, events) = run_collect(&consumer, &[Message::user("hi")]).await;
        let StreamOutcome::Failed { error, partial } = outcome.unwrap() else {
            panic!("expected a failed turn");
        };
        assert!(matches!(error, ChatError::NetworkFailure(_)));
        assert!(partial.is_empty());
        assert_eq!(events.len(), 1);
        // No automatic retry
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_without_terminal_event_fails() {
        let provider = Arc::new(ScriptedProvider::new(vec![StreamEvent::Token(
            "cut".to_string(),
        )]));
        let consumer = consumer(provider);

        let (outcome, _) = run_collect(&consumer, &[Message::user("hi")]).await;
        let StreamOutcome::Failed { error, partial } = outcome.unwrap() else {
            panic!("expected a failed turn");
        };
        assert!(matches!(error, ChatError::NetworkFailure(_)));
        assert_eq!(partial, "cut");
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery() {
        let provider = Arc::new(ScriptedProvider::tokens(&["a", "b", "c"]));
        let consumer = consumer(provider);
        let cancel = CancellationToken::new();

        let mut events = Vec::new();
        let trigger = cancel.clone();
        let outcome = consumer
            .run(&[Message::user("hi")], cancel, |e| {
                events.push(e);
                trigger.cancel();
            })
            .await
            .unwrap();

        assert_eq!(
            outcome,
            StreamOutcome::Cancelled {
                partial: "a".to_string()
            }
        );
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_non_streaming_mode() {
        let provider = Arc::new(ScriptedProvider::tokens(&["whole ", "reply"]));
        let settings = AppSettings {
            stream_responses: false,
            system_prompt: Some("custom prompt".to_string()),
            ..AppSettings::default()
        };
        let consumer = StreamConsumer::new(provider.clone(), settings, String::new());

        let (outcome, events) = run_collect(&consumer, &[Message::user("hi")]).await;
        assert_eq!(
            outcome.unwrap(),
            StreamOutcome::Completed {
                content: "whole reply".to_string()
            }
        );
        assert_eq!(events.len(), 2);

        let request = provider.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.messages[0].content, "custom prompt");
    }
}
