use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{ChatRequest, ChatResponse, ProviderError, StreamEvent};

#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Stream the reply into `tx`. Errors before the first byte are returned;
    /// errors mid-stream are sent as `StreamEvent::Error`.
    async fn stream_message(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError>;
}
