use std::fmt::Display;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use super::models::OpenAiStreamChunk;
use crate::providers::types::{ProviderError, StreamEvent};

/// One `data:` payload of a server-sent event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Data(String),
    /// The `[DONE]` sentinel.
    Done,
}

/// Incremental SSE decoder. Bytes may be split anywhere, including inside a
/// UTF-8 sequence or a CRLF pair.
#[derive(Debug, Default)]
pub struct SseDecoder {
    byte_buf: Vec<u8>,
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<SseFrame>, ProviderError> {
        self.byte_buf.extend_from_slice(bytes);

        // Decode as much valid UTF-8 as possible; keep an incomplete tail for later
        let valid_up_to = match std::str::from_utf8(&self.byte_buf) {
            Ok(_) => self.byte_buf.len(),
            Err(e) if e.error_len().is_some() => {
                return Err(ProviderError::InvalidResponse(format!(
                    "Stream is not valid UTF-8: {}",
                    e
                )));
            }
            Err(e) => e.valid_up_to(),
        };
        let decoded: Vec<u8> = self.byte_buf.drain(..valid_up_to).collect();
        let decoded = String::from_utf8(decoded)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        self.buffer.push_str(&decoded);
        if self.buffer.contains("\r\n") {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        // Complete events are delimited by a blank line
        let mut frames = Vec::new();
        while let Some(event_end) = self.buffer.find("\n\n") {
            let event_text: String = self.buffer.drain(..event_end + 2).collect();
            frames.extend(Self::parse_event(&event_text));
        }
        Ok(frames)
    }

    /// Flush a final event that was not followed by a blank line.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let rest = std::mem::take(&mut self.buffer);
        Self::parse_event(&rest)
    }

    fn parse_event(event_text: &str) -> Vec<SseFrame> {
        event_text
            .lines()
            .filter_map(|line| {
                let payload = line.strip_prefix("data:")?.trim_start();
                if payload.is_empty() {
                    None
                } else if payload.trim() == "[DONE]" {
                    Some(SseFrame::Done)
                } else {
                    Some(SseFrame::Data(payload.to_string()))
                }
            })
            .collect()
    }
}

/// Extract the text delta from one chunk. Chunks without content yield `None`.
pub fn parse_delta(payload: &str) -> Result<Option<String>, ProviderError> {
    let chunk: OpenAiStreamChunk = serde_json::from_str(payload).map_err(|e| {
        ProviderError::InvalidResponse(format!("Failed to parse stream chunk: {}", e))
    })?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|c| !c.is_empty()))
}

pub async fn parse_sse_stream(response: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    pump_sse(response.bytes_stream(), tx).await;
}

/// Drive a byte stream through the decoder, forwarding tokens to `tx`.
pub async fn pump_sse<S, E>(stream: S, tx: mpsc::Sender<StreamEvent>)
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = SseDecoder::new();

    while let Some(chunk_result) = stream.next().await {
        let bytes = match chunk_result {
            Ok(b) => b,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error(ProviderError::NetworkError(format!(
                        "Stream error: {}",
                        e
                    ))))
                    .await;
                return;
            }
        };

        let frames = match decoder.feed(&bytes) {
            Ok(frames) => frames,
            Err(e) => {
                let _ = tx.send(StreamEvent::Error(e)).await;
                return;
            }
        };

        if !forward_frames(frames, &tx).await {
            return;
        }
    }

    if !forward_frames(decoder.finish(), &tx).await {
        return;
    }

    // Body closed without a [DONE] sentinel
    tracing::debug!("SSE stream ended without [DONE]");
    let _ = tx.send(StreamEvent::Done).await;
}

/// Returns `false` once nothing more should be sent.
async fn forward_frames(frames: Vec<SseFrame>, tx: &mpsc::Sender<StreamEvent>) -> bool {
    for frame in frames {
        match frame {
            SseFrame::Done => {
                let _ = tx.send(StreamEvent::Done).await;
                return false;
            }
            SseFrame::Data(payload) => match parse_delta(&payload) {
                Ok(Some(content)) => {
                    if tx.send(StreamEvent::Token(content)).await.is_err() {
                        return false; // receiver dropped
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Malformed stream payload: {}", e);
                    let _ = tx.send(StreamEvent::Error(e)).await;
                    return false;
                }
            },
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    async fn collect(parts: Vec<Result<Bytes, std::io::Error>>) -> Vec<StreamEvent> {
        let (tx, mut rx) = mpsc::channel(64);
        pump_sse(futures::stream::iter(parts), tx).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn tokens(events: &[StreamEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Token(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_decoder_handles_split_events_and_crlf() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"a\":").unwrap().is_empty());
        assert!(decoder.feed(b"1}\r").unwrap().is_empty());
        let frames = decoder.feed(b"\n\r\ndata: [DONE]\n\n").unwrap();
        assert_eq!(
            frames,
            vec![SseFrame::Data("{\"a\":1}".to_string()), SseFrame::Done]
        );
    }

    #[test]
    fn test_decoder_handles_split_utf8() {
        let text = "data: 안녕\n\n".as_bytes();
        // Split inside the first Hangul syllable
        let (head, tail) = text.split_at(8);
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(head).unwrap().is_empty());
        assert_eq!(
            decoder.feed(tail).unwrap(),
            vec![SseFrame::Data("안녕".to_string())]
        );
    }

    #[test]
    fn test_decoder_rejects_invalid_utf8() {
        let mut decoder = SseDecoder::new();
        assert!(matches!(
            decoder.feed(&[b'd', 0xff, b'a']),
            Err(ProviderError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_decoder_ignores_comments_and_event_lines() {
        let mut decoder = SseDecoder::new();
        let frames = decoder
            .feed(b": keep-alive\n\nevent: message\ndata:{\"x\":1}\n\n")
            .unwrap();
        assert_eq!(frames, vec![SseFrame::Data("{\"x\":1}".to_string())]);
    }

    #[test]
    fn test_parse_delta_skips_empty_chunks() {
        assert_eq!(
            parse_delta(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            None
        );
        assert_eq!(parse_delta(r#"{"choices":[]}"#).unwrap(), None);
        assert_eq!(
            parse_delta(r#"{"choices":[{"delta":{"content":"hi"}}]}"#).unwrap(),
            Some("hi".to_string())
        );
        assert!(parse_delta("not json").is_err());
    }

    #[tokio::test]
    async fn test_pump_forwards_every_fragment_in_order() {
        let body = format!(
            "{}{}{}data: [DONE]\n\n",
            chunk("\n"),
            chunk("Hello\n"),
            chunk(" world")
        );
        let (a, b) = body.as_bytes().split_at(17);
        let events = collect(vec![
            Ok(Bytes::copy_from_slice(a)),
            Ok(Bytes::copy_from_slice(b)),
        ])
        .await;

        // Leading newline fragments are content like any other
        assert_eq!(tokens(&events), vec!["\n", "Hello\n", " world"]);
        assert!(matches!(events.last(), Some(StreamEvent::Done)));
    }

    #[tokio::test]
    async fn test_pump_stops_at_done_sentinel() {
        let body = format!("{}data: [DONE]\n\n{}", chunk("a"), chunk("ignored"));
        let events = collect(vec![Ok(Bytes::from(body))]).await;
        assert_eq!(tokens(&events), vec!["a"]);
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_pump_reports_malformed_payload() {
        let body = format!("{}data: {{broken\n\n{}", chunk("partial"), chunk("never"));
        let events = collect(vec![Ok(Bytes::from(body))]).await;
        assert_eq!(tokens(&events), vec!["partial"]);
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error(ProviderError::InvalidResponse(_)))
        ));
    }

    #[tokio::test]
    async fn test_pump_reports_transport_error() {
        let events = collect(vec![
            Ok(Bytes::from(chunk("x"))),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ])
        .await;
        assert_eq!(tokens(&events), vec!["x"]);
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error(ProviderError::NetworkError(_)))
        ));
    }

    #[tokio::test]
    async fn test_pump_completes_without_sentinel() {
        // Final event lacks its trailing blank line
        let last = serde_json::json!({"choices": [{"delta": {"content": "b"}}]});
        let body = format!("{}data: {}", chunk("a"), last);
        let events = collect(vec![Ok(Bytes::from(body))]).await;
        assert_eq!(tokens(&events), vec!["a", "b"]);
        assert!(matches!(events.last(), Some(StreamEvent::Done)));
    }
}
