//! External text-generation provider boundary.
//!
//! The provider is treated as untyped text: everything coming back goes
//! through code-fence stripping and schema validation before any of it is
//! trusted (see `batch`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("provider returned no content")]
    Empty,
    #[error("generation cancelled")]
    Cancelled,
}

/// One request/response call against the text-generation service.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, system: &str, user: &str) -> Result<String, ProviderError>;
}

/// Cooperative cancellation handle for streaming generation. Cancelling
/// drops the in-flight response, which aborts the underlying connection.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<CancelInner>);

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Acquire)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.0.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 2;

/// OpenAI-compatible chat-completions client.
pub struct HttpTextGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

impl HttpTextGenerator {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(HttpTextGenerator {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }

    fn request_body(&self, system: &str, user: &str, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "stream": stream,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        })
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response, ProviderError> {
        let mut req = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(ProviderError::Status(resp.status()));
        }
        Ok(resp)
    }

    async fn generate_once(&self, system: &str, user: &str) -> Result<String, ProviderError> {
        let resp = self.send(&self.request_body(system, user, false)).await?;
        let parsed: ChatResponse = resp.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(ProviderError::Empty)
    }

    /// Streaming variant. Aborts generation as soon as `cancel` fires
    /// instead of silently draining the rest of the stream.
    pub async fn generate_streaming(
        &self,
        system: &str,
        user: &str,
        cancel: &CancelToken,
    ) -> Result<String, ProviderError> {
        let mut resp = self.send(&self.request_body(system, user, true)).await?;
        let mut raw = Vec::new();
        let mut pending = String::new();
        let mut content = String::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                chunk = resp.chunk() => match chunk? {
                    Some(bytes) => {
                        raw.extend_from_slice(&bytes);
                        drain_utf8(&mut raw, &mut pending);
                        if drain_sse(&mut pending, &mut content) {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        if content.is_empty() {
            Err(ProviderError::Empty)
        } else {
            Ok(content)
        }
    }
}

#[async_trait]
impl TextGenerator for HttpTextGenerator {
    async fn generate(&self, system: &str, user: &str) -> Result<String, ProviderError> {
        let mut last = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.generate_once(system, user).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "text generation attempt failed");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or(ProviderError::Empty))
    }
}

/// Move the decodable UTF-8 prefix of `bytes` into `out`. An incomplete
/// trailing sequence stays buffered until the next network chunk completes
/// it; definitely-invalid bytes become U+FFFD.
fn drain_utf8(bytes: &mut Vec<u8>, out: &mut String) {
    loop {
        match std::str::from_utf8(bytes) {
            Ok(s) => {
                out.push_str(s);
                bytes.clear();
                return;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&bytes[..valid]));
                match e.error_len() {
                    Some(bad) => {
                        out.push('\u{FFFD}');
                        bytes.drain(..valid + bad);
                    }
                    None => {
                        bytes.drain(..valid);
                        return;
                    }
                }
            }
        }
    }
}

/// Consume complete `data:` lines from an SSE buffer, appending content
/// deltas. Returns true once the terminal `[DONE]` marker is seen.
fn drain_sse(pending: &mut String, content: &mut String) -> bool {
    while let Some(pos) = pending.find('\n') {
        let line: String = pending.drain(..=pos).collect();
        let line = line.trim();
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data == "[DONE]" {
            return true;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(data) {
            if let Some(delta) = value
                .pointer("/choices/0/delta/content")
                .and_then(|v| v.as_str())
            {
                content.push_str(delta);
            }
        }
    }
    false
}

/// Remove a surrounding Markdown code fence (with or without a language
/// tag) so the payload can be parsed as JSON.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_code_fence_plain_passthrough() {
        assert_eq!(strip_code_fence("[1,2]"), "[1,2]");
        assert_eq!(strip_code_fence("  [1,2]\n"), "[1,2]");
    }

    #[test]
    fn strip_code_fence_removes_fences() {
        assert_eq!(strip_code_fence("```json\n[1,2]\n```"), "[1,2]");
        assert_eq!(strip_code_fence("```\n[1,2]\n```"), "[1,2]");
    }

    #[test]
    fn drain_utf8_reassembles_split_multibyte_character() {
        // "食費" is six bytes; cut mid-character as a network chunk would.
        let bytes = "食費".as_bytes();
        let mut raw = Vec::new();
        let mut out = String::new();

        raw.extend_from_slice(&bytes[..2]);
        drain_utf8(&mut raw, &mut out);
        assert!(out.is_empty());
        assert_eq!(raw.len(), 2);

        raw.extend_from_slice(&bytes[2..]);
        drain_utf8(&mut raw, &mut out);
        assert_eq!(out, "食費");
        assert!(raw.is_empty());
    }

    #[test]
    fn drain_utf8_replaces_invalid_bytes() {
        let mut raw = vec![b'a', 0xFF, b'b'];
        let mut out = String::new();
        drain_utf8(&mut raw, &mut out);
        assert_eq!(out, "a\u{FFFD}b");
        assert!(raw.is_empty());
    }

    #[test]
    fn drain_sse_accumulates_deltas_until_done() {
        let mut pending = String::from(
            "data: {\"choices\":[{\"delta\":{\"content\":\"[{\\\"a\\\"\"}}]}\n\
             data: {\"choices\":[{\"delta\":{\"content\":\":1}]\"}}]}\n\
             data: [DONE]\n",
        );
        let mut content = String::new();
        assert!(drain_sse(&mut pending, &mut content));
        assert_eq!(content, "[{\"a\":1}]");
    }

    #[test]
    fn drain_sse_keeps_partial_line_pending() {
        let mut pending = String::from("data: {\"choices\":[{\"delta\":{\"content\"");
        let mut content = String::new();
        assert!(!drain_sse(&mut pending, &mut content));
        assert!(content.is_empty());
        assert!(!pending.is_empty());
    }

    #[tokio::test]
    async fn cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        token.cancel();
        handle.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_before_wait_returns_immediately() {
        let token = CancelToken::new();
        token.cancel();
        token.cancelled().await;
    }
}
