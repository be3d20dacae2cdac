//! §4.7 — the PushAdapter: per-session debounced batching of a streaming
//! message feed to an external chat API, with immediate delivery of
//! critical events and rate-limit handling.
//!
//! Modeled on a `telemetry::spawn`-style flush task
//! (`daemon/src/telemetry/mod.rs`) for the accumulate-then-flush shape
//! (buffer + timer, `reqwest::Client` POST of a JSON batch), and on
//! `daemon/src/scheduler/rate_limits.rs::parse_retry_after` for the
//! `Retry-After` header parsing this adapter's 429 handling reuses.
//! Fan-out itself follows an `EventBroadcaster`-style subscribe-and-forward
//! pattern, specialized to one outbound POST per destination instead of a
//! broadcast channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::model::{EventType, SessionEvent, SessionId, SessionMessage};

/// Formats a batch of messages into one or more transport-ready chunks,
/// each respecting the destination's max message size. The real
/// chat-formatter templating this wraps is out of scope (§1) — this crate
/// depends on it only through this trait.
pub trait ChatFormatter: Send + Sync {
    fn format_batch(&self, messages: &[SessionMessage], max_chunk_len: usize) -> Vec<String>;
    fn format_event(&self, event: &SessionEvent) -> String;
}

/// Plain-text passthrough formatter: joins message contents with newlines
/// and splits on `max_chunk_len` boundaries. Used when no richer formatter
/// is wired in.
pub struct PlainTextFormatter;

impl ChatFormatter for PlainTextFormatter {
    fn format_batch(&self, messages: &[SessionMessage], max_chunk_len: usize) -> Vec<String> {
        let joined = messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n");
        if joined.is_empty() {
            return vec![];
        }
        chunk_str(&joined, max_chunk_len)
    }

    fn format_event(&self, event: &SessionEvent) -> String {
        format!("[{:?}] {}", event.kind, event.summary)
    }
}

fn chunk_str(s: &str, max_len: usize) -> Vec<String> {
    if max_len == 0 || s.len() <= max_len {
        return vec![s.to_string()];
    }
    s.as_bytes()
        .chunks(max_len)
        .map(|c| String::from_utf8_lossy(c).to_string())
        .collect()
}

/// The outbound chat transport this adapter POSTs to. A thin seam so tests
/// can substitute a recording fake instead of a real HTTP endpoint.
#[async_trait::async_trait]
pub trait PushTransport: Send + Sync {
    /// Sends one chunk of text to `destination_id`. Returns `Ok(None)` on
    /// success, `Ok(Some(retry_after))` on HTTP 429 (caller retries once),
    /// `Err` for any other failure — which the adapter logs and drops.
    async fn send(&self, destination_id: &str, text: &str) -> Result<Option<Duration>, String>;

    fn max_message_len(&self) -> usize;
}

/// `reqwest`-based transport POSTing `{destination_id, text}` as JSON.
/// Mirrors a `telemetry::flush`-style client-build-and-POST idiom.
pub struct HttpPushTransport {
    client: reqwest::Client,
    endpoint: String,
    max_message_len: usize,
}

impl HttpPushTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            endpoint: endpoint.into(),
            max_message_len: 2000,
        }
    }
}

#[async_trait::async_trait]
impl PushTransport for HttpPushTransport {
    async fn send(&self, destination_id: &str, text: &str) -> Result<Option<Duration>, String> {
        let payload = serde_json::json!({ "destinationId": destination_id, "text": text });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Ok(Some(retry_after.unwrap_or(Duration::from_secs(1))));
        }

        if !response.status().is_success() {
            return Err(format!("transport returned {}", response.status()));
        }
        Ok(None)
    }

    fn max_message_len(&self) -> usize {
        self.max_message_len
    }
}

/// Drops everything — used when no `push_transport_url` is configured so
/// the adapter still runs (bindings and debouncing work) but nothing
/// leaves the process.
pub struct NoopPushTransport;

#[async_trait::async_trait]
impl PushTransport for NoopPushTransport {
    async fn send(&self, _destination_id: &str, _text: &str) -> Result<Option<Duration>, String> {
        Ok(None)
    }

    fn max_message_len(&self) -> usize {
        2000
    }
}

/// Parses an integer-seconds or HTTP-date `Retry-After` value, same two
/// accepted shapes as the scheduler's rate-limit tracker.
fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let trimmed = header_value.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(trimmed) {
        let now = chrono::Utc::now();
        let retry_at = dt.with_timezone(&chrono::Utc);
        if retry_at > now {
            if let Ok(std_dur) = (retry_at - now).to_std() {
                return Some(std_dur);
            }
        }
    }
    None
}

struct Binding {
    destination_id: String,
    batch: Vec<SessionMessage>,
    timer: Option<JoinHandle<()>>,
}

/// Per-session debounced batching plus immediate critical-event delivery
/// (§4.7). Owns no session state beyond its own bindings/batches — the
/// Manager's message/event buses are this adapter's only inputs.
pub struct PushAdapter {
    transport: Arc<dyn PushTransport>,
    formatter: Arc<dyn ChatFormatter>,
    debounce: Duration,
    bindings: RwLock<HashMap<SessionId, Arc<Mutex<Binding>>>>,
}

impl PushAdapter {
    pub fn new(transport: Arc<dyn PushTransport>, formatter: Arc<dyn ChatFormatter>, debounce: Duration) -> Self {
        Self { transport, formatter, debounce, bindings: RwLock::new(HashMap::new()) }
    }

    pub async fn bind_session(&self, sid: &SessionId, destination_id: impl Into<String>) {
        let binding = Arc::new(Mutex::new(Binding { destination_id: destination_id.into(), batch: Vec::new(), timer: None }));
        self.bindings.write().await.insert(sid.clone(), binding);
    }

    /// Flushes any pending batch, then clears the binding.
    pub async fn unbind_session(&self, sid: &SessionId) {
        let binding = self.bindings.write().await.remove(sid);
        if let Some(binding) = binding {
            self.flush_binding(&binding).await;
        }
    }

    /// §4.7 `handleMessage`: drop with a warning if unbound; otherwise
    /// append and (re)schedule a debounced flush.
    pub async fn handle_message(self: &Arc<Self>, sid: &SessionId, message: SessionMessage) {
        let binding = self.bindings.read().await.get(sid).cloned();
        let Some(binding) = binding else {
            warn!(session_id = %sid, "push: message dropped — session not bound");
            return;
        };

        {
            let mut guard = binding.lock().await;
            guard.batch.push(message);
            if let Some(timer) = guard.timer.take() {
                timer.abort();
            }
        }

        let adapter = self.clone();
        let binding_for_timer = binding.clone();
        let debounce = self.debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            adapter.flush_binding(&binding_for_timer).await;
        });
        binding.lock().await.timer = Some(handle);
    }

    /// §4.7 `handleEvents`: `permission_request`/`task_complete`/`error`
    /// send immediately, bypassing the debounce; other event types are
    /// ignored at this layer.
    pub async fn handle_events(&self, sid: &SessionId, events: &[SessionEvent]) {
        let binding = self.bindings.read().await.get(sid).cloned();
        let Some(binding) = binding else { return };

        for event in events {
            if !matches!(event.kind, EventType::PermissionRequest | EventType::TaskComplete | EventType::Error) {
                continue;
            }
            let destination_id = binding.lock().await.destination_id.clone();
            let text = self.formatter.format_event(event);
            self.send_sequentially(&destination_id, vec![text]).await;
        }
    }

    async fn flush_binding(&self, binding: &Arc<Mutex<Binding>>) {
        let (destination_id, batch) = {
            let mut guard = binding.lock().await;
            guard.timer = None;
            if guard.batch.is_empty() {
                return;
            }
            (guard.destination_id.clone(), std::mem::take(&mut guard.batch))
        };
        let chunks = self.formatter.format_batch(&batch, self.transport.max_message_len());
        if chunks.is_empty() {
            return;
        }
        self.send_sequentially(&destination_id, chunks).await;
    }

    /// Sends chunks one at a time, in order, to preserve in-session
    /// ordering (§5 ordering guarantee 2). A 429 is retried once after the
    /// server's `Retry-After`; any other failure is logged and dropped —
    /// the adapter never propagates an error out of its public API.
    async fn send_sequentially(&self, destination_id: &str, chunks: Vec<String>) {
        for chunk in chunks {
            match self.transport.send(destination_id, &chunk).await {
                Ok(None) => {}
                Ok(Some(retry_after)) => {
                    tokio::time::sleep(retry_after).await;
                    if let Err(e) = self.transport.send(destination_id, &chunk).await {
                        warn!(destination_id, err = %e, "push: retry after 429 failed");
                    }
                }
                Err(e) => {
                    warn!(destination_id, err = %e, "push: send failed — dropping chunk");
                }
            }
        }
    }

    /// Flushes every pending batch and clears all state.
    pub async fn dispose(&self) {
        let bindings = std::mem::take(&mut *self.bindings.write().await);
        for (_, binding) in bindings {
            if let Some(timer) = binding.lock().await.timer.take() {
                timer.abort();
            }
            self.flush_binding(&binding).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as TMutex;

    struct RecordingTransport {
        sent: Arc<TMutex<Vec<(String, String)>>>,
        post_count: Arc<AtomicUsize>,
        fail_with_429_once: std::sync::atomic::AtomicBool,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self { sent: Arc::new(TMutex::new(Vec::new())), post_count: Arc::new(AtomicUsize::new(0)), fail_with_429_once: std::sync::atomic::AtomicBool::new(false) }
        }
    }

    #[async_trait::async_trait]
    impl PushTransport for RecordingTransport {
        async fn send(&self, destination_id: &str, text: &str) -> Result<Option<Duration>, String> {
            self.post_count.fetch_add(1, Ordering::SeqCst);
            if self.fail_with_429_once.swap(false, Ordering::SeqCst) {
                return Ok(Some(Duration::from_millis(5)));
            }
            self.sent.lock().await.push((destination_id.to_string(), text.to_string()));
            Ok(None)
        }

        fn max_message_len(&self) -> usize {
            10_000
        }
    }

    fn text_msg(content: &str) -> SessionMessage {
        SessionMessage::new(crate::model::MessageType::Text, content)
    }

    #[tokio::test]
    async fn debounced_batch_sends_once() {
        let transport = Arc::new(RecordingTransport::new());
        let adapter = Arc::new(PushAdapter::new(transport.clone(), Arc::new(PlainTextFormatter), Duration::from_millis(30)));
        adapter.bind_session(&"s1".to_string(), "-1").await;

        adapter.handle_message(&"s1".to_string(), text_msg("one")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        adapter.handle_message(&"s1".to_string(), text_msg("two")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        adapter.handle_message(&"s1".to_string(), text_msg("three")).await;

        tokio::time::sleep(Duration::from_millis(80)).await;

        let sent = transport.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "one\ntwo\nthree");
        assert_eq!(transport.post_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spaced_sends_produce_two_flushes() {
        let transport = Arc::new(RecordingTransport::new());
        let adapter = Arc::new(PushAdapter::new(transport.clone(), Arc::new(PlainTextFormatter), Duration::from_millis(20)));
        adapter.bind_session(&"s1".to_string(), "-1").await;

        adapter.handle_message(&"s1".to_string(), text_msg("one")).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        adapter.handle_message(&"s1".to_string(), text_msg("two")).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let sent = transport.sent.lock().await;
        assert_eq!(sent.len(), 2);
    }

    #[tokio::test]
    async fn unbound_session_drops_message() {
        let transport = Arc::new(RecordingTransport::new());
        let adapter = Arc::new(PushAdapter::new(transport.clone(), Arc::new(PlainTextFormatter), Duration::from_millis(20)));
        adapter.handle_message(&"ghost".to_string(), text_msg("hi")).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(transport.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn critical_event_bypasses_debounce() {
        let transport = Arc::new(RecordingTransport::new());
        let adapter = Arc::new(PushAdapter::new(transport.clone(), Arc::new(PlainTextFormatter), Duration::from_secs(30)));
        adapter.bind_session(&"s1".to_string(), "-1").await;

        let event = SessionEvent::new("s1", EventType::PermissionRequest, crate::model::Severity::Urgent, "needs approval");
        adapter.handle_events(&"s1".to_string(), &[event]).await;

        let sent = transport.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("needs approval"));
    }

    #[tokio::test]
    async fn ignored_event_types_produce_no_send() {
        let transport = Arc::new(RecordingTransport::new());
        let adapter = Arc::new(PushAdapter::new(transport.clone(), Arc::new(PlainTextFormatter), Duration::from_secs(30)));
        adapter.bind_session(&"s1".to_string(), "-1").await;

        let event = SessionEvent::new("s1", EventType::Ready, crate::model::Severity::Info, "ready");
        adapter.handle_events(&"s1".to_string(), &[event]).await;
        assert!(transport.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn retry_after_429_retries_once() {
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_with_429_once.store(true, Ordering::SeqCst);
        let adapter = Arc::new(PushAdapter::new(transport.clone(), Arc::new(PlainTextFormatter), Duration::from_millis(10)));
        adapter.bind_session(&"s1".to_string(), "-1").await;

        adapter.handle_message(&"s1".to_string(), text_msg("hello")).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(transport.post_count.load(Ordering::SeqCst), 2);
        assert_eq!(transport.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn dispose_flushes_pending_batches() {
        let transport = Arc::new(RecordingTransport::new());
        let adapter = Arc::new(PushAdapter::new(transport.clone(), Arc::new(PlainTextFormatter), Duration::from_secs(30)));
        adapter.bind_session(&"s1".to_string(), "-1").await;
        adapter.handle_message(&"s1".to_string(), text_msg("pending")).await;

        adapter.dispose().await;
        assert_eq!(transport.sent.lock().await.len(), 1);
    }

    #[test]
    fn parse_retry_after_accepts_integer_seconds() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
    }
}
