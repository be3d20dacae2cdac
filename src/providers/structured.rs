//! §4.5 — Provider A: a session over a library that streams typed messages
//! and dispatches permission callbacks.
//!
//! **Ready model.** The *externally* visible session id is minted by the
//! Manager before this provider is ever constructed (see `SpawnOptions::id`)
//! so the Manager always has something to register in its live map. What's
//! genuinely unknown until the upstream stream emits it is the *upstream*
//! library's own correlation id — `send` before that arrives fails with
//! `not_ready` because there's nothing yet to address input to, not because
//! the caller-facing id is missing. This resolves the apparent tension
//! between §3's "session id unknown until ready" and the Manager's need to
//! register a session synchronously at `spawn` time (see DESIGN.md).

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex, Notify, RwLock};

use super::{deny_all_pending, resolve_permission, PendingPermission, PendingPermissions, Provider, ProviderCore, ProviderSession, ResumeOptions, SpawnOptions};
use crate::async_queue::{AsyncQueue, AsyncQueueReceiver};
use crate::error::{Result, SupervisorError};
use crate::model::{
    EventType, MessageMetadata, MessageType, PermissionDetail, SessionEvent, SessionId,
    SessionMessage, SessionMode, Severity,
};

const PERMISSION_TIMEOUT: Duration = Duration::from_secs(300);

/// A message as classified by the upstream library, before §4.5's mapping
/// to `SessionMessage`/`SessionEvent`.
#[derive(Debug, Clone)]
pub enum UpstreamMessage {
    AssistantText(String),
    AssistantThinking(String),
    ToolUse { id: String, name: String, input: serde_json::Value },
    ToolUseSummary { content: String },
    Result { success: bool, summary: String },
    SystemInit { model: Option<String> },
    /// Any subtype not named in §4.5's mapping table; ignored.
    Other,
}

#[derive(Debug)]
pub enum PermissionDecision {
    Allow,
    Deny { message: String },
}

/// The library's push into our code when the model wants to run a tool.
pub struct PermissionCallback {
    pub request_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub decision_reason: Option<String>,
    pub respond: oneshot::Sender<PermissionDecision>,
    /// Fires if the upstream library aborts the request on its own (§4.5 step 3).
    pub abort_signal: oneshot::Receiver<()>,
}

/// One item the upstream stream can yield: a classified message, or a
/// permission callback dispatch.
pub enum StreamItem {
    Message(UpstreamMessage),
    Permission(PermissionCallback),
}

/// The library-shaped stream this provider drives. A real integration
/// implements this against the actual provider SDK; this crate's plumbing
/// depends only on the trait.
#[async_trait]
pub trait UpstreamQuery: Send + Sync {
    async fn next(&mut self) -> Result<Option<StreamItem>>;
    async fn feed(&mut self, input: String) -> Result<()>;
    async fn close(&mut self);
}

/// Constructs the upstream query for a session. Supplied by whatever wires
/// this provider to a real upstream library (out of scope for this crate).
#[async_trait]
pub trait UpstreamQueryFactory: Send + Sync {
    async fn start(&self, options: &SpawnOptions, queue: AsyncQueueReceiver<String>) -> Result<Box<dyn UpstreamQuery>>;
}

pub struct StructuredProvider {
    factory: Arc<dyn UpstreamQueryFactory>,
}

impl StructuredProvider {
    pub fn new(factory: Arc<dyn UpstreamQueryFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl Provider for StructuredProvider {
    fn name(&self) -> &str {
        "structured"
    }

    async fn create_session(&self, options: SpawnOptions) -> Result<Arc<dyn ProviderSession>> {
        StructuredSession::spawn(options, self.factory.clone()).await
    }

    async fn resume_session(&self, sid: &SessionId, options: ResumeOptions) -> Result<Arc<dyn ProviderSession>> {
        let spawn_options = SpawnOptions {
            id: sid.clone(),
            cwd: options.cwd,
            mode: options.mode,
            permission_mode: crate::model::PermissionMode::Default,
            model: None,
            task: String::new(),
        };
        StructuredSession::spawn(spawn_options, self.factory.clone()).await
    }
}

pub struct StructuredSession {
    id: SessionId,
    core: Arc<ProviderCore>,
    input: Arc<AsyncQueue<String>>,
    pending: Arc<PendingPermissions>,
    ready: Arc<Notify>,
    ready_flag: Arc<AtomicBool>,
    ended: Arc<AtomicBool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StructuredSession {
    async fn spawn(
        options: SpawnOptions,
        factory: Arc<dyn UpstreamQueryFactory>,
    ) -> Result<Arc<dyn ProviderSession>> {
        let id = options.id.clone();
        let core = Arc::new(ProviderCore::new());
        let (input, input_rx) = AsyncQueue::new();
        let input = Arc::new(input);
        let pending: Arc<PendingPermissions> = Arc::new(Mutex::new(std::collections::HashMap::new()));
        let ready = Arc::new(Notify::new());
        let ready_flag = Arc::new(AtomicBool::new(false));
        let ended = Arc::new(AtomicBool::new(false));

        let mut query = factory.start(&options, input_rx).await?;

        let core_bg = core.clone();
        let pending_bg = pending.clone();
        let ready_bg = ready.clone();
        let ready_flag_bg = ready_flag.clone();
        let ended_bg = ended.clone();
        let id_bg = id.clone();
        let task = tokio::spawn(async move {
            run_event_loop(&mut query, core_bg, pending_bg, ready_bg, ready_flag_bg, ended_bg, id_bg).await;
        });

        Ok(Arc::new(Self {
            id,
            core,
            input,
            pending,
            ready,
            ready_flag,
            ended,
            task: Mutex::new(Some(task)),
        }))
    }
}

async fn run_event_loop(
    query: &mut Box<dyn UpstreamQuery>,
    core: Arc<ProviderCore>,
    pending: Arc<PendingPermissions>,
    ready: Arc<Notify>,
    ready_flag: Arc<AtomicBool>,
    ended: Arc<AtomicBool>,
    session_id: SessionId,
) {
    loop {
        let item = match query.next().await {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(e) => {
                core.emit_event(SessionEvent::new(
                    session_id.clone(),
                    EventType::Error,
                    Severity::Warning,
                    format!("stream read error: {e}"),
                ));
                continue;
            }
        };

        match item {
            StreamItem::Message(msg) => handle_upstream_message(&core, &ready, &ready_flag, &session_id, msg).await,
            StreamItem::Permission(cb) => handle_permission_callback(&core, &pending, &session_id, cb).await,
        }
    }

    ended.store(true, Ordering::Release);
    deny_all_pending(&pending).await;
    ready.notify_waiters();
}

async fn handle_upstream_message(
    core: &ProviderCore,
    ready: &Notify,
    ready_flag: &AtomicBool,
    session_id: &SessionId,
    msg: UpstreamMessage,
) {
    match msg {
        UpstreamMessage::AssistantText(text) => {
            core.emit_message(SessionMessage::new(MessageType::Text, text)).await;
        }
        UpstreamMessage::AssistantThinking(text) => {
            core.emit_message(SessionMessage::new(MessageType::Thinking, text)).await;
        }
        UpstreamMessage::ToolUse { id: _, name, input } => {
            let content = serde_json::to_string(&input).unwrap_or_default();
            core.emit_message(
                SessionMessage::new(MessageType::ToolUse, content)
                    .with_metadata(MessageMetadata { tool: Some(name), ..Default::default() }),
            )
            .await;
        }
        UpstreamMessage::ToolUseSummary { content } => {
            core.emit_message(SessionMessage::new(MessageType::ToolResult, content)).await;
        }
        UpstreamMessage::Result { success, summary } => {
            core.emit_message(SessionMessage::new(MessageType::Result, summary.clone())).await;
            let severity = if success { Severity::Info } else { Severity::Warning };
            core.emit_event(SessionEvent::new(session_id.clone(), EventType::TaskComplete, severity, summary));
        }
        UpstreamMessage::SystemInit { model } => {
            if !ready_flag.swap(true, Ordering::AcqRel) {
                ready.notify_waiters();
            }
            let summary = model.unwrap_or_else(|| "ready".to_string());
            core.emit_event(SessionEvent::new(session_id.clone(), EventType::Ready, Severity::Info, summary));
        }
        UpstreamMessage::Other => {}
    }
}

async fn handle_permission_callback(
    core: &ProviderCore,
    pending: &PendingPermissions,
    session_id: &SessionId,
    cb: PermissionCallback,
) {
    core.emit_event(
        SessionEvent::new(session_id.clone(), EventType::PermissionRequest, Severity::Urgent, "permission requested")
            .with_permission_detail(PermissionDetail {
                request_id: cb.request_id.clone(),
                tool_name: cb.tool_name.clone(),
                input: cb.input.clone(),
                decision_reason: cb.decision_reason.clone(),
                command: None,
                cwd: None,
            }),
    );

    let (tx, rx) = oneshot::channel();
    pending.lock().await.insert(cb.request_id.clone(), PendingPermission { resolver: tx });

    let timer = tokio::time::sleep(PERMISSION_TIMEOUT);
    tokio::pin!(timer);
    let mut abort_signal = cb.abort_signal;

    let mut deny_reason = None;
    let decision = tokio::select! {
        result = rx => result.unwrap_or(false),
        _ = &mut timer => {
            pending.lock().await.remove(&cb.request_id);
            deny_reason = Some(format!("permission request {} timed out after {PERMISSION_TIMEOUT:?} — auto-denied", cb.request_id));
            false
        }
        _ = &mut abort_signal => {
            pending.lock().await.remove(&cb.request_id);
            deny_reason = Some(format!("permission request {} aborted — auto-denied", cb.request_id));
            false
        }
    };

    if let Some(reason) = &deny_reason {
        core.emit_event(SessionEvent::new(session_id.clone(), EventType::Error, Severity::Warning, reason.clone()));
    }

    let reply = if decision {
        PermissionDecision::Allow
    } else {
        PermissionDecision::Deny { message: deny_reason.unwrap_or_else(|| "denied".to_string()) }
    };
    let _ = cb.respond.send(reply);
}

#[async_trait]
impl ProviderSession for StructuredSession {
    fn id(&self) -> SessionId {
        self.id.clone()
    }

    async fn send(&self, input: &str) -> Result<()> {
        if self.ended.load(Ordering::Acquire) {
            return Err(SupervisorError::InvalidState {
                id: self.id.clone(),
                expected: "running".to_string(),
                found: "stopped".to_string(),
            });
        }
        if !self.ready_flag.load(Ordering::Acquire) {
            self.wait_for_ready().await?;
        }
        if self.ended.load(Ordering::Acquire) {
            return Err(SupervisorError::NotReady { id: self.id.clone() });
        }
        self.input.push(input.to_string())
    }

    async fn read(&self, cursor: usize, limit: usize) -> Result<(Vec<SessionMessage>, usize)> {
        Ok(self.core.read(cursor, limit).await)
    }

    async fn switch_mode(&self, _target: SessionMode) -> Result<()> {
        // The structured provider has no server-side mode concept of its own;
        // the Manager's drain/switch/resume state machine handles switching
        // by stopping this session and asking the provider factory to
        // construct a fresh one in the target mode.
        Ok(())
    }

    async fn respond_to_permission(&self, request_id: &str, approved: bool) -> Result<()> {
        if resolve_permission(&self.pending, request_id, approved).await {
            Ok(())
        } else {
            Err(SupervisorError::NotFound { id: request_id.to_string() })
        }
    }

    async fn stop(&self) -> Result<()> {
        deny_all_pending(&self.pending).await;
        self.input.end();
        if let Some(task) = self.task.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        Ok(())
    }

    fn subscribe_messages(&self) -> broadcast::Receiver<SessionMessage> {
        self.core.messages.subscribe()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.core.events.subscribe()
    }

    async fn wait_for_ready(&self) -> Result<()> {
        if self.ready_flag.load(Ordering::Acquire) || self.ended.load(Ordering::Acquire) {
            return Ok(());
        }
        self.ready.notified().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    struct ScriptedQuery {
        items: mpsc::UnboundedReceiver<StreamItem>,
        fed: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl UpstreamQuery for ScriptedQuery {
        async fn next(&mut self) -> Result<Option<StreamItem>> {
            Ok(self.items.recv().await)
        }
        async fn feed(&mut self, input: String) -> Result<()> {
            self.fed.lock().await.push(input);
            Ok(())
        }
        async fn close(&mut self) {}
    }

    struct ScriptedFactory {
        tx: Mutex<Option<mpsc::UnboundedSender<StreamItem>>>,
        fed: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl UpstreamQueryFactory for ScriptedFactory {
        async fn start(&self, _options: &SpawnOptions, mut rx: AsyncQueueReceiver<String>) -> Result<Box<dyn UpstreamQuery>> {
            let (tx, items) = mpsc::unbounded_channel();
            *self.tx.lock().await = Some(tx);
            let fed = self.fed.clone();
            tokio::spawn(async move {
                while let Some(v) = rx.next().await {
                    fed.lock().await.push(v);
                }
            });
            Ok(Box::new(ScriptedQuery { items, fed: self.fed.clone() }))
        }
    }

    fn opts(id: &str) -> SpawnOptions {
        SpawnOptions {
            id: id.to_string(),
            cwd: PathBuf::from("/tmp"),
            mode: SessionMode::Remote,
            permission_mode: crate::model::PermissionMode::Default,
            model: None,
            task: "hello".to_string(),
        }
    }

    #[tokio::test]
    async fn send_before_ready_waits_then_succeeds() {
        let factory = Arc::new(ScriptedFactory { tx: Mutex::new(None), fed: Arc::new(Mutex::new(vec![])) });
        let provider = StructuredProvider::new(factory.clone());
        let session = provider.create_session(opts("s1")).await.unwrap();

        let mut messages = session.subscribe_messages();
        let tx = factory.tx.lock().await.clone().unwrap();
        tx.send(StreamItem::Message(UpstreamMessage::SystemInit { model: Some("m1".into()) })).unwrap();

        session.wait_for_ready().await.unwrap();
        session.send("hi").await.unwrap();

        tx.send(StreamItem::Message(UpstreamMessage::AssistantText("Hello".into()))).unwrap();
        let msg = messages.recv().await.unwrap();
        assert_eq!(msg.content, "Hello");
    }

    #[tokio::test]
    async fn permission_round_trip_resolves_exactly_once() {
        let factory = Arc::new(ScriptedFactory { tx: Mutex::new(None), fed: Arc::new(Mutex::new(vec![])) });
        let provider = StructuredProvider::new(factory.clone());
        let session = provider.create_session(opts("s1")).await.unwrap();
        let tx = factory.tx.lock().await.clone().unwrap();

        let (resp_tx, resp_rx) = oneshot::channel();
        let (_abort_tx, abort_rx) = oneshot::channel();
        tx.send(StreamItem::Message(UpstreamMessage::SystemInit { model: None })).unwrap();
        tx.send(StreamItem::Permission(PermissionCallback {
            request_id: "R".to_string(),
            tool_name: "Bash".to_string(),
            input: serde_json::json!({}),
            decision_reason: None,
            respond: resp_tx,
            abort_signal: abort_rx,
        }))
        .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        session.respond_to_permission("R", true).await.unwrap();
        assert!(matches!(resp_rx.await.unwrap(), PermissionDecision::Allow));

        assert!(matches!(
            session.respond_to_permission("R", true).await,
            Err(SupervisorError::NotFound { .. })
        ));
    }
}
