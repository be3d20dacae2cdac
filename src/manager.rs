//! §4.8/§4.9 — the SessionManager: registry, admission, ACL, cursor-paginated
//! reads with blocking waits, the mode-switch state machine, retries, and
//! startup reconciliation.
//!
//! A central registry owning per-session runners plus a storage handle and
//! a broadcaster, with CRUD methods that validate, delegate, and persist —
//! generalized here to the provider-polymorphic `ProviderSession`
//! capability set, with ACL/cwd-sandbox/admission/mode-switch machinery a
//! single-tenant daemon would not otherwise need.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tracing::{error, info, warn};

use crate::acl::Acl;
use crate::config::SupervisorConfig;
use crate::cwd_sandbox::CwdSandbox;
use crate::error::{Result, SupervisorError};
use crate::model::{
    PermissionMode, PersistedSession, Session, SessionEvent, SessionId, SessionMessage, SessionMode,
    SwitchState,
};
use crate::persistence::{pid_is_alive, Persistence};
use crate::providers::{Provider, ProviderSession, ResumeOptions, SpawnOptions};
use crate::redact::{IdentityRedactor, Redactor};
use crate::retry::{retry_with_backoff, RetryConfig};

/// Substrings the §4.9 event glue greps for in an event's summary to
/// detect that a provider's subprocess has died, without the Manager ever
/// depending on which provider produced the event.
const PROCESS_EXIT_MARKERS: &[&str] = &["Process exited", "process exited", "Process error"];

pub struct SpawnRequest {
    pub provider: String,
    pub cwd: PathBuf,
    pub mode: SessionMode,
    pub permission_mode: PermissionMode,
    pub model: Option<String>,
    pub task: String,
    pub owner_id: String,
}

pub struct ResumeRequest {
    pub mode: Option<SessionMode>,
    pub task: String,
    pub permission_mode: PermissionMode,
    pub model: Option<String>,
}

pub struct ListFilter {
    pub cwd: Option<PathBuf>,
    pub provider: Option<String>,
}

pub struct ReadResult {
    pub messages: Vec<SessionMessage>,
    pub next_cursor: usize,
    pub timed_out: bool,
}

struct LiveEntry {
    session: Mutex<Session>,
    handle: Arc<dyn ProviderSession>,
    message_notify: Arc<Notify>,
}

pub struct SessionManager {
    config: SupervisorConfig,
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
    live: RwLock<HashMap<SessionId, Arc<LiveEntry>>>,
    acl: Acl,
    cwd_sandbox: CwdSandbox,
    persistence: Persistence,
    redactor: Arc<dyn Redactor>,
    message_tx: broadcast::Sender<(SessionId, SessionMessage)>,
    event_tx: broadcast::Sender<SessionEvent>,
    end_notify: RwLock<HashMap<SessionId, Arc<Notify>>>,
    listener_tasks: RwLock<HashMap<SessionId, tokio::task::JoinHandle<()>>>,
    /// Lets the background listener task spawned by `attach_listeners`
    /// call back into `cleanup()` on process-exit detection without an
    /// ownership cycle. Set once by `new_shared`.
    self_ref: RwLock<Option<std::sync::Weak<SessionManager>>>,
}

impl SessionManager {
    pub fn new(config: SupervisorConfig) -> Self {
        let cwd_sandbox = CwdSandbox::new(config.cwd_allowlist.clone());
        let persistence = Persistence::new(config.sessions_path());
        let (message_tx, _) = broadcast::channel(4096);
        let (event_tx, _) = broadcast::channel(4096);
        Self {
            config,
            providers: RwLock::new(HashMap::new()),
            live: RwLock::new(HashMap::new()),
            acl: Acl::new(),
            cwd_sandbox,
            persistence,
            redactor: Arc::new(IdentityRedactor),
            message_tx,
            event_tx,
            end_notify: RwLock::new(HashMap::new()),
            listener_tasks: RwLock::new(HashMap::new()),
            self_ref: RwLock::new(None),
        }
    }

    pub fn with_redactor(mut self, redactor: Arc<dyn Redactor>) -> Self {
        self.redactor = redactor;
        self
    }

    /// The Manager's listener tasks (one per live session) need to call
    /// back into `cleanup()` on process-exit detection; that requires a
    /// strong `Arc<Self>`, not just `&self`. Every caller is expected to
    /// wrap the Manager in an `Arc` and wire it via this method before
    /// spawning any session — mirrors the same pattern `FramedSession`
    /// uses for its own reconnect task.
    pub fn wire_self(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        *self.self_ref.try_write().expect("uncontended at startup wiring") = Some(weak);
    }

    async fn arc(&self) -> Option<Arc<Self>> {
        self.self_ref.read().await.as_ref().and_then(|w| w.upgrade())
    }

    pub async fn register_provider(&self, provider: Arc<dyn Provider>) {
        self.providers.write().await.insert(provider.name().to_string(), provider);
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<(SessionId, SessionMessage)> {
        self.message_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub async fn size(&self) -> usize {
        self.live.read().await.len()
    }

    // ── spawn ────────────────────────────────────────────────────────────

    pub async fn spawn(&self, req: SpawnRequest) -> Result<Session> {
        let provider = self
            .providers
            .read()
            .await
            .get(&req.provider)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownProvider { name: req.provider.clone() })?;

        let cwd = crate::cwd_sandbox::normalize_path(&req.cwd);
        self.cwd_sandbox.assert_allowed(&cwd)?;

        if self.config.max_sessions > 0 && self.size().await >= self.config.max_sessions {
            return Err(SupervisorError::AdmissionDenied {
                reason: format!("at capacity ({} sessions)", self.config.max_sessions),
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let spawn_options = SpawnOptions {
            id: id.clone(),
            cwd: cwd.clone(),
            mode: req.mode,
            permission_mode: req.permission_mode,
            model: req.model,
            task: req.task,
        };
        let handle = provider.create_session(spawn_options).await?;

        let pid = 0; // library/subprocess pid is a provider-internal detail not exposed via ProviderSession
        let session = Session {
            id: id.clone(),
            provider: req.provider.clone(),
            cwd,
            pid,
            mode: req.mode,
            owner_id: req.owner_id.clone(),
            created_at: chrono::Utc::now(),
            switch_state: SwitchState::Running,
            message_buffer: Vec::new(),
            last_activity: chrono::Utc::now(),
        };

        // Owner binding happens-before any listener is attached (R3 in §5).
        self.acl.set_owner(&id, &req.owner_id).await?;

        let entry = Arc::new(LiveEntry {
            session: Mutex::new(session.clone()),
            handle,
            message_notify: Arc::new(Notify::new()),
        });
        self.live.write().await.insert(id.clone(), entry.clone());
        self.attach_listeners(id.clone(), entry).await;

        self.persistence.add(session.to_persisted()).await?;
        Ok(session)
    }

    // ── resume ───────────────────────────────────────────────────────────

    pub async fn resume(&self, sid: &SessionId, req: ResumeRequest) -> Result<Session> {
        let persisted = self
            .persistence
            .load()
            .await?
            .into_iter()
            .find(|s| &s.id == sid)
            .ok_or_else(|| SupervisorError::NotFound { id: sid.clone() })?;

        let provider = self
            .providers
            .read()
            .await
            .get(&persisted.provider)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownProvider { name: persisted.provider.clone() })?;

        let mode = req.mode.unwrap_or(persisted.mode);
        let resume_options = ResumeOptions { cwd: persisted.cwd.clone(), mode };
        let handle = provider.resume_session(sid, resume_options).await?;

        let old_buffer = match self.live.read().await.get(sid) {
            Some(entry) => entry.session.lock().await.message_buffer.clone(),
            None => Vec::new(),
        };

        let session = Session {
            id: sid.clone(),
            provider: persisted.provider,
            cwd: persisted.cwd,
            pid: persisted.pid,
            mode,
            owner_id: persisted.owner_id,
            created_at: persisted.created_at,
            switch_state: SwitchState::Running,
            message_buffer: old_buffer,
            last_activity: chrono::Utc::now(),
        };

        let entry = Arc::new(LiveEntry {
            session: Mutex::new(session.clone()),
            handle,
            message_notify: Arc::new(Notify::new()),
        });
        self.live.write().await.insert(sid.clone(), entry.clone());
        self.attach_listeners(sid.clone(), entry).await;

        self.persistence.update(session.to_persisted()).await?;
        Ok(session)
    }

    // ── reads ────────────────────────────────────────────────────────────

    pub async fn get(&self, sid: &SessionId) -> Result<Session> {
        let live = self.live.read().await;
        let entry = live.get(sid).ok_or_else(|| SupervisorError::NotFound { id: sid.clone() })?;
        Ok(entry.session.lock().await.clone())
    }

    pub async fn get_switch_state(&self, sid: &SessionId) -> Result<SwitchState> {
        Ok(self.get(sid).await?.switch_state)
    }

    pub async fn get_last_activity(&self, sid: &SessionId) -> Result<chrono::DateTime<chrono::Utc>> {
        Ok(self.get(sid).await?.last_activity)
    }

    pub async fn list(&self, filter: ListFilter) -> Vec<Session> {
        let live = self.live.read().await;
        let mut out = Vec::new();
        for entry in live.values() {
            let session = entry.session.lock().await;
            if let Some(cwd) = &filter.cwd {
                if &session.cwd != cwd {
                    continue;
                }
            }
            if let Some(provider) = &filter.provider {
                if &session.provider != provider {
                    continue;
                }
            }
            out.push(session.clone());
        }
        out
    }

    /// §6 `read` non-blocking path. Redaction is applied here only — this
    /// is the Manager's egress boundary (invariant 9).
    pub async fn read_messages(&self, sid: &SessionId, cursor: usize, limit: usize) -> Result<ReadResult> {
        let live = self.live.read().await;
        let entry = live.get(sid).ok_or_else(|| SupervisorError::NotFound { id: sid.clone() })?.clone();
        drop(live);
        self.read_slice(&entry, cursor, limit).await
    }

    async fn read_slice(&self, entry: &Arc<LiveEntry>, cursor: usize, limit: usize) -> Result<ReadResult> {
        let session = entry.session.lock().await;
        let end = (cursor + limit).min(session.message_buffer.len());
        let start = cursor.min(end);
        let messages = session.message_buffer[start..end]
            .iter()
            .cloned()
            .map(|mut m| {
                m.content = self.redactor.redact(&m.content);
                m
            })
            .collect();
        Ok(ReadResult { messages, next_cursor: end, timed_out: false })
    }

    /// §5 blocking read contract. Clamps `timeout_ms` to `[1000, 120000]`.
    pub async fn wait_for_messages(
        &self,
        sid: &SessionId,
        cursor: usize,
        limit: usize,
        timeout_ms: Option<u64>,
    ) -> Result<ReadResult> {
        let timeout = Duration::from_millis(timeout_ms.unwrap_or(30_000).clamp(1_000, 120_000));

        let entry = {
            let live = self.live.read().await;
            live.get(sid).ok_or_else(|| SupervisorError::NotFound { id: sid.clone() })?.clone()
        };

        {
            let session = entry.session.lock().await;
            if session.message_buffer.len() > cursor {
                drop(session);
                let mut result = self.read_slice(&entry, cursor, limit).await?;
                result.timed_out = false;
                return Ok(result);
            }
        }

        let ended = self.end_notify_for(sid).await;
        let message_notify = entry.message_notify.clone();

        loop {
            tokio::select! {
                _ = message_notify.notified() => {
                    let session = entry.session.lock().await;
                    if session.message_buffer.len() > cursor {
                        drop(session);
                        return self.read_slice(&entry, cursor, limit).await;
                    }
                    // spurious wake (another cursor's message) — keep waiting
                }
                _ = ended.notified() => {
                    return self.read_slice(&entry, cursor, limit).await;
                }
                _ = tokio::time::sleep(timeout) => {
                    let mut result = self.read_slice(&entry, cursor, limit).await?;
                    result.timed_out = true;
                    return Ok(result);
                }
            }
        }
    }

    async fn end_notify_for(&self, sid: &SessionId) -> Arc<Notify> {
        let mut map = self.end_notify.write().await;
        map.entry(sid.clone()).or_insert_with(|| Arc::new(Notify::new())).clone()
    }

    // ── send / respond / stop ────────────────────────────────────────────

    pub async fn send(&self, sid: &SessionId, input: &str) -> Result<()> {
        let entry = {
            let live = self.live.read().await;
            live.get(sid).ok_or_else(|| SupervisorError::NotFound { id: sid.clone() })?.clone()
        };
        entry.handle.send(input).await
    }

    pub async fn respond_to_permission(&self, sid: &SessionId, request_id: &str, approved: bool) -> Result<()> {
        let entry = {
            let live = self.live.read().await;
            live.get(sid).ok_or_else(|| SupervisorError::NotFound { id: sid.clone() })?.clone()
        };
        entry.handle.respond_to_permission(request_id, approved).await
    }

    pub async fn stop(&self, sid: &SessionId) -> Result<()> {
        let entry = {
            let live = self.live.read().await;
            live.get(sid).cloned()
        };
        if let Some(entry) = entry {
            entry.handle.stop().await?;
        }
        self.cleanup(sid).await;
        Ok(())
    }

    // ── mode switch (§4.8.1) ─────────────────────────────────────────────

    pub async fn switch_mode(&self, sid: &SessionId, target: SessionMode) -> Result<()> {
        let entry = {
            let live = self.live.read().await;
            live.get(sid).ok_or_else(|| SupervisorError::NotFound { id: sid.clone() })?.clone()
        };

        {
            let session = entry.session.lock().await;
            if session.mode == target {
                return Ok(());
            }
            if session.switch_state != SwitchState::Running {
                return Err(SupervisorError::InvalidState {
                    id: sid.clone(),
                    expected: "running".to_string(),
                    found: format!("{:?}", session.switch_state),
                });
            }
        }

        self.set_switch_state(sid, SwitchState::Draining).await;
        self.event_tx
            .send(SessionEvent::new(sid.clone(), crate::model::EventType::Ready, crate::model::Severity::Info, "mode switch: running -> draining"))
            .ok();
        let drained = tokio::time::timeout(self.config.drain_timeout, entry.handle.switch_mode(target)).await;
        match drained {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(session_id = %sid, err = %e, "drain returned an error — continuing mode switch");
            }
            Err(_) => {
                warn!(session_id = %sid, timeout = ?self.config.drain_timeout, "drain timed out — continuing mode switch");
            }
        }

        self.set_switch_state(sid, SwitchState::Switching).await;
        self.event_tx
            .send(SessionEvent::new(sid.clone(), crate::model::EventType::Ready, crate::model::Severity::Info, "mode switch: draining -> switching"))
            .ok();
        let _ = entry.handle.stop().await;

        let cwd = entry.session.lock().await.cwd.clone();
        let provider_name = entry.session.lock().await.provider.clone();
        let provider = self.providers.read().await.get(&provider_name).cloned();

        let Some(provider) = provider else {
            self.fail_switch(sid, "unknown provider during switch").await;
            return Err(SupervisorError::UnknownProvider { name: provider_name });
        };

        match provider.resume_session(sid, ResumeOptions { cwd, mode: target }).await {
            Err(e) => {
                self.fail_switch(sid, &format!("Mode switch failed: {e}")).await;
                Err(e)
            }
            Ok(new_handle) => {
                let old_buffer = entry.session.lock().await.message_buffer.clone();
                let mut session = entry.session.lock().await.clone();
                session.mode = target;
                session.switch_state = SwitchState::Running;
                session.message_buffer = old_buffer;

                let new_entry = Arc::new(LiveEntry {
                    session: Mutex::new(session.clone()),
                    handle: new_handle,
                    message_notify: Arc::new(Notify::new()),
                });
                self.live.write().await.insert(sid.clone(), new_entry.clone());
                self.attach_listeners(sid.clone(), new_entry).await;
                self.persistence.update(session.to_persisted()).await?;

                self.event_tx
                    .send(SessionEvent::new(sid.clone(), crate::model::EventType::Ready, crate::model::Severity::Info, "mode switch: switching -> running"))
                    .ok();
                Ok(())
            }
        }
    }

    async fn fail_switch(&self, sid: &SessionId, reason: &str) {
        self.set_switch_state(sid, SwitchState::Error).await;
        error!(session_id = %sid, reason, "mode switch failed");
        self.event_tx
            .send(SessionEvent::new(sid.clone(), crate::model::EventType::Error, crate::model::Severity::Urgent, reason.to_string()))
            .ok();
        self.cleanup(sid).await;
    }

    async fn set_switch_state(&self, sid: &SessionId, state: SwitchState) {
        if let Some(entry) = self.live.read().await.get(sid) {
            entry.session.lock().await.switch_state = state;
        }
    }

    // ── retryResume (§4.8) ───────────────────────────────────────────────

    pub async fn retry_resume(&self, sid: &SessionId, req: ResumeRequest, max_retries: u32, base_delay_ms: u64) -> Result<Session> {
        let config = RetryConfig {
            max_attempts: max_retries.max(1),
            initial_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(base_delay_ms * 2u64.pow(max_retries.min(16))),
            multiplier: 2.0,
        };

        let mut attempt = 0u32;
        let result = retry_with_backoff(&config, || {
            attempt += 1;
            let req_clone = ResumeRequest {
                mode: req.mode,
                task: req.task.clone(),
                permission_mode: req.permission_mode,
                model: req.model.clone(),
            };
            let sid = sid.clone();
            async move {
                self.event_tx
                    .send(SessionEvent::new(sid.clone(), crate::model::EventType::Ready, crate::model::Severity::Info, format!("retryResume attempt {attempt}")))
                    .ok();
                self.resume(&sid, req_clone).await
            }
        })
        .await;

        if result.is_err() {
            self.event_tx
                .send(SessionEvent::new(sid.clone(), crate::model::EventType::Error, crate::model::Severity::Urgent, "retryResume exhausted all attempts"))
                .ok();
        }
        result
    }

    // ── listeners / cleanup (§4.9) ───────────────────────────────────────

    async fn attach_listeners(&self, sid: SessionId, entry: Arc<LiveEntry>) {
        let mut messages = entry.handle.subscribe_messages();
        let mut events = entry.handle.subscribe_events();
        let message_tx = self.message_tx.clone();
        let event_tx = self.event_tx.clone();
        let entry_for_task = entry.clone();
        let sid_for_task = sid.clone();

        let manager = self.arc().await.expect("SessionManager must be wired via wire_self before spawning sessions");

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = messages.recv() => {
                        match msg {
                            Ok(message) => {
                                {
                                    let mut session = entry_for_task.session.lock().await;
                                    session.message_buffer.push(message.clone());
                                    session.last_activity = chrono::Utc::now();
                                }
                                entry_for_task.message_notify.notify_waiters();
                                let _ = message_tx.send((sid_for_task.clone(), message));
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(session_id = %sid_for_task, skipped = n, "message bus lagged");
                            }
                        }
                    }
                    evt = events.recv() => {
                        match evt {
                            Ok(event) => {
                                let _ = event_tx.send(event.clone());
                                let switch_state = entry_for_task.session.lock().await.switch_state;
                                let is_exit = PROCESS_EXIT_MARKERS.iter().any(|m| event.summary.contains(m));
                                if is_exit && !matches!(switch_state, SwitchState::Draining | SwitchState::Switching) {
                                    manager.cleanup(&sid_for_task).await;
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(session_id = %sid_for_task, skipped = n, "event bus lagged");
                            }
                        }
                    }
                }
            }
        });

        self.listener_tasks.write().await.insert(sid, task);
    }

    /// §4.8.2 cleanup rule, reachable from any path.
    pub async fn cleanup(&self, sid: &SessionId) {
        self.live.write().await.remove(sid);
        if let Some(notify) = self.end_notify.read().await.get(sid) {
            notify.notify_waiters();
        }
        self.end_notify.write().await.remove(sid);
        if let Some(task) = self.listener_tasks.write().await.remove(sid) {
            task.abort();
        }
        self.acl.remove_session(sid).await;
        let _ = self.persistence.remove(sid).await;
    }

    pub fn acl(&self) -> &Acl {
        &self.acl
    }

    // ── startup reconciliation ───────────────────────────────────────────

    /// §4.8 `reconcileOnStartup`. Alive entries are *not* re-added to the
    /// live map (no attach protocol exists to reconstruct the in-memory
    /// `ProviderSession`); they are left in persistence for an explicit
    /// `resume` to pick back up. Dead entries are purged from persistence.
    pub async fn reconcile_on_startup(&self) -> Result<(usize, usize)> {
        let persisted = self.persistence.load().await?;
        let mut alive = Vec::new();
        let mut dead = Vec::new();
        for session in persisted {
            if pid_is_alive(session.pid) {
                alive.push(session);
            } else {
                dead.push(session);
            }
        }

        let dead_ids: Vec<String> = dead.iter().map(|s| s.id.clone()).collect();
        if !dead_ids.is_empty() {
            self.persistence.remove_many(&dead_ids).await?;
        }

        for session in &alive {
            self.acl.set_owner(&session.id, &session.owner_id).await.ok();
            info!(session_id = %session.id, "reconciled alive-but-detached session; awaiting explicit resume");
        }

        info!(alive = alive.len(), dead = dead.len(), "startup reconciliation complete");
        Ok((alive.len(), dead.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventType, MessageType, Severity};
    use crate::providers::ProviderCore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A scripted `ProviderSession` good enough to exercise the Manager's
    /// own machinery (mode switch, blocking reads, retries) without a real
    /// subprocess or upstream library.
    struct FakeSession {
        id: SessionId,
        core: Arc<ProviderCore>,
    }

    #[async_trait]
    impl ProviderSession for FakeSession {
        fn id(&self) -> SessionId {
            self.id.clone()
        }
        async fn send(&self, _input: &str) -> Result<()> {
            Ok(())
        }
        async fn read(&self, cursor: usize, limit: usize) -> Result<(Vec<SessionMessage>, usize)> {
            Ok(self.core.read(cursor, limit).await)
        }
        async fn switch_mode(&self, _target: SessionMode) -> Result<()> {
            Ok(())
        }
        async fn respond_to_permission(&self, _request_id: &str, _approved: bool) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        fn subscribe_messages(&self) -> broadcast::Receiver<SessionMessage> {
            self.core.messages.subscribe()
        }
        fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
            self.core.events.subscribe()
        }
    }

    /// Stores the `ProviderCore` behind each minted session so tests can
    /// emit messages/events as if they came from the (fake) upstream,
    /// the way `ProviderCore::emit_message` would be called from a real
    /// provider's background event loop.
    struct FakeProvider {
        fail_resume: AtomicBool,
        cores: Mutex<HashMap<SessionId, Arc<ProviderCore>>>,
    }

    impl FakeProvider {
        fn new() -> Self {
            Self { fail_resume: AtomicBool::new(false), cores: Mutex::new(HashMap::new()) }
        }

        async fn core_for(&self, sid: &SessionId) -> Arc<ProviderCore> {
            self.cores.lock().await.get(sid).cloned().expect("session was spawned through this provider")
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }
        async fn create_session(&self, options: SpawnOptions) -> Result<Arc<dyn ProviderSession>> {
            let core = Arc::new(ProviderCore::new());
            self.cores.lock().await.insert(options.id.clone(), core.clone());
            Ok(Arc::new(FakeSession { id: options.id, core }))
        }
        async fn resume_session(&self, sid: &SessionId, _options: ResumeOptions) -> Result<Arc<dyn ProviderSession>> {
            if self.fail_resume.load(Ordering::Acquire) {
                return Err(SupervisorError::TransportError("resume failed".to_string()));
            }
            let core = Arc::new(ProviderCore::new());
            self.cores.lock().await.insert(sid.clone(), core.clone());
            Ok(Arc::new(FakeSession { id: sid.clone(), core }))
        }
    }

    async fn test_manager() -> (Arc<SessionManager>, Arc<FakeProvider>) {
        let dir = tempfile::TempDir::new().unwrap();
        let config = SupervisorConfig::new(Some(dir.path().to_path_buf()), None, None);
        let manager = Arc::new(SessionManager::new(config));
        manager.wire_self();
        let provider = Arc::new(FakeProvider::new());
        manager.register_provider(provider.clone()).await;
        (manager, provider)
    }

    fn spawn_req(owner: &str) -> SpawnRequest {
        SpawnRequest {
            provider: "fake".to_string(),
            cwd: PathBuf::from("/tmp"),
            mode: SessionMode::Remote,
            permission_mode: PermissionMode::Default,
            model: None,
            task: "hi".to_string(),
            owner_id: owner.to_string(),
        }
    }

    #[tokio::test]
    async fn spawn_send_read_stop_round_trip() {
        let (manager, provider) = test_manager().await;
        let session = manager.spawn(spawn_req("alice")).await.unwrap();

        manager.send(&session.id, "hello").await.unwrap();

        let core = provider.core_for(&session.id).await;
        core.emit_message(SessionMessage::new(MessageType::Text, "Hello")).await;
        // attach_listeners runs on a background task; give it a moment to
        // drain the provider's message broadcast into the Manager's buffer.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let read = manager.read_messages(&session.id, 0, 50).await.unwrap();
        assert_eq!(read.messages.len(), 1);
        assert_eq!(read.messages[0].content, "Hello");
        assert_eq!(read.next_cursor, 1);

        manager.stop(&session.id).await.unwrap();
        assert!(matches!(manager.get(&session.id).await, Err(SupervisorError::NotFound { .. })));
    }

    #[tokio::test]
    async fn cross_user_denial() {
        let (manager, _provider) = test_manager().await;
        let session = manager.spawn(spawn_req("alice")).await.unwrap();
        assert!(manager.acl().assert_owner("alice", &session.id).await.is_ok());
        assert!(matches!(
            manager.acl().assert_owner("bob", &session.id).await,
            Err(SupervisorError::AccessDenied { .. })
        ));
    }

    #[tokio::test]
    async fn wait_for_messages_resolves_on_arrival() {
        let (manager, provider) = test_manager().await;
        let session = manager.spawn(spawn_req("alice")).await.unwrap();
        let sid = session.id.clone();

        let manager2 = manager.clone();
        let sid2 = sid.clone();
        let waiter = tokio::spawn(async move { manager2.wait_for_messages(&sid2, 0, 50, Some(5_000)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let core = provider.core_for(&sid).await;
        core.emit_message(SessionMessage::new(MessageType::Text, "hi")).await;

        let result = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("waiter should resolve once the message bus wakes it")
            .unwrap()
            .unwrap();
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].content, "hi");
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn wait_for_messages_times_out() {
        let (manager, _provider) = test_manager().await;
        let session = manager.spawn(spawn_req("alice")).await.unwrap();
        let result = manager.wait_for_messages(&session.id, 0, 50, Some(1_000)).await.unwrap();
        assert!(result.timed_out);
        assert!(result.messages.is_empty());
    }

    #[tokio::test]
    async fn switch_mode_success_runs_full_transition() {
        let (manager, _provider) = test_manager().await;
        let session = manager.spawn(spawn_req("alice")).await.unwrap();
        assert_eq!(session.mode, SessionMode::Remote);

        let mut events = manager.subscribe_events();
        manager.switch_mode(&session.id, SessionMode::Local).await.unwrap();
        let after = manager.get(&session.id).await.unwrap();
        assert_eq!(after.mode, SessionMode::Local);
        assert_eq!(after.switch_state, SwitchState::Running);

        let mut seen = Vec::new();
        while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            seen.push(event.summary);
            if seen.len() == 3 {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                "mode switch: running -> draining",
                "mode switch: draining -> switching",
                "mode switch: switching -> running",
            ]
        );
    }

    #[tokio::test]
    async fn switch_mode_same_mode_is_noop() {
        let (manager, _provider) = test_manager().await;
        let session = manager.spawn(spawn_req("alice")).await.unwrap();
        manager.switch_mode(&session.id, SessionMode::Remote).await.unwrap();
        let after = manager.get(&session.id).await.unwrap();
        assert_eq!(after.switch_state, SwitchState::Running);
    }

    #[tokio::test]
    async fn switch_mode_failure_removes_session_and_emits_urgent_event() {
        let (manager, provider) = test_manager().await;
        let session = manager.spawn(spawn_req("alice")).await.unwrap();

        let mut events = manager.subscribe_events();
        provider.fail_resume.store(true, Ordering::Release);

        let result = manager.switch_mode(&session.id, SessionMode::Local).await;
        assert!(result.is_err());
        assert!(matches!(manager.get(&session.id).await, Err(SupervisorError::NotFound { .. })));
        assert!(matches!(
            manager.acl().assert_owner("alice", &session.id).await,
            Err(SupervisorError::NotFound { .. })
        ));

        let mut saw_urgent_mode_switch_failed = false;
        while let Ok(event) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await.unwrap_or(Err(broadcast::error::RecvError::Closed)) {
            if event.kind == EventType::Error && event.severity == Severity::Urgent && event.summary.contains("Mode switch failed") {
                saw_urgent_mode_switch_failed = true;
                break;
            }
        }
        assert!(saw_urgent_mode_switch_failed);
    }

    #[tokio::test]
    async fn retry_resume_exhausts_and_emits_urgent_event() {
        let (manager, _provider) = test_manager().await;
        // No persisted session exists for "ghost" — every resume attempt fails
        // with not_found, so retryResume should exhaust all attempts.
        let mut events = manager.subscribe_events();
        let result = manager
            .retry_resume(
                &"ghost".to_string(),
                ResumeRequest { mode: None, task: "hi".to_string(), permission_mode: PermissionMode::Default, model: None },
                2,
                1,
            )
            .await;
        assert!(result.is_err());

        let mut saw_exhausted = false;
        while let Ok(event) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await.unwrap_or(Err(broadcast::error::RecvError::Closed)) {
            if event.summary.contains("exhausted") {
                saw_exhausted = true;
                break;
            }
        }
        assert!(saw_exhausted);
    }
}
