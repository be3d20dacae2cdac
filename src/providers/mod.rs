//! The polymorphic provider capability set (§9 "Polymorphism") and the two
//! concrete variants: `structured` (Provider A) and `framed` (Provider B).

pub mod framed;
pub mod structured;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::model::{PermissionMode, SessionId, SessionMessage, SessionMode};

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// The externally stable id the Manager minted before calling the
    /// provider (see `providers::structured` doc comment on the Ready model
    /// for why this is decided at the Manager, not inside either provider).
    pub id: SessionId,
    pub cwd: PathBuf,
    pub mode: SessionMode,
    pub permission_mode: PermissionMode,
    pub model: Option<String>,
    pub task: String,
}

#[derive(Debug, Clone)]
pub struct ResumeOptions {
    pub cwd: PathBuf,
    pub mode: SessionMode,
}

/// A provider factory, installed into the Manager by name (`registerProvider`).
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    async fn create_session(&self, options: SpawnOptions) -> Result<Arc<dyn ProviderSession>>;
    async fn resume_session(
        &self,
        sid: &SessionId,
        options: ResumeOptions,
    ) -> Result<Arc<dyn ProviderSession>>;
}

/// The uniform session contract both provider families implement (§3, §9).
/// The Manager depends only on this capability set — never on which
/// concrete provider backs a session.
#[async_trait]
pub trait ProviderSession: Send + Sync {
    /// The externally stable identity (the pending id for the framed provider).
    fn id(&self) -> SessionId;

    async fn send(&self, input: &str) -> Result<()>;

    /// Each provider may keep its own buffer for direct (non-Manager-mediated)
    /// reads. These reads are *not* redacted (invariant 9) — only the
    /// Manager's own `readMessages` applies redaction.
    async fn read(&self, cursor: usize, limit: usize) -> Result<(Vec<SessionMessage>, usize)>;

    async fn switch_mode(&self, target: SessionMode) -> Result<()>;

    async fn respond_to_permission(&self, request_id: &str, approved: bool) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    fn subscribe_messages(&self) -> broadcast::Receiver<SessionMessage>;

    fn subscribe_events(&self) -> broadcast::Receiver<crate::model::SessionEvent>;

    /// Resolves when either the session id is known or the stream has
    /// ended. Only the structured provider needs this (its id arrives
    /// asynchronously); the framed provider knows its pending id from
    /// construction and can resolve immediately.
    async fn wait_for_ready(&self) -> Result<()> {
        Ok(())
    }
}

/// Shared message/event fan-out every concrete provider session embeds.
/// Appends are the provider's own callback context (§5's single point of
/// truth for the in-memory buffer); broadcasts mirror into the Manager.
pub(crate) struct ProviderCore {
    pub buffer: tokio::sync::Mutex<Vec<SessionMessage>>,
    pub messages: broadcast::Sender<SessionMessage>,
    pub events: broadcast::Sender<crate::model::SessionEvent>,
}

impl ProviderCore {
    pub fn new() -> Self {
        let (messages, _) = broadcast::channel(1024);
        let (events, _) = broadcast::channel(1024);
        Self { buffer: tokio::sync::Mutex::new(Vec::new()), messages, events }
    }

    pub async fn emit_message(&self, msg: SessionMessage) {
        self.buffer.lock().await.push(msg.clone());
        let _ = self.messages.send(msg);
    }

    pub fn emit_event(&self, event: crate::model::SessionEvent) {
        let _ = self.events.send(event);
    }

    pub async fn read(&self, cursor: usize, limit: usize) -> (Vec<SessionMessage>, usize) {
        let buffer = self.buffer.lock().await;
        let end = (cursor + limit).min(buffer.len());
        let start = cursor.min(end);
        (buffer[start..end].to_vec(), end)
    }
}

/// A pending out-of-band approval (§3 `PermissionRequest`, §4.5/§4.6.7).
/// Exactly one of {user decision, timeout, abort, stop} resolves it; the
/// resolver is a first-class value (a oneshot sender), never a callback chain.
pub(crate) struct PendingPermission {
    pub resolver: tokio::sync::oneshot::Sender<bool>,
}

pub(crate) type PendingPermissions =
    tokio::sync::Mutex<std::collections::HashMap<String, PendingPermission>>;

/// Resolve a pending permission exactly once; returns `true` if one was found.
pub(crate) async fn resolve_permission(
    pending: &PendingPermissions,
    request_id: &str,
    approved: bool,
) -> bool {
    let mut guard = pending.lock().await;
    if let Some(entry) = guard.remove(request_id) {
        let _ = entry.resolver.send(approved);
        true
    } else {
        false
    }
}

/// Auto-deny every outstanding permission (used by `stop()` on both providers).
pub(crate) async fn deny_all_pending(pending: &PendingPermissions) {
    let mut guard = pending.lock().await;
    for (_, entry) in guard.drain() {
        let _ = entry.resolver.send(false);
    }
}
