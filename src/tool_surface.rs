//! §6 — the caller-facing tool surface: nine logical operations, each
//! taking a caller context `{userId, channelId}`, with the owner-match
//! rule enforced uniformly before delegating to the `SessionManager`.
//!
//! Modeled on `ipc/handlers/session.rs` and `ipc/handlers/tool.rs`: thin
//! per-method handler functions that deserialize params, validate, call
//! into `SessionManager`, and shape a JSON-ish response — generalized here
//! into methods on one `ToolSurface` struct rather than free functions per
//! RPC method, since this crate does not stand up a WebSocket/JSON-RPC
//! wire server for it (out of scope, §1: "transport for push API", "the
//! wrapping plugin shell").

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Result, SupervisorError};
use crate::manager::{ListFilter, ResumeRequest, SessionManager, SpawnRequest};
use crate::model::{PermissionMode, Session, SessionId, SessionMode, SwitchState};

/// `{userId, channelId}` — the caller context every tool-surface operation
/// takes (§6). Auth beyond this opaque id is explicitly out of scope.
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub user_id: String,
    pub channel_id: String,
}

/// Slash-command interception (§6): a caller's `send` input is first
/// offered to this router; if it returns `handled = true`, the session is
/// never invoked and the router's own response is returned instead. The
/// actual command-dispatch plumbing is out of scope (§1) — this is a thin
/// seam over it.
#[async_trait::async_trait]
pub trait SlashCommandRouter: Send + Sync {
    async fn try_handle(&self, caller: &CallerContext, sid: &SessionId, input: &str) -> Option<String>;
}

/// No-op default: every input falls through to the session.
pub struct NoopSlashCommandRouter;

#[async_trait::async_trait]
impl SlashCommandRouter for NoopSlashCommandRouter {
    async fn try_handle(&self, _caller: &CallerContext, _sid: &SessionId, _input: &str) -> Option<String> {
        None
    }
}

/// The audit-log appender is out of scope (§1) as a full system, but every
/// mutating tool-surface call still announces itself through this seam so
/// a host binary can wire in real audit logging without touching this crate.
pub trait AuditSink: Send + Sync {
    fn record(&self, caller: &CallerContext, operation: &str, sid: Option<&SessionId>);
}

/// No-op default.
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _caller: &CallerContext, _operation: &str, _sid: Option<&SessionId>) {}
}

pub struct ListResult {
    pub cwd: Option<PathBuf>,
    pub provider: Option<String>,
}

pub struct ReadOutcome {
    pub message_count: usize,
    pub next_cursor: usize,
    pub output: Vec<crate::model::SessionMessage>,
    pub timed_out: Option<bool>,
}

pub struct SessionSummary {
    pub id: SessionId,
    pub provider: String,
    pub mode: SessionMode,
    pub switch_state: SwitchState,
    pub message_count: usize,
    pub last_activity: chrono::DateTime<chrono::Utc>,
}

pub struct ToolSurface {
    manager: Arc<SessionManager>,
    slash_router: Arc<dyn SlashCommandRouter>,
    audit: Arc<dyn AuditSink>,
}

impl ToolSurface {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager, slash_router: Arc::new(NoopSlashCommandRouter), audit: Arc::new(NoopAuditSink) }
    }

    pub fn with_slash_router(mut self, router: Arc<dyn SlashCommandRouter>) -> Self {
        self.slash_router = router;
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    async fn assert_owner(&self, caller: &CallerContext, sid: &SessionId) -> Result<()> {
        self.manager.acl().assert_owner(&caller.user_id, sid).await
    }

    /// `list` requires no owner match (§6 table).
    pub async fn list(&self, filter: ListResult) -> Vec<Session> {
        self.manager.list(ListFilter { cwd: filter.cwd, provider: filter.provider }).await
    }

    /// `spawn` requires no owner match; the caller becomes the owner.
    pub async fn spawn(
        &self,
        caller: &CallerContext,
        provider: String,
        cwd: PathBuf,
        task: String,
        mode: Option<SessionMode>,
        permission_mode: Option<PermissionMode>,
        model: Option<String>,
    ) -> Result<Session> {
        let session = self
            .manager
            .spawn(SpawnRequest {
                provider,
                cwd,
                mode: mode.unwrap_or(SessionMode::Remote),
                permission_mode: permission_mode.unwrap_or(PermissionMode::Default),
                model,
                task,
                owner_id: caller.user_id.clone(),
            })
            .await?;
        self.audit.record(caller, "spawn", Some(&session.id));
        Ok(session)
    }

    pub async fn resume(
        &self,
        caller: &CallerContext,
        sid: &SessionId,
        task: String,
        mode: Option<SessionMode>,
        permission_mode: Option<PermissionMode>,
        model: Option<String>,
    ) -> Result<Session> {
        self.assert_owner(caller, sid).await?;
        let session = self
            .manager
            .resume(
                sid,
                ResumeRequest {
                    mode,
                    task,
                    permission_mode: permission_mode.unwrap_or(PermissionMode::Default),
                    model,
                },
            )
            .await?;
        self.audit.record(caller, "resume", Some(sid));
        Ok(session)
    }

    /// `send` offers the input to the slash-command router first (§6); a
    /// `handled = true` short-circuits the session entirely.
    pub async fn send(&self, caller: &CallerContext, sid: &SessionId, input: &str) -> Result<(bool, Option<String>)> {
        self.assert_owner(caller, sid).await?;
        if let Some(response) = self.slash_router.try_handle(caller, sid, input).await {
            return Ok((true, Some(response)));
        }
        self.manager.send(sid, input).await?;
        self.audit.record(caller, "send", Some(sid));
        Ok((false, None))
    }

    pub async fn read(
        &self,
        caller: &CallerContext,
        sid: &SessionId,
        cursor: Option<usize>,
        limit: Option<usize>,
        wait: bool,
        timeout_ms: Option<u64>,
    ) -> Result<ReadOutcome> {
        self.assert_owner(caller, sid).await?;
        let cursor = cursor.unwrap_or(0);
        let limit = limit.unwrap_or(50);

        let result = if wait {
            self.manager.wait_for_messages(sid, cursor, limit, timeout_ms).await?
        } else {
            self.manager.read_messages(sid, cursor, limit).await?
        };

        Ok(ReadOutcome {
            message_count: result.messages.len(),
            next_cursor: result.next_cursor,
            output: result.messages,
            timed_out: if wait { Some(result.timed_out) } else { None },
        })
    }

    pub async fn respond(&self, caller: &CallerContext, sid: &SessionId, request_id: &str, approved: bool) -> Result<String> {
        self.assert_owner(caller, sid).await?;
        self.manager.respond_to_permission(sid, request_id, approved).await?;
        self.audit.record(caller, "respond", Some(sid));
        Ok(format!("permission {request_id} {}", if approved { "approved" } else { "denied" }))
    }

    pub async fn switch(&self, caller: &CallerContext, sid: &SessionId, mode: SessionMode) -> Result<String> {
        self.assert_owner(caller, sid).await?;
        self.manager.switch_mode(sid, mode).await?;
        self.audit.record(caller, "switch", Some(sid));
        Ok(format!("switched to {mode:?}"))
    }

    pub async fn stop(&self, caller: &CallerContext, sid: &SessionId, _force: bool) -> Result<String> {
        self.assert_owner(caller, sid).await?;
        self.manager.stop(sid).await?;
        self.audit.record(caller, "stop", Some(sid));
        Ok("session stopped".to_string())
    }

    pub async fn summary(&self, caller: &CallerContext, sid: &SessionId) -> Result<SessionSummary> {
        self.assert_owner(caller, sid).await?;
        let session = self.manager.get(sid).await?;
        Ok(SessionSummary {
            id: session.id,
            provider: session.provider,
            mode: session.mode,
            switch_state: session.switch_state,
            message_count: session.message_buffer.len(),
            last_activity: session.last_activity,
        })
    }
}
