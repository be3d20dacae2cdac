//! Shared data model for sessions, messages, and events.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Opaque session identity. For the framed provider this is the *pending*
/// id minted at construction time, kept stable for the lifetime of the
/// session even after the backend id arrives (see `providers::framed`).
pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Local,
    Remote,
}

/// The mode-switch state machine (§3, §4.8.1). Transitions are exactly
/// `Running -> Draining -> Switching -> Running` (success) or
/// `Running -> Draining -> Switching -> Error` (failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchState {
    Running,
    Draining,
    Switching,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Code,
    ToolUse,
    ToolResult,
    Thinking,
    Error,
    Result,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Correlation id into the upstream protocol (e.g. `tool_use_id`, `call_id`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl SessionMessage {
    pub fn new(kind: MessageType, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp: chrono::Utc::now(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PermissionRequest,
    Error,
    WaitingForInput,
    TaskComplete,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Urgent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionDetail {
    pub request_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub severity: Severity,
    pub summary: String,
    pub session_id: SessionId,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_detail: Option<PermissionDetail>,
}

impl SessionEvent {
    pub fn new(session_id: impl Into<String>, kind: EventType, severity: Severity, summary: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            summary: summary.into(),
            session_id: session_id.into(),
            timestamp: chrono::Utc::now(),
            permission_detail: None,
        }
    }

    pub fn with_permission_detail(mut self, detail: PermissionDetail) -> Self {
        self.permission_detail = Some(detail);
        self
    }
}

/// Live session state held by the Manager (§3).
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub provider: String,
    pub cwd: PathBuf,
    pub pid: u32,
    pub mode: SessionMode,
    pub owner_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub switch_state: SwitchState,
    pub message_buffer: Vec<SessionMessage>,
    pub last_activity: chrono::DateTime<chrono::Utc>,
}

impl Session {
    pub fn to_persisted(&self) -> PersistedSession {
        PersistedSession {
            id: self.id.clone(),
            provider: self.provider.clone(),
            cwd: self.cwd.clone(),
            pid: self.pid,
            owner_id: self.owner_id.clone(),
            mode: self.mode,
            created_at: self.created_at,
        }
    }
}

/// The only durable state (§3, §4.4, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    pub id: SessionId,
    pub provider: String,
    pub cwd: PathBuf,
    pub pid: u32,
    pub owner_id: String,
    pub mode: SessionMode,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Symbolic permission modes a caller may request (§6, mapped in §4.6.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    BypassPermissions,
    AcceptEdits,
    Plan,
}

/// `(approvalPolicy, sandbox)` pair the framed provider sends to its subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionPolicy {
    pub approval_policy: &'static str,
    pub sandbox: &'static str,
}

impl PermissionMode {
    pub fn execution_policy(self) -> ExecutionPolicy {
        match self {
            PermissionMode::Default => ExecutionPolicy { approval_policy: "untrusted", sandbox: "workspace-write" },
            PermissionMode::BypassPermissions => ExecutionPolicy { approval_policy: "never", sandbox: "full-access" },
            PermissionMode::AcceptEdits => ExecutionPolicy { approval_policy: "on-request", sandbox: "workspace-write" },
            PermissionMode::Plan => ExecutionPolicy { approval_policy: "untrusted", sandbox: "read-only" },
        }
    }
}
