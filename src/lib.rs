//! A multi-tenant AI-CLI session supervisor: spawns, tracks, multiplexes,
//! and tears down long-lived child processes that expose interactive
//! AI-coding agents over two provider protocols, behind a uniform
//! capability-restricted API.
//!
//! Built in the idiom of a `daemon`-style background service:
//! `session::SessionManager` for the registry/admission/retry shape,
//! a `codex_appserver::CodexAppServer`-style client for the framed
//! JSON-RPC provider, `ipc::event::EventBroadcaster` for the message/event
//! fan-out, and `config`/`retry` for the ambient stack. See DESIGN.md for
//! the full grounding ledger.

pub mod acl;
pub mod async_queue;
pub mod config;
pub mod cwd_sandbox;
pub mod error;
pub mod manager;
pub mod model;
pub mod persistence;
pub mod providers;
pub mod push;
pub mod redact;
pub mod retry;
pub mod tool_surface;

use std::sync::Arc;

use config::SupervisorConfig;
use manager::SessionManager;
use push::PushAdapter;
use tool_surface::ToolSurface;

/// Shared application state a host binary assembles once at startup: the
/// Manager, the tool surface that wraps it, and the push adapter
/// subscribed to its message/event buses.
pub struct Supervisor {
    pub config: Arc<SupervisorConfig>,
    pub manager: Arc<SessionManager>,
    pub tool_surface: Arc<ToolSurface>,
    pub push_adapter: Arc<PushAdapter>,
}

impl Supervisor {
    /// Assembles the Manager (wired for self-referential listener
    /// spawning), the tool surface over it, and a push adapter subscribed
    /// to its buses. Callers still need to `register_provider` and
    /// `reconcile_on_startup` before accepting traffic — mirrors an
    /// `AppContext`-style construction built in several discrete steps
    /// rather than one constructor.
    pub fn new(config: SupervisorConfig, transport: Arc<dyn push::PushTransport>) -> Self {
        let config = Arc::new(config);
        let manager = Arc::new(SessionManager::new((*config).clone()));
        manager.wire_self();

        let push_adapter = Arc::new(PushAdapter::new(transport, Arc::new(push::PlainTextFormatter), config.push_debounce));
        spawn_push_glue(manager.clone(), push_adapter.clone());

        let tool_surface = Arc::new(ToolSurface::new(manager.clone()));

        Self { config, manager, tool_surface, push_adapter }
    }
}

/// Wires the Manager's message/event buses into the push adapter — the
/// "Event/Message bus glue" component (§4.9 forwards to Manager state and
/// push subscribers; this is the push-subscriber half).
fn spawn_push_glue(manager: Arc<SessionManager>, push_adapter: Arc<PushAdapter>) {
    let mut messages = manager.subscribe_messages();
    let push_for_messages = push_adapter.clone();
    tokio::spawn(async move {
        loop {
            match messages.recv().await {
                Ok((sid, message)) => push_for_messages.handle_message(&sid, message).await,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    });

    let mut events = manager.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let sid = event.session_id.clone();
                    push_adapter.handle_events(&sid, std::slice::from_ref(&event)).await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    });
}
