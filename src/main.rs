//! `agentsupd` — the host binary that assembles a `Supervisor`, registers
//! both provider families, reconciles against any persisted sessions from
//! a prior run, and idles. The uniform caller API (§6) is exposed as a
//! plain Rust struct (`ToolSurface`) rather than a wire server — standing
//! up a transport for it is explicitly out of scope (§1).
//!
//! `clap`-derived CLI args layered over env vars and a compact
//! `tracing_subscriber` setup, in the idiom of a `run_server`-style async
//! entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use agentsup::config::SupervisorConfig;
use agentsup::providers::framed::{resolve_binary, FramedProvider};
use agentsup::providers::structured::{StructuredProvider, UpstreamQueryFactory};
use agentsup::push::{HttpPushTransport, NoopPushTransport, PushTransport};
use agentsup::Supervisor;

#[derive(Parser)]
#[command(name = "agentsupd", about = "AI-CLI session supervisor daemon", version)]
struct Args {
    /// Data directory for session persistence and config.toml.
    #[arg(long, env = "AGENTSUP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "AGENTSUP_LOG")]
    log: Option<String>,

    /// Maximum concurrent sessions (0 = unlimited).
    #[arg(long, env = "AGENTSUP_MAX_SESSIONS")]
    max_sessions: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_level).compact().init();

    let config = SupervisorConfig::new(args.data_dir.clone(), args.log.clone(), args.max_sessions);
    let transport: Arc<dyn PushTransport> = match &config.push_transport_url {
        Some(url) => Arc::new(HttpPushTransport::new(url.clone())),
        None => Arc::new(NoopPushTransport),
    };

    let supervisor = Supervisor::new(config, transport);

    supervisor
        .manager
        .register_provider(Arc::new(StructuredProvider::new(no_upstream_factory())))
        .await;

    let codex_binary = resolve_binary("codex", &known_install_roots());
    supervisor
        .manager
        .register_provider(Arc::new(FramedProvider::new(codex_binary, "app-server", vec![])))
        .await;

    let (alive, dead) = supervisor.manager.reconcile_on_startup().await?;
    info!(alive, dead, "startup reconciliation complete");

    info!("agentsupd ready");
    tokio::signal::ctrl_c().await?;
    supervisor.push_adapter.dispose().await;
    Ok(())
}

fn known_install_roots() -> Vec<PathBuf> {
    let mut roots = vec![PathBuf::from("/usr/local/bin"), PathBuf::from("/opt/homebrew/bin")];
    if let Ok(home) = std::env::var("HOME") {
        roots.push(PathBuf::from(home).join(".local/bin"));
    }
    roots
}

/// The structured provider's upstream library integration is a real SDK
/// dependency a deployment wires in; this host binary ships a factory that
/// immediately ends the stream, so an unconfigured `agentsupd` fails fast
/// and loud on `spawn("structured", ...)` rather than hanging.
fn no_upstream_factory() -> Arc<dyn UpstreamQueryFactory> {
    struct Unconfigured;

    #[async_trait::async_trait]
    impl UpstreamQueryFactory for Unconfigured {
        async fn start(
            &self,
            _options: &agentsup::providers::SpawnOptions,
            _queue: agentsup::async_queue::AsyncQueueReceiver<String>,
        ) -> agentsup::error::Result<Box<dyn agentsup::providers::structured::UpstreamQuery>> {
            Err(agentsup::error::SupervisorError::TransportError(
                "structured provider has no upstream library configured".to_string(),
            ))
        }
    }

    Arc::new(Unconfigured)
}
