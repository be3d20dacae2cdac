//! Ambient configuration layer — kept thin by design (no hot-reload, no
//! schema versioning). Layering follows a `DaemonConfig::new`-style
//! pattern: CLI/env overrides a TOML file which overrides built-in
//! defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

const DEFAULT_MAX_SESSIONS: usize = 50;
const DEFAULT_PERMISSION_TIMEOUT_SECS: u64 = 300;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TOOL_CALL_TIMEOUT_SECS: u64 = 14 * 24 * 60 * 60;
const DEFAULT_DEBOUNCE_MS: u64 = 1500;

/// `{data_dir}/config.toml` — all fields optional overrides.
#[derive(Deserialize, Default)]
struct TomlConfig {
    max_sessions: Option<usize>,
    log: Option<String>,
    cwd_allowlist: Option<Vec<PathBuf>>,
    push_transport_url: Option<String>,
    debounce_ms: Option<u64>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub data_dir: PathBuf,
    pub log: String,
    pub max_sessions: usize,
    /// Absolute roots a session's cwd must fall under; empty means allow-all.
    pub cwd_allowlist: Vec<PathBuf>,
    pub permission_timeout: Duration,
    pub drain_timeout: Duration,
    pub rpc_timeout: Duration,
    pub tool_call_timeout: Duration,
    pub push_debounce: Duration,
    /// Outbound chat-transport endpoint for the push adapter. `None` disables pushing.
    pub push_transport_url: Option<String>,
}

impl SupervisorConfig {
    pub fn new(
        data_dir: Option<PathBuf>,
        log: Option<String>,
        max_sessions: Option<usize>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let max_sessions = max_sessions.or(toml.max_sessions).unwrap_or(DEFAULT_MAX_SESSIONS);
        let cwd_allowlist = toml.cwd_allowlist.unwrap_or_default();
        let push_transport_url = std::env::var("AGENTSUP_PUSH_URL").ok().or(toml.push_transport_url);
        let push_debounce = Duration::from_millis(toml.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS));

        Self {
            data_dir,
            log,
            max_sessions,
            cwd_allowlist,
            permission_timeout: Duration::from_secs(DEFAULT_PERMISSION_TIMEOUT_SECS),
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
            rpc_timeout: Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS),
            tool_call_timeout: Duration::from_secs(DEFAULT_TOOL_CALL_TIMEOUT_SECS),
            push_debounce,
            push_transport_url,
        }
    }

    pub fn sessions_path(&self) -> PathBuf {
        self.data_dir.join("sessions.json")
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library").join("Application Support").join("agentsup");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("agentsup");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("agentsup");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("agentsup");
        }
    }
    PathBuf::from(".agentsup")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_toml_or_cli() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = SupervisorConfig::new(Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.max_sessions, DEFAULT_MAX_SESSIONS);
        assert_eq!(cfg.log, "info");
        assert!(cfg.cwd_allowlist.is_empty());
    }

    #[test]
    fn cli_overrides_toml_and_default() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "max_sessions = 5\n").unwrap();
        let cfg = SupervisorConfig::new(Some(dir.path().to_path_buf()), None, Some(20));
        assert_eq!(cfg.max_sessions, 20);
    }

    #[test]
    fn toml_overrides_default_when_cli_absent() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "max_sessions = 5\n").unwrap();
        let cfg = SupervisorConfig::new(Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.max_sessions, 5);
    }
}
