//! §4.4 — durable JSON array of `PersistedSession`, written atomically.
//!
//! Same tmp-then-rename idiom used for `tasks/queue.json`:
//! serialize the whole array, write to a `.tmp` sibling, then rename over
//! the target so readers never observe a half-written file.

use std::path::PathBuf;
use tokio::fs;

use crate::error::Result;
use crate::model::PersistedSession;

pub struct Persistence {
    path: PathBuf,
}

impl Persistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `[]` if the file doesn't exist yet; other I/O errors propagate.
    pub async fn load(&self) -> Result<Vec<PersistedSession>> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_all(&self, sessions: &[PersistedSession]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(sessions)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    /// Upsert by id.
    pub async fn add(&self, session: PersistedSession) -> Result<()> {
        let mut sessions = self.load().await?;
        if let Some(existing) = sessions.iter_mut().find(|s| s.id == session.id) {
            *existing = session;
        } else {
            sessions.push(session);
        }
        self.save_all(&sessions).await
    }

    /// Merges `session` in place by id; a no-op if the id is unknown.
    pub async fn update(&self, session: PersistedSession) -> Result<()> {
        let mut sessions = self.load().await?;
        if let Some(existing) = sessions.iter_mut().find(|s| s.id == session.id) {
            *existing = session;
            self.save_all(&sessions).await?;
        }
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.remove_many(std::slice::from_ref(&id.to_string())).await
    }

    pub async fn remove_many(&self, ids: &[String]) -> Result<()> {
        let sessions = self.load().await?;
        let filtered: Vec<_> = sessions.into_iter().filter(|s| !ids.contains(&s.id)).collect();
        self.save_all(&filtered).await
    }
}

/// `true` if a process with `pid` appears to be alive, probed the same way
/// `reconcileOnStartup` does it (signal 0 / platform equivalent — no actual
/// signal is delivered, it only checks permission-to-signal / existence).
pub fn pid_is_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // SAFETY: kill(pid, 0) sends no signal; it only probes whether the
        // process exists and is signalable by us.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}
