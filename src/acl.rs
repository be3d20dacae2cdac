//! §4.1 — owner binding and access checks per session id.

use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{Result, SupervisorError};
use crate::model::SessionId;

/// In-memory `sessionId -> ownerId` map. The Manager serializes spawn/stop
/// around writes; reads may run concurrently with each other.
#[derive(Default)]
pub struct Acl {
    owners: RwLock<HashMap<SessionId, String>>,
}

impl Acl {
    pub fn new() -> Self {
        Self { owners: RwLock::new(HashMap::new()) }
    }

    /// Binds `owner` to `sid`. Fails if the session id is already bound —
    /// an owner, once set, is immutable for the session's lifetime (invariant 2).
    pub async fn set_owner(&self, sid: &str, owner: &str) -> Result<()> {
        let mut owners = self.owners.write().await;
        if owners.contains_key(sid) {
            return Err(SupervisorError::InvalidState {
                id: sid.to_string(),
                expected: "unbound".to_string(),
                found: "bound".to_string(),
            });
        }
        owners.insert(sid.to_string(), owner.to_string());
        Ok(())
    }

    /// False for unknown sessions, not an error — callers decide how to react.
    pub async fn can_access(&self, owner: &str, sid: &str) -> bool {
        self.owners.read().await.get(sid).map(|o| o == owner).unwrap_or(false)
    }

    pub async fn assert_owner(&self, owner: &str, sid: &str) -> Result<()> {
        let owners = self.owners.read().await;
        match owners.get(sid) {
            None => Err(SupervisorError::NotFound { id: sid.to_string() }),
            Some(bound) if bound == owner => Ok(()),
            Some(_) => Err(SupervisorError::AccessDenied {
                id: sid.to_string(),
                caller: owner.to_string(),
            }),
        }
    }

    /// Idempotent — removing an unknown session id is not an error.
    pub async fn remove_session(&self, sid: &str) {
        self.owners.write().await.remove(sid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ownership_binding_is_immutable() {
        let acl = Acl::new();
        acl.set_owner("s1", "alice").await.unwrap();
        assert!(acl.assert_owner("alice", "s1").await.is_ok());
        assert!(matches!(
            acl.assert_owner("bob", "s1").await,
            Err(SupervisorError::AccessDenied { .. })
        ));
        assert!(acl.set_owner("s1", "bob").await.is_err());
        assert!(acl.assert_owner("alice", "s1").await.is_ok());
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let acl = Acl::new();
        assert!(matches!(
            acl.assert_owner("alice", "ghost").await,
            Err(SupervisorError::NotFound { .. })
        ));
        assert!(!acl.can_access("alice", "ghost").await);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let acl = Acl::new();
        acl.set_owner("s1", "alice").await.unwrap();
        acl.remove_session("s1").await;
        acl.remove_session("s1").await;
        assert!(!acl.can_access("alice", "s1").await);
    }
}
