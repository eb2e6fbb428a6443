use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::relay::Relay;
use crate::session::SessionHandle;

/// Process-wide index of connections: every live session by id, checked-in
/// identities by identity id, and relays by either of their tokens. Readers
/// clone `Arc` handles out under the read guard.
pub struct ClientRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    checked_in: RwLock<HashMap<[u8; 32], SessionHandle>>,
    relays: RwLock<HashMap<[u8; 16], Arc<Relay>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            checked_in: RwLock::new(HashMap::new()),
            relays: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert_session(&self, session: SessionHandle) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.session_id.clone(), session);
    }

    pub async fn remove_session(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id);
    }

    pub async fn sessions_snapshot(&self) -> Vec<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions.values().cloned().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Binds an identity to its checked-in session; a previous session for
    /// the same identity is displaced and returned for teardown.
    pub async fn check_in(
        &self,
        identity_id: [u8; 32],
        session: SessionHandle,
    ) -> Option<SessionHandle> {
        let mut checked_in = self.checked_in.write().await;
        let displaced = checked_in.insert(identity_id, session);
        displaced.filter(|old| {
            checked_in
                .get(&identity_id)
                .map(|new| new.session_id != old.session_id)
                .unwrap_or(true)
        })
    }

    /// Unbinds an identity, but only if it is still bound to this session.
    pub async fn uncheck(&self, identity_id: &[u8; 32], session_id: &str) {
        let mut checked_in = self.checked_in.write().await;
        if let Some(current) = checked_in.get(identity_id) {
            if current.session_id == session_id {
                checked_in.remove(identity_id);
            }
        }
    }

    pub async fn find_checked_in(&self, identity_id: &[u8; 32]) -> Option<SessionHandle> {
        let checked_in = self.checked_in.read().await;
        checked_in.get(identity_id).cloned()
    }

    /// Registers a relay under both of its tokens.
    pub async fn register_relay(&self, relay: Arc<Relay>) {
        let mut relays = self.relays.write().await;
        relays.insert(relay.caller_token, relay.clone());
        relays.insert(relay.callee_token, relay);
    }

    pub async fn find_relay(&self, token: &[u8; 16]) -> Option<Arc<Relay>> {
        let relays = self.relays.read().await;
        relays.get(token).cloned()
    }

    pub async fn unregister_relay(&self, relay: &Relay) {
        let mut relays = self.relays.write().await;
        relays.remove(&relay.caller_token);
        relays.remove(&relay.callee_token);
    }

    pub async fn relay_count(&self) -> usize {
        self.relays.read().await.len() / 2
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
