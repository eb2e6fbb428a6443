use portico_crypto::CHALLENGE_LEN;
use portico_proto::messages::{
    conversation_request, conversation_response, IdentityNetworkProfileInformation, ServerRoleType,
    Status,
};
use portico_proto::Message;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;

use crate::node::ServerError;
use crate::util::abbrev_id;

/// Role of the listening endpoint a connection arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Primary,
    ServerNeighbor,
    ClientNonCustomer,
    ClientCustomer,
    ClientAppService,
}

impl Role {
    pub fn to_proto(self) -> ServerRoleType {
        match self {
            Role::Primary => ServerRoleType::Primary,
            Role::ServerNeighbor => ServerRoleType::ServerNeighbor,
            Role::ClientNonCustomer => ServerRoleType::ClientNonCustomer,
            Role::ClientCustomer => ServerRoleType::ClientCustomer,
            Role::ClientAppService => ServerRoleType::ClientAppService,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversationStatus {
    None,
    Started,
    Verified,
    Authenticated,
}

/// Conversation status a request demands before its handler runs.
/// `Verified` is satisfied by `Authenticated`; `Any` means any state after
/// `StartConversation`; `Ignored` skips the gate entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequiredStatus {
    NoConversation,
    Started,
    Verified,
    Authenticated,
    Any,
    Ignored,
}

impl RequiredStatus {
    pub fn allows(self, status: ConversationStatus) -> bool {
        match self {
            Self::NoConversation => status == ConversationStatus::None,
            Self::Started => status == ConversationStatus::Started,
            Self::Verified => matches!(
                status,
                ConversationStatus::Verified | ConversationStatus::Authenticated
            ),
            Self::Authenticated => status == ConversationStatus::Authenticated,
            Self::Any => status != ConversationStatus::None,
            Self::Ignored => true,
        }
    }
}

/// Response to a server-initiated request, delivered through the pending
/// request slot registered when the request was sent.
#[derive(Debug)]
pub struct PendingResponse {
    pub status: Status,
    pub details: String,
    pub part: Option<conversation_response::Part>,
}

pub struct PendingSlot {
    /// Wire tag of the request part this slot awaits; the response part
    /// must mirror it unless the response carries an error status.
    pub tag: u32,
    pub respond: oneshot::Sender<PendingResponse>,
}

pub struct SessionState {
    pub status: ConversationStatus,
    pub version: [u8; 3],
    pub public_key: Option<Vec<u8>>,
    pub identity_id: Option<[u8; 32]>,
    pub challenge: Option<[u8; CHALLENGE_LEN]>,
    pub application_services: BTreeSet<String>,
    pub search_cache: Option<Vec<IdentityNetworkProfileInformation>>,
    pub pending: HashMap<u32, PendingSlot>,
    pub last_activity: Instant,
    pub checked_in: bool,
    pub neighborhood_init: bool,
    /// Relay tokens bound to this connection on the app service port.
    pub relay_tokens: Vec<[u8; 16]>,
}

pub struct Session {
    pub session_id: String,
    pub remote: SocketAddr,
    pub role: Role,
    outbound: mpsc::Sender<Message>,
    closed: watch::Sender<bool>,
    next_message_id: AtomicU32,
    pub state: Mutex<SessionState>,
}

pub type SessionHandle = Arc<Session>;

impl Session {
    pub fn new(role: Role, remote: SocketAddr, outbound: mpsc::Sender<Message>) -> SessionHandle {
        let (closed, _) = watch::channel(false);
        Arc::new(Session {
            session_id: abbrev_id(&portico_crypto::random_token()),
            remote,
            role,
            outbound,
            closed,
            next_message_id: AtomicU32::new(1),
            state: Mutex::new(SessionState {
                status: ConversationStatus::None,
                version: portico_proto::PROTOCOL_VERSION,
                public_key: None,
                identity_id: None,
                challenge: None,
                application_services: BTreeSet::new(),
                search_cache: None,
                pending: HashMap::new(),
                last_activity: Instant::now(),
                checked_in: false,
                neighborhood_init: false,
                relay_tokens: Vec::new(),
            }),
        })
    }

    /// Enqueues an outbound message; ordering follows the enqueue order.
    pub async fn send(&self, message: Message) -> Result<(), ServerError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| ServerError::Closed)
    }

    /// Sends a server-initiated conversation request and registers a pending
    /// slot for the matching response.
    pub async fn request(
        &self,
        part: conversation_request::Part,
    ) -> Result<oneshot::Receiver<PendingResponse>, ServerError> {
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let tag = part.tag();
        let (respond, receiver) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            state.pending.insert(id, PendingSlot { tag, respond });
        }
        let message = Message::conversation_request(id, part);
        if self.send(message).await.is_err() {
            let mut state = self.state.lock().await;
            state.pending.remove(&id);
            return Err(ServerError::Closed);
        }
        Ok(receiver)
    }

    /// Marks the session for teardown; both connection tasks observe the
    /// watch flag and exit.
    pub fn force_close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub async fn touch(&self) {
        let mut state = self.state.lock().await;
        state.last_activity = Instant::now();
    }

    pub async fn idle_longer_than(&self, keepalive: std::time::Duration) -> bool {
        let state = self.state.lock().await;
        state.last_activity.elapsed() > keepalive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_status_gating() {
        use ConversationStatus as S;
        assert!(RequiredStatus::NoConversation.allows(S::None));
        assert!(!RequiredStatus::NoConversation.allows(S::Started));
        assert!(RequiredStatus::Started.allows(S::Started));
        assert!(!RequiredStatus::Started.allows(S::Verified));
        assert!(RequiredStatus::Verified.allows(S::Verified));
        // Authenticated implies verified.
        assert!(RequiredStatus::Verified.allows(S::Authenticated));
        assert!(!RequiredStatus::Verified.allows(S::Started));
        assert!(RequiredStatus::Authenticated.allows(S::Authenticated));
        assert!(!RequiredStatus::Authenticated.allows(S::Verified));
        assert!(RequiredStatus::Any.allows(S::Started));
        assert!(!RequiredStatus::Any.allows(S::None));
        assert!(RequiredStatus::Ignored.allows(S::None));
    }

    #[tokio::test]
    async fn force_close_is_observable() {
        let (tx, _rx) = mpsc::channel(4);
        let session = Session::new(Role::Primary, "127.0.0.1:4000".parse().unwrap(), tx);
        let mut signal = session.closed_signal();
        assert!(!session.is_closed());
        session.force_close();
        assert!(session.is_closed());
        signal.changed().await.unwrap();
        assert!(*signal.borrow());
    }

    #[tokio::test]
    async fn request_registers_pending_slot() {
        let (tx, mut rx) = mpsc::channel(4);
        let session = Session::new(
            Role::ClientCustomer,
            "127.0.0.1:4001".parse().unwrap(),
            tx,
        );
        let receiver = session
            .request(conversation_request::Part::IncomingCallNotification(
                portico_proto::messages::IncomingCallNotificationRequest {
                    caller_public_key: vec![1; 32],
                    service_name: "chat".to_string(),
                    callee_token: vec![2; 16],
                },
            ))
            .await
            .unwrap();
        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.id, 1);
        let state = session.state.lock().await;
        assert!(state.pending.contains_key(&1));
        drop(state);
        drop(receiver);
    }
}
