//! Application service relay: a tokenized bridge between two authenticated
//! identities across two independent app-service connections.
//!
//! The caller's request is answered only after the callee reacts to its
//! notification; the pending-response slot lives in the callee session and
//! the caller's handler awaits it, so no state machine spans the sockets.

use portico_proto::messages::{
    conversation_request, conversation_response, ApplicationServiceReceiveMessageNotificationRequest,
    ApplicationServiceSendMessageRequest, ApplicationServiceSendMessageResponse,
    CallIdentityApplicationServiceRequest, CallIdentityApplicationServiceResponse,
    IncomingCallNotificationRequest, Status,
};
use portico_proto::{Message, Response};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::dispatch::{HandlerResult, Outcome};
use crate::node::SharedNode;
use crate::session::{Session, SessionHandle};
use crate::util::abbrev_id;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayState {
    Created,
    CalleeNotified,
    CalleeAccepted,
    CallerAcknowledged,
    Established,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelaySide {
    Caller,
    Callee,
}

impl RelaySide {
    fn opposite(self) -> RelaySide {
        match self {
            RelaySide::Caller => RelaySide::Callee,
            RelaySide::Callee => RelaySide::Caller,
        }
    }
}

struct RelayInner {
    state: RelayState,
    caller_session: Option<Weak<Session>>,
    callee_session: Option<Weak<Session>>,
    /// Per-direction in-flight payload guards; a side may not forward its
    /// next payload until the previous one was acknowledged.
    caller_inflight: bool,
    callee_inflight: bool,
}

pub struct Relay {
    pub caller_token: [u8; 16],
    pub callee_token: [u8; 16],
    pub service_name: String,
    pub caller_public_key: Vec<u8>,
    pub created_at: Instant,
    inner: Mutex<RelayInner>,
}

impl Relay {
    pub fn new(caller_public_key: Vec<u8>, service_name: String) -> Arc<Relay> {
        Arc::new(Relay {
            caller_token: portico_crypto::random_token(),
            callee_token: portico_crypto::random_token(),
            service_name,
            caller_public_key,
            created_at: Instant::now(),
            inner: Mutex::new(RelayInner {
                state: RelayState::Created,
                caller_session: None,
                callee_session: None,
                caller_inflight: false,
                callee_inflight: false,
            }),
        })
    }

    pub fn side_of(&self, token: &[u8; 16]) -> Option<RelaySide> {
        if token == &self.caller_token {
            Some(RelaySide::Caller)
        } else if token == &self.callee_token {
            Some(RelaySide::Callee)
        } else {
            None
        }
    }

    pub async fn state(&self) -> RelayState {
        self.inner.lock().await.state
    }

    pub async fn set_state(&self, state: RelayState) {
        self.inner.lock().await.state = state;
    }

    /// Session currently bound to a side of the relay, if it is still alive.
    pub async fn bound_session(&self, side: RelaySide) -> Option<SessionHandle> {
        let inner = self.inner.lock().await;
        let slot = match side {
            RelaySide::Caller => &inner.caller_session,
            RelaySide::Callee => &inner.callee_session,
        };
        slot.as_ref().and_then(Weak::upgrade)
    }

    /// Binds an app-service connection to one side; first match wins.
    /// Returns true when the bind completed the pair.
    pub async fn attach(&self, side: RelaySide, session: &SessionHandle) -> bool {
        let mut inner = self.inner.lock().await;
        let slot = match side {
            RelaySide::Caller => &mut inner.caller_session,
            RelaySide::Callee => &mut inner.callee_session,
        };
        *slot = Some(Arc::downgrade(session));
        let paired = inner
            .caller_session
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some()
            && inner
                .callee_session
                .as_ref()
                .and_then(Weak::upgrade)
                .is_some();
        if paired {
            inner.state = RelayState::Established;
        }
        paired
    }

    /// Claims the in-flight slot for one direction; false when a payload
    /// from this side is still awaiting its acknowledgement.
    async fn try_begin_send(&self, side: RelaySide) -> bool {
        let mut inner = self.inner.lock().await;
        let slot = match side {
            RelaySide::Caller => &mut inner.caller_inflight,
            RelaySide::Callee => &mut inner.callee_inflight,
        };
        if *slot {
            false
        } else {
            *slot = true;
            true
        }
    }

    async fn end_send(&self, side: RelaySide) {
        let mut inner = self.inner.lock().await;
        match side {
            RelaySide::Caller => inner.caller_inflight = false,
            RelaySide::Callee => inner.callee_inflight = false,
        }
    }

    /// Marks the relay closed and hands back whatever sessions were bound.
    async fn close(&self) -> (Option<SessionHandle>, Option<SessionHandle>) {
        let mut inner = self.inner.lock().await;
        inner.state = RelayState::Closed;
        let caller = inner.caller_session.take().and_then(|weak| weak.upgrade());
        let callee = inner.callee_session.take().and_then(|weak| weak.upgrade());
        (caller, callee)
    }
}

/// Removes the relay from the registry and closes any bound connections.
pub async fn destroy_relay(node: &SharedNode, relay: &Arc<Relay>) {
    if relay.state().await == RelayState::Closed {
        return;
    }
    node.registry.unregister_relay(relay).await;
    let (caller, callee) = relay.close().await;
    for session in [caller, callee].into_iter().flatten() {
        session.force_close();
    }
    node.metrics.mark_relay_destroyed();
    debug!(
        caller_token = %abbrev_id(&relay.caller_token),
        service = %relay.service_name,
        "relay destroyed"
    );
}

fn spawn_pairing_timeout(node: SharedNode, relay: Arc<Relay>) {
    let pairing = Duration::from_secs(node.config.relay_pairing_seconds);
    tokio::spawn(async move {
        tokio::time::sleep(pairing).await;
        let state = relay.state().await;
        if state != RelayState::Established && state != RelayState::Closed {
            warn!(
                service = %relay.service_name,
                "relay pairing timed out"
            );
            destroy_relay(&node, &relay).await;
        }
    });
}

/// `CallIdentityApplicationService`: opens a relay toward a hosted callee.
/// The caller's connection suspends here until the callee answers the
/// notification or the timeout fires.
pub async fn handle_call(
    node: &SharedNode,
    session: &SessionHandle,
    request: CallIdentityApplicationServiceRequest,
) -> HandlerResult {
    let Ok(identity_id) = <[u8; 32]>::try_from(request.identity_id.as_slice()) else {
        return (
            Some(Response::error(Status::InvalidValue, "identityNetworkId")),
            Outcome::Continue,
        );
    };
    let callee = match node.storage.load_hosted(&identity_id).await {
        Ok(Some(callee)) => callee,
        Ok(None) => {
            return (
                Some(Response::error(Status::InvalidValue, "identityNetworkId")),
                Outcome::Continue,
            )
        }
        Err(err) => {
            warn!(error = %err, "callee lookup failed");
            return (Some(Response::error(Status::Internal, "")), Outcome::Continue);
        }
    };
    if !callee.is_initialized() {
        return (
            Some(Response::error(Status::Uninitialized, "identityNetworkId")),
            Outcome::Continue,
        );
    }
    let Some(callee_session) = node.registry.find_checked_in(&identity_id).await else {
        return (
            Some(Response::error(Status::NotAvailable, "")),
            Outcome::Continue,
        );
    };
    let has_service = {
        let state = callee_session.state.lock().await;
        state.application_services.contains(&request.service_name)
    };
    if !has_service {
        return (
            Some(Response::error(Status::InvalidValue, "serviceName")),
            Outcome::Continue,
        );
    }
    let caller_public_key = {
        let state = session.state.lock().await;
        state.public_key.clone().unwrap_or_default()
    };
    let relay = Relay::new(caller_public_key.clone(), request.service_name.clone());
    node.registry.register_relay(relay.clone()).await;
    node.metrics.mark_relay_created();
    spawn_pairing_timeout(node.clone(), relay.clone());

    let notification = conversation_request::Part::IncomingCallNotification(
        IncomingCallNotificationRequest {
            caller_public_key,
            service_name: request.service_name.clone(),
            callee_token: relay.callee_token.to_vec(),
        },
    );
    relay.set_state(RelayState::CalleeNotified).await;
    let receiver = match callee_session.request(notification).await {
        Ok(receiver) => receiver,
        Err(_) => {
            destroy_relay(node, &relay).await;
            return (
                Some(Response::error(Status::NotAvailable, "")),
                Outcome::Continue,
            );
        }
    };
    let wait = Duration::from_secs(node.config.call_notification_seconds);
    let answer = match timeout(wait, receiver).await {
        Ok(Ok(answer)) => answer,
        Ok(Err(_)) | Err(_) => {
            destroy_relay(node, &relay).await;
            return (
                Some(Response::error(Status::NotAvailable, "")),
                Outcome::Continue,
            );
        }
    };
    if answer.status != Status::Ok {
        destroy_relay(node, &relay).await;
        return (
            Some(Response::error(Status::Rejected, "")),
            Outcome::Continue,
        );
    }
    relay.set_state(RelayState::CalleeAccepted).await;
    let response = Response::conversation_ok(
        conversation_response::Part::CallIdentityApplicationService(
            CallIdentityApplicationServiceResponse {
                caller_token: relay.caller_token.to_vec(),
            },
        ),
    );
    relay.set_state(RelayState::CallerAcknowledged).await;
    (Some(response), Outcome::Continue)
}

/// `ApplicationServiceSendMessage` on the app-service port: the first frame
/// for a token pairs the connection, later frames carry payloads that are
/// forwarded to the peer in strict send/ack lockstep per direction. A
/// payload forward suspends: the sender's response is produced by the task
/// waiting on the peer's acknowledgement, so the sender's connection keeps
/// dispatching (and can acknowledge traffic flowing the other way).
pub async fn handle_app_service_send(
    node: &SharedNode,
    session: &SessionHandle,
    message_id: u32,
    request: ApplicationServiceSendMessageRequest,
) -> HandlerResult {
    let Ok(token) = <[u8; 16]>::try_from(request.token.as_slice()) else {
        return (
            Some(Response::error(Status::InvalidValue, "token")),
            Outcome::Continue,
        );
    };
    let Some(relay) = node.registry.find_relay(&token).await else {
        return (Some(Response::error(Status::NotFound, "token")), Outcome::Close);
    };
    let side = match relay.side_of(&token) {
        Some(side) => side,
        None => {
            return (Some(Response::error(Status::NotFound, "token")), Outcome::Close)
        }
    };
    let bound = relay.bound_session(side).await;
    match bound {
        None => {
            // Initialization frame. A connection already paired to the
            // opposite side must not capture this one too.
            if let Some(other) = relay.bound_session(side.opposite()).await {
                if other.session_id == session.session_id {
                    destroy_relay(node, &relay).await;
                    return (
                        Some(Response::error(Status::NotFound, "token")),
                        Outcome::Close,
                    );
                }
            }
            relay.attach(side, session).await;
            {
                let mut state = session.state.lock().await;
                state.relay_tokens.push(token);
            }
            (
                Some(Response::conversation_ok(
                    conversation_response::Part::ApplicationServiceSendMessage(
                        ApplicationServiceSendMessageResponse {},
                    ),
                )),
                Outcome::Continue,
            )
        }
        Some(existing) if existing.session_id == session.session_id => {
            forward_payload(node, session, &relay, side, message_id, request.message).await
        }
        Some(_) => {
            // A second connection presented an already-bound token.
            (Some(Response::error(Status::NotFound, "token")), Outcome::Close)
        }
    }
}

async fn forward_payload(
    node: &SharedNode,
    session: &SessionHandle,
    relay: &Arc<Relay>,
    side: RelaySide,
    message_id: u32,
    payload: Vec<u8>,
) -> HandlerResult {
    if relay.state().await != RelayState::Established {
        return (
            Some(Response::error(Status::NotAvailable, "")),
            Outcome::Continue,
        );
    }
    if !relay.try_begin_send(side).await {
        // The previous payload from this side is still unacknowledged.
        return (Some(Response::error(Status::Busy, "")), Outcome::Continue);
    }
    let Some(peer) = relay.bound_session(side.opposite()).await else {
        relay.end_send(side).await;
        destroy_relay(node, relay).await;
        return (
            Some(Response::error(Status::NotAvailable, "")),
            Outcome::Close,
        );
    };
    let notification = conversation_request::Part::ApplicationServiceReceiveMessageNotification(
        ApplicationServiceReceiveMessageNotificationRequest { message: payload },
    );
    let receiver = match peer.request(notification).await {
        Ok(receiver) => receiver,
        Err(_) => {
            relay.end_send(side).await;
            destroy_relay(node, relay).await;
            return (
                Some(Response::error(Status::NotAvailable, "")),
                Outcome::Close,
            );
        }
    };
    // Suspend: the acknowledgement task answers the sender later so this
    // connection keeps dispatching in the meantime.
    let node = node.clone();
    let session = session.clone();
    let relay = relay.clone();
    let wait = Duration::from_secs(node.config.call_notification_seconds);
    tokio::spawn(async move {
        let acked = matches!(
            timeout(wait, receiver).await,
            Ok(Ok(answer)) if answer.status == Status::Ok
        );
        relay.end_send(side).await;
        if acked {
            let response = Response::conversation_ok(
                conversation_response::Part::ApplicationServiceSendMessage(
                    ApplicationServiceSendMessageResponse {},
                ),
            );
            let _ = session.send(Message::response(message_id, response)).await;
        } else {
            let response = Response::error(Status::NotAvailable, "");
            let _ = session.send(Message::response(message_id, response)).await;
            destroy_relay(&node, &relay).await;
        }
    });
    (None, Outcome::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use tokio::sync::mpsc;

    fn make_session(port: u16) -> SessionHandle {
        let (tx, _rx) = mpsc::channel(8);
        Session::new(
            Role::ClientAppService,
            format!("127.0.0.1:{port}").parse().unwrap(),
            tx,
        )
    }

    #[tokio::test]
    async fn tokens_are_distinct_and_sided() {
        let relay = Relay::new(vec![1; 32], "chat".to_string());
        assert_ne!(relay.caller_token, relay.callee_token);
        assert_eq!(
            relay.side_of(&relay.caller_token),
            Some(RelaySide::Caller)
        );
        assert_eq!(
            relay.side_of(&relay.callee_token),
            Some(RelaySide::Callee)
        );
        assert_eq!(relay.side_of(&[0u8; 16]), None);
    }

    #[tokio::test]
    async fn pairing_requires_both_sides() {
        let relay = Relay::new(vec![1; 32], "chat".to_string());
        let caller = make_session(5000);
        let callee = make_session(5001);
        assert!(!relay.attach(RelaySide::Caller, &caller).await);
        assert_eq!(relay.state().await, RelayState::Created);
        assert!(relay.attach(RelaySide::Callee, &callee).await);
        assert_eq!(relay.state().await, RelayState::Established);
        let peer = relay.bound_session(RelaySide::Callee).await.unwrap();
        assert_eq!(peer.session_id, callee.session_id);
    }

    #[tokio::test]
    async fn dropped_session_unbinds_side() {
        let relay = Relay::new(vec![1; 32], "chat".to_string());
        {
            let caller = make_session(5002);
            relay.attach(RelaySide::Caller, &caller).await;
        }
        // The weak reference no longer upgrades.
        assert!(relay.bound_session(RelaySide::Caller).await.is_none());
    }
}
