//! Frame loop and request dispatcher.
//!
//! Each connection is one task: read a frame, dispatch it, reply, repeat.
//! Requests are gated by a declarative precondition table keyed on the
//! request kind: the roles the listening endpoint must carry and the
//! conversation status the session must have reached. Responses to
//! server-initiated requests are matched back through the session's
//! pending-slot map; any mismatch closes the connection.

use portico_proto::frame::{read_message, write_message, CodecError};
use portico_proto::messages::{
    conversation_request, conversation_response, message, request, response, single_request,
    single_response, ListRolesResponse, Message, PingResponse, Request, Response, ServerRole,
    SingleRequest, StartConversationRequest, StartConversationResponse, Status,
};
use portico_proto::{is_supported_version, negotiate_version, VIOLATION_MESSAGE_ID};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::handlers::{identity, neighborhood, relations, search};
use crate::node::SharedNode;
use crate::relay;
use crate::session::{ConversationStatus, RequiredStatus, Role, Session, SessionHandle};
use crate::util::abbrev_id;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Close,
}

pub type HandlerResult = (Option<Response>, Outcome);

const OUTBOUND_QUEUE: usize = 64;
const ALL_CONVERSATION_ROLES: &[Role] = &[
    Role::ServerNeighbor,
    Role::ClientNonCustomer,
    Role::ClientCustomer,
];
const ANY_CLIENT: &[Role] = &[Role::ClientNonCustomer, Role::ClientCustomer];
/// Requests the server only ever initiates; receiving one is a violation.
const NO_ROLES: &[Role] = &[];

/// Role set and conversation status a request must satisfy before its
/// handler runs.
fn preconditions(part: &conversation_request::Part) -> (&'static [Role], RequiredStatus) {
    use conversation_request::Part;
    match part {
        Part::Start(_) => (ALL_CONVERSATION_ROLES, RequiredStatus::NoConversation),
        Part::RegisterHosting(_) => (&[Role::ClientNonCustomer], RequiredStatus::Started),
        Part::CheckIn(_) => (&[Role::ClientCustomer], RequiredStatus::Started),
        Part::VerifyIdentity(_) => (
            &[Role::ClientNonCustomer, Role::ServerNeighbor],
            RequiredStatus::Started,
        ),
        Part::UpdateProfile(_) => (&[Role::ClientCustomer], RequiredStatus::Authenticated),
        Part::CancelHostingAgreement(_) => {
            (&[Role::ClientCustomer], RequiredStatus::Authenticated)
        }
        Part::GetIdentityInformation(_) => (ANY_CLIENT, RequiredStatus::Any),
        Part::ApplicationServiceAdd(_) | Part::ApplicationServiceRemove(_) => {
            (&[Role::ClientCustomer], RequiredStatus::Authenticated)
        }
        Part::CallIdentityApplicationService(_) => (ANY_CLIENT, RequiredStatus::Verified),
        Part::IncomingCallNotification(_) => (NO_ROLES, RequiredStatus::Ignored),
        Part::ApplicationServiceSendMessage(_) => {
            (&[Role::ClientAppService], RequiredStatus::Ignored)
        }
        Part::ApplicationServiceReceiveMessageNotification(_) => {
            (NO_ROLES, RequiredStatus::Ignored)
        }
        Part::ProfileSearch(_) | Part::ProfileSearchPart(_) => (ANY_CLIENT, RequiredStatus::Any),
        Part::AddRelatedIdentity(_) | Part::RemoveRelatedIdentity(_) => {
            (&[Role::ClientCustomer], RequiredStatus::Authenticated)
        }
        Part::GetIdentityRelationshipsInformation(_) => (ANY_CLIENT, RequiredStatus::Any),
        Part::StartNeighborhoodInitialization(_) => {
            (&[Role::ServerNeighbor], RequiredStatus::Verified)
        }
        Part::FinishNeighborhoodInitialization(_) => (NO_ROLES, RequiredStatus::Ignored),
        Part::NeighborhoodSharedProfileUpdate(_) => {
            (&[Role::ServerNeighbor], RequiredStatus::Verified)
        }
        Part::StopNeighborhoodUpdates(_) => (&[Role::ServerNeighbor], RequiredStatus::Verified),
    }
}

/// Runs one connection to completion: framing, dispatch, teardown.
pub async fn serve_connection<S>(node: SharedNode, stream: S, role: Role, remote: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (outbound, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let session = Session::new(role, remote, outbound);
    node.metrics.incr_connections();
    node.registry.insert_session(session.clone()).await;
    debug!(session = %session.session_id, %remote, role = ?role, "connection accepted");

    let writer_session = session.clone();
    let writer_node = node.clone();
    let writer_task = tokio::spawn(async move {
        let mut closed = writer_session.closed_signal();
        loop {
            tokio::select! {
                maybe = outbound_rx.recv() => match maybe {
                    Some(message) => {
                        if write_message(&mut writer, &message).await.is_err() {
                            break;
                        }
                        writer_node.metrics.mark_egress();
                    }
                    None => break,
                },
                _ = closed.changed() => break,
            }
        }
        use tokio::io::AsyncWriteExt;
        let _ = writer.shutdown().await;
    });

    read_loop(&node, &session, &mut reader).await;
    cleanup(&node, &session).await;
    session.force_close();
    let _ = writer_task.await;
    node.metrics.decr_connections();
    debug!(session = %session.session_id, "connection closed");
}

async fn read_loop<R>(node: &SharedNode, session: &SessionHandle, reader: &mut R)
where
    R: AsyncRead + Unpin,
{
    let mut closed = session.closed_signal();
    loop {
        if session.is_closed() {
            break;
        }
        let message = tokio::select! {
            _ = closed.changed() => break,
            result = read_message(reader) => match result {
                Ok(message) => message,
                Err(CodecError::Io(_)) | Err(CodecError::UnexpectedEof) => break,
                Err(err) => {
                    debug!(session = %session.session_id, error = %err, "malformed frame");
                    let response = Response::error(Status::ProtocolViolation, "");
                    let _ = session
                        .send(Message::response(VIOLATION_MESSAGE_ID, response))
                        .await;
                    break;
                }
            }
        };
        node.metrics.mark_ingress();
        session.touch().await;
        match message.body {
            None => {
                let response = Response::error(Status::ProtocolViolation, "");
                let _ = session.send(Message::response(message.id, response)).await;
                break;
            }
            Some(message::Body::Request(request)) => {
                let (response, outcome) =
                    handle_request(node, session, message.id, request).await;
                if let Some(response) = response {
                    if session
                        .send(Message::response(message.id, response))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                if outcome == Outcome::Close {
                    break;
                }
            }
            Some(message::Body::Response(response)) => {
                if handle_response(session, message.id, response).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn cleanup(node: &SharedNode, session: &SessionHandle) {
    let (identity_id, checked_in, relay_tokens, neighborhood_init) = {
        let state = session.state.lock().await;
        (
            state.identity_id,
            state.checked_in,
            state.relay_tokens.clone(),
            state.neighborhood_init,
        )
    };
    node.registry.remove_session(&session.session_id).await;
    if checked_in {
        if let Some(identity_id) = &identity_id {
            node.registry.uncheck(identity_id, &session.session_id).await;
        }
    }
    for token in relay_tokens {
        if let Some(relay) = node.registry.find_relay(&token).await {
            relay::destroy_relay(node, &relay).await;
        }
    }
    if neighborhood_init {
        // The follower never finished its initialization; its row and the
        // blocking action go away with the session.
        if let Some(identity_id) = identity_id {
            match node.storage.remove_follower(&identity_id).await {
                Ok(true) => {
                    warn!(
                        follower = %abbrev_id(&identity_id),
                        "follower removed after aborted initialization"
                    );
                }
                Ok(false) => {}
                Err(err) => warn!(error = %err, "follower cleanup failed"),
            }
        }
    }
}

async fn handle_request(
    node: &SharedNode,
    session: &SessionHandle,
    message_id: u32,
    request: Request,
) -> HandlerResult {
    node.metrics.mark_dispatch();
    match request.kind {
        None => violation(),
        Some(request::Kind::Single(single)) => handle_single(node, session, single).await,
        Some(request::Kind::Conversation(conversation)) => match conversation.part {
            None => violation(),
            Some(part) => handle_conversation(node, session, message_id, part).await,
        },
    }
}

fn violation() -> HandlerResult {
    (
        Some(Response::error(Status::ProtocolViolation, "")),
        Outcome::Close,
    )
}

async fn handle_single(
    node: &SharedNode,
    session: &SessionHandle,
    request: SingleRequest,
) -> HandlerResult {
    let Some(part) = request.part else {
        return violation();
    };
    if !is_supported_version(&request.version) {
        return (
            Some(Response::error(Status::Unsupported, "version")),
            Outcome::Continue,
        );
    }
    match part {
        single_request::Part::Ping(ping) => {
            if ping.payload.len() > 32 {
                return (
                    Some(Response::error(Status::InvalidValue, "payload")),
                    Outcome::Continue,
                );
            }
            (
                Some(Response::single_ok(
                    portico_proto::PROTOCOL_VERSION,
                    single_response::Part::Ping(PingResponse {
                        payload: ping.payload,
                    }),
                )),
                Outcome::Continue,
            )
        }
        single_request::Part::ListRoles(_) => {
            if session.role != Role::Primary {
                return (Some(Response::error(Status::BadRole, "")), Outcome::Close);
            }
            let roles = node
                .role_ports()
                .iter()
                .map(|(role, port)| ServerRole {
                    role: role.to_proto() as i32,
                    port: u32::from(*port),
                    is_tcp: true,
                    is_tls: *role != Role::Primary,
                })
                .collect();
            (
                Some(Response::single_ok(
                    portico_proto::PROTOCOL_VERSION,
                    single_response::Part::ListRoles(ListRolesResponse { roles }),
                )),
                Outcome::Continue,
            )
        }
    }
}

async fn handle_conversation(
    node: &SharedNode,
    session: &SessionHandle,
    message_id: u32,
    part: conversation_request::Part,
) -> HandlerResult {
    let (roles, required) = preconditions(&part);
    if !roles.contains(&session.role) {
        return (Some(Response::error(Status::BadRole, "")), Outcome::Close);
    }
    let status = {
        let state = session.state.lock().await;
        state.status
    };
    if !required.allows(status) {
        let code = if status == ConversationStatus::None {
            Status::BadConversationStatus
        } else if required == RequiredStatus::Authenticated {
            Status::Unauthorized
        } else {
            Status::BadConversationStatus
        };
        return (Some(Response::error(code, "")), Outcome::Close);
    }
    use conversation_request::Part;
    match part {
        Part::Start(start) => handle_start_conversation(node, session, start).await,
        Part::RegisterHosting(req) => identity::handle_register_hosting(node, session, req).await,
        Part::CheckIn(req) => identity::handle_check_in(node, session, req).await,
        Part::VerifyIdentity(req) => identity::handle_verify_identity(session, req).await,
        Part::UpdateProfile(req) => identity::handle_update_profile(node, session, req).await,
        Part::CancelHostingAgreement(req) => {
            identity::handle_cancel_hosting(node, session, req).await
        }
        Part::GetIdentityInformation(req) => {
            identity::handle_get_identity_information(node, req).await
        }
        Part::ApplicationServiceAdd(req) => {
            identity::handle_application_service_add(node, session, req).await
        }
        Part::ApplicationServiceRemove(req) => {
            identity::handle_application_service_remove(session, req).await
        }
        Part::CallIdentityApplicationService(req) => {
            relay::handle_call(node, session, req).await
        }
        Part::ApplicationServiceSendMessage(req) => {
            relay::handle_app_service_send(node, session, message_id, req).await
        }
        Part::ProfileSearch(req) => search::handle_profile_search(node, session, req).await,
        Part::ProfileSearchPart(req) => {
            search::handle_profile_search_part(session, req).await
        }
        Part::AddRelatedIdentity(req) => {
            relations::handle_add_related_identity(node, session, req).await
        }
        Part::RemoveRelatedIdentity(req) => {
            relations::handle_remove_related_identity(node, session, req).await
        }
        Part::GetIdentityRelationshipsInformation(req) => {
            relations::handle_get_relationships(node, req).await
        }
        Part::StartNeighborhoodInitialization(req) => {
            neighborhood::handle_start_initialization(node, session, message_id, req).await
        }
        Part::NeighborhoodSharedProfileUpdate(req) => {
            neighborhood::handle_shared_profile_update(node, session, req).await
        }
        Part::StopNeighborhoodUpdates(_) => {
            neighborhood::handle_stop_updates(node, session).await
        }
        // Server-initiated request kinds; the role gate rejected them.
        Part::IncomingCallNotification(_)
        | Part::ApplicationServiceReceiveMessageNotification(_)
        | Part::FinishNeighborhoodInitialization(_) => violation(),
    }
}

/// `StartConversation`: version negotiation, identity binding and the
/// server's half of the challenge exchange.
async fn handle_start_conversation(
    node: &SharedNode,
    session: &SessionHandle,
    request: StartConversationRequest,
) -> HandlerResult {
    if request.public_key.len() != portico_crypto::PUBLIC_KEY_LEN {
        return (
            Some(Response::error(Status::InvalidValue, "publicKey")),
            Outcome::Continue,
        );
    }
    if request.client_challenge.len() != portico_crypto::CHALLENGE_LEN {
        return (
            Some(Response::error(Status::InvalidValue, "clientChallenge")),
            Outcome::Continue,
        );
    }
    let Some(version) = negotiate_version(&request.supported_versions) else {
        return (
            Some(Response::error(Status::Unsupported, "supportedVersions")),
            Outcome::Continue,
        );
    };
    let challenge = portico_crypto::random_challenge();
    let identity_id = portico_crypto::identity_id(&request.public_key);
    {
        let mut state = session.state.lock().await;
        state.status = ConversationStatus::Started;
        state.version = version;
        state.public_key = Some(request.public_key.clone());
        // Bound once, on the None -> Started transition.
        state.identity_id = Some(identity_id);
        state.challenge = Some(challenge);
    }
    let signature = node.config.identity_keys.sign(&request.client_challenge);
    let response = Response::conversation_ok(conversation_response::Part::Start(
        StartConversationResponse {
            version: version.to_vec(),
            public_key: node.config.identity_keys.public.to_vec(),
            challenge: challenge.to_vec(),
            client_challenge: request.client_challenge,
            signature: signature.to_vec(),
        },
    ));
    (Some(response), Outcome::Continue)
}

/// Routes a response envelope to the pending slot of the server-initiated
/// request it answers. Any mismatch is a protocol violation.
async fn handle_response(
    session: &SessionHandle,
    message_id: u32,
    response: Response,
) -> Result<(), ()> {
    let slot = {
        let mut state = session.state.lock().await;
        state.pending.remove(&message_id)
    };
    let Some(slot) = slot else {
        warn!(
            session = %session.session_id,
            message_id,
            "unmatched response"
        );
        return Err(());
    };
    let status = response.status();
    let part = match response.kind {
        Some(response::Kind::Conversation(conversation)) => conversation.part,
        Some(response::Kind::Single(_)) => {
            warn!(session = %session.session_id, "single response to conversation request");
            return Err(());
        }
        None => None,
    };
    match &part {
        Some(part) if part.tag() != slot.tag => {
            warn!(session = %session.session_id, "response type mismatch");
            return Err(());
        }
        None if status == Status::Ok => {
            warn!(session = %session.session_id, "ok response without payload");
            return Err(());
        }
        _ => {}
    }
    let _ = slot.respond.send(crate::session::PendingResponse {
        status,
        details: response.details,
        part,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::node::{NodeState, SharedNode};
    use portico_crypto::IdentityKeyPair;
    use portico_proto::messages::{
        ApplicationServiceAddRequest, ApplicationServiceSendMessageRequest,
        CallIdentityApplicationServiceRequest, CheckInRequest, GetIdentityInformationRequest,
        GpsLocation, HostingPlanContract, ProfileSearchPartRequest, ProfileSearchRequest,
        RegisterHostingRequest, StartNeighborhoodInitializationRequest, UpdateProfileRequest,
        VerifyIdentityRequest,
    };
    use portico_storage::ProfileChanges;
    use prost::Message as ProstMessage;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    fn test_config(image_dir: &std::path::Path) -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            primary_port: 16987,
            server_neighbor_port: 16988,
            client_non_customer_port: 16989,
            client_customer_port: 16990,
            client_app_service_port: 16991,
            keepalive_seconds: 60,
            database_path: ":memory:".to_string(),
            image_dir: image_dir.to_string_lossy().into_owned(),
            identity_keys: IdentityKeyPair::from_seed(b"server-server-server-server-32!!").unwrap(),
            max_hosted_identities: 100,
            max_identity_relations: 16,
            max_follower_servers: 8,
            neighborhood_init_parallelism: 2,
            max_application_services: 8,
            relay_pairing_seconds: 60,
            call_notification_seconds: 5,
            neighborhood_peers: Vec::new(),
            sweep_interval_seconds: 1,
            neighbor_expiration_hours: 48,
        }
    }

    async fn test_node(image_dir: &std::path::Path) -> SharedNode {
        NodeState::init(test_config(image_dir)).await.unwrap()
    }

    struct TestClient {
        stream: DuplexStream,
        next_id: u32,
    }

    impl TestClient {
        async fn connect(node: &SharedNode, role: Role) -> TestClient {
            let (client, server) = tokio::io::duplex(2 * 1024 * 1024);
            let remote: SocketAddr = "127.0.0.1:45000".parse().unwrap();
            let node = node.clone();
            tokio::spawn(async move {
                serve_connection(node, server, role, remote).await;
            });
            TestClient {
                stream: client,
                next_id: 1,
            }
        }

        async fn call(&mut self, part: conversation_request::Part) -> Response {
            let id = self.next_id;
            self.next_id += 1;
            write_message(&mut self.stream, &Message::conversation_request(id, part))
                .await
                .unwrap();
            let reply = read_message(&mut self.stream).await.unwrap();
            assert_eq!(reply.id, id);
            match reply.body {
                Some(message::Body::Response(response)) => response,
                other => panic!("expected response, got {:?}", other.is_some()),
            }
        }

        async fn next_message(&mut self) -> Message {
            read_message(&mut self.stream).await.unwrap()
        }

        async fn respond(&mut self, id: u32, response: Response) {
            write_message(&mut self.stream, &Message::response(id, response))
                .await
                .unwrap();
        }

        /// Runs `StartConversation`; returns the server challenge.
        async fn start(&mut self, keys: &IdentityKeyPair) -> Vec<u8> {
            let challenge = portico_crypto::random_challenge();
            let response = self
                .call(conversation_request::Part::Start(StartConversationRequest {
                    supported_versions: vec![portico_proto::PROTOCOL_VERSION.to_vec()],
                    public_key: keys.public.to_vec(),
                    client_challenge: challenge.to_vec(),
                }))
                .await;
            assert_eq!(response.status(), Status::Ok, "{}", response.details);
            match response.kind {
                Some(response::Kind::Conversation(conversation)) => match conversation.part {
                    Some(conversation_response::Part::Start(start)) => {
                        // The server proves possession of its conversation key.
                        portico_crypto::verify_signature(
                            &start.public_key,
                            &challenge,
                            &start.signature,
                        )
                        .unwrap();
                        start.challenge
                    }
                    other => panic!("unexpected part: {:?}", other.map(|p| p.tag())),
                },
                _ => panic!("expected conversation response"),
            }
        }

        async fn verify_identity(&mut self, keys: &IdentityKeyPair, challenge: &[u8]) {
            let signature = keys.sign(challenge);
            let response = self
                .call(conversation_request::Part::VerifyIdentity(VerifyIdentityRequest {
                    challenge: challenge.to_vec(),
                    signature: signature.to_vec(),
                }))
                .await;
            assert_eq!(response.status(), Status::Ok, "{}", response.details);
        }

        async fn check_in(&mut self, keys: &IdentityKeyPair, challenge: &[u8]) {
            let signature = keys.sign(challenge);
            let response = self
                .call(conversation_request::Part::CheckIn(CheckInRequest {
                    challenge: challenge.to_vec(),
                    signature: signature.to_vec(),
                }))
                .await;
            assert_eq!(response.status(), Status::Ok, "{}", response.details);
        }
    }

    fn signed_contract(keys: &IdentityKeyPair) -> HostingPlanContract {
        let mut contract = HostingPlanContract {
            identity_public_key: keys.public.to_vec(),
            identity_type: "individual".to_string(),
            plan_id: "basic".to_string(),
            start_time: 1_700_000_000_000,
            signature: Vec::new(),
        };
        let signature = keys.sign(&contract.encode_to_vec());
        contract.signature = signature.to_vec();
        contract
    }

    fn conversation_part(response: &Response) -> Option<&conversation_response::Part> {
        match &response.kind {
            Some(response::Kind::Conversation(conversation)) => conversation.part.as_ref(),
            _ => None,
        }
    }

    async fn seed_hosted_profile(node: &SharedNode, keys: &IdentityKeyPair, name: &str) {
        let identity_id = keys.identity_id();
        node.storage
            .register_hosting(
                &identity_id,
                &keys.public,
                chrono::Utc::now(),
                node.config.max_hosted_identities,
            )
            .await
            .unwrap();
        node.storage
            .update_profile(
                &identity_id,
                &ProfileChanges {
                    version: Some([1, 0, 0]),
                    name: Some(name.to_string()),
                    location: Some((50.0, 14.4)),
                    ..ProfileChanges::default()
                },
                chrono::Utc::now(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn hosting_checkin_update_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path()).await;
        let keys = IdentityKeyPair::from_seed(b"alice-alice-alice-alice-alice-32").unwrap();

        // Register on the non-customer port.
        let mut register_client = TestClient::connect(&node, Role::ClientNonCustomer).await;
        register_client.start(&keys).await;
        let response = register_client
            .call(conversation_request::Part::RegisterHosting(
                RegisterHostingRequest {
                    contract: Some(signed_contract(&keys)),
                },
            ))
            .await;
        assert_eq!(response.status(), Status::Ok, "{}", response.details);

        // Check in on the customer port and initialize the profile.
        let mut customer = TestClient::connect(&node, Role::ClientCustomer).await;
        let challenge = customer.start(&keys).await;
        customer.check_in(&keys, &challenge).await;
        let response = customer
            .call(conversation_request::Part::UpdateProfile(UpdateProfileRequest {
                set_version: true,
                version: vec![1, 0, 0],
                set_name: true,
                name: "Alice".to_string(),
                set_location: true,
                location: Some(GpsLocation {
                    latitude: 50.0,
                    longitude: 14.4,
                }),
                ..UpdateProfileRequest::default()
            }))
            .await;
        assert_eq!(response.status(), Status::Ok, "{}", response.details);

        let response = customer
            .call(conversation_request::Part::GetIdentityInformation(
                GetIdentityInformationRequest {
                    identity_id: keys.identity_id().to_vec(),
                    ..GetIdentityInformationRequest::default()
                },
            ))
            .await;
        assert_eq!(response.status(), Status::Ok);
        match conversation_part(&response) {
            Some(conversation_response::Part::GetIdentityInformation(info)) => {
                assert!(info.is_hosted);
                assert!(info.is_online);
                assert_eq!(info.name, "Alice");
                assert_eq!(info.location.as_ref().unwrap().latitude, 50.0);
            }
            other => panic!("unexpected part: {:?}", other.map(|p| p.tag())),
        }
    }

    #[tokio::test]
    async fn update_without_any_set_flag_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path()).await;
        let keys = IdentityKeyPair::from_seed(b"flags-flags-flags-flags-flags-32").unwrap();
        seed_hosted_profile(&node, &keys, "Flags").await;
        let mut customer = TestClient::connect(&node, Role::ClientCustomer).await;
        let challenge = customer.start(&keys).await;
        customer.check_in(&keys, &challenge).await;
        let response = customer
            .call(conversation_request::Part::UpdateProfile(
                UpdateProfileRequest::default(),
            ))
            .await;
        assert_eq!(response.status(), Status::InvalidValue);
        assert_eq!(response.details, "set*");
    }

    #[tokio::test]
    async fn role_and_status_gates() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path()).await;
        let keys = IdentityKeyPair::from_seed(b"gates-gates-gates-gates-gates-32").unwrap();

        // CheckIn is rejected on the non-customer port.
        let mut wrong_port = TestClient::connect(&node, Role::ClientNonCustomer).await;
        wrong_port.start(&keys).await;
        let response = wrong_port
            .call(conversation_request::Part::CheckIn(CheckInRequest {
                challenge: vec![0; 32],
                signature: vec![0; 64],
            }))
            .await;
        assert_eq!(response.status(), Status::BadRole);

        // RegisterHosting before StartConversation is a status violation.
        let mut no_start = TestClient::connect(&node, Role::ClientNonCustomer).await;
        let response = no_start
            .call(conversation_request::Part::RegisterHosting(
                RegisterHostingRequest {
                    contract: Some(signed_contract(&keys)),
                },
            ))
            .await;
        assert_eq!(response.status(), Status::BadConversationStatus);

        // UpdateProfile after only verifying is unauthorized.
        let mut verified_only = TestClient::connect(&node, Role::ClientCustomer).await;
        let challenge = verified_only.start(&keys).await;
        let _ = challenge;
        let response = verified_only
            .call(conversation_request::Part::UpdateProfile(UpdateProfileRequest {
                set_version: true,
                version: vec![1, 0, 0],
                set_name: true,
                name: "x".to_string(),
                set_location: true,
                location: Some(GpsLocation {
                    latitude: 0.0,
                    longitude: 0.0,
                }),
                ..UpdateProfileRequest::default()
            }))
            .await;
        assert_eq!(response.status(), Status::Unauthorized);
    }

    #[tokio::test]
    async fn search_with_cache_paging() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path()).await;
        for tag in 0..25u8 {
            let keys =
                IdentityKeyPair::from_seed(&[tag.wrapping_add(100); 32]).unwrap();
            seed_hosted_profile(&node, &keys, &format!("member-{tag:02}")).await;
        }
        let keys = IdentityKeyPair::from_seed(b"search-search-search-search-32!!").unwrap();
        let mut client = TestClient::connect(&node, Role::ClientNonCustomer).await;
        client.start(&keys).await;

        // Over-cap response limit with thumbnails.
        let response = client
            .call(conversation_request::Part::ProfileSearch(ProfileSearchRequest {
                include_thumbnail_images: true,
                max_response_record_count: 101,
                max_total_record_count: 500,
                name: "*".to_string(),
                identity_type: "*".to_string(),
                ..ProfileSearchRequest::default()
            }))
            .await;
        assert_eq!(response.status(), Status::InvalidValue);
        assert_eq!(response.details, "maxResponseRecordCount");

        let response = client
            .call(conversation_request::Part::ProfileSearch(ProfileSearchRequest {
                max_response_record_count: 10,
                max_total_record_count: 500,
                name: "member-*".to_string(),
                identity_type: "*".to_string(),
                ..ProfileSearchRequest::default()
            }))
            .await;
        assert_eq!(response.status(), Status::Ok, "{}", response.details);
        match conversation_part(&response) {
            Some(conversation_response::Part::ProfileSearch(search)) => {
                assert_eq!(search.total_record_count, 25);
                assert_eq!(search.profiles.len(), 10);
                assert_eq!(search.covered_servers.len(), 1);
            }
            other => panic!("unexpected part: {:?}", other.map(|p| p.tag())),
        }

        let response = client
            .call(conversation_request::Part::ProfileSearchPart(
                ProfileSearchPartRequest {
                    record_index: 10,
                    record_count: 10,
                },
            ))
            .await;
        assert_eq!(response.status(), Status::Ok);
        match conversation_part(&response) {
            Some(conversation_response::Part::ProfileSearchPart(part)) => {
                assert_eq!(part.profiles.len(), 10);
                assert_eq!(part.record_index, 10);
            }
            other => panic!("unexpected part: {:?}", other.map(|p| p.tag())),
        }

        let response = client
            .call(conversation_request::Part::ProfileSearchPart(
                ProfileSearchPartRequest {
                    record_index: 25,
                    record_count: 1,
                },
            ))
            .await;
        assert_eq!(response.status(), Status::InvalidValue);
        assert_eq!(response.details, "recordIndex");
    }

    #[tokio::test]
    async fn relay_call_forward_and_double_token_abuse() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path()).await;
        let callee_keys = IdentityKeyPair::from_seed(b"callee-callee-callee-callee-32!!").unwrap();
        let caller_keys = IdentityKeyPair::from_seed(b"caller-caller-caller-caller-32!!").unwrap();
        seed_hosted_profile(&node, &callee_keys, "Callee").await;

        // Callee checks in and registers the chat service.
        let mut callee = TestClient::connect(&node, Role::ClientCustomer).await;
        let challenge = callee.start(&callee_keys).await;
        callee.check_in(&callee_keys, &challenge).await;
        let response = callee
            .call(conversation_request::Part::ApplicationServiceAdd(
                ApplicationServiceAddRequest {
                    service_names: vec!["chat".to_string()],
                },
            ))
            .await;
        assert_eq!(response.status(), Status::Ok);

        // Caller verifies and opens the call; the response arrives only
        // after the callee accepts the notification.
        let mut caller = TestClient::connect(&node, Role::ClientNonCustomer).await;
        let challenge = caller.start(&caller_keys).await;
        caller.verify_identity(&caller_keys, &challenge).await;
        let call_id = caller.next_id;
        caller.next_id += 1;
        write_message(
            &mut caller.stream,
            &Message::conversation_request(
                call_id,
                conversation_request::Part::CallIdentityApplicationService(
                    CallIdentityApplicationServiceRequest {
                        identity_id: callee_keys.identity_id().to_vec(),
                        service_name: "chat".to_string(),
                    },
                ),
            ),
        )
        .await
        .unwrap();

        let notification = callee.next_message().await;
        let callee_token = match notification.body {
            Some(message::Body::Request(request)) => match request.kind {
                Some(request::Kind::Conversation(conversation)) => match conversation.part {
                    Some(conversation_request::Part::IncomingCallNotification(incoming)) => {
                        assert_eq!(incoming.caller_public_key, caller_keys.public.to_vec());
                        assert_eq!(incoming.service_name, "chat");
                        incoming.callee_token
                    }
                    other => panic!("unexpected part: {:?}", other.map(|p| p.tag())),
                },
                _ => panic!("expected conversation request"),
            },
            _ => panic!("expected request"),
        };
        callee
            .respond(
                notification.id,
                Response::conversation_ok(
                    conversation_response::Part::IncomingCallNotification(
                        portico_proto::messages::IncomingCallNotificationResponse {},
                    ),
                ),
            )
            .await;

        let reply = caller.next_message().await;
        assert_eq!(reply.id, call_id);
        let caller_token = match reply.body {
            Some(message::Body::Response(response)) => {
                assert_eq!(response.status(), Status::Ok, "{}", response.details);
                match response.kind {
                    Some(response::Kind::Conversation(conversation)) => match conversation.part {
                        Some(conversation_response::Part::CallIdentityApplicationService(
                            call,
                        )) => call.caller_token,
                        other => panic!("unexpected part: {:?}", other.map(|p| p.tag())),
                    },
                    _ => panic!("expected conversation response"),
                }
            }
            _ => panic!("expected response"),
        };

        // Both sides pair on the app-service port.
        let mut caller_app = TestClient::connect(&node, Role::ClientAppService).await;
        let response = caller_app
            .call(conversation_request::Part::ApplicationServiceSendMessage(
                ApplicationServiceSendMessageRequest {
                    token: caller_token.clone(),
                    message: Vec::new(),
                },
            ))
            .await;
        assert_eq!(response.status(), Status::Ok);
        let mut callee_app = TestClient::connect(&node, Role::ClientAppService).await;
        let response = callee_app
            .call(conversation_request::Part::ApplicationServiceSendMessage(
                ApplicationServiceSendMessageRequest {
                    token: callee_token.clone(),
                    message: Vec::new(),
                },
            ))
            .await;
        assert_eq!(response.status(), Status::Ok);

        // Payload flows caller -> callee with the ack propagated back.
        let send_id = caller_app.next_id;
        caller_app.next_id += 1;
        write_message(
            &mut caller_app.stream,
            &Message::conversation_request(
                send_id,
                conversation_request::Part::ApplicationServiceSendMessage(
                    ApplicationServiceSendMessageRequest {
                        token: caller_token.clone(),
                        message: b"hello".to_vec(),
                    },
                ),
            ),
        )
        .await
        .unwrap();
        let delivery = callee_app.next_message().await;
        match &delivery.body {
            Some(message::Body::Request(request)) => match &request.kind {
                Some(request::Kind::Conversation(conversation)) => match &conversation.part {
                    Some(
                        conversation_request::Part::ApplicationServiceReceiveMessageNotification(
                            received,
                        ),
                    ) => assert_eq!(received.message, b"hello".to_vec()),
                    other => panic!("unexpected part: {:?}", other.as_ref().map(|p| p.tag())),
                },
                _ => panic!("expected conversation request"),
            },
            _ => panic!("expected request"),
        }
        callee_app
            .respond(
                delivery.id,
                Response::conversation_ok(
                    conversation_response::Part::ApplicationServiceReceiveMessageNotification(
                        portico_proto::messages::ApplicationServiceReceiveMessageNotificationResponse {},
                    ),
                ),
            )
            .await;
        let ack = caller_app.next_message().await;
        assert_eq!(ack.id, send_id);
        match ack.body {
            Some(message::Body::Response(response)) => {
                assert_eq!(response.status(), Status::Ok)
            }
            _ => panic!("expected response"),
        }

        // A second connection presenting the callee token is rejected and
        // force-disconnected.
        let mut intruder = TestClient::connect(&node, Role::ClientAppService).await;
        let response = intruder
            .call(conversation_request::Part::ApplicationServiceSendMessage(
                ApplicationServiceSendMessageRequest {
                    token: callee_token.clone(),
                    message: Vec::new(),
                },
            ))
            .await;
        assert_eq!(response.status(), Status::NotFound);
        assert!(read_message(&mut intruder.stream).await.is_err());
    }

    #[tokio::test]
    async fn neighborhood_initialization_stream() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path()).await;
        for tag in 0..3u8 {
            let keys = IdentityKeyPair::from_seed(&[tag.wrapping_add(50); 32]).unwrap();
            seed_hosted_profile(&node, &keys, &format!("hosted-{tag}")).await;
        }
        let follower_keys =
            IdentityKeyPair::from_seed(b"follower-follower-follower-32!!!").unwrap();
        let mut follower = TestClient::connect(&node, Role::ServerNeighbor).await;
        let challenge = follower.start(&follower_keys).await;
        follower.verify_identity(&follower_keys, &challenge).await;
        let response = follower
            .call(conversation_request::Part::StartNeighborhoodInitialization(
                StartNeighborhoodInitializationRequest {
                    primary_port: 16987,
                    server_neighbor_port: 16988,
                },
            ))
            .await;
        assert_eq!(response.status(), Status::Ok, "{}", response.details);

        let mut received_profiles = 0usize;
        loop {
            let message = follower.next_message().await;
            let part = match message.body {
                Some(message::Body::Request(request)) => match request.kind {
                    Some(request::Kind::Conversation(conversation)) => conversation.part,
                    _ => panic!("expected conversation request"),
                },
                _ => panic!("expected request"),
            };
            match part {
                Some(conversation_request::Part::NeighborhoodSharedProfileUpdate(update)) => {
                    received_profiles += update.items.len();
                    follower
                        .respond(
                            message.id,
                            Response::conversation_ok(
                                conversation_response::Part::NeighborhoodSharedProfileUpdate(
                                    portico_proto::messages::NeighborhoodSharedProfileUpdateResponse {},
                                ),
                            ),
                        )
                        .await;
                }
                Some(conversation_request::Part::FinishNeighborhoodInitialization(_)) => {
                    follower
                        .respond(
                            message.id,
                            Response::conversation_ok(
                                conversation_response::Part::FinishNeighborhoodInitialization(
                                    portico_proto::messages::FinishNeighborhoodInitializationResponse {},
                                ),
                            ),
                        )
                        .await;
                    break;
                }
                other => panic!("unexpected part: {:?}", other.map(|p| p.tag())),
            }
        }
        assert_eq!(received_profiles, 3);

        // The follower row flips to refreshed once the finish handler runs.
        let follower_id = follower_keys.identity_id();
        let mut attempts = 0;
        loop {
            if let Some(row) = node.storage.load_follower(&follower_id).await.unwrap() {
                if row.last_refresh_at.is_some() {
                    break;
                }
            }
            attempts += 1;
            assert!(attempts < 100, "follower never finished initialization");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        // Profile changes now fan out to this follower.
        let keys = IdentityKeyPair::from_seed(&[50u8; 32]).unwrap();
        node.storage
            .update_profile(
                &keys.identity_id(),
                &ProfileChanges {
                    extra_data: Some("updated".to_string()),
                    ..ProfileChanges::default()
                },
                chrono::Utc::now(),
            )
            .await
            .unwrap();
        let pending = node
            .storage
            .pending_actions_for(&follower_id)
            .await
            .unwrap();
        assert!(pending
            .iter()
            .any(|action| action.action_type == portico_storage::ActionType::ChangeProfile));
    }

    #[tokio::test]
    async fn inbound_updates_require_initialized_neighbor() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path()).await;
        let neighbor_keys =
            IdentityKeyPair::from_seed(b"neighbor-neighbor-neighbor-32!!!").unwrap();
        let mut neighbor = TestClient::connect(&node, Role::ServerNeighbor).await;
        let challenge = neighbor.start(&neighbor_keys).await;
        neighbor.verify_identity(&neighbor_keys, &challenge).await;

        let add_item = portico_proto::messages::SharedProfileUpdateItem {
            action: Some(
                portico_proto::messages::shared_profile_update_item::Action::Add(
                    portico_proto::messages::SharedProfileAddItem {
                        identity_public_key: vec![9; 32],
                        version: vec![1, 0, 0],
                        name: "Remote".to_string(),
                        identity_type: "individual".to_string(),
                        location: None,
                        extra_data: String::new(),
                        thumbnail_image: Vec::new(),
                    },
                ),
            ),
        };
        let update = portico_proto::messages::NeighborhoodSharedProfileUpdateRequest {
            items: vec![add_item.clone()],
        };

        // Unknown sender is rejected.
        let response = neighbor
            .call(conversation_request::Part::NeighborhoodSharedProfileUpdate(update.clone()))
            .await;
        assert_eq!(response.status(), Status::Rejected);

        // Once initialized, the same update applies.
        node.storage
            .upsert_neighbor(&neighbor_keys.identity_id(), Some(chrono::Utc::now()))
            .await
            .unwrap();
        let response = neighbor
            .call(conversation_request::Part::NeighborhoodSharedProfileUpdate(update.clone()))
            .await;
        assert_eq!(response.status(), Status::Ok, "{}", response.details);

        // A duplicate add stops the bundle with an indexed detail.
        let response = neighbor
            .call(conversation_request::Part::NeighborhoodSharedProfileUpdate(update))
            .await;
        assert_eq!(response.status(), Status::InvalidValue);
        assert_eq!(response.details, "0.add.identityPublicKey");
    }

    #[tokio::test]
    async fn keepalive_sweep_closes_idle_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.keepalive_seconds = 0;
        let node = NodeState::init(config).await.unwrap();
        let keys = IdentityKeyPair::from_seed(b"idler-idler-idler-idler-idler-32").unwrap();
        let mut client = TestClient::connect(&node, Role::ClientNonCustomer).await;
        client.start(&keys).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        crate::sweeper::sweep(&node).await;
        // The connection is torn down; the next read fails.
        assert!(read_message(&mut client.stream).await.is_err());
        let mut attempts = 0;
        while node.registry.session_count().await != 0 {
            attempts += 1;
            assert!(attempts < 100);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn malformed_frame_yields_violation_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path()).await;
        let mut client = TestClient::connect(&node, Role::ClientNonCustomer).await;
        // Valid length prefix, garbage body.
        client.stream.write_all(&4u32.to_be_bytes()).await.unwrap();
        client
            .stream
            .write_all(&[0xff, 0xff, 0xff, 0xff])
            .await
            .unwrap();
        client.stream.flush().await.unwrap();
        let reply = read_message(&mut client.stream).await.unwrap();
        assert_eq!(reply.id, VIOLATION_MESSAGE_ID);
        match reply.body {
            Some(message::Body::Response(response)) => {
                assert_eq!(response.status(), Status::ProtocolViolation)
            }
            _ => panic!("expected response"),
        }
        assert!(read_message(&mut client.stream).await.is_err());
    }

    #[tokio::test]
    async fn unmatched_response_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path()).await;
        let mut client = TestClient::connect(&node, Role::ClientNonCustomer).await;
        write_message(
            &mut client.stream,
            &Message::response(99, Response::error(Status::Ok, "")),
        )
        .await
        .unwrap();
        assert!(read_message(&mut client.stream).await.is_err());
    }
}
