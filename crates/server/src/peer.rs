//! Outbound connections to peer servers: the authenticated client-side
//! conversation used by the action worker for update delivery and by the
//! neighbor bootstrap that pulls another server's identity set.

use portico_crypto::IdentityKeyPair;
use portico_proto::frame::{read_message, write_message};
use portico_proto::messages::{
    conversation_request, conversation_response, message, StartConversationRequest,
    StartNeighborhoodInitializationRequest, Status, VerifyIdentityRequest,
};
use portico_proto::{Message, Response, PROTOCOL_VERSION};
use chrono::Utc;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::handlers::neighborhood;
use crate::node::{ServerError, SharedNode};
use crate::util::abbrev_id;

pub struct PeerConnection {
    stream: TcpStream,
    next_id: u32,
    /// Identity id of the remote server, from its conversation key.
    pub peer_id: [u8; 32],
}

impl PeerConnection {
    /// Connects and runs `StartConversation` + `VerifyIdentity` as a client.
    pub async fn connect(addr: &str, keys: &IdentityKeyPair) -> Result<PeerConnection, ServerError> {
        let stream = TcpStream::connect(addr).await?;
        let mut connection = PeerConnection {
            stream,
            next_id: 1,
            peer_id: [0u8; 32],
        };
        let client_challenge = portico_crypto::random_challenge();
        let start = conversation_request::Part::Start(StartConversationRequest {
            supported_versions: vec![PROTOCOL_VERSION.to_vec()],
            public_key: keys.public.to_vec(),
            client_challenge: client_challenge.to_vec(),
        });
        let response = connection.call(start).await?;
        let Some(conversation_response::Part::Start(start_response)) = response else {
            return Err(ServerError::Protocol);
        };
        portico_crypto::verify_signature(
            &start_response.public_key,
            &client_challenge,
            &start_response.signature,
        )
        .map_err(|_| ServerError::Crypto)?;
        connection.peer_id = portico_crypto::identity_id(&start_response.public_key);
        let signature = keys.sign(&start_response.challenge);
        let verify = conversation_request::Part::VerifyIdentity(VerifyIdentityRequest {
            challenge: start_response.challenge,
            signature: signature.to_vec(),
        });
        connection.call(verify).await?;
        Ok(connection)
    }

    /// Sends one conversation request and reads its response. Returns the
    /// response part on `Ok`; a non-`Ok` status is an error.
    pub async fn call(
        &mut self,
        part: conversation_request::Part,
    ) -> Result<Option<conversation_response::Part>, ServerError> {
        let id = self.next_id;
        self.next_id += 1;
        let request = Message::conversation_request(id, part);
        write_message(&mut self.stream, &request).await?;
        let reply = read_message(&mut self.stream).await?;
        if reply.id != id {
            return Err(ServerError::Protocol);
        }
        let Some(message::Body::Response(response)) = reply.body else {
            return Err(ServerError::Protocol);
        };
        if response.status() != Status::Ok {
            return Err(ServerError::Protocol);
        }
        match response.kind {
            Some(portico_proto::messages::response::Kind::Conversation(conversation)) => {
                Ok(conversation.part)
            }
            _ => Err(ServerError::Protocol),
        }
    }

    /// Reads the next message from the peer; used once the peer starts
    /// driving the connection (initialization streaming).
    pub async fn next_message(&mut self) -> Result<Message, ServerError> {
        Ok(read_message(&mut self.stream).await?)
    }

    pub async fn respond(&mut self, id: u32, response: Response) -> Result<(), ServerError> {
        write_message(&mut self.stream, &Message::response(id, response)).await?;
        Ok(())
    }
}

/// Spawns one bootstrap task per configured neighborhood peer.
pub fn spawn_neighbor_bootstrap(node: &SharedNode) {
    for addr in node.config.neighborhood_peers.clone() {
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(err) = bootstrap_peer(&node, &addr).await {
                warn!(peer = %addr, error = %err, "neighbor bootstrap failed");
            }
        });
    }
}

/// Asks a peer server to treat us as its follower and applies the identity
/// snapshot it streams back over this same connection.
async fn bootstrap_peer(node: &SharedNode, addr: &str) -> Result<(), ServerError> {
    let mut connection = PeerConnection::connect(addr, &node.config.identity_keys).await?;
    let peer_id = connection.peer_id;
    if let Some(neighbor) = node.storage.load_neighbor(&peer_id).await? {
        if neighbor.last_refresh_at.is_some() {
            return Ok(());
        }
    }
    connection
        .call(conversation_request::Part::StartNeighborhoodInitialization(
            StartNeighborhoodInitializationRequest {
                primary_port: u32::from(node.config.primary_port),
                server_neighbor_port: u32::from(node.config.server_neighbor_port),
            },
        ))
        .await?;
    node.storage.upsert_neighbor(&peer_id, None).await?;
    info!(peer = %abbrev_id(&peer_id), "neighbor initialization accepted");
    loop {
        let message = connection.next_message().await?;
        let Some(message::Body::Request(request)) = message.body else {
            return Err(ServerError::Protocol);
        };
        let part = match request.kind {
            Some(portico_proto::messages::request::Kind::Conversation(conversation)) => {
                conversation.part
            }
            _ => None,
        };
        match part {
            Some(conversation_request::Part::NeighborhoodSharedProfileUpdate(update)) => {
                let response =
                    neighborhood::apply_shared_profiles(node, &peer_id, &update.items).await;
                connection.respond(message.id, response).await?;
            }
            Some(conversation_request::Part::FinishNeighborhoodInitialization(_)) => {
                node.storage
                    .upsert_neighbor(&peer_id, Some(Utc::now()))
                    .await?;
                let response = Response::conversation_ok(
                    conversation_response::Part::FinishNeighborhoodInitialization(
                        portico_proto::messages::FinishNeighborhoodInitializationResponse {},
                    ),
                );
                connection.respond(message.id, response).await?;
                info!(peer = %abbrev_id(&peer_id), "neighbor initialization complete");
                return Ok(());
            }
            _ => {
                let response = Response::error(Status::ProtocolViolation, "");
                connection.respond(message.id, response).await?;
                return Err(ServerError::Protocol);
            }
        }
    }
}
