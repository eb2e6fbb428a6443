pub mod frame;
pub mod messages;

pub use frame::{
    decode_frame, encode_frame, read_message, write_message, CodecError, BATCH_SAFETY_MARGIN,
    LENGTH_PREFIX_LEN, MAX_FRAME_LEN,
};
pub use messages::*;

/// Protocol version spoken by this implementation, `major.minor.patch`.
pub const PROTOCOL_VERSION: [u8; 3] = [1, 0, 0];
pub const SUPPORTED_PROTOCOL_VERSIONS: &[[u8; 3]] = &[PROTOCOL_VERSION];

/// Message id used for protocol violation replies when the offending
/// message id could not be decoded.
pub const VIOLATION_MESSAGE_ID: u32 = 0x0BAD_C0DE;

/// Returns true when the provided protocol version is supported.
pub fn is_supported_version(version: &[u8]) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .any(|v| v.as_slice() == version)
}

/// Picks the highest mutually supported protocol version.
pub fn negotiate_version(peer_versions: &[Vec<u8>]) -> Option<[u8; 3]> {
    let mut negotiated: Option<[u8; 3]> = None;
    for version in peer_versions {
        if let Ok(triple) = <[u8; 3]>::try_from(version.as_slice()) {
            if is_supported_version(&triple) {
                negotiated = match negotiated {
                    Some(current) if current >= triple => Some(current),
                    _ => Some(triple),
                };
            }
        }
    }
    negotiated
}

impl Message {
    pub fn single_request(id: u32, version: [u8; 3], part: single_request::Part) -> Message {
        Message {
            id,
            body: Some(message::Body::Request(Request {
                kind: Some(request::Kind::Single(SingleRequest {
                    version: version.to_vec(),
                    part: Some(part),
                })),
            })),
        }
    }

    pub fn conversation_request(id: u32, part: conversation_request::Part) -> Message {
        Message {
            id,
            body: Some(message::Body::Request(Request {
                kind: Some(request::Kind::Conversation(ConversationRequest {
                    part: Some(part),
                })),
            })),
        }
    }

    pub fn response(id: u32, response: Response) -> Message {
        Message {
            id,
            body: Some(message::Body::Response(response)),
        }
    }
}

impl Response {
    /// Successful single response.
    pub fn single_ok(version: [u8; 3], part: single_response::Part) -> Response {
        Response {
            status: Status::Ok as i32,
            details: String::new(),
            kind: Some(response::Kind::Single(SingleResponse {
                version: version.to_vec(),
                part: Some(part),
            })),
        }
    }

    /// Successful conversation response.
    pub fn conversation_ok(part: conversation_response::Part) -> Response {
        Response {
            status: Status::Ok as i32,
            details: String::new(),
            kind: Some(response::Kind::Conversation(ConversationResponse {
                part: Some(part),
            })),
        }
    }

    /// Error response with no payload; `details` names the offending field
    /// where the status calls for it.
    pub fn error(status: Status, details: &str) -> Response {
        Response {
            status: status as i32,
            details: details.to_string(),
            kind: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status() == Status::Ok
    }
}

impl conversation_request::Part {
    /// Wire tag of this request part; paired responses carry the same tag.
    pub fn tag(&self) -> u32 {
        use conversation_request::Part;
        match self {
            Part::Start(_) => 10,
            Part::RegisterHosting(_) => 11,
            Part::CheckIn(_) => 12,
            Part::VerifyIdentity(_) => 13,
            Part::UpdateProfile(_) => 14,
            Part::CancelHostingAgreement(_) => 15,
            Part::GetIdentityInformation(_) => 16,
            Part::ApplicationServiceAdd(_) => 17,
            Part::ApplicationServiceRemove(_) => 18,
            Part::CallIdentityApplicationService(_) => 19,
            Part::IncomingCallNotification(_) => 20,
            Part::ApplicationServiceSendMessage(_) => 21,
            Part::ApplicationServiceReceiveMessageNotification(_) => 22,
            Part::ProfileSearch(_) => 23,
            Part::ProfileSearchPart(_) => 24,
            Part::AddRelatedIdentity(_) => 25,
            Part::RemoveRelatedIdentity(_) => 26,
            Part::GetIdentityRelationshipsInformation(_) => 27,
            Part::StartNeighborhoodInitialization(_) => 28,
            Part::FinishNeighborhoodInitialization(_) => 29,
            Part::NeighborhoodSharedProfileUpdate(_) => 30,
            Part::StopNeighborhoodUpdates(_) => 31,
        }
    }

    pub fn name(&self) -> &'static str {
        use conversation_request::Part;
        match self {
            Part::Start(_) => "StartConversation",
            Part::RegisterHosting(_) => "RegisterHosting",
            Part::CheckIn(_) => "CheckIn",
            Part::VerifyIdentity(_) => "VerifyIdentity",
            Part::UpdateProfile(_) => "UpdateProfile",
            Part::CancelHostingAgreement(_) => "CancelHostingAgreement",
            Part::GetIdentityInformation(_) => "GetIdentityInformation",
            Part::ApplicationServiceAdd(_) => "ApplicationServiceAdd",
            Part::ApplicationServiceRemove(_) => "ApplicationServiceRemove",
            Part::CallIdentityApplicationService(_) => "CallIdentityApplicationService",
            Part::IncomingCallNotification(_) => "IncomingCallNotification",
            Part::ApplicationServiceSendMessage(_) => "ApplicationServiceSendMessage",
            Part::ApplicationServiceReceiveMessageNotification(_) => {
                "ApplicationServiceReceiveMessageNotification"
            }
            Part::ProfileSearch(_) => "ProfileSearch",
            Part::ProfileSearchPart(_) => "ProfileSearchPart",
            Part::AddRelatedIdentity(_) => "AddRelatedIdentity",
            Part::RemoveRelatedIdentity(_) => "RemoveRelatedIdentity",
            Part::GetIdentityRelationshipsInformation(_) => "GetIdentityRelationshipsInformation",
            Part::StartNeighborhoodInitialization(_) => "StartNeighborhoodInitialization",
            Part::FinishNeighborhoodInitialization(_) => "FinishNeighborhoodInitialization",
            Part::NeighborhoodSharedProfileUpdate(_) => "NeighborhoodSharedProfileUpdate",
            Part::StopNeighborhoodUpdates(_) => "StopNeighborhoodUpdates",
        }
    }
}

impl conversation_response::Part {
    /// Wire tag of this response part, mirroring the request tags.
    pub fn tag(&self) -> u32 {
        use conversation_response::Part;
        match self {
            Part::Start(_) => 10,
            Part::RegisterHosting(_) => 11,
            Part::CheckIn(_) => 12,
            Part::VerifyIdentity(_) => 13,
            Part::UpdateProfile(_) => 14,
            Part::CancelHostingAgreement(_) => 15,
            Part::GetIdentityInformation(_) => 16,
            Part::ApplicationServiceAdd(_) => 17,
            Part::ApplicationServiceRemove(_) => 18,
            Part::CallIdentityApplicationService(_) => 19,
            Part::IncomingCallNotification(_) => 20,
            Part::ApplicationServiceSendMessage(_) => 21,
            Part::ApplicationServiceReceiveMessageNotification(_) => 22,
            Part::ProfileSearch(_) => 23,
            Part::ProfileSearchPart(_) => 24,
            Part::AddRelatedIdentity(_) => 25,
            Part::RemoveRelatedIdentity(_) => 26,
            Part::GetIdentityRelationshipsInformation(_) => 27,
            Part::StartNeighborhoodInitialization(_) => 28,
            Part::FinishNeighborhoodInitialization(_) => 29,
            Part::NeighborhoodSharedProfileUpdate(_) => 30,
            Part::StopNeighborhoodUpdates(_) => 31,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_prefers_highest_supported() {
        let offered = vec![vec![0, 9, 9], PROTOCOL_VERSION.to_vec(), vec![2, 0, 0]];
        assert_eq!(negotiate_version(&offered), Some(PROTOCOL_VERSION));
    }

    #[test]
    fn negotiate_none_when_disjoint() {
        let offered = vec![vec![0, 9, 9], vec![2, 0, 0], vec![1, 0]];
        assert_eq!(negotiate_version(&offered), None);
    }

    #[test]
    fn supported_version_predicate() {
        assert!(is_supported_version(&PROTOCOL_VERSION));
        assert!(!is_supported_version(&[1, 0, 1]));
        assert!(!is_supported_version(&[1, 0]));
    }

    #[test]
    fn request_and_response_tags_mirror() {
        let request = conversation_request::Part::ProfileSearch(ProfileSearchRequest::default());
        let response =
            conversation_response::Part::ProfileSearch(ProfileSearchResponse::default());
        assert_eq!(request.tag(), response.tag());
    }

    #[test]
    fn error_response_has_no_payload() {
        let response = Response::error(Status::NotFound, "identityNetworkId");
        assert_eq!(response.status(), Status::NotFound);
        assert_eq!(response.details, "identityNetworkId");
        assert!(response.kind.is_none());
    }
}
