//! Protocol buffer message set of the hosting protocol.
//!
//! The definitions are written out by hand as `prost` derives so the
//! workspace builds without a protoc toolchain. Tag numbers are part of the
//! wire contract; request and response oneof tags mirror each other so a
//! response can be type-checked against the request it answers.

/// Outcome of a request, carried by every response envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    ProtocolViolation = 1,
    Unsupported = 2,
    BadRole = 3,
    BadConversationStatus = 4,
    Unauthorized = 5,
    InvalidValue = 6,
    InvalidSignature = 7,
    NotFound = 8,
    AlreadyExists = 9,
    QuotaExceeded = 10,
    Uninitialized = 11,
    NotAvailable = 12,
    Rejected = 13,
    Busy = 14,
    Internal = 15,
}

/// Role flags a listening endpoint can advertise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ServerRoleType {
    Primary = 0,
    ServerNeighbor = 1,
    ClientNonCustomer = 2,
    ClientCustomer = 3,
    ClientAppService = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(oneof = "message::Body", tags = "2, 3")]
    pub body: ::core::option::Option<message::Body>,
}

pub mod message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "2")]
        Request(super::Request),
        #[prost(message, tag = "3")]
        Response(super::Response),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(oneof = "request::Kind", tags = "1, 2")]
    pub kind: ::core::option::Option<request::Kind>,
}

pub mod request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Single(super::SingleRequest),
        #[prost(message, tag = "2")]
        Conversation(super::ConversationRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(enumeration = "Status", tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub details: ::prost::alloc::string::String,
    #[prost(oneof = "response::Kind", tags = "3, 4")]
    pub kind: ::core::option::Option<response::Kind>,
}

pub mod response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "3")]
        Single(super::SingleResponse),
        #[prost(message, tag = "4")]
        Conversation(super::ConversationResponse),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SingleRequest {
    /// Protocol version the sender speaks, three bytes `major.minor.patch`.
    #[prost(bytes = "vec", tag = "1")]
    pub version: ::prost::alloc::vec::Vec<u8>,
    #[prost(oneof = "single_request::Part", tags = "10, 11")]
    pub part: ::core::option::Option<single_request::Part>,
}

pub mod single_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Part {
        #[prost(message, tag = "10")]
        Ping(super::PingRequest),
        #[prost(message, tag = "11")]
        ListRoles(super::ListRolesRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SingleResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub version: ::prost::alloc::vec::Vec<u8>,
    #[prost(oneof = "single_response::Part", tags = "10, 11")]
    pub part: ::core::option::Option<single_response::Part>,
}

pub mod single_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Part {
        #[prost(message, tag = "10")]
        Ping(super::PingResponse),
        #[prost(message, tag = "11")]
        ListRoles(super::ListRolesResponse),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConversationRequest {
    #[prost(
        oneof = "conversation_request::Part",
        tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31"
    )]
    pub part: ::core::option::Option<conversation_request::Part>,
}

pub mod conversation_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Part {
        #[prost(message, tag = "10")]
        Start(super::StartConversationRequest),
        #[prost(message, tag = "11")]
        RegisterHosting(super::RegisterHostingRequest),
        #[prost(message, tag = "12")]
        CheckIn(super::CheckInRequest),
        #[prost(message, tag = "13")]
        VerifyIdentity(super::VerifyIdentityRequest),
        #[prost(message, tag = "14")]
        UpdateProfile(super::UpdateProfileRequest),
        #[prost(message, tag = "15")]
        CancelHostingAgreement(super::CancelHostingAgreementRequest),
        #[prost(message, tag = "16")]
        GetIdentityInformation(super::GetIdentityInformationRequest),
        #[prost(message, tag = "17")]
        ApplicationServiceAdd(super::ApplicationServiceAddRequest),
        #[prost(message, tag = "18")]
        ApplicationServiceRemove(super::ApplicationServiceRemoveRequest),
        #[prost(message, tag = "19")]
        CallIdentityApplicationService(super::CallIdentityApplicationServiceRequest),
        #[prost(message, tag = "20")]
        IncomingCallNotification(super::IncomingCallNotificationRequest),
        #[prost(message, tag = "21")]
        ApplicationServiceSendMessage(super::ApplicationServiceSendMessageRequest),
        #[prost(message, tag = "22")]
        ApplicationServiceReceiveMessageNotification(
            super::ApplicationServiceReceiveMessageNotificationRequest,
        ),
        #[prost(message, tag = "23")]
        ProfileSearch(super::ProfileSearchRequest),
        #[prost(message, tag = "24")]
        ProfileSearchPart(super::ProfileSearchPartRequest),
        #[prost(message, tag = "25")]
        AddRelatedIdentity(super::AddRelatedIdentityRequest),
        #[prost(message, tag = "26")]
        RemoveRelatedIdentity(super::RemoveRelatedIdentityRequest),
        #[prost(message, tag = "27")]
        GetIdentityRelationshipsInformation(super::GetIdentityRelationshipsInformationRequest),
        #[prost(message, tag = "28")]
        StartNeighborhoodInitialization(super::StartNeighborhoodInitializationRequest),
        #[prost(message, tag = "29")]
        FinishNeighborhoodInitialization(super::FinishNeighborhoodInitializationRequest),
        #[prost(message, tag = "30")]
        NeighborhoodSharedProfileUpdate(super::NeighborhoodSharedProfileUpdateRequest),
        #[prost(message, tag = "31")]
        StopNeighborhoodUpdates(super::StopNeighborhoodUpdatesRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConversationResponse {
    #[prost(
        oneof = "conversation_response::Part",
        tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31"
    )]
    pub part: ::core::option::Option<conversation_response::Part>,
}

pub mod conversation_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Part {
        #[prost(message, tag = "10")]
        Start(super::StartConversationResponse),
        #[prost(message, tag = "11")]
        RegisterHosting(super::RegisterHostingResponse),
        #[prost(message, tag = "12")]
        CheckIn(super::CheckInResponse),
        #[prost(message, tag = "13")]
        VerifyIdentity(super::VerifyIdentityResponse),
        #[prost(message, tag = "14")]
        UpdateProfile(super::UpdateProfileResponse),
        #[prost(message, tag = "15")]
        CancelHostingAgreement(super::CancelHostingAgreementResponse),
        #[prost(message, tag = "16")]
        GetIdentityInformation(super::GetIdentityInformationResponse),
        #[prost(message, tag = "17")]
        ApplicationServiceAdd(super::ApplicationServiceAddResponse),
        #[prost(message, tag = "18")]
        ApplicationServiceRemove(super::ApplicationServiceRemoveResponse),
        #[prost(message, tag = "19")]
        CallIdentityApplicationService(super::CallIdentityApplicationServiceResponse),
        #[prost(message, tag = "20")]
        IncomingCallNotification(super::IncomingCallNotificationResponse),
        #[prost(message, tag = "21")]
        ApplicationServiceSendMessage(super::ApplicationServiceSendMessageResponse),
        #[prost(message, tag = "22")]
        ApplicationServiceReceiveMessageNotification(
            super::ApplicationServiceReceiveMessageNotificationResponse,
        ),
        #[prost(message, tag = "23")]
        ProfileSearch(super::ProfileSearchResponse),
        #[prost(message, tag = "24")]
        ProfileSearchPart(super::ProfileSearchPartResponse),
        #[prost(message, tag = "25")]
        AddRelatedIdentity(super::AddRelatedIdentityResponse),
        #[prost(message, tag = "26")]
        RemoveRelatedIdentity(super::RemoveRelatedIdentityResponse),
        #[prost(message, tag = "27")]
        GetIdentityRelationshipsInformation(super::GetIdentityRelationshipsInformationResponse),
        #[prost(message, tag = "28")]
        StartNeighborhoodInitialization(super::StartNeighborhoodInitializationResponse),
        #[prost(message, tag = "29")]
        FinishNeighborhoodInitialization(super::FinishNeighborhoodInitializationResponse),
        #[prost(message, tag = "30")]
        NeighborhoodSharedProfileUpdate(super::NeighborhoodSharedProfileUpdateResponse),
        #[prost(message, tag = "31")]
        StopNeighborhoodUpdates(super::StopNeighborhoodUpdatesResponse),
    }
}

// Single requests.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListRolesRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerRole {
    #[prost(enumeration = "ServerRoleType", tag = "1")]
    pub role: i32,
    #[prost(uint32, tag = "2")]
    pub port: u32,
    #[prost(bool, tag = "3")]
    pub is_tcp: bool,
    #[prost(bool, tag = "4")]
    pub is_tls: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListRolesResponse {
    #[prost(message, repeated, tag = "1")]
    pub roles: ::prost::alloc::vec::Vec<ServerRole>,
}

// Conversation setup and identity verification.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartConversationRequest {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub supported_versions: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub client_challenge: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartConversationResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub version: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub challenge: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub client_challenge: ::prost::alloc::vec::Vec<u8>,
    /// Signature of the client challenge by the server's identity key.
    #[prost(bytes = "vec", tag = "5")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HostingPlanContract {
    #[prost(bytes = "vec", tag = "1")]
    pub identity_public_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "2")]
    pub identity_type: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub plan_id: ::prost::alloc::string::String,
    /// Unix timestamp in milliseconds at which the contract was drawn.
    #[prost(int64, tag = "4")]
    pub start_time: i64,
    /// Signature of the contract with this field zeroed, by the identity key.
    #[prost(bytes = "vec", tag = "5")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterHostingRequest {
    #[prost(message, optional, tag = "1")]
    pub contract: ::core::option::Option<HostingPlanContract>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterHostingResponse {
    #[prost(message, optional, tag = "1")]
    pub contract: ::core::option::Option<HostingPlanContract>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckInRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub challenge: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckInResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VerifyIdentityRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub challenge: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VerifyIdentityResponse {}

// Profile management.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GpsLocation {
    #[prost(double, tag = "1")]
    pub latitude: f64,
    #[prost(double, tag = "2")]
    pub longitude: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateProfileRequest {
    #[prost(bool, tag = "1")]
    pub set_version: bool,
    #[prost(bytes = "vec", tag = "2")]
    pub version: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "3")]
    pub set_name: bool,
    #[prost(string, tag = "4")]
    pub name: ::prost::alloc::string::String,
    #[prost(bool, tag = "5")]
    pub set_image: bool,
    /// Empty with `set_image` means the profile image is removed.
    #[prost(bytes = "vec", tag = "6")]
    pub image: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "7")]
    pub set_location: bool,
    #[prost(message, optional, tag = "8")]
    pub location: ::core::option::Option<GpsLocation>,
    #[prost(bool, tag = "9")]
    pub set_extra_data: bool,
    #[prost(string, tag = "10")]
    pub extra_data: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateProfileResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelHostingAgreementRequest {
    #[prost(bool, tag = "1")]
    pub redirect: bool,
    #[prost(bytes = "vec", tag = "2")]
    pub redirect_id: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelHostingAgreementResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetIdentityInformationRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub identity_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "2")]
    pub include_profile_image: bool,
    #[prost(bool, tag = "3")]
    pub include_thumbnail_image: bool,
    #[prost(bool, tag = "4")]
    pub include_application_services: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetIdentityInformationResponse {
    #[prost(bool, tag = "1")]
    pub is_hosted: bool,
    #[prost(bool, tag = "2")]
    pub is_target_hosting_server: bool,
    #[prost(bytes = "vec", tag = "3")]
    pub hosting_redirect_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "4")]
    pub is_online: bool,
    #[prost(bytes = "vec", tag = "5")]
    pub public_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "6")]
    pub version: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "7")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "8")]
    pub identity_type: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "9")]
    pub location: ::core::option::Option<GpsLocation>,
    #[prost(string, tag = "10")]
    pub extra_data: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "11")]
    pub profile_image: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "12")]
    pub thumbnail_image: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, repeated, tag = "13")]
    pub application_services: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

// Application services and the call relay.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationServiceAddRequest {
    #[prost(string, repeated, tag = "1")]
    pub service_names: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationServiceAddResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationServiceRemoveRequest {
    #[prost(string, tag = "1")]
    pub service_name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationServiceRemoveResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallIdentityApplicationServiceRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub identity_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "2")]
    pub service_name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallIdentityApplicationServiceResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub caller_token: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IncomingCallNotificationRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub caller_public_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "2")]
    pub service_name: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "3")]
    pub callee_token: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IncomingCallNotificationResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationServiceSendMessageRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub token: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub message: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationServiceSendMessageResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationServiceReceiveMessageNotificationRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub message: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationServiceReceiveMessageNotificationResponse {}

// Profile search.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProfileSearchRequest {
    #[prost(bool, tag = "1")]
    pub include_hosted_only: bool,
    #[prost(bool, tag = "2")]
    pub include_thumbnail_images: bool,
    #[prost(uint32, tag = "3")]
    pub max_response_record_count: u32,
    #[prost(uint32, tag = "4")]
    pub max_total_record_count: u32,
    /// Wildcard pattern over the identity type; `*` matches anything.
    #[prost(string, tag = "5")]
    pub identity_type: ::prost::alloc::string::String,
    /// Wildcard pattern over the profile name; `*` matches anything.
    #[prost(string, tag = "6")]
    pub name: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "7")]
    pub location: ::core::option::Option<GpsLocation>,
    /// Radius in metres around `location`; zero disables the filter.
    #[prost(uint32, tag = "8")]
    pub radius: u32,
    /// Regular expression over the extra data field; empty disables it.
    #[prost(string, tag = "9")]
    pub extra_data: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IdentityNetworkProfileInformation {
    #[prost(bool, tag = "1")]
    pub is_hosted: bool,
    #[prost(bytes = "vec", tag = "2")]
    pub identity_public_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub version: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "4")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub identity_type: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "6")]
    pub location: ::core::option::Option<GpsLocation>,
    #[prost(string, tag = "7")]
    pub extra_data: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "8")]
    pub thumbnail_image: ::prost::alloc::vec::Vec<u8>,
    /// Identifier of the server hosting this profile, empty when local.
    #[prost(bytes = "vec", tag = "9")]
    pub hosting_server_id: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProfileSearchResponse {
    #[prost(uint32, tag = "1")]
    pub total_record_count: u32,
    #[prost(uint32, tag = "2")]
    pub max_response_record_count: u32,
    #[prost(message, repeated, tag = "3")]
    pub profiles: ::prost::alloc::vec::Vec<IdentityNetworkProfileInformation>,
    #[prost(bytes = "vec", repeated, tag = "4")]
    pub covered_servers: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProfileSearchPartRequest {
    #[prost(uint32, tag = "1")]
    pub record_index: u32,
    #[prost(uint32, tag = "2")]
    pub record_count: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProfileSearchPartResponse {
    #[prost(uint32, tag = "1")]
    pub record_index: u32,
    #[prost(uint32, tag = "2")]
    pub record_count: u32,
    #[prost(message, repeated, tag = "3")]
    pub profiles: ::prost::alloc::vec::Vec<IdentityNetworkProfileInformation>,
}

// Relationship cards.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RelationshipCard {
    /// SHA-256 of this card serialized with `card_id` zeroed.
    #[prost(bytes = "vec", tag = "1")]
    pub card_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub card_version: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub issuer_public_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub recipient_public_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "5")]
    pub card_type: ::prost::alloc::string::String,
    #[prost(int64, tag = "6")]
    pub valid_from: i64,
    #[prost(int64, tag = "7")]
    pub valid_to: i64,
}

impl RelationshipCard {
    /// Copy of the card with the `card_id` field cleared, the form the
    /// identifier digest is computed over.
    pub fn normalized(&self) -> RelationshipCard {
        let mut card = self.clone();
        card.card_id.clear();
        card
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedRelationshipCard {
    #[prost(message, optional, tag = "1")]
    pub card: ::core::option::Option<RelationshipCard>,
    /// Signature of `card_id` by the issuer key.
    #[prost(bytes = "vec", tag = "2")]
    pub issuer_signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CardApplicationInformation {
    #[prost(bytes = "vec", tag = "1")]
    pub application_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub card_id: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddRelatedIdentityRequest {
    #[prost(message, optional, tag = "1")]
    pub application: ::core::option::Option<CardApplicationInformation>,
    /// Signature of the serialized application by the recipient key.
    #[prost(bytes = "vec", tag = "2")]
    pub application_signature: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub signed_card: ::core::option::Option<SignedRelationshipCard>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddRelatedIdentityResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveRelatedIdentityRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub application_id: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveRelatedIdentityResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetIdentityRelationshipsInformationRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub identity_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "2")]
    pub include_invalid: bool,
    /// Wildcard pattern over the card type; `*` matches anything.
    #[prost(string, tag = "3")]
    pub card_type: ::prost::alloc::string::String,
    /// Restricts to cards issued by this key; empty means any issuer.
    #[prost(bytes = "vec", tag = "4")]
    pub issuer_public_key: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IdentityRelationship {
    #[prost(message, optional, tag = "1")]
    pub application: ::core::option::Option<CardApplicationInformation>,
    #[prost(bytes = "vec", tag = "2")]
    pub application_signature: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub signed_card: ::core::option::Option<SignedRelationshipCard>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetIdentityRelationshipsInformationResponse {
    #[prost(message, repeated, tag = "1")]
    pub relationships: ::prost::alloc::vec::Vec<IdentityRelationship>,
}

// Neighborhood replication.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartNeighborhoodInitializationRequest {
    #[prost(uint32, tag = "1")]
    pub primary_port: u32,
    #[prost(uint32, tag = "2")]
    pub server_neighbor_port: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartNeighborhoodInitializationResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FinishNeighborhoodInitializationRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FinishNeighborhoodInitializationResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SharedProfileAddItem {
    #[prost(bytes = "vec", tag = "1")]
    pub identity_public_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub version: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "3")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub identity_type: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "5")]
    pub location: ::core::option::Option<GpsLocation>,
    #[prost(string, tag = "6")]
    pub extra_data: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "7")]
    pub thumbnail_image: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SharedProfileChangeItem {
    #[prost(bytes = "vec", tag = "1")]
    pub identity_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "2")]
    pub set_version: bool,
    #[prost(bytes = "vec", tag = "3")]
    pub version: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "4")]
    pub set_name: bool,
    #[prost(string, tag = "5")]
    pub name: ::prost::alloc::string::String,
    #[prost(bool, tag = "6")]
    pub set_location: bool,
    #[prost(message, optional, tag = "7")]
    pub location: ::core::option::Option<GpsLocation>,
    #[prost(bool, tag = "8")]
    pub set_extra_data: bool,
    #[prost(string, tag = "9")]
    pub extra_data: ::prost::alloc::string::String,
    #[prost(bool, tag = "10")]
    pub set_thumbnail_image: bool,
    #[prost(bytes = "vec", tag = "11")]
    pub thumbnail_image: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SharedProfileDeleteItem {
    #[prost(bytes = "vec", tag = "1")]
    pub identity_id: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SharedProfileRefreshAllItem {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SharedProfileUpdateItem {
    #[prost(oneof = "shared_profile_update_item::Action", tags = "1, 2, 3, 4")]
    pub action: ::core::option::Option<shared_profile_update_item::Action>,
}

pub mod shared_profile_update_item {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Action {
        #[prost(message, tag = "1")]
        Add(super::SharedProfileAddItem),
        #[prost(message, tag = "2")]
        Change(super::SharedProfileChangeItem),
        #[prost(message, tag = "3")]
        Delete(super::SharedProfileDeleteItem),
        #[prost(message, tag = "4")]
        Refresh(super::SharedProfileRefreshAllItem),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NeighborhoodSharedProfileUpdateRequest {
    #[prost(message, repeated, tag = "1")]
    pub items: ::prost::alloc::vec::Vec<SharedProfileUpdateItem>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NeighborhoodSharedProfileUpdateResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopNeighborhoodUpdatesRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopNeighborhoodUpdatesResponse {}
