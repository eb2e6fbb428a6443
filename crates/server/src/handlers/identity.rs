//! Hosted identity handlers: registration, check-in, verification, profile
//! updates, cancellation, lookups and the per-session application service
//! set.

use chrono::Utc;
use portico_proto::messages::{
    conversation_response, ApplicationServiceAddRequest, ApplicationServiceAddResponse,
    ApplicationServiceRemoveRequest, ApplicationServiceRemoveResponse,
    CancelHostingAgreementRequest, CancelHostingAgreementResponse, CheckInRequest, CheckInResponse,
    GetIdentityInformationRequest, GetIdentityInformationResponse, GpsLocation,
    RegisterHostingRequest, RegisterHostingResponse, Status, UpdateProfileRequest,
    UpdateProfileResponse, VerifyIdentityRequest, VerifyIdentityResponse,
};
use portico_proto::Response;
use portico_storage::{ImageStore, ProfileChanges, RegisterOutcome, StorageError};
use prost::Message as ProstMessage;
use tracing::{info, warn};

use crate::dispatch::{HandlerResult, Outcome};
use crate::node::SharedNode;
use crate::session::{ConversationStatus, SessionHandle};
use crate::util::abbrev_id;

pub const MAX_NAME_BYTES: usize = 64;
pub const MAX_TYPE_BYTES: usize = 64;
pub const MAX_EXTRA_DATA_BYTES: usize = 512;
pub const MAX_IMAGE_BYTES: usize = 128 * 1024;
/// An uploaded image doubles as the search thumbnail when it fits.
pub const MAX_THUMBNAIL_BYTES: usize = 32 * 1024;
pub const MAX_SERVICE_NAME_BYTES: usize = 32;

const HOSTING_IDENTITY_TYPES: &[&str] = &["individual", "organization", "device"];

/// PNG or JPEG magic, the only formats profiles may carry.
pub fn valid_image_format(data: &[u8]) -> bool {
    data.starts_with(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a])
        || data.starts_with(&[0xff, 0xd8, 0xff])
}

fn invalid(details: &str) -> HandlerResult {
    (
        Some(Response::error(Status::InvalidValue, details)),
        Outcome::Continue,
    )
}

fn internal(context: &str, err: &StorageError) -> HandlerResult {
    warn!(error = %err, context, "storage failure");
    (
        Some(Response::error(Status::Internal, "")),
        Outcome::Continue,
    )
}

/// `RegisterHosting`: creates or reactivates a hosted identity under a
/// hosting plan contract. Contract validation covers the key binding, the
/// identity type and the contract signature; there is no network-wide plan
/// registry to consult beyond that.
pub async fn handle_register_hosting(
    node: &SharedNode,
    session: &SessionHandle,
    request: RegisterHostingRequest,
) -> HandlerResult {
    let Some(contract) = request.contract else {
        return invalid("contract");
    };
    let (public_key, identity_id) = {
        let state = session.state.lock().await;
        (
            state.public_key.clone().unwrap_or_default(),
            state.identity_id.unwrap_or_default(),
        )
    };
    if contract.identity_public_key != public_key {
        return invalid("contract.identityPublicKey");
    }
    if !HOSTING_IDENTITY_TYPES.contains(&contract.identity_type.as_str()) {
        return invalid("contract.identityType");
    }
    let mut normalized = contract.clone();
    normalized.signature.clear();
    if portico_crypto::verify_signature(
        &public_key,
        &normalized.encode_to_vec(),
        &contract.signature,
    )
    .is_err()
    {
        return (
            Some(Response::error(Status::InvalidSignature, "contract.signature")),
            Outcome::Continue,
        );
    }
    match node
        .storage
        .register_hosting(
            &identity_id,
            &public_key,
            Utc::now(),
            node.config.max_hosted_identities,
        )
        .await
    {
        Ok(RegisterOutcome::Created) | Ok(RegisterOutcome::Reactivated) => {
            info!(identity = %abbrev_id(&identity_id), "hosting registered");
            (
                Some(Response::conversation_ok(
                    conversation_response::Part::RegisterHosting(RegisterHostingResponse {
                        contract: Some(contract),
                    }),
                )),
                Outcome::Continue,
            )
        }
        Ok(RegisterOutcome::AlreadyActive) => (
            Some(Response::error(Status::AlreadyExists, "")),
            Outcome::Continue,
        ),
        Ok(RegisterOutcome::QuotaExceeded) => (
            Some(Response::error(Status::QuotaExceeded, "")),
            Outcome::Continue,
        ),
        Err(err) => internal("register_hosting", &err),
    }
}

/// Checks a signature over the server challenge issued at `StartConversation`.
async fn verify_challenge_signature(
    session: &SessionHandle,
    challenge: &[u8],
    signature: &[u8],
) -> Result<(), HandlerResult> {
    let (server_challenge, public_key) = {
        let state = session.state.lock().await;
        (state.challenge, state.public_key.clone().unwrap_or_default())
    };
    let Some(server_challenge) = server_challenge else {
        return Err(invalid("challenge"));
    };
    if challenge != server_challenge.as_slice() {
        return Err(invalid("challenge"));
    }
    if portico_crypto::verify_signature(&public_key, challenge, signature).is_err() {
        return Err((
            Some(Response::error(Status::InvalidSignature, "signature")),
            Outcome::Continue,
        ));
    }
    Ok(())
}

/// `VerifyIdentity`: public key recovery against the stored challenge.
pub async fn handle_verify_identity(
    session: &SessionHandle,
    request: VerifyIdentityRequest,
) -> HandlerResult {
    if let Err(response) =
        verify_challenge_signature(session, &request.challenge, &request.signature).await
    {
        return response;
    }
    let mut state = session.state.lock().await;
    state.status = ConversationStatus::Verified;
    (
        Some(Response::conversation_ok(
            conversation_response::Part::VerifyIdentity(VerifyIdentityResponse {}),
        )),
        Outcome::Continue,
    )
}

/// `CheckIn`: like `VerifyIdentity` plus the hosted-identity lookup; binds
/// this connection as the identity's online session.
pub async fn handle_check_in(
    node: &SharedNode,
    session: &SessionHandle,
    request: CheckInRequest,
) -> HandlerResult {
    if let Err(response) =
        verify_challenge_signature(session, &request.challenge, &request.signature).await
    {
        return response;
    }
    let identity_id = {
        let state = session.state.lock().await;
        state.identity_id.unwrap_or_default()
    };
    let hosted = match node.storage.load_hosted(&identity_id).await {
        Ok(hosted) => hosted,
        Err(err) => return internal("check_in", &err),
    };
    match hosted {
        Some(identity) if identity.expiration_at.is_none() => {}
        _ => {
            return (
                Some(Response::error(Status::NotFound, "")),
                Outcome::Continue,
            )
        }
    }
    {
        let mut state = session.state.lock().await;
        state.status = ConversationStatus::Authenticated;
        state.checked_in = true;
    }
    if let Some(displaced) = node
        .registry
        .check_in(identity_id, session.clone())
        .await
    {
        info!(
            identity = %abbrev_id(&identity_id),
            "displacing previous checked-in session"
        );
        displaced.force_close();
    }
    (
        Some(Response::conversation_ok(conversation_response::Part::CheckIn(
            CheckInResponse {},
        ))),
        Outcome::Continue,
    )
}

/// `UpdateProfile`: partial update guarded by set-flags. Image blobs are
/// written before the database transaction; replaced blobs are unlinked only
/// after the commit. A crash in between leaks a file for the orphan sweep.
pub async fn handle_update_profile(
    node: &SharedNode,
    session: &SessionHandle,
    request: UpdateProfileRequest,
) -> HandlerResult {
    let identity_id = {
        let state = session.state.lock().await;
        state.identity_id.unwrap_or_default()
    };
    let hosted = match node.storage.load_hosted(&identity_id).await {
        Ok(Some(hosted)) => hosted,
        Ok(None) => {
            return (
                Some(Response::error(Status::NotFound, "")),
                Outcome::Continue,
            )
        }
        Err(err) => return internal("update_profile", &err),
    };
    if hosted.expiration_at.is_some() {
        return (
            Some(Response::error(Status::NotFound, "")),
            Outcome::Continue,
        );
    }
    if !(request.set_version
        || request.set_name
        || request.set_image
        || request.set_location
        || request.set_extra_data)
    {
        return invalid("set*");
    }
    if !hosted.is_initialized() {
        if !request.set_version {
            return invalid("setVersion");
        }
        if !request.set_name {
            return invalid("setName");
        }
        if !request.set_location {
            return invalid("setLocation");
        }
    }
    let mut changes = ProfileChanges::default();
    if request.set_version {
        if request.version != portico_proto::PROTOCOL_VERSION {
            return invalid("version");
        }
        changes.version = Some(portico_proto::PROTOCOL_VERSION);
    }
    if request.set_name {
        if request.name.len() > MAX_NAME_BYTES || request.name.is_empty() {
            return invalid("name");
        }
        changes.name = Some(request.name.clone());
    }
    if request.set_location {
        let Some(location) = &request.location else {
            return invalid("location");
        };
        if !(-90.0..=90.0).contains(&location.latitude) {
            return invalid("latitude");
        }
        if !(-180.0..=180.0).contains(&location.longitude) {
            return invalid("longitude");
        }
        changes.location = Some((location.latitude, location.longitude));
    }
    if request.set_extra_data {
        if request.extra_data.len() > MAX_EXTRA_DATA_BYTES {
            return invalid("extraData");
        }
        changes.extra_data = Some(request.extra_data.clone());
    }
    if request.set_image {
        if request.image.is_empty() {
            changes.profile_image = Some(None);
            changes.thumbnail_image = Some(None);
        } else {
            if request.image.len() > MAX_IMAGE_BYTES || !valid_image_format(&request.image) {
                return invalid("image");
            }
            let profile_id = ImageStore::new_image_id();
            if let Err(err) = node.images.write(&profile_id, &request.image).await {
                warn!(error = %err, "profile image write failed");
                return (
                    Some(Response::error(Status::Internal, "")),
                    Outcome::Continue,
                );
            }
            changes.profile_image = Some(Some(profile_id));
            if request.image.len() <= MAX_THUMBNAIL_BYTES {
                let thumbnail_id = ImageStore::new_image_id();
                if let Err(err) = node.images.write(&thumbnail_id, &request.image).await {
                    warn!(error = %err, "thumbnail image write failed");
                    return (
                        Some(Response::error(Status::Internal, "")),
                        Outcome::Continue,
                    );
                }
                changes.thumbnail_image = Some(Some(thumbnail_id));
            } else {
                changes.thumbnail_image = Some(None);
            }
        }
    }
    let commit = match node
        .storage
        .update_profile(&identity_id, &changes, Utc::now())
        .await
    {
        Ok(commit) => commit,
        Err(StorageError::Missing) => {
            return (
                Some(Response::error(Status::NotFound, "")),
                Outcome::Continue,
            )
        }
        Err(err) => return internal("update_profile", &err),
    };
    // Only after the commit may the replaced blobs disappear.
    for image in &commit.removed_images {
        node.images.remove(image).await;
    }
    node.worker_signal.notify_one();
    info!(
        identity = %abbrev_id(&identity_id),
        first = commit.first_initialization,
        "profile updated"
    );
    (
        Some(Response::conversation_ok(
            conversation_response::Part::UpdateProfile(UpdateProfileResponse {}),
        )),
        Outcome::Continue,
    )
}

/// `CancelHostingAgreement`: immediate expiry, or a redirect that keeps the
/// profile queryable for the retention window.
pub async fn handle_cancel_hosting(
    node: &SharedNode,
    session: &SessionHandle,
    request: CancelHostingAgreementRequest,
) -> HandlerResult {
    let identity_id = {
        let state = session.state.lock().await;
        state.identity_id.unwrap_or_default()
    };
    let redirect = if request.redirect {
        if request.redirect_id.len() != 32 {
            return invalid("redirectId");
        }
        Some(request.redirect_id.clone())
    } else {
        None
    };
    match node
        .storage
        .cancel_hosting(&identity_id, redirect, Utc::now())
        .await
    {
        Ok(()) => {
            node.worker_signal.notify_one();
            info!(identity = %abbrev_id(&identity_id), "hosting cancelled");
            (
                Some(Response::conversation_ok(
                    conversation_response::Part::CancelHostingAgreement(
                        CancelHostingAgreementResponse {},
                    ),
                )),
                Outcome::Continue,
            )
        }
        Err(StorageError::Missing) => (
            Some(Response::error(Status::NotFound, "")),
            Outcome::Continue,
        ),
        Err(err) => internal("cancel_hosting", &err),
    }
}

/// `GetIdentityInformation`: profile fields, online flag, optional images
/// and application services of a hosted identity.
pub async fn handle_get_identity_information(
    node: &SharedNode,
    request: GetIdentityInformationRequest,
) -> HandlerResult {
    let Ok(identity_id) = <[u8; 32]>::try_from(request.identity_id.as_slice()) else {
        return invalid("identityNetworkId");
    };
    let hosted = match node.storage.load_hosted(&identity_id).await {
        Ok(Some(hosted)) => hosted,
        Ok(None) => {
            return (
                Some(Response::error(Status::NotFound, "")),
                Outcome::Continue,
            )
        }
        Err(err) => return internal("get_identity_information", &err),
    };
    let is_hosted = hosted.expiration_at.is_none();
    let is_target = hosted.hosting_redirect_id.is_none();
    let online_session = if is_hosted {
        node.registry.find_checked_in(&identity_id).await
    } else {
        None
    };
    let application_services = match (&online_session, request.include_application_services) {
        (Some(session), true) => {
            let state = session.state.lock().await;
            state.application_services.iter().cloned().collect()
        }
        _ => Vec::new(),
    };
    let profile_image = match (&hosted.profile_image_id, request.include_profile_image) {
        (Some(image_id), true) => match node.images.read(image_id).await {
            Ok(data) => data.unwrap_or_default(),
            Err(err) => {
                warn!(error = %err, "profile image read failed");
                Vec::new()
            }
        },
        _ => Vec::new(),
    };
    let thumbnail_image = match (&hosted.thumbnail_image_id, request.include_thumbnail_image) {
        (Some(image_id), true) => match node.images.read(image_id).await {
            Ok(data) => data.unwrap_or_default(),
            Err(err) => {
                warn!(error = %err, "thumbnail image read failed");
                Vec::new()
            }
        },
        _ => Vec::new(),
    };
    let location = match (hosted.latitude, hosted.longitude) {
        (Some(latitude), Some(longitude)) => Some(GpsLocation {
            latitude,
            longitude,
        }),
        _ => None,
    };
    (
        Some(Response::conversation_ok(
            conversation_response::Part::GetIdentityInformation(GetIdentityInformationResponse {
                is_hosted,
                is_target_hosting_server: is_target,
                hosting_redirect_id: hosted.hosting_redirect_id.unwrap_or_default(),
                is_online: online_session.is_some(),
                public_key: hosted.public_key,
                version: hosted.version.to_vec(),
                name: hosted.name,
                identity_type: hosted.identity_type,
                location,
                extra_data: hosted.extra_data,
                profile_image,
                thumbnail_image,
                application_services,
            }),
        )),
        Outcome::Continue,
    )
}

/// `ApplicationServiceAdd`: extends the session's service set within caps.
pub async fn handle_application_service_add(
    node: &SharedNode,
    session: &SessionHandle,
    request: ApplicationServiceAddRequest,
) -> HandlerResult {
    if request.service_names.is_empty() {
        return invalid("serviceNames");
    }
    for name in &request.service_names {
        if name.is_empty() || name.len() > MAX_SERVICE_NAME_BYTES {
            return invalid("serviceNames");
        }
    }
    let mut state = session.state.lock().await;
    let mut combined = state.application_services.clone();
    for name in &request.service_names {
        combined.insert(name.clone());
    }
    if combined.len() > node.config.max_application_services as usize {
        return (
            Some(Response::error(Status::QuotaExceeded, "")),
            Outcome::Continue,
        );
    }
    state.application_services = combined;
    (
        Some(Response::conversation_ok(
            conversation_response::Part::ApplicationServiceAdd(ApplicationServiceAddResponse {}),
        )),
        Outcome::Continue,
    )
}

/// `ApplicationServiceRemove`: drops one service name from the session.
pub async fn handle_application_service_remove(
    session: &SessionHandle,
    request: ApplicationServiceRemoveRequest,
) -> HandlerResult {
    let mut state = session.state.lock().await;
    if !state.application_services.remove(&request.service_name) {
        return (
            Some(Response::error(Status::NotFound, "serviceName")),
            Outcome::Continue,
        );
    }
    (
        Some(Response::conversation_ok(
            conversation_response::Part::ApplicationServiceRemove(
                ApplicationServiceRemoveResponse {},
            ),
        )),
        Outcome::Continue,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_magic_detection() {
        let png = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0];
        let jpeg = [0xff, 0xd8, 0xff, 0xe0, 0, 0];
        assert!(valid_image_format(&png));
        assert!(valid_image_format(&jpeg));
        assert!(!valid_image_format(b"GIF89a"));
        assert!(!valid_image_format(&[]));
    }
}
