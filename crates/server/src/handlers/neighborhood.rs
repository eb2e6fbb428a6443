//! Neighborhood replication: snapshot streaming to new followers, inbound
//! update application from initialized neighbors, and follower lifecycle.

use chrono::Utc;
use portico_proto::frame::{BATCH_SAFETY_MARGIN, MAX_FRAME_LEN};
use portico_proto::messages::{
    conversation_request, conversation_response, shared_profile_update_item,
    FinishNeighborhoodInitializationRequest, GpsLocation, NeighborhoodSharedProfileUpdateRequest,
    NeighborhoodSharedProfileUpdateResponse, SharedProfileAddItem, SharedProfileChangeItem,
    SharedProfileUpdateItem, StartNeighborhoodInitializationRequest,
    StartNeighborhoodInitializationResponse, Status, StopNeighborhoodUpdatesResponse,
};
use portico_proto::{Message, Response};
use portico_storage::{
    Follower, FollowerAdmission, HostedIdentity, ImageStore, NeighborApplyItem,
    NeighborIdentity, NeighborIdentityChange, NEIGHBOR_APPLY_BATCH_LEN,
};
use prost::Message as ProstMessage;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::dispatch::{HandlerResult, Outcome};
use crate::handlers::identity::{
    valid_image_format, MAX_EXTRA_DATA_BYTES, MAX_NAME_BYTES, MAX_THUMBNAIL_BYTES, MAX_TYPE_BYTES,
};
use crate::node::SharedNode;
use crate::session::SessionHandle;
use crate::util::abbrev_id;

/// How long the initialization stream waits for each batch acknowledgement.
const INIT_BATCH_ACK_SECONDS: u64 = 120;
/// Envelope overhead reserved on top of the packed items.
const BATCH_ENVELOPE_ALLOWANCE: usize = 64;

/// `StartNeighborhoodInitialization`: admission gates, snapshot and
/// follower row in one transaction, then the batch stream on this same
/// connection. The OK response is enqueued before the first batch.
pub async fn handle_start_initialization(
    node: &SharedNode,
    session: &SessionHandle,
    message_id: u32,
    request: StartNeighborhoodInitializationRequest,
) -> HandlerResult {
    if request.primary_port == 0 || request.primary_port > u32::from(u16::MAX) {
        return (
            Some(Response::error(Status::InvalidValue, "primaryPort")),
            Outcome::Continue,
        );
    }
    if request.server_neighbor_port == 0 || request.server_neighbor_port > u32::from(u16::MAX) {
        return (
            Some(Response::error(Status::InvalidValue, "srNeighborPort")),
            Outcome::Continue,
        );
    }
    let (follower_id, already_initializing) = {
        let state = session.state.lock().await;
        (state.identity_id.unwrap_or_default(), state.neighborhood_init)
    };
    if already_initializing {
        return (Some(Response::error(Status::Busy, "")), Outcome::Continue);
    }
    let follower = Follower {
        follower_id,
        ip: session.remote.ip().to_string(),
        primary_port: request.primary_port as u16,
        neighbor_port: request.server_neighbor_port as u16,
        last_refresh_at: None,
    };
    let admission = match node
        .storage
        .admit_follower(
            &follower,
            node.config.max_follower_servers,
            node.config.neighborhood_init_parallelism,
            Utc::now(),
        )
        .await
    {
        Ok(admission) => admission,
        Err(err) => {
            warn!(error = %err, "follower admission failed");
            return (
                Some(Response::error(Status::Internal, "")),
                Outcome::Continue,
            );
        }
    };
    let snapshot = match admission {
        FollowerAdmission::Accepted(snapshot) => snapshot,
        FollowerAdmission::TooManyFollowers => {
            return (
                Some(Response::error(Status::Rejected, "")),
                Outcome::Continue,
            )
        }
        FollowerAdmission::TooManyInitializations => {
            return (Some(Response::error(Status::Busy, "")), Outcome::Continue)
        }
    };
    {
        let mut state = session.state.lock().await;
        state.neighborhood_init = true;
    }
    info!(
        follower = %abbrev_id(&follower_id),
        profiles = snapshot.len(),
        "neighborhood initialization started"
    );
    // The response must precede the first batch on the wire; both ride the
    // same ordered outbound queue.
    let response = Response::conversation_ok(
        conversation_response::Part::StartNeighborhoodInitialization(
            StartNeighborhoodInitializationResponse {},
        ),
    );
    if session
        .send(Message::response(message_id, response))
        .await
        .is_err()
    {
        return (None, Outcome::Close);
    }
    let node = node.clone();
    let session = session.clone();
    tokio::spawn(async move {
        stream_initialization(node, session, follower_id, snapshot).await;
    });
    (None, Outcome::Continue)
}

async fn stream_initialization(
    node: SharedNode,
    session: SessionHandle,
    follower_id: [u8; 32],
    snapshot: Vec<HostedIdentity>,
) {
    let mut items = Vec::with_capacity(snapshot.len());
    for identity in &snapshot {
        items.push(SharedProfileUpdateItem {
            action: Some(shared_profile_update_item::Action::Add(
                add_item_for(&node, identity).await,
            )),
        });
    }
    let ack_wait = Duration::from_secs(INIT_BATCH_ACK_SECONDS);
    for batch in pack_update_batches(items) {
        let part = conversation_request::Part::NeighborhoodSharedProfileUpdate(
            NeighborhoodSharedProfileUpdateRequest { items: batch },
        );
        let receiver = match session.request(part).await {
            Ok(receiver) => receiver,
            Err(_) => return abort_initialization(&node, &session, &follower_id).await,
        };
        match timeout(ack_wait, receiver).await {
            Ok(Ok(answer)) if answer.status == Status::Ok => {}
            _ => return abort_initialization(&node, &session, &follower_id).await,
        }
    }
    let finish = conversation_request::Part::FinishNeighborhoodInitialization(
        FinishNeighborhoodInitializationRequest {},
    );
    let receiver = match session.request(finish).await {
        Ok(receiver) => receiver,
        Err(_) => return abort_initialization(&node, &session, &follower_id).await,
    };
    match timeout(ack_wait, receiver).await {
        Ok(Ok(answer)) if answer.status == Status::Ok => {}
        _ => return abort_initialization(&node, &session, &follower_id).await,
    }
    if let Err(err) = node
        .storage
        .finish_follower_init(&follower_id, Utc::now())
        .await
    {
        warn!(error = %err, "finishing follower initialization failed");
        return abort_initialization(&node, &session, &follower_id).await;
    }
    {
        let mut state = session.state.lock().await;
        state.neighborhood_init = false;
    }
    node.worker_signal.notify_one();
    info!(
        follower = %abbrev_id(&follower_id),
        "neighborhood initialization finished"
    );
}

async fn abort_initialization(node: &SharedNode, session: &SessionHandle, follower_id: &[u8; 32]) {
    warn!(
        follower = %abbrev_id(follower_id),
        "neighborhood initialization aborted"
    );
    if let Err(err) = node.storage.remove_follower(follower_id).await {
        warn!(error = %err, "follower removal failed");
    }
    session.force_close();
}

/// Builds the snapshot item for one hosted identity, inlining its search
/// thumbnail when one exists.
pub async fn add_item_for(node: &SharedNode, identity: &HostedIdentity) -> SharedProfileAddItem {
    let thumbnail_image = match &identity.thumbnail_image_id {
        Some(image_id) => node.images.read(image_id).await.ok().flatten().unwrap_or_default(),
        None => Vec::new(),
    };
    SharedProfileAddItem {
        identity_public_key: identity.public_key.clone(),
        version: identity.version.to_vec(),
        name: identity.name.clone(),
        identity_type: identity.identity_type.clone(),
        location: match (identity.latitude, identity.longitude) {
            (Some(latitude), Some(longitude)) => Some(GpsLocation {
                latitude,
                longitude,
            }),
            _ => None,
        },
        extra_data: identity.extra_data.clone(),
        thumbnail_image,
    }
}

/// Builds a change item covering the full current state of an identity.
pub async fn change_item_for(
    node: &SharedNode,
    identity: &HostedIdentity,
) -> SharedProfileChangeItem {
    let (set_thumbnail_image, thumbnail_image) = match &identity.thumbnail_image_id {
        Some(image_id) => (
            true,
            node.images.read(image_id).await.ok().flatten().unwrap_or_default(),
        ),
        None => (true, Vec::new()),
    };
    SharedProfileChangeItem {
        identity_id: identity.identity_id.to_vec(),
        set_version: true,
        version: identity.version.to_vec(),
        set_name: true,
        name: identity.name.clone(),
        set_location: identity.latitude.is_some() && identity.longitude.is_some(),
        location: match (identity.latitude, identity.longitude) {
            (Some(latitude), Some(longitude)) => Some(GpsLocation {
                latitude,
                longitude,
            }),
            _ => None,
        },
        set_extra_data: true,
        extra_data: identity.extra_data.clone(),
        set_thumbnail_image,
        thumbnail_image,
    }
}

/// Packs items into batches that each encode below the frame cap minus the
/// safety margin.
pub fn pack_update_batches(items: Vec<SharedProfileUpdateItem>) -> Vec<Vec<SharedProfileUpdateItem>> {
    let cap = MAX_FRAME_LEN - BATCH_SAFETY_MARGIN - BATCH_ENVELOPE_ALLOWANCE;
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_size = 0usize;
    for item in items {
        let item_len = item.encoded_len();
        let field_len = 1 + prost::length_delimiter_len(item_len) + item_len;
        if !current.is_empty() && current_size + field_len > cap {
            batches.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += field_len;
        current.push(item);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

struct StagedItems {
    /// Items that passed validation, with their original indices.
    apply: Vec<(usize, NeighborApplyItem)>,
    /// Image ids written to disk during validation.
    staged_images: Vec<[u8; 16]>,
    refresh: bool,
    /// First validation failure, as the details string.
    failure: Option<String>,
    internal: bool,
}

/// `NeighborhoodSharedProfileUpdate` received on the neighbor listener:
/// only an initialized neighbor may push updates.
pub async fn handle_shared_profile_update(
    node: &SharedNode,
    session: &SessionHandle,
    request: NeighborhoodSharedProfileUpdateRequest,
) -> HandlerResult {
    let neighbor_id = {
        let state = session.state.lock().await;
        state.identity_id.unwrap_or_default()
    };
    match node.storage.load_neighbor(&neighbor_id).await {
        Ok(Some(neighbor)) if neighbor.last_refresh_at.is_some() => {}
        Ok(_) => {
            return (
                Some(Response::error(Status::Rejected, "neighbor")),
                Outcome::Continue,
            )
        }
        Err(err) => {
            warn!(error = %err, "neighbor lookup failed");
            return (
                Some(Response::error(Status::Internal, "")),
                Outcome::Continue,
            );
        }
    }
    let response = apply_shared_profiles(node, &neighbor_id, &request.items).await;
    (Some(response), Outcome::Continue)
}

/// Two-pass application of an update bundle: validate and stage images,
/// then apply in bounded transactions; finally reconcile blob files.
/// Also used by the neighbor bootstrap client, which skips the
/// initialized-neighbor gate.
pub async fn apply_shared_profiles(
    node: &SharedNode,
    neighbor_id: &[u8; 32],
    items: &[SharedProfileUpdateItem],
) -> Response {
    let staged = validate_and_stage(node, items).await;
    if staged.refresh {
        if let Err(err) = node
            .storage
            .bump_neighbor_refresh(neighbor_id, Utc::now())
            .await
        {
            warn!(error = %err, "neighbor refresh bump failed");
        }
    }
    let mut kept: HashSet<[u8; 16]> = HashSet::new();
    let mut removed: Vec<[u8; 16]> = Vec::new();
    let mut apply_failure: Option<String> = None;
    let mut internal = staged.internal;
    if !internal {
        for chunk in staged.apply.chunks(NEIGHBOR_APPLY_BATCH_LEN) {
            let chunk_items: Vec<NeighborApplyItem> =
                chunk.iter().map(|(_, item)| item.clone()).collect();
            match node
                .storage
                .apply_neighbor_batch(neighbor_id, &chunk_items, Utc::now())
                .await
            {
                Ok(outcome) => {
                    kept.extend(outcome.kept_images);
                    removed.extend(outcome.removed_images);
                    if let Some(failure) = outcome.failure {
                        let original_index = chunk[failure.index].0;
                        apply_failure = Some(format!("{}.{}", original_index, failure.field));
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "neighbor batch apply failed");
                    internal = true;
                    break;
                }
            }
        }
    }
    // Unlink everything staged but not kept by a committed batch, plus the
    // blobs replaced or deleted by committed items. Failures are logged by
    // the store and never fatal.
    for image in &staged.staged_images {
        if !kept.contains(image) {
            node.images.remove(image).await;
        }
    }
    for image in &removed {
        node.images.remove(image).await;
    }
    if internal {
        return Response::error(Status::Internal, "");
    }
    if let Some(details) = apply_failure.or(staged.failure) {
        return Response::error(Status::InvalidValue, &details);
    }
    Response::conversation_ok(
        conversation_response::Part::NeighborhoodSharedProfileUpdate(
            NeighborhoodSharedProfileUpdateResponse {},
        ),
    )
}

async fn validate_and_stage(node: &SharedNode, items: &[SharedProfileUpdateItem]) -> StagedItems {
    let mut staged = StagedItems {
        apply: Vec::new(),
        staged_images: Vec::new(),
        refresh: false,
        failure: None,
        internal: false,
    };
    for (index, item) in items.iter().enumerate() {
        let Some(action) = &item.action else {
            staged.failure = Some(format!("{index}.action"));
            break;
        };
        match action {
            shared_profile_update_item::Action::Refresh(_) => {
                staged.refresh = true;
            }
            shared_profile_update_item::Action::Add(add) => {
                if let Some(field) = validate_add(add) {
                    staged.failure = Some(format!("{index}.add.{field}"));
                    break;
                }
                let thumbnail_image_id = if add.thumbnail_image.is_empty() {
                    None
                } else {
                    match stage_image(node, &add.thumbnail_image).await {
                        Ok(image_id) => {
                            staged.staged_images.push(image_id);
                            Some(image_id)
                        }
                        Err(()) => {
                            staged.internal = true;
                            break;
                        }
                    }
                };
                let location = add.location.as_ref();
                staged.apply.push((
                    index,
                    NeighborApplyItem::Add(NeighborIdentity {
                        identity_id: portico_crypto::identity_id(&add.identity_public_key),
                        neighbor_id: [0u8; 32],
                        public_key: add.identity_public_key.clone(),
                        version: version_of(&add.version),
                        name: add.name.clone(),
                        identity_type: add.identity_type.clone(),
                        latitude: location.map(|l| l.latitude),
                        longitude: location.map(|l| l.longitude),
                        extra_data: add.extra_data.clone(),
                        thumbnail_image_id,
                        updated_at: Utc::now(),
                    }),
                ));
            }
            shared_profile_update_item::Action::Change(change) => {
                if let Some(field) = validate_change(change) {
                    staged.failure = Some(format!("{index}.change.{field}"));
                    break;
                }
                let thumbnail_image = if change.set_thumbnail_image {
                    if change.thumbnail_image.is_empty() {
                        Some(None)
                    } else {
                        match stage_image(node, &change.thumbnail_image).await {
                            Ok(image_id) => {
                                staged.staged_images.push(image_id);
                                Some(Some(image_id))
                            }
                            Err(()) => {
                                staged.internal = true;
                                break;
                            }
                        }
                    }
                } else {
                    None
                };
                let identity_id = <[u8; 32]>::try_from(change.identity_id.as_slice())
                    .unwrap_or_default();
                staged.apply.push((
                    index,
                    NeighborApplyItem::Change(NeighborIdentityChange {
                        identity_id,
                        version: change.set_version.then(|| version_of(&change.version)),
                        name: change.set_name.then(|| change.name.clone()),
                        location: change
                            .set_location
                            .then(|| change.location.as_ref())
                            .flatten()
                            .map(|l| (l.latitude, l.longitude)),
                        extra_data: change.set_extra_data.then(|| change.extra_data.clone()),
                        thumbnail_image,
                    }),
                ));
            }
            shared_profile_update_item::Action::Delete(delete) => {
                let Ok(identity_id) = <[u8; 32]>::try_from(delete.identity_id.as_slice()) else {
                    staged.failure = Some(format!("{index}.delete.identityNetworkId"));
                    break;
                };
                staged.apply.push((index, NeighborApplyItem::Delete { identity_id }));
            }
        }
    }
    staged
}

fn version_of(raw: &[u8]) -> [u8; 3] {
    <[u8; 3]>::try_from(raw).unwrap_or([1, 0, 0])
}

fn validate_add(add: &SharedProfileAddItem) -> Option<&'static str> {
    if add.identity_public_key.len() != portico_crypto::PUBLIC_KEY_LEN {
        return Some("identityPublicKey");
    }
    if add.version.len() != 3 || add.version == [0, 0, 0] {
        return Some("version");
    }
    if add.name.is_empty() || add.name.len() > MAX_NAME_BYTES {
        return Some("name");
    }
    if add.identity_type.len() > MAX_TYPE_BYTES {
        return Some("type");
    }
    if let Some(location) = &add.location {
        if !(-90.0..=90.0).contains(&location.latitude) {
            return Some("latitude");
        }
        if !(-180.0..=180.0).contains(&location.longitude) {
            return Some("longitude");
        }
    }
    if add.extra_data.len() > MAX_EXTRA_DATA_BYTES {
        return Some("extraData");
    }
    if !add.thumbnail_image.is_empty()
        && (add.thumbnail_image.len() > MAX_THUMBNAIL_BYTES
            || !valid_image_format(&add.thumbnail_image))
    {
        return Some("thumbnailImage");
    }
    None
}

fn validate_change(change: &SharedProfileChangeItem) -> Option<&'static str> {
    if change.identity_id.len() != 32 {
        return Some("identityNetworkId");
    }
    if !(change.set_version
        || change.set_name
        || change.set_location
        || change.set_extra_data
        || change.set_thumbnail_image)
    {
        return Some("set*");
    }
    if change.set_version && (change.version.len() != 3 || change.version == [0, 0, 0]) {
        return Some("version");
    }
    if change.set_name && (change.name.is_empty() || change.name.len() > MAX_NAME_BYTES) {
        return Some("name");
    }
    if change.set_location {
        let Some(location) = &change.location else {
            return Some("location");
        };
        if !(-90.0..=90.0).contains(&location.latitude) {
            return Some("latitude");
        }
        if !(-180.0..=180.0).contains(&location.longitude) {
            return Some("longitude");
        }
    }
    if change.set_extra_data && change.extra_data.len() > MAX_EXTRA_DATA_BYTES {
        return Some("extraData");
    }
    if change.set_thumbnail_image
        && !change.thumbnail_image.is_empty()
        && (change.thumbnail_image.len() > MAX_THUMBNAIL_BYTES
            || !valid_image_format(&change.thumbnail_image))
    {
        return Some("thumbnailImage");
    }
    None
}

async fn stage_image(node: &SharedNode, data: &[u8]) -> Result<[u8; 16], ()> {
    let image_id = ImageStore::new_image_id();
    match node.images.write(&image_id, data).await {
        Ok(()) => Ok(image_id),
        Err(err) => {
            warn!(error = %err, "staging neighbor image failed");
            Err(())
        }
    }
}

/// `StopNeighborhoodUpdates`: drops the caller's follower registration.
pub async fn handle_stop_updates(node: &SharedNode, session: &SessionHandle) -> HandlerResult {
    let follower_id = {
        let state = session.state.lock().await;
        state.identity_id.unwrap_or_default()
    };
    match node.storage.remove_follower(&follower_id).await {
        Ok(true) => {
            info!(follower = %abbrev_id(&follower_id), "follower unsubscribed");
            (
                Some(Response::conversation_ok(
                    conversation_response::Part::StopNeighborhoodUpdates(
                        StopNeighborhoodUpdatesResponse {},
                    ),
                )),
                Outcome::Continue,
            )
        }
        Ok(false) => (
            Some(Response::error(Status::NotFound, "")),
            Outcome::Continue,
        ),
        Err(err) => {
            warn!(error = %err, "follower removal failed");
            (
                Some(Response::error(Status::Internal, "")),
                Outcome::Continue,
            )
        }
    }
}
