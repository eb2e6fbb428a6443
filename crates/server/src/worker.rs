//! Neighborhood action worker: drains the transactional action queue and
//! delivers profile updates to followers over short-lived authenticated
//! connections, FIFO per follower, with exponential backoff and eviction
//! of followers that stay unreachable.

use chrono::{Duration, Utc};
use portico_proto::messages::{
    conversation_request, shared_profile_update_item, NeighborhoodSharedProfileUpdateRequest,
    SharedProfileDeleteItem, SharedProfileUpdateItem,
};
use portico_storage::{ActionType, NeighborhoodAction};
use std::time::Duration as StdDuration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::handlers::neighborhood::{add_item_for, change_item_for};
use crate::node::{ServerError, SharedNode};
use crate::peer::PeerConnection;
use crate::util::abbrev_id;

const DISPATCH_INTERVAL_SECS: u64 = 2;
const DISPATCH_LIMIT: u32 = 16;
const DISPATCH_LEASE_SECS: i64 = 20;
const BASE_BACKOFF_SECS: i64 = 5;
const MAX_BACKOFF_EXP: u32 = 6;
const MAX_BACKOFF_SECS: i64 = 300;
/// Delivery attempts before an unreachable follower is evicted.
const MAX_DELIVERY_ATTEMPTS: i64 = 10;

pub fn spawn_worker(node: SharedNode) {
    tokio::spawn(async move {
        let mut ticker = interval(StdDuration::from_secs(DISPATCH_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = node.worker_signal.notified() => {}
            }
            if let Err(err) = dispatch(&node).await {
                warn!(error = %err, "action dispatch iteration failed");
            }
        }
    });
}

async fn dispatch(node: &SharedNode) -> Result<(), ServerError> {
    let actions = node
        .storage
        .claim_due_actions(
            DISPATCH_LIMIT,
            Duration::seconds(DISPATCH_LEASE_SECS),
            Utc::now(),
        )
        .await?;
    for action in actions {
        process_action(node, action).await;
    }
    Ok(())
}

async fn process_action(node: &SharedNode, action: NeighborhoodAction) {
    if action.action_type == ActionType::InitializationInProgress {
        resolve_initialization_blocker(node, &action).await;
        return;
    }
    let follower = match node.storage.load_follower(&action.server_id).await {
        Ok(Some(follower)) => follower,
        Ok(None) => {
            // Follower vanished; its actions are garbage.
            let _ = node.storage.delete_action(action.action_id).await;
            return;
        }
        Err(err) => {
            warn!(error = %err, "follower lookup failed");
            return;
        }
    };
    let item = match build_update_item(node, &action).await {
        Some(item) => item,
        None => {
            // The target identity is gone or unusable; drop the action.
            let _ = node.storage.delete_action(action.action_id).await;
            return;
        }
    };
    let address = format!("{}:{}", follower.ip, follower.neighbor_port);
    match deliver(node, &address, item).await {
        Ok(()) => {
            node.metrics.mark_action_delivered();
            if let Err(err) = node.storage.delete_action(action.action_id).await {
                warn!(error = %err, "delivered action cleanup failed");
            }
            let _ = node
                .storage
                .mark_follower_refreshed(&action.server_id, Utc::now())
                .await;
            debug!(
                follower = %abbrev_id(&action.server_id),
                action = action.action_id,
                "action delivered"
            );
        }
        Err(err) => {
            node.metrics.mark_action_failed();
            if action.attempts >= MAX_DELIVERY_ATTEMPTS {
                warn!(
                    follower = %abbrev_id(&action.server_id),
                    attempts = action.attempts,
                    "follower unreachable; evicting"
                );
                if let Err(remove_err) = node.storage.remove_follower(&action.server_id).await {
                    warn!(error = %remove_err, "follower eviction failed");
                }
                return;
            }
            schedule_retry(node, &action, &err.to_string()).await;
        }
    }
}

/// A due `InitializationInProgress` action either marks a finished
/// initialization (follower refreshed; drop the blocker) or one that ran
/// out its deadline (drop the follower too).
async fn resolve_initialization_blocker(node: &SharedNode, action: &NeighborhoodAction) {
    match node.storage.load_follower(&action.server_id).await {
        Ok(Some(follower)) if follower.last_refresh_at.is_some() => {
            if let Err(err) = node.storage.delete_action(action.action_id).await {
                warn!(error = %err, "blocker cleanup failed");
            }
        }
        Ok(Some(_)) => {
            info!(
                follower = %abbrev_id(&action.server_id),
                "initialization deadline expired; removing follower"
            );
            if let Err(err) = node.storage.remove_follower(&action.server_id).await {
                warn!(error = %err, "stale follower removal failed");
            }
        }
        Ok(None) => {
            let _ = node.storage.delete_action(action.action_id).await;
        }
        Err(err) => warn!(error = %err, "follower lookup failed"),
    }
}

async fn build_update_item(
    node: &SharedNode,
    action: &NeighborhoodAction,
) -> Option<SharedProfileUpdateItem> {
    let target = action.target_identity_id?;
    let update_action = match action.action_type {
        ActionType::RemoveProfile => shared_profile_update_item::Action::Delete(
            SharedProfileDeleteItem {
                identity_id: target.to_vec(),
            },
        ),
        ActionType::AddProfile | ActionType::ChangeProfile => {
            let identity = match node.storage.load_hosted(&target).await {
                Ok(Some(identity))
                    if identity.is_initialized() && identity.expiration_at.is_none() =>
                {
                    identity
                }
                _ => return None,
            };
            if action.action_type == ActionType::AddProfile {
                shared_profile_update_item::Action::Add(add_item_for(node, &identity).await)
            } else {
                shared_profile_update_item::Action::Change(
                    change_item_for(node, &identity).await,
                )
            }
        }
        ActionType::InitializationInProgress => return None,
    };
    Some(SharedProfileUpdateItem {
        action: Some(update_action),
    })
}

async fn deliver(
    node: &SharedNode,
    address: &str,
    item: SharedProfileUpdateItem,
) -> Result<(), ServerError> {
    let mut connection =
        PeerConnection::connect(address, &node.config.identity_keys).await?;
    connection
        .call(conversation_request::Part::NeighborhoodSharedProfileUpdate(
            NeighborhoodSharedProfileUpdateRequest { items: vec![item] },
        ))
        .await?;
    Ok(())
}

async fn schedule_retry(node: &SharedNode, action: &NeighborhoodAction, reason: &str) {
    let exp = u32::try_from(action.attempts.saturating_sub(1))
        .unwrap_or(0)
        .min(MAX_BACKOFF_EXP);
    let multiplier = 1_i64 << exp;
    let delay_secs = BASE_BACKOFF_SECS
        .saturating_mul(multiplier)
        .min(MAX_BACKOFF_SECS);
    let mut message = reason.trim().to_string();
    if message.len() > 200 {
        message.truncate(200);
    }
    warn!(
        follower = %abbrev_id(&action.server_id),
        action = action.action_id,
        attempts = action.attempts,
        delay_secs,
        error = %message,
        "action delivery failed; rescheduled"
    );
    if let Err(err) = node
        .storage
        .reschedule_action(
            action.action_id,
            Duration::seconds(delay_secs),
            Utc::now(),
            Some(&message),
        )
        .await
    {
        warn!(error = %err, "action reschedule failed");
    }
}
