//! Background maintenance: keep-alive enforcement, hosted identity
//! expiration, stale neighbor expiry and orphaned image blob collection.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::node::SharedNode;

pub fn spawn_sweeper(node: SharedNode) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(node.config.sweep_interval_seconds));
        loop {
            ticker.tick().await;
            sweep(&node).await;
        }
    });
}

pub(crate) async fn sweep(node: &SharedNode) {
    let keepalive = Duration::from_secs(node.config.keepalive_seconds);
    for session in node.registry.sessions_snapshot().await {
        if session.idle_longer_than(keepalive).await {
            debug!(session = %session.session_id, "keepalive expired");
            session.force_close();
        }
    }

    match node.storage.delete_expired_hosted(Utc::now()).await {
        Ok(images) => {
            for image in &images {
                node.images.remove(image).await;
            }
            if !images.is_empty() {
                debug!(count = images.len(), "expired hosted identities removed");
            }
        }
        Err(err) => warn!(error = %err, "expiration sweep failed"),
    }

    let cutoff = Utc::now() - ChronoDuration::hours(node.config.neighbor_expiration_hours);
    match node.storage.expire_stale_neighbors(cutoff).await {
        Ok(images) => {
            for image in &images {
                node.images.remove(image).await;
            }
        }
        Err(err) => warn!(error = %err, "neighbor expiration sweep failed"),
    }

    sweep_orphan_blobs(node).await;

    let snapshot = node.metrics.snapshot();
    debug!(
        connections = snapshot.connections_active,
        dispatched = snapshot.requests_dispatched,
        relays = snapshot.relays_created.saturating_sub(snapshot.relays_destroyed),
        delivered = snapshot.actions_delivered,
        "sweep complete"
    );
}

/// Removes blob files no row references any more. Only files older than two
/// sweep intervals are touched so freshly staged images survive their
/// pre-commit window.
async fn sweep_orphan_blobs(node: &SharedNode) {
    let referenced: HashSet<[u8; 16]> = match node.storage.referenced_image_ids().await {
        Ok(ids) => ids.into_iter().collect(),
        Err(err) => {
            warn!(error = %err, "referenced image listing failed");
            return;
        }
    };
    let entries = match node.images.list().await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(error = %err, "image directory listing failed");
            return;
        }
    };
    let min_age = Duration::from_secs(node.config.sweep_interval_seconds * 2);
    for (image_id, modified) in entries {
        if referenced.contains(&image_id) {
            continue;
        }
        let old_enough = modified
            .elapsed()
            .map(|age| age > min_age)
            .unwrap_or(false);
        if old_enough {
            debug!(image = %portico_crypto::hex::encode_hex(&image_id), "removing orphaned blob");
            node.images.remove(&image_id).await;
        }
    }
}
