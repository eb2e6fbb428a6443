use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    connections_active: AtomicU64,
    messages_ingress: AtomicU64,
    messages_egress: AtomicU64,
    requests_dispatched: AtomicU64,
    relays_created: AtomicU64,
    relays_destroyed: AtomicU64,
    actions_delivered: AtomicU64,
    actions_failed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_connections(&self) {
        self.connections_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_connections(&self) {
        self.connections_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn mark_ingress(&self) {
        self.messages_ingress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_egress(&self) {
        self.messages_egress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_dispatch(&self) {
        self.requests_dispatched.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_relay_created(&self) {
        self.relays_created.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_relay_destroyed(&self) {
        self.relays_destroyed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_action_delivered(&self) {
        self.actions_delivered.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_action_failed(&self) {
        self.actions_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_active: self.connections_active.load(Ordering::SeqCst),
            messages_ingress: self.messages_ingress.load(Ordering::SeqCst),
            messages_egress: self.messages_egress.load(Ordering::SeqCst),
            requests_dispatched: self.requests_dispatched.load(Ordering::SeqCst),
            relays_created: self.relays_created.load(Ordering::SeqCst),
            relays_destroyed: self.relays_destroyed.load(Ordering::SeqCst),
            actions_delivered: self.actions_delivered.load(Ordering::SeqCst),
            actions_failed: self.actions_failed.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub connections_active: u64,
    pub messages_ingress: u64,
    pub messages_egress: u64,
    pub requests_dispatched: u64,
    pub relays_created: u64,
    pub relays_destroyed: u64,
    pub actions_delivered: u64,
    pub actions_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.incr_connections();
        metrics.mark_dispatch();
        metrics.mark_dispatch();
        metrics.mark_relay_created();
        metrics.mark_relay_destroyed();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_active, 1);
        assert_eq!(snapshot.requests_dispatched, 2);
        assert_eq!(snapshot.relays_created, 1);
        assert_eq!(snapshot.relays_destroyed, 1);
    }
}
