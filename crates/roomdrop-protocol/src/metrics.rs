use roomdrop_metrics::{Counter, Gauge};
use serde::{Deserialize, Serialize};

/// Metrics for the peer session.
#[derive(Debug, Default, Serialize)]
#[non_exhaustive]
pub struct SessionMetrics {
    /// Records accepted by the local node.
    pub publishes: Counter,
    /// Publish calls the node rejected.
    pub publish_failures: Counter,
    /// Raw inbound payloads, valid or not.
    pub inbound: Counter,
    /// Inbound payloads that failed to decode.
    pub malformed_dropped: Counter,
    /// Bootstrap re-dials made by the background loop.
    pub reconnect_attempts: Counter,
    /// Last sampled peer count.
    pub peer_count: Gauge,
}

/// Metrics for the transfer coordinator.
#[derive(Debug, Default, Serialize)]
#[non_exhaustive]
pub struct TransferMetrics {
    pub uploads_ok: Counter,
    pub uploads_failed: Counter,
    /// Inbound records discarded by the self-filter.
    pub self_filtered: Counter,
    /// Inbound records whose fileId was already listed.
    pub duplicates_dropped: Counter,
    pub downloads_ok: Counter,
    pub downloads_failed: Counter,
}

/// Plain copy of every counter, for display or JSON output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub publishes: u64,
    pub publish_failures: u64,
    pub inbound: u64,
    pub malformed_dropped: u64,
    pub reconnect_attempts: u64,
    pub peer_count: i64,
    pub uploads_ok: u64,
    pub uploads_failed: u64,
    pub self_filtered: u64,
    pub duplicates_dropped: u64,
    pub downloads_ok: u64,
    pub downloads_failed: u64,
}

impl MetricsSnapshot {
    pub fn collect(session: &SessionMetrics, transfer: &TransferMetrics) -> Self {
        Self {
            publishes: session.publishes.get(),
            publish_failures: session.publish_failures.get(),
            inbound: session.inbound.get(),
            malformed_dropped: session.malformed_dropped.get(),
            reconnect_attempts: session.reconnect_attempts.get(),
            peer_count: session.peer_count.get(),
            uploads_ok: transfer.uploads_ok.get(),
            uploads_failed: transfer.uploads_failed.get(),
            self_filtered: transfer.self_filtered.get(),
            duplicates_dropped: transfer.duplicates_dropped.get(),
            downloads_ok: transfer.downloads_ok.get(),
            downloads_failed: transfer.downloads_failed.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_copies_counters() {
        let session = SessionMetrics::default();
        let transfer = TransferMetrics::default();
        session.publishes.inc_by(3);
        session.peer_count.set(2);
        transfer.duplicates_dropped.inc();

        let snap = MetricsSnapshot::collect(&session, &transfer);
        assert_eq!(snap.publishes, 3);
        assert_eq!(snap.peer_count, 2);
        assert_eq!(snap.duplicates_dropped, 1);
        assert_eq!(snap.uploads_ok, 0);
    }

    #[test]
    fn session_metrics_serialize_as_numbers() {
        let session = SessionMetrics::default();
        session.inbound.inc();
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["inbound"], 1);
        assert_eq!(json["peer_count"], 0);
    }
}
