/// Background tasks of a joined room.
///
/// Both tasks exit when the room's cancellation token fires. Status writes
/// go through the token as a guard so a task that outlives its room cannot
/// overwrite the status of the next one.
use std::sync::Arc;
use std::time::Duration;

use roomdrop_transport::{PubSubNode, Subscription};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{ConnectionState, Link, Reporter, SessionEvent};
use crate::announcement::AnnouncementRecord;
use crate::error::RoomdropError;
use crate::config::MIN_PEER_POLL_INTERVAL;

/// Dial every endpoint. Succeeds when at least one dial does.
pub(super) async fn dial_all(
    node: &dyn PubSubNode,
    endpoints: &[String],
) -> Result<usize, RoomdropError> {
    if endpoints.is_empty() {
        return Err(RoomdropError::Connection(
            "no bootstrap endpoints configured".into(),
        ));
    }

    let mut connected = 0;
    let mut last_error = None;
    for endpoint in endpoints {
        match node.dial(endpoint).await {
            Ok(()) => {
                tracing::debug!(endpoint, "bootstrap dial succeeded");
                connected += 1;
            }
            Err(e) => {
                tracing::debug!(endpoint, "bootstrap dial failed: {e}");
                last_error = Some(e);
            }
        }
    }

    if connected == 0 {
        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no endpoint answered".into());
        return Err(RoomdropError::Connection(format!(
            "all {} bootstrap dials failed, last: {reason}",
            endpoints.len()
        )));
    }
    Ok(connected)
}

/// Re-dial endpoints in order, stopping at the first success.
async fn redial_first(
    link: &Link,
    endpoints: &[String],
    reporter: &Reporter,
) -> Result<String, RoomdropError> {
    let mut last_error = None;
    for endpoint in endpoints {
        reporter.metrics.reconnect_attempts.inc();
        let result = link.node.dial(endpoint).await;
        reporter.emit(SessionEvent::ReconnectAttempt {
            room_id: link.room_id.clone(),
            endpoint: endpoint.clone(),
            success: result.is_ok(),
        });
        match result {
            Ok(()) => return Ok(endpoint.clone()),
            Err(e) => {
                tracing::debug!(room = %link.room_id, endpoint, "re-dial failed: {e}");
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(e) => RoomdropError::Connection(format!("reconnect round failed, last: {e}")),
        None => RoomdropError::Connection("no bootstrap endpoints configured".into()),
    })
}

/// Decode inbound payloads and forward records. Malformed payloads are
/// counted, logged and dropped.
pub(super) async fn inbound_loop(
    room_id: String,
    mut subscription: Subscription,
    records: mpsc::Sender<AnnouncementRecord>,
    reporter: Arc<Reporter>,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            payload = subscription.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        reporter.metrics.inbound.inc();

        let record = match AnnouncementRecord::decode(&payload) {
            Ok(record) => record,
            Err(e) => {
                reporter.metrics.malformed_dropped.inc();
                tracing::debug!(room = %room_id, len = payload.len(), "dropping inbound payload: {e}");
                reporter.emit(SessionEvent::RecordDropped {
                    reason: e.to_string(),
                });
                continue;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = records.send(record) => {
                if sent.is_err() {
                    tracing::debug!(room = %room_id, "record consumer gone");
                    break;
                }
            }
        }
    }
}

/// Sample the peer count; re-dial the bootstrap list whenever it is zero.
///
/// A failed round leaves the session `disconnected` with the error kept;
/// sampling continues so a later round can recover.
pub(super) async fn peer_monitor(
    link: Link,
    endpoints: Vec<String>,
    interval: Duration,
    reporter: Arc<Reporter>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(MIN_PEER_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let count = link.node.peer_count().await;
        if count > 0 {
            reporter.update(Some(&cancel), |status| {
                status.peer_count = count;
                status.state = ConnectionState::Connected;
                status.last_error = None;
            });
            continue;
        }

        tracing::info!(room = %link.room_id, "no peers left, reconnecting");
        reporter.update(Some(&cancel), |status| {
            status.peer_count = 0;
            status.state = ConnectionState::Connecting;
        });

        let round = tokio::select! {
            _ = cancel.cancelled() => break,
            round = redial_first(&link, &endpoints, &reporter) => round,
        };

        match round {
            Ok(endpoint) => {
                let count = link.node.peer_count().await;
                tracing::info!(room = %link.room_id, endpoint = %endpoint, peer_count = count, "reconnected");
                reporter.update(Some(&cancel), |status| {
                    status.peer_count = count;
                    status.state = ConnectionState::Connected;
                    status.last_error = None;
                });
            }
            Err(e) => {
                tracing::warn!(room = %link.room_id, "{e}");
                let reason = e.to_string();
                reporter.update(Some(&cancel), |status| {
                    status.state = ConnectionState::Disconnected;
                    status.last_error = Some(reason);
                });
            }
        }
    }
}
