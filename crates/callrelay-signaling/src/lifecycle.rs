//! Connection lifecycle: connect, register, disconnect, and call expiry.
//!
//! Disconnect is the main cleanup path: the device registration goes away,
//! every call record the device took part in is destroyed, and the remaining
//! participant is told (unless `notify_peer_on_disconnect` is off).

use crate::RelayState;
use crate::connection::ConnectionHandle;
use crate::protocol::{CallEndReason, RegisterDevice, ServerEvent};
use callrelay_common::RelayResult;
use callrelay_common::validation::validate_device_id;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::task::JoinHandle;

/// A new socket is up. Nothing to record until it registers.
pub fn on_connect(connection: &ConnectionHandle) {
    tracing::debug!(connection = %connection.id(), "Signaling connection opened");
}

/// Bind a device id to this connection and acknowledge it.
pub async fn on_register(
    state: &RelayState,
    connection: &ConnectionHandle,
    request: RegisterDevice,
) -> RelayResult<()> {
    let device_id = validate_device_id(request.device_id.as_deref())?;

    let registration = state
        .registry
        .register(device_id.clone(), connection.clone())
        .await;

    if let Some(displaced) = registration.displaced {
        tracing::warn!(
            device = %device_id,
            connection = %connection.id(),
            displaced = %displaced,
            "Device re-registered; previous connection no longer reachable"
        );
    }
    if let Some(released) = registration.released {
        tracing::info!(
            connection = %connection.id(),
            old_device = %released,
            new_device = %device_id,
            "Connection switched device id"
        );
        end_calls_for(state, &released).await;
    }

    tracing::info!(device = %device_id, connection = %connection.id(), "Device registered");
    connection.send(ServerEvent::Registered { device_id });
    Ok(())
}

/// Socket closed: forget the device and tear down its calls.
pub async fn on_disconnect(state: &RelayState, connection: &ConnectionHandle) {
    match state.registry.remove(connection.id()).await {
        Some(device_id) => {
            end_calls_for(state, &device_id).await;
            tracing::info!(device = %device_id, connection = %connection.id(), "Device removed");
        }
        None => {
            tracing::debug!(connection = %connection.id(), "Anonymous connection closed");
        }
    }
}

/// Destroy every call of `device_id`, telling each remaining peer that it went away.
async fn end_calls_for(state: &RelayState, device_id: &str) {
    for record in state.calls.end_all_for(device_id).await {
        let Some(peer_id) = record.peer_of(device_id) else {
            continue;
        };
        tracing::info!(device = %device_id, peer = %peer_id, state = %record.state, "Call torn down");

        if !state.settings.notify_peer_on_disconnect {
            continue;
        }
        if let Some(peer) = state.registry.lookup_by_id(peer_id).await {
            peer.send(ServerEvent::PeerDisconnected {
                device_id: device_id.to_string(),
            });
        }
    }
}

/// Evict call attempts older than the configured timeout and notify both sides.
///
/// Returns how many records were evicted.
pub async fn expire_stale_calls(state: &RelayState, now: DateTime<Utc>) -> usize {
    let expired = state.calls.expire(now, state.call_timeout).await;

    for record in &expired {
        tracing::info!(
            caller = %record.caller_id,
            receiver = %record.receiver_id,
            state = %record.state,
            "Call attempt timed out"
        );
        for (me, peer) in [
            (&record.caller_id, &record.receiver_id),
            (&record.receiver_id, &record.caller_id),
        ] {
            if let Some(handle) = state.registry.lookup_by_id(me).await {
                handle.send(ServerEvent::CallEnded {
                    peer_id: peer.clone(),
                    reason: CallEndReason::Timeout,
                });
            }
        }
    }

    expired.len()
}

/// Run [`expire_stale_calls`] every `sweep_interval_secs` until the task is aborted.
pub fn spawn_call_sweeper(state: RelayState) -> JoinHandle<()> {
    let period = Duration::from_secs(state.settings.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let evicted = expire_stale_calls(&state, Utc::now()).await;
            if evicted > 0 {
                tracing::debug!(evicted, "Call sweeper pass");
            }
        }
    })
}
