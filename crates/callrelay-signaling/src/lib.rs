//! # callrelay-signaling
//!
//! Signaling relay for two-party WebRTC calls. Devices connect over a
//! WebSocket, claim a device id, ask the relay to ring a peer, and then
//! exchange SDP offers/answers and ICE candidates through it.
//!
//! The relay never touches media. It only:
//! - keeps the device registry (device id ↔ live connection)
//! - authorizes call requests against a static whitelist
//! - tracks one record per call and only relays traffic between its participants
//! - cleans up on disconnect and expires call attempts that never connect

pub mod calls;
pub mod connection;
pub mod handler;
pub mod lifecycle;
pub mod policy;
pub mod protocol;
pub mod registry;
pub mod router;

pub use handler::build_router;

use callrelay_common::RelayResult;
use callrelay_common::config::{RelayConfig, RelaySettings};
use calls::CallTable;
use chrono::TimeDelta;
use policy::Whitelist;
use registry::DeviceRegistry;
use std::sync::Arc;

/// Relay state: shared across all signaling connections.
#[derive(Clone)]
pub struct RelayState {
    pub registry: DeviceRegistry,
    pub policy: Arc<Whitelist>,
    pub calls: CallTable,
    pub settings: Arc<RelaySettings>,
    /// `settings.call_timeout_secs`, checked once up front
    pub call_timeout: TimeDelta,
}

impl RelayState {
    pub fn new(policy: Whitelist, settings: RelaySettings) -> RelayResult<Self> {
        Ok(Self {
            registry: DeviceRegistry::new(),
            policy: Arc::new(policy),
            calls: CallTable::new(),
            call_timeout: settings.call_timeout()?,
            settings: Arc::new(settings),
        })
    }

    /// Build the relay from validated configuration.
    ///
    /// Fails on a whitelist entry no device could register under.
    pub fn from_config(config: &RelayConfig) -> RelayResult<Self> {
        config.validate()?;
        let policy = Whitelist::from_rules(&config.policy.allow, config.policy.mirror);
        Self::new(policy, config.relay.clone())
    }

    /// Get stats about registered devices and calls.
    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            connected_devices: self.registry.count().await,
            active_calls: self.calls.len().await,
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct RelayStats {
    pub connected_devices: usize,
    pub active_calls: usize,
}
