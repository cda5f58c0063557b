//! Call records: the explicit state of every two-party call the relay knows about.
//!
//! A record is opened by a successful `call_device` and is the only thing that
//! entitles its two participants to exchange offer/answer/ICE traffic.
//!
//! ```text
//! (no record) -> CallRequested -> OfferRelayed -> AnswerRelayed -> Active
//! ```
//!
//! Records are keyed by the unordered participant pair and indexed by device,
//! and they go away on hang-up, on either participant's disconnect, or when a
//! call attempt stays short of `Active` for longer than the configured timeout.

use callrelay_common::{RelayError, RelayResult};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    CallRequested,
    OfferRelayed,
    AnswerRelayed,
    Active,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CallRequested => "call_requested",
            Self::OfferRelayed => "offer_relayed",
            Self::AnswerRelayed => "answer_relayed",
            Self::Active => "active",
        };
        f.write_str(s)
    }
}

/// Relay messages that move a call forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaySignal {
    Offer,
    Answer,
    IceCandidate,
}

impl RelaySignal {
    fn name(self) -> &'static str {
        match self {
            Self::Offer => "webrtc_offer",
            Self::Answer => "webrtc_answer",
            Self::IceCandidate => "ice_candidate",
        }
    }

    /// State after `from` relays this signal, or `None` if it is not allowed.
    ///
    /// An answer must come from the side that did not send the latest offer.
    fn next_state(self, record: &CallRecord, from: &str) -> Option<CallState> {
        let current = record.state;
        match self {
            // Renegotiation offers are fine at any point
            Self::Offer => Some(current.max(CallState::OfferRelayed)),
            Self::Answer
                if current >= CallState::OfferRelayed
                    && record.offerer.as_deref() != Some(from) =>
            {
                Some(current.max(CallState::AnswerRelayed))
            }
            Self::Answer => None,
            Self::IceCandidate if current == CallState::AnswerRelayed => Some(CallState::Active),
            Self::IceCandidate => Some(current),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub caller_id: String,
    pub receiver_id: String,
    pub state: CallState,
    /// Sender of the most recent offer
    pub offerer: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CallRecord {
    /// The other participant, if `device_id` is one of the two.
    pub fn peer_of(&self, device_id: &str) -> Option<&str> {
        if self.caller_id == device_id {
            Some(&self.receiver_id)
        } else if self.receiver_id == device_id {
            Some(&self.caller_id)
        } else {
            None
        }
    }
}

/// Unordered participant pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CallKey(String, String);

impl CallKey {
    fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self(a.to_string(), b.to_string())
        } else {
            Self(b.to_string(), a.to_string())
        }
    }
}

#[derive(Default)]
struct CallIndex {
    calls: HashMap<CallKey, CallRecord>,
    by_device: HashMap<String, HashSet<CallKey>>,
}

impl CallIndex {
    fn insert(&mut self, key: CallKey, record: CallRecord) -> Option<CallRecord> {
        self.by_device
            .entry(key.0.clone())
            .or_default()
            .insert(key.clone());
        self.by_device
            .entry(key.1.clone())
            .or_default()
            .insert(key.clone());
        self.calls.insert(key, record)
    }

    fn remove(&mut self, key: &CallKey) -> Option<CallRecord> {
        let record = self.calls.remove(key)?;
        for device in [&key.0, &key.1] {
            if let Some(keys) = self.by_device.get_mut(device) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_device.remove(device);
                }
            }
        }
        Some(record)
    }
}

#[derive(Clone, Default)]
pub struct CallTable {
    index: Arc<RwLock<CallIndex>>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a call attempt. Any earlier record for the same pair is replaced and returned.
    pub async fn open(
        &self,
        caller_id: &str,
        receiver_id: &str,
        now: DateTime<Utc>,
    ) -> Option<CallRecord> {
        let record = CallRecord {
            caller_id: caller_id.to_string(),
            receiver_id: receiver_id.to_string(),
            state: CallState::CallRequested,
            offerer: None,
            created_at: now,
        };
        self.index
            .write()
            .await
            .insert(CallKey::new(caller_id, receiver_id), record)
    }

    pub async fn get(&self, a: &str, b: &str) -> Option<CallRecord> {
        self.index.read().await.calls.get(&CallKey::new(a, b)).cloned()
    }

    /// Check that `signal` may pass between `from` and `to` and advance the record.
    ///
    /// Check and update happen under one lock so two racing signals cannot both
    /// observe the old state.
    pub async fn apply_signal(
        &self,
        from: &str,
        to: &str,
        signal: RelaySignal,
    ) -> RelayResult<CallRecord> {
        let mut index = self.index.write().await;
        let record = index
            .calls
            .get_mut(&CallKey::new(from, to))
            .ok_or_else(|| RelayError::NoActiveCall {
                peer_id: to.to_string(),
            })?;

        let next = signal
            .next_state(record, from)
            .ok_or_else(|| RelayError::UnexpectedSignal {
                signal: signal.name().to_string(),
                state: record.state.to_string(),
            })?;

        if signal == RelaySignal::Offer {
            record.offerer = Some(from.to_string());
        }

        if next != record.state {
            tracing::debug!(
                caller = %record.caller_id,
                receiver = %record.receiver_id,
                from = %record.state,
                to = %next,
                "Call state advanced"
            );
            record.state = next;
        }
        Ok(record.clone())
    }

    pub async fn end(&self, a: &str, b: &str) -> Option<CallRecord> {
        self.index.write().await.remove(&CallKey::new(a, b))
    }

    /// Remove every record `device_id` takes part in.
    pub async fn end_all_for(&self, device_id: &str) -> Vec<CallRecord> {
        let mut index = self.index.write().await;
        let keys: Vec<CallKey> = index
            .by_device
            .get(device_id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();

        keys.iter().filter_map(|key| index.remove(key)).collect()
    }

    /// Evict call attempts that have not reached `Active` within `timeout`.
    pub async fn expire(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<CallRecord> {
        let mut index = self.index.write().await;
        let stale: Vec<CallKey> = index
            .calls
            .iter()
            .filter(|(_, record)| {
                record.state < CallState::Active && now - record.created_at >= timeout
            })
            .map(|(key, _)| key.clone())
            .collect();

        stale.iter().filter_map(|key| index.remove(key)).collect()
    }

    /// Number of call records, in any state.
    pub async fn len(&self) -> usize {
        self.index.read().await.calls.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
