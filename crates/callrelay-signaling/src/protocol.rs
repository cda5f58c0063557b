//! Signaling wire protocol: JSON event envelopes exchanged over the WebSocket.
//!
//! Every frame is `{"event": "<name>", "data": {...}}`. Session descriptions and
//! ICE candidates are carried as raw JSON and never re-encoded, so whatever one
//! peer sends reaches the other byte for byte.

use callrelay_common::{RelayError, RelayResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Raw incoming frame before the payload is interpreted.
#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Option<Box<RawValue>>,
}

/// Client → Relay: claim a device identity for this connection.
#[derive(Debug, Deserialize)]
pub struct RegisterDevice {
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Client → Relay: ask the relay to ring another device.
#[derive(Debug, Deserialize)]
pub struct CallDevice {
    #[serde(default)]
    pub receiver_id: Option<String>,
}

/// Client → Relay → Client: SDP offer.
#[derive(Debug, Deserialize)]
pub struct WebrtcOffer {
    pub target_id: String,
    #[serde(default)]
    pub caller_id: Option<String>,
    pub offer: Box<RawValue>,
}

/// Client → Relay → Client: SDP answer.
#[derive(Debug, Deserialize)]
pub struct WebrtcAnswer {
    pub target_id: String,
    pub answer: Box<RawValue>,
}

/// Client → Relay → Client: ICE candidate.
#[derive(Debug, Deserialize)]
pub struct IceCandidate {
    pub target_id: String,
    pub candidate: Box<RawValue>,
}

/// Client → Relay: hang up on a peer.
#[derive(Debug, Deserialize)]
pub struct EndCall {
    pub peer_id: String,
}

/// Every event a client may send.
#[derive(Debug)]
pub enum ClientEvent {
    RegisterDevice(RegisterDevice),
    CallDevice(CallDevice),
    WebrtcOffer(WebrtcOffer),
    WebrtcAnswer(WebrtcAnswer),
    IceCandidate(IceCandidate),
    EndCall(EndCall),
}

impl ClientEvent {
    /// Parse one text frame.
    pub fn parse(text: &str) -> RelayResult<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        // A missing or null `data` is treated as an empty object
        let data = envelope.data.as_deref().map_or("{}", RawValue::get);

        let event = match envelope.event.as_str() {
            "register_device" => Self::RegisterDevice(payload(data)?),
            "call_device" => Self::CallDevice(payload(data)?),
            "webrtc_offer" => Self::WebrtcOffer(payload(data)?),
            "webrtc_answer" => Self::WebrtcAnswer(payload(data)?),
            "ice_candidate" => Self::IceCandidate(payload(data)?),
            "end_call" => Self::EndCall(payload(data)?),
            other => {
                return Err(RelayError::InvalidMessage {
                    detail: format!("unknown event '{other}'"),
                });
            }
        };
        Ok(event)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RegisterDevice(_) => "register_device",
            Self::CallDevice(_) => "call_device",
            Self::WebrtcOffer(_) => "webrtc_offer",
            Self::WebrtcAnswer(_) => "webrtc_answer",
            Self::IceCandidate(_) => "ice_candidate",
            Self::EndCall(_) => "end_call",
        }
    }
}

fn payload<T: DeserializeOwned>(data: &str) -> RelayResult<T> {
    Ok(serde_json::from_str(data)?)
}

/// Why a call record went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    Hangup,
    Timeout,
}

/// Every event the relay sends to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Registered {
        device_id: String,
    },

    IncomingCall {
        caller_id: String,
        auto_accept: bool,
    },

    WebrtcOffer {
        offer: Box<RawValue>,
        caller_id: Option<String>,
    },

    WebrtcAnswer {
        answer: Box<RawValue>,
    },

    IceCandidate {
        candidate: Box<RawValue>,
    },

    /// The call with `peer_id` is over.
    CallEnded {
        peer_id: String,
        reason: CallEndReason,
    },

    /// The other participant of a call dropped its connection.
    PeerDisconnected {
        device_id: String,
    },

    Error {
        message: String,
        code: &'static str,
    },
}

impl ServerEvent {
    pub fn error(err: &RelayError) -> Self {
        Self::Error {
            message: err.to_string(),
            code: err.error_code(),
        }
    }
}
