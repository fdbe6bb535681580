//! Signaling envelopes exchanged between browser peers and the relay
//!
//! Inbound envelopes carry a `target` peer id; outbound envelopes carry the
//! relay-assigned `from`. Negotiation payloads (`offer`, `answer`,
//! `candidate`) are opaque JSON and are never inspected.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Reasons an inbound frame is discarded
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("envelope has no \"type\" field")]
    MissingType,

    #[error("\"{0}\" envelope has no \"target\" field")]
    MissingTarget(String),
}

/// Envelope received from a peer
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Register,
    Connect { target: String },
    Offer { target: String, offer: Value },
    Answer { target: String, answer: Value },
    IceCandidate { target: String, candidate: Value },
    Disconnect { target: String },
    /// Well-formed envelope with a type the relay does not handle
    Unknown(String),
}

impl Inbound {
    /// Parse a text frame into an inbound envelope.
    ///
    /// Unknown types parse successfully as [`Inbound::Unknown`] so the caller
    /// can drop them without treating them as malformed.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut obj) = value else {
            return Err(EnvelopeError::NotAnObject);
        };

        let msg_type = match obj.get("type") {
            Some(Value::String(t)) => t.clone(),
            _ => return Err(EnvelopeError::MissingType),
        };

        let inbound = match msg_type.as_str() {
            "register" => Inbound::Register,
            "connect" => Inbound::Connect {
                target: take_target(&obj, &msg_type)?,
            },
            "offer" => Inbound::Offer {
                target: take_target(&obj, &msg_type)?,
                offer: take_payload(&mut obj, "offer"),
            },
            "answer" => Inbound::Answer {
                target: take_target(&obj, &msg_type)?,
                answer: take_payload(&mut obj, "answer"),
            },
            "ice-candidate" => Inbound::IceCandidate {
                target: take_target(&obj, &msg_type)?,
                candidate: take_payload(&mut obj, "candidate"),
            },
            "disconnect" => Inbound::Disconnect {
                target: take_target(&obj, &msg_type)?,
            },
            _ => Inbound::Unknown(msg_type),
        };

        Ok(inbound)
    }

    pub fn msg_type(&self) -> &str {
        match self {
            Inbound::Register => "register",
            Inbound::Connect { .. } => "connect",
            Inbound::Offer { .. } => "offer",
            Inbound::Answer { .. } => "answer",
            Inbound::IceCandidate { .. } => "ice-candidate",
            Inbound::Disconnect { .. } => "disconnect",
            Inbound::Unknown(t) => t,
        }
    }

    /// Peer this envelope is addressed to, if it is a directed type
    pub fn target(&self) -> Option<&str> {
        match self {
            Inbound::Register | Inbound::Unknown(_) => None,
            Inbound::Connect { target }
            | Inbound::Offer { target, .. }
            | Inbound::Answer { target, .. }
            | Inbound::IceCandidate { target, .. }
            | Inbound::Disconnect { target } => Some(target),
        }
    }
}

fn take_target(obj: &Map<String, Value>, msg_type: &str) -> Result<String, EnvelopeError> {
    match obj.get("target") {
        Some(Value::String(target)) => Ok(target.clone()),
        _ => Err(EnvelopeError::MissingTarget(msg_type.to_string())),
    }
}

// Absent payloads are forwarded as null.
fn take_payload(obj: &mut Map<String, Value>, field: &str) -> Value {
    obj.remove(field).unwrap_or(Value::Null)
}

/// Envelope sent by the relay to a peer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Outbound {
    Registered { peer_id: String },
    ConnectionRequest { from: String },
    Offer { from: String, offer: Value },
    Answer { from: String, answer: Value },
    IceCandidate { from: String, candidate: Value },
    PeerDisconnected { from: String },
    PeerUnavailable { target: String },
}

impl Outbound {
    pub fn registered(peer_id: &str) -> Self {
        Outbound::Registered {
            peer_id: peer_id.to_string(),
        }
    }

    pub fn peer_unavailable(target: &str) -> Self {
        Outbound::PeerUnavailable {
            target: target.to_string(),
        }
    }

    /// Envelope to deliver to the target of `inbound`, stamped with the sender.
    ///
    /// Returns `None` for types that are never forwarded.
    pub fn forwarded(inbound: Inbound, from: &str) -> Option<Self> {
        let from = from.to_string();
        match inbound {
            Inbound::Connect { .. } => Some(Outbound::ConnectionRequest { from }),
            Inbound::Offer { offer, .. } => Some(Outbound::Offer { from, offer }),
            Inbound::Answer { answer, .. } => Some(Outbound::Answer { from, answer }),
            Inbound::IceCandidate { candidate, .. } => {
                Some(Outbound::IceCandidate { from, candidate })
            }
            Inbound::Disconnect { .. } => Some(Outbound::PeerDisconnected { from }),
            Inbound::Register | Inbound::Unknown(_) => None,
        }
    }

    pub fn msg_type(&self) -> &'static str {
        match self {
            Outbound::Registered { .. } => "registered",
            Outbound::ConnectionRequest { .. } => "connection-request",
            Outbound::Offer { .. } => "offer",
            Outbound::Answer { .. } => "answer",
            Outbound::IceCandidate { .. } => "ice-candidate",
            Outbound::PeerDisconnected { .. } => "peer-disconnected",
            Outbound::PeerUnavailable { .. } => "peer-unavailable",
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing a map of strings and JSON values cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
