//! Client-facing signaling messages
//!
//! Text frames carrying JSON objects discriminated by an `id` field.

use crate::engine::IceCandidate;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message ids a client may send
const CLIENT_IDS: &[&str] = &[
    "offer",
    "ice-candidate",
    "stop",
    "start-recording",
    "stop-recording",
];

/// Message received from a client
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "id", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Start a session with the peer's SDP offer
    Offer {
        /// SDP offer
        offer: String,
        /// Ask for SRTP between the sender and the engine
        #[serde(rename = "useSecureTransport", default)]
        use_secure_transport: bool,
    },
    /// Trickled remote ICE candidate
    IceCandidate(IceCandidate),
    /// Tear the session down
    Stop,
    /// Start the session's recorder
    StartRecording,
    /// Stop the session's recorder
    StopRecording,
}

impl ClientMessage {
    /// Parse a text frame
    ///
    /// # Errors
    ///
    /// `MalformedMessage` if the frame is not JSON or its `id` is missing or
    /// unknown; `ConfigurationError` if a kind-specific field is missing or
    /// has the wrong type.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::MalformedMessage(format!("not a JSON message: {}", e)))?;

        let id = message_id(&value)
            .ok_or_else(|| Error::MalformedMessage("message has no id".to_string()))?;
        if !CLIENT_IDS.contains(&id) {
            return Err(Error::MalformedMessage(format!("Invalid message, id: {}", id)));
        }

        let id = id.to_string();
        serde_json::from_value(value)
            .map_err(|e| Error::ConfigurationError(format!("invalid {} message: {}", id, e)))
    }

    /// Whether a raw frame is a `stop` request, without full parsing
    pub fn is_stop(text: &str) -> bool {
        serde_json::from_str::<Value>(text)
            .ok()
            .as_ref()
            .and_then(message_id)
            == Some("stop")
    }

    /// Message id, for logs
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::IceCandidate(_) => "ice-candidate",
            ClientMessage::Stop => "stop",
            ClientMessage::StartRecording => "start-recording",
            ClientMessage::StopRecording => "stop-recording",
        }
    }
}

fn message_id(value: &Value) -> Option<&str> {
    value.get("id").and_then(Value::as_str)
}

/// Message sent to a client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "id", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Negotiated SDP answer
    Answer {
        /// SDP answer
        answer: String,
    },
    /// Local ICE candidate found by the engine
    IceCandidate(IceCandidate),
    /// Request failed
    Error {
        /// Human-readable reason
        message: String,
    },
    /// Playback ended and the session was torn down
    EndPlayback,
    /// RTP sender connection summary
    ConnectionInfo {
        /// Diagnostic text
        text: String,
    },
}

impl ServerMessage {
    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize signaling message: {}", e))
        })
    }
}

impl From<&Error> for ServerMessage {
    fn from(err: &Error) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
        }
    }
}
