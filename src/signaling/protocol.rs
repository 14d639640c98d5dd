#![forbid(unsafe_code)]

// Signaling protocol - message types for WebSocket communication.
// Offer/answer/candidate payloads are opaque to the server; they are
// carried as raw JSON values and relayed without inspection.

use crate::room::CallKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join a room (valid once per connection)
    JoinRoom {
        room: String,
    },
    /// Chat text or image URL, broadcast to the whole room
    ChatMessage {
        message: String,
    },
    /// SDP offer for a video call
    VideoOffer {
        offer: Value,
    },
    /// SDP answer for a video call
    VideoAnswer {
        answer: Value,
    },
    /// ICE candidate for a video call
    IceCandidate {
        candidate: Value,
    },
    /// Sender has entered a video call
    VideoCallStart,
    /// Sender has left a video call
    VideoCallEnd,
    /// SDP offer for a voice call
    VoiceOffer {
        offer: Value,
    },
    /// SDP answer for a voice call
    VoiceAnswer {
        answer: Value,
    },
    /// ICE candidate for a voice call
    VoiceIceCandidate {
        candidate: Value,
    },
    /// Sender has entered a voice call
    VoiceCallStart,
    /// Sender has left a voice call
    VoiceCallEnd,
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Chat message, echoed to every room member including the sender
    ChatMessage {
        message: String,
    },
    VideoOffer {
        offer: Value,
        from: String,
    },
    VideoAnswer {
        answer: Value,
        from: String,
    },
    IceCandidate {
        candidate: Value,
        from: String,
    },
    /// Another member entered a video call
    VideoCallJoined {
        from: String,
    },
    /// Another member left a video call (explicit end or disconnect)
    VideoCallLeft {
        from: String,
    },
    VoiceOffer {
        offer: Value,
        from: String,
    },
    VoiceAnswer {
        answer: Value,
        from: String,
    },
    VoiceIceCandidate {
        candidate: Value,
        from: String,
    },
    /// Another member entered a voice call
    VoiceCallJoined {
        from: String,
    },
    /// Another member left a voice call (explicit end or disconnect)
    VoiceCallLeft {
        from: String,
    },
    /// Error response, sent only to the offending connection
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Call presence "joined" notification for the given kind.
    pub fn call_joined(kind: CallKind, from: &str) -> Self {
        match kind {
            CallKind::Video => Self::VideoCallJoined { from: from.to_string() },
            CallKind::Voice => Self::VoiceCallJoined { from: from.to_string() },
        }
    }

    /// Call presence "left" notification for the given kind.
    pub fn call_left(kind: CallKind, from: &str) -> Self {
        match kind {
            CallKind::Video => Self::VideoCallLeft { from: from.to_string() },
            CallKind::Voice => Self::VoiceCallLeft { from: from.to_string() },
        }
    }
}
