#![forbid(unsafe_code)]

// peerchat library - room-based chat with peer-to-peer call signaling

pub mod ice;
pub mod metrics;
pub mod room;
pub mod signaling;
pub mod upload;
