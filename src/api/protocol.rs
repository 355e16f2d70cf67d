use axum::extract::ws::Message;
use serde::Serialize;

use crate::rate_limit::Violation;

/// Server → Client control frames
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after the upgrade
    Welcome { connection_id: String },
    /// The preceding client frame was dropped
    Error { reason: Violation },
}

/// Accepted client frame fanned out to every other connection
#[derive(Debug, Clone)]
pub struct RelayFrame {
    pub origin: String,
    pub message: Message,
}

/// Payload length used for the size limit
pub fn payload_len(message: &Message) -> usize {
    match message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    }
}
