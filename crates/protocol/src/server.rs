//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, SessionStatus};

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once, immediately after connect-time session resolution,
    /// before any other outbound event.
    Session {
        session_id: String,
        visitor_id: String,
        status: SessionStatus,
    },

    /// Durable history replay, ascending. Sent once after `Session`,
    /// only when non-empty.
    History { messages: Vec<ChatMessage> },

    /// One persisted USER or BOT message, broadcast to every connection
    /// bound to the session.
    Message {
        session_id: String,
        message: ChatMessage,
    },

    /// Sent when a message arrives for an already-closed session.
    Status { status: SessionStatus },

    /// Sent once to the originating connection on explicit end-session.
    SessionClosed { session_id: String, message: String },

    /// Sent on any handled failure; never terminates the connection
    /// itself except for connect-time failures.
    Error { code: String, message: String },
}
