//! Core types shared across the protocol

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session lifecycle status.
///
/// Moves forward `Active → Inactive → Closed`; any inbound activity resets
/// a non-closed session to `Active`. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Inactive,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Inactive => "inactive",
            SessionStatus::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SessionStatus::Active),
            "inactive" => Some(SessionStatus::Inactive),
            "closed" => Some(SessionStatus::Closed),
            _ => None,
        }
    }
}

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Bot,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Bot => "bot",
            MessageRole::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(MessageRole::User),
            "bot" => Some(MessageRole::Bot),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

/// A durable conversation thread between one visitor and the responder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub visitor_id: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: String,
    pub last_activity_at: String,
}

/// A message in a session's history. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    #[serde(rename = "sender")]
    pub role: MessageRole,
    pub content: String,
    pub created_at: String,
}
