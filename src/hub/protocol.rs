//! Wire format: one JSON object per text frame, discriminated by `type`.
//!
//! Inbound kinds are closed (`private`, `group`, `join_group`); anything else fails to decode.
//! `sender_id` in an inbound frame is never read: the sender is always the authenticated user.

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::models::Notification;
use crate::{GroupId, UserId};

pub const MAX_CONTENT_CHARS: usize = 1000;

/// A serialized frame waiting in an outbound queue. Cheap to clone across a fan-out.
pub type OutboundFrame = Utf8Bytes;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Private { receiver_id: UserId, content: String },
    Group { group_id: GroupId, content: String },
    JoinGroup { group_id: GroupId },
}

impl ClientMessage {
    /// Decode and validate one inbound text frame sent by `sender`.
    pub fn decode(text: &str, sender: UserId) -> Result<Self, ProtocolError> {
        let msg: ClientMessage = serde_json::from_str(text)?;
        msg.validate(sender)?;
        Ok(msg)
    }

    fn validate(&self, sender: UserId) -> Result<(), ProtocolError> {
        match self {
            ClientMessage::Private { receiver_id, content } => {
                if *receiver_id <= 0 {
                    return Err(ProtocolError::Invalid("receiver_id must be a positive integer"));
                }
                if *receiver_id == sender {
                    return Err(ProtocolError::Invalid("cannot send a message to yourself"));
                }
                validate_content(content)
            }
            ClientMessage::Group { group_id, content } => {
                if *group_id <= 0 {
                    return Err(ProtocolError::Invalid("group_id must be a positive integer"));
                }
                validate_content(content)
            }
            ClientMessage::JoinGroup { group_id } => {
                if *group_id <= 0 {
                    return Err(ProtocolError::Invalid("group_id must be a positive integer"));
                }
                Ok(())
            }
        }
    }
}

fn validate_content(content: &str) -> Result<(), ProtocolError> {
    if content.trim().is_empty() {
        return Err(ProtocolError::Invalid("content cannot be empty"));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ProtocolError::Invalid("content too long (max 1000 characters)"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatFrame {
    pub sender_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationAction {
    New,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationFrame {
    pub action: NotificationAction,
    pub notification: Option<Notification>,
    pub unread_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastFrame {
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Private(ChatFrame),
    Group(ChatFrame),
    Notification(NotificationFrame),
    Broadcast(BroadcastFrame),
}

impl ServerFrame {
    pub fn encode(&self) -> Result<OutboundFrame, serde_json::Error> {
        serde_json::to_string(self).map(Utf8Bytes::from)
    }
}
