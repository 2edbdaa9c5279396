use crate::schema;
use crate::{GroupId, UserId};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

/// A chat message as handed to storage. `created_at` is stamped by the hub at routing time.
#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = schema::messages)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: Option<UserId>,
    pub group_id: Option<GroupId>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = schema::notifications)]
pub struct Notification {
    pub id: i64,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub seen: bool,
    pub created_at: DateTime<Utc>,
}

/// For inserting a notification produced by business logic. `seen` starts out false.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::notifications)]
pub struct NewNotification {
    pub user_id: UserId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub seen: bool,
    pub created_at: DateTime<Utc>,
}

impl NewNotification {
    pub fn new(user_id: UserId, kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            user_id,
            kind: kind.into(),
            payload,
            seen: false,
            created_at: Utc::now(),
        }
    }
}
