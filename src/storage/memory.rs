//! In-process storage. Keeps everything in memory and records each call, so it doubles as the
//! storage double in tests and as the backend for local runs without a database.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{Storage, StorageError};
use crate::models::{NewMessage, NewNotification, Notification};
use crate::{GroupId, UserId};

#[derive(Default)]
pub struct MemoryStorage {
    next_id: AtomicI64,
    messages: Mutex<Vec<(i64, NewMessage)>>,
    notifications: Mutex<Vec<Notification>>,
    members: Mutex<HashSet<(GroupId, UserId)>>,
    failing: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, group_id: GroupId, user_id: UserId) {
        self.members.lock().insert((group_id, user_id));
    }

    /// Make every subsequent call fail with `StorageError::Unavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<NewMessage> {
        self.messages.lock().iter().map(|(_, m)| m.clone()).collect()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    pub fn mark_seen(&self, notification_id: i64) {
        if let Some(n) = self
            .notifications
            .lock()
            .iter_mut()
            .find(|n| n.id == notification_id)
        {
            n.seen = true;
        }
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory storage set to fail".to_string()));
        }
        Ok(())
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn insert_message(&self, msg: NewMessage) -> Result<(i64, DateTime<Utc>), StorageError> {
        self.check()?;
        let id = self.next_id();
        let created_at = msg.created_at;
        self.messages.lock().push((id, msg));
        Ok((id, created_at))
    }

    async fn insert_notification(&self, n: NewNotification) -> Result<Notification, StorageError> {
        self.check()?;
        let stored = Notification {
            id: self.next_id(),
            user_id: n.user_id,
            kind: n.kind,
            payload: n.payload,
            seen: n.seen,
            created_at: n.created_at,
        };
        self.notifications.lock().push(stored.clone());
        Ok(stored)
    }

    async fn count_unseen(&self, user_id: UserId) -> Result<i64, StorageError> {
        self.check()?;
        let count = self
            .notifications
            .lock()
            .iter()
            .filter(|n| n.user_id == user_id && !n.seen)
            .count();
        Ok(count as i64)
    }

    async fn is_group_member(
        &self,
        user_id: UserId,
        group_id: GroupId,
    ) -> Result<bool, StorageError> {
        self.check()?;
        Ok(self.members.lock().contains(&(group_id, user_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn unseen_count_tracks_seen_flag() {
        let storage = MemoryStorage::new();
        let first = storage
            .insert_notification(NewNotification::new(7, "follow_accepted", json!({})))
            .await
            .unwrap();
        storage
            .insert_notification(NewNotification::new(7, "group_invite", json!({"group_id": 3})))
            .await
            .unwrap();
        storage
            .insert_notification(NewNotification::new(8, "group_invite", json!({})))
            .await
            .unwrap();

        assert_eq!(storage.count_unseen(7).await.unwrap(), 2);
        storage.mark_seen(first.id);
        assert_eq!(storage.count_unseen(7).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failing_mode_rejects_calls() {
        let storage = MemoryStorage::new();
        storage.set_failing(true);
        assert!(storage.is_group_member(1, 1).await.is_err());
        storage.set_failing(false);
        storage.add_member(1, 1);
        assert!(storage.is_group_member(1, 1).await.unwrap());
    }
}
