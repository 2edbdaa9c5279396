//! Storage collaborator consumed by the hub. The hub never runs SQL itself; it only calls
//! through `Storage`, and treats every call as independent of live delivery.

mod memory;
mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{NewMessage, NewNotification, Notification};
use crate::{GroupId, UserId};

pub use memory::MemoryStorage;
pub use pg::{run_migrations, PgPool, PgStorage};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database pool: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error("query: {0}")]
    Query(#[from] diesel::result::Error),
    #[error("blocking task: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist a chat message; returns the assigned id and the stored timestamp.
    async fn insert_message(&self, msg: NewMessage) -> Result<(i64, DateTime<Utc>), StorageError>;

    async fn insert_notification(&self, n: NewNotification) -> Result<Notification, StorageError>;

    async fn count_unseen(&self, user_id: UserId) -> Result<i64, StorageError>;

    /// Durable group membership. Authoritative; the hub never caches the answer.
    async fn is_group_member(
        &self,
        user_id: UserId,
        group_id: GroupId,
    ) -> Result<bool, StorageError>;
}
