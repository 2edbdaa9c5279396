//! Postgres storage via diesel. Diesel is blocking, so every call hops onto `spawn_blocking`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use super::{Storage, StorageError};
use crate::models::{NewMessage, NewNotification, Notification};
use crate::schema::{group_members, messages, notifications};
use crate::{GroupId, UserId};

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Apply pending migrations. Called once at startup, before the hub accepts connections.
pub fn run_migrations(pool: &PgPool) -> Result<usize, StorageError> {
    let mut conn = pool.get()?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| StorageError::Unavailable(format!("migrations: {e}")))?;
    Ok(applied.len())
}

#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PooledConnection<ConnectionManager<PgConnection>>) -> Result<T, StorageError>
            + Send
            + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn insert_message(&self, msg: NewMessage) -> Result<(i64, DateTime<Utc>), StorageError> {
        self.with_conn(move |conn| {
            let row = diesel::insert_into(messages::table)
                .values(&msg)
                .returning((messages::id, messages::created_at))
                .get_result::<(i64, DateTime<Utc>)>(conn)?;
            Ok(row)
        })
        .await
    }

    async fn insert_notification(&self, n: NewNotification) -> Result<Notification, StorageError> {
        self.with_conn(move |conn| {
            let stored = diesel::insert_into(notifications::table)
                .values(&n)
                .returning(Notification::as_returning())
                .get_result(conn)?;
            Ok(stored)
        })
        .await
    }

    async fn count_unseen(&self, user_id: UserId) -> Result<i64, StorageError> {
        self.with_conn(move |conn| {
            use crate::schema::notifications::dsl;
            let count = notifications::table
                .filter(dsl::user_id.eq(user_id).and(dsl::seen.eq(false)))
                .count()
                .get_result::<i64>(conn)?;
            Ok(count)
        })
        .await
    }

    async fn is_group_member(
        &self,
        user_id: UserId,
        group_id: GroupId,
    ) -> Result<bool, StorageError> {
        self.with_conn(move |conn| {
            use crate::schema::group_members::dsl;
            let exists = group_members::table
                .filter(dsl::group_id.eq(group_id).and(dsl::user_id.eq(user_id)))
                .count()
                .get_result::<i64>(conn)?;
            Ok(exists > 0)
        })
        .await
    }
}
