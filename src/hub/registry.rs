//! Connection registry: maps user id to its single live connection and group id to the users
//! joined for live delivery. Both tables sit behind one lock, so every mutation is serialized
//! and the cross-table invariants hold at every instant.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::connection::ConnectionHandle;
use crate::metrics::HubMetrics;
use crate::{GroupId, UserId};

#[derive(Default)]
struct Tables {
    users: HashMap<UserId, Arc<ConnectionHandle>>,
    /// Live sets. A user id here always has an entry in `users`.
    groups: HashMap<GroupId, HashSet<UserId>>,
    /// Set by `shutdown`; later registrations are closed on arrival.
    closed: bool,
}

impl Tables {
    fn leave_all_groups(&mut self, user_id: UserId) {
        self.groups.retain(|_, members| {
            members.remove(&user_id);
            !members.is_empty()
        });
    }
}

pub struct Registry {
    tables: RwLock<Tables>,
    metrics: HubMetrics,
}

impl Registry {
    pub fn new(metrics: HubMetrics) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            metrics,
        }
    }

    /// Install `conn` for its user, closing and replacing any connection already there.
    /// Group joins of the replaced connection are not carried over.
    pub fn register(&self, conn: Arc<ConnectionHandle>) {
        let user_id = conn.user_id();
        let conn_id = conn.conn_id();
        if !conn.mark_registered() {
            debug!(user_id, conn_id, "not registering a connection that already closed");
            return;
        }

        let replaced = {
            let mut tables = self.tables.write();
            if tables.closed {
                conn.close();
                drop(tables);
                info!(user_id, conn_id, "registry shut down, closing late connection");
                return;
            }
            let previous = tables.users.insert(user_id, conn);
            if let Some(prev) = &previous {
                prev.close();
                tables.leave_all_groups(user_id);
            }
            previous
        };

        match replaced {
            Some(prev) => info!(
                user_id,
                conn_id,
                replaced_conn_id = prev.conn_id(),
                "connection replaced"
            ),
            None => {
                self.metrics.connections.inc();
                info!(user_id, conn_id, "connection registered");
            }
        }
    }

    /// Remove the user's connection if it is still `conn_id`; a stale id is a no-op so that a
    /// late teardown never removes the connection that replaced it.
    pub fn unregister(&self, user_id: UserId, conn_id: u64) -> bool {
        let removed = {
            let mut tables = self.tables.write();
            match tables.users.get(&user_id) {
                Some(current) if current.conn_id() == conn_id => {
                    let removed = tables.users.remove(&user_id);
                    tables.leave_all_groups(user_id);
                    if let Some(conn) = &removed {
                        conn.close();
                    }
                    removed
                }
                _ => None,
            }
        };

        if removed.is_some() {
            self.metrics.connections.dec();
            info!(user_id, conn_id, "connection unregistered");
            true
        } else {
            debug!(user_id, conn_id, "stale unregister ignored");
            false
        }
    }

    /// Add `user_id` to the live set of `group_id`. No-op unless the user is connected.
    pub fn join(&self, user_id: UserId, group_id: GroupId) -> bool {
        let mut tables = self.tables.write();
        if !tables.users.contains_key(&user_id) {
            return false;
        }
        tables.groups.entry(group_id).or_default().insert(user_id);
        true
    }

    pub fn lookup(&self, user_id: UserId) -> Option<Arc<ConnectionHandle>> {
        self.tables.read().users.get(&user_id).cloned()
    }

    pub fn members(&self, group_id: GroupId) -> HashSet<UserId> {
        self.tables
            .read()
            .groups
            .get(&group_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of the connections joined to `group_id`, taken under a single read lock.
    pub fn member_connections(&self, group_id: GroupId) -> Vec<Arc<ConnectionHandle>> {
        let tables = self.tables.read();
        tables
            .groups
            .get(&group_id)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|uid| tables.users.get(uid).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_member(&self, user_id: UserId, group_id: GroupId) -> bool {
        self.tables
            .read()
            .groups
            .get(&group_id)
            .is_some_and(|members| members.contains(&user_id))
    }

    pub fn connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.tables.read().users.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tables.read().users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every live connection and clear both tables. Returns how many were closed.
    /// Connections registered afterwards are closed immediately.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<Arc<ConnectionHandle>> = {
            let mut tables = self.tables.write();
            tables.closed = true;
            tables.groups.clear();
            let drained: Vec<_> = tables.users.drain().map(|(_, conn)| conn).collect();
            for conn in &drained {
                conn.close();
            }
            drained
        };
        self.metrics.connections.set(0);
        info!(closed = drained.len(), "registry shut down");
        drained.len()
    }
}
