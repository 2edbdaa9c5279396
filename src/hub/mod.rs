//! Real-time messaging hub: one live WebSocket per authenticated user, private and group routing,
//! and live push of notifications. Cloning a `Hub` is cheap; every clone shares the same state.

pub mod connection;
pub mod dispatcher;
pub mod fanout;
pub mod protocol;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use axum::extract::ws::Message;
use chrono::Utc;
use futures::{Sink, Stream};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::{ConfigError, HubSettings};
use crate::error::HubError;
use crate::metrics::HubMetrics;
use crate::models::{NewNotification, Notification};
use crate::storage::Storage;
use crate::UserId;

pub use connection::{ConnectionHandle, ConnectionState};
pub use dispatcher::{Delivery, Dispatcher};
pub use fanout::NotificationFanout;
pub use protocol::{ClientMessage, NotificationAction, OutboundFrame, ServerFrame};
pub use registry::Registry;

#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    fanout: NotificationFanout,
    storage: Arc<dyn Storage>,
    metrics: HubMetrics,
    settings: HubSettings,
}

impl Hub {
    /// Fails if `settings` would leave the hub unable to run a connection.
    pub fn new(
        settings: HubSettings,
        storage: Arc<dyn Storage>,
        metrics: HubMetrics,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;
        let registry = Arc::new(Registry::new(metrics.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            storage.clone(),
            metrics.clone(),
            settings.echo_group_to_sender,
            settings.require_group_membership,
        ));
        let fanout = NotificationFanout::new(
            registry.clone(),
            dispatcher.clone(),
            storage.clone(),
            metrics.clone(),
        );
        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                dispatcher,
                fanout,
                storage,
                metrics,
                settings,
            }),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn metrics(&self) -> &HubMetrics {
        &self.inner.metrics
    }

    pub fn settings(&self) -> &HubSettings {
        &self.inner.settings
    }

    /// Create a connection for an authenticated user and register it, replacing any
    /// connection the user already had. The receiver feeds that connection's writer.
    pub fn connect(
        &self,
        user_id: UserId,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundFrame>) {
        let (conn, rx) = ConnectionHandle::new(user_id, self.inner.settings.outbound_capacity);
        self.inner.registry.register(conn.clone());
        (conn, rx)
    }

    /// Run a connection returned by [`Hub::connect`] over a split transport until it closes.
    pub async fn serve<W, R, E>(
        &self,
        conn: Arc<ConnectionHandle>,
        rx: mpsc::Receiver<OutboundFrame>,
        sink: W,
        stream: R,
    ) where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: fmt::Display + Send,
        R: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: fmt::Display + Send,
    {
        connection::serve(self.clone(), conn, rx, sink, stream).await
    }

    /// Push a stored notification to its target. Offline targets are skipped silently.
    pub async fn push_notification(&self, notification: &Notification) -> Delivery {
        self.inner.fanout.push(notification).await
    }

    pub async fn push_unread_update(
        &self,
        user_id: UserId,
        action: NotificationAction,
    ) -> Delivery {
        self.inner.fanout.push_unread_update(user_id, action).await
    }

    /// Store a notification, then push it live. A storage failure is returned and nothing is
    /// pushed; delivery problems never are.
    pub async fn notify(&self, notification: NewNotification) -> Result<Notification, HubError> {
        let stored = self
            .inner
            .storage
            .insert_notification(notification)
            .await
            .inspect_err(|_| self.inner.metrics.persistence_failures.inc())?;
        self.push_notification(&stored).await;
        Ok(stored)
    }

    /// Send a server broadcast frame to every live connection.
    pub fn broadcast_all(&self, payload: serde_json::Value) -> Delivery {
        let frame = ServerFrame::Broadcast(protocol::BroadcastFrame {
            payload,
            timestamp: Utc::now(),
        });
        let delivery = self.inner.dispatcher.broadcast(&frame);
        info!(?delivery, "broadcast sent");
        delivery
    }

    /// Close every live connection. Upgrades that complete afterwards are closed as soon as
    /// they register.
    pub fn shutdown(&self) -> usize {
        self.inner.registry.shutdown()
    }
}
