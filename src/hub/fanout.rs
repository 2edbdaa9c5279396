//! Live push of notifications produced by business logic. Offline users get nothing here;
//! they read their notifications through the ordinary CRUD endpoints.

use std::sync::Arc;

use tracing::{debug, warn};

use super::dispatcher::{Delivery, Dispatcher};
use super::protocol::{NotificationAction, NotificationFrame, ServerFrame};
use super::registry::Registry;
use crate::metrics::{HubMetrics, DROP_OFFLINE};
use crate::models::Notification;
use crate::storage::Storage;
use crate::UserId;

pub struct NotificationFanout {
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    storage: Arc<dyn Storage>,
    metrics: HubMetrics,
}

impl NotificationFanout {
    pub fn new(
        registry: Arc<Registry>,
        dispatcher: Arc<Dispatcher>,
        storage: Arc<dyn Storage>,
        metrics: HubMetrics,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            storage,
            metrics,
        }
    }

    /// Push an already-stored notification to its target if they are online.
    pub async fn push(&self, notification: &Notification) -> Delivery {
        self.push_frame(notification.user_id, NotificationAction::New, Some(notification))
            .await
    }

    /// Push a body-less frame with a fresh unread count, after notifications were marked
    /// seen or deleted.
    pub async fn push_unread_update(
        &self,
        user_id: UserId,
        action: NotificationAction,
    ) -> Delivery {
        self.push_frame(user_id, action, None).await
    }

    async fn push_frame(
        &self,
        user_id: UserId,
        action: NotificationAction,
        notification: Option<&Notification>,
    ) -> Delivery {
        // Skip the unread-count query entirely for offline users.
        if self.registry.lookup(user_id).is_none() {
            self.metrics.dropped(DROP_OFFLINE);
            debug!(user_id, ?action, "notification target offline");
            return Delivery {
                missed: 1,
                ..Delivery::default()
            };
        }

        let unread_count = match self.storage.count_unseen(user_id).await {
            Ok(count) => count,
            Err(e) => {
                self.metrics.persistence_failures.inc();
                warn!(user_id, error = %e, "failed to count unseen notifications");
                if action == NotificationAction::New {
                    1
                } else {
                    0
                }
            }
        };

        let frame = ServerFrame::Notification(NotificationFrame {
            action,
            notification: notification.cloned(),
            unread_count,
        });
        let delivery = self.dispatcher.send_to_user(user_id, &frame);
        debug!(user_id, ?action, unread_count, ?delivery, "notification pushed");
        delivery
    }
}
