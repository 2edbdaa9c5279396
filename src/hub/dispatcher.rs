//! Routing: decides which connections receive a decoded message and enqueues onto them.
//!
//! Live delivery is best-effort and never waits on a recipient. Persistence runs on its own
//! task and neither path can fail or delay the other.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::connection::ConnectionHandle;
use super::protocol::{ChatFrame, ClientMessage, OutboundFrame, ServerFrame};
use super::registry::Registry;
use crate::error::HubError;
use crate::metrics::{HubMetrics, DROP_CLOSED, DROP_OFFLINE, DROP_SLOW_CONSUMER};
use crate::models::NewMessage;
use crate::storage::Storage;
use crate::{GroupId, UserId};

/// What happened to the live side of one routing call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Recipient not connected. Not an error.
    pub missed: usize,
    /// Recipient connected but the frame could not be queued (slow consumer or closing).
    pub dropped: usize,
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    storage: Arc<dyn Storage>,
    metrics: HubMetrics,
    echo_group_to_sender: bool,
    require_group_membership: bool,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        storage: Arc<dyn Storage>,
        metrics: HubMetrics,
        echo_group_to_sender: bool,
        require_group_membership: bool,
    ) -> Self {
        Self {
            registry,
            storage,
            metrics,
            echo_group_to_sender,
            require_group_membership,
        }
    }

    /// Route one message from the authenticated `sender`.
    pub async fn route(&self, sender: UserId, msg: ClientMessage) -> Delivery {
        match msg {
            ClientMessage::Private { receiver_id, content } => {
                self.route_private(sender, receiver_id, content)
            }
            ClientMessage::Group { group_id, content } => {
                self.route_group(sender, group_id, content)
            }
            ClientMessage::JoinGroup { group_id } => {
                self.join(sender, group_id).await;
                Delivery::default()
            }
        }
    }

    fn route_private(&self, sender: UserId, receiver_id: UserId, content: String) -> Delivery {
        let now = Utc::now();
        let frame = ServerFrame::Private(ChatFrame {
            sender_id: sender,
            receiver_id: Some(receiver_id),
            group_id: None,
            content: content.clone(),
            timestamp: now,
        });
        self.persist(NewMessage {
            sender_id: sender,
            receiver_id: Some(receiver_id),
            group_id: None,
            content,
            created_at: now,
        });
        debug!(sender, receiver_id, "routing private message");
        self.send_to_user(receiver_id, &frame)
    }

    /// Fan out to the group's live set. Membership is enforced when users join that set, so
    /// storage is never consulted here.
    fn route_group(&self, sender: UserId, group_id: GroupId, content: String) -> Delivery {
        let now = Utc::now();
        let frame = ServerFrame::Group(ChatFrame {
            sender_id: sender,
            receiver_id: None,
            group_id: Some(group_id),
            content: content.clone(),
            timestamp: now,
        });
        self.persist(NewMessage {
            sender_id: sender,
            receiver_id: None,
            group_id: Some(group_id),
            content,
            created_at: now,
        });

        let Some(encoded) = self.encode(&frame) else {
            return Delivery::default();
        };
        let mut delivery = Delivery::default();
        for conn in self.registry.member_connections(group_id) {
            if conn.user_id() == sender && !self.echo_group_to_sender {
                continue;
            }
            self.deliver(&conn, encoded.clone(), &mut delivery);
        }
        debug!(sender, group_id, ?delivery, "group message fanned out");
        delivery
    }

    /// Verify durable membership (when required) and add the user to the group's live set.
    pub async fn join(&self, user_id: UserId, group_id: GroupId) -> bool {
        if !self.authorized(user_id, group_id).await {
            warn!(user_id, group_id, "join refused: not a group member");
            return false;
        }
        let joined = self.registry.join(user_id, group_id);
        if joined {
            info!(user_id, group_id, "joined group live set");
        } else {
            debug!(user_id, group_id, "join ignored: user not connected");
        }
        joined
    }

    /// Enqueue `frame` on the user's connection if they are online.
    pub fn send_to_user(&self, user_id: UserId, frame: &ServerFrame) -> Delivery {
        let mut delivery = Delivery::default();
        let Some(conn) = self.registry.lookup(user_id) else {
            delivery.missed += 1;
            self.metrics.dropped(DROP_OFFLINE);
            debug!(user_id, "recipient offline");
            return delivery;
        };
        if let Some(encoded) = self.encode(frame) {
            self.deliver(&conn, encoded, &mut delivery);
        }
        delivery
    }

    /// Enqueue `frame` on every live connection, with the same slow-consumer policy as groups.
    pub fn broadcast(&self, frame: &ServerFrame) -> Delivery {
        let mut delivery = Delivery::default();
        let Some(encoded) = self.encode(frame) else {
            return delivery;
        };
        for conn in self.registry.connections() {
            self.deliver(&conn, encoded.clone(), &mut delivery);
        }
        delivery
    }

    async fn authorized(&self, user_id: UserId, group_id: GroupId) -> bool {
        if !self.require_group_membership {
            return true;
        }
        match self.storage.is_group_member(user_id, group_id).await {
            Ok(member) => member,
            Err(e) => {
                self.metrics.persistence_failures.inc();
                warn!(user_id, group_id, error = %e, "membership check failed");
                false
            }
        }
    }

    fn encode(&self, frame: &ServerFrame) -> Option<OutboundFrame> {
        match frame.encode() {
            Ok(encoded) => Some(encoded),
            Err(e) => {
                warn!(error = %e, "failed to serialize frame");
                None
            }
        }
    }

    fn deliver(&self, conn: &ConnectionHandle, frame: OutboundFrame, delivery: &mut Delivery) {
        match conn.try_send(frame) {
            Ok(()) => {
                delivery.delivered += 1;
                self.metrics.frames_delivered.inc();
            }
            Err(HubError::SlowConsumer { user_id }) => {
                delivery.dropped += 1;
                self.metrics.dropped(DROP_SLOW_CONSUMER);
                if self.registry.unregister(user_id, conn.conn_id()) {
                    self.metrics.slow_consumer_disconnects.inc();
                    warn!(
                        user_id,
                        conn_id = conn.conn_id(),
                        "outbound queue full, disconnecting slow consumer"
                    );
                }
            }
            Err(e) => {
                delivery.dropped += 1;
                self.metrics.dropped(DROP_CLOSED);
                debug!(user_id = conn.user_id(), error = %e, "frame dropped");
            }
        }
    }

    fn persist(&self, msg: NewMessage) {
        let storage = self.storage.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let sender = msg.sender_id;
            match storage.insert_message(msg).await {
                Ok((id, _)) => debug!(sender, message_id = id, "message persisted"),
                Err(e) => {
                    metrics.persistence_failures.inc();
                    warn!(sender, error = %e, "failed to persist message");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubSettings;
    use crate::hub::test_support::{drain_json, test_hub, wait_for_messages};
    use std::time::Duration;

    fn private(receiver_id: UserId, content: &str) -> ClientMessage {
        ClientMessage::Private {
            receiver_id,
            content: content.to_string(),
        }
    }

    fn group(group_id: GroupId, content: &str) -> ClientMessage {
        ClientMessage::Group {
            group_id,
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn private_message_reaches_receiver_once_and_is_persisted_once() {
        let (hub, storage) = test_hub(HubSettings::default());
        let (_a, mut a_rx) = hub.connect(1);
        let (_b, mut b_rx) = hub.connect(2);

        let delivery = hub.dispatcher().route(1, private(2, "hi")).await;
        assert_eq!(
            delivery,
            Delivery {
                delivered: 1,
                missed: 0,
                dropped: 0
            }
        );

        let frames = drain_json(&mut b_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "private");
        assert_eq!(frames[0]["sender_id"], 1);
        assert_eq!(frames[0]["receiver_id"], 2);
        assert_eq!(frames[0]["content"], "hi");
        assert!(drain_json(&mut a_rx).is_empty());

        let stored = wait_for_messages(&storage, 1).await;
        assert_eq!(stored[0].sender_id, 1);
        assert_eq!(stored[0].receiver_id, Some(2));
    }

    #[tokio::test]
    async fn private_message_to_offline_user_is_silent() {
        let (hub, storage) = test_hub(HubSettings::default());
        let (_a, mut a_rx) = hub.connect(1);

        let delivery = hub.dispatcher().route(1, private(2, "anyone?")).await;
        assert_eq!(
            delivery,
            Delivery {
                delivered: 0,
                missed: 1,
                dropped: 0
            }
        );
        assert!(drain_json(&mut a_rx).is_empty());
        // Durable history is unaffected by the routing miss.
        assert_eq!(wait_for_messages(&storage, 1).await.len(), 1);
    }

    #[tokio::test]
    async fn persistence_failure_does_not_block_live_delivery() {
        let (hub, storage) = test_hub(HubSettings::default());
        storage.set_failing(true);
        let (_a, _a_rx) = hub.connect(1);
        let (_b, mut b_rx) = hub.connect(2);

        let delivery = hub.dispatcher().route(1, private(2, "still delivered")).await;
        assert_eq!(delivery.delivered, 1);
        assert_eq!(drain_json(&mut b_rx).len(), 1);

        tokio::time::timeout(Duration::from_secs(2), async {
            while hub.metrics().persistence_failures.get() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn group_message_reaches_joined_members_only() {
        let (hub, storage) = test_hub(HubSettings::default());
        for uid in [1, 2, 3] {
            storage.add_member(5, uid);
        }
        let (_a, mut a_rx) = hub.connect(1);
        let (_b, mut b_rx) = hub.connect(2);
        let (_c, mut c_rx) = hub.connect(3);
        assert!(hub.dispatcher().join(1, 5).await);
        assert!(hub.dispatcher().join(2, 5).await);

        let delivery = hub.dispatcher().route(1, group(5, "hello group")).await;
        assert_eq!(delivery.delivered, 1);

        let b_frames = drain_json(&mut b_rx);
        assert_eq!(b_frames.len(), 1);
        assert_eq!(b_frames[0]["type"], "group");
        assert_eq!(b_frames[0]["group_id"], 5);
        assert_eq!(b_frames[0]["sender_id"], 1);
        assert!(drain_json(&mut c_rx).is_empty());
        assert!(drain_json(&mut a_rx).is_empty());
    }

    #[tokio::test]
    async fn group_echo_is_configurable() {
        let settings = HubSettings {
            echo_group_to_sender: true,
            ..HubSettings::default()
        };
        let (hub, storage) = test_hub(settings);
        storage.add_member(5, 1);
        let (_a, mut a_rx) = hub.connect(1);
        hub.dispatcher().join(1, 5).await;

        hub.dispatcher().route(1, group(5, "echo")).await;
        assert_eq!(drain_json(&mut a_rx).len(), 1);
    }

    #[tokio::test]
    async fn join_requires_durable_membership() {
        let (hub, storage) = test_hub(HubSettings::default());
        let (_a, _a_rx) = hub.connect(1);

        hub.dispatcher()
            .route(1, ClientMessage::JoinGroup { group_id: 9 })
            .await;
        assert!(!hub.registry().is_member(1, 9));

        storage.add_member(9, 1);
        hub.dispatcher()
            .route(1, ClientMessage::JoinGroup { group_id: 9 })
            .await;
        assert!(hub.registry().is_member(1, 9));
    }

    #[tokio::test]
    async fn membership_check_can_be_disabled() {
        let settings = HubSettings {
            require_group_membership: false,
            ..HubSettings::default()
        };
        let (hub, _storage) = test_hub(settings);
        let (_a, _a_rx) = hub.connect(1);
        assert!(hub.dispatcher().join(1, 9).await);
    }

    #[tokio::test]
    async fn group_delivery_survives_storage_outage() {
        let (hub, storage) = test_hub(HubSettings::default());
        storage.add_member(5, 1);
        storage.add_member(5, 2);
        let (_a, _a_rx) = hub.connect(1);
        let (_b, mut b_rx) = hub.connect(2);
        assert!(hub.dispatcher().join(1, 5).await);
        assert!(hub.dispatcher().join(2, 5).await);

        storage.set_failing(true);
        let delivery = hub.dispatcher().route(1, group(5, "still live")).await;

        assert_eq!(delivery.delivered, 1);
        let frames = drain_json(&mut b_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["content"], "still live");
        tokio::time::timeout(Duration::from_secs(2), async {
            while hub.metrics().persistence_failures.get() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn private_messages_keep_sender_order() {
        let (hub, _storage) = test_hub(HubSettings::default());
        let (_a, _a_rx) = hub.connect(1);
        let (_b, mut b_rx) = hub.connect(2);

        for i in 0..50 {
            hub.dispatcher().route(1, private(2, &i.to_string())).await;
        }

        let contents: Vec<String> = drain_json(&mut b_rx)
            .iter()
            .map(|f| f["content"].as_str().unwrap().to_string())
            .collect();
        let expected: Vec<String> = (0..50).map(|i: i32| i.to_string()).collect();
        assert_eq!(contents, expected);
    }

    #[tokio::test]
    async fn slow_consumer_is_torn_down_without_affecting_others() {
        let settings = HubSettings {
            outbound_capacity: 4,
            ..HubSettings::default()
        };
        let (hub, storage) = test_hub(settings);
        let senders: Vec<UserId> = (10..20).collect();
        storage.add_member(5, 1);
        storage.add_member(5, 2);

        // Senders post without joining the live set. User 1 never drains its queue; user 2
        // drains after every message.
        let (slow, _slow_rx) = hub.connect(1);
        let (_fast, mut fast_rx) = hub.connect(2);
        hub.dispatcher().join(1, 5).await;
        hub.dispatcher().join(2, 5).await;

        let mut fast_received = 0;
        for &uid in &senders {
            hub.dispatcher().route(uid, group(5, "burst")).await;
            fast_received += drain_json(&mut fast_rx).len();
        }

        assert!(!slow.is_open());
        assert!(hub.registry().lookup(1).is_none());
        assert!(!hub.registry().is_member(1, 5));
        assert_eq!(fast_received, senders.len());
        assert_eq!(hub.metrics().slow_consumer_disconnects.get(), 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connection() {
        let (hub, _storage) = test_hub(HubSettings::default());
        let mut rxs: Vec<_> = (1..=3).map(|uid| hub.connect(uid).1).collect();

        let delivery = hub.broadcast_all(serde_json::json!({"maintenance": true}));
        assert_eq!(delivery.delivered, 3);
        for rx in &mut rxs {
            let frames = drain_json(rx);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["type"], "broadcast");
            assert_eq!(frames[0]["payload"]["maintenance"], true);
        }
    }
}
