//! Topic-based event fan-out to live subscriber connections.
//!
//! The [`Broadcaster`] owns the subscriber registry; connection handlers and
//! orchestrator components only go through its methods, so a single-writer
//! discipline holds for the registry. Delivery is best-effort and
//! fire-and-forget: a subscriber whose channel is gone is dropped, and one
//! dead subscriber never affects delivery to the rest.

pub mod messages;

pub use messages::*;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::db::{ConnectionRecord, ConnectionStatus, Store};
use crate::error::Result;

/// Identity a subscriber may attach after connecting
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub client_id: String,
    pub client_name: Option<String>,
    pub client_version: Option<String>,
    pub platform: Option<String>,
}

/// Point-in-time view of one connected subscriber
#[derive(Debug, Clone)]
pub struct SubscriberInfo {
    pub id: String,
    pub client_name: Option<String>,
    pub last_seen: i64,
    pub topic_count: usize,
}

/// One live subscriber connection
struct Subscriber {
    id: String,
    identity: Option<ClientIdentity>,
    last_seen: i64,
    topics: HashSet<String>,
    sender: UnboundedSender<ServerMessage>,
}

/// Topic-addressed publish/subscribe hub.
pub struct Broadcaster {
    store: Arc<dyn Store>,
    clients: RwLock<HashMap<String, Subscriber>>,
}

impl Broadcaster {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            store,
            clients: RwLock::new(HashMap::new()),
        })
    }

    /// Register a new subscriber connection. Returns its assigned id and the
    /// channel the connection handler drains towards the socket. A `welcome`
    /// message is already queued on it.
    pub async fn connect(&self) -> (String, UnboundedReceiver<ServerMessage>) {
        let client_id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();

        let _ = sender.send(ServerMessage::Welcome {
            client_id: client_id.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        });

        let mut clients = self.clients.write().await;
        clients.insert(
            client_id.clone(),
            Subscriber {
                id: client_id.clone(),
                identity: None,
                last_seen: chrono::Utc::now().timestamp_millis(),
                topics: HashSet::new(),
                sender,
            },
        );
        info!(client_id = %client_id, "Subscriber connected");

        (client_id, receiver)
    }

    /// Handle one inbound message from a subscriber
    pub async fn handle_message(&self, client_id: &str, message: ClientMessage) {
        match message {
            ClientMessage::Register(payload) => self.handle_register(client_id, payload).await,
            ClientMessage::Subscribe(payload) => {
                self.set_subscription(client_id, payload.topic, true).await
            }
            ClientMessage::Unsubscribe(payload) => {
                self.set_subscription(client_id, payload.topic, false).await
            }
            ClientMessage::Ping => {
                self.touch(client_id).await;
                self.send_to(
                    client_id,
                    ServerMessage::Pong {
                        timestamp: chrono::Utc::now().to_rfc3339(),
                    },
                )
                .await;
            }
        }
    }

    async fn handle_register(&self, client_id: &str, payload: RegisterPayload) {
        let identity = ClientIdentity {
            client_id: payload.client_id.unwrap_or_else(|| client_id.to_string()),
            client_name: payload.client_name,
            client_version: payload.client_version,
            platform: payload.platform,
        };

        let last_seen;
        {
            let mut clients = self.clients.write().await;
            let Some(subscriber) = clients.get_mut(client_id) else {
                return;
            };
            subscriber.last_seen = chrono::Utc::now().timestamp_millis();
            last_seen = subscriber.last_seen;
            subscriber.identity = Some(identity.clone());
        }

        if let Err(e) = self.persist_identity(client_id, &identity, last_seen, ConnectionStatus::Connected)
        {
            warn!(client_id = %client_id, error = %e, "Failed to persist connection record");
        }

        info!(
            client_id = %client_id,
            client_name = identity.client_name.as_deref().unwrap_or(""),
            "Subscriber registered"
        );

        self.send_to(
            client_id,
            ServerMessage::Registered {
                data: RegisteredPayload {
                    client_id: identity.client_id,
                    server_time: chrono::Utc::now().to_rfc3339(),
                },
            },
        )
        .await;
    }

    async fn set_subscription(&self, client_id: &str, topic: String, subscribe: bool) {
        {
            let mut clients = self.clients.write().await;
            let Some(subscriber) = clients.get_mut(client_id) else {
                return;
            };
            subscriber.last_seen = chrono::Utc::now().timestamp_millis();
            if subscribe {
                subscriber.topics.insert(topic.clone());
            } else {
                subscriber.topics.remove(&topic);
            }
        }
        debug!(client_id = %client_id, topic = %topic, subscribe, "Subscription changed");

        let payload = TopicPayload { topic };
        let ack = if subscribe {
            ServerMessage::Subscribed { data: payload }
        } else {
            ServerMessage::Unsubscribed { data: payload }
        };
        self.send_to(client_id, ack).await;
    }

    /// Remove a subscriber; all its topic memberships are revoked
    pub async fn disconnect(&self, client_id: &str) {
        let removed = {
            let mut clients = self.clients.write().await;
            clients.remove(client_id)
        };
        let Some(subscriber) = removed else { return };

        if let Some(identity) = &subscriber.identity {
            let now = chrono::Utc::now().timestamp_millis();
            if let Err(e) =
                self.persist_identity(client_id, identity, now, ConnectionStatus::Disconnected)
            {
                warn!(client_id = %client_id, error = %e, "Failed to persist disconnect");
            }
        }
        info!(client_id = %client_id, "Subscriber disconnected");
    }

    /// Deliver an event to every subscriber of exactly this topic. Returns
    /// how many subscribers it was handed to; dead subscribers are dropped.
    pub async fn publish(&self, topic: &str, data: &EventData) -> usize {
        let targets: Vec<(String, UnboundedSender<ServerMessage>)> = {
            let clients = self.clients.read().await;
            clients
                .values()
                .filter(|s| s.topics.contains(topic))
                .map(|s| (s.id.clone(), s.sender.clone()))
                .collect()
        };

        let mut sent = 0;
        let mut dead = Vec::new();
        for (id, sender) in targets {
            let message = ServerMessage::Broadcast {
                topic: topic.to_string(),
                data: data.clone(),
            };
            if sender.send(message).is_ok() {
                sent += 1;
            } else {
                warn!(client_id = %id, topic = %topic, "Dropping unreachable subscriber");
                dead.push(id);
            }
        }
        for id in dead {
            self.disconnect(&id).await;
        }
        sent
    }

    /// Publish a task progress event to `task:<id>` and `tasks:all`
    pub async fn publish_task_progress(&self, update: ProgressUpdate) {
        let topic = format!("task:{}", update.task_id);
        let data = EventData::TaskProgress(update);
        self.publish(&topic, &data).await;
        self.publish("tasks:all", &data).await;
    }

    /// Publish a task completion event to `task:<id>` and `tasks:all`
    pub async fn publish_task_completed(&self, task_id: &str, result: serde_json::Value) {
        let data = EventData::TaskCompleted(TaskCompletedPayload {
            task_id: task_id.to_string(),
            result,
            timestamp: chrono::Utc::now().to_rfc3339(),
        });
        self.publish(&format!("task:{task_id}"), &data).await;
        self.publish("tasks:all", &data).await;
    }

    /// Publish a service status event to `service:<id>` and `services:all`
    pub async fn publish_service_status(&self, service_id: &str, status: ServiceEvent) {
        let data = EventData::ServiceStatus(ServiceStatusPayload {
            service_id: service_id.to_string(),
            status,
            timestamp: chrono::Utc::now().to_rfc3339(),
        });
        self.publish(&format!("service:{service_id}"), &data).await;
        self.publish("services:all", &data).await;
    }

    /// Number of live subscriber connections
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Snapshot of connected subscribers
    pub async fn connected_clients(&self) -> Vec<SubscriberInfo> {
        let clients = self.clients.read().await;
        clients
            .values()
            .map(|s| SubscriberInfo {
                id: s.id.clone(),
                client_name: s.identity.as_ref().and_then(|i| i.client_name.clone()),
                last_seen: s.last_seen,
                topic_count: s.topics.len(),
            })
            .collect()
    }

    async fn touch(&self, client_id: &str) {
        let mut clients = self.clients.write().await;
        if let Some(subscriber) = clients.get_mut(client_id) {
            subscriber.last_seen = chrono::Utc::now().timestamp_millis();
        }
    }

    async fn send_to(&self, client_id: &str, message: ServerMessage) {
        let sender = {
            let clients = self.clients.read().await;
            clients.get(client_id).map(|s| s.sender.clone())
        };
        if let Some(sender) = sender {
            if sender.send(message).is_err() {
                self.disconnect(client_id).await;
            }
        }
    }

    fn persist_identity(
        &self,
        connection_id: &str,
        identity: &ClientIdentity,
        last_seen: i64,
        status: ConnectionStatus,
    ) -> Result<()> {
        self.store.upsert_connection(&ConnectionRecord {
            id: connection_id.to_string(),
            client_id: identity.client_id.clone(),
            client_name: identity.client_name.clone(),
            client_version: identity.client_version.clone(),
            platform: identity.platform.clone(),
            last_seen,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_broadcaster() -> Arc<Broadcaster> {
        let db = Arc::new(Database::open_in_memory().unwrap());
        Broadcaster::new(db)
    }

    async fn expect_welcome(rx: &mut UnboundedReceiver<ServerMessage>) {
        match rx.recv().await.unwrap() {
            ServerMessage::Welcome { .. } => {}
            other => panic!("expected welcome, got {other:?}"),
        }
    }

    async fn subscribe(b: &Broadcaster, id: &str, rx: &mut UnboundedReceiver<ServerMessage>, topic: &str) {
        b.handle_message(
            id,
            ClientMessage::Subscribe(TopicPayload {
                topic: topic.to_string(),
            }),
        )
        .await;
        match rx.recv().await.unwrap() {
            ServerMessage::Subscribed { data } => assert_eq!(data.topic, topic),
            other => panic!("expected subscribed ack, got {other:?}"),
        }
    }

    fn progress(task_id: &str) -> ProgressUpdate {
        ProgressUpdate {
            task_id: task_id.to_string(),
            progress: 10,
            current_step: "dispatched".to_string(),
            total_steps: 100,
            completed_steps: 10,
            logs: vec![],
        }
    }

    #[tokio::test]
    async fn test_connect_sends_welcome() {
        let broadcaster = test_broadcaster();
        let (id, mut rx) = broadcaster.connect().await;
        match rx.recv().await.unwrap() {
            ServerMessage::Welcome { client_id, .. } => assert_eq!(client_id, id),
            other => panic!("expected welcome, got {other:?}"),
        }
        assert_eq!(broadcaster.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_topic_scoping() {
        let broadcaster = test_broadcaster();
        let (narrow_id, mut narrow_rx) = broadcaster.connect().await;
        let (broad_id, mut broad_rx) = broadcaster.connect().await;
        expect_welcome(&mut narrow_rx).await;
        expect_welcome(&mut broad_rx).await;

        subscribe(&broadcaster, &narrow_id, &mut narrow_rx, "task:t-1").await;
        subscribe(&broadcaster, &broad_id, &mut broad_rx, "tasks:all").await;

        broadcaster.publish_task_progress(progress("t-1")).await;
        broadcaster.publish_task_progress(progress("t-2")).await;

        // Narrow subscriber sees only t-1 events
        match narrow_rx.recv().await.unwrap() {
            ServerMessage::Broadcast { topic, .. } => assert_eq!(topic, "task:t-1"),
            other => panic!("expected broadcast, got {other:?}"),
        }
        assert!(narrow_rx.try_recv().is_err());

        // Broad subscriber sees both via tasks:all
        for _ in 0..2 {
            match broad_rx.recv().await.unwrap() {
                ServerMessage::Broadcast { topic, .. } => assert_eq!(topic, "tasks:all"),
                other => panic!("expected broadcast, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let broadcaster = test_broadcaster();
        let (id, mut rx) = broadcaster.connect().await;
        expect_welcome(&mut rx).await;
        subscribe(&broadcaster, &id, &mut rx, "task:t-1").await;

        broadcaster
            .handle_message(
                &id,
                ClientMessage::Unsubscribe(TopicPayload {
                    topic: "task:t-1".to_string(),
                }),
            )
            .await;
        match rx.recv().await.unwrap() {
            ServerMessage::Unsubscribed { data } => assert_eq!(data.topic, "task:t-1"),
            other => panic!("expected unsubscribed ack, got {other:?}"),
        }

        let delivered = broadcaster
            .publish("task:t-1", &EventData::TaskProgress(progress("t-1")))
            .await;
        assert_eq!(delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_revokes_all_topics() {
        let broadcaster = test_broadcaster();
        let (id, mut rx) = broadcaster.connect().await;
        expect_welcome(&mut rx).await;
        subscribe(&broadcaster, &id, &mut rx, "tasks:all").await;
        subscribe(&broadcaster, &id, &mut rx, "services:all").await;

        broadcaster.disconnect(&id).await;
        assert_eq!(broadcaster.client_count().await, 0);
        assert_eq!(
            broadcaster
                .publish("tasks:all", &EventData::TaskProgress(progress("t-1")))
                .await,
            0
        );
    }

    #[tokio::test]
    async fn test_dead_subscriber_is_dropped_without_affecting_others() {
        let broadcaster = test_broadcaster();
        let (dead_id, mut dead_rx) = broadcaster.connect().await;
        let (live_id, mut live_rx) = broadcaster.connect().await;
        expect_welcome(&mut dead_rx).await;
        expect_welcome(&mut live_rx).await;
        subscribe(&broadcaster, &dead_id, &mut dead_rx, "tasks:all").await;
        subscribe(&broadcaster, &live_id, &mut live_rx, "tasks:all").await;

        // Simulate a torn connection: the handler's receiver is gone
        drop(dead_rx);

        let delivered = broadcaster
            .publish("tasks:all", &EventData::TaskProgress(progress("t-1")))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(broadcaster.client_count().await, 1);

        match live_rx.recv().await.unwrap() {
            ServerMessage::Broadcast { .. } => {}
            other => panic!("expected broadcast, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_register_and_ping() {
        let broadcaster = test_broadcaster();
        let (id, mut rx) = broadcaster.connect().await;
        expect_welcome(&mut rx).await;

        broadcaster
            .handle_message(
                &id,
                ClientMessage::Register(RegisterPayload {
                    client_id: None,
                    client_name: Some("panel".to_string()),
                    client_version: Some("1.0.0".to_string()),
                    platform: Some("linux".to_string()),
                }),
            )
            .await;
        match rx.recv().await.unwrap() {
            ServerMessage::Registered { data } => assert_eq!(data.client_id, id),
            other => panic!("expected registered, got {other:?}"),
        }

        broadcaster.handle_message(&id, ClientMessage::Ping).await;
        match rx.recv().await.unwrap() {
            ServerMessage::Pong { .. } => {}
            other => panic!("expected pong, got {other:?}"),
        }

        let clients = broadcaster.connected_clients().await;
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].client_name.as_deref(), Some("panel"));
        assert!(clients[0].last_seen > 0);
    }

    #[tokio::test]
    async fn test_task_completed_goes_to_both_topics() {
        let broadcaster = test_broadcaster();
        let (id, mut rx) = broadcaster.connect().await;
        expect_welcome(&mut rx).await;
        subscribe(&broadcaster, &id, &mut rx, "task:t-1").await;
        subscribe(&broadcaster, &id, &mut rx, "tasks:all").await;

        broadcaster
            .publish_task_completed("t-1", json!({"answer": 8}))
            .await;

        let mut topics = Vec::new();
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                ServerMessage::Broadcast { topic, data } => {
                    assert!(matches!(data, EventData::TaskCompleted(_)));
                    topics.push(topic);
                }
                other => panic!("expected broadcast, got {other:?}"),
            }
        }
        topics.sort();
        assert_eq!(topics, vec!["task:t-1", "tasks:all"]);
    }
}
