//! Subscriber-facing wire messages.
//!
//! Tagged unions for everything that crosses a subscriber connection, so
//! event construction is exhaustiveness-checked instead of assembled from
//! loose JSON maps.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages a subscriber may send to the server
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Attach an identity to this connection
    Register(RegisterPayload),
    /// Start receiving events published to a topic
    Subscribe(TopicPayload),
    /// Stop receiving events for a topic
    Unsubscribe(TopicPayload),
    /// Liveness probe; answered with `pong`
    Ping,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    pub client_version: Option<String>,
    pub platform: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicPayload {
    pub topic: String,
}

/// Messages the server sends to a subscriber
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        #[serde(rename = "clientId")]
        client_id: String,
        timestamp: String,
    },
    Registered {
        data: RegisteredPayload,
    },
    Subscribed {
        data: TopicPayload,
    },
    Unsubscribed {
        data: TopicPayload,
    },
    Pong {
        timestamp: String,
    },
    Broadcast {
        topic: String,
        data: EventData,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredPayload {
    pub client_id: String,
    pub server_time: String,
}

/// Event payloads carried inside a `broadcast` message
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventData {
    TaskProgress(ProgressUpdate),
    TaskCompleted(TaskCompletedPayload),
    ServiceStatus(ServiceStatusPayload),
}

/// Progress snapshot for a running task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub task_id: String,
    pub progress: u8,
    pub current_step: String,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletedPayload {
    pub task_id: String,
    pub result: Value,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatusPayload {
    pub service_id: String,
    pub status: ServiceEvent,
    pub timestamp: String,
}

/// Externally visible service lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceEvent {
    Installed,
    Running,
    Error,
    Stopped,
    Removed,
}
