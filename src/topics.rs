use serde_json::Value;

use crate::{
    consts::{
        TOPIC_BROADCAST, TOPIC_QUEUES, TOPIC_SESSION_NOTIFICATIONS, TOPIC_SYSTEM,
        TOPIC_TASK_PROGRESS, TOPIC_TASK_RESULTS, TOPIC_TASK_STATUS,
    },
    error::Result,
    ingress::InboundNotification,
    model::{DeliveryChannel, QueueUpdateEvent, SessionId, Task, TaskProgress, TaskResultEvent},
    stomp::Frame,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    SystemNotifications,
    BroadcastNotifications,
    TaskStatus,
    TaskResults,
    QueueUpdates,
    SessionNotifications,
    SessionTaskUpdates,
    SessionTaskResults,
    TaskProgress,
}

impl Topic {
    pub const FIXED: [Topic; 5] = [
        Topic::SystemNotifications,
        Topic::BroadcastNotifications,
        Topic::TaskStatus,
        Topic::TaskResults,
        Topic::QueueUpdates,
    ];

    pub const SESSION_SCOPED: [Topic; 4] = [
        Topic::SessionNotifications,
        Topic::SessionTaskUpdates,
        Topic::SessionTaskResults,
        Topic::TaskProgress,
    ];

    pub fn destination(self, session: SessionId) -> String {
        match self {
            Self::SystemNotifications => TOPIC_SYSTEM.to_string(),
            Self::BroadcastNotifications => TOPIC_BROADCAST.to_string(),
            Self::TaskStatus => TOPIC_TASK_STATUS.to_string(),
            Self::TaskResults => TOPIC_TASK_RESULTS.to_string(),
            Self::QueueUpdates => TOPIC_QUEUES.to_string(),
            Self::SessionNotifications => TOPIC_SESSION_NOTIFICATIONS.to_string(),
            Self::SessionTaskUpdates => format!("/user/{session}/tasks"),
            Self::SessionTaskResults => format!("/user/{session}/task-results"),
            Self::TaskProgress => TOPIC_TASK_PROGRESS.to_string(),
        }
    }

    /// Decode a MESSAGE body received on this topic.
    pub fn decode(self, body: &str) -> Result<PushMessage> {
        let value: Value = serde_json::from_str(body)?;
        let message = match self {
            Self::SystemNotifications => notifications(DeliveryChannel::System, value)?,
            Self::BroadcastNotifications => notifications(DeliveryChannel::Broadcast, value)?,
            Self::SessionNotifications => notifications(DeliveryChannel::Session, value)?,
            Self::TaskStatus | Self::SessionTaskUpdates => {
                PushMessage::TaskStatus(serde_json::from_value(value)?)
            }
            Self::TaskResults | Self::SessionTaskResults => {
                PushMessage::TaskResult(serde_json::from_value(value)?)
            }
            Self::QueueUpdates => PushMessage::Queue(serde_json::from_value(value)?),
            Self::TaskProgress => PushMessage::TaskProgress(serde_json::from_value(value)?),
        };
        Ok(message)
    }
}

fn notifications(channel: DeliveryChannel, value: Value) -> Result<PushMessage> {
    Ok(PushMessage::Notifications {
        channel,
        records: InboundNotification::batch_from_value(value)?,
    })
}

/// A decoded push delivery, routed by the topic it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    Notifications {
        channel: DeliveryChannel,
        records: Vec<InboundNotification>,
    },
    TaskStatus(Task),
    TaskResult(TaskResultEvent),
    Queue(QueueUpdateEvent),
    TaskProgress(TaskProgress),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub topic: Topic,
    pub destination: String,
}

/// Every subscription held by one connection. Built whole before any
/// SUBSCRIBE is sent and torn down whole on disconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    entries: Vec<Subscription>,
}

impl SubscriptionSet {
    pub fn build(session: Option<SessionId>) -> Self {
        let scope = session.unwrap_or(SessionId::SYSTEM);
        let scoped: &[Topic] = if session.is_some() {
            &Topic::SESSION_SCOPED
        } else {
            &[]
        };
        let entries = Topic::FIXED
            .iter()
            .chain(scoped.iter())
            .enumerate()
            .map(|(index, topic)| Subscription {
                id: format!("sub-{index}"),
                topic: *topic,
                destination: topic.destination(scope),
            })
            .collect();
        Self { entries }
    }

    pub fn topic_for(&self, subscription_id: &str) -> Option<Topic> {
        self.entries
            .iter()
            .find(|entry| entry.id == subscription_id)
            .map(|entry| entry.topic)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn subscribe_frames(&self) -> Vec<Frame> {
        self.entries
            .iter()
            .map(|entry| Frame::subscribe(&entry.id, &entry.destination))
            .collect()
    }

    pub fn unsubscribe_frames(&self) -> Vec<Frame> {
        self.entries
            .iter()
            .map(|entry| Frame::unsubscribe(&entry.id))
            .collect()
    }
}
