use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{consts::SYSTEM_SESSION_ID, core::iso_timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i64);

impl SessionId {
    pub const SYSTEM: SessionId = SessionId(SYSTEM_SESSION_ID);

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn is_system(self) -> bool {
        self.0 == SYSTEM_SESSION_ID
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server ids are integers; ids synthesized at ingress are strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NotificationId {
    Number(i64),
    Text(String),
}

impl NotificationId {
    /// Integer form usable on the pull path, if the id has one.
    pub fn as_number(&self) -> Option<i64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(value) => value.trim().parse().ok(),
        }
    }

    pub(crate) fn from_wire(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_i64().map(Self::Number),
            Value::String(text) if !text.trim().is_empty() => match text.trim().parse() {
                Ok(number) => Some(Self::Number(number)),
                Err(_) => Some(Self::Text(text.clone())),
            },
            _ => None,
        }
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<i64> for NotificationId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for NotificationId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NotificationType {
    System,
    Broadcast,
    User,
    DeadlockDetected,
    TaskCreated,
    TaskCompleted,
    TaskOverdue,
    #[default]
    Unspecified,
    Other(String),
}

impl NotificationType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::System => "SYSTEM",
            Self::Broadcast => "BROADCAST",
            Self::User => "USER",
            Self::DeadlockDetected => "DEADLOCK_DETECTED",
            Self::TaskCreated => "TASK_CREATED",
            Self::TaskCompleted => "TASK_COMPLETED",
            Self::TaskOverdue => "TASK_OVERDUE",
            Self::Unspecified => "",
            Self::Other(value) => value,
        }
    }
}

impl From<String> for NotificationType {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "SYSTEM" => Self::System,
            "BROADCAST" => Self::Broadcast,
            "USER" => Self::User,
            "DEADLOCK_DETECTED" => Self::DeadlockDetected,
            "TASK_CREATED" => Self::TaskCreated,
            "TASK_COMPLETED" => Self::TaskCompleted,
            "TASK_OVERDUE" => Self::TaskOverdue,
            "" => Self::Unspecified,
            _ => Self::Other(value),
        }
    }
}

impl From<NotificationType> for String {
    fn from(value: NotificationType) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Urgency {
    #[default]
    Normal,
    High,
}

impl Urgency {
    /// Unknown or missing values fall back to `Normal`.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("HIGH") {
            Self::High
        } else {
            Self::Normal
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationStatus {
    #[default]
    Unread,
    Read,
    Archived,
}

impl NotificationStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "UNREAD" => Some(Self::Unread),
            "READ" => Some(Self::Read),
            "ARCHIVED" => Some(Self::Archived),
            _ => None,
        }
    }

    pub fn implies_read(self) -> bool {
        matches!(self, Self::Read | Self::Archived)
    }
}

/// Canonical notification record held by the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub message: String,
    pub user_id: i64,
    pub related_task_id: Option<i64>,
    pub urgency: Urgency,
    pub read: bool,
    pub status: NotificationStatus,
    pub timestamp: String,
    #[serde(skip)]
    pub synthetic_id: bool,
}

impl Notification {
    pub fn is_high_priority(&self) -> bool {
        self.urgency == Urgency::High && !self.read
    }

    pub fn is_system_scope(&self) -> bool {
        self.user_id == SYSTEM_SESSION_ID
            || matches!(
                self.kind,
                NotificationType::System | NotificationType::DeadlockDetected
            )
    }
}

/// Path a notification record travelled on before ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    System,
    Broadcast,
    Session,
    Pull,
}

impl DeliveryChannel {
    pub fn is_global(self) -> bool {
        matches!(self, Self::System | Self::Broadcast)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Reconnecting => "Reconnecting",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    #[default]
    Created,
    Queued,
    Running,
    Done,
    Error,
    Other(String),
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "CREATED",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Error => "ERROR",
            Self::Other(value) => value,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Created | Self::Queued)
    }
}

impl From<String> for TaskStatus {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "CREATED" => Self::Created,
            "QUEUED" => Self::Queued,
            "RUNNING" => Self::Running,
            "DONE" => Self::Done,
            "ERROR" => Self::Error,
            _ => Self::Other(value),
        }
    }
}

impl From<TaskStatus> for String {
    fn from(value: TaskStatus) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskResult {
    pub title: Option<String>,
    pub content: Option<String>,
    #[serde(deserialize_with = "wire_time")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "wire_time")]
    pub due_date: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub dependency_ids: Vec<i64>,
    #[serde(default)]
    pub assigned_user_id: Option<i64>,
    #[serde(default)]
    pub task_class_name: Option<String>,
    #[serde(default, deserialize_with = "wire_time")]
    pub scheduled_time: Option<String>,
    #[serde(default, deserialize_with = "wire_time")]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "wire_time")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub result: Option<TaskResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQueue {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default, deserialize_with = "wire_time")]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "wire_time")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub task_count: usize,
}

/// Payload of the task-results topic.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultEvent {
    pub task_id: i64,
    #[serde(default)]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum QueueAction {
    Added,
    Removed,
    Started,
    Completed,
    Other(String),
}

impl From<String> for QueueAction {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "ADDED" => Self::Added,
            "REMOVED" => Self::Removed,
            "STARTED" => Self::Started,
            "COMPLETED" => Self::Completed,
            _ => Self::Other(value),
        }
    }
}

/// Payload of the queue-updates topic.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueUpdateEvent {
    pub queue_id: i64,
    pub action: QueueAction,
    #[serde(default)]
    pub task_id: Option<i64>,
    #[serde(default)]
    pub task_status: Option<TaskStatus>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub task_id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub task_class_name: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub progress_percentage: u8,
    #[serde(default, deserialize_with = "wire_time")]
    pub start_time: Option<String>,
    #[serde(default)]
    pub elapsed_time_millis: u64,
    #[serde(default)]
    pub estimated_time_remaining_millis: u64,
    #[serde(default)]
    pub current_value: Option<String>,
    #[serde(default)]
    pub has_progress: bool,
}

/// Normalize the timestamp shapes the server emits: ISO strings, epoch
/// milliseconds, or `[year, month, day, hour, minute, second, nanos]` arrays.
pub fn normalize_wire_time(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        Value::Number(number) => number
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(iso_timestamp),
        Value::Array(parts) => {
            let field = |index: usize| parts.get(index).and_then(Value::as_i64).unwrap_or(0);
            let date = NaiveDate::from_ymd_opt(
                i32::try_from(field(0)).ok()?,
                u32::try_from(field(1)).ok()?,
                u32::try_from(field(2)).ok()?,
            )?;
            let time = date.and_hms_nano_opt(
                u32::try_from(field(3)).ok()?,
                u32::try_from(field(4)).ok()?,
                u32::try_from(field(5)).ok()?,
                u32::try_from(field(6)).ok()?,
            )?;
            Some(time.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
        }
        _ => None,
    }
}

fn wire_time<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(normalize_wire_time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_notification_types_round_trip_verbatim() {
        let kind: NotificationType = serde_json::from_value(json!("QUOTA_WARNING")).unwrap();
        assert_eq!(kind, NotificationType::Other("QUOTA_WARNING".into()));
        assert_eq!(serde_json::to_value(&kind).unwrap(), json!("QUOTA_WARNING"));
        let known: NotificationType = serde_json::from_value(json!("deadlock_detected")).unwrap();
        assert_eq!(known, NotificationType::DeadlockDetected);
    }

    #[test]
    fn numeric_strings_are_server_ids() {
        assert_eq!(
            NotificationId::from_wire(&json!("17")),
            Some(NotificationId::Number(17))
        );
        assert_eq!(
            NotificationId::from_wire(&json!("system-abc")),
            Some(NotificationId::Text("system-abc".into()))
        );
        assert_eq!(NotificationId::from_wire(&json!(null)), None);
        assert_eq!(NotificationId::from("system-abc").as_number(), None);
    }

    #[test]
    fn wire_times_normalize_from_every_shape() {
        assert_eq!(
            normalize_wire_time(&json!("2024-05-01T10:00:00")).as_deref(),
            Some("2024-05-01T10:00:00")
        );
        assert_eq!(
            normalize_wire_time(&json!([2024, 5, 1, 10, 0, 7, 500000000])).as_deref(),
            Some("2024-05-01T10:00:07.500")
        );
        assert_eq!(
            normalize_wire_time(&json!([2024, 5, 1, 10, 0])).as_deref(),
            Some("2024-05-01T10:00:00")
        );
        assert_eq!(
            normalize_wire_time(&json!(0)).as_deref(),
            Some("1970-01-01T00:00:00.000Z")
        );
        assert_eq!(normalize_wire_time(&json!("")), None);
        assert_eq!(normalize_wire_time(&json!([2024, 13, 1])), None);
    }

    #[test]
    fn decodes_task_with_array_dates_and_unknown_status() {
        let task: Task = serde_json::from_value(json!({
            "id": 4,
            "title": "Report",
            "status": "PAUSED",
            "createdAt": [2024, 1, 2, 3, 4, 5],
            "dependencyIds": [1, 2],
            "result": { "title": "ok", "content": "42", "timestamp": null }
        }))
        .unwrap();
        assert_eq!(task.status, TaskStatus::Other("PAUSED".into()));
        assert_eq!(task.created_at.as_deref(), Some("2024-01-02T03:04:05"));
        assert_eq!(task.dependency_ids, vec![1, 2]);
        assert_eq!(task.result.and_then(|r| r.content).as_deref(), Some("42"));
    }

    #[test]
    fn queue_events_accept_missing_task() {
        let event: QueueUpdateEvent = serde_json::from_value(json!({
            "queueId": 2,
            "action": "REMOVED",
            "timestamp": 1714557600000_i64
        }))
        .unwrap();
        assert_eq!(event.action, QueueAction::Removed);
        assert_eq!(event.task_id, None);
    }
}
