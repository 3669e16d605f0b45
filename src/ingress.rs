//! Inbound notification records as they appear on the wire.
//!
//! The server is mid-migration between two field layouts. Both are accepted
//! here and collapsed into [`RawNotification`]; nothing past this module sees
//! the legacy names.

use serde::Deserialize;
use serde_json::Value;

use crate::{error::Result, model::NotificationId};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationFields {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub user_id: Option<Value>,
    #[serde(default)]
    pub urgency: Option<String>,
    #[serde(default)]
    pub read: Option<Value>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalRecord {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub related_task_id: Option<Value>,
    #[serde(flatten)]
    pub fields: NotificationFields,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyRecord {
    #[serde(default)]
    pub notification_id: Option<Value>,
    #[serde(default)]
    pub task_id: Option<Value>,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub related_task_id: Option<Value>,
    #[serde(flatten)]
    pub fields: NotificationFields,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundNotification {
    Canonical(CanonicalRecord),
    Legacy(LegacyRecord),
}

/// A record with canonical field names, not yet normalized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawNotification {
    pub id: Option<NotificationId>,
    pub related_task_id: Option<i64>,
    pub fields: NotificationFields,
}

impl InboundNotification {
    /// Classify one JSON object. Any legacy key selects the legacy layout.
    pub fn from_value(value: Value) -> Result<Self> {
        let legacy = value
            .as_object()
            .map(|object| object.contains_key("notificationId") || object.contains_key("taskId"))
            .unwrap_or(false);
        if legacy {
            Ok(Self::Legacy(serde_json::from_value(value)?))
        } else {
            Ok(Self::Canonical(serde_json::from_value(value)?))
        }
    }

    /// Decode a payload holding either one record or an array of them.
    /// Entries that fail to decode are logged and skipped.
    pub fn batch_from_value(value: Value) -> Result<Vec<Self>> {
        match value {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|item| match Self::from_value(item) {
                    Ok(record) => Some(record),
                    Err(error) => {
                        tracing::warn!(%error, "dropping malformed notification in batch");
                        None
                    }
                })
                .collect()),
            other => Ok(vec![Self::from_value(other)?]),
        }
    }

    /// Map legacy names onto canonical ones where the canonical field is absent.
    pub fn resolve(self) -> RawNotification {
        match self {
            Self::Canonical(record) => RawNotification {
                id: record.id.as_ref().and_then(server_id),
                related_task_id: record.related_task_id.as_ref().and_then(wire_i64),
                fields: record.fields,
            },
            Self::Legacy(record) => RawNotification {
                id: record
                    .id
                    .as_ref()
                    .and_then(server_id)
                    .or_else(|| record.notification_id.as_ref().and_then(server_id)),
                related_task_id: record
                    .related_task_id
                    .as_ref()
                    .and_then(wire_i64)
                    .or_else(|| record.task_id.as_ref().and_then(wire_i64)),
                fields: record.fields,
            },
        }
    }
}

/// The server serializes unsaved records with id 0; those carry no identity.
fn server_id(value: &Value) -> Option<NotificationId> {
    match NotificationId::from_wire(value)? {
        NotificationId::Number(number) if number <= 0 => None,
        id => Some(id),
    }
}

pub(crate) fn wire_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Truthiness of a loosely-typed `read` flag.
pub(crate) fn wire_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Some(Value::String(text)) => {
            let text = text.trim();
            !(text.is_empty() || text == "0" || text.eq_ignore_ascii_case("false"))
        }
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}
