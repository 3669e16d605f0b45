use chrono::{DateTime, Utc};

use crate::{
    consts::SYSTEM_SESSION_ID,
    core::iso_timestamp,
    ingress::{wire_i64, wire_truthy, InboundNotification, RawNotification},
    model::{
        normalize_wire_time, DeliveryChannel, Notification, NotificationId, NotificationStatus,
        NotificationType, Urgency,
    },
};

/// Content identity used when a record arrives without a server id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    kind: String,
    message: String,
    timestamp: String,
    user_id: i64,
}

impl CompositeKey {
    pub fn of(notification: &Notification) -> Self {
        Self {
            kind: notification.kind.as_str().to_string(),
            message: notification.message.clone(),
            timestamp: notification.timestamp.clone(),
            user_id: notification.user_id,
        }
    }

    pub fn render(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.kind, self.message, self.timestamp, self.user_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted(NotificationId),
    Updated(NotificationId),
}

impl IngestOutcome {
    pub fn id(&self) -> &NotificationId {
        match self {
            Self::Inserted(id) | Self::Updated(id) => id,
        }
    }
}

/// Canonical, most-recent-first notification collection fed by both
/// delivery paths. Entries are only ever mutated in place or cleared as a whole.
#[derive(Debug, Default)]
pub struct NotificationReconciler {
    entries: Vec<Notification>,
}

impl NotificationReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(
        &mut self,
        record: InboundNotification,
        channel: DeliveryChannel,
        received_at: DateTime<Utc>,
    ) -> IngestOutcome {
        let incoming = normalize(record.resolve(), channel, received_at);
        self.merge(incoming)
    }

    pub fn ingest_batch(
        &mut self,
        records: Vec<InboundNotification>,
        channel: DeliveryChannel,
        received_at: DateTime<Utc>,
    ) -> Vec<IngestOutcome> {
        records
            .into_iter()
            .map(|record| self.ingest(record, channel, received_at))
            .collect()
    }

    fn merge(&mut self, incoming: Notification) -> IngestOutcome {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.id == incoming.id)
            .or_else(|| {
                let key = CompositeKey::of(&incoming);
                self.entries
                    .iter()
                    .position(|entry| CompositeKey::of(entry) == key)
            });

        match position {
            Some(index) => {
                let existing = &mut self.entries[index];
                let mut replacement = incoming;
                if replacement.synthetic_id {
                    replacement.id = existing.id.clone();
                    replacement.synthetic_id = existing.synthetic_id;
                }
                tracing::debug!(id = %replacement.id, "notification refreshed in place");
                *existing = replacement;
                IngestOutcome::Updated(existing.id.clone())
            }
            None => {
                let id = incoming.id.clone();
                tracing::debug!(%id, kind = incoming.kind.as_str(), "notification inserted");
                self.entries.insert(0, incoming);
                IngestOutcome::Inserted(id)
            }
        }
    }

    /// Optimistically flag one entry as read. Returns the entry as updated.
    pub fn mark_read_local(&mut self, id: &NotificationId) -> Option<Notification> {
        let entry = self.entries.iter_mut().find(|entry| &entry.id == id)?;
        entry.read = true;
        if !entry.status.implies_read() {
            entry.status = NotificationStatus::Read;
        }
        Some(entry.clone())
    }

    pub fn get(&self, id: &NotificationId) -> Option<&Notification> {
        self.entries.iter().find(|entry| &entry.id == id)
    }

    pub fn all(&self) -> &[Notification] {
        &self.entries
    }

    pub fn unread(&self) -> Vec<Notification> {
        self.filtered(Some(false))
    }

    pub fn read(&self) -> Vec<Notification> {
        self.filtered(Some(true))
    }

    pub fn high_priority(&self) -> Vec<Notification> {
        self.collect(Notification::is_high_priority)
    }

    pub fn system(&self) -> Vec<Notification> {
        self.collect(Notification::is_system_scope)
    }

    pub fn filtered(&self, read: Option<bool>) -> Vec<Notification> {
        match read {
            Some(flag) => self.collect(|entry| entry.read == flag),
            None => self.entries.clone(),
        }
    }

    fn collect(&self, predicate: impl Fn(&Notification) -> bool) -> Vec<Notification> {
        self.entries
            .iter()
            .filter(|entry| predicate(entry))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn unread_count(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.read).count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn normalize(
    raw: RawNotification,
    channel: DeliveryChannel,
    received_at: DateTime<Utc>,
) -> Notification {
    let fields = raw.fields;
    let kind = NotificationType::from(fields.kind.unwrap_or_default());
    let timestamp = fields
        .timestamp
        .as_ref()
        .and_then(normalize_wire_time)
        .unwrap_or_else(|| iso_timestamp(received_at));

    let status_hint = fields.status.as_deref().and_then(NotificationStatus::parse);
    let read = wire_truthy(fields.read.as_ref())
        || status_hint.map(NotificationStatus::implies_read).unwrap_or(false);
    let status = match status_hint {
        Some(status) if read && status.implies_read() => status,
        _ if read => NotificationStatus::Read,
        _ => NotificationStatus::Unread,
    };

    let mut urgency = fields
        .urgency
        .as_deref()
        .map(Urgency::parse)
        .unwrap_or_default();
    let mut user_id = fields
        .user_id
        .as_ref()
        .and_then(wire_i64)
        .unwrap_or(SYSTEM_SESSION_ID);
    if kind == NotificationType::DeadlockDetected {
        urgency = Urgency::High;
        user_id = SYSTEM_SESSION_ID;
    }
    if kind == NotificationType::System || channel.is_global() {
        user_id = SYSTEM_SESSION_ID;
    }

    let mut notification = Notification {
        id: NotificationId::Number(0),
        kind,
        message: fields.message.unwrap_or_default(),
        user_id,
        related_task_id: raw.related_task_id,
        urgency,
        read,
        status,
        timestamp,
        synthetic_id: false,
    };
    match raw.id {
        Some(id) => notification.id = id,
        None => {
            let composite = CompositeKey::of(&notification).render();
            notification.id = NotificationId::Text(format!(
                "system-{composite}-{}",
                received_at.timestamp_millis()
            ));
            notification.synthetic_id = true;
        }
    }
    notification
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::{json, Value};

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap() + Duration::seconds(seconds)
    }

    fn ingest(
        reconciler: &mut NotificationReconciler,
        value: Value,
        channel: DeliveryChannel,
        received_at: DateTime<Utc>,
    ) -> IngestOutcome {
        let record = InboundNotification::from_value(value).expect("record should decode");
        reconciler.ingest(record, channel, received_at)
    }

    #[test]
    fn same_id_twice_keeps_one_entry_with_latest_fields() {
        let mut reconciler = NotificationReconciler::new();
        ingest(
            &mut reconciler,
            json!({ "id": 5, "type": "USER", "message": "first", "userId": 42, "timestamp": "T1" }),
            DeliveryChannel::Session,
            at(0),
        );
        let outcome = ingest(
            &mut reconciler,
            json!({ "id": 5, "type": "USER", "message": "second", "userId": 42, "timestamp": "T2" }),
            DeliveryChannel::Pull,
            at(1),
        );

        assert_eq!(outcome, IngestOutcome::Updated(NotificationId::Number(5)));
        assert_eq!(reconciler.len(), 1);
        let entry = reconciler.get(&NotificationId::Number(5)).unwrap();
        assert_eq!(entry.message, "second");
        assert_eq!(entry.timestamp, "T2");
    }

    #[test]
    fn legacy_record_is_indistinguishable_from_canonical() {
        let mut legacy = NotificationReconciler::new();
        ingest(
            &mut legacy,
            json!({ "notificationId": 7, "taskId": 3, "message": "m", "timestamp": "T" }),
            DeliveryChannel::Session,
            at(0),
        );
        let mut canonical = NotificationReconciler::new();
        ingest(
            &mut canonical,
            json!({ "id": 7, "relatedTaskId": 3, "message": "m", "timestamp": "T" }),
            DeliveryChannel::Session,
            at(0),
        );

        assert_eq!(legacy.all(), canonical.all());
        let entry = &legacy.all()[0];
        assert_eq!(entry.id, NotificationId::Number(7));
        assert_eq!(entry.related_task_id, Some(3));
        assert_eq!(entry.message, "m");
        assert_eq!(entry.timestamp, "T");
    }

    #[test]
    fn push_and_pull_copies_merge_by_content() {
        let mut reconciler = NotificationReconciler::new();
        let record = json!({ "type": "SYSTEM", "message": "X", "timestamp": "T", "userId": 0 });
        ingest(&mut reconciler, record.clone(), DeliveryChannel::System, at(0));
        let outcome = ingest(&mut reconciler, record, DeliveryChannel::Pull, at(3));

        assert!(matches!(outcome, IngestOutcome::Updated(_)));
        assert_eq!(reconciler.len(), 1);
    }

    #[test]
    fn composite_match_adopts_the_server_id() {
        let mut reconciler = NotificationReconciler::new();
        let first = ingest(
            &mut reconciler,
            json!({ "type": "SYSTEM", "message": "X", "timestamp": "T" }),
            DeliveryChannel::System,
            at(0),
        );
        assert!(first.id().as_number().is_none());

        ingest(
            &mut reconciler,
            json!({ "id": 31, "type": "SYSTEM", "message": "X", "timestamp": "T", "userId": 0 }),
            DeliveryChannel::Pull,
            at(1),
        );
        assert_eq!(reconciler.len(), 1);
        let entry = &reconciler.all()[0];
        assert_eq!(entry.id, NotificationId::Number(31));
        assert!(!entry.synthetic_id);

        // a later synthetic copy must not demote the server id
        ingest(
            &mut reconciler,
            json!({ "type": "SYSTEM", "message": "X", "timestamp": "T" }),
            DeliveryChannel::Broadcast,
            at(2),
        );
        assert_eq!(reconciler.all()[0].id, NotificationId::Number(31));
    }

    #[test]
    fn deadlock_alerts_are_forced_high_and_global() {
        let mut reconciler = NotificationReconciler::new();
        ingest(
            &mut reconciler,
            json!({ "type": "DEADLOCK_DETECTED", "message": "cycle found" }),
            DeliveryChannel::Session,
            at(0),
        );

        let entry = &reconciler.all()[0];
        assert_eq!(entry.urgency, Urgency::High);
        assert_eq!(entry.user_id, 0);
        assert!(!entry.read);
        assert_eq!(entry.status, NotificationStatus::Unread);
        assert_eq!(entry.timestamp, "2024-06-01T08:00:00.000Z");
        assert_eq!(reconciler.high_priority().len(), 1);
    }

    #[test]
    fn broadcast_channel_forces_system_scope() {
        let mut reconciler = NotificationReconciler::new();
        ingest(
            &mut reconciler,
            json!({ "id": 3, "type": "BROADCAST", "message": "hi", "userId": 42 }),
            DeliveryChannel::Broadcast,
            at(0),
        );
        ingest(
            &mut reconciler,
            json!({ "id": 4, "type": "SYSTEM", "message": "sys", "userId": 42 }),
            DeliveryChannel::Session,
            at(0),
        );
        assert!(reconciler.all().iter().all(|entry| entry.user_id == 0));
        assert_eq!(reconciler.system().len(), 2);
    }

    #[test]
    fn read_and_archived_status_imply_read() {
        let mut reconciler = NotificationReconciler::new();
        ingest(
            &mut reconciler,
            json!({ "id": 1, "message": "a", "read": false, "status": "ARCHIVED" }),
            DeliveryChannel::Pull,
            at(0),
        );
        ingest(
            &mut reconciler,
            json!({ "id": 2, "message": "b", "read": 1 }),
            DeliveryChannel::Pull,
            at(0),
        );
        ingest(
            &mut reconciler,
            json!({ "id": 3, "message": "c", "status": "UNREAD" }),
            DeliveryChannel::Pull,
            at(0),
        );

        let status_of = |id: i64| {
            let entry = reconciler.get(&NotificationId::Number(id)).unwrap();
            (entry.read, entry.status)
        };
        assert_eq!(status_of(1), (true, NotificationStatus::Archived));
        assert_eq!(status_of(2), (true, NotificationStatus::Read));
        assert_eq!(status_of(3), (false, NotificationStatus::Unread));
        assert_eq!(reconciler.unread().len(), 1);
        assert_eq!(reconciler.read().len(), 2);
    }

    #[test]
    fn new_records_go_to_the_head_and_updates_keep_position() {
        let mut reconciler = NotificationReconciler::new();
        for id in 1..=3 {
            ingest(
                &mut reconciler,
                json!({ "id": id, "message": format!("n{id}") }),
                DeliveryChannel::Pull,
                at(id),
            );
        }
        ingest(
            &mut reconciler,
            json!({ "id": 2, "message": "n2 again" }),
            DeliveryChannel::Session,
            at(9),
        );

        let order: Vec<_> = reconciler.all().iter().map(|entry| entry.id.clone()).collect();
        assert_eq!(
            order,
            vec![
                NotificationId::Number(3),
                NotificationId::Number(2),
                NotificationId::Number(1)
            ]
        );
        assert_eq!(reconciler.all()[1].message, "n2 again");
    }

    #[test]
    fn synthesized_ids_embed_composite_and_receipt_time() {
        let mut reconciler = NotificationReconciler::new();
        let outcome = ingest(
            &mut reconciler,
            json!({ "type": "BROADCAST", "message": "hello", "timestamp": "T" }),
            DeliveryChannel::Broadcast,
            at(0),
        );
        let expected = format!("system-BROADCAST:hello:T:0-{}", at(0).timestamp_millis());
        assert_eq!(outcome, IngestOutcome::Inserted(NotificationId::Text(expected)));
    }

    #[test]
    fn local_mark_read_updates_derived_views() {
        let mut reconciler = NotificationReconciler::new();
        ingest(
            &mut reconciler,
            json!({ "id": 8, "message": "urgent", "urgency": "HIGH", "userId": 42 }),
            DeliveryChannel::Session,
            at(0),
        );
        assert_eq!(reconciler.high_priority().len(), 1);

        let updated = reconciler.mark_read_local(&NotificationId::Number(8)).unwrap();
        assert!(updated.read);
        assert_eq!(updated.status, NotificationStatus::Read);
        assert!(reconciler.high_priority().is_empty());
        assert!(reconciler.unread().is_empty());
        assert!(reconciler.mark_read_local(&NotificationId::Number(99)).is_none());
    }

    #[test]
    fn clear_empties_the_collection() {
        let mut reconciler = NotificationReconciler::new();
        ingest(
            &mut reconciler,
            json!({ "id": 1, "message": "a" }),
            DeliveryChannel::Pull,
            at(0),
        );
        reconciler.clear();
        assert!(reconciler.is_empty());
    }
}
