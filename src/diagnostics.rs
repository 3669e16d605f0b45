use serde::Serialize;

use crate::{
    connection::ConnectionState,
    core::unix_now_secs,
    model::ConnectionStatus,
    reconnect::ReconnectSnapshot,
};

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct RuntimeDiagnostics {
    pub connection_state: String,
    pub session_id: Option<i64>,
    pub last_connected_at: Option<u64>,
    pub connected_for_seconds: Option<u64>,
    pub last_error: Option<String>,
    pub active_subscriptions: usize,
    pub reconnect_phase: String,
    pub reconnect_attempts: u32,
    pub backoff_ms: u64,
    pub next_attempt_in_seconds: Option<u64>,
    pub notifications_total: usize,
    pub notifications_unread: usize,
    pub tasks: usize,
    pub queues: usize,
}

/// Counts taken from the local collections at snapshot time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectionCounts {
    pub notifications_total: usize,
    pub notifications_unread: usize,
    pub tasks: usize,
    pub queues: usize,
}

pub fn snapshot_runtime(
    connection: &ConnectionState,
    active_subscriptions: usize,
    reconnect: &ReconnectSnapshot,
    counts: CollectionCounts,
) -> RuntimeDiagnostics {
    let now = unix_now_secs();
    let connected_for_seconds = if connection.status == ConnectionStatus::Connected {
        connection.last_connected_at.map(|at| now.saturating_sub(at))
    } else {
        None
    };

    RuntimeDiagnostics {
        connection_state: connection.status.as_str().to_string(),
        session_id: connection.session.map(|session| session.get()),
        last_connected_at: connection.last_connected_at,
        connected_for_seconds,
        last_error: connection.last_error.clone(),
        active_subscriptions,
        reconnect_phase: reconnect.phase.as_str().to_string(),
        reconnect_attempts: reconnect.attempts,
        backoff_ms: u64::try_from(reconnect.delay.as_millis()).unwrap_or(u64::MAX),
        next_attempt_in_seconds: reconnect.seconds_until_next,
        notifications_total: counts.notifications_total,
        notifications_unread: counts.notifications_unread,
        tasks: counts.tasks,
        queues: counts.queues,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        model::SessionId,
        reconnect::ReconnectPhase,
    };

    #[test]
    fn snapshot_serializes_with_stable_field_names() {
        let connection = ConnectionState {
            status: ConnectionStatus::Reconnecting,
            session: Some(SessionId(42)),
            last_error: Some("stream ended unexpectedly".into()),
            ..ConnectionState::default()
        };
        let reconnect = ReconnectSnapshot {
            phase: ReconnectPhase::Reconnecting,
            attempts: 2,
            delay: Duration::from_millis(2_250),
            seconds_until_next: Some(2),
            session: Some(SessionId(42)),
        };
        let diagnostics = snapshot_runtime(
            &connection,
            0,
            &reconnect,
            CollectionCounts {
                notifications_total: 3,
                notifications_unread: 1,
                ..CollectionCounts::default()
            },
        );

        assert_eq!(diagnostics.connected_for_seconds, None);
        let json = serde_json::to_value(&diagnostics).unwrap();
        assert_eq!(json["connection_state"], "Reconnecting");
        assert_eq!(json["reconnect_phase"], "reconnecting");
        assert_eq!(json["backoff_ms"], 2_250);
        assert_eq!(json["session_id"], 42);
        assert_eq!(json["notifications_unread"], 1);
    }
}
