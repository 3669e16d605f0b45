//! Real-time notification delivery and task-state mirroring for a TaskList
//! server: a STOMP push channel with reconnection, a pull fallback, and an
//! identity-based merge of everything both paths deliver.

pub mod api;
pub mod client;
pub mod connection;
pub mod consts;
pub mod core;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod ingress;
pub mod logging;
pub mod mirror;
pub mod model;
pub mod reconcile;
pub mod reconnect;
pub mod session;
pub mod settings;
pub mod stomp;
pub mod topics;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiClient, PullBackend};
pub use client::{LiveClient, ReadConfirmation};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{LiveError, Result};
pub use events::{EventBus, EventStream, LiveEvent, MirrorCollection};
pub use mirror::{MirrorUpdate, TaskMirror};
pub use model::{
    ConnectionStatus, DeliveryChannel, Notification, NotificationId, NotificationStatus,
    NotificationType, SessionId, Task, TaskQueue, TaskStatus, Urgency,
};
pub use reconcile::NotificationReconciler;
pub use reconnect::{ReconnectController, ReconnectPhase, ReconnectPolicy};
pub use session::SessionStore;
pub use settings::Settings;
pub use topics::PushMessage;
pub use transport::{Connector, WsConnector};
