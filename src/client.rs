use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard,
};

use chrono::Utc;
use serde_json::json;
use tokio::{
    sync::{broadcast::error::RecvError, mpsc},
    task::JoinHandle,
};

use crate::{
    api::{ApiClient, PullBackend},
    connection::{ConnectionConfig, ConnectionManager, ConnectionState},
    consts::{APP_BROADCAST_REQUEST, APP_MARK_READ_REQUEST, SYSTEM_SESSION_ID},
    diagnostics::{snapshot_runtime, CollectionCounts, RuntimeDiagnostics},
    error::{LiveError, Result},
    events::{EventBus, EventStream, LiveEvent},
    ingress::InboundNotification,
    mirror::TaskMirror,
    model::{
        ConnectionStatus, DeliveryChannel, Notification, NotificationId, NotificationType,
        SessionId, Urgency,
    },
    reconcile::NotificationReconciler,
    reconnect::{ReconnectController, ReconnectPhase, ReconnectPolicy, ReconnectSnapshot},
    session::SessionStore,
    settings::Settings,
    topics::PushMessage,
    transport::{Connector, WsConnector},
};

/// How a mark-read ended up being confirmed. The local entry is flagged
/// read in every case except `UnknownNotification`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadConfirmation {
    PushSent,
    PullConfirmed,
    /// Nothing to confirm: the record was never persisted server-side.
    AlreadySatisfied,
    Unconfirmed(String),
    UnknownNotification,
}

struct Hub<C: Connector, B: PullBackend> {
    bus: EventBus,
    connection: ConnectionManager<C>,
    reconnect: ReconnectController<C, B>,
    backend: Arc<B>,
    notifications: Mutex<NotificationReconciler>,
    mirror: TaskMirror<B>,
    session: Mutex<Option<SessionId>>,
    /// Bumped by logout so pulls that straddle it are dropped.
    generation: AtomicU64,
    store: Option<SessionStore>,
}

impl<C: Connector, B: PullBackend> Hub<C, B> {
    fn reconciler(&self) -> Result<MutexGuard<'_, NotificationReconciler>> {
        self.notifications
            .lock()
            .map_err(|_| LiveError::Poisoned("notifications"))
    }

    fn session(&self) -> Option<SessionId> {
        match self.session.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_session(&self, session: Option<SessionId>) {
        match self.session.lock() {
            Ok(mut guard) => *guard = session,
            Err(poisoned) => *poisoned.into_inner() = session,
        }
    }

    fn ingest(&self, records: Vec<InboundNotification>, channel: DeliveryChannel) -> Result<()> {
        let (total, unread) = {
            let mut reconciler = self.reconciler()?;
            reconciler.ingest_batch(records, channel, Utc::now());
            (reconciler.len(), reconciler.unread_count())
        };
        self.bus
            .emit(LiveEvent::NotificationsChanged { total, unread });
        Ok(())
    }

    /// Notifications merge on the spot; task updates may need a pull, so
    /// they are queued for the worker.
    fn handle_push(&self, message: PushMessage, work: &mpsc::UnboundedSender<Work>) {
        match message {
            PushMessage::Notifications { channel, records } => {
                if let Err(error) = self.ingest(records, channel) {
                    tracing::warn!(%error, "failed to ingest pushed notifications");
                }
            }
            other => {
                let _ = work.send(Work::Apply(other));
            }
        }
    }

    /// A loss notice can fall out of a lagging receiver; pick up a channel
    /// that is down with nothing trying to bring it back.
    fn recover_if_stalled(&self) {
        if self.connection.status() == ConnectionStatus::Disconnected
            && self.reconnect.phase() == ReconnectPhase::Idle
        {
            tracing::info!("push channel down after lag, reconnecting");
            self.reconnect.start(self.session());
        }
    }

    async fn refresh_notifications(&self, read: Option<bool>) -> Result<usize> {
        let Some(session) = self.session() else {
            return Ok(0);
        };
        let generation = self.generation.load(Ordering::SeqCst);
        let records = self.backend.list_notifications(session, read).await?;
        if self.generation.load(Ordering::SeqCst) != generation || self.session() != Some(session) {
            tracing::debug!(%session, "discarding notification pull for a stale session");
            return Ok(0);
        }
        let count = records.len();
        self.ingest(records, DeliveryChannel::Pull)?;
        tracing::debug!(%session, count, "notifications pulled");
        Ok(count)
    }

    async fn resync(&self) {
        if let Err(error) = self.refresh_notifications(None).await {
            tracing::warn!(%error, "notification pull failed");
        }
        if let Err(error) = self.mirror.refresh_all().await {
            tracing::warn!(%error, "task mirror pull failed");
        }
    }
}

enum Work {
    Apply(PushMessage),
    Resync,
}

/// Drains the event bus. Never awaits the network.
async fn run_pump<C: Connector, B: PullBackend>(
    hub: Arc<Hub<C, B>>,
    mut events: EventStream,
    work: mpsc::UnboundedSender<Work>,
) {
    loop {
        match events.recv().await {
            Ok(LiveEvent::Push(message)) => hub.handle_push(message, &work),
            Ok(LiveEvent::Reconnected { .. }) => {
                let _ = work.send(Work::Resync);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event pump lagged, pulling current state");
                hub.recover_if_stalled();
                let _ = work.send(Work::Resync);
            }
            Err(RecvError::Closed) => return,
        }
    }
}

/// Runs mirror deltas and pulls in arrival order.
async fn run_worker<C: Connector, B: PullBackend>(
    hub: Arc<Hub<C, B>>,
    mut work: mpsc::UnboundedReceiver<Work>,
) {
    while let Some(item) = work.recv().await {
        match item {
            Work::Apply(message) => {
                if let Err(error) = hub.mirror.apply(&message).await {
                    tracing::warn!(%error, "failed to apply task update");
                }
            }
            Work::Resync => hub.resync().await,
        }
    }
}

async fn run_recovery<C: Connector, B: PullBackend>(
    hub: Arc<Hub<C, B>>,
    mut losses: mpsc::UnboundedReceiver<Option<SessionId>>,
) {
    while let Some(session) = losses.recv().await {
        tracing::info!(session = ?session, "connection lost, reconnecting");
        hub.reconnect.start(session);
    }
}

/// One live session against the server: push channel, reconnection,
/// notification reconciliation and the task mirror, wired together.
pub struct LiveClient<C: Connector, B: PullBackend> {
    hub: Arc<Hub<C, B>>,
    /// Event pump, work queue and loss watcher of the current run.
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl LiveClient<WsConnector, ApiClient> {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let connector = WsConnector::new(settings.connect_timeout());
        let backend = ApiClient::new(settings)?;
        let store = settings.session_file.clone().map(SessionStore::new);
        Self::new(settings, connector, backend, store)
    }
}

impl<C: Connector, B: PullBackend> LiveClient<C, B> {
    pub fn new(
        settings: &Settings,
        connector: C,
        backend: B,
        store: Option<SessionStore>,
    ) -> Result<Self> {
        Ok(Self::with_config(
            ConnectionConfig::from_settings(settings)?,
            ReconnectPolicy::from_settings(&settings.reconnect),
            settings.event_capacity,
            connector,
            backend,
            store,
        ))
    }

    pub(crate) fn with_config(
        config: ConnectionConfig,
        policy: ReconnectPolicy,
        event_capacity: usize,
        connector: C,
        backend: B,
        store: Option<SessionStore>,
    ) -> Self {
        let bus = EventBus::new(event_capacity);
        let backend = Arc::new(backend);
        let connection = ConnectionManager::new(connector, config, bus.clone());
        let reconnect =
            ReconnectController::new(policy, connection.clone(), Arc::clone(&backend), bus.clone());
        let mirror = TaskMirror::new(Arc::clone(&backend), bus.clone());
        Self {
            hub: Arc::new(Hub {
                bus,
                connection,
                reconnect,
                backend,
                notifications: Mutex::new(NotificationReconciler::new()),
                mirror,
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                store,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    fn workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn stop_workers(&self) {
        for worker in self.workers().drain(..) {
            worker.abort();
        }
    }

    /// Connect for `session` and pull the current state. A failed first
    /// connect is handed to the reconnect controller rather than returned.
    pub async fn start(&self, session: Option<SessionId>) -> Result<()> {
        self.hub.reconnect.stop();
        self.stop_workers();
        self.hub.set_session(session);
        if let (Some(store), Some(session)) = (&self.hub.store, session) {
            if let Err(error) = store.save(session) {
                tracing::warn!(%error, "failed to persist session");
            }
        }

        let events = self.hub.bus.subscribe();
        let losses = self.hub.connection.watch_losses();
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        self.workers().extend([
            tokio::spawn(run_pump(Arc::clone(&self.hub), events, work_tx)),
            tokio::spawn(run_worker(Arc::clone(&self.hub), work_rx)),
            tokio::spawn(run_recovery(Arc::clone(&self.hub), losses)),
        ]);

        if let Err(error) = self.hub.connection.connect(session).await {
            tracing::warn!(%error, "initial connect failed");
            self.hub.reconnect.start(session);
        }
        self.hub.resync().await;
        Ok(())
    }

    /// Stop reconnecting, drop the push channel and the event pump. Local
    /// collections and the persisted session are kept.
    pub fn shutdown(&self) {
        self.hub.reconnect.stop();
        self.hub.connection.disconnect();
        self.stop_workers();
    }

    pub fn logout(&self) -> Result<()> {
        self.shutdown();
        self.hub.generation.fetch_add(1, Ordering::SeqCst);
        self.hub.set_session(None);
        self.hub.reconciler()?.clear();
        self.hub.mirror.clear();
        self.hub
            .bus
            .emit(LiveEvent::NotificationsChanged { total: 0, unread: 0 });
        if let Some(store) = &self.hub.store {
            store.clear()?;
        }
        tracing::info!("logged out");
        Ok(())
    }

    /// Flag a notification read locally, then confirm it over whichever
    /// path is available. Never fails.
    pub async fn mark_read(&self, id: &NotificationId) -> ReadConfirmation {
        let updated = match self.hub.reconciler() {
            Ok(mut reconciler) => reconciler
                .mark_read_local(id)
                .map(|entry| (entry, reconciler.len(), reconciler.unread_count())),
            Err(error) => return ReadConfirmation::Unconfirmed(error.to_string()),
        };
        let Some((entry, total, unread)) = updated else {
            tracing::debug!(%id, "mark-read for unknown notification");
            return ReadConfirmation::UnknownNotification;
        };
        self.hub
            .bus
            .emit(LiveEvent::NotificationsChanged { total, unread });

        let Some(number) = id.as_number().filter(|_| !entry.synthetic_id) else {
            return ReadConfirmation::AlreadySatisfied;
        };
        let user_id = if entry.user_id == SYSTEM_SESSION_ID {
            SYSTEM_SESSION_ID
        } else {
            self.hub.session().unwrap_or(SessionId::SYSTEM).get()
        };

        let payload = json!({ "notificationId": number, "userId": user_id });
        if self.hub.connection.send(APP_MARK_READ_REQUEST, &payload) {
            return ReadConfirmation::PushSent;
        }

        match self.hub.backend.mark_read(number, user_id).await {
            Ok(()) => ReadConfirmation::PullConfirmed,
            Err(LiveError::NotFound) => {
                tracing::debug!(%id, "server has no such notification");
                ReadConfirmation::AlreadySatisfied
            }
            Err(error) => {
                tracing::warn!(%id, %error, "mark-read not confirmed");
                ReadConfirmation::Unconfirmed(error.to_string())
            }
        }
    }

    /// Publish a broadcast over the push channel. `false` when not connected.
    pub fn broadcast(&self, message: &str, kind: &NotificationType, urgency: Urgency) -> bool {
        self.hub.connection.send(
            APP_BROADCAST_REQUEST,
            &json!({
                "message": message,
                "type": kind.as_str(),
                "urgency": urgency.as_str(),
            }),
        )
    }

    pub async fn refresh_notifications(&self, read: Option<bool>) -> Result<usize> {
        self.hub.refresh_notifications(read).await
    }

    fn view(&self, select: impl FnOnce(&NotificationReconciler) -> Vec<Notification>) -> Vec<Notification> {
        self.hub
            .reconciler()
            .map(|reconciler| select(&*reconciler))
            .unwrap_or_default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.view(|r| r.all().to_vec())
    }

    pub fn unread(&self) -> Vec<Notification> {
        self.view(NotificationReconciler::unread)
    }

    pub fn read(&self) -> Vec<Notification> {
        self.view(NotificationReconciler::read)
    }

    pub fn high_priority(&self) -> Vec<Notification> {
        self.view(NotificationReconciler::high_priority)
    }

    pub fn system_notifications(&self) -> Vec<Notification> {
        self.view(NotificationReconciler::system)
    }

    pub fn filtered(&self, read: Option<bool>) -> Vec<Notification> {
        self.view(|r| r.filtered(read))
    }

    pub fn mirror(&self) -> &TaskMirror<B> {
        &self.hub.mirror
    }

    pub fn session(&self) -> Option<SessionId> {
        self.hub.session()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.hub.connection.state()
    }

    pub fn reconnect_snapshot(&self) -> ReconnectSnapshot {
        self.hub.reconnect.snapshot()
    }

    pub fn subscribe(&self) -> EventStream {
        self.hub.bus.subscribe()
    }

    /// Watchdog, backoff and countdown timers still alive.
    pub fn pending_timers(&self) -> usize {
        self.hub.connection.active_timers() + self.hub.reconnect.pending_timers()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.hub.connection.active_subscriptions()
    }

    pub fn diagnostics(&self) -> RuntimeDiagnostics {
        let (notifications_total, notifications_unread) = self
            .hub
            .reconciler()
            .map(|r| (r.len(), r.unread_count()))
            .unwrap_or_default();
        snapshot_runtime(
            &self.hub.connection.state(),
            self.hub.connection.active_subscriptions(),
            &self.hub.reconnect.snapshot(),
            CollectionCounts {
                notifications_total,
                notifications_unread,
                tasks: self.hub.mirror.tasks().len(),
                queues: self.hub.mirror.queues().len(),
            },
        )
    }
}

impl<C: Connector, B: PullBackend> Drop for LiveClient<C, B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
