use std::{
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use serde_json::{json, Value};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    consts::{APP_SUBSCRIBE_REQUEST, ERROR_DETAIL_MAX_CHARS, LOG_PAYLOAD_PREVIEW_CHARS},
    core::{truncate_message, unix_now_secs},
    error::{LiveError, Result},
    events::{EventBus, LiveEvent},
    model::{ConnectionStatus, SessionId},
    settings::Settings,
    stomp::{Command, Frame, HEARTBEAT},
    topics::SubscriptionSet,
    transport::{Connector, LinkSender},
};

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub stream_url: String,
    pub host: String,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub watchdog_interval: Duration,
}

impl ConnectionConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let stream_url = settings.stream_url()?;
        let host = reqwest::Url::parse(&stream_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string());
        Ok(Self {
            stream_url,
            host,
            connect_timeout: settings.connect_timeout(),
            handshake_timeout: settings.handshake_timeout(),
            watchdog_interval: settings.watchdog_interval(),
        })
    }
}

/// Snapshot of the push channel as seen by everyone but its owner.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub session: Option<SessionId>,
    pub reconnect_attempts: u32,
    pub backoff: Duration,
    pub last_connected_at: Option<u64>,
    pub last_error: Option<String>,
}

struct ActiveConnection {
    link: LinkSender,
    subscriptions: SubscriptionSet,
    reader: JoinHandle<()>,
    watchdog: JoinHandle<()>,
}

impl ActiveConnection {
    fn shutdown(self) {
        for frame in self.subscriptions.unsubscribe_frames() {
            self.link.send_text(frame.encode());
        }
        self.link.send_text(Frame::disconnect().encode());
        self.reader.abort();
        self.watchdog.abort();
    }
}

#[derive(Default)]
struct ConnectionRuntime {
    state: ConnectionState,
    /// Bumped on every connect, disconnect and loss; late results from an
    /// older epoch are discarded.
    epoch: u64,
    active: Option<ActiveConnection>,
}

struct Shared<C> {
    connector: C,
    config: ConnectionConfig,
    bus: EventBus,
    runtime: Mutex<ConnectionRuntime>,
    losses: Mutex<Option<mpsc::UnboundedSender<Option<SessionId>>>>,
}

/// Owner of the single push-channel connection.
pub struct ConnectionManager<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Marks a connect attempt that has not reached a terminal state yet. If
/// the attempt future is dropped midway, the state still settles.
struct PendingConnect<'a, C: Connector> {
    manager: &'a ConnectionManager<C>,
    epoch: u64,
    armed: bool,
}

impl<C: Connector> Drop for PendingConnect<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.manager.fail(self.epoch, "connect attempt cancelled");
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, config: ConnectionConfig, bus: EventBus) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                bus,
                runtime: Mutex::new(ConnectionRuntime::default()),
                losses: Mutex::new(None),
            }),
        }
    }

    fn from_shared(shared: Arc<Shared<C>>) -> Self {
        Self { shared }
    }

    fn downgrade(&self) -> Weak<Shared<C>> {
        Arc::downgrade(&self.shared)
    }

    fn runtime(&self) -> MutexGuard<'_, ConnectionRuntime> {
        match self.shared.runtime.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit_status(&self, status: ConnectionStatus) {
        self.shared.bus.emit(LiveEvent::ConnectionState(status));
    }

    pub fn state(&self) -> ConnectionState {
        self.runtime().state.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.runtime().state.status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Tear down any existing connection, then open, handshake and
    /// subscribe. Failures leave the state `Disconnected`; retrying is the
    /// caller's business.
    pub async fn connect(&self, session: Option<SessionId>) -> Result<()> {
        self.disconnect();

        let epoch = {
            let mut runtime = self.runtime();
            runtime.epoch = runtime.epoch.wrapping_add(1);
            runtime.state.status = ConnectionStatus::Connecting;
            runtime.state.session = session;
            runtime.epoch
        };
        self.emit_status(ConnectionStatus::Connecting);
        tracing::debug!(session = ?session, epoch, "connecting push channel");

        let mut pending = PendingConnect {
            manager: self,
            epoch,
            armed: true,
        };
        let result = self.establish(epoch, session).await;
        pending.armed = false;

        if let Err(error) = &result {
            self.fail(epoch, &error.to_string());
        }
        result
    }

    async fn establish(&self, epoch: u64, session: Option<SessionId>) -> Result<()> {
        let config = &self.shared.config;
        let link = tokio::time::timeout(
            config.connect_timeout,
            self.shared.connector.open(&config.stream_url),
        )
        .await
        .map_err(|_| LiveError::Timeout(config.connect_timeout))??;
        let (sender, mut inbound) = link.into_parts();

        let heartbeat_ms = u64::try_from(config.watchdog_interval.as_millis()).unwrap_or(u64::MAX);
        if !sender.send_text(Frame::connect(&config.host, heartbeat_ms).encode()) {
            return Err(LiveError::ConnectionClosed);
        }
        tokio::time::timeout(config.handshake_timeout, await_connected(&mut inbound))
            .await
            .map_err(|_| LiveError::Timeout(config.handshake_timeout))??;

        let subscriptions = SubscriptionSet::build(session);
        for frame in subscriptions.subscribe_frames() {
            if !sender.send_text(frame.encode()) {
                return Err(LiveError::ConnectionClosed);
            }
        }

        {
            let mut runtime = self.runtime();
            if runtime.epoch != epoch {
                drop(runtime);
                sender.send_text(Frame::disconnect().encode());
                return Err(LiveError::Superseded);
            }
            let reader = tokio::spawn(read_frames(
                self.downgrade(),
                epoch,
                inbound,
                subscriptions.clone(),
            ));
            let watchdog = tokio::spawn(watch_liveness(
                self.downgrade(),
                epoch,
                sender.clone(),
                config.watchdog_interval,
            ));
            runtime.active = Some(ActiveConnection {
                link: sender,
                subscriptions,
                reader,
                watchdog,
            });
            runtime.state.status = ConnectionStatus::Connected;
            runtime.state.last_connected_at = Some(unix_now_secs());
            runtime.state.last_error = None;
        }
        self.emit_status(ConnectionStatus::Connected);
        tracing::info!(session = ?session, url = %config.stream_url, "push channel connected");

        if let Some(session) = session {
            self.request_backlog(SessionId::SYSTEM);
            self.request_backlog(session);
        }
        Ok(())
    }

    fn fail(&self, epoch: u64, reason: &str) {
        let reason = truncate_message(reason, ERROR_DETAIL_MAX_CHARS);
        {
            let mut runtime = self.runtime();
            if runtime.epoch != epoch || runtime.state.status == ConnectionStatus::Connected {
                return;
            }
            runtime.state.status = ConnectionStatus::Disconnected;
            runtime.state.last_error = Some(reason.clone());
        }
        tracing::warn!(%reason, "push channel connect failed");
        self.emit_status(ConnectionStatus::Disconnected);
        self.shared.bus.emit(LiveEvent::ConnectionError(reason));
    }

    /// Unsubscribe, close the transport, stop the watchdog. Always ends
    /// `Disconnected`, including when nothing was connected.
    pub fn disconnect(&self) {
        let (active, previous) = {
            let mut runtime = self.runtime();
            runtime.epoch = runtime.epoch.wrapping_add(1);
            let previous = runtime.state.status;
            runtime.state.status = ConnectionStatus::Disconnected;
            (runtime.active.take(), previous)
        };
        if let Some(active) = active {
            tracing::debug!(
                subscriptions = active.subscriptions.len(),
                "tearing down push channel"
            );
            active.shutdown();
        }
        if previous != ConnectionStatus::Disconnected {
            self.emit_status(ConnectionStatus::Disconnected);
        }
    }

    /// Best-effort publish to an application destination.
    pub fn send(&self, destination: &str, payload: &Value) -> bool {
        let link = {
            let runtime = self.runtime();
            if runtime.state.status != ConnectionStatus::Connected {
                return false;
            }
            runtime.active.as_ref().map(|active| active.link.clone())
        };
        match link {
            Some(link) if link.is_ready() => {
                link.send_text(Frame::send_json(destination, payload.to_string()).encode())
            }
            _ => false,
        }
    }

    fn request_backlog(&self, session: SessionId) {
        if !self.send(APP_SUBSCRIBE_REQUEST, &json!({ "userId": session.get() })) {
            tracing::warn!(%session, "failed to request notification backlog");
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.runtime().epoch == epoch
    }

    fn connection_lost(&self, epoch: u64, reason: &str) {
        let (session, active) = {
            let mut runtime = self.runtime();
            if runtime.epoch != epoch || runtime.state.status != ConnectionStatus::Connected {
                return;
            }
            runtime.epoch = runtime.epoch.wrapping_add(1);
            runtime.state.status = ConnectionStatus::Disconnected;
            runtime.state.last_error = Some(truncate_message(reason, ERROR_DETAIL_MAX_CHARS));
            (runtime.state.session, runtime.active.take())
        };
        if let Some(active) = active {
            active.reader.abort();
            active.watchdog.abort();
        }
        tracing::warn!(%reason, session = ?session, "push channel lost");
        self.emit_status(ConnectionStatus::Disconnected);
        self.shared.bus.emit(LiveEvent::ConnectionLost {
            session,
            reason: reason.to_string(),
        });
        let watcher = match self.shared.losses.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(watcher) = watcher {
            let _ = watcher.send(session);
        }
    }

    /// Feed of unexpected losses, carrying the session that was live. Unlike
    /// the event bus it never drops entries. A new call replaces the
    /// previous feed.
    pub fn watch_losses(&self) -> mpsc::UnboundedReceiver<Option<SessionId>> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.shared.losses.lock() {
            Ok(mut guard) => *guard = Some(tx),
            Err(poisoned) => *poisoned.into_inner() = Some(tx),
        }
        rx
    }

    /// Record reconnection progress. A disconnected channel is shown as
    /// `Reconnecting` while attempts are scheduled.
    pub fn note_reconnect(&self, attempts: u32, backoff: Duration) {
        let changed = {
            let mut runtime = self.runtime();
            runtime.state.reconnect_attempts = attempts;
            runtime.state.backoff = backoff;
            if runtime.state.status == ConnectionStatus::Disconnected {
                runtime.state.status = ConnectionStatus::Reconnecting;
                true
            } else {
                false
            }
        };
        if changed {
            self.emit_status(ConnectionStatus::Reconnecting);
        }
    }

    pub fn clear_reconnect(&self) {
        let changed = {
            let mut runtime = self.runtime();
            runtime.state.reconnect_attempts = 0;
            runtime.state.backoff = Duration::ZERO;
            if runtime.state.status == ConnectionStatus::Reconnecting {
                runtime.state.status = ConnectionStatus::Disconnected;
                true
            } else {
                false
            }
        };
        if changed {
            self.emit_status(ConnectionStatus::Disconnected);
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        self.runtime()
            .active
            .as_ref()
            .map(|active| active.subscriptions.len())
            .unwrap_or(0)
    }

    /// Running watchdog timers owned by this manager.
    pub fn active_timers(&self) -> usize {
        self.runtime()
            .active
            .as_ref()
            .map(|active| usize::from(!active.watchdog.is_finished()))
            .unwrap_or(0)
    }
}

async fn await_connected(inbound: &mut mpsc::UnboundedReceiver<String>) -> Result<()> {
    loop {
        let text = inbound.recv().await.ok_or(LiveError::ConnectionClosed)?;
        match Frame::decode(&text)? {
            None => continue,
            Some(frame) if frame.command == Command::Connected => {
                tracing::debug!(version = ?frame.get("version"), "handshake accepted");
                return Ok(());
            }
            Some(frame) if frame.command == Command::Error => {
                return Err(LiveError::Handshake(frame.error_message()));
            }
            Some(frame) => {
                tracing::debug!(command = frame.command.as_str(), "ignoring frame before handshake");
            }
        }
    }
}

async fn read_frames<C: Connector>(
    shared: Weak<Shared<C>>,
    epoch: u64,
    mut inbound: mpsc::UnboundedReceiver<String>,
    subscriptions: SubscriptionSet,
) {
    while let Some(text) = inbound.recv().await {
        let Some(manager) = shared.upgrade().map(ConnectionManager::from_shared) else {
            return;
        };
        if !manager.is_current(epoch) {
            return;
        }
        match Frame::decode(&text) {
            Ok(None) => {}
            Ok(Some(frame)) => match frame.command {
                Command::Message => dispatch(&manager, &subscriptions, &frame),
                Command::Error => {
                    manager.connection_lost(
                        epoch,
                        &format!("server error: {}", frame.error_message()),
                    );
                    return;
                }
                other => tracing::debug!(command = other.as_str(), "ignoring frame"),
            },
            Err(error) => tracing::warn!(
                %error,
                payload = %truncate_message(&text, LOG_PAYLOAD_PREVIEW_CHARS),
                "dropping malformed frame"
            ),
        }
    }
    if let Some(manager) = shared.upgrade().map(ConnectionManager::from_shared) {
        manager.connection_lost(epoch, "stream ended unexpectedly");
    }
}

fn dispatch<C: Connector>(
    manager: &ConnectionManager<C>,
    subscriptions: &SubscriptionSet,
    frame: &Frame,
) {
    let Some(topic) = frame
        .get("subscription")
        .and_then(|id| subscriptions.topic_for(id))
    else {
        tracing::debug!(destination = ?frame.get("destination"), "message for unknown subscription");
        return;
    };
    match topic.decode(&frame.body) {
        Ok(message) => manager.shared.bus.emit(LiveEvent::Push(message)),
        Err(error) => tracing::warn!(
            ?topic,
            %error,
            payload = %truncate_message(&frame.body, LOG_PAYLOAD_PREVIEW_CHARS),
            "dropping malformed push message"
        ),
    }
}

async fn watch_liveness<C: Connector>(
    shared: Weak<Shared<C>>,
    epoch: u64,
    link: LinkSender,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(manager) = shared.upgrade().map(ConnectionManager::from_shared) else {
            return;
        };
        if !link.is_ready() {
            manager.connection_lost(epoch, "transport no longer ready");
            return;
        }
        link.send_text(HEARTBEAT.to_string());
    }
}
