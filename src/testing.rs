//! In-memory stand-ins for the push server and the REST backend.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::Value;
use tokio::sync::{broadcast::error::RecvError, mpsc, watch};

use crate::{
    api::PullBackend,
    connection::ConnectionConfig,
    error::{LiveError, Result},
    events::{EventStream, LiveEvent},
    ingress::InboundNotification,
    model::{SessionId, Task, TaskQueue},
    stomp::{Command, Frame},
    transport::{Connector, FrameLink},
};

pub(crate) fn config_for_tests() -> ConnectionConfig {
    ConnectionConfig {
        stream_url: "ws://fake.test/api/ws/websocket".to_string(),
        host: "fake.test".to_string(),
        connect_timeout: Duration::from_secs(10),
        handshake_timeout: Duration::from_secs(10),
        watchdog_interval: Duration::from_secs(5),
    }
}

pub(crate) async fn next_matching<F>(events: &mut EventStream, mut predicate: F) -> LiveEvent
where
    F: FnMut(&LiveEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(300), wait)
        .await
        .expect("expected event did not arrive")
}

#[derive(Debug, Clone)]
pub(crate) enum HandshakeMode {
    Accept,
    Reject(String),
    Silent,
}

struct FakeLink {
    to_client: Option<mpsc::UnboundedSender<String>>,
    ready: watch::Sender<bool>,
    frames: Vec<Frame>,
    subscriptions: Vec<(String, String)>,
    open: bool,
}

struct ServerState {
    transport_available: bool,
    open_delay: Option<Duration>,
    handshake: HandshakeMode,
    opened: usize,
    next_message_id: u64,
    links: Vec<FakeLink>,
}

#[derive(Clone)]
pub(crate) struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

#[derive(Clone)]
pub(crate) struct FakeConnector {
    state: Arc<Mutex<ServerState>>,
}

impl FakeConnector {
    pub(crate) fn new() -> (Self, FakeServer) {
        let state = Arc::new(Mutex::new(ServerState {
            transport_available: true,
            open_delay: None,
            handshake: HandshakeMode::Accept,
            opened: 0,
            next_message_id: 0,
            links: Vec::new(),
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            FakeServer { state },
        )
    }
}

impl Connector for FakeConnector {
    async fn open(&self, _url: &str) -> Result<FrameLink> {
        let (available, delay) = {
            let mut state = self.state.lock().expect("server state");
            state.opened += 1;
            (state.transport_available, state.open_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !available {
            return Err(LiveError::Transport("connection refused".to_string()));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(true);
        let index = {
            let mut state = self.state.lock().expect("server state");
            state.links.push(FakeLink {
                to_client: Some(inbound_tx),
                ready: ready_tx,
                frames: Vec::new(),
                subscriptions: Vec::new(),
                open: true,
            });
            state.links.len() - 1
        };
        tokio::spawn(serve_link(Arc::clone(&self.state), index, outbound_rx));
        Ok(FrameLink::new(outbound_tx, inbound_rx, ready_rx))
    }
}

async fn serve_link(
    state: Arc<Mutex<ServerState>>,
    index: usize,
    mut from_client: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = from_client.recv().await {
        let Ok(Some(frame)) = Frame::decode(&text) else {
            continue;
        };
        let mut guard = state.lock().expect("server state");
        let handshake = guard.handshake.clone();
        let link = &mut guard.links[index];
        link.frames.push(frame.clone());
        let reply = match frame.command {
            Command::Connect | Command::Stomp => match handshake {
                HandshakeMode::Accept => {
                    Some(Frame::new(Command::Connected).header("version", "1.2"))
                }
                HandshakeMode::Reject(message) => {
                    Some(Frame::new(Command::Error).header("message", message))
                }
                HandshakeMode::Silent => None,
            },
            Command::Subscribe => {
                if let (Some(id), Some(destination)) = (frame.get("id"), frame.get("destination")) {
                    link.subscriptions
                        .push((destination.to_string(), id.to_string()));
                }
                None
            }
            _ => None,
        };
        if let (Some(reply), Some(to_client)) = (reply, link.to_client.as_ref()) {
            let _ = to_client.send(reply.encode());
        }
    }
    if let Ok(mut guard) = state.lock() {
        let link = &mut guard.links[index];
        link.open = false;
        link.ready.send_replace(false);
    }
}

impl FakeServer {
    fn with_state<T>(&self, f: impl FnOnce(&mut ServerState) -> T) -> T {
        let mut state = self.state.lock().expect("server state");
        f(&mut state)
    }

    pub(crate) fn set_handshake(&self, mode: HandshakeMode) {
        self.with_state(|state| state.handshake = mode);
    }

    pub(crate) fn set_transport_available(&self, available: bool) {
        self.with_state(|state| state.transport_available = available);
    }

    pub(crate) fn set_open_delay(&self, delay: Duration) {
        self.with_state(|state| state.open_delay = Some(delay));
    }

    pub(crate) fn opened(&self) -> usize {
        self.with_state(|state| state.opened)
    }

    pub(crate) fn link_open(&self, index: usize) -> bool {
        self.with_state(|state| state.links.get(index).map(|link| link.open).unwrap_or(false))
    }

    /// Let spawned tasks drain their queues.
    pub(crate) async fn settle(&self) {
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    pub(crate) fn sent_frames(&self) -> Vec<Frame> {
        self.with_state(|state| {
            state
                .links
                .last()
                .map(|link| link.frames.clone())
                .unwrap_or_default()
        })
    }

    pub(crate) fn subscribed_destinations(&self) -> Vec<String> {
        self.with_state(|state| {
            state
                .links
                .last()
                .map(|link| {
                    link.subscriptions
                        .iter()
                        .map(|(destination, _)| destination.clone())
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    /// Push a MESSAGE to the newest link, addressed to whichever
    /// subscription id the client bound to `destination`.
    pub(crate) fn deliver(&self, destination: &str, body: &str) -> bool {
        self.with_state(|state| {
            state.next_message_id += 1;
            let message_id = state.next_message_id;
            let Some(link) = state.links.last() else {
                return false;
            };
            let Some((_, subscription)) = link
                .subscriptions
                .iter()
                .find(|(bound, _)| bound == destination)
            else {
                return false;
            };
            let frame = Frame::new(Command::Message)
                .header("destination", destination)
                .header("subscription", subscription.as_str())
                .header("message-id", message_id.to_string())
                .with_body(body);
            link.to_client
                .as_ref()
                .map(|to_client| to_client.send(frame.encode()).is_ok())
                .unwrap_or(false)
        })
    }

    pub(crate) fn send_raw(&self, text: &str) {
        self.with_state(|state| {
            if let Some(to_client) = state.links.last().and_then(|link| link.to_client.as_ref()) {
                let _ = to_client.send(text.to_string());
            }
        });
    }

    /// Orderly close from the server side.
    pub(crate) fn close_link(&self) {
        self.with_state(|state| {
            if let Some(link) = state.links.last_mut() {
                link.to_client = None;
                link.ready.send_replace(false);
            }
        });
    }

    /// The transport dies without the client's reader noticing.
    pub(crate) fn drop_silently(&self) {
        self.with_state(|state| {
            if let Some(link) = state.links.last_mut() {
                link.ready.send_replace(false);
            }
        });
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum MarkReadReply {
    Accepted,
    NotFound,
    Unavailable,
}

struct BackendState {
    probes: VecDeque<bool>,
    default_probe: bool,
    probe_delay: Option<Duration>,
    pull_delay: Option<Duration>,
    probe_calls: usize,
    notifications: Vec<Value>,
    list_calls: Vec<(SessionId, Option<bool>)>,
    mark_read_reply: MarkReadReply,
    mark_read_calls: Vec<(i64, i64)>,
    tasks: Vec<Task>,
    queues: HashMap<i64, TaskQueue>,
    task_fetches: usize,
    queue_list_fetches: usize,
    queue_fetches: Vec<i64>,
}

#[derive(Clone)]
pub(crate) struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState {
                probes: VecDeque::new(),
                default_probe: true,
                probe_delay: None,
                pull_delay: None,
                probe_calls: 0,
                notifications: Vec::new(),
                list_calls: Vec::new(),
                mark_read_reply: MarkReadReply::Accepted,
                mark_read_calls: Vec::new(),
                tasks: Vec::new(),
                queues: HashMap::new(),
                task_fetches: 0,
                queue_list_fetches: 0,
                queue_fetches: Vec::new(),
            })),
        }
    }
}

impl FakeBackend {
    fn with_state<T>(&self, f: impl FnOnce(&mut BackendState) -> T) -> T {
        let mut state = self.state.lock().expect("backend state");
        f(&mut state)
    }

    /// Queue probe answers; once drained, `default_probe` applies.
    pub(crate) fn script_probes(&self, answers: &[bool]) {
        self.with_state(|state| state.probes.extend(answers.iter().copied()));
    }

    pub(crate) fn set_default_probe(&self, reachable: bool) {
        self.with_state(|state| state.default_probe = reachable);
    }

    pub(crate) fn set_probe_delay(&self, delay: Duration) {
        self.with_state(|state| state.probe_delay = Some(delay));
    }

    /// Slows down task list fetches.
    pub(crate) fn set_pull_delay(&self, delay: Duration) {
        self.with_state(|state| state.pull_delay = Some(delay));
    }

    pub(crate) fn probe_calls(&self) -> usize {
        self.with_state(|state| state.probe_calls)
    }

    pub(crate) fn set_notifications(&self, records: Vec<Value>) {
        self.with_state(|state| state.notifications = records);
    }

    pub(crate) fn list_calls(&self) -> Vec<(SessionId, Option<bool>)> {
        self.with_state(|state| state.list_calls.clone())
    }

    pub(crate) fn set_mark_read_reply(&self, reply: MarkReadReply) {
        self.with_state(|state| state.mark_read_reply = reply);
    }

    pub(crate) fn mark_read_calls(&self) -> Vec<(i64, i64)> {
        self.with_state(|state| state.mark_read_calls.clone())
    }

    pub(crate) fn set_tasks(&self, tasks: Vec<Task>) {
        self.with_state(|state| state.tasks = tasks);
    }

    pub(crate) fn put_queue(&self, queue: TaskQueue) {
        self.with_state(|state| {
            state.queues.insert(queue.id, queue);
        });
    }

    pub(crate) fn remove_queue(&self, queue_id: i64) {
        self.with_state(|state| {
            state.queues.remove(&queue_id);
        });
    }

    pub(crate) fn task_fetches(&self) -> usize {
        self.with_state(|state| state.task_fetches)
    }

    pub(crate) fn queue_list_fetches(&self) -> usize {
        self.with_state(|state| state.queue_list_fetches)
    }

    pub(crate) fn queue_fetches(&self) -> Vec<i64> {
        self.with_state(|state| state.queue_fetches.clone())
    }
}

impl PullBackend for FakeBackend {
    async fn probe(&self) -> bool {
        let (answer, delay) = self.with_state(|state| {
            state.probe_calls += 1;
            let answer = state.probes.pop_front().unwrap_or(state.default_probe);
            (answer, state.probe_delay)
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        answer
    }

    async fn list_notifications(
        &self,
        session: SessionId,
        read: Option<bool>,
    ) -> Result<Vec<InboundNotification>> {
        let records = self.with_state(|state| {
            state.list_calls.push((session, read));
            state.notifications.clone()
        });
        InboundNotification::batch_from_value(Value::Array(records))
    }

    async fn mark_read(&self, notification_id: i64, user_id: i64) -> Result<()> {
        let reply = self.with_state(|state| {
            state.mark_read_calls.push((notification_id, user_id));
            state.mark_read_reply
        });
        match reply {
            MarkReadReply::Accepted => Ok(()),
            MarkReadReply::NotFound => Err(LiveError::NotFound),
            MarkReadReply::Unavailable => Err(LiveError::Http {
                status: 503,
                body: "maintenance".to_string(),
            }),
        }
    }

    async fn fetch_tasks(&self) -> Result<Vec<Task>> {
        let (tasks, delay) = self.with_state(|state| {
            state.task_fetches += 1;
            (state.tasks.clone(), state.pull_delay)
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(tasks)
    }

    async fn fetch_queues(&self) -> Result<Vec<TaskQueue>> {
        Ok(self.with_state(|state| {
            state.queue_list_fetches += 1;
            let mut queues: Vec<_> = state.queues.values().cloned().collect();
            queues.sort_by_key(|queue| queue.id);
            queues
        }))
    }

    async fn fetch_queue(&self, queue_id: i64) -> Result<TaskQueue> {
        self.with_state(|state| {
            state.queue_fetches.push(queue_id);
            state.queues.get(&queue_id).cloned()
        })
        .ok_or(LiveError::NotFound)
    }
}

pub(crate) fn task(id: i64, status: &str) -> Task {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "title": format!("task {id}"),
        "status": status,
    }))
    .expect("task fixture")
}

pub(crate) fn queue(id: i64, tasks: Vec<Task>) -> TaskQueue {
    TaskQueue {
        id,
        name: format!("queue {id}"),
        task_count: tasks.len(),
        tasks,
        created_at: None,
        updated_at: None,
    }
}
