pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/api";
pub const DEFAULT_STREAM_PATH: &str = "/ws/websocket";
pub const DEFAULT_HEALTH_PATH: &str = "/health";

pub const STREAM_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const STREAM_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
pub const STREAM_WATCHDOG_INTERVAL_MS: u64 = 5_000;
pub const PROBE_TIMEOUT_MS: u64 = 3_000;
pub const REQUEST_TIMEOUT_SECS: u64 = 15;
pub const EVENT_BUS_CAPACITY: usize = 256;

pub const RECONNECT_INITIAL_DELAY_MS: u64 = 1_000;
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;
pub const RECONNECT_BACKOFF_MULTIPLIER: f64 = 1.5;
pub const RECONNECT_MAX_ATTEMPTS: u32 = 0;
pub const RECONNECT_SETTLE_MS: u64 = 2_000;
pub const RECONNECT_COUNTDOWN_TICK_SECS: u64 = 1;

/// User id reserved for system and broadcast scope.
pub const SYSTEM_SESSION_ID: i64 = 0;

pub const STOMP_ACCEPT_VERSION: &str = "1.2";

pub const TOPIC_SYSTEM: &str = "/topic/system";
pub const TOPIC_BROADCAST: &str = "/topic/notifications";
pub const TOPIC_TASK_STATUS: &str = "/topic/tasks/status";
pub const TOPIC_TASK_RESULTS: &str = "/topic/tasks/results";
pub const TOPIC_QUEUES: &str = "/topic/queues";
pub const TOPIC_TASK_PROGRESS: &str = "/topic/tasks/progress";
pub const TOPIC_SESSION_NOTIFICATIONS: &str = "/user/queue/notifications";

pub const APP_SUBSCRIBE_REQUEST: &str = "/app/notifications.subscribe";
pub const APP_MARK_READ_REQUEST: &str = "/app/notifications.markRead";
pub const APP_BROADCAST_REQUEST: &str = "/app/notifications.broadcast";

pub const LOG_PAYLOAD_PREVIEW_CHARS: usize = 140;
pub const ERROR_DETAIL_MAX_CHARS: usize = 300;
