use std::{
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use tokio::{task::JoinHandle, time::Instant};

use crate::{
    api::PullBackend,
    consts::RECONNECT_COUNTDOWN_TICK_SECS,
    connection::ConnectionManager,
    events::{EventBus, LiveEvent},
    model::{ConnectionStatus, SessionId},
    settings::ReconnectSettings,
    transport::Connector,
};

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// 0 means unlimited.
    pub max_attempts: u32,
    /// How long a fresh connection must survive before it counts.
    pub settle: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_settings(&ReconnectSettings::default())
    }
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.backoff_multiplier,
            max_attempts: settings.max_attempts,
            settle: Duration::from_millis(settings.settle_ms),
        }
    }

    pub fn next_delay(&self, current: Duration) -> Duration {
        let scaled = (current.as_millis() as f64 * self.multiplier).round();
        Duration::from_millis(scaled as u64).min(self.max_delay)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPhase {
    #[default]
    Idle,
    Reconnecting,
    GaveUp,
}

impl ReconnectPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Reconnecting => "reconnecting",
            Self::GaveUp => "gave_up",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectSnapshot {
    pub phase: ReconnectPhase,
    pub attempts: u32,
    pub delay: Duration,
    pub seconds_until_next: Option<u64>,
    pub session: Option<SessionId>,
}

struct ControllerState {
    phase: ReconnectPhase,
    attempts: u32,
    delay: Duration,
    session: Option<SessionId>,
    epoch: u64,
    next_attempt_at: Option<Instant>,
    driver: Option<JoinHandle<()>>,
    countdown: Option<JoinHandle<()>>,
}

impl ControllerState {
    fn abort_countdown(&mut self) {
        if let Some(countdown) = self.countdown.take() {
            countdown.abort();
        }
    }
}

struct Inner<C: Connector, B: PullBackend> {
    policy: ReconnectPolicy,
    manager: ConnectionManager<C>,
    backend: Arc<B>,
    bus: EventBus,
    state: Mutex<ControllerState>,
}

impl<C: Connector, B: PullBackend> Inner<C, B> {
    fn state(&self) -> MutexGuard<'_, ControllerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.state().epoch == epoch
    }
}

/// Drives repeated connect attempts after an unintended loss. At most one
/// attempt sequence runs at a time.
pub struct ReconnectController<C: Connector, B: PullBackend> {
    inner: Arc<Inner<C, B>>,
}

impl<C: Connector, B: PullBackend> Clone for ReconnectController<C, B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector, B: PullBackend> ReconnectController<C, B> {
    pub fn new(
        policy: ReconnectPolicy,
        manager: ConnectionManager<C>,
        backend: Arc<B>,
        bus: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                policy,
                manager,
                backend,
                bus,
                state: Mutex::new(ControllerState {
                    phase: ReconnectPhase::Idle,
                    attempts: 0,
                    delay: policy.initial_delay,
                    session: None,
                    epoch: 0,
                    next_attempt_at: None,
                    driver: None,
                    countdown: None,
                }),
            }),
        }
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.inner.policy
    }

    /// Begin reconnecting. Ignored while a sequence is already running.
    pub fn start(&self, session: Option<SessionId>) {
        let mut state = self.inner.state();
        if state.phase == ReconnectPhase::Reconnecting {
            tracing::debug!("reconnect already in progress");
            return;
        }
        state.epoch = state.epoch.wrapping_add(1);
        state.phase = ReconnectPhase::Reconnecting;
        state.attempts = 0;
        state.delay = self.inner.policy.initial_delay;
        state.session = session;
        let epoch = state.epoch;
        state.driver = Some(tokio::spawn(drive(Arc::downgrade(&self.inner), epoch)));
        tracing::info!(session = ?session, "starting reconnect sequence");
    }

    /// Cancel every pending timer and return to idle. Results of an attempt
    /// already in flight are discarded.
    pub fn stop(&self) {
        let (driver, countdown, previous) = {
            let mut state = self.inner.state();
            state.epoch = state.epoch.wrapping_add(1);
            let previous = state.phase;
            state.phase = ReconnectPhase::Idle;
            state.attempts = 0;
            state.delay = self.inner.policy.initial_delay;
            state.next_attempt_at = None;
            (state.driver.take(), state.countdown.take(), previous)
        };
        if let Some(driver) = driver {
            driver.abort();
        }
        if let Some(countdown) = countdown {
            countdown.abort();
        }
        if previous != ReconnectPhase::Idle {
            tracing::debug!(previous = previous.as_str(), "reconnect stopped");
            self.inner.manager.clear_reconnect();
        }
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.inner.state().phase
    }

    pub fn snapshot(&self) -> ReconnectSnapshot {
        let state = self.inner.state();
        ReconnectSnapshot {
            phase: state.phase,
            attempts: state.attempts,
            delay: state.delay,
            seconds_until_next: state.next_attempt_at.map(seconds_until),
            session: state.session,
        }
    }

    /// Timers owned by the controller that have not yet fired or exited.
    pub fn pending_timers(&self) -> usize {
        let state = self.inner.state();
        [state.driver.as_ref(), state.countdown.as_ref()]
            .into_iter()
            .flatten()
            .filter(|handle| !handle.is_finished())
            .count()
    }
}

fn seconds_until(at: Instant) -> u64 {
    at.saturating_duration_since(Instant::now())
        .as_secs_f64()
        .ceil() as u64
}

enum Step {
    Wait {
        attempt: u32,
        delay: Duration,
        session: Option<SessionId>,
    },
    GiveUp(u32),
    Stale,
}

async fn drive<C: Connector, B: PullBackend>(shared: Weak<Inner<C, B>>, epoch: u64) {
    loop {
        let Some(inner) = shared.upgrade() else {
            return;
        };

        let step = {
            let mut state = inner.state();
            if state.epoch != epoch {
                Step::Stale
            } else if inner.policy.exhausted(state.attempts) {
                state.phase = ReconnectPhase::GaveUp;
                state.next_attempt_at = None;
                state.driver = None;
                state.abort_countdown();
                Step::GiveUp(state.attempts)
            } else {
                state.next_attempt_at = Some(Instant::now() + state.delay);
                state.abort_countdown();
                state.countdown = Some(tokio::spawn(count_down(shared.clone(), epoch)));
                Step::Wait {
                    attempt: state.attempts + 1,
                    delay: state.delay,
                    session: state.session,
                }
            }
        };

        let (attempt, delay, session) = match step {
            Step::Stale => return,
            Step::GiveUp(attempts) => {
                tracing::warn!(attempts, "giving up on reconnect");
                inner.manager.clear_reconnect();
                inner.bus.emit(LiveEvent::ReconnectGaveUp { attempts });
                return;
            }
            Step::Wait {
                attempt,
                delay,
                session,
            } => (attempt, delay, session),
        };

        inner.manager.note_reconnect(attempt - 1, delay);
        inner.bus.emit(LiveEvent::ReconnectScheduled { attempt, delay });
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        drop(inner);

        tokio::time::sleep(delay).await;

        let Some(inner) = shared.upgrade() else {
            return;
        };
        {
            let mut state = inner.state();
            if state.epoch != epoch {
                return;
            }
            state.attempts = attempt;
            state.next_attempt_at = None;
        }
        inner.manager.note_reconnect(attempt, delay);

        let reachable = inner.backend.probe().await;
        if !inner.is_current(epoch) {
            return;
        }
        if !reachable {
            back_off(&inner, epoch, attempt, "server unreachable");
            continue;
        }

        let connected = inner.manager.connect(session).await;
        if !inner.is_current(epoch) {
            return;
        }
        if let Err(error) = connected {
            back_off(&inner, epoch, attempt, &error.to_string());
            continue;
        }

        tokio::time::sleep(inner.policy.settle).await;
        if !inner.is_current(epoch) {
            return;
        }
        if inner.manager.status() == ConnectionStatus::Connected {
            succeed(&inner, epoch, session);
            return;
        }
        back_off(&inner, epoch, attempt, "connection did not hold");
    }
}

fn back_off<C: Connector, B: PullBackend>(
    inner: &Inner<C, B>,
    epoch: u64,
    attempt: u32,
    reason: &str,
) {
    let mut state = inner.state();
    if state.epoch != epoch {
        return;
    }
    state.delay = inner.policy.next_delay(state.delay);
    tracing::debug!(
        attempt,
        reason,
        next_delay_ms = state.delay.as_millis() as u64,
        "reconnect attempt unsuccessful"
    );
}

fn succeed<C: Connector, B: PullBackend>(
    inner: &Inner<C, B>,
    epoch: u64,
    session: Option<SessionId>,
) {
    {
        let mut state = inner.state();
        if state.epoch != epoch {
            return;
        }
        tracing::info!(attempts = state.attempts, "reconnected");
        state.phase = ReconnectPhase::Idle;
        state.attempts = 0;
        state.delay = inner.policy.initial_delay;
        state.next_attempt_at = None;
        state.driver = None;
        state.abort_countdown();
    }
    inner.manager.clear_reconnect();
    inner.bus.emit(LiveEvent::Reconnected { session });
}

async fn count_down<C: Connector, B: PullBackend>(shared: Weak<Inner<C, B>>, epoch: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(RECONNECT_COUNTDOWN_TICK_SECS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(inner) = shared.upgrade() else {
            return;
        };
        let remaining = {
            let state = inner.state();
            match state.next_attempt_at {
                Some(at) if state.epoch == epoch => seconds_until(at),
                _ => return,
            }
        };
        inner.bus.emit(LiveEvent::ReconnectCountdown {
            seconds_remaining: remaining,
        });
        if remaining == 0 {
            return;
        }
    }
}
