use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use crate::{
    api::PullBackend,
    error::{LiveError, Result},
    events::{EventBus, LiveEvent, MirrorCollection},
    model::{QueueAction, QueueUpdateEvent, Task, TaskProgress, TaskQueue, TaskResultEvent, TaskStatus},
    topics::PushMessage,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorUpdate {
    /// A known entity was changed in place.
    Applied,
    /// The update referenced something unknown; the collection was re-pulled.
    Refreshed(MirrorCollection),
    Ignored,
}

#[derive(Debug, Default)]
struct MirrorState {
    tasks: Vec<Task>,
    queues: Vec<TaskQueue>,
    progress: HashMap<i64, TaskProgress>,
}

impl MirrorState {
    /// Replace every copy of the task, including those nested in queues.
    fn replace_task(&mut self, task: &Task) -> bool {
        let mut found = false;
        if let Some(existing) = self.tasks.iter_mut().find(|t| t.id == task.id) {
            *existing = task.clone();
            found = true;
        }
        for queued in self
            .queues
            .iter_mut()
            .flat_map(|queue| queue.tasks.iter_mut())
            .filter(|t| t.id == task.id)
        {
            *queued = task.clone();
        }
        found
    }

    /// Finished tasks report no further progress.
    fn apply_result(&mut self, event: &TaskResultEvent) -> bool {
        if matches!(event.status, Some(TaskStatus::Done | TaskStatus::Error)) {
            self.progress.remove(&event.task_id);
        }
        let update = |task: &mut Task| {
            if let Some(result) = &event.result {
                task.result = Some(result.clone());
            }
            if let Some(status) = &event.status {
                task.status = status.clone();
                task.completed = *status == TaskStatus::Done;
            }
        };
        let mut found = false;
        if let Some(task) = self.tasks.iter_mut().find(|t| t.id == event.task_id) {
            update(task);
            found = true;
        }
        self.queues
            .iter_mut()
            .flat_map(|queue| queue.tasks.iter_mut())
            .filter(|t| t.id == event.task_id)
            .for_each(update);
        found
    }
}

/// Local copy of server-owned tasks and queues. Push events patch what is
/// already known; anything else is pulled from the backend.
pub struct TaskMirror<B: PullBackend> {
    backend: Arc<B>,
    bus: EventBus,
    state: Mutex<MirrorState>,
    generation: AtomicU64,
}

impl<B: PullBackend> TaskMirror<B> {
    pub fn new(backend: Arc<B>, bus: EventBus) -> Self {
        Self {
            backend,
            bus,
            state: Mutex::new(MirrorState::default()),
            generation: AtomicU64::new(0),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, MirrorState>> {
        self.state
            .lock()
            .map_err(|_| LiveError::Poisoned("task mirror"))
    }

    pub async fn apply(&self, message: &PushMessage) -> Result<MirrorUpdate> {
        match message {
            PushMessage::TaskStatus(task) => {
                let known = self.state()?.replace_task(task);
                if known {
                    return Ok(MirrorUpdate::Applied);
                }
                self.refresh(MirrorCollection::Tasks).await?;
                Ok(MirrorUpdate::Refreshed(MirrorCollection::Tasks))
            }
            PushMessage::TaskResult(event) => {
                let known = self.state()?.apply_result(event);
                if known {
                    return Ok(MirrorUpdate::Applied);
                }
                self.refresh(MirrorCollection::Tasks).await?;
                Ok(MirrorUpdate::Refreshed(MirrorCollection::Tasks))
            }
            PushMessage::Queue(event) => self.apply_queue_event(event).await,
            PushMessage::TaskProgress(progress) => {
                self.state()?
                    .progress
                    .insert(progress.task_id, progress.clone());
                Ok(MirrorUpdate::Applied)
            }
            PushMessage::Notifications { .. } => Ok(MirrorUpdate::Ignored),
        }
    }

    async fn apply_queue_event(&self, event: &QueueUpdateEvent) -> Result<MirrorUpdate> {
        let patched = {
            let mut state = self.state()?;
            if let (QueueAction::Removed, Some(task_id)) = (&event.action, event.task_id) {
                state.progress.remove(&task_id);
            }
            let outcome = match state.queues.iter_mut().find(|q| q.id == event.queue_id) {
                None => None,
                Some(queue) => match (&event.action, event.task_id) {
                    (QueueAction::Removed, Some(task_id)) => {
                        queue.tasks.retain(|task| task.id != task_id);
                        queue.task_count = queue.tasks.len();
                        Some(true)
                    }
                    (_, Some(task_id)) => {
                        match queue.tasks.iter_mut().find(|task| task.id == task_id) {
                            Some(task) => {
                                if let Some(status) = &event.task_status {
                                    task.status = status.clone();
                                    task.completed = *status == TaskStatus::Done;
                                }
                                Some(true)
                            }
                            None => Some(false),
                        }
                    }
                    (_, None) => Some(false),
                },
            };
            outcome
        };

        match patched {
            Some(true) => Ok(MirrorUpdate::Applied),
            Some(false) => {
                self.refresh_queue(event.queue_id).await?;
                Ok(MirrorUpdate::Refreshed(MirrorCollection::Queues))
            }
            None => {
                self.refresh(MirrorCollection::Queues).await?;
                Ok(MirrorUpdate::Refreshed(MirrorCollection::Queues))
            }
        }
    }

    /// Replace a whole collection with the backend's copy. A clear that
    /// lands while the fetch is in flight wins.
    pub async fn refresh(&self, collection: MirrorCollection) -> Result<()> {
        let generation = self.generation.load(Ordering::SeqCst);
        match collection {
            MirrorCollection::Tasks => {
                let tasks = self.backend.fetch_tasks().await?;
                let mut state = self.state()?;
                if self.generation.load(Ordering::SeqCst) != generation {
                    return Ok(());
                }
                tracing::debug!(count = tasks.len(), "task mirror refreshed");
                state.tasks = tasks;
            }
            MirrorCollection::Queues => {
                let queues = self.backend.fetch_queues().await?;
                let mut state = self.state()?;
                if self.generation.load(Ordering::SeqCst) != generation {
                    return Ok(());
                }
                tracing::debug!(count = queues.len(), "queue mirror refreshed");
                state.queues = queues;
            }
        }
        self.bus.emit(LiveEvent::MirrorRefreshed(collection));
        Ok(())
    }

    pub async fn refresh_all(&self) -> Result<()> {
        self.refresh(MirrorCollection::Tasks).await?;
        self.refresh(MirrorCollection::Queues).await
    }

    async fn refresh_queue(&self, queue_id: i64) -> Result<()> {
        let generation = self.generation.load(Ordering::SeqCst);
        let fetched = match self.backend.fetch_queue(queue_id).await {
            Ok(queue) => Some(queue),
            Err(LiveError::NotFound) => None,
            Err(error) => return Err(error),
        };
        {
            let mut state = self.state()?;
            if self.generation.load(Ordering::SeqCst) != generation {
                return Ok(());
            }
            let position = state.queues.iter().position(|q| q.id == queue_id);
            match (position, fetched) {
                (Some(index), Some(queue)) => state.queues[index] = queue,
                (None, Some(queue)) => state.queues.push(queue),
                (Some(index), None) => {
                    tracing::debug!(queue_id, "queue no longer exists on the server");
                    state.queues.remove(index);
                }
                (None, None) => {}
            }
        }
        self.bus
            .emit(LiveEvent::MirrorRefreshed(MirrorCollection::Queues));
        Ok(())
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut state) = self.state() {
            *state = MirrorState::default();
        }
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.state().map(|s| s.tasks.clone()).unwrap_or_default()
    }

    pub fn task(&self, task_id: i64) -> Option<Task> {
        self.state()
            .ok()?
            .tasks
            .iter()
            .find(|task| task.id == task_id)
            .cloned()
    }

    pub fn queues(&self) -> Vec<TaskQueue> {
        self.state().map(|s| s.queues.clone()).unwrap_or_default()
    }

    pub fn queue(&self, queue_id: i64) -> Option<TaskQueue> {
        self.state()
            .ok()?
            .queues
            .iter()
            .find(|queue| queue.id == queue_id)
            .cloned()
    }

    pub fn progress(&self, task_id: i64) -> Option<TaskProgress> {
        self.state().ok()?.progress.get(&task_id).cloned()
    }

    fn tasks_where(&self, keep: impl Fn(&Task) -> bool) -> Vec<Task> {
        self.state()
            .map(|s| s.tasks.iter().filter(|t| keep(t)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_tasks(&self) -> Vec<Task> {
        self.tasks_where(|task| task.status.is_pending())
    }

    pub fn running_tasks(&self) -> Vec<Task> {
        self.tasks_where(|task| task.status == TaskStatus::Running)
    }

    pub fn completed_tasks(&self) -> Vec<Task> {
        self.tasks_where(|task| task.status == TaskStatus::Done || task.completed)
    }
}
