//! Bounded-concurrency task runner keyed by task id.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, FutureExt};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

type TaskFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("task is not registered")]
    UnknownTask,
    #[error("task was aborted before it started")]
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Queued,
    Running,
}

struct TaskEntry {
    token: CancellationToken,
    phase: watch::Sender<TaskPhase>,
    /// Present until the task is admitted.
    run: Option<TaskFn>,
}

struct QueueState<K> {
    tasks: HashMap<K, TaskEntry>,
    waiting: VecDeque<K>,
    /// Ids whose handler is executing, including aborted ones still winding down.
    active: HashSet<K>,
}

struct Inner<K> {
    concurrency: usize,
    state: Mutex<QueueState<K>>,
    load: watch::Sender<usize>,
}

/// Runs async handlers with at most `concurrency` of them in flight.
///
/// Waiting tasks are admitted in FIFO order. A handler always receives a
/// [`CancellationToken`] that is cancelled by [`TaskQueue::abort`] or
/// [`TaskQueue::clear`]; handler errors and panics are logged and only end
/// that task. Two incarnations of the same id never run at the same time: a
/// task re-added after an abort waits until the aborted handler has returned.
pub struct TaskQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for TaskQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> TaskQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn new(concurrency: usize) -> Self {
        let (load, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                concurrency: concurrency.max(1),
                state: Mutex::new(QueueState {
                    tasks: HashMap::new(),
                    waiting: VecDeque::new(),
                    active: HashSet::new(),
                }),
                load,
            }),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// Registers a task. Returns `false` without doing anything when a task
    /// with the same id is already queued or running.
    pub fn add<C, F, Fut>(&self, id: K, context: C, handler: F) -> bool
    where
        C: Send + 'static,
        F: FnOnce(C, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        {
            let mut state = self.inner.lock();
            if state.tasks.contains_key(&id) {
                return false;
            }
            let (phase, _) = watch::channel(TaskPhase::Queued);
            let run: TaskFn = Box::new(move |token| handler(context, token).boxed());
            state.tasks.insert(
                id.clone(),
                TaskEntry {
                    token: CancellationToken::new(),
                    phase,
                    run: Some(run),
                },
            );
            state.waiting.push_back(id.clone());
            debug!(task_id = ?id, waiting = state.waiting.len(), "task queued");
        }
        Inner::pump(&self.inner);
        true
    }

    pub fn has(&self, id: &K) -> bool {
        self.inner.lock().tasks.contains_key(id)
    }

    /// Cancels a task and reports the phase it was in. A task that has not
    /// started yet is dropped without its handler ever being called.
    pub fn abort(&self, id: &K) -> Option<TaskPhase> {
        let removed = {
            let mut state = self.inner.lock();
            let entry = state.tasks.remove(id);
            if let Some(entry) = &entry {
                if entry.run.is_some() {
                    state.waiting.retain(|waiting| waiting != id);
                }
            }
            entry
        };

        let entry = removed?;
        entry.token.cancel();
        let phase = if entry.run.is_some() {
            TaskPhase::Queued
        } else {
            TaskPhase::Running
        };
        debug!(task_id = ?id, ?phase, "task aborted");
        self.inner.publish_load();
        Some(phase)
    }

    /// Aborts every queued and running task.
    pub fn clear(&self) {
        let entries: Vec<TaskEntry> = {
            let mut state = self.inner.lock();
            state.waiting.clear();
            state.tasks.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.token.cancel();
        }
        debug!(aborted = entries.len(), "task queue cleared");
        self.inner.publish_load();
    }

    /// Resolves once the task has left the queue and its handler started.
    pub async fn start_until_run(&self, id: &K) -> Result<(), QueueError> {
        let mut phase = {
            let state = self.inner.lock();
            match state.tasks.get(id) {
                Some(entry) => entry.phase.subscribe(),
                None => return Err(QueueError::UnknownTask),
            }
        };
        phase
            .wait_for(|phase| *phase == TaskPhase::Running)
            .await
            .map(|_| ())
            .map_err(|_| QueueError::Aborted)
    }

    /// Number of queued plus running tasks.
    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of occupied slots.
    pub fn running(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// Resolves once no handler for `id` is executing, including one that
    /// was aborted and is still winding down.
    pub async fn wait_stopped(&self, id: &K) {
        let mut load = self.inner.load.subscribe();
        loop {
            let executing = self.inner.lock().active.contains(id);
            if !executing || load.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves when no task is queued and no handler is executing.
    pub async fn wait_idle(&self) {
        let mut load = self.inner.load.subscribe();
        let _ = load.wait_for(|load| *load == 0).await;
    }
}

impl<K> Inner<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends under the state lock so an older count never overwrites a
    /// newer one.
    fn publish_load(&self) {
        let state = self.lock();
        self.load
            .send_replace(state.waiting.len() + state.active.len());
    }

    fn pump(inner: &Arc<Self>) {
        let mut admitted = Vec::new();
        {
            let mut state = inner.lock();
            while state.active.len() < inner.concurrency {
                let Some(position) = state
                    .waiting
                    .iter()
                    .position(|id| !state.active.contains(id))
                else {
                    break;
                };
                let Some(id) = state.waiting.remove(position) else {
                    break;
                };
                let Some(entry) = state.tasks.get_mut(&id) else {
                    continue;
                };
                let Some(run) = entry.run.take() else {
                    continue;
                };
                entry.phase.send_replace(TaskPhase::Running);
                let token = entry.token.clone();
                state.active.insert(id.clone());
                admitted.push((id, run, token));
            }
        }

        for (id, run, token) in admitted {
            debug!(task_id = ?id, "task started");
            let inner = inner.clone();
            tokio::spawn(async move {
                let task_token = token.clone();
                let outcome = AssertUnwindSafe(async move { run(task_token).await })
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => debug!(task_id = ?id, "task finished"),
                    Ok(Err(err)) if token.is_cancelled() => {
                        debug!(task_id = ?id, error = %err, "task stopped after abort")
                    }
                    Ok(Err(err)) => warn!(task_id = ?id, error = %err, "task failed"),
                    Err(_) => error!(task_id = ?id, "task panicked"),
                }
                Inner::finish(&inner, &id);
            });
        }

        inner.publish_load();
    }

    fn finish(inner: &Arc<Self>, id: &K) {
        {
            let mut state = inner.lock();
            state.active.remove(id);
            // A queued entry under the same id is a newer incarnation; only
            // the admitted one is ours.
            if state
                .tasks
                .get(id)
                .is_some_and(|entry| entry.run.is_none())
            {
                state.tasks.remove(id);
            }
        }
        Inner::pump(inner);
    }
}
