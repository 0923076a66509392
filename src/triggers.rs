use crate::errors::{AppError, AppResult};
use crate::models::ReminderDispatch;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, Notify};
use tokio::time::Duration;
use uuid::Uuid;

/// Scheduling collaborator. `install` registers a one-shot trigger that
/// fires `dispatch` at `fire_at` and returns an opaque handle; `retire`
/// cancels by handle and is a no-op when the handle is unknown, so callers
/// can retire unconditionally.
#[async_trait]
pub trait TriggerBackend: Send + Sync {
    async fn install(&self, fire_at: DateTime<Utc>, dispatch: ReminderDispatch)
        -> AppResult<String>;
    async fn retire(&self, handle: &str) -> AppResult<()>;
}

#[derive(Debug, Clone)]
struct PendingTrigger {
    handle: String,
    fire_at: DateTime<Utc>,
    dispatch: ReminderDispatch,
}

type ExecutorFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
type Executor = Arc<dyn Fn(ReminderDispatch) -> ExecutorFuture + Send + Sync>;

/// In-process trigger backend: a notify-driven queue that sleeps until the
/// earliest fire time and hands due dispatches to a pluggable executor.
/// The executor is installed after construction so the queue can be wired
/// to services that themselves hold the queue.
#[derive(Clone)]
pub struct TriggerQueue {
    queue: Arc<Mutex<Vec<PendingTrigger>>>,
    notify: Arc<Notify>,
    executor: Arc<RwLock<Option<Executor>>>,
    capacity: usize,
}

impl TriggerQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            notify: Arc::new(Notify::new()),
            executor: Arc::new(RwLock::new(None)),
            capacity,
        }
    }

    pub fn set_executor(&self, executor: Executor) {
        let mut writer = self.executor.write().expect("trigger executor write lock");
        *writer = Some(executor);
    }

    pub fn start(&self) {
        let queue = self.clone();
        tokio::spawn(async move {
            queue.run_loop().await;
        });
    }

    pub async fn pending_count(&self) -> usize {
        self.queue.lock().await.len()
    }

    async fn run_loop(self) {
        loop {
            self.notify.notified().await;
            loop {
                let (maybe_trigger, next_delay) = self.pick_next_trigger().await;
                let Some(trigger) = maybe_trigger else {
                    if let Some(delay) = next_delay {
                        let notify = self.notify.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            notify.notify_one();
                        });
                    }
                    break;
                };

                let queue = self.clone();
                tokio::spawn(async move {
                    let task_id = trigger.dispatch.task_id.clone();
                    let failed = queue.execute(trigger.dispatch).await;
                    if failed {
                        tracing::warn!(task_id = %task_id, "reminder dispatch reported failure");
                    }
                });
            }
        }
    }

    async fn execute(&self, dispatch: ReminderDispatch) -> bool {
        let executor = self
            .executor
            .read()
            .expect("trigger executor read lock")
            .clone();
        match executor {
            Some(executor) => executor(dispatch).await,
            None => true,
        }
    }

    async fn pick_next_trigger(&self) -> (Option<PendingTrigger>, Option<Duration>) {
        let mut queue = self.queue.lock().await;
        if queue.is_empty() {
            return (None, None);
        }

        let now = Utc::now();
        let due_index = queue
            .iter()
            .enumerate()
            .filter(|(_, trigger)| trigger.fire_at <= now)
            .min_by_key(|(_, trigger)| trigger.fire_at)
            .map(|(index, _)| index);

        match due_index {
            Some(index) => (Some(queue.remove(index)), None),
            None => {
                let next_ready_at = queue.iter().map(|trigger| trigger.fire_at).min();
                let delay = next_ready_at.map(|at| {
                    let diff = at.signed_duration_since(now).num_milliseconds();
                    Duration::from_millis(diff.max(0) as u64)
                });
                (None, delay)
            }
        }
    }
}

#[async_trait]
impl TriggerBackend for TriggerQueue {
    async fn install(
        &self,
        fire_at: DateTime<Utc>,
        dispatch: ReminderDispatch,
    ) -> AppResult<String> {
        let handle = Uuid::new_v4().to_string();
        {
            let mut queue = self.queue.lock().await;
            if queue.len() >= self.capacity {
                return Err(AppError::Unavailable(format!(
                    "trigger queue at capacity ({})",
                    self.capacity
                )));
            }
            queue.push(PendingTrigger {
                handle: handle.clone(),
                fire_at,
                dispatch,
            });
        }
        self.notify.notify_one();
        Ok(handle)
    }

    async fn retire(&self, handle: &str) -> AppResult<()> {
        let mut queue = self.queue.lock().await;
        queue.retain(|trigger| trigger.handle != handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn sample_dispatch(task_id: &str) -> ReminderDispatch {
        ReminderDispatch {
            username: "ada".to_string(),
            task_id: task_id.to_string(),
            title: "Water the plants".to_string(),
            due_date: chrono::NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            due_time: chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            email: true,
            sms: false,
        }
    }

    #[tokio::test]
    async fn install_and_retire_are_idempotent_on_handles() {
        let queue = TriggerQueue::new(8);
        let fire_at = Utc::now() + ChronoDuration::hours(1);

        let first = queue
            .install(fire_at, sample_dispatch("t1"))
            .await
            .expect("install first");
        let second = queue
            .install(fire_at, sample_dispatch("t2"))
            .await
            .expect("install second");
        assert_ne!(first, second);
        assert_eq!(queue.pending_count().await, 2);

        queue.retire(&first).await.expect("retire");
        assert_eq!(queue.pending_count().await, 1);
        queue.retire(&first).await.expect("retire again is a no-op");
        queue.retire("no-such-handle").await.expect("unknown handle");
        assert_eq!(queue.pending_count().await, 1);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let queue = TriggerQueue::new(1);
        let fire_at = Utc::now() + ChronoDuration::hours(1);

        queue
            .install(fire_at, sample_dispatch("t1"))
            .await
            .expect("first install");
        let err = queue
            .install(fire_at, sample_dispatch("t2"))
            .await
            .expect_err("over capacity");
        assert!(matches!(err, AppError::Unavailable(_)));
    }

    #[tokio::test]
    async fn due_trigger_reaches_the_executor() {
        let queue = TriggerQueue::new(8);
        let fired: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        queue.set_executor(Arc::new(move |dispatch: ReminderDispatch| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().await.push(dispatch.task_id);
                false
            }) as ExecutorFuture
        }));
        queue.start();

        queue
            .install(Utc::now() - ChronoDuration::seconds(1), sample_dispatch("due-now"))
            .await
            .expect("install");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if fired.lock().await.as_slice() == ["due-now"] {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "dispatch never reached the executor"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn retired_trigger_never_fires() {
        let queue = TriggerQueue::new(8);
        let fired: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        queue.set_executor(Arc::new(move |dispatch: ReminderDispatch| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().await.push(dispatch.task_id);
                false
            }) as ExecutorFuture
        }));
        queue.start();

        let handle = queue
            .install(
                Utc::now() + ChronoDuration::milliseconds(80),
                sample_dispatch("soon"),
            )
            .await
            .expect("install");
        queue.retire(&handle).await.expect("retire");

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(fired.lock().await.is_empty());
        assert_eq!(queue.pending_count().await, 0);
    }
}
