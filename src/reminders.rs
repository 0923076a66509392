use crate::db::{Database, ItemKind, ItemRecord};
use crate::errors::{AppError, AppResult};
use crate::keys;
use crate::models::{ReconcileFailure, ReconcileReport, ReminderDispatch, ScheduleState, Task};
use crate::triggers::TriggerBackend;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use std::sync::Arc;

/// When a reminder fires: `minutesBefore` ahead of the task's due instant,
/// interpreted in UTC.
pub fn compute_fire_time(
    due_date: NaiveDate,
    due_time: NaiveTime,
    minutes_before: u32,
) -> DateTime<Utc> {
    due_date.and_time(due_time).and_utc() - Duration::minutes(i64::from(minutes_before))
}

/// Keeps each task's persisted reminder schedule in step with the trigger
/// backend. Every state transition is written to storage before the backend
/// call it guards, so a crash leaves a `pending-*` marker the reconcile
/// sweep can repair. Retire-then-install is deliberately non-atomic; the
/// failure mode is a missed window, never two live schedules.
pub struct ReminderScheduler {
    db: Arc<Database>,
    backend: Arc<dyn TriggerBackend>,
}

impl ReminderScheduler {
    pub fn new(db: Arc<Database>, backend: Arc<dyn TriggerBackend>) -> Self {
        Self { db, backend }
    }

    /// Bring the task's live schedule in line with its current reminder
    /// settings: retire whatever is installed, then install anew when
    /// enabled. Mutates `task` (handle and state) and persists it at each
    /// transition. An unschedulable reminder (no dueTime, fire time already
    /// past) is a Validation error and ends with a cleared schedule.
    pub async fn sync_schedule(&self, task: &mut Task, now: DateTime<Utc>) -> AppResult<()> {
        let live_handle = task
            .reminders
            .as_ref()
            .and_then(|reminders| reminders.scheduling_handle.clone());
        if let Some(handle) = live_handle {
            self.persist_state(task, ScheduleState::PendingRetire)?;
            self.backend.retire(&handle).await?;
            if let Some(reminders) = task.reminders.as_mut() {
                reminders.scheduling_handle = None;
            }
            self.persist_state(task, ScheduleState::None)?;
        }

        let Some(reminders) = task.reminders.clone() else {
            return Ok(());
        };
        if !reminders.enabled {
            if reminders.schedule_state != ScheduleState::None {
                self.persist_state(task, ScheduleState::None)?;
            }
            return Ok(());
        }

        let Some(due_time) = task.due_time else {
            self.persist_state(task, ScheduleState::None)?;
            return Err(AppError::Validation(
                "reminders require a dueTime".to_string(),
            ));
        };
        let fire_at = compute_fire_time(task.due_date, due_time, reminders.minutes_before);
        if fire_at <= now {
            self.persist_state(task, ScheduleState::None)?;
            return Err(AppError::Validation(format!(
                "reminder would fire in the past ({fire_at})"
            )));
        }

        self.persist_state(task, ScheduleState::PendingInstall)?;
        let dispatch = ReminderDispatch {
            username: task.username.clone(),
            task_id: task.task_id.clone(),
            title: task.title.clone(),
            due_date: task.due_date,
            due_time,
            email: reminders.email,
            sms: reminders.sms,
        };
        let handle = self.backend.install(fire_at, dispatch).await?;
        if let Some(reminders) = task.reminders.as_mut() {
            reminders.scheduling_handle = Some(handle);
        }
        self.persist_state(task, ScheduleState::Installed)?;
        tracing::debug!(task_id = %task.task_id, fire_at = %fire_at, "reminder installed");
        Ok(())
    }

    /// Sweep one user's tasks for schedules needing repair: transitions
    /// interrupted mid-flight (`pending-*`) and installed schedules whose
    /// reminder has since been disabled. Repairs run through the same
    /// state machine as live traffic.
    pub async fn reconcile(&self, owner: &str, now: DateTime<Utc>) -> AppResult<ReconcileReport> {
        let pk = keys::user_pk(owner);
        let items = self.db.list_prefix(&pk, keys::TASK_PREFIX)?;

        let mut report = ReconcileReport::default();
        for item in items {
            report.examined += 1;
            let mut task: Task = match item.body_as() {
                Ok(task) => task,
                Err(err) => {
                    report.failures.push(ReconcileFailure {
                        task_id: item.sk.clone(),
                        error: err.to_string(),
                    });
                    continue;
                }
            };

            if !needs_repair(&task) {
                continue;
            }

            let task_id = task.task_id.clone();
            match self.sync_schedule(&mut task, now).await {
                // A Validation error means the schedule is unservable (fire
                // time passed while stuck); the retire half already cleared it.
                Ok(()) | Err(AppError::Validation(_)) => report.repaired.push(task_id),
                Err(err) => {
                    tracing::warn!(task_id = %task_id, error = %err, "schedule repair failed");
                    report.failures.push(ReconcileFailure {
                        task_id,
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    fn persist_state(&self, task: &mut Task, state: ScheduleState) -> AppResult<()> {
        if let Some(reminders) = task.reminders.as_mut() {
            reminders.schedule_state = state;
        }
        let item = ItemRecord::new(
            keys::user_pk(&task.username),
            keys::task_sk(task.due_date, &task.task_id),
            ItemKind::Task,
            serde_json::to_value(&*task)?,
        );
        self.db.put_item(&item, Some(&task.task_id))
    }
}

fn needs_repair(task: &Task) -> bool {
    let Some(reminders) = task.reminders.as_ref() else {
        return false;
    };
    match reminders.schedule_state {
        ScheduleState::PendingRetire | ScheduleState::PendingInstall => true,
        ScheduleState::Installed => !reminders.enabled,
        ScheduleState::None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, ReminderSettings};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingBackend {
        events: Mutex<Vec<String>>,
        next_handle: AtomicU32,
        fail_installs: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl TriggerBackend for RecordingBackend {
        async fn install(
            &self,
            _fire_at: DateTime<Utc>,
            dispatch: ReminderDispatch,
        ) -> AppResult<String> {
            if self.fail_installs.load(Ordering::SeqCst) {
                return Err(AppError::Unavailable("backend down".to_string()));
            }
            let handle = format!("h{}", self.next_handle.fetch_add(1, Ordering::SeqCst));
            self.events
                .lock()
                .await
                .push(format!("install:{handle}:{}", dispatch.task_id));
            Ok(handle)
        }

        async fn retire(&self, handle: &str) -> AppResult<()> {
            self.events.lock().await.push(format!("retire:{handle}"));
            Ok(())
        }
    }

    fn scheduler(dir: &tempfile::TempDir) -> (ReminderScheduler, Arc<Database>, Arc<RecordingBackend>) {
        let db = Arc::new(Database::new(&dir.path().join("test.db")).expect("db"));
        let backend = Arc::new(RecordingBackend::default());
        (
            ReminderScheduler::new(db.clone(), backend.clone()),
            db,
            backend,
        )
    }

    fn reminder_task(due_date: NaiveDate, due_time: Option<NaiveTime>, enabled: bool) -> Task {
        Task {
            task_id: "t1".to_string(),
            username: "ada".to_string(),
            title: "Water the plants".to_string(),
            description: None,
            category_id: None,
            priority: Priority::Medium,
            due_date,
            due_time,
            completed: false,
            recurring: None,
            reminders: Some(ReminderSettings {
                enabled,
                email: true,
                sms: false,
                minutes_before: 30,
                scheduling_handle: None,
                schedule_state: ScheduleState::None,
            }),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn stored_task(db: &Database, task: &Task) -> Task {
        db.get_item(
            &keys::user_pk(&task.username),
            &keys::task_sk(task.due_date, &task.task_id),
        )
        .expect("get")
        .expect("exists")
        .body_as()
        .expect("task body")
    }

    #[test]
    fn fire_time_subtracts_lead_minutes() {
        let fire_at = compute_fire_time(
            NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            30,
        );
        assert_eq!(fire_at.to_rfc3339(), "2025-03-10T08:30:00+00:00");
    }

    #[tokio::test]
    async fn enabling_installs_and_persists_the_handle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (scheduler, db, backend) = scheduler(&dir);
        let now = Utc::now();
        let mut task = reminder_task(
            (now + Duration::days(1)).date_naive(),
            Some(NaiveTime::from_hms_opt(9, 0, 0).unwrap()),
            true,
        );

        scheduler.sync_schedule(&mut task, now).await.expect("sync");

        let reminders = task.reminders.as_ref().expect("reminders");
        assert_eq!(reminders.schedule_state, ScheduleState::Installed);
        assert_eq!(reminders.scheduling_handle.as_deref(), Some("h0"));
        assert_eq!(backend.events.lock().await.as_slice(), ["install:h0:t1"]);

        let persisted = stored_task(&db, &task);
        assert_eq!(
            persisted.reminders.expect("reminders").schedule_state,
            ScheduleState::Installed
        );
    }

    #[tokio::test]
    async fn past_fire_time_is_validation_and_leaves_no_handle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (scheduler, db, backend) = scheduler(&dir);
        let now = Utc::now();
        let mut task = reminder_task(
            now.date_naive(),
            Some(NaiveTime::from_hms_opt(0, 0, 0).unwrap()),
            true,
        );

        let err = scheduler.sync_schedule(&mut task, now).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(task.live_scheduling_handle().is_none());
        assert!(backend.events.lock().await.is_empty());

        let persisted = stored_task(&db, &task);
        let reminders = persisted.reminders.expect("reminders");
        assert_eq!(reminders.schedule_state, ScheduleState::None);
        assert!(reminders.scheduling_handle.is_none());
    }

    #[tokio::test]
    async fn missing_due_time_is_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (scheduler, _db, _backend) = scheduler(&dir);
        let now = Utc::now();
        let mut task = reminder_task((now + Duration::days(1)).date_naive(), None, true);

        let err = scheduler.sync_schedule(&mut task, now).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(task.live_scheduling_handle().is_none());
    }

    #[tokio::test]
    async fn resync_retires_before_installing_again() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (scheduler, _db, backend) = scheduler(&dir);
        let now = Utc::now();
        let mut task = reminder_task(
            (now + Duration::days(1)).date_naive(),
            Some(NaiveTime::from_hms_opt(9, 0, 0).unwrap()),
            true,
        );

        scheduler.sync_schedule(&mut task, now).await.expect("first sync");
        task.due_time = Some(NaiveTime::from_hms_opt(15, 0, 0).unwrap());
        scheduler.sync_schedule(&mut task, now).await.expect("second sync");

        let events = backend.events.lock().await.clone();
        assert_eq!(events, ["install:h0:t1", "retire:h0", "install:h1:t1"]);
        assert_eq!(task.live_scheduling_handle(), Some("h1"));
    }

    #[tokio::test]
    async fn disabling_retires_and_clears_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (scheduler, db, backend) = scheduler(&dir);
        let now = Utc::now();
        let mut task = reminder_task(
            (now + Duration::days(1)).date_naive(),
            Some(NaiveTime::from_hms_opt(9, 0, 0).unwrap()),
            true,
        );

        scheduler.sync_schedule(&mut task, now).await.expect("install");
        if let Some(reminders) = task.reminders.as_mut() {
            reminders.enabled = false;
        }
        scheduler.sync_schedule(&mut task, now).await.expect("disable");

        let events = backend.events.lock().await.clone();
        assert_eq!(events, ["install:h0:t1", "retire:h0"]);
        let persisted = stored_task(&db, &task);
        let reminders = persisted.reminders.expect("reminders");
        assert_eq!(reminders.schedule_state, ScheduleState::None);
        assert!(reminders.scheduling_handle.is_none());
    }

    #[tokio::test]
    async fn backend_failure_leaves_the_pending_marker_visible() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (scheduler, db, backend) = scheduler(&dir);
        backend.fail_installs.store(true, Ordering::SeqCst);
        let now = Utc::now();
        let mut task = reminder_task(
            (now + Duration::days(1)).date_naive(),
            Some(NaiveTime::from_hms_opt(9, 0, 0).unwrap()),
            true,
        );

        let err = scheduler.sync_schedule(&mut task, now).await.unwrap_err();
        assert!(matches!(err, AppError::Unavailable(_)));

        let persisted = stored_task(&db, &task);
        let reminders = persisted.reminders.expect("reminders");
        assert_eq!(reminders.schedule_state, ScheduleState::PendingInstall);
        assert!(reminders.scheduling_handle.is_none());
    }

    #[tokio::test]
    async fn reconcile_completes_an_interrupted_install() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (scheduler, db, backend) = scheduler(&dir);
        let now = Utc::now();

        let mut task = reminder_task(
            (now + Duration::days(1)).date_naive(),
            Some(NaiveTime::from_hms_opt(9, 0, 0).unwrap()),
            true,
        );
        if let Some(reminders) = task.reminders.as_mut() {
            reminders.schedule_state = ScheduleState::PendingInstall;
        }
        let item = ItemRecord::new(
            keys::user_pk("ada"),
            keys::task_sk(task.due_date, "t1"),
            ItemKind::Task,
            serde_json::to_value(&task).expect("json"),
        );
        db.put_item(&item, Some("t1")).expect("seed");

        let report = scheduler.reconcile("ada", now).await.expect("reconcile");
        assert_eq!(report.examined, 1);
        assert_eq!(report.repaired, vec!["t1".to_string()]);
        assert!(report.failures.is_empty());

        let persisted = stored_task(&db, &task);
        let reminders = persisted.reminders.expect("reminders");
        assert_eq!(reminders.schedule_state, ScheduleState::Installed);
        assert!(reminders.scheduling_handle.is_some());
        assert_eq!(backend.events.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn reconcile_retires_disabled_but_installed_schedules() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (scheduler, db, backend) = scheduler(&dir);
        let now = Utc::now();

        let mut task = reminder_task(
            (now + Duration::days(1)).date_naive(),
            Some(NaiveTime::from_hms_opt(9, 0, 0).unwrap()),
            false,
        );
        if let Some(reminders) = task.reminders.as_mut() {
            reminders.schedule_state = ScheduleState::Installed;
            reminders.scheduling_handle = Some("stale".to_string());
        }
        let item = ItemRecord::new(
            keys::user_pk("ada"),
            keys::task_sk(task.due_date, "t1"),
            ItemKind::Task,
            serde_json::to_value(&task).expect("json"),
        );
        db.put_item(&item, Some("t1")).expect("seed");

        let report = scheduler.reconcile("ada", now).await.expect("reconcile");
        assert_eq!(report.repaired, vec!["t1".to_string()]);
        assert_eq!(backend.events.lock().await.as_slice(), ["retire:stale"]);

        let persisted = stored_task(&db, &task);
        let reminders = persisted.reminders.expect("reminders");
        assert_eq!(reminders.schedule_state, ScheduleState::None);
        assert!(reminders.scheduling_handle.is_none());
    }

    #[tokio::test]
    async fn reconcile_leaves_healthy_schedules_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (scheduler, _db, backend) = scheduler(&dir);
        let now = Utc::now();

        let mut task = reminder_task(
            (now + Duration::days(1)).date_naive(),
            Some(NaiveTime::from_hms_opt(9, 0, 0).unwrap()),
            true,
        );
        scheduler.sync_schedule(&mut task, now).await.expect("install");
        backend.events.lock().await.clear();

        let report = scheduler.reconcile("ada", now).await.expect("reconcile");
        assert_eq!(report.examined, 1);
        assert!(report.repaired.is_empty());
        assert!(backend.events.lock().await.is_empty());
    }
}
