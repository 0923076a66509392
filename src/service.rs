use crate::db::Database;
use crate::errors::AppResult;
use crate::insights::InsightEngine;
use crate::keys;
use crate::models::{
    Category, CreateCategoryPayload, CreateTaskPayload, DateRange, ExpansionReport, Insight,
    MaintenanceReport, ReconcileReport, ReminderDispatch, Task, UpdateCategoryPayload,
    UpdateTaskPayload, UserProfile,
};
use crate::notify::{Channel, LogSink, NotificationSink};
use crate::ratelimit::RateLimiter;
use crate::recurrence::RecurrenceExpander;
use crate::reminders::ReminderScheduler;
use crate::settings::ServiceSettings;
use crate::store::TaskStore;
use crate::textgen::{OpenAiGenerator, TextGenerator};
use crate::triggers::{TriggerBackend, TriggerQueue};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Service facade: owns the database and every engine, and wires the trigger
/// queue's executor to reminder dispatch. Handlers hold an `Arc<TaskHub>` and
/// call the operation surface below.
pub struct TaskHub {
    db: Arc<Database>,
    triggers: Arc<TriggerQueue>,
    scheduler: Arc<ReminderScheduler>,
    store: Arc<TaskStore>,
    expander: RecurrenceExpander,
    insights: InsightEngine,
    sink: Arc<dyn NotificationSink>,
    settings: ServiceSettings,
}

impl TaskHub {
    /// Production wiring: OpenAI-compatible text generation and log-only
    /// notification delivery.
    pub fn new(data_dir: &Path, settings: ServiceSettings) -> AppResult<Arc<Self>> {
        let generator: Arc<dyn TextGenerator> =
            Arc::new(OpenAiGenerator::from_settings(&settings.text_generation)?);
        Self::with_collaborators(data_dir, settings, generator, Arc::new(LogSink))
    }

    pub fn with_collaborators(
        data_dir: &Path,
        settings: ServiceSettings,
        generator: Arc<dyn TextGenerator>,
        sink: Arc<dyn NotificationSink>,
    ) -> AppResult<Arc<Self>> {
        let db = Arc::new(Database::new(&data_dir.join("taskhub.sqlite"))?);
        let triggers = Arc::new(TriggerQueue::new(settings.trigger_queue_capacity));
        let backend: Arc<dyn TriggerBackend> = triggers.clone();
        let scheduler = Arc::new(ReminderScheduler::new(db.clone(), backend));
        let store = Arc::new(TaskStore::new(
            db.clone(),
            scheduler.clone(),
            settings.orphan_policy,
        ));
        let limiter = Arc::new(RateLimiter::new(
            db.clone(),
            settings.rate_limit_window_secs,
            settings.rate_limit_max_requests,
        ));
        let insights = InsightEngine::new(
            db.clone(),
            store.clone(),
            generator,
            limiter,
            settings.insight_window_days,
            settings.insight_retention_days,
        );
        let expander = RecurrenceExpander::new(db.clone(), store.clone());

        let this = Arc::new(Self {
            db,
            triggers,
            scheduler,
            store,
            expander,
            insights,
            sink,
            settings,
        });

        let weak = Arc::downgrade(&this);
        this.triggers.set_executor(Arc::new(move |dispatch: ReminderDispatch| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(strong) = weak.upgrade() {
                    strong.dispatch_reminder(dispatch).await
                } else {
                    true
                }
            })
        }));

        Ok(this)
    }

    /// Spawns the trigger queue's dispatch loop onto the current runtime.
    pub fn start_triggers(&self) {
        self.triggers.start();
    }

    // ─── Tasks ──────────────────────────────────────────────────────────────

    pub async fn create_task(&self, owner: &str, payload: CreateTaskPayload) -> AppResult<Task> {
        self.store.create_task(owner, payload, Utc::now()).await
    }

    pub fn list_tasks(&self, owner: &str, range: Option<&DateRange>) -> AppResult<Vec<Task>> {
        self.store.list_tasks(owner, range)
    }

    pub async fn update_task(
        &self,
        owner: &str,
        task_id: &str,
        patch: UpdateTaskPayload,
    ) -> AppResult<Task> {
        self.store.update_task(owner, task_id, patch, Utc::now()).await
    }

    pub fn toggle_complete(&self, owner: &str, task_id: &str) -> AppResult<Task> {
        self.store.toggle_complete(owner, task_id, Utc::now())
    }

    pub fn delete_task(&self, owner: &str, task_id: &str) -> AppResult<()> {
        self.store.delete_task(owner, task_id)
    }

    // ─── Categories ─────────────────────────────────────────────────────────

    pub fn create_category(
        &self,
        owner: &str,
        payload: CreateCategoryPayload,
    ) -> AppResult<Category> {
        self.store.create_category(owner, payload, Utc::now())
    }

    pub fn list_categories(&self, owner: &str) -> AppResult<Vec<Category>> {
        self.store.list_categories(owner)
    }

    pub fn update_category(
        &self,
        owner: &str,
        category_id: &str,
        patch: UpdateCategoryPayload,
    ) -> AppResult<Category> {
        self.store.update_category(owner, category_id, patch, Utc::now())
    }

    pub fn delete_category(&self, owner: &str, category_id: &str) -> AppResult<()> {
        self.store.delete_category(owner, category_id, Utc::now())
    }

    pub fn get_profile(&self, owner: &str) -> AppResult<UserProfile> {
        self.store.get_profile(owner)
    }

    // ─── Insights ───────────────────────────────────────────────────────────

    pub async fn generate_insight(&self, owner: &str) -> AppResult<Insight> {
        self.insights.generate(owner, Utc::now()).await
    }

    pub fn list_insights(&self, owner: &str) -> AppResult<Vec<Insight>> {
        self.insights.list(owner, Utc::now())
    }

    // ─── Scheduled jobs ─────────────────────────────────────────────────────

    /// Daily recurrence run; `today` comes from the external trigger so a
    /// late-firing job still expands the intended date.
    pub async fn run_expansion(&self, today: NaiveDate) -> AppResult<ExpansionReport> {
        self.expander.run(today, Utc::now()).await
    }

    pub async fn reconcile_schedules(&self, owner: &str) -> AppResult<ReconcileReport> {
        self.scheduler.reconcile(owner, Utc::now()).await
    }

    /// Periodic cleanup: drops expired items and stale rate counters, then
    /// sweeps every partition that has a reminder stuck mid-transition.
    pub async fn run_maintenance(&self, now: DateTime<Utc>) -> AppResult<MaintenanceReport> {
        let purged_insights = self.db.purge_expired_items(now)?;
        let evicted_counters = self.db.evict_stale_counters(now)?;

        let mut schedule_sweeps = BTreeMap::new();
        for pk in self.db.list_pending_schedule_partitions()? {
            let username = pk.strip_prefix("USER#").unwrap_or(&pk).to_string();
            match self.scheduler.reconcile(&username, now).await {
                Ok(report) => {
                    schedule_sweeps.insert(username, report);
                }
                Err(error) => {
                    tracing::warn!(username = %username, error = %error, "schedule sweep failed");
                }
            }
        }

        tracing::info!(
            purged = purged_insights,
            evicted = evicted_counters,
            swept_partitions = schedule_sweeps.len(),
            "maintenance pass finished"
        );
        Ok(MaintenanceReport {
            purged_insights,
            evicted_counters,
            schedule_sweeps,
        })
    }

    /// Executor body for fired triggers. Returns true when dispatch failed.
    /// A task deleted since install is a quiet no-op, not a failure.
    async fn dispatch_reminder(&self, dispatch: ReminderDispatch) -> bool {
        let pk = keys::user_pk(&dispatch.username);
        match self.db.find_task_sk(&pk, &dispatch.task_id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::debug!(task_id = %dispatch.task_id, "reminder target deleted, skipping dispatch");
                return false;
            }
            Err(error) => {
                tracing::warn!(task_id = %dispatch.task_id, error = %error, "task lookup failed before dispatch");
                return true;
            }
        }

        let profile = match self.store.get_profile(&dispatch.username) {
            Ok(profile) => profile,
            Err(error) => {
                tracing::warn!(
                    username = %dispatch.username,
                    error = %error,
                    "cannot resolve reminder recipient"
                );
                return true;
            }
        };

        let message = format!(
            "Reminder: \"{}\" is due {} at {}",
            dispatch.title,
            dispatch.due_date,
            dispatch.due_time.format("%H:%M")
        );

        let mut failed = false;
        if dispatch.email && self.settings.reminder_email_enabled {
            if let Err(error) = self
                .sink
                .deliver(Channel::Email, &profile.email, &message)
                .await
            {
                tracing::warn!(username = %dispatch.username, error = %error, "email reminder failed");
                failed = true;
            }
        }
        if dispatch.sms && self.settings.reminder_sms_enabled {
            match profile.phone_number() {
                Some(phone) => {
                    if let Err(error) = self.sink.deliver(Channel::Sms, phone, &message).await {
                        tracing::warn!(username = %dispatch.username, error = %error, "sms reminder failed");
                        failed = true;
                    }
                }
                None => {
                    tracing::warn!(
                        username = %dispatch.username,
                        "sms reminder skipped, profile has no phone number"
                    );
                }
            }
        }
        failed
    }
}
