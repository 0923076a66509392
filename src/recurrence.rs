use crate::db::Database;
use crate::errors::AppResult;
use crate::keys;
use crate::models::{
    CreateTaskPayload, ExpansionFailure, ExpansionReport, RecurrencePayload, ReminderPayload,
    SpawnedInstance, Task, WeekdayName,
};
use crate::store::TaskStore;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Daily job that turns recurring templates into concrete task instances.
/// Runs on an external trigger; re-running for the same date is safe because
/// a template whose instance for that date already exists is skipped.
pub struct RecurrenceExpander {
    db: Arc<Database>,
    store: Arc<TaskStore>,
}

impl RecurrenceExpander {
    pub fn new(db: Arc<Database>, store: Arc<TaskStore>) -> Self {
        Self { db, store }
    }

    /// Scans templates across all partitions and spawns an instance for each
    /// template scheduled on `today`'s weekday. Per-template failures land in
    /// the report instead of aborting the run.
    pub async fn run(&self, today: NaiveDate, now: DateTime<Utc>) -> AppResult<ExpansionReport> {
        let weekday = WeekdayName::from_date(today);
        let mut report = ExpansionReport {
            run_date: today,
            weekday,
            templates_seen: 0,
            spawned: Vec::new(),
            skipped_existing: 0,
            failures: Vec::new(),
        };

        for item in self.db.list_recurring_templates()? {
            let template: Task = match item.body_as() {
                Ok(task) => task,
                Err(err) => {
                    report.failures.push(ExpansionFailure {
                        username: owner_of(&item.pk),
                        template_id: trailing_segment(&item.sk),
                        error: err.to_string(),
                    });
                    continue;
                }
            };
            report.templates_seen += 1;

            let days = match template.recurring.as_ref() {
                Some(recurring) => &recurring.days,
                None => continue,
            };
            if !days.contains(&weekday) {
                continue;
            }
            if self.instance_exists(&item.pk, today, &template.task_id)? {
                report.skipped_existing += 1;
                continue;
            }

            match self.spawn_instance(&template, today, now).await {
                Ok(task_id) => {
                    tracing::info!(
                        username = %template.username,
                        template_id = %template.task_id,
                        instance_id = %task_id,
                        "spawned recurring task instance"
                    );
                    report.spawned.push(SpawnedInstance {
                        username: template.username.clone(),
                        template_id: template.task_id.clone(),
                        task_id,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        username = %template.username,
                        template_id = %template.task_id,
                        error = %err,
                        "recurring task expansion failed"
                    );
                    report.failures.push(ExpansionFailure {
                        username: template.username.clone(),
                        template_id: template.task_id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            date = %report.run_date,
            weekday = report.weekday.as_str(),
            templates = report.templates_seen,
            spawned = report.spawned.len(),
            skipped = report.skipped_existing,
            failures = report.failures.len(),
            "recurrence expansion finished"
        );
        Ok(report)
    }

    fn instance_exists(&self, pk: &str, today: NaiveDate, template_id: &str) -> AppResult<bool> {
        let (lower, upper) = keys::task_range_bounds(today, today);
        for item in self.db.list_range(pk, &lower, &upper)? {
            let task: Task = match item.body_as() {
                Ok(task) => task,
                Err(_) => continue,
            };
            let from_template = task
                .recurring
                .as_ref()
                .and_then(|recurring| recurring.base_task_id.as_deref())
                == Some(template_id);
            if from_template {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn spawn_instance(
        &self,
        template: &Task,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> AppResult<String> {
        let payload = CreateTaskPayload {
            title: template.title.clone(),
            description: template.description.clone(),
            category_id: template.category_id.clone(),
            priority: template.priority,
            due_date: today.to_string(),
            due_time: template
                .due_time
                .map(|time| time.format("%H:%M").to_string()),
            recurring: Some(RecurrencePayload {
                enabled: false,
                days: BTreeSet::new(),
                base_task_id: Some(template.task_id.clone()),
            }),
            reminders: template.reminders.as_ref().map(|reminders| ReminderPayload {
                enabled: reminders.enabled,
                email: reminders.email,
                sms: reminders.sms,
                minutes_before: reminders.minutes_before,
            }),
        };
        let task = self.store.create_task(&template.username, payload, now).await?;
        Ok(task.task_id)
    }
}

fn owner_of(pk: &str) -> String {
    pk.strip_prefix("USER#").unwrap_or(pk).to_string()
}

fn trailing_segment(sk: &str) -> String {
    sk.rsplit('#').next().unwrap_or(sk).to_string()
}
