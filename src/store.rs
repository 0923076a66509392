use crate::db::{Database, ItemKind, ItemRecord};
use crate::errors::{AppError, AppResult};
use crate::keys;
use crate::models::{
    hhmm, Category, CreateCategoryPayload, CreateTaskPayload, DateRange, Recurrence,
    ReminderSettings, ScheduleState, Task, UpdateCategoryPayload, UpdateTaskPayload, UserProfile,
};
use crate::reminders::ReminderScheduler;
use crate::settings::OrphanPolicy;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Task and category CRUD over the item store. Every operation is scoped to
/// the owning user's partition; reminder schedule upkeep is delegated to the
/// `ReminderScheduler` and degrades instead of failing the write.
pub struct TaskStore {
    db: Arc<Database>,
    scheduler: Arc<ReminderScheduler>,
    orphan_policy: OrphanPolicy,
}

impl TaskStore {
    pub fn new(
        db: Arc<Database>,
        scheduler: Arc<ReminderScheduler>,
        orphan_policy: OrphanPolicy,
    ) -> Self {
        Self {
            db,
            scheduler,
            orphan_policy,
        }
    }

    // ─── Tasks ──────────────────────────────────────────────────────────────

    pub async fn create_task(
        &self,
        owner: &str,
        payload: CreateTaskPayload,
        now: DateTime<Utc>,
    ) -> AppResult<Task> {
        let _pk = require_owner(owner)?;
        let title = valid_title(&payload.title)?;
        let due_date = parse_due_date(&payload.due_date, "dueDate")?;
        let due_time = payload
            .due_time
            .as_deref()
            .map(parse_due_time)
            .transpose()?;

        let mut task = Task {
            task_id: Uuid::new_v4().to_string(),
            username: owner.to_string(),
            title,
            description: payload.description,
            category_id: payload.category_id,
            priority: payload.priority,
            due_date,
            due_time,
            completed: false,
            recurring: payload.recurring.map(|recurring| Recurrence {
                enabled: recurring.enabled,
                days: recurring.days,
                base_task_id: recurring.base_task_id,
            }),
            reminders: payload.reminders.map(|reminders| ReminderSettings {
                enabled: reminders.enabled,
                email: reminders.email,
                sms: reminders.sms,
                minutes_before: reminders.minutes_before,
                scheduling_handle: None,
                schedule_state: ScheduleState::None,
            }),
            created_at: now,
            updated_at: now,
        };

        let item = task_item(&task)?;
        if !self.db.insert_item(&item, Some(&task.task_id))? {
            return Err(AppError::Conflict(format!(
                "task {} already exists",
                task.task_id
            )));
        }
        tracing::info!(username = owner, task_id = %task.task_id, "task created");

        if wants_schedule(&task) {
            if let Err(err) = self.scheduler.sync_schedule(&mut task, now).await {
                tracing::warn!(
                    task_id = %task.task_id,
                    error = %err,
                    "reminder scheduling failed; task saved without a schedule"
                );
            }
        }
        Ok(task)
    }

    /// Date-ordered listing; `range` bounds are inclusive on both ends and
    /// validated before any storage access.
    pub fn list_tasks(&self, owner: &str, range: Option<&DateRange>) -> AppResult<Vec<Task>> {
        let pk = require_owner(owner)?;
        let items = match range {
            None => self.db.list_prefix(&pk, keys::TASK_PREFIX)?,
            Some(range) => {
                let start = parse_due_date(&range.start_date, "startDate")?;
                let end = parse_due_date(&range.end_date, "endDate")?;
                if start > end {
                    return Err(AppError::Validation(format!(
                        "startDate {start} is after endDate {end}"
                    )));
                }
                let (lower, upper) = keys::task_range_bounds(start, end);
                self.db.list_range(&pk, &lower, &upper)?
            }
        };
        items.iter().map(ItemRecord::body_as).collect()
    }

    pub async fn update_task(
        &self,
        owner: &str,
        task_id: &str,
        patch: UpdateTaskPayload,
        now: DateTime<Utc>,
    ) -> AppResult<Task> {
        let pk = require_owner(owner)?;
        if patch.is_empty() {
            return Err(AppError::Validation(
                "patch contains no updatable fields".to_string(),
            ));
        }
        let (mut task, old_sk) = self.load_owned_task(&pk, owner, task_id)?;

        // Validate the whole patch before touching the task, so a bad field
        // leaves the stored item exactly as it was.
        let new_title = patch.title.as_deref().map(valid_title).transpose()?;
        let new_due_date = patch
            .due_date
            .as_deref()
            .map(|raw| parse_due_date(raw, "dueDate"))
            .transpose()?;
        let new_due_time = patch
            .due_time
            .as_deref()
            .map(parse_due_time)
            .transpose()?;

        let due_moved = new_due_date.map(|date| date != task.due_date).unwrap_or(false);
        let schedule_affected = patch.reminders.is_some()
            || due_moved
            || new_due_time
                .map(|time| Some(time) != task.due_time)
                .unwrap_or(false);

        if let Some(title) = new_title {
            task.title = title;
        }
        if let Some(description) = patch.description {
            task.description = Some(description);
        }
        if let Some(category_id) = patch.category_id {
            task.category_id = Some(category_id);
        }
        if let Some(priority) = patch.priority {
            task.priority = priority;
        }
        if let Some(date) = new_due_date {
            task.due_date = date;
        }
        if let Some(time) = new_due_time {
            task.due_time = Some(time);
        }
        if let Some(completed) = patch.completed {
            task.completed = completed;
        }
        if let Some(recurring) = patch.recurring {
            task.recurring = Some(Recurrence {
                enabled: recurring.enabled,
                days: recurring.days,
                base_task_id: recurring.base_task_id,
            });
        }
        if let Some(reminders) = patch.reminders {
            // Handle and state survive the patch; the schedule sync below
            // decides what happens to the live trigger.
            let (handle, state) = task
                .reminders
                .as_ref()
                .map(|current| (current.scheduling_handle.clone(), current.schedule_state))
                .unwrap_or((None, ScheduleState::None));
            task.reminders = Some(ReminderSettings {
                enabled: reminders.enabled,
                email: reminders.email,
                sms: reminders.sms,
                minutes_before: reminders.minutes_before,
                scheduling_handle: handle,
                schedule_state: state,
            });
        }
        task.updated_at = now;

        let item = task_item(&task)?;
        if item.sk != old_sk {
            // A dueDate change is a sort-key move: write the new key first,
            // then drop the old one. A crash in between leaves a duplicate,
            // never a lost task.
            self.db.put_item(&item, Some(task_id))?;
            self.db.delete_item(&pk, &old_sk, None)?;
        } else {
            self.db.put_item(&item, Some(task_id))?;
        }

        if schedule_affected {
            if let Err(err) = self.scheduler.sync_schedule(&mut task, now).await {
                tracing::warn!(
                    task_id = %task.task_id,
                    error = %err,
                    "reminder rescheduling failed; update kept"
                );
            }
        }
        Ok(task)
    }

    pub fn toggle_complete(
        &self,
        owner: &str,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Task> {
        let pk = require_owner(owner)?;
        let (mut task, _sk) = self.load_owned_task(&pk, owner, task_id)?;
        task.completed = !task.completed;
        task.updated_at = now;
        self.db.put_item(&task_item(&task)?, Some(task_id))?;
        Ok(task)
    }

    /// Removes the item and its index entry. A live reminder schedule is not
    /// retired here; the dispatch path re-checks task existence and the
    /// reconcile sweep clears leftovers.
    pub fn delete_task(&self, owner: &str, task_id: &str) -> AppResult<()> {
        let pk = require_owner(owner)?;
        let (_task, sk) = self.load_owned_task(&pk, owner, task_id)?;
        self.db.delete_item(&pk, &sk, Some(task_id))?;
        tracing::info!(username = owner, task_id, "task deleted");
        Ok(())
    }

    fn load_owned_task(&self, pk: &str, owner: &str, task_id: &str) -> AppResult<(Task, String)> {
        let sk = self
            .db
            .find_task_sk(pk, task_id)?
            .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;
        let item = self
            .db
            .get_item(pk, &sk)?
            .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;
        let task: Task = item.body_as()?;
        if task.username != owner {
            return Err(AppError::Authorization(
                "task belongs to another user".to_string(),
            ));
        }
        Ok((task, sk))
    }

    // ─── Categories ─────────────────────────────────────────────────────────

    pub fn create_category(
        &self,
        owner: &str,
        payload: CreateCategoryPayload,
        now: DateTime<Utc>,
    ) -> AppResult<Category> {
        let _pk = require_owner(owner)?;
        let name = payload.name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::Validation("name must not be empty".to_string()));
        }

        let category = Category {
            category_id: keys::category_id_from_name(&name),
            username: owner.to_string(),
            name,
            color: payload.color,
            created_at: now,
            updated_at: now,
        };
        let item = category_item(&category)?;
        if !self.db.insert_item(&item, None)? {
            return Err(AppError::Conflict(format!(
                "category '{}' already exists",
                category.category_id
            )));
        }
        Ok(category)
    }

    pub fn list_categories(&self, owner: &str) -> AppResult<Vec<Category>> {
        let pk = require_owner(owner)?;
        let items = self.db.list_prefix(&pk, keys::CATEGORY_PREFIX)?;
        items.iter().map(ItemRecord::body_as).collect()
    }

    /// Renaming does not re-derive the id; tasks keep referencing the same
    /// categoryId across renames.
    pub fn update_category(
        &self,
        owner: &str,
        category_id: &str,
        patch: UpdateCategoryPayload,
        now: DateTime<Utc>,
    ) -> AppResult<Category> {
        let pk = require_owner(owner)?;
        if patch.is_empty() {
            return Err(AppError::Validation(
                "patch contains no updatable fields".to_string(),
            ));
        }
        let item = self
            .db
            .get_item(&pk, &keys::category_sk(category_id))?
            .ok_or_else(|| AppError::NotFound(format!("category {category_id}")))?;
        let mut category: Category = item.body_as()?;
        if category.username != owner {
            return Err(AppError::Authorization(
                "category belongs to another user".to_string(),
            ));
        }

        if let Some(name) = patch.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(AppError::Validation("name must not be empty".to_string()));
            }
            category.name = name;
        }
        if let Some(color) = patch.color {
            category.color = Some(color);
        }
        category.updated_at = now;
        self.db.put_item(&category_item(&category)?, None)?;
        Ok(category)
    }

    pub fn delete_category(
        &self,
        owner: &str,
        category_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let pk = require_owner(owner)?;
        let sk = keys::category_sk(category_id);
        let item = self
            .db
            .get_item(&pk, &sk)?
            .ok_or_else(|| AppError::NotFound(format!("category {category_id}")))?;
        let category: Category = item.body_as()?;
        if category.username != owner {
            return Err(AppError::Authorization(
                "category belongs to another user".to_string(),
            ));
        }

        match self.orphan_policy {
            OrphanPolicy::Retain => {}
            OrphanPolicy::Deny => {
                let referencing = self.referencing_tasks(&pk, category_id)?;
                if !referencing.is_empty() {
                    return Err(AppError::Conflict(format!(
                        "category {category_id} is referenced by {} task(s)",
                        referencing.len()
                    )));
                }
            }
            OrphanPolicy::Detach => {
                for mut task in self.referencing_tasks(&pk, category_id)? {
                    task.category_id = None;
                    task.updated_at = now;
                    self.db.put_item(&task_item(&task)?, Some(&task.task_id))?;
                }
            }
        }

        self.db.delete_item(&pk, &sk, None)?;
        tracing::info!(username = owner, category_id, policy = ?self.orphan_policy, "category deleted");
        Ok(())
    }

    fn referencing_tasks(&self, pk: &str, category_id: &str) -> AppResult<Vec<Task>> {
        let items = self.db.list_prefix(pk, keys::TASK_PREFIX)?;
        let mut tasks = Vec::new();
        for item in items {
            let task: Task = item.body_as()?;
            if task.category_id.as_deref() == Some(category_id) {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    // ─── Profiles ───────────────────────────────────────────────────────────

    /// Read-only: profiles are written by the authentication service.
    pub fn get_profile(&self, owner: &str) -> AppResult<UserProfile> {
        let pk = require_owner(owner)?;
        let item = self
            .db
            .get_item(&pk, keys::PROFILE_SK)?
            .ok_or_else(|| AppError::NotFound(format!("profile for {owner}")))?;
        item.body_as()
    }
}

pub(crate) fn require_owner(owner: &str) -> AppResult<String> {
    if owner.trim().is_empty() {
        return Err(AppError::Authentication(
            "operation requires an authenticated user".to_string(),
        ));
    }
    Ok(keys::user_pk(owner))
}

fn valid_title(raw: &str) -> AppResult<String> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(AppError::Validation("title must not be empty".to_string()));
    }
    Ok(title.to_string())
}

fn parse_due_date(raw: &str, field: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| AppError::Validation(format!("invalid {field} '{raw}', expected YYYY-MM-DD")))
}

fn parse_due_time(raw: &str) -> AppResult<NaiveTime> {
    hhmm::parse(raw).map_err(AppError::Validation)
}

fn wants_schedule(task: &Task) -> bool {
    task.reminders
        .as_ref()
        .map(|reminders| reminders.enabled)
        .unwrap_or(false)
}

pub(crate) fn task_item(task: &Task) -> AppResult<ItemRecord> {
    Ok(ItemRecord::new(
        keys::user_pk(&task.username),
        keys::task_sk(task.due_date, &task.task_id),
        ItemKind::Task,
        serde_json::to_value(task)?,
    ))
}

fn category_item(category: &Category) -> AppResult<ItemRecord> {
    Ok(ItemRecord::new(
        keys::user_pk(&category.username),
        keys::category_sk(&category.category_id),
        ItemKind::Category,
        serde_json::to_value(category)?,
    ))
}
