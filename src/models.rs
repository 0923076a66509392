use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Weekday names as they appear in `recurring.days` and in insight
/// statistics. Variant order is Monday-first, which also fixes tie-breaking
/// for most/least productive day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeekdayName {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl WeekdayName {
    pub const ALL: [WeekdayName; 7] = [
        Self::Monday,
        Self::Tuesday,
        Self::Wednesday,
        Self::Thursday,
        Self::Friday,
        Self::Saturday,
        Self::Sunday,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monday => "monday",
            Self::Tuesday => "tuesday",
            Self::Wednesday => "wednesday",
            Self::Thursday => "thursday",
            Self::Friday => "friday",
            Self::Saturday => "saturday",
            Self::Sunday => "sunday",
        }
    }

    pub fn from_date(date: NaiveDate) -> Self {
        match date.weekday() {
            chrono::Weekday::Mon => Self::Monday,
            chrono::Weekday::Tue => Self::Tuesday,
            chrono::Weekday::Wed => Self::Wednesday,
            chrono::Weekday::Thu => Self::Thursday,
            chrono::Weekday::Fri => Self::Friday,
            chrono::Weekday::Sat => Self::Saturday,
            chrono::Weekday::Sun => Self::Sunday,
        }
    }
}

/// Position of a task's reminder in the persisted scheduling state machine.
/// Transitions are written to storage before the corresponding trigger
/// backend call, so an interrupted transition is detectable afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleState {
    #[default]
    None,
    PendingRetire,
    PendingInstall,
    Installed,
}

impl ScheduleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::PendingRetire => "pending-retire",
            Self::PendingInstall => "pending-install",
            Self::Installed => "installed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderSettings {
    pub enabled: bool,
    #[serde(default)]
    pub email: bool,
    #[serde(default)]
    pub sms: bool,
    pub minutes_before: u32,
    #[serde(default)]
    pub scheduling_handle: Option<String>,
    #[serde(default)]
    pub schedule_state: ScheduleState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recurrence {
    pub enabled: bool,
    #[serde(default)]
    pub days: BTreeSet<WeekdayName>,
    #[serde(default)]
    pub base_task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub username: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    pub priority: Priority,
    pub due_date: NaiveDate,
    #[serde(default, with = "hhmm_opt")]
    pub due_time: Option<NaiveTime>,
    pub completed: bool,
    #[serde(default)]
    pub recurring: Option<Recurrence>,
    #[serde(default)]
    pub reminders: Option<ReminderSettings>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Templates are user-created recurring tasks; instances spawned from a
    /// template carry `baseTaskId` and are never expanded again.
    pub fn is_recurring_template(&self) -> bool {
        self.recurring
            .as_ref()
            .map(|recurring| recurring.enabled && recurring.base_task_id.is_none())
            .unwrap_or(false)
    }

    pub fn live_scheduling_handle(&self) -> Option<&str> {
        self.reminders
            .as_ref()
            .and_then(|reminders| reminders.scheduling_handle.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub category_id: String,
    pub username: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Profile items share the table but are written by the out-of-scope
/// authentication service; the core only reads them to resolve reminder
/// recipients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    #[serde(default)]
    pub preferences: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
}

impl UserProfile {
    pub fn phone_number(&self) -> Option<&str> {
        self.preferences
            .get("phoneNumber")
            .and_then(serde_json::Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekdayStats {
    pub total: u32,
    pub completed: u32,
    pub completion_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductivityStats {
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub missed_tasks: u32,
    pub completion_rate: f64,
    pub average_tasks_per_day: f64,
    pub by_category: BTreeMap<String, u32>,
    pub by_weekday: BTreeMap<WeekdayName, WeekdayStats>,
    pub most_productive_day: Option<WeekdayName>,
    pub least_productive_day: Option<WeekdayName>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Insight {
    pub summary: String,
    pub patterns: ProductivityStats,
    pub recommendations: Vec<String>,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderPayload {
    pub enabled: bool,
    #[serde(default)]
    pub email: bool,
    #[serde(default)]
    pub sms: bool,
    #[serde(default = "default_minutes_before")]
    pub minutes_before: u32,
}

fn default_minutes_before() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurrencePayload {
    pub enabled: bool,
    #[serde(default)]
    pub days: BTreeSet<WeekdayName>,
    #[serde(default)]
    pub base_task_id: Option<String>,
}

/// Dates arrive as strings and are parsed by the store so malformed values
/// fail validation with a useful message instead of a serde error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskPayload {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    pub priority: Priority,
    pub due_date: String,
    #[serde(default)]
    pub due_time: Option<String>,
    #[serde(default)]
    pub recurring: Option<RecurrencePayload>,
    #[serde(default)]
    pub reminders: Option<ReminderPayload>,
}

/// Partial patch; unknown JSON fields are dropped by serde, so a patch made
/// entirely of disallowed fields deserializes as empty and is rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskPayload {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub due_time: Option<String>,
    #[serde(default)]
    pub completed: Option<bool>,
    #[serde(default)]
    pub recurring: Option<RecurrencePayload>,
    #[serde(default)]
    pub reminders: Option<ReminderPayload>,
}

impl UpdateTaskPayload {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.category_id.is_none()
            && self.priority.is_none()
            && self.due_date.is_none()
            && self.due_time.is_none()
            && self.completed.is_none()
            && self.recurring.is_none()
            && self.reminders.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCategoryPayload {
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCategoryPayload {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

impl UpdateCategoryPayload {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.color.is_none()
    }
}

/// Payload bound to a scheduled reminder trigger; everything dispatch needs
/// without a storage read, except the recipient addresses which are resolved
/// from the profile at fire time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderDispatch {
    pub username: String,
    pub task_id: String,
    pub title: String,
    pub due_date: NaiveDate,
    #[serde(with = "hhmm")]
    pub due_time: NaiveTime,
    pub email: bool,
    pub sms: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnedInstance {
    pub username: String,
    pub template_id: String,
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpansionFailure {
    pub username: String,
    pub template_id: String,
    pub error: String,
}

/// Outcome summary of one Recurrence Expander run. Failures are per template
/// and never abort the run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpansionReport {
    pub run_date: NaiveDate,
    pub weekday: WeekdayName,
    pub templates_seen: u32,
    pub spawned: Vec<SpawnedInstance>,
    pub skipped_existing: u32,
    pub failures: Vec<ExpansionFailure>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileFailure {
    pub task_id: String,
    pub error: String,
}

/// Outcome summary of a reminder reconciliation sweep.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub examined: u32,
    pub repaired: Vec<String>,
    pub failures: Vec<ReconcileFailure>,
}

/// Outcome summary of one maintenance pass: expired-item purge, counter
/// eviction, and the per-user schedule sweeps it triggered.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub purged_insights: u64,
    pub evicted_counters: u64,
    pub schedule_sweeps: BTreeMap<String, ReconcileReport>,
}

/// `HH:MM` wire format for required times.
pub(crate) mod hhmm {
    use chrono::NaiveTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub fn parse(raw: &str) -> Result<NaiveTime, String> {
        NaiveTime::parse_from_str(raw, FORMAT)
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
            .map_err(|_| format!("invalid time '{raw}', expected HH:MM"))
    }
}

/// `HH:MM` wire format for optional times.
pub(crate) mod hhmm_opt {
    use chrono::NaiveTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        time: &Option<NaiveTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match time {
            Some(time) => super::hhmm::serialize(time, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NaiveTime>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            Some(raw) => super::hhmm::parse(&raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
