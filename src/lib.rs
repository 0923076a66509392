pub mod db;
pub mod errors;
pub mod insights;
pub mod keys;
pub mod models;
pub mod notify;
pub mod ratelimit;
pub mod recurrence;
pub mod reminders;
pub mod service;
pub mod settings;
pub mod store;
pub mod textgen;
pub mod triggers;

pub use crate::errors::{AppError, AppResult};
pub use crate::models::{
    Category, CreateCategoryPayload, CreateTaskPayload, DateRange, ExpansionReport, Insight,
    MaintenanceReport, Priority, ProductivityStats, ReconcileReport, Recurrence,
    RecurrencePayload, ReminderDispatch, ReminderPayload, ReminderSettings, ScheduleState, Task,
    UpdateCategoryPayload, UpdateTaskPayload, UserProfile, WeekdayName, WeekdayStats,
};
pub use crate::notify::{Channel, LogSink, NotificationSink};
pub use crate::service::TaskHub;
pub use crate::settings::{OrphanPolicy, ServiceSettings, TextGenSettings};
pub use crate::textgen::{OpenAiGenerator, TextGenerator};
pub use crate::triggers::{TriggerBackend, TriggerQueue};

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs the global tracing subscriber: daily-rolling JSON logs under
/// `<data_dir>/logs`, filtered by `RUST_LOG` with an `info` default. Safe to
/// call once per process; the writer guard lives for the process lifetime.
pub fn init_tracing(data_dir: &Path) -> AppResult<()> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "taskhub.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
