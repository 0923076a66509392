use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveTime, Utc};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use taskhub::db::{Database, ItemKind, ItemRecord};
use taskhub::{
    keys, AppError, AppResult, CreateCategoryPayload, CreateTaskPayload, DateRange, LogSink,
    Priority, RecurrencePayload, ReminderPayload, ScheduleState, ServiceSettings, TaskHub,
    TextGenerator, UpdateTaskPayload, UserProfile, WeekdayName,
};
use tokio::sync::Mutex;

const MODEL_REPLY: &str =
    r#"{"summary": "Strong finish on deep work.", "recommendations": ["Front-load high-priority tasks"]}"#;

struct ScriptedGenerator {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedGenerator {
    fn new(responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.iter().map(|r| r.to_string()).collect()),
        })
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn complete(&self, _prompt: &str) -> AppResult<String> {
        self.responses
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| AppError::Unavailable("no scripted response left".to_string()))
    }
}

fn open_hub(data_dir: &Path, generator: Arc<dyn TextGenerator>) -> Arc<TaskHub> {
    let settings = ServiceSettings {
        rate_limit_max_requests: 2,
        ..ServiceSettings::default()
    };
    TaskHub::with_collaborators(data_dir, settings, generator, Arc::new(LogSink)).expect("build hub")
}

/// Profiles are provisioned by the authentication service, which shares the
/// item table; tests write them the same way.
fn seed_profile(data_dir: &Path, username: &str, email: &str, phone: Option<&str>) {
    let db = Database::new(&data_dir.join("taskhub.sqlite")).expect("open item store");
    let mut preferences = BTreeMap::new();
    if let Some(phone) = phone {
        preferences.insert(
            "phoneNumber".to_string(),
            serde_json::Value::String(phone.to_string()),
        );
    }
    let profile = UserProfile {
        username: username.to_string(),
        email: email.to_string(),
        password_hash: "argon2id$stub".to_string(),
        preferences,
        last_login: None,
    };
    let item = ItemRecord::new(
        keys::user_pk(username),
        keys::PROFILE_SK.to_string(),
        ItemKind::Profile,
        serde_json::to_value(&profile).expect("profile json"),
    );
    db.put_item(&item, None).expect("seed profile");
}

fn plain_task(title: &str, due: NaiveDate) -> CreateTaskPayload {
    CreateTaskPayload {
        title: title.to_string(),
        description: None,
        category_id: None,
        priority: Priority::Medium,
        due_date: due.to_string(),
        due_time: None,
        recurring: None,
        reminders: None,
    }
}

#[tokio::test]
async fn task_lifecycle_round_trips_through_the_facade() {
    let dir = tempfile::tempdir().expect("tempdir");
    let hub = open_hub(dir.path(), ScriptedGenerator::new(&[]));

    let category = hub
        .create_category(
            "ada",
            CreateCategoryPayload {
                name: "Deep Work".to_string(),
                color: Some("#226699".to_string()),
            },
        )
        .expect("create category");
    assert_eq!(category.category_id, "deep-work");

    let tomorrow = Utc::now().date_naive() + Duration::days(1);
    let created = hub
        .create_task(
            "ada",
            CreateTaskPayload {
                title: "Draft quarterly plan".to_string(),
                description: Some("Outline first".to_string()),
                category_id: Some(category.category_id.clone()),
                priority: Priority::High,
                due_date: tomorrow.to_string(),
                due_time: Some("09:00".to_string()),
                recurring: None,
                reminders: Some(ReminderPayload {
                    enabled: true,
                    email: true,
                    sms: false,
                    minutes_before: 45,
                }),
            },
        )
        .await
        .expect("create task");

    assert!(!created.task_id.is_empty());
    assert_eq!(created.username, "ada");
    assert_eq!(created.due_date, tomorrow);
    assert_eq!(created.due_time, NaiveTime::from_hms_opt(9, 0, 0));
    assert_eq!(created.created_at, created.updated_at);
    let reminders = created.reminders.as_ref().expect("reminders stored");
    assert_eq!(reminders.schedule_state, ScheduleState::Installed);
    assert!(reminders.scheduling_handle.is_some());

    // What create returned is exactly what a later read yields, including
    // server-assigned id and timestamps.
    let listed = hub.list_tasks("ada", None).expect("list");
    assert_eq!(listed, vec![created.clone()]);

    let ranged = hub
        .list_tasks(
            "ada",
            Some(&DateRange {
                start_date: tomorrow.to_string(),
                end_date: tomorrow.to_string(),
            }),
        )
        .expect("list in range");
    assert_eq!(ranged.len(), 1);

    let updated = hub
        .update_task(
            "ada",
            &created.task_id,
            UpdateTaskPayload {
                title: Some("Draft the plan".to_string()),
                priority: Some(Priority::Medium),
                ..UpdateTaskPayload::default()
            },
        )
        .await
        .expect("update");
    assert_eq!(updated.title, "Draft the plan");
    assert_eq!(updated.priority, Priority::Medium);
    assert_eq!(updated.description.as_deref(), Some("Outline first"));
    assert!(updated.updated_at > created.created_at);

    let toggled = hub.toggle_complete("ada", &created.task_id).expect("toggle");
    assert!(toggled.completed);

    hub.delete_task("ada", &created.task_id).expect("delete");
    assert!(hub
        .list_tasks("ada", None)
        .expect("list after delete")
        .is_empty());
}

#[tokio::test]
async fn weekly_template_expands_into_a_dated_instance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let hub = open_hub(dir.path(), ScriptedGenerator::new(&[]));

    let today = Utc::now().date_naive();
    let mut days = BTreeSet::new();
    days.insert(WeekdayName::from_date(today));

    let template = hub
        .create_task(
            "ada",
            CreateTaskPayload {
                title: "Weekly review".to_string(),
                description: None,
                category_id: None,
                priority: Priority::Medium,
                due_date: today.to_string(),
                due_time: Some("17:00".to_string()),
                recurring: Some(RecurrencePayload {
                    enabled: true,
                    days,
                    base_task_id: None,
                }),
                reminders: None,
            },
        )
        .await
        .expect("create template");

    let report = hub.run_expansion(today).await.expect("expansion");
    assert_eq!(report.templates_seen, 1);
    assert_eq!(report.spawned.len(), 1);
    assert_eq!(report.spawned[0].template_id, template.task_id);

    let tasks = hub.list_tasks("ada", None).expect("list");
    assert_eq!(tasks.len(), 2);
    let instance = tasks
        .iter()
        .find(|task| task.task_id != template.task_id)
        .expect("spawned instance listed");
    assert_eq!(instance.title, "Weekly review");
    assert_eq!(instance.due_date, today);
    let recurring = instance.recurring.as_ref().expect("instance lineage");
    assert!(!recurring.enabled);
    assert_eq!(
        recurring.base_task_id.as_deref(),
        Some(template.task_id.as_str())
    );

    let rerun = hub.run_expansion(today).await.expect("rerun");
    assert_eq!(rerun.skipped_existing, 1);
    assert!(rerun.spawned.is_empty());
    assert_eq!(hub.list_tasks("ada", None).expect("list again").len(), 2);
}

#[tokio::test]
async fn insight_generation_reads_history_and_persists_with_expiry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let hub = open_hub(dir.path(), ScriptedGenerator::new(&[MODEL_REPLY, MODEL_REPLY]));

    let today = Utc::now().date_naive();
    for (offset, done) in [(0i64, true), (1, false), (2, true)] {
        let due = today - Duration::days(offset);
        let task = hub
            .create_task("ada", plain_task("Focus block", due))
            .await
            .expect("seed task");
        if done {
            hub.toggle_complete("ada", &task.task_id).expect("complete");
        }
    }

    let insight = hub.generate_insight("ada").await.expect("generate");
    assert_eq!(insight.summary, "Strong finish on deep work.");
    assert_eq!(
        insight.recommendations,
        vec!["Front-load high-priority tasks".to_string()]
    );
    assert_eq!(insight.patterns.total_tasks, 3);
    assert_eq!(insight.patterns.completed_tasks, 2);
    assert!(insight.expires_at > insight.generated_at);

    let listed = hub.list_insights("ada").expect("list insights");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].summary, insight.summary);

    hub.generate_insight("ada").await.expect("second within limit");
    let err = hub.generate_insight("ada").await.expect_err("limit reached");
    assert!(matches!(err, AppError::RateLimited(_)));
}

#[tokio::test]
async fn ownership_is_enforced_and_profiles_resolve_recipients() {
    let dir = tempfile::tempdir().expect("tempdir");
    let hub = open_hub(dir.path(), ScriptedGenerator::new(&[]));
    seed_profile(dir.path(), "ada", "ada@example.com", Some("+15550100"));

    let profile = hub.get_profile("ada").expect("profile");
    assert_eq!(profile.email, "ada@example.com");
    assert_eq!(profile.phone_number(), Some("+15550100"));

    let today = Utc::now().date_naive();
    let task = hub
        .create_task("ada", plain_task("Private task", today))
        .await
        .expect("create");

    assert!(hub.list_tasks("bob", None).expect("bob list").is_empty());
    let err = hub
        .toggle_complete("bob", &task.task_id)
        .expect_err("foreign toggle");
    assert!(matches!(err, AppError::NotFound(_)));
    let err = hub
        .delete_task("bob", &task.task_id)
        .expect_err("foreign delete");
    assert!(matches!(err, AppError::NotFound(_)));

    let err = hub
        .create_task("", plain_task("No owner", today))
        .await
        .expect_err("blank owner");
    assert!(matches!(err, AppError::Authentication(_)));

    let err = hub
        .update_task("ada", &task.task_id, UpdateTaskPayload::default())
        .await
        .expect_err("empty patch");
    assert!(matches!(err, AppError::Validation(_)));

    let err = hub
        .create_task(
            "ada",
            CreateTaskPayload {
                due_date: "03/10/2026".to_string(),
                ..plain_task("Bad date", today)
            },
        )
        .await
        .expect_err("malformed due date");
    assert!(matches!(err, AppError::Validation(_)));
}
