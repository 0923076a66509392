use crate::db::{Database, ItemKind, ItemRecord};
use crate::errors::{AppError, AppResult};
use crate::keys;
use crate::models::{
    DateRange, Insight, ProductivityStats, Task, WeekdayName, WeekdayStats,
};
use crate::ratelimit::RateLimiter;
use crate::store::{require_owner, TaskStore};
use crate::textgen::TextGenerator;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

/// Shape the text-generation collaborator must produce. Anything else is
/// rejected, retried once with a sterner instruction, and then surfaced as a
/// ModelOutput error.
const RESPONSE_SCHEMA: &str = r#"{
    "type": "object",
    "properties": {
        "summary": { "type": "string", "minLength": 1 },
        "recommendations": {
            "type": "array",
            "items": { "type": "string", "minLength": 1 }
        }
    },
    "required": ["summary", "recommendations"],
    "additionalProperties": false
}"#;

#[derive(Debug, Deserialize)]
struct ModelResponse {
    summary: String,
    recommendations: Vec<String>,
}

/// Produces productivity insights: local statistics over recent task
/// history, narrated by the text-generation collaborator under a strict
/// output contract.
pub struct InsightEngine {
    db: Arc<Database>,
    store: Arc<TaskStore>,
    generator: Arc<dyn TextGenerator>,
    limiter: Arc<RateLimiter>,
    window_days: u32,
    retention_days: u32,
}

impl InsightEngine {
    pub fn new(
        db: Arc<Database>,
        store: Arc<TaskStore>,
        generator: Arc<dyn TextGenerator>,
        limiter: Arc<RateLimiter>,
        window_days: u32,
        retention_days: u32,
    ) -> Self {
        Self {
            db,
            store,
            generator,
            limiter,
            window_days: window_days.max(1),
            retention_days,
        }
    }

    /// Generates one insight from the trailing task window ending today.
    /// Zero tasks in the window is a Validation error and writes nothing.
    pub async fn generate(&self, owner: &str, now: DateTime<Utc>) -> AppResult<Insight> {
        let pk = require_owner(owner)?;
        self.limiter.check(owner, "insight", now)?;

        let today = now.date_naive();
        let start = today - Duration::days(i64::from(self.window_days) - 1);
        let range = DateRange {
            start_date: start.to_string(),
            end_date: today.to_string(),
        };
        let tasks = self.store.list_tasks(owner, Some(&range))?;
        if tasks.is_empty() {
            return Err(AppError::Validation(format!(
                "no tasks in the last {} days to analyze",
                self.window_days
            )));
        }

        let stats = compute_stats(&tasks, today, self.window_days);
        let (summary, recommendations) = self.request_narrative(&stats).await?;

        let insight = Insight {
            summary,
            patterns: stats,
            recommendations,
            generated_at: now,
            expires_at: now + Duration::days(i64::from(self.retention_days)),
        };
        let item = ItemRecord::expiring(
            pk,
            keys::insight_sk(now),
            ItemKind::Insight,
            serde_json::to_value(&insight)?,
            insight.expires_at,
        );
        self.db.put_item(&item, None)?;
        tracing::info!(
            username = owner,
            tasks = insight.patterns.total_tasks,
            completion_rate = insight.patterns.completion_rate,
            "insight generated"
        );
        Ok(insight)
    }

    /// Newest first. Expired insights are purged before reading, so a lapsed
    /// record never reappears even if the maintenance sweep hasn't run.
    pub fn list(&self, owner: &str, now: DateTime<Utc>) -> AppResult<Vec<Insight>> {
        let pk = require_owner(owner)?;
        let purged = self
            .db
            .purge_expired_prefix(&pk, keys::INSIGHT_PREFIX, now)?;
        if purged > 0 {
            tracing::debug!(username = owner, purged, "dropped expired insights");
        }
        let items = self.db.list_prefix_desc(&pk, keys::INSIGHT_PREFIX)?;
        items.iter().map(ItemRecord::body_as).collect()
    }

    async fn request_narrative(
        &self,
        stats: &ProductivityStats,
    ) -> AppResult<(String, Vec<String>)> {
        let first = self.generator.complete(&build_prompt(stats, false)?).await?;
        match parse_model_response(&first) {
            Ok(response) => return Ok(response),
            Err(reason) => {
                tracing::warn!(reason, "model response rejected, retrying with stricter prompt");
            }
        }
        let second = self.generator.complete(&build_prompt(stats, true)?).await?;
        parse_model_response(&second).map_err(AppError::ModelOutput)
    }
}

/// Pure statistics over the window's tasks. `missed` counts incomplete tasks
/// whose due date has already passed; tasks due today still count as open.
pub fn compute_stats(tasks: &[Task], today: NaiveDate, window_days: u32) -> ProductivityStats {
    let total_tasks = tasks.len() as u32;
    let completed_tasks = tasks.iter().filter(|task| task.completed).count() as u32;
    let missed_tasks = tasks
        .iter()
        .filter(|task| !task.completed && task.due_date < today)
        .count() as u32;

    let mut by_category: BTreeMap<String, u32> = BTreeMap::new();
    let mut weekday_totals: BTreeMap<WeekdayName, (u32, u32)> = BTreeMap::new();
    for task in tasks {
        let category = task
            .category_id
            .clone()
            .unwrap_or_else(|| "uncategorized".to_string());
        *by_category.entry(category).or_insert(0) += 1;

        let entry = weekday_totals
            .entry(WeekdayName::from_date(task.due_date))
            .or_insert((0, 0));
        entry.0 += 1;
        if task.completed {
            entry.1 += 1;
        }
    }

    let by_weekday: BTreeMap<WeekdayName, WeekdayStats> = weekday_totals
        .into_iter()
        .map(|(weekday, (total, completed))| {
            (
                weekday,
                WeekdayStats {
                    total,
                    completed,
                    completion_rate: ratio(completed, total),
                },
            )
        })
        .collect();

    // BTreeMap iteration is Monday-first, so keeping strict comparisons
    // resolves rate ties toward the earlier weekday.
    let mut most_productive_day = None;
    let mut least_productive_day = None;
    let mut best = f64::MIN;
    let mut worst = f64::MAX;
    for (weekday, stats) in &by_weekday {
        if stats.completion_rate > best {
            best = stats.completion_rate;
            most_productive_day = Some(*weekday);
        }
        if stats.completion_rate < worst {
            worst = stats.completion_rate;
            least_productive_day = Some(*weekday);
        }
    }

    ProductivityStats {
        total_tasks,
        completed_tasks,
        missed_tasks,
        completion_rate: ratio(completed_tasks, total_tasks),
        average_tasks_per_day: round2(f64::from(total_tasks) / f64::from(window_days.max(1))),
        by_category,
        by_weekday,
        most_productive_day,
        least_productive_day,
    }
}

fn ratio(part: u32, whole: u32) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    round2(f64::from(part) / f64::from(whole))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn build_prompt(stats: &ProductivityStats, strict: bool) -> AppResult<String> {
    let data = serde_json::to_string_pretty(stats)?;
    let mut prompt = format!(
        "Analyze this 4-week productivity summary for one person and coach them.\n\n\
         Statistics:\n{data}\n\n\
         Respond with a JSON object of exactly this shape:\n\
         {{\"summary\": \"two or three sentences about their patterns\", \
         \"recommendations\": [\"three short, concrete suggestions\"]}}"
    );
    if strict {
        prompt.push_str(
            "\n\nYour previous reply was not valid. Return ONLY the JSON object: \
             no prose, no markdown fences, no keys beyond summary and recommendations.",
        );
    }
    Ok(prompt)
}

fn response_schema() -> &'static jsonschema::JSONSchema {
    static SCHEMA: OnceLock<jsonschema::JSONSchema> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        let schema: Value =
            serde_json::from_str(RESPONSE_SCHEMA).expect("embedded response schema is valid JSON");
        jsonschema::JSONSchema::compile(&schema).expect("embedded response schema compiles")
    })
}

fn parse_model_response(raw: &str) -> Result<(String, Vec<String>), String> {
    let trimmed = raw.trim();
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|err| format!("response is not valid JSON: {err}"))?;

    if let Err(errors) = response_schema().validate(&value) {
        let details: Vec<String> = errors
            .map(|error| {
                let path = error.instance_path.to_string();
                if path.is_empty() {
                    error.to_string()
                } else {
                    format!("{path}: {error}")
                }
            })
            .collect();
        return Err(format!(
            "response does not match the expected shape: {}",
            details.join("; ")
        ));
    }

    let response: ModelResponse = serde_json::from_value(value)
        .map_err(|err| format!("response failed to deserialize: {err}"))?;
    Ok((response.summary, response.recommendations))
}
