use serde::{Deserialize, Serialize};

/// What happens to tasks still pointing at a category when that category is
/// deleted. `Retain` leaves the dangling id in place, `Detach` nulls it on
/// every referencing task, `Deny` refuses the deletion while references
/// exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    #[default]
    Retain,
    Detach,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceSettings {
    pub orphan_policy: OrphanPolicy,
    /// Trailing window of task history feeding insight statistics.
    pub insight_window_days: u32,
    pub insight_retention_days: u32,
    pub rate_limit_window_secs: u64,
    pub rate_limit_max_requests: u32,
    /// Service-wide channel switches, ANDed with per-task reminder prefs.
    pub reminder_email_enabled: bool,
    pub reminder_sms_enabled: bool,
    pub trigger_queue_capacity: usize,
    pub text_generation: TextGenSettings,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            orphan_policy: OrphanPolicy::Retain,
            insight_window_days: 28,
            insight_retention_days: 30,
            rate_limit_window_secs: 3600,
            rate_limit_max_requests: 10,
            reminder_email_enabled: true,
            reminder_sms_enabled: true,
            trigger_queue_capacity: 4096,
            text_generation: TextGenSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TextGenSettings {
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key; the key itself
    /// never lands in config files.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for TextGenSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "TASKHUB_MODEL_API_KEY".to_string(),
            timeout_secs: 30,
        }
    }
}
