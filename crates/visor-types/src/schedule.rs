use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Failed,
    Completed,
}

/// Where schedule results are delivered after a fire.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Slack,
    Github,
    Webhook,
    #[default]
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OutputTarget {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    /// Channel id, repo slug, or URL depending on `kind`.
    #[serde(default)]
    pub target: Option<String>,
}

/// A persisted schedule. Either `cron` (recurring) or `run_at` (one-shot)
/// is set, never both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    pub id: String,
    #[serde(default)]
    pub creator: Option<String>,
    /// IANA timezone name; cron expressions evaluate in this zone.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    /// Named step to execute; `None` runs all root steps of the config.
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub output: OutputTarget,
    pub status: ScheduleStatus,
    #[serde(default)]
    pub run_count: u64,
    /// Consecutive failures; resets on success, 3 pauses the schedule.
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Schedule {
    pub fn one_shot(run_at: DateTime<Utc>) -> Self {
        Self::blank(None, Some(run_at))
    }

    pub fn recurring(cron: impl Into<String>) -> Self {
        Self::blank(Some(cron.into()), None)
    }

    fn blank(cron: Option<String>, run_at: Option<DateTime<Utc>>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            creator: None,
            timezone: default_timezone(),
            cron,
            run_at,
            workflow: None,
            inputs: Value::Null,
            output: OutputTarget::default(),
            status: ScheduleStatus::Active,
            run_count: 0,
            failure_count: 0,
            last_run_at: None,
            next_run_at: run_at,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_one_shot(&self) -> bool {
        self.run_at.is_some() && self.cron.is_none()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleStatus::Active
            && self.next_run_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Result handed to output adapters after a fire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleOutcome {
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_is_due_once_run_at_passes() {
        let now = Utc::now();
        let schedule = Schedule::one_shot(now - chrono::Duration::seconds(1));
        assert!(schedule.is_one_shot());
        assert!(schedule.is_due(now));

        let future = Schedule::one_shot(now + chrono::Duration::minutes(5));
        assert!(!future.is_due(now));
    }

    #[test]
    fn paused_schedules_are_never_due() {
        let now = Utc::now();
        let mut schedule = Schedule::one_shot(now - chrono::Duration::seconds(1));
        schedule.status = ScheduleStatus::Paused;
        assert!(!schedule.is_due(now));
    }
}
