//! Schedule domain types: cron-to-workflow bindings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a schedule.
///
/// `active` <-> `paused` by explicit stop/resume. `failed` only when the
/// expression cannot be turned into a running timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Failed,
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleStatus::Active => write!(f, "active"),
            ScheduleStatus::Paused => write!(f, "paused"),
            ScheduleStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(ScheduleStatus::Active),
            "paused" => Ok(ScheduleStatus::Paused),
            "failed" => Ok(ScheduleStatus::Failed),
            other => Err(format!("invalid schedule status: '{other}'")),
        }
    }
}

/// A persisted cron-to-workflow binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    /// Normalized 6-field cron expression (seconds first).
    pub cron: String,
    pub workflow_id: Uuid,
    pub status: ScheduleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for registering a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    /// Cron expression (5 or 6 fields) or a human-readable form like "every 5 minutes".
    pub cron: String,
    pub workflow_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_status_round_trips_through_strings() {
        assert_eq!("ACTIVE".parse::<ScheduleStatus>().unwrap(), ScheduleStatus::Active);
        assert_eq!(ScheduleStatus::Paused.to_string(), "paused");
        assert!("deleted".parse::<ScheduleStatus>().is_err());
    }
}
