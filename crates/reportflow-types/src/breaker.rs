//! Persisted circuit breaker state.
//!
//! The runtime breaker lives in reportflow-core; this is the serializable
//! subset that survives a restart so a redeploy does not forget an open
//! breaker.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerPhase::Closed => write!(f, "closed"),
            BreakerPhase::Open => write!(f, "open"),
            BreakerPhase::HalfOpen => write!(f, "half_open"),
        }
    }
}

impl FromStr for BreakerPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(BreakerPhase::Closed),
            "open" => Ok(BreakerPhase::Open),
            "half_open" => Ok(BreakerPhase::HalfOpen),
            other => Err(format!("invalid breaker phase: '{other}'")),
        }
    }
}

/// Snapshot of one named breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub phase: BreakerPhase,
    pub consecutive_failures: u32,
    /// Set while open; the cool-down is measured from here.
    pub opened_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl BreakerSnapshot {
    pub fn closed(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            phase: BreakerPhase::Closed,
            consecutive_failures: 0,
            opened_at: None,
            last_failure_at: None,
            last_error: None,
            updated_at: now,
        }
    }
}
