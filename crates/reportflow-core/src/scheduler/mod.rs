//! Cron scheduling of workflow runs.
//!
//! - `normalize` -- schedule strings to validated cron expressions
//! - `service` -- per-schedule timers dispatching through the job queue

pub mod normalize;
pub mod service;

pub use normalize::{check_missed_runs, normalize_schedule};
pub use service::Scheduler;
