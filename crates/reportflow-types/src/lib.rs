//! Shared domain types for reportflow.
//!
//! Jobs, workflow instances, schedules, breaker snapshots, engine events,
//! configuration and the error enums every other crate speaks in.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod breaker;
pub mod config;
pub mod error;
pub mod event;
pub mod job;
pub mod schedule;
pub mod workflow;
