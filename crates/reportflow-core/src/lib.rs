//! Workflow execution engine core for reportflow.
//!
//! Defines the "ports" (repository, queue backend, and tool traits) that the
//! infrastructure layer implements, plus the engine proper:
//! - `resilience` -- retry with backoff and a persisted circuit breaker
//! - `queue` -- job queue over a durable backend or the in-process fallback
//! - `workflow` -- step execution with inter-step template references
//! - `scheduler` -- cron timers dispatching runs through the queue
//!
//! Depends only on `reportflow-types`, never on `reportflow-infra` or any
//! database/IO crate.

pub mod clock;
pub mod event;
pub mod queue;
pub mod repository;
pub mod resilience;
pub mod scheduler;
pub mod workflow;

pub mod task;
