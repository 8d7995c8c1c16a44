//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (reportflow-infra) implements. The core crate never depends on any
//! specific storage technology. `memory` holds in-process implementations
//! used by tests and single-process setups.

pub mod breaker;
pub mod memory;
pub mod schedule;
pub mod workflow;
