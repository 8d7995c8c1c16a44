//! Infrastructure layer for reportflow.
//!
//! Contains implementations of the ports defined in `reportflow-core`:
//! SQLite storage (durable queue backend, workflow/schedule repositories,
//! breaker state), the `config.toml` loader, workflow definition files and
//! the generic step tools.

pub mod config;
pub mod definition;
pub mod sqlite;
pub mod tools;
