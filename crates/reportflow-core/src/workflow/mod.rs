//! Workflow execution engine.
//!
//! - `template` -- `${stepK.path}` references between steps
//! - `tool` -- the step tool port and registry
//! - `engine` -- locked, resumable sequential execution
//! - `handler` -- queue worker for run jobs

pub mod engine;
pub mod handler;
pub mod template;
pub mod tool;

pub use engine::WorkflowEngine;
pub use handler::WorkflowJobHandler;
pub use tool::{BoxStepTool, StepTool, ToolRegistry};
