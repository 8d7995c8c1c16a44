//! Generic step tools.
//!
//! - `echo` -- returns its resolved config, for wiring and dry runs
//! - `http` -- makes an HTTP request and returns status, headers, and body
//!
//! Domain tools (report builders, mailers) register alongside these through
//! the same [`ToolRegistry`].

pub mod echo;
pub mod http;

use reportflow_core::workflow::ToolRegistry;

pub use echo::EchoTool;
pub use http::HttpTool;

/// A registry holding every generic tool.
pub fn default_tools() -> Result<ToolRegistry, reqwest::Error> {
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool).register(HttpTool::new()?);
    Ok(tools)
}
