#[macro_use]
extern crate tracing;

pub mod agents;
pub mod cmd;
pub mod config;
pub mod executor;
pub mod files;
pub mod fs;
pub mod queue;
pub mod results;
pub mod runtime;
pub mod template;
pub mod utilities;
pub mod workflows;
