//! Built-in job handlers.

mod demo;

pub use demo::{DemoJob, DEMO_JOB};

use crate::error::Result;
use crate::worker::Registry;

/// Register every built-in handler.
pub fn register_builtins(registry: &Registry) -> Result<()> {
    registry.register(DEMO_JOB, DemoJob::default)?;
    Ok(())
}
