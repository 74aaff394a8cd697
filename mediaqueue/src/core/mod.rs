//! MediaQueue Core Engine
//!
//! Filesystem-coordinated job queue for media enhancement.
//! Handles the queue store, worker lifecycle, orchestration and crash recovery.

pub mod fs;
pub mod jobs;
pub mod orchestrator;
pub mod process;
pub mod processor;
pub mod queue;
pub mod recovery;
pub mod settings;
pub mod worker;

// Re-export common types
mod types;
pub use types::*;

mod error;
pub use error::*;

#[cfg(test)]
mod tests_scenarios;
