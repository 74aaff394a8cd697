//! Queue Persistence Module
//!
//! Everything that lives in the queue directory:
//! - `queue.json` / `queue.lock`: the task store and its advisory lock
//! - `progress_<id>.json`: per-task progress sidecars
//! - `cancel_<id>.signal`: per-task cancellation markers

mod events;
mod sidecar;
mod store;

pub use events::*;
pub use sidecar::*;
pub use store::*;
