//! MediaQueue Core Type Definitions
//!
//! Defines fundamental types and limits shared by the orchestrator and the worker.

// =============================================================================
// ID Types
// =============================================================================

/// Task unique identifier (`task_<ulid>`)
pub type TaskId = String;

/// Orchestrator instance identifier (ULID)
pub type OwnerId = String;

/// Generates a fresh task identifier.
pub fn new_task_id() -> TaskId {
    format!("task_{}", ulid::Ulid::new().to_string().to_lowercase())
}

/// Generates a fresh orchestrator identifier.
pub fn new_owner_id() -> OwnerId {
    ulid::Ulid::new().to_string()
}

// =============================================================================
// Limits
// =============================================================================

/// Lower bound for the number of concurrently running workers
pub const MIN_CONCURRENCY: usize = 1;

/// Upper bound for the number of concurrently running workers
pub const MAX_CONCURRENCY: usize = 4;

/// Clamps a requested worker count into the supported range.
pub fn clamp_concurrency(n: usize) -> usize {
    n.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
}

/// Clamps a progress value into `[0, 100]`, mapping NaN to zero.
pub fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        return 0.0;
    }
    progress.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_unique_and_prefixed() {
        let a = new_task_id();
        let b = new_task_id();
        assert!(a.starts_with("task_"));
        assert_ne!(a, b);
        assert_eq!(a, a.to_lowercase());
    }

    #[test]
    fn concurrency_is_clamped() {
        assert_eq!(clamp_concurrency(0), 1);
        assert_eq!(clamp_concurrency(3), 3);
        assert_eq!(clamp_concurrency(16), 4);
    }

    #[test]
    fn progress_is_clamped() {
        assert_eq!(clamp_progress(-5.0), 0.0);
        assert_eq!(clamp_progress(42.5), 42.5);
        assert_eq!(clamp_progress(130.0), 100.0);
        assert_eq!(clamp_progress(f64::NAN), 0.0);
    }
}
