//! Transient progress snapshot delivered to progress reporters.

use serde::Serialize;

/// Coarse-grained progress of one run.
///
/// Counts never decrease within a run and are reset only when a new run
/// starts. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressState {
    pub processed_count: u64,
    pub total_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub skipped_count: u64,
    /// Human-readable label of the record or phase being worked on.
    pub current_label: String,
}

impl ProgressState {
    pub fn new(total_count: u64) -> Self {
        Self {
            total_count,
            ..Default::default()
        }
    }

    /// Whole-number percentage, 100 when there is nothing to do.
    pub fn percent(&self) -> u64 {
        if self.total_count == 0 {
            100
        } else {
            (self.processed_count * 100) / self.total_count
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_empty_run() {
        assert_eq!(ProgressState::new(0).percent(), 100);
        let mut p = ProgressState::new(8);
        p.processed_count = 2;
        assert_eq!(p.percent(), 25);
    }
}
