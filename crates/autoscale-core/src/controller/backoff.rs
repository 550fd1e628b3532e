//! Post-scaling backoff state machine

use crate::models::{ScalingOperation, ServiceDescriptor};

/// Tracks how many ticks to skip after a scaling operation.
///
/// `last_operation` is `None` while active; entering backoff records the
/// operation just applied and restarts the counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffState {
    last_operation: Option<ScalingOperation>,
    count: u32,
}

impl BackoffState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start backing off after `operation` was applied
    pub fn enter(&mut self, operation: ScalingOperation) {
        self.last_operation = Some(operation);
        self.count = 0;
    }

    pub fn is_backing_off(&self) -> bool {
        self.last_operation.is_some()
    }

    /// Advance the counter for this tick and report whether analysis is skipped.
    ///
    /// The counter is incremented before it is compared, so a limit of `n`
    /// skips exactly `n` ticks. Once it exceeds the limit the state returns to
    /// active and the tick proceeds.
    pub fn should_skip(&mut self, descriptor: &ServiceDescriptor) -> bool {
        let operation = match self.last_operation {
            Some(operation) => operation,
            None => return false,
        };

        self.count += 1;
        if self.count > descriptor.backoff_limit(operation) {
            self.last_operation = None;
            self.count = 0;
            return false;
        }
        true
    }
}
