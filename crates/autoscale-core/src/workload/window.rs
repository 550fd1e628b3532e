use std::collections::VecDeque;

/// Fixed-capacity window that evicts its oldest sample when full
#[derive(Debug, Clone)]
pub struct RollingWindow<T> {
    capacity: usize,
    samples: VecDeque<T>,
}

impl<T> RollingWindow<T> {
    /// A zero capacity is treated as one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a sample, returning the evicted one if the window was full
    pub fn push(&mut self, sample: T) -> Option<T> {
        let evicted = if self.samples.len() == self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Mean of `f` over the window, `None` when empty
    pub fn mean_by(&self, f: impl Fn(&T) -> f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().map(f).sum::<f64>() / self.samples.len() as f64)
    }
}
