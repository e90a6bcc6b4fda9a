//! Per-iteration exponential learning-rate decay with a floor.

/// Multiply the learning rate by `rate` after every iteration until it
/// reaches `min_lr`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrDecay {
    pub rate: f64,
    pub min_lr: f64,
}

impl LrDecay {
    pub fn new(rate: f64, min_lr: f64) -> Self {
        Self { rate, min_lr }
    }

    /// Learning rate for the next iteration.
    ///
    /// Decays only while `lr > min_lr`, so the rate stops at the first value
    /// at or below the floor rather than being clamped to it.
    pub fn next(&self, lr: f64) -> f64 {
        if lr > self.min_lr {
            lr * self.rate
        } else {
            lr
        }
    }

    /// Learning rate after `steps` iterations.
    pub fn lr_after(&self, lr: f64, steps: usize) -> f64 {
        let mut lr = lr;
        for _ in 0..steps {
            if lr <= self.min_lr {
                break;
            }
            lr = self.next(lr);
        }
        lr
    }
}
