//! Rolling throughput window used to spot slow transfers

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const WINDOW: usize = 30;
const MIN_SAMPLES: usize = 5;

/// Most recent completed-transfer throughputs (bytes/second) of a session
#[derive(Clone, Debug, Default)]
pub struct SpeedTracker {
    samples: Arc<Mutex<VecDeque<f64>>>,
}

impl SpeedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, bytes_per_second: f64) {
        if !bytes_per_second.is_finite() {
            return;
        }
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.push_back(bytes_per_second);
        if samples.len() > WINDOW {
            samples.pop_front();
        }
    }

    /// Median of the window, or 0 while fewer than five samples exist
    pub fn median(&self) -> f64 {
        let mut sorted: Vec<f64> = {
            let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
            if samples.len() < MIN_SAMPLES {
                return 0.0;
            }
            samples.iter().copied().collect()
        };
        sorted.sort_by(|a, b| a.total_cmp(b));
        sorted[sorted.len() / 2]
    }

    /// Throughput below which a running transfer counts as slow (0 = unknown)
    pub fn slow_threshold(&self, ratio: f64) -> f64 {
        self.median() * ratio
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
