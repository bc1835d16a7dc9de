//! Running summary statistics

use serde::{Deserialize, Serialize};

/// Min / max / running mean of a stream of samples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatCounter {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub count: u32,
}

impl Default for StatCounter {
    fn default() -> Self {
        Self {
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
            mean: 0.0,
            count: 0,
        }
    }
}

impl StatCounter {
    pub fn add(&mut self, value: f32) {
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.mean += (value - self.mean) / self.count as f32;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl FromIterator<f32> for StatCounter {
    fn from_iter<I: IntoIterator<Item = f32>>(iter: I) -> Self {
        let mut stats = Self::default();
        for value in iter {
            stats.add(value);
        }
        stats
    }
}
