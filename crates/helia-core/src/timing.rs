//! Frame timing aggregation.
//!
//! Stages report labeled GPU timestamp pairs; the readback for frame `N`
//! lands `FRAMES_IN_FLIGHT + 1` frames later, so samples trickle in with a
//! constant delay. This record aggregates them over a sliding window.

use hashbrown::HashMap;
use std::collections::VecDeque;

/// Default number of samples kept per label.
const DEFAULT_WINDOW: usize = 120;

/// Aggregated statistics for one labeled timing region, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingStats {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

/// Sliding-window timing statistics keyed by region label.
pub struct TimingRecord {
    window: usize,
    samples: HashMap<String, VecDeque<f64>>,
}

impl Default for TimingRecord {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl TimingRecord {
    /// Create a record keeping at most `window` samples per label.
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: HashMap::new(),
        }
    }

    /// Record one sample (milliseconds) for a label.
    pub fn push(&mut self, label: &str, millis: f64) {
        let queue = self
            .samples
            .entry_ref(label)
            .or_insert_with(|| VecDeque::with_capacity(self.window));
        if queue.len() == self.window {
            queue.pop_front();
        }
        queue.push_back(millis);
    }

    /// Statistics for one label, if any samples were recorded.
    pub fn stats(&self, label: &str) -> Option<TimingStats> {
        let queue = self.samples.get(label)?;
        if queue.is_empty() {
            return None;
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for &sample in queue {
            min = min.min(sample);
            max = max.max(sample);
            sum += sample;
        }
        Some(TimingStats {
            min,
            avg: sum / queue.len() as f64,
            max,
        })
    }

    /// Iterate over all labels with their current statistics.
    pub fn iter(&self) -> impl Iterator<Item = (&str, TimingStats)> {
        self.samples.keys().filter_map(move |label| {
            self.stats(label).map(|stats| (label.as_str(), stats))
        })
    }

    /// Drop all recorded samples.
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_over_samples() {
        let mut record = TimingRecord::new(16);
        record.push("path tracing", 2.0);
        record.push("path tracing", 4.0);
        record.push("path tracing", 6.0);

        let stats = record.stats("path tracing").unwrap();
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 6.0);
        assert_eq!(stats.avg, 4.0);
        assert!(record.stats("svgf").is_none());
    }

    #[test]
    fn window_evicts_oldest() {
        let mut record = TimingRecord::new(2);
        record.push("tonemap", 10.0);
        record.push("tonemap", 1.0);
        record.push("tonemap", 2.0);

        let stats = record.stats("tonemap").unwrap();
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 2.0);
    }

    #[test]
    fn iterates_all_labels() {
        let mut record = TimingRecord::default();
        record.push("a", 1.0);
        record.push("b", 2.0);
        let mut labels: Vec<_> = record.iter().map(|(label, _)| label.to_string()).collect();
        labels.sort();
        assert_eq!(labels, vec!["a", "b"]);
    }
}
