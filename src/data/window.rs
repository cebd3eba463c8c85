//! Fixed-capacity sliding window average.
//!
//! Holds the most recent `capacity` samples in arrival order. Pushing into a
//! full window evicts the oldest sample. The sum is maintained incrementally
//! and recomputed from the retained samples once per `capacity` evictions so
//! floating-point drift stays bounded over long runs.

use crate::error::{AppResult, MonitorError};
use std::collections::VecDeque;

/// Running average over the last `capacity` samples.
#[derive(Debug, Clone)]
pub struct SlidingWindowAverager {
    samples: VecDeque<f64>,
    capacity: usize,
    sum: f64,
    evictions: usize,
}

impl SlidingWindowAverager {
    /// Create an empty window.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Configuration`] if `capacity` is zero.
    pub fn new(capacity: usize) -> AppResult<Self> {
        if capacity == 0 {
            return Err(MonitorError::Configuration(
                "window size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
            evictions: 0,
        })
    }

    /// Append a sample, evicting the oldest one when full.
    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
                self.evictions += 1;
            }
        }
        self.samples.push_back(sample);
        self.sum += sample;

        if self.evictions >= self.capacity {
            self.sum = self.samples.iter().sum();
            self.evictions = 0;
        }
    }

    /// Arithmetic mean of the retained samples.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::EmptyWindow`] before the first push.
    pub fn average(&self) -> AppResult<f64> {
        if self.samples.is_empty() {
            return Err(MonitorError::EmptyWindow);
        }
        Ok(self.sum / self.samples.len() as f64)
    }

    /// Drop all samples, keeping the capacity.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
        self.evictions = 0;
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample has been retained.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of retained samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            SlidingWindowAverager::new(0),
            Err(MonitorError::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_window_has_no_average() {
        let window = SlidingWindowAverager::new(3).unwrap();
        assert_eq!(window.average(), Err(MonitorError::EmptyWindow));
        assert!(window.is_empty());
    }

    #[test]
    fn test_averages_while_filling_and_after_eviction() {
        let mut window = SlidingWindowAverager::new(3).unwrap();
        let mut averages = Vec::new();
        for sample in [1.0, 2.0, 3.0, 10.0] {
            window.push(sample);
            averages.push(window.average().unwrap());
        }
        assert_eq!(averages, vec![1.0, 1.5, 2.0, 5.0]);
        assert_eq!(window.len(), 3);
        assert_eq!(window.capacity(), 3);
    }

    #[test]
    fn test_capacity_one_tracks_latest() {
        let mut window = SlidingWindowAverager::new(1).unwrap();
        for sample in [-10.0, -12.5, -7.25] {
            window.push(sample);
            assert_eq!(window.average().unwrap(), sample);
        }
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_reset_clears_samples() {
        let mut window = SlidingWindowAverager::new(4).unwrap();
        window.push(1.0);
        window.push(2.0);
        window.reset();
        assert!(window.is_empty());
        assert_eq!(window.average(), Err(MonitorError::EmptyWindow));
        window.push(8.0);
        assert_eq!(window.average().unwrap(), 8.0);
        assert_eq!(window.capacity(), 4);
    }

    #[test]
    fn test_long_run_matches_direct_mean() {
        let mut window = SlidingWindowAverager::new(7).unwrap();
        let samples: Vec<f64> = (0..10_000).map(|i| -30.0 + (i % 97) as f64 * 0.013).collect();
        for sample in &samples {
            window.push(*sample);
        }
        let tail = &samples[samples.len() - 7..];
        let expected = tail.iter().sum::<f64>() / 7.0;
        assert!((window.average().unwrap() - expected).abs() < 1e-9);
    }
}
