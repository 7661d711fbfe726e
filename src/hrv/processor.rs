//! Rolling-window HRV processor
//!
//! Consumes RR batches as they arrive from the device, drops physiologically
//! implausible intervals, keeps the most recent `window_span_ms` worth of beats
//! and emits a fresh [`HrvMetrics`] snapshot once enough beats are buffered.

use std::collections::VecDeque;

use tracing::debug;

use super::spectral::SpectralAnalyzer;
use super::time_domain;
use crate::config::HrvConfig;
use crate::types::{HrvMetrics, RrBatch};

/// Stateful RR interval to metrics transform
#[derive(Debug, Clone)]
pub struct HrvProcessor {
    config: HrvConfig,
    window: VecDeque<f64>,
    /// Sum of buffered intervals (ms)
    span_ms: f64,
    last_batch_at_ms: Option<i64>,
    analyzer: SpectralAnalyzer,
}

impl Default for HrvProcessor {
    fn default() -> Self {
        Self::new(HrvConfig::default())
    }
}

impl HrvProcessor {
    pub fn new(config: HrvConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
            span_ms: 0.0,
            last_batch_at_ms: None,
            analyzer: SpectralAnalyzer::new(),
        }
    }

    pub fn config(&self) -> &HrvConfig {
        &self.config
    }

    /// Buffered intervals, oldest first
    pub fn window(&self) -> impl Iterator<Item = f64> + '_ {
        self.window.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Append a batch and return a snapshot if the window is large enough.
    ///
    /// Implausible intervals are discarded. An empty or fully rejected batch
    /// leaves the processor untouched and returns `None`.
    pub fn add_rr_intervals(&mut self, intervals: &[i32], now_ms: i64) -> Option<HrvMetrics> {
        let accepted: Vec<f64> = intervals
            .iter()
            .copied()
            .filter(|&rr| {
                let plausible = rr >= self.config.min_rr_ms && rr <= self.config.max_rr_ms;
                if !plausible {
                    debug!(rr_ms = rr, "rejecting implausible RR interval");
                }
                plausible
            })
            .map(f64::from)
            .collect();

        if accepted.is_empty() {
            return None;
        }

        if self.has_gap_before(now_ms) {
            debug!(
                buffered = self.window.len(),
                "RR stream gap exceeded limit, flushing window"
            );
            self.reset();
        }
        self.last_batch_at_ms = Some(now_ms);

        for rr in accepted {
            self.window.push_back(rr);
            self.span_ms += rr;
        }
        self.evict_to_span();

        if self.window.len() < self.config.min_intervals {
            return None;
        }
        self.compute()
    }

    /// Convenience wrapper over [`add_rr_intervals`](Self::add_rr_intervals)
    pub fn add_batch(&mut self, batch: &RrBatch) -> Option<HrvMetrics> {
        self.add_rr_intervals(&batch.intervals, batch.received_at_ms)
    }

    /// Clear the rolling window; called on device disconnect
    pub fn reset(&mut self) {
        self.window.clear();
        self.span_ms = 0.0;
        self.last_batch_at_ms = None;
    }

    fn has_gap_before(&self, now_ms: i64) -> bool {
        match (self.config.max_batch_gap_ms, self.last_batch_at_ms) {
            (Some(max_gap), Some(last)) => now_ms - last > max_gap,
            _ => false,
        }
    }

    fn evict_to_span(&mut self) {
        let span_limit = self.config.window_span_ms as f64;
        while self.span_ms > span_limit && self.window.len() > 1 {
            if let Some(oldest) = self.window.pop_front() {
                self.span_ms -= oldest;
            }
        }
    }

    fn compute(&mut self) -> Option<HrvMetrics> {
        let rr: Vec<f64> = self.window.iter().copied().collect();
        let rmssd = time_domain::rmssd(&rr)?;
        let mean_hr = time_domain::mean_hr(&rr)?;
        let spectral = self.analyzer.analyze(&rr, &self.config)?;

        let metrics = HrvMetrics {
            coherence_score: spectral.coherence,
            rmssd,
            mean_hr,
        };
        debug!(
            coherence = metrics.coherence_score,
            rmssd = metrics.rmssd,
            mean_hr = metrics.mean_hr,
            beats = rr.len(),
            "HRV snapshot"
        );
        Some(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn breathing_rr(count: usize) -> Vec<i32> {
        let mut t = 0.0;
        (0..count)
            .map(|_| {
                let rr = 900.0 + 60.0 * (2.0 * PI * 0.1 * t).sin();
                t += rr / 1000.0;
                rr.round() as i32
            })
            .collect()
    }

    #[test]
    fn test_insufficient_data_returns_none() {
        let mut processor = HrvProcessor::default();
        let rr = vec![850; 31];
        assert!(processor.add_rr_intervals(&rr, 1_000).is_none());
        assert_eq!(processor.len(), 31);
        assert!(processor.window().all(|v| v == 850.0));
    }

    #[test]
    fn test_snapshot_once_minimum_reached() {
        let mut processor = HrvProcessor::default();
        let rr = breathing_rr(40);
        assert!(processor.add_rr_intervals(&rr[..20], 1_000).is_none());
        let metrics = processor.add_rr_intervals(&rr[20..], 2_000).unwrap();
        assert!(metrics.mean_hr > 60.0 && metrics.mean_hr < 72.0);
        assert!(metrics.rmssd > 0.0);
        assert!(metrics.coherence_score > 0.5);
    }

    #[test]
    fn test_rejects_implausible_intervals() {
        let mut processor = HrvProcessor::default();
        assert!(processor
            .add_rr_intervals(&[850, 120, -5, 0, 2500, 900], 1_000)
            .is_none());
        assert_eq!(processor.window().collect::<Vec<_>>(), vec![850.0, 900.0]);
    }

    #[test]
    fn test_empty_and_all_rejected_batches_leave_state() {
        let mut processor = HrvProcessor::default();
        processor.add_rr_intervals(&[850, 860], 1_000);
        assert!(processor.add_rr_intervals(&[], 2_000).is_none());
        assert!(processor.add_rr_intervals(&[10, 5000], 3_000).is_none());
        assert_eq!(processor.len(), 2);
    }

    #[test]
    fn test_window_is_time_bounded() {
        let mut processor = HrvProcessor::default();
        for i in 0..10 {
            processor.add_rr_intervals(&[1000; 20], 1_000 + i * 1_000);
        }
        // 64s span at 1000ms per beat
        assert_eq!(processor.len(), 64);
        let span: f64 = processor.window().sum();
        assert!(span <= 64_000.0);
    }

    #[test]
    fn test_gap_flushes_window() {
        let mut processor = HrvProcessor::default();
        processor.add_rr_intervals(&[850; 10], 1_000);
        processor.add_rr_intervals(&[900; 3], 30_000);
        assert_eq!(processor.len(), 3);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut processor = HrvProcessor::default();
        processor.add_rr_intervals(&[850; 40], 1_000);
        processor.reset();
        processor.reset();
        assert!(processor.is_empty());
        assert!(processor.add_rr_intervals(&[850; 5], 2_000).is_none());
    }

    #[test]
    fn test_add_batch() {
        let mut processor = HrvProcessor::default();
        let batch = RrBatch::new(breathing_rr(48), 5_000);
        assert!(processor.add_batch(&batch).is_some());
    }
}
