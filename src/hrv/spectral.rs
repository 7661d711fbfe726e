//! Frequency-domain HRV analysis
//!
//! The RR series is irregularly sampled (one value per beat), so it is first
//! resampled onto a uniform tachogram by linear interpolation. The tachogram is
//! detrended, Hann-windowed, zero-padded to a power of two and transformed with
//! an FFT. Coherence is the share of power in the coherence band relative to
//! the reference band, excluding the DC bin.

use std::f64::consts::PI;
use std::fmt;

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

use crate::config::{FrequencyBand, HrvConfig};

/// Tachograms shorter than this are not analyzed
const MIN_TACHOGRAM_SAMPLES: usize = 8;

/// Below this the reference band is treated as empty (perfectly regular rhythm)
const POWER_EPSILON: f64 = 1e-12;

/// Result of a spectral pass over the RR window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectralSummary {
    /// `band_power / total_power`, 0 when the reference band holds no power
    pub coherence: f64,
    /// Power inside the coherence band (ms², unnormalized)
    pub band_power: f64,
    /// Power inside the reference band, DC excluded (ms², unnormalized)
    pub total_power: f64,
    /// Frequency of the strongest bin inside the coherence band
    pub peak_frequency_hz: Option<f64>,
    /// Bin spacing of the spectrum
    pub resolution_hz: f64,
}

/// Power spectrum with its bin spacing
#[derive(Debug, Clone, PartialEq)]
pub struct PowerSpectrum {
    /// One-sided power for bins `0..=n/2`
    pub power: Vec<f64>,
    pub resolution_hz: f64,
}

impl PowerSpectrum {
    /// Sum of power for non-DC bins whose center lies in `band`
    pub fn band_power(&self, band: FrequencyBand) -> f64 {
        self.power
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(k, _)| band.contains(*k as f64 * self.resolution_hz))
            .map(|(_, p)| p)
            .sum()
    }

    /// Frequency of the strongest non-DC bin in `band`
    pub fn peak_frequency(&self, band: FrequencyBand) -> Option<f64> {
        self.power
            .iter()
            .enumerate()
            .skip(1)
            .map(|(k, p)| (k as f64 * self.resolution_hz, *p))
            .filter(|(f, _)| band.contains(*f))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(f, _)| f)
    }
}

/// Resample RR intervals onto a uniform grid at `rate_hz`.
///
/// Each interval is placed at the time its closing beat occurred. Returns an
/// empty vector for fewer than two intervals.
pub fn resample_tachogram(rr_ms: &[f64], rate_hz: f64) -> Vec<f64> {
    if rr_ms.len() < 2 || !rate_hz.is_finite() || rate_hz <= 0.0 {
        return Vec::new();
    }

    let mut beat_times = Vec::with_capacity(rr_ms.len());
    let mut elapsed = 0.0;
    for rr in rr_ms {
        elapsed += rr / 1000.0;
        beat_times.push(elapsed);
    }

    let start = beat_times[0];
    let end = beat_times[beat_times.len() - 1];
    let count = ((end - start) * rate_hz).floor() as usize + 1;
    let step = 1.0 / rate_hz;

    let mut samples = Vec::with_capacity(count);
    let mut segment = 0;
    for i in 0..count {
        let t = start + i as f64 * step;
        while segment + 2 < beat_times.len() && beat_times[segment + 1] < t {
            segment += 1;
        }
        let (t0, t1) = (beat_times[segment], beat_times[segment + 1]);
        let (v0, v1) = (rr_ms[segment], rr_ms[segment + 1]);
        let frac = if t1 > t0 {
            ((t - t0) / (t1 - t0)).clamp(0.0, 1.0)
        } else {
            0.0
        };
        samples.push(v0 + frac * (v1 - v0));
    }
    samples
}

/// Remove the least-squares linear trend in place
fn detrend(samples: &mut [f64]) {
    let n = samples.len() as f64;
    if n < 2.0 {
        return;
    }
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = samples.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var = 0.0;
    for (i, y) in samples.iter().enumerate() {
        let dx = i as f64 - mean_x;
        cov += dx * (y - mean_y);
        var += dx * dx;
    }
    let slope = if var > 0.0 { cov / var } else { 0.0 };
    for (i, y) in samples.iter_mut().enumerate() {
        *y -= mean_y + slope * (i as f64 - mean_x);
    }
}

/// FFT analyzer that keeps its planner, so plans for recurring window
/// lengths are reused across snapshots
pub struct SpectralAnalyzer {
    planner: FftPlanner<f64>,
}

impl Default for SpectralAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SpectralAnalyzer {
    /// Plans are a cache; a clone starts with an empty one
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl fmt::Debug for SpectralAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralAnalyzer").finish_non_exhaustive()
    }
}

impl SpectralAnalyzer {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
        }
    }

    /// One-sided power spectrum of a uniformly sampled series
    pub fn power_spectrum(&mut self, samples: &[f64], rate_hz: f64) -> PowerSpectrum {
        let mut centered = samples.to_vec();
        detrend(&mut centered);

        let len = centered.len();
        let fft_len = len.next_power_of_two().max(2);
        let mut buffer: Vec<Complex<f64>> = centered
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                let w = if len > 1 {
                    0.5 * (1.0 - (2.0 * PI * i as f64 / (len as f64 - 1.0)).cos())
                } else {
                    1.0
                };
                Complex::new(x * w, 0.0)
            })
            .collect();
        buffer.resize(fft_len, Complex::new(0.0, 0.0));

        let fft = self.planner.plan_fft_forward(fft_len);
        fft.process(&mut buffer);

        let power = buffer
            .iter()
            .take(fft_len / 2 + 1)
            .map(|c| c.norm_sqr() / fft_len as f64)
            .collect();

        PowerSpectrum {
            power,
            resolution_hz: rate_hz / fft_len as f64,
        }
    }

    /// Run the full spectral pass over an RR window.
    ///
    /// Returns `None` when the window is too short to resample meaningfully.
    pub fn analyze(&mut self, rr_ms: &[f64], config: &HrvConfig) -> Option<SpectralSummary> {
        let tachogram = resample_tachogram(rr_ms, config.resample_hz);
        if tachogram.len() < MIN_TACHOGRAM_SAMPLES {
            return None;
        }

        let spectrum = self.power_spectrum(&tachogram, config.resample_hz);
        let band_power = spectrum.band_power(config.coherence_band);
        let total_power = spectrum.band_power(config.total_band);
        let coherence = if total_power > POWER_EPSILON {
            band_power / total_power
        } else {
            0.0
        };

        Some(SpectralSummary {
            coherence,
            band_power,
            total_power,
            peak_frequency_hz: spectrum.peak_frequency(config.coherence_band),
            resolution_hz: spectrum.resolution_hz,
        })
    }
}

/// One-shot [`SpectralAnalyzer::analyze`] for callers without a long-lived analyzer
pub fn analyze(rr_ms: &[f64], config: &HrvConfig) -> Option<SpectralSummary> {
    SpectralAnalyzer::new().analyze(rr_ms, config)
}
