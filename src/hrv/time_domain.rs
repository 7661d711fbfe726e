//! Time-domain HRV statistics over RR intervals (milliseconds)

/// Arithmetic mean, or `None` for an empty slice
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Root mean square of successive differences.
///
/// Returns `None` with fewer than two intervals.
pub fn rmssd(rr_ms: &[f64]) -> Option<f64> {
    if rr_ms.len() < 2 {
        return None;
    }
    let sum_sq: f64 = rr_ms.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum();
    Some((sum_sq / (rr_ms.len() - 1) as f64).sqrt())
}

/// Standard deviation of RR intervals (population)
pub fn sdnn(rr_ms: &[f64]) -> Option<f64> {
    let mean_rr = mean(rr_ms)?;
    let variance = rr_ms.iter().map(|rr| (rr - mean_rr).powi(2)).sum::<f64>() / rr_ms.len() as f64;
    Some(variance.sqrt())
}

/// Mean heart rate in bpm: `60000 / mean(RR)`
pub fn mean_hr(rr_ms: &[f64]) -> Option<f64> {
    match mean(rr_ms) {
        Some(mean_rr) if mean_rr > 0.0 => Some(60_000.0 / mean_rr),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rmssd_alternating() {
        // Successive differences are all +/-50
        let rr = [800.0, 850.0, 800.0, 850.0, 800.0];
        assert!((rmssd(&rr).unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_rmssd_reversal_invariant() {
        let rr: Vec<f64> = (0..40).map(|i| 700.0 + 5.0 * i as f64).collect();
        let mut reversed = rr.clone();
        reversed.reverse();
        let forward = rmssd(&rr).unwrap();
        assert!((forward - 5.0).abs() < 1e-9);
        assert!((forward - rmssd(&reversed).unwrap()).abs() < 1e-12);
    }

    #[test]
    fn test_rmssd_needs_two() {
        assert_eq!(rmssd(&[]), None);
        assert_eq!(rmssd(&[800.0]), None);
    }

    #[test]
    fn test_mean_hr() {
        // 1000ms per beat = 60 bpm
        assert!((mean_hr(&[1000.0, 1000.0]).unwrap() - 60.0).abs() < 1e-9);
        assert!((mean_hr(&[750.0, 850.0]).unwrap() - 75.0).abs() < 1e-9);
        assert_eq!(mean_hr(&[]), None);
    }

    #[test]
    fn test_sdnn_constant_series() {
        assert_eq!(sdnn(&[900.0, 900.0, 900.0]), Some(0.0));
        assert!((sdnn(&[800.0, 1000.0]).unwrap() - 100.0).abs() < 1e-9);
    }
}
