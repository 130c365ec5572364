//! Winsorized elevation statistics used to decide what counts as a spike.

use log::debug;
use serde::{Deserialize, Serialize};

/// Denominator of the second (winsorized) standard deviation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinsorizedDeviation {
    /// Sum over in-bounds samples divided by the full sample count.
    ///
    /// Narrower than the textbook deviation whenever samples were excluded.
    /// Existing tile sets were baked with this.
    #[default]
    AllSamples,
    /// Sum over in-bounds samples divided by the in-bounds count.
    InBounds,
}

/// Snapshot of one statistics pass. Derived, never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Statistics {
    /// Winsorized mean (raw mean when `insufficient_data` is set).
    pub mean: f64,
    /// Winsorized standard deviation (raw one when `insufficient_data` is set).
    pub std_dev: f64,
    pub floor: f64,
    pub ceiling: f64,
    pub raw_mean: f64,
    pub raw_std_dev: f64,
    /// Samples strictly inside the provisional bounds.
    pub in_bounds: usize,
    /// No sample fell strictly inside the provisional bounds, so the raw
    /// mean/std were used.
    pub insufficient_data: bool,
}

impl Statistics {
    /// Compute winsorized statistics for `elevations` with bounds at `sigma`
    /// standard deviations.
    ///
    /// Returns `None` for an empty sample set.
    pub fn compute(elevations: &[f64], sigma: f64, mode: WinsorizedDeviation) -> Option<Self> {
        if elevations.is_empty() {
            return None;
        }

        let n = elevations.len() as f64;

        let raw_mean = elevations.iter().sum::<f64>() / n;
        let raw_std_dev = (elevations
            .iter()
            .map(|e| (raw_mean - e).powi(2))
            .sum::<f64>()
            / n)
            .sqrt();

        // Provisional (winsorization) bounds; membership is strict on both ends.
        let lower = raw_mean - sigma * raw_std_dev;
        let upper = raw_mean + sigma * raw_std_dev;
        let inside = |e: f64| e > lower && e < upper;

        let (sum, in_bounds) = elevations
            .iter()
            .copied()
            .filter(|&e| inside(e))
            .fold((0.0_f64, 0usize), |(s, c), e| (s + e, c + 1));

        if in_bounds == 0 {
            debug!(
                "winsorization kept no samples of {} (mean {:.3}, std {:.3}); using raw statistics",
                elevations.len(),
                raw_mean,
                raw_std_dev
            );
            return Some(Self {
                mean: raw_mean,
                std_dev: raw_std_dev,
                floor: lower,
                ceiling: upper,
                raw_mean,
                raw_std_dev,
                in_bounds,
                insufficient_data: true,
            });
        }

        let mean = sum / in_bounds as f64;

        let squared = elevations
            .iter()
            .copied()
            .filter(|&e| inside(e))
            .map(|e| (mean - e).powi(2))
            .sum::<f64>();

        let denominator = match mode {
            WinsorizedDeviation::AllSamples => n,
            WinsorizedDeviation::InBounds => in_bounds as f64,
        };
        let std_dev = (squared / denominator).sqrt();

        Some(Self {
            mean,
            std_dev,
            floor: mean - sigma * std_dev,
            ceiling: mean + sigma * std_dev,
            raw_mean,
            raw_std_dev,
            in_bounds,
            insufficient_data: false,
        })
    }

    /// `true` when `elevation` lies outside `[floor, ceiling]`.
    #[inline]
    pub fn is_outlier(&self, elevation: f64) -> bool {
        elevation < self.floor || elevation > self.ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn raw_moments_and_exclusion_of_boundary_outlier() {
        let stats = Statistics::compute(
            &[10.0, 10.0, 10.0, 10.0, 100.0],
            2.0,
            WinsorizedDeviation::AllSamples,
        )
        .unwrap();

        assert!((stats.raw_mean - 28.0).abs() < EPS);
        assert!((stats.raw_std_dev - 36.0).abs() < EPS);

        // Upper provisional bound is 28 + 2 * 36 = 100, and membership is strict.
        assert_eq!(stats.in_bounds, 4);
        assert!((stats.mean - 10.0).abs() < EPS);
        assert!(!stats.insufficient_data);
    }

    #[test]
    fn extreme_outlier_does_not_drag_the_mean() {
        let stats = Statistics::compute(
            &[10.0, 10.0, 10.0, 10.0, 1000.0],
            2.0,
            WinsorizedDeviation::AllSamples,
        )
        .unwrap();

        assert!((stats.raw_mean - 208.0).abs() < EPS);
        assert!((stats.mean - 10.0).abs() < EPS);
        assert!(stats.is_outlier(1000.0));
        assert!(!stats.is_outlier(10.0));
    }

    #[test]
    fn denominator_choice_changes_only_the_deviation() {
        let samples = [9.0, 11.0, 9.0, 11.0, 10.0, 10.0, 10.0, 10.0, 500.0];

        let all = Statistics::compute(&samples, 2.0, WinsorizedDeviation::AllSamples).unwrap();
        let kept = Statistics::compute(&samples, 2.0, WinsorizedDeviation::InBounds).unwrap();

        assert_eq!(all.in_bounds, 8);
        assert!((all.mean - kept.mean).abs() < EPS);

        // Four samples deviate by 1: sum of squares is 4.
        assert!((all.std_dev - (4.0_f64 / 9.0).sqrt()).abs() < EPS);
        assert!((kept.std_dev - (4.0_f64 / 8.0).sqrt()).abs() < EPS);
        assert!(kept.ceiling > all.ceiling);
    }

    #[test]
    fn constant_samples_fall_back_to_raw_statistics() {
        let stats =
            Statistics::compute(&[42.0; 16], 5.0, WinsorizedDeviation::AllSamples).unwrap();

        assert!(stats.insufficient_data);
        assert_eq!(stats.in_bounds, 0);
        assert_eq!(stats.mean, 42.0);
        assert_eq!(stats.std_dev, 0.0);
        assert!(!stats.is_outlier(42.0));
    }

    #[test]
    fn empty_input_has_no_statistics() {
        assert!(Statistics::compute(&[], 3.0, WinsorizedDeviation::AllSamples).is_none());
    }
}
