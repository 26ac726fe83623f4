//! Sampling-rate analysis of trip paths.
//!
//! The gap between consecutive path samples tells how often a vehicle
//! reported its position. Gaps of zero (duplicate or reordered points) and
//! gaps of [`MAX_ACTIVE_INTERVAL_SECS`] or more (pauses, signal loss) are
//! left out, so the summary reflects the capture rate while moving.

use std::collections::HashMap;

use serde::Serialize;

use crate::route::PathSample;

/// Gaps at or above this many seconds are treated as pauses.
pub const MAX_ACTIVE_INTERVAL_SECS: f64 = 60.0;

/// How many of the most frequent rounded intervals a summary keeps.
pub const COMMON_INTERVALS: usize = 5;

/// Seconds between consecutive samples of `path`, keeping `0 < gap < 60`.
pub fn active_intervals(path: &[PathSample]) -> impl Iterator<Item = f64> + '_ {
    path.windows(2)
        .map(|pair| pair[1].timestamp - pair[0].timestamp)
        .filter(|gap| *gap > 0.0 && *gap < MAX_ACTIVE_INTERVAL_SECS)
}

/// An interval rounded to a tenth of a second and how often it occurred.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntervalCount {
    /// Interval in seconds, rounded to 0.1 s.
    pub seconds: f64,
    /// Number of gaps that round to `seconds`.
    pub count: usize,
}

/// Distribution of active sampling intervals over a set of trips.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntervalSummary {
    /// Trips the intervals were taken from.
    pub trips: usize,
    /// Number of intervals.
    pub intervals: usize,
    /// Mean interval in seconds.
    pub mean: f64,
    /// Median interval in seconds.
    pub median: f64,
    /// Shortest interval.
    pub min: f64,
    /// Longest interval.
    pub max: f64,
    /// Most frequent intervals, most frequent first.
    pub common: Vec<IntervalCount>,
}

impl IntervalSummary {
    /// Summarize the active intervals of `paths`.
    ///
    /// Returns `None` when no path has a usable interval.
    pub fn from_paths<'a>(paths: impl IntoIterator<Item = &'a [PathSample]>) -> Option<Self> {
        let mut trips = 0;
        let mut gaps = Vec::new();
        for path in paths {
            trips += 1;
            gaps.extend(active_intervals(path));
        }
        Self::from_intervals(trips, gaps)
    }

    /// Summarize `gaps` taken from `trips` trips.
    pub fn from_intervals(trips: usize, mut gaps: Vec<f64>) -> Option<Self> {
        if gaps.is_empty() {
            return None;
        }
        gaps.sort_unstable_by(f64::total_cmp);

        let n = gaps.len();
        let mean = gaps.iter().sum::<f64>() / n as f64;
        let median = if n % 2 == 1 {
            gaps[n / 2]
        } else {
            (gaps[n / 2 - 1] + gaps[n / 2]) / 2.0
        };

        let mut tenths: HashMap<i64, usize> = HashMap::new();
        for gap in &gaps {
            *tenths.entry((gap * 10.0).round_ties_even() as i64).or_default() += 1;
        }
        let mut common: Vec<(i64, usize)> = tenths.into_iter().collect();
        common.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let common = common
            .into_iter()
            .take(COMMON_INTERVALS)
            .map(|(tenths, count)| IntervalCount {
                seconds: tenths as f64 / 10.0,
                count,
            })
            .collect();

        Some(Self {
            trips,
            intervals: n,
            mean,
            median,
            min: gaps[0],
            max: gaps[n - 1],
            common,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(times: &[f64]) -> Vec<PathSample> {
        times
            .iter()
            .map(|t| PathSample::new(*t, 47.6, -122.3))
            .collect()
    }

    #[test]
    fn pauses_and_repeats_are_not_intervals() {
        let p = path(&[0.0, 1.0, 1.0, 3.5, 63.5, 64.0, 63.0]);
        let gaps: Vec<f64> = active_intervals(&p).collect();
        assert_eq!(gaps, vec![1.0, 2.5, 0.5]);
    }

    #[test]
    fn summary_reports_spread_and_common_values() {
        let a = path(&[0.0, 1.0, 2.0, 3.0, 4.5]);
        let b = path(&[10.0, 11.04, 13.0]);
        let single = path(&[5.0]);
        let summary =
            IntervalSummary::from_paths([a.as_slice(), b.as_slice(), single.as_slice()]).unwrap();

        assert_eq!(summary.trips, 3);
        assert_eq!(summary.intervals, 6);
        assert_eq!(summary.min, 1.0);
        assert!((summary.max - 1.96).abs() < 1e-9);
        // Sorted: 1.0 1.0 1.0 1.04 1.5 1.96
        assert!((summary.median - 1.02).abs() < 1e-9);
        assert!((summary.mean - 7.5 / 6.0).abs() < 1e-9);
        assert_eq!(
            summary.common,
            vec![
                IntervalCount {
                    seconds: 1.0,
                    count: 4
                },
                IntervalCount {
                    seconds: 1.5,
                    count: 1
                },
                IntervalCount {
                    seconds: 2.0,
                    count: 1
                },
            ]
        );
    }

    #[test]
    fn common_list_is_capped() {
        let gaps = (1..=8).map(|i| i as f64).collect();
        let summary = IntervalSummary::from_intervals(1, gaps).unwrap();
        assert_eq!(summary.common.len(), COMMON_INTERVALS);
    }

    #[test]
    fn nothing_to_summarize() {
        let still = path(&[1.0, 1.0]);
        assert_eq!(IntervalSummary::from_paths([still.as_slice()]), None);
        assert_eq!(IntervalSummary::from_intervals(0, Vec::new()), None);
    }
}
