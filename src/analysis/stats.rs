//! Summary statistics over measured populations.

use std::fmt;

use serde::Serialize;
use tdigest::TDigest;

/// Quantiles reported by [`Distribution::estimates`].
const QUANTILES: [f64; 7] = [0.001, 0.01, 0.1, 0.5, 0.9, 0.99, 0.999];

/// Streaming min/max/mean/stddev of one population.
///
/// The last element of the population is left out of every statistic, and
/// the deviation divides by the number of elements used minus one. Values
/// are converted from cycles by the clock frequency.
///
/// These are rough numbers: nothing distinguishes a well-sampled population
/// from a poorly sampled one, and the extremes are the extremes of what was
/// observed, not bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RoughStats {
    /// Size of the population, including the excluded last element.
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
}

impl RoughStats {
    /// Compute statistics over `values`, dividing each result by `mhz`.
    ///
    /// # Returns
    ///
    /// `None` for an empty population.
    pub fn compute(values: &[f64], mhz: f64) -> Option<Self> {
        let first = *values.first()?;
        let n = values.len();

        let mut min = first;
        let mut max = first;
        let mut mean = first;
        let mut q = 0.0;
        for (i, v) in values.iter().enumerate().take(n.saturating_sub(1)).skip(1) {
            min = min.min(*v);
            max = max.max(*v);
            let diff = v - mean;
            mean += diff / (i + 1) as f64;
            q += i as f64 * diff * diff / (i + 1) as f64;
        }
        let stddev = if n > 2 { (q / (n - 2) as f64).sqrt() } else { 0.0 };

        Some(Self {
            count: n,
            min: min / mhz,
            max: max / mhz,
            mean: mean / mhz,
            stddev: stddev / mhz,
        })
    }

    /// Statistics over a population of cycle counts.
    pub fn from_cycles(values: &[u64], mhz: f64) -> Option<Self> {
        let values: Vec<f64> = values.iter().map(|v| *v as f64).collect();
        Self::compute(&values, mhz)
    }
}

impl fmt::Display for RoughStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n={} min={:.5} max={:.5} mean={:.5} stddev={:.5}",
            self.count, self.min, self.max, self.mean, self.stddev
        )
    }
}

/// Maximum, average and population deviation of one bucket of overheads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BucketSummary {
    pub count: usize,
    pub max: f64,
    pub avg: f64,
    pub std: f64,
}

impl BucketSummary {
    /// Summarise `values`, dividing each result by `scale`.
    ///
    /// An empty bucket summarises to zeros.
    pub fn compute(values: &[f64], scale: f64) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - avg) * (v - avg)).sum::<f64>() / n;
        Self {
            count: values.len(),
            max: max / scale,
            avg: avg / scale,
            std: var.sqrt() / scale,
        }
    }
}

/// Value at percentile `p` (0 to 100) of sorted data, interpolating
/// linearly between neighbouring ranks.
pub fn score_at_percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64))
}

/// Drop outliers outside `extent` interquartile ranges of the quartiles.
///
/// # Returns
///
/// The retained values, in their original order.
pub fn iqr_filter(values: &[f64], extent: f64) -> Vec<f64> {
    if extent == f64::INFINITY {
        return values.to_vec();
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let (Some(q1), Some(q3)) = (
        score_at_percentile(&sorted, 25.0),
        score_at_percentile(&sorted, 75.0),
    ) else {
        return Vec::new();
    };
    let spread = (q3 - q1) * extent;
    let (low, high) = (q1 - spread, q3 + spread);
    values
        .iter()
        .copied()
        .filter(|v| *v >= low && *v <= high)
        .collect()
}

/// Quantile estimates of a distribution.
#[derive(Debug, Clone)]
pub struct Estimates {
    /// The number of samples in the distribution.
    pub count: usize,

    /// (percentile, value) pairs, ascending by percentile.
    pub quantiles: Vec<(f64, f64)>,
}

impl Estimates {
    /// Get a specific percentile value from the estimates.
    ///
    /// # Arguments
    ///
    /// * `percentile` - The percentile to get (0.0 to 1.0)
    ///
    /// # Returns
    ///
    /// The value at the specified percentile, or None if not available.
    pub fn percentile(&self, percentile: f64) -> Option<f64> {
        let (first, last) = (self.quantiles.first()?, self.quantiles.last()?);
        if percentile <= first.0 {
            return Some(first.1);
        }
        if percentile >= last.0 {
            return Some(last.1);
        }
        self.quantiles.windows(2).find_map(|w| {
            let ((p1, v1), (p2, v2)) = (w[0], w[1]);
            (p1 <= percentile && percentile <= p2)
                .then(|| v1 + (v2 - v1) * (percentile - p1) / (p2 - p1))
        })
    }

    /// Render the density of the distribution as a single line of bars.
    ///
    /// # Arguments
    ///
    /// * `width` - Line width; the terminal width when `None`
    pub fn visualize(&self, width: Option<usize>) -> String {
        const BARS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
        if self.quantiles.is_empty() {
            return String::new();
        }
        let label = |p: f64| {
            self.quantiles
                .iter()
                .find(|(q, _)| (*q - p).abs() < 1e-6)
                .map(|(_, v)| format!("{v:.1}"))
        };
        let min_label = label(0.001).unwrap_or_else(|| "min".to_string());
        let max_label = label(0.999).unwrap_or_else(|| "max".to_string());
        let p50_label = label(0.5);
        let p50_len = p50_label.as_ref().map_or(0, |s| s.len() + 2);
        let bar_space = width
            .or_else(|| term_size::dimensions().map(|(w, _)| w))
            .unwrap_or(64)
            .max(16);
        let bar_width = bar_space
            .saturating_sub(min_label.len() + 1)
            .saturating_sub(p50_len + 2)
            .saturating_sub(max_label.len() + 1)
            .max(8);

        // Bar height rises towards the median and falls off to either tail.
        let mut points: Vec<(f64, usize)> = self
            .quantiles
            .iter()
            .map(|(_, v)| *v)
            .zip([0, 1, 2, 3, 2, 1, 0])
            .collect();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        let n = points.len();
        let min = points[0].0;
        let max = points[n - 1].0;
        let range = if (max - min).abs() < f64::EPSILON {
            1.0
        } else {
            max - min
        };
        let top = BARS.len() - 1;
        let position = |x: usize| min + x as f64 / (bar_width - 1) as f64 * range;

        let mut bars = Vec::with_capacity(bar_width);
        for x in 0..bar_width {
            let value = position(x);
            let mut seg = 0;
            while seg + 1 < n && value > points[seg + 1].0 {
                seg += 1;
            }
            let (v1, b1) = points[seg];
            let (v2, b2) = points[(seg + 1).min(n - 1)];
            let t = if (v2 - v1).abs() < f64::EPSILON {
                0.0
            } else {
                ((value - v1) / (v2 - v1)).clamp(0.0, 1.0)
            };
            let height = b1 as f64 + (b2 as f64 - b1 as f64) * t;
            let idx = ((height / 3.0) * top as f64).round() as usize;
            bars.push(BARS[idx.min(top)]);
        }

        let p50_pos = self
            .percentile(0.5)
            .map(|p50| {
                (0..bar_width)
                    .min_by(|a, b| {
                        (position(*a) - p50)
                            .abs()
                            .total_cmp(&(position(*b) - p50).abs())
                    })
                    .unwrap_or(bar_width / 2)
            })
            .unwrap_or(bar_width / 2);

        let mut line = String::new();
        line.push_str(&min_label);
        line.push_str(" |");
        line.extend(bars.iter().take(p50_pos));
        if let Some(p50) = p50_label {
            line.push(' ');
            line.push_str(&p50);
            line.push(' ');
        }
        line.extend(bars.iter().skip(p50_pos));
        line.push_str("| ");
        line.push_str(&max_label);
        line
    }
}

impl fmt::Display for Estimates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "count: {}", self.count)?;
        for (p, v) in &self.quantiles {
            write!(f, ", p{}: {:.1}", p * 100.0, v)?;
        }
        Ok(())
    }
}

/// An approximate distribution of values, backed by a t-digest.
#[derive(Debug, Clone)]
pub struct Distribution {
    digest: TDigest,
}

impl Distribution {
    pub fn new() -> Self {
        Self {
            digest: TDigest::new_with_size(100),
        }
    }

    /// Add a batch of values.
    pub fn add_all(&mut self, values: &[f64]) {
        if values.is_empty() {
            return;
        }
        self.digest = self.digest.merge_unsorted(values.to_vec());
    }

    /// Add one value.
    pub fn add(&mut self, value: f64) {
        self.add_all(&[value]);
    }

    /// Get the quantile estimates of the distribution.
    pub fn estimates(&self) -> Estimates {
        Estimates {
            count: self.digest.count() as usize,
            quantiles: QUANTILES
                .iter()
                .map(|p| (*p, self.digest.estimate_quantile(*p)))
                .collect(),
        }
    }
}

impl Default for Distribution {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use more_asserts::assert_gt;
    use more_asserts::assert_lt;

    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_rough_stats_excludes_last() {
        let stats = RoughStats::compute(&[10.0, 20.0, 30.0, 40.0], 1.0).unwrap();
        assert_eq!(stats.count, 4);
        assert!(close(stats.min, 10.0));
        assert!(close(stats.max, 30.0));
        assert!(close(stats.mean, 20.0));
        assert!(close(stats.stddev, 10.0));
    }

    #[test]
    fn test_rough_stats_frequency() {
        let stats = RoughStats::from_cycles(&[2000, 4000, 6000, 1], 2000.0).unwrap();
        assert!(close(stats.min, 1.0));
        assert!(close(stats.max, 3.0));
        assert!(close(stats.mean, 2.0));
        assert!(close(stats.stddev, 1.0));
    }

    #[test]
    fn test_rough_stats_small_populations() {
        assert!(RoughStats::compute(&[], 1.0).is_none());

        let one = RoughStats::compute(&[7.0], 1.0).unwrap();
        assert_eq!(one.count, 1);
        assert!(close(one.min, 7.0) && close(one.max, 7.0) && close(one.mean, 7.0));
        assert_eq!(one.stddev, 0.0);

        let two = RoughStats::compute(&[7.0, 100.0], 1.0).unwrap();
        assert!(close(two.max, 7.0));
        assert_eq!(two.stddev, 0.0);
    }

    #[test]
    fn test_rough_stats_negative() {
        let stats = RoughStats::compute(&[-5.0, 5.0, 0.0], 1.0).unwrap();
        assert!(close(stats.min, -5.0));
        assert!(close(stats.max, 5.0));
        assert!(close(stats.mean, 0.0));
    }

    #[test]
    fn test_bucket_summary() {
        let summary = BucketSummary::compute(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0], 1.0);
        assert_eq!(summary.count, 8);
        assert!(close(summary.max, 9.0));
        assert!(close(summary.avg, 5.0));
        assert!(close(summary.std, 2.0));
        assert_eq!(BucketSummary::compute(&[], 1.0), BucketSummary::default());

        let scaled = BucketSummary::compute(&[100.0, 300.0], 100.0);
        assert!(close(scaled.avg, 2.0));
    }

    #[test]
    fn test_score_at_percentile() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(score_at_percentile(&sorted, 0.0), Some(1.0));
        assert_eq!(score_at_percentile(&sorted, 100.0), Some(4.0));
        assert_eq!(score_at_percentile(&sorted, 50.0), Some(2.5));
        assert_eq!(score_at_percentile(&sorted, 25.0), Some(1.75));
        assert_eq!(score_at_percentile(&[], 50.0), None);
    }

    #[test]
    fn test_iqr_filter() {
        let mut values: Vec<f64> = (1..=10).rev().map(f64::from).collect();
        values.insert(3, 1000.0);
        values.push(-500.0);
        let kept = iqr_filter(&values, 1.5);
        assert_eq!(kept, (1..=10).rev().map(f64::from).collect::<Vec<_>>());
        assert!(iqr_filter(&[], 1.5).is_empty());
    }

    #[test]
    fn test_iqr_filter_unbounded() {
        let values = [5.0, 5.0, 5.0, 1000.0];
        assert_eq!(iqr_filter(&values, f64::INFINITY), values.to_vec());
        assert_eq!(iqr_filter(&values, 0.0), vec![5.0, 5.0, 5.0]);
    }

    #[test]
    fn test_distribution_empty() {
        let dist = Distribution::new();
        assert_eq!(dist.estimates().count, 0);
    }

    #[test]
    fn test_distribution_single_value() {
        let mut dist = Distribution::new();
        dist.add_all(&[42.0; 1000]);
        let estimates = dist.estimates();
        assert_eq!(estimates.count, 1000);
        assert_eq!(estimates.percentile(0.0), Some(42.0));
        assert_eq!(estimates.percentile(0.5), Some(42.0));
        assert_eq!(estimates.percentile(1.0), Some(42.0));
    }

    #[test]
    fn test_distribution_multiple_values() {
        let mut dist = Distribution::new();
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            dist.add(v);
        }
        let estimates = dist.estimates();
        assert_eq!(estimates.count, 5);
        assert_lt!(estimates.percentile(0.001).unwrap(), 2.0);
        assert_lt!(estimates.percentile(0.5).unwrap(), 4.0);
        assert_gt!(estimates.percentile(0.5).unwrap(), 2.0);
        assert_gt!(estimates.percentile(0.999).unwrap(), 4.0);
    }

    #[test]
    fn test_estimates_display() {
        let mut dist = Distribution::new();
        dist.add_all(&[1.0, 2.0, 3.0]);
        let display = dist.estimates().to_string();
        assert!(display.contains("count: 3"));
        assert!(display.contains("p50: 2.0"));
    }

    #[test]
    fn test_visualize() {
        let mut dist = Distribution::new();
        dist.add(1.0);
        dist.add_all(&[3.0; 11]);
        dist.add(5.0);
        let line = dist.estimates().visualize(Some(60));
        assert!(line.contains('|'));
        assert!(line.contains("3.0"));
    }
}
