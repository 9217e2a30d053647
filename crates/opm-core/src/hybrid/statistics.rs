use serde::{Deserialize, Serialize};

use crate::types::Money;

/// Percentiles of the probability-weighted FMV distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FmvPercentiles {
    pub p5: Money,
    pub p10: Money,
    pub p25: Money,
    pub p50: Money,
    pub p75: Money,
    pub p90: Money,
    pub p95: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedStatistics {
    pub mean: Money,
    pub variance: f64,
    pub std_dev: Money,
    pub min: Money,
    pub max: Money,
    pub percentiles: FmvPercentiles,
}

/// Percentile `p` (0-100) of a weighted empirical distribution.
///
/// `sorted` holds (value, weight) pairs in ascending value order with
/// positive weights summing to 1. Each point sits at the midpoint of its
/// cumulative-probability band and values in between are interpolated
/// linearly; below the first or above the last midpoint the end value holds.
fn weighted_percentile(sorted: &[(Money, f64)], p: f64) -> Money {
    let q = p / 100.0;
    let mut cumulative = 0.0;
    let mut prev: Option<(f64, Money)> = None;
    for &(value, weight) in sorted {
        let mid = cumulative + weight / 2.0;
        if q <= mid {
            return match prev {
                None => value,
                Some((prev_mid, prev_value)) if mid > prev_mid => {
                    let frac = (q - prev_mid) / (mid - prev_mid);
                    prev_value + frac * (value - prev_value)
                }
                Some(_) => value,
            };
        }
        prev = Some((mid, value));
        cumulative += weight;
    }
    prev.map_or(0.0, |(_, v)| v)
}

/// Probability-weighted mean, variance, range and percentiles.
///
/// `weights` are decimals summing to 1; zero-weight entries take no part.
pub fn weighted_statistics(values: &[Money], weights: &[f64]) -> WeightedStatistics {
    let mut points: Vec<(Money, f64)> = values
        .iter()
        .zip(weights.iter())
        .filter(|(_, w)| **w > 0.0)
        .map(|(v, w)| (*v, *w))
        .collect();
    points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let total_weight: f64 = points.iter().map(|(_, w)| w).sum();
    if points.is_empty() || total_weight <= 0.0 {
        return WeightedStatistics {
            mean: 0.0,
            variance: 0.0,
            std_dev: 0.0,
            min: 0.0,
            max: 0.0,
            percentiles: FmvPercentiles {
                p5: 0.0,
                p10: 0.0,
                p25: 0.0,
                p50: 0.0,
                p75: 0.0,
                p90: 0.0,
                p95: 0.0,
            },
        };
    }
    for point in points.iter_mut() {
        point.1 /= total_weight;
    }

    let mean: Money = points.iter().map(|(v, w)| v * w).sum();
    let variance: f64 = points.iter().map(|(v, w)| w * (v - mean).powi(2)).sum();

    WeightedStatistics {
        mean,
        variance,
        std_dev: variance.sqrt(),
        min: points[0].0,
        max: points[points.len() - 1].0,
        percentiles: FmvPercentiles {
            p5: weighted_percentile(&points, 5.0),
            p10: weighted_percentile(&points, 10.0),
            p25: weighted_percentile(&points, 25.0),
            p50: weighted_percentile(&points, 50.0),
            p75: weighted_percentile(&points, 75.0),
            p90: weighted_percentile(&points, 90.0),
            p95: weighted_percentile(&points, 95.0),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mean_and_variance() {
        let stats = weighted_statistics(&[0.8, 1.0, 1.2], &[0.25, 0.5, 0.25]);
        assert_relative_eq!(stats.mean, 1.0, max_relative = 1e-12);
        // 0.25*0.04 + 0 + 0.25*0.04
        assert_relative_eq!(stats.variance, 0.02, max_relative = 1e-12);
        assert_relative_eq!(stats.std_dev, 0.02f64.sqrt(), max_relative = 1e-12);
        assert_eq!((stats.min, stats.max), (0.8, 1.2));
    }

    #[test]
    fn test_percentiles_interpolate_cumulative_probability() {
        // Midpoints: 0.8 at 0.125, 1.0 at 0.5, 1.2 at 0.875
        let stats = weighted_statistics(&[1.2, 0.8, 1.0], &[0.25, 0.25, 0.5]);
        let p = &stats.percentiles;
        assert_eq!(p.p5, 0.8);
        assert_eq!(p.p10, 0.8);
        assert_relative_eq!(p.p25, 0.8 + (0.25 - 0.125) / 0.375 * 0.2, max_relative = 1e-12);
        assert_relative_eq!(p.p50, 1.0, max_relative = 1e-12);
        assert_relative_eq!(p.p75, 1.0 + (0.75 - 0.5) / 0.375 * 0.2, max_relative = 1e-12);
        assert_eq!(p.p95, 1.2);
        assert!(p.p25 <= p.p50 && p.p50 <= p.p75);
    }

    #[test]
    fn test_single_point_distribution() {
        let stats = weighted_statistics(&[3.0], &[1.0]);
        assert_eq!(stats.percentiles.p5, 3.0);
        assert_eq!(stats.percentiles.p95, 3.0);
        assert_eq!(stats.variance, 0.0);
    }

    #[test]
    fn test_zero_weight_points_excluded() {
        let stats = weighted_statistics(&[1.0, 100.0], &[1.0, 0.0]);
        assert_eq!(stats.max, 1.0);
        assert_eq!(stats.mean, 1.0);
    }
}
