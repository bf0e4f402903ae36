//! Peak statistics: numerical gradient, FWHM and center of mass.
//!
//! Every function here is pure and total. Degenerate input (too few points,
//! zero or non-finite sums, a spline that cannot be built) yields a defined
//! zero result instead of an error, so a live scan never stops analysing.

use crate::analysis::spline::CubicSpline;
use serde::{Deserialize, Serialize};

/// Full width at half maximum
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Fwhm {
    /// `right - left`
    pub width: f64,
    /// Left half-maximum crossing
    pub left: f64,
    /// Right half-maximum crossing
    pub right: f64,
}

impl Fwhm {
    /// Zero-width result located at `x`
    pub fn zero_at(x: f64) -> Self {
        Self {
            width: 0.0,
            left: x,
            right: x,
        }
    }

    fn between(left: f64, right: f64) -> Self {
        Self {
            width: right - left,
            left,
            right,
        }
    }

    /// Midpoint of the two crossings
    pub fn center(&self) -> f64 {
        0.5 * (self.left + self.right)
    }
}

/// Gradient of `y` with respect to `x`.
///
/// Second-order central differences on the interior (valid for uneven
/// spacing) and first-order one-sided differences at the ends. Non-finite
/// values, e.g. from repeated `x`, are replaced by 0.
pub fn gradient(x: &[f64], y: &[f64]) -> Vec<f64> {
    let n = x.len().min(y.len());
    if n < 2 {
        return vec![0.0; n];
    }

    let mut out = vec![0.0; n];
    out[0] = (y[1] - y[0]) / (x[1] - x[0]);
    out[n - 1] = (y[n - 1] - y[n - 2]) / (x[n - 1] - x[n - 2]);
    for i in 1..n - 1 {
        let hd = x[i] - x[i - 1];
        let hs = x[i + 1] - x[i];
        out[i] = (hd * hd * y[i + 1] + (hs * hs - hd * hd) * y[i] - hs * hs * y[i - 1])
            / (hs * hd * (hd + hs));
    }
    for v in &mut out {
        if !v.is_finite() {
            *v = 0.0;
        }
    }
    out
}

/// Center of mass `sum(x*y) / sum(y)`.
///
/// When `sum(y)` is zero or non-finite the scale factor is taken as 1, so the
/// result is the plain `sum(x*y)`.
pub fn calc_com(x: &[f64], y: &[f64]) -> f64 {
    let total: f64 = y.iter().sum();
    let scale = if total == 0.0 || !total.is_finite() {
        1.0
    } else {
        total
    };
    let weighted: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();
    weighted / scale
}

/// FWHM from the half-maximum crossings of a cubic spline.
///
/// Returns `None` when there are 3 samples or fewer, so the caller keeps its
/// previous value. Otherwise:
///
/// - no usable crossing pair: zero width at the first sample
/// - two crossings: accepted when `y - max/2` has a positive mean between them
/// - more crossings: adjacent pairs are tried widest first and the first pair
///   enclosing a positive mean wins
///
/// The multi-crossing rule is a heuristic. For multi-modal data it is not
/// guaranteed to bracket the global peak.
pub fn calc_fwhm(x: &[f64], y: &[f64]) -> Option<Fwhm> {
    if x.len() <= 3 || x.len() != y.len() {
        return None;
    }
    Some(half_max_crossings(x, y).unwrap_or_else(|| Fwhm::zero_at(x[0])))
}

fn half_max_crossings(x: &[f64], y: &[f64]) -> Option<Fwhm> {
    let max = y.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return None;
    }
    let half = max / 2.0;
    let (xs, ys) = sorted_unique(x, y, half);
    let spline = CubicSpline::new(xs.clone(), ys.clone()).ok()?;
    let roots = spline.roots();

    let positive_between = |left: f64, right: f64| -> bool {
        let inside: Vec<f64> = xs
            .iter()
            .zip(&ys)
            .filter(|(xv, _)| **xv >= left && **xv <= right)
            .map(|(_, yv)| *yv)
            .collect();
        let mean = if inside.is_empty() {
            spline.evaluate(0.5 * (left + right))
        } else {
            inside.iter().sum::<f64>() / inside.len() as f64
        };
        mean > 0.0
    };

    match roots.len() {
        0 | 1 => None,
        2 => positive_between(roots[0], roots[1]).then(|| Fwhm::between(roots[0], roots[1])),
        _ => {
            let mut pairs: Vec<(f64, f64)> = roots.windows(2).map(|w| (w[0], w[1])).collect();
            pairs.sort_by(|a, b| (b.1 - b.0).total_cmp(&(a.1 - a.0)));
            pairs
                .into_iter()
                .find(|(l, r)| positive_between(*l, *r))
                .map(|(l, r)| Fwhm::between(l, r))
        }
    }
}

/// Sort by `x`, average `y` over repeated `x`, and subtract `offset`.
fn sorted_unique(x: &[f64], y: &[f64], offset: f64) -> (Vec<f64>, Vec<f64>) {
    let mut pairs: Vec<(f64, f64)> = x.iter().copied().zip(y.iter().copied()).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut xs: Vec<f64> = Vec::with_capacity(pairs.len());
    let mut ys: Vec<f64> = Vec::with_capacity(pairs.len());
    let mut count = 0.0;
    for (xv, yv) in pairs {
        if xs.last() == Some(&xv) {
            count += 1.0;
            if let Some(last) = ys.last_mut() {
                *last += (yv - offset - *last) / count;
            }
        } else {
            xs.push(xv);
            ys.push(yv - offset);
            count = 1.0;
        }
    }
    (xs, ys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn gaussian(center: f64, sigma: f64, n: usize, lo: f64, hi: f64) -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..n)
            .map(|i| lo + (hi - lo) * i as f64 / (n - 1) as f64)
            .collect();
        let y = x
            .iter()
            .map(|v| 100.0 * (-(v - center).powi(2) / (2.0 * sigma * sigma)).exp())
            .collect();
        (x, y)
    }

    #[test]
    fn test_gradient_matches_linear_slope() {
        let x = vec![0.0, 0.5, 1.5, 2.0];
        let y: Vec<f64> = x.iter().map(|v| 3.0 * v + 1.0).collect();
        for g in gradient(&x, &y) {
            assert_relative_eq!(g, 3.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_gradient_floors_non_finite() {
        let g = gradient(&[1.0, 1.0, 2.0], &[0.0, 1.0, 2.0]);
        assert_eq!(g[0], 0.0);
        assert!(g.iter().all(|v| v.is_finite()));
        assert!(gradient(&[1.0], &[2.0]) == vec![0.0]);
    }

    #[test]
    fn test_fwhm_of_gaussian() {
        let sigma = 0.3;
        let (x, y) = gaussian(1.0, sigma, 81, -1.0, 3.0);
        let fwhm = calc_fwhm(&x, &y).unwrap();
        let expected = 2.0 * sigma * (2.0 * std::f64::consts::LN_2).sqrt();
        assert_relative_eq!(fwhm.width, expected, max_relative = 1e-2);
        assert_relative_eq!(fwhm.center(), 1.0, epsilon = 1e-3);
        assert_relative_eq!(calc_com(&x, &y), 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_fwhm_independent_of_scan_direction() {
        let (mut x, mut y) = gaussian(0.0, 1.0, 41, -5.0, 5.0);
        let forward = calc_fwhm(&x, &y).unwrap();
        x.reverse();
        y.reverse();
        let backward = calc_fwhm(&x, &y).unwrap();
        assert_relative_eq!(forward.width, backward.width, epsilon = 1e-12);
    }

    #[test]
    fn test_fwhm_needs_more_than_three_points() {
        assert!(calc_fwhm(&[0.0, 1.0, 2.0], &[0.0, 1.0, 0.0]).is_none());
        assert!(calc_fwhm(&[], &[]).is_none());
    }

    #[test]
    fn test_fwhm_without_crossings_is_zero_width_at_first_sample() {
        let x = vec![2.0, 3.0, 4.0, 5.0];
        let fwhm = calc_fwhm(&x, &[5.0, 5.0, 5.0, 5.0]).unwrap();
        assert_eq!(fwhm, Fwhm::zero_at(2.0));

        let zeros = calc_fwhm(&x, &[0.0; 4]).unwrap();
        assert_eq!(zeros.width, 0.0);
    }

    #[test]
    fn test_fwhm_rejects_trough() {
        // A dip crosses half maximum twice but encloses a negative mean.
        let x: Vec<f64> = (0..21).map(|i| i as f64 * 0.1).collect();
        let y: Vec<f64> = x
            .iter()
            .map(|v| 10.0 - 9.0 * (-(v - 1.0).powi(2) / 0.02).exp())
            .collect();
        let fwhm = calc_fwhm(&x, &y).unwrap();
        assert_eq!(fwhm.width, 0.0);
    }

    #[test]
    fn test_fwhm_multi_lobe_prefers_widest_positive_pair() {
        // Heuristic check: a narrow and a wide peak of equal height. The wider
        // lobe is reported; this is not a global-peak guarantee.
        let x: Vec<f64> = (0..201).map(|i| i as f64 * 0.05).collect();
        let y: Vec<f64> = x
            .iter()
            .map(|v| {
                100.0 * (-(v - 2.0).powi(2) / (2.0 * 0.1f64.powi(2))).exp()
                    + 100.0 * (-(v - 7.0).powi(2) / (2.0 * 0.6f64.powi(2))).exp()
            })
            .collect();
        let fwhm = calc_fwhm(&x, &y).unwrap();
        assert!(fwhm.center() > 5.0, "picked {:?}", fwhm);
    }

    #[test]
    fn test_com_of_all_zero_is_finite() {
        let com = calc_com(&[1.0, 2.0, 3.0], &[0.0, 0.0, 0.0]);
        assert!(com.is_finite());
        assert_eq!(com, 0.0);
    }

    #[test]
    fn test_com_uses_unit_scale_when_sum_vanishes() {
        // sum(y) == 0, so the result is sum(x*y)
        assert_eq!(calc_com(&[1.0, 2.0], &[-1.0, 1.0]), 1.0);
    }

    #[test]
    fn test_statistics_are_idempotent() {
        let (x, y) = gaussian(0.5, 0.2, 31, -1.0, 2.0);
        assert_eq!(calc_fwhm(&x, &y), calc_fwhm(&x, &y));
        assert_eq!(calc_com(&x, &y), calc_com(&x, &y));
    }
}
