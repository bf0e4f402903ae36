//! Gaussian least-squares fit
//!
//! Fits `A*exp(-(x-cen)^2/(2*std^2))` with Levenberg-Marquardt. A fit that
//! does not converge yields a zero curve and no parameters.

use serde::{Deserialize, Serialize};

/// Printable form of the fitted model
pub const FIT_EQUATION: &str = "A*exp(-(x-cen)^2/(2*std^2))";

const MAX_ITERATIONS: usize = 200;
const MAX_DAMPING: f64 = 1e12;
const TOLERANCE: f64 = 1e-10;

/// Fitted Gaussian parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussianParams {
    /// Peak height `A`
    pub amplitude: f64,
    /// Peak position `cen`
    pub center: f64,
    /// Width `std`, always positive
    pub sigma: f64,
}

impl GaussianParams {
    /// Model value at `x`
    pub fn eval(&self, x: f64) -> f64 {
        let u = (x - self.center) / self.sigma;
        self.amplitude * (-0.5 * u * u).exp()
    }

    fn as_array(&self) -> [f64; 3] {
        [self.amplitude, self.center, self.sigma]
    }

    fn from_array(p: [f64; 3]) -> Self {
        Self {
            amplitude: p[0],
            center: p[1],
            sigma: p[2],
        }
    }
}

/// Fit result: parameters when the fit converged, and the model evaluated at
/// every input `x` (all zeros on failure).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GaussianFit {
    /// Converged parameters
    pub params: Option<GaussianParams>,
    /// Model at each sample
    pub curve: Vec<f64>,
}

impl GaussianFit {
    fn failed(n: usize) -> Self {
        Self {
            params: None,
            curve: vec![0.0; n],
        }
    }
}

/// Fit a Gaussian to `(x, y)`.
///
/// The initial guess takes the sample with the largest magnitude as the peak,
/// so negative peaks (an inverted derivative) fit as well.
pub fn fit_gaussian(x: &[f64], y: &[f64]) -> GaussianFit {
    let n = x.len();
    if n < 3 || y.len() != n || x.iter().chain(y).any(|v| !v.is_finite()) {
        return GaussianFit::failed(n);
    }
    let Some(guess) = initial_guess(x, y) else {
        return GaussianFit::failed(n);
    };
    match levenberg_marquardt(x, y, guess) {
        Some(params) => GaussianFit {
            params: Some(params),
            curve: x.iter().map(|v| params.eval(*v)).collect(),
        },
        None => GaussianFit::failed(n),
    }
}

fn initial_guess(x: &[f64], y: &[f64]) -> Option<GaussianParams> {
    let (peak, _) = y
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))?;
    let amplitude = y[peak];
    if amplitude == 0.0 {
        return None;
    }
    let center = x[peak];

    // Width from the samples above half height, FWHM = 2.3548 sigma.
    let above: Vec<f64> = x
        .iter()
        .zip(y)
        .filter(|(_, yv)| yv.abs() >= amplitude.abs() / 2.0)
        .map(|(xv, _)| *xv)
        .collect();
    let lo = above.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = above.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = x.iter().copied().fold(f64::NEG_INFINITY, f64::max)
        - x.iter().copied().fold(f64::INFINITY, f64::min);
    let mut sigma = (hi - lo) / 2.3548;
    if !(sigma > 0.0) {
        sigma = span / 6.0;
    }
    if !(sigma > 0.0) {
        return None;
    }
    Some(GaussianParams {
        amplitude,
        center,
        sigma,
    })
}

fn cost(x: &[f64], y: &[f64], p: &GaussianParams) -> f64 {
    x.iter()
        .zip(y)
        .map(|(xv, yv)| (yv - p.eval(*xv)).powi(2))
        .sum()
}

fn levenberg_marquardt(x: &[f64], y: &[f64], guess: GaussianParams) -> Option<GaussianParams> {
    let mut p = guess;
    let mut current = cost(x, y, &p);
    let mut lambda = 1e-3;

    for _ in 0..MAX_ITERATIONS {
        // Normal equations J^T J and J^T r
        let mut jtj = [[0.0; 3]; 3];
        let mut jtr = [0.0; 3];
        for (xv, yv) in x.iter().zip(y) {
            let d = xv - p.center;
            let s2 = p.sigma * p.sigma;
            let e = (-(d * d) / (2.0 * s2)).exp();
            let j = [
                e,
                p.amplitude * e * d / s2,
                p.amplitude * e * d * d / (s2 * p.sigma),
            ];
            let r = yv - p.amplitude * e;
            for a in 0..3 {
                jtr[a] += j[a] * r;
                for b in 0..3 {
                    jtj[a][b] += j[a] * j[b];
                }
            }
        }

        loop {
            let mut damped = jtj;
            for (k, row) in damped.iter_mut().enumerate() {
                row[k] += lambda * jtj[k][k].max(1e-12);
            }
            let Some(delta) = solve3(damped, jtr) else {
                lambda *= 10.0;
                if lambda > MAX_DAMPING {
                    return None;
                }
                continue;
            };

            let base = p.as_array();
            let candidate = GaussianParams::from_array([
                base[0] + delta[0],
                base[1] + delta[1],
                base[2] + delta[2],
            ]);
            let next = cost(x, y, &candidate);
            if next.is_finite() && next <= current && candidate.sigma != 0.0 {
                let step = delta
                    .iter()
                    .zip(base)
                    .map(|(d, b)| (d / b.abs().max(1e-12)).abs())
                    .fold(0.0, f64::max);
                let improvement = (current - next) / current.max(f64::MIN_POSITIVE);
                p = candidate;
                current = next;
                lambda = (lambda / 10.0).max(1e-12);
                if step < TOLERANCE || improvement < TOLERANCE {
                    return finish(p);
                }
                break;
            }
            lambda *= 10.0;
            if lambda > MAX_DAMPING {
                // No downhill step left: the current point is a minimum.
                return finish(p);
            }
        }
    }
    None
}

fn finish(p: GaussianParams) -> Option<GaussianParams> {
    let p = GaussianParams {
        sigma: p.sigma.abs(),
        ..p
    };
    (p.amplitude.is_finite() && p.center.is_finite() && p.sigma.is_finite() && p.sigma > 0.0)
        .then_some(p)
}

/// Gaussian elimination with partial pivoting
fn solve3(mut a: [[f64; 3]; 3], mut b: [f64; 3]) -> Option<[f64; 3]> {
    for col in 0..3 {
        let pivot = (col..3).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-300 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..3 {
            let f = a[row][col] / a[col][col];
            for k in col..3 {
                a[row][k] -= f * a[col][k];
            }
            b[row] -= f * b[col];
        }
    }
    let mut x = [0.0; 3];
    for row in (0..3).rev() {
        let tail: f64 = (row + 1..3).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn samples(a: f64, c: f64, s: f64) -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..61).map(|i| -3.0 + 0.1 * i as f64).collect();
        let truth = GaussianParams {
            amplitude: a,
            center: c,
            sigma: s,
        };
        let y = x.iter().map(|v| truth.eval(*v)).collect();
        (x, y)
    }

    #[test]
    fn test_recovers_exact_gaussian() {
        let (x, y) = samples(250.0, 0.4, 0.5);
        let fit = fit_gaussian(&x, &y);
        let p = fit.params.unwrap();
        assert_relative_eq!(p.amplitude, 250.0, max_relative = 1e-4);
        assert_relative_eq!(p.center, 0.4, epsilon = 1e-4);
        assert_relative_eq!(p.sigma, 0.5, max_relative = 1e-4);
        assert_eq!(fit.curve.len(), x.len());
    }

    #[test]
    fn test_fits_negative_peak() {
        let (x, y) = samples(-40.0, -1.0, 0.3);
        let p = fit_gaussian(&x, &y).params.unwrap();
        assert_relative_eq!(p.amplitude, -40.0, max_relative = 1e-3);
        assert_relative_eq!(p.center, -1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_failure_degrades_to_zero_curve() {
        let fit = fit_gaussian(&[0.0, 1.0, 2.0, 3.0], &[0.0; 4]);
        assert!(fit.params.is_none());
        assert_eq!(fit.curve, vec![0.0; 4]);

        let short = fit_gaussian(&[0.0, 1.0], &[1.0, 2.0]);
        assert!(short.params.is_none());
        assert_eq!(short.curve.len(), 2);
    }

    #[test]
    fn test_solve3() {
        let a = [[2.0, 0.0, 0.0], [0.0, 3.0, 0.0], [1.0, 0.0, 1.0]];
        let x = solve3(a, [4.0, 9.0, 5.0]).unwrap();
        assert_eq!(x, [2.0, 3.0, 3.0]);
        assert!(solve3([[0.0; 3]; 3], [1.0, 1.0, 1.0]).is_none());
    }
}
