//! Natural cubic spline with real-root finding
//!
//! The FWHM estimate interpolates `y - max(y)/2` with this spline and looks for
//! its zero crossings. Construction never panics: invalid input is reported as
//! a [`SplineError`] so the caller can degrade to a zero-width result.

use thiserror::Error;

/// Sub-intervals per segment scanned for sign changes
const ROOT_SUBDIVISIONS: usize = 16;
/// Bisection iterations per bracketed root
const BISECTION_STEPS: usize = 60;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SplineError {
    #[error("x and y have different lengths ({0} vs {1})")]
    LengthMismatch(usize, usize),

    #[error("need at least 2 points, got {0}")]
    TooFewPoints(usize),

    #[error("x values must be strictly ascending")]
    NotAscending,

    #[error("non-finite input value")]
    NonFinite,
}

/// Piecewise cubic `S(x) = a + b(x-xi) + c(x-xi)² + d(x-xi)³` through every
/// input point, with zero second derivative at both ends.
#[derive(Debug, Clone)]
pub struct CubicSpline {
    x: Vec<f64>,
    y: Vec<f64>,
    coeffs: Vec<[f64; 4]>,
}

impl CubicSpline {
    /// Fit a spline through `(x, y)`; `x` must be strictly ascending.
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Result<Self, SplineError> {
        if x.len() != y.len() {
            return Err(SplineError::LengthMismatch(x.len(), y.len()));
        }
        if x.len() < 2 {
            return Err(SplineError::TooFewPoints(x.len()));
        }
        if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
            return Err(SplineError::NonFinite);
        }
        if x.windows(2).any(|w| w[1] <= w[0]) {
            return Err(SplineError::NotAscending);
        }

        let n = x.len();
        let mut spline = CubicSpline {
            x,
            y,
            coeffs: vec![[0.0; 4]; n - 1],
        };
        spline.compute_coefficients();
        Ok(spline)
    }

    /// Thomas algorithm on the tridiagonal system for the second derivatives.
    fn compute_coefficients(&mut self) {
        let n = self.x.len();
        let h: Vec<f64> = self.x.windows(2).map(|w| w[1] - w[0]).collect();

        let mut alpha = vec![0.0; n - 1];
        for i in 1..n - 1 {
            alpha[i] = (3.0 / h[i]) * (self.y[i + 1] - self.y[i])
                - (3.0 / h[i - 1]) * (self.y[i] - self.y[i - 1]);
        }

        let mut l = vec![1.0; n];
        let mut mu = vec![0.0; n];
        let mut z = vec![0.0; n];
        for i in 1..n - 1 {
            l[i] = 2.0 * (self.x[i + 1] - self.x[i - 1]) - h[i - 1] * mu[i - 1];
            mu[i] = h[i] / l[i];
            z[i] = (alpha[i] - h[i - 1] * z[i - 1]) / l[i];
        }

        let mut c = vec![0.0; n];
        for j in (0..n - 1).rev() {
            c[j] = z[j] - mu[j] * c[j + 1];
            let b = (self.y[j + 1] - self.y[j]) / h[j] - h[j] * (c[j + 1] + 2.0 * c[j]) / 3.0;
            let d = (c[j + 1] - c[j]) / (3.0 * h[j]);
            self.coeffs[j] = [self.y[j], b, c[j], d];
        }
    }

    /// Interpolated value; clamps to the end values outside the data range.
    pub fn evaluate(&self, x: f64) -> f64 {
        let last = self.x.len() - 1;
        if x <= self.x[0] {
            return self.y[0];
        }
        if x >= self.x[last] {
            return self.y[last];
        }
        let segment = self.find_segment(x);
        eval_segment(&self.coeffs[segment], x - self.x[segment])
    }

    fn find_segment(&self, x: f64) -> usize {
        let mut left = 0;
        let mut right = self.x.len() - 1;
        while left < right - 1 {
            let mid = (left + right) / 2;
            if x < self.x[mid] {
                right = mid;
            } else {
                left = mid;
            }
        }
        left
    }

    /// Real roots inside the data range, ascending.
    ///
    /// Each segment is scanned for sign changes and every bracket is refined by
    /// bisection. Tangential double roots without a sign change are not
    /// reported.
    pub fn roots(&self) -> Vec<f64> {
        let mut roots: Vec<f64> = Vec::new();
        let mut push = |r: f64| {
            let tolerance = 1e-9 * r.abs().max(1.0);
            if roots.last().map_or(true, |last| (r - last).abs() > tolerance) {
                roots.push(r);
            }
        };

        for (i, seg) in self.coeffs.iter().enumerate() {
            let x0 = self.x[i];
            let h = self.x[i + 1] - x0;
            let mut t_prev = 0.0;
            let mut v_prev = eval_segment(seg, 0.0);
            if v_prev == 0.0 {
                push(x0);
            }
            for k in 1..=ROOT_SUBDIVISIONS {
                let t = h * k as f64 / ROOT_SUBDIVISIONS as f64;
                let v = eval_segment(seg, t);
                if v == 0.0 {
                    push(x0 + t);
                } else if v_prev != 0.0 && v.signum() != v_prev.signum() {
                    push(x0 + bisect(seg, t_prev, t));
                }
                t_prev = t;
                v_prev = v;
            }
        }
        roots
    }

    /// Knots of the spline
    pub fn knots(&self) -> &[f64] {
        &self.x
    }
}

fn eval_segment(seg: &[f64; 4], t: f64) -> f64 {
    let [a, b, c, d] = *seg;
    a + t * (b + t * (c + t * d))
}

fn bisect(seg: &[f64; 4], mut lo: f64, mut hi: f64) -> f64 {
    let mut f_lo = eval_segment(seg, lo);
    for _ in 0..BISECTION_STEPS {
        let mid = 0.5 * (lo + hi);
        let f_mid = eval_segment(seg, mid);
        if f_mid == 0.0 {
            return mid;
        }
        if f_mid.signum() == f_lo.signum() {
            lo = mid;
            f_lo = f_mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_passes_through_points() {
        let x = vec![0.0, 1.0, 2.0, 3.0];
        let y = vec![0.0, 1.0, 4.0, 9.0];
        let spline = CubicSpline::new(x.clone(), y.clone()).unwrap();
        for (xi, yi) in x.iter().zip(&y) {
            assert_relative_eq!(spline.evaluate(*xi), *yi, epsilon = 1e-12);
        }
        assert_eq!(spline.evaluate(-5.0), 0.0);
        assert_eq!(spline.evaluate(10.0), 9.0);
    }

    #[test]
    fn test_linear_data_is_reproduced() {
        let x: Vec<f64> = (0..6).map(f64::from).collect();
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v - 3.0).collect();
        let spline = CubicSpline::new(x, y).unwrap();
        assert_relative_eq!(spline.evaluate(2.25), 1.5, epsilon = 1e-12);
        let roots = spline.roots();
        assert_eq!(roots.len(), 1);
        assert_relative_eq!(roots[0], 1.5, epsilon = 1e-9);
    }

    #[test]
    fn test_roots_of_a_bump() {
        let x: Vec<f64> = (0..21).map(|i| -2.0 + 0.2 * i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 1.0 - v * v).collect();
        let roots = CubicSpline::new(x, y).unwrap().roots();
        assert_eq!(roots.len(), 2);
        assert_relative_eq!(roots[0], -1.0, epsilon = 1e-3);
        assert_relative_eq!(roots[1], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_root_on_a_knot_is_reported_once() {
        let spline = CubicSpline::new(vec![0.0, 1.0, 2.0], vec![-1.0, 0.0, 1.0]).unwrap();
        assert_eq!(spline.roots(), vec![1.0]);
    }

    #[test]
    fn test_invalid_input() {
        assert_eq!(
            CubicSpline::new(vec![0.0], vec![1.0]).unwrap_err(),
            SplineError::TooFewPoints(1)
        );
        assert_eq!(
            CubicSpline::new(vec![1.0, 0.0], vec![1.0, 2.0]).unwrap_err(),
            SplineError::NotAscending
        );
        assert!(CubicSpline::new(vec![0.0, 1.0], vec![f64::NAN, 2.0]).is_err());
        assert!(CubicSpline::new(vec![0.0, 1.0], vec![1.0]).is_err());
    }
}
