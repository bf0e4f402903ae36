//! Position sequencer
//!
//! Builds the ordered absolute target positions of a sweep. The endpoint of a
//! range is always sampled, even when `stop - start` is not an integer
//! multiple of the step.
//!
//! For 2D maps `device` is the inner (fast) axis and `device2` the outer
//! (slow) axis, so the slow axis moves once per inner sweep. Result tuples and
//! log columns follow the same order: inner position first.

use crate::error::{ScanError, ScanResult};
use crate::scan::params::{ScanDim, ScanParams};
use serde::{Deserialize, Serialize};

/// Relative tolerance used to decide that a generated value already is `stop`.
const ENDPOINT_TOLERANCE: f64 = 1e-9;

/// Ordered positions from `start` to `stop`.
///
/// `step` is a magnitude; the direction is taken from `stop - start`. The
/// first element is `start` and the last element is `stop` exactly.
pub fn build_sequence(start: f64, stop: f64, step: f64) -> Vec<f64> {
    let step = step.abs();
    if start == stop {
        return vec![start];
    }
    if !(step > 0.0) || !step.is_finite() {
        return vec![start, stop];
    }

    let direction = (stop - start).signum();
    let tolerance = step * ENDPOINT_TOLERANCE;
    let mut positions = Vec::new();
    let mut i = 0_u64;
    loop {
        // Multiply instead of accumulating so rounding error stays bounded.
        let value = start + direction * step * i as f64;
        if (stop - value) * direction <= tolerance {
            break;
        }
        positions.push(value);
        i += 1;
    }
    positions.push(stop);
    positions
}

/// Bin edges for area-mapped display: every position shifted by half a step.
///
/// Returns `positions.len() + 1` edges. A single position gets edges at
/// `p ± step/2`.
pub fn bin_edges(positions: &[f64], step: f64) -> Vec<f64> {
    match positions {
        [] => Vec::new(),
        [only] => {
            let half = step.abs() / 2.0;
            vec![only - half, only + half]
        }
        [first, second, ..] => {
            let n = positions.len();
            let mut edges = Vec::with_capacity(n + 1);
            edges.push(first - (second - first) / 2.0);
            for pair in positions.windows(2) {
                edges.push((pair[0] + pair[1]) / 2.0);
            }
            let (prev, last) = (positions[n - 2], positions[n - 1]);
            edges.push(last + (last - prev) / 2.0);
            edges
        }
    }
}

/// Positions of one axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisSweep {
    /// Axis name in the device database
    pub device: String,
    /// Ordered absolute targets
    pub positions: Vec<f64>,
    /// Signed step
    pub step: f64,
}

impl AxisSweep {
    fn new(device: &str, start: f64, stop: f64, step: f64) -> Self {
        let signed = if stop < start { -step.abs() } else { step.abs() };
        Self {
            device: device.to_string(),
            positions: build_sequence(start, stop, step),
            step: signed,
        }
    }

    /// Display bin edges of this axis
    pub fn edges(&self) -> Vec<f64> {
        bin_edges(&self.positions, self.step)
    }
}

/// One acquisition point in scan order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridPoint {
    /// Running index over the whole scan
    pub index: usize,
    /// Index along the inner axis
    pub inner_index: usize,
    /// Index along the outer axis (2D only)
    pub outer_index: Option<usize>,
    /// Inner axis target
    pub inner: f64,
    /// Outer axis target (2D only)
    pub outer: Option<f64>,
}

/// The full acquisition order of one scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanGrid {
    /// Fast axis (`device`)
    pub inner: AxisSweep,
    /// Slow axis (`device2`), 2D only
    pub outer: Option<AxisSweep>,
}

impl ScanGrid {
    /// Build the grid for a validated request
    pub fn from_params(params: &ScanParams) -> ScanResult<Self> {
        let inner = AxisSweep::new(&params.device, params.start, params.stop, params.step);
        let outer = match params.scan_dim {
            ScanDim::OneD => None,
            ScanDim::TwoD => {
                let (device2, start2, stop2, step2) = params.outer().ok_or_else(|| {
                    ScanError::InvalidParams(
                        "2D scans need device2, start2, stop2 and step2".to_string(),
                    )
                })?;
                Some(AxisSweep::new(device2, start2, stop2, step2))
            }
        };
        Ok(Self { inner, outer })
    }

    /// Whether this is a 2D map
    pub fn is_2d(&self) -> bool {
        self.outer.is_some()
    }

    /// Total number of measured points
    pub fn len(&self) -> usize {
        let outer = self.outer.as_ref().map_or(1, |o| o.positions.len());
        self.inner.positions.len() * outer
    }

    /// Whether the grid has no points
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Points in acquisition order: the outer axis is held while the inner
    /// axis sweeps its full range.
    pub fn points(&self) -> Vec<GridPoint> {
        let mut points = Vec::with_capacity(self.len());
        match &self.outer {
            None => {
                for (i, &inner) in self.inner.positions.iter().enumerate() {
                    points.push(GridPoint {
                        index: i,
                        inner_index: i,
                        outer_index: None,
                        inner,
                        outer: None,
                    });
                }
            }
            Some(outer) => {
                for (j, &slow) in outer.positions.iter().enumerate() {
                    for (i, &fast) in self.inner.positions.iter().enumerate() {
                        points.push(GridPoint {
                            index: points.len(),
                            inner_index: i,
                            outer_index: Some(j),
                            inner: fast,
                            outer: Some(slow),
                        });
                    }
                }
            }
        }
        points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_even_range_includes_both_endpoints() {
        assert_eq!(build_sequence(0.0, 2.0, 0.5), vec![0.0, 0.5, 1.0, 1.5, 2.0]);
    }

    #[test]
    fn test_uneven_range_appends_stop() {
        let seq = build_sequence(0.0, 1.0, 0.3);
        assert_eq!(seq.len(), 5);
        assert_relative_eq!(seq[3], 0.9, epsilon = 1e-12);
        assert_eq!(*seq.last().unwrap(), 1.0);
    }

    #[test]
    fn test_descending_range_runs_start_to_stop() {
        assert_eq!(build_sequence(2.0, 0.0, 0.5), vec![2.0, 1.5, 1.0, 0.5, 0.0]);
        // A negative step is treated as a magnitude.
        assert_eq!(build_sequence(2.0, 0.0, -0.5), vec![2.0, 1.5, 1.0, 0.5, 0.0]);
    }

    #[test]
    fn test_zero_length_range() {
        assert_eq!(build_sequence(1.25, 1.25, 0.1), vec![1.25]);
    }

    #[test]
    fn test_step_larger_than_range() {
        assert_eq!(build_sequence(0.0, 1.0, 5.0), vec![0.0, 1.0]);
    }

    #[test]
    fn test_bin_edges_shift_by_half_step() {
        let edges = bin_edges(&[0.0, 0.5, 1.0], 0.5);
        assert_eq!(edges, vec![-0.25, 0.25, 0.75, 1.25]);
        assert_eq!(bin_edges(&[3.0], 1.0), vec![2.5, 3.5]);
        assert!(bin_edges(&[], 1.0).is_empty());
    }

    fn grid_params() -> ScanParams {
        ScanParams::line("m1", 0.0, 1.0, 0.5)
            .with_outer("m2", 0.0, 1.0, 1.0)
            .with_timer("t1")
            .with_scalers(&["i0"])
    }

    #[test]
    fn test_two_d_outer_axis_is_device2() {
        let grid = ScanGrid::from_params(&grid_params()).unwrap();
        assert_eq!(grid.len(), 6);
        let points = grid.points();
        let outers: Vec<f64> = points.iter().map(|p| p.outer.unwrap()).collect();
        assert_eq!(outers, vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let inners: Vec<f64> = points.iter().map(|p| p.inner).collect();
        assert_eq!(inners, vec![0.0, 0.5, 1.0, 0.0, 0.5, 1.0]);
        assert_eq!(grid.outer.as_ref().unwrap().device, "m2");
    }

    #[test]
    fn test_swapping_axes_transposes_the_sampled_set() {
        let params = grid_params();
        let mut swapped = params.clone();
        swapped.device = "m2".into();
        swapped.start = 0.0;
        swapped.stop = 1.0;
        swapped.step = 1.0;
        swapped.device2 = Some("m1".into());
        swapped.start2 = Some(0.0);
        swapped.stop2 = Some(1.0);
        swapped.step2 = Some(0.5);

        // Each sample as (m1, m2).
        let mut a: Vec<(f64, f64)> = ScanGrid::from_params(&params)
            .unwrap()
            .points()
            .iter()
            .map(|p| (p.inner, p.outer.unwrap()))
            .collect();
        let mut b: Vec<(f64, f64)> = ScanGrid::from_params(&swapped)
            .unwrap()
            .points()
            .iter()
            .map(|p| (p.outer.unwrap(), p.inner))
            .collect();
        assert_ne!(a, b);
        a.sort_by(|x, y| x.partial_cmp(y).unwrap());
        b.sort_by(|x, y| x.partial_cmp(y).unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn test_one_d_grid_has_no_outer_axis() {
        let params = ScanParams::line("m1", 0.0, 2.0, 0.5);
        let grid = ScanGrid::from_params(&params).unwrap();
        assert!(!grid.is_2d());
        assert_eq!(grid.len(), 5);
        assert!(grid.points().iter().all(|p| p.outer.is_none()));
    }

    proptest! {
        #[test]
        fn prop_sequence_is_monotonic_with_exact_endpoints(
            start in -100.0f64..100.0,
            stop in -100.0f64..100.0,
            step in 0.01f64..50.0,
        ) {
            let seq = build_sequence(start, stop, step);
            prop_assert_eq!(seq[0], start);
            prop_assert_eq!(*seq.last().unwrap(), stop);
            let direction = (stop - start).signum();
            for pair in seq.windows(2) {
                prop_assert!((pair[1] - pair[0]) * direction > 0.0);
            }
        }

        #[test]
        fn prop_two_d_holds_outer_axis_across_inner_sweep(
            stop in 0.1f64..5.0,
            step in 0.05f64..1.0,
            stop2 in 0.1f64..5.0,
            step2 in 0.05f64..1.0,
        ) {
            let params = ScanParams::line("m1", 0.0, stop, step)
                .with_outer("m2", 0.0, stop2, step2);
            let grid = ScanGrid::from_params(&params).unwrap();
            let inner_len = grid.inner.positions.len();
            let points = grid.points();
            prop_assert_eq!(points.len(), grid.len());
            for chunk in points.chunks(inner_len) {
                let outer = chunk[0].outer;
                prop_assert!(chunk.iter().all(|p| p.outer == outer));
            }
        }
    }
}
