//! A module for metrics computing squared distances between two batches of locations.
//!
//! The following metrics are implemented:
//! * scaled euclidean,
//! * poincaré (hyperbolic half-space).
//!
//! Kernels without an explicit metric use the unscaled euclidean squared distance
//! shared by the whole evaluation pass.

use crate::assembly::Evaluator;
use crate::dual::{Dual, Dual1, Dual2, Scalar};
use crate::errors::{GpError, Result};
use crate::param::{Bound, ParamRef, Parameter};
use crate::utils::per_axis_dist2;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use std::fmt;
use std::sync::Arc;

/// Signature of a coordinate transform: per-axis coordinate columns in, transformed columns out
pub type AxisFn = dyn Fn(&[ArrayView1<f64>]) -> Vec<Array1<f64>> + Send + Sync;

/// A transform applied to locations before computing a distance
#[derive(Clone)]
pub struct CoordinateTransform(Arc<AxisFn>);

impl CoordinateTransform {
    /// Wraps a function mapping coordinate columns to transformed coordinate columns
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[ArrayView1<f64>]) -> Vec<Array1<f64>> + Send + Sync + 'static,
    {
        CoordinateTransform(Arc::new(f))
    }

    /// Identity transform
    pub fn identity() -> Self {
        CoordinateTransform::new(|cols: &[ArrayView1<f64>]| {
            cols.iter().map(|c| c.to_owned()).collect()
        })
    }

    /// Transformed locations as a (n, ncols) matrix
    pub fn apply(&self, locs: &ArrayView2<f64>) -> Result<Array2<f64>> {
        let cols: Vec<ArrayView1<f64>> = locs.columns().into_iter().collect();
        let out = (self.0)(&cols);
        stack_columns(locs.nrows(), out)
    }
}

impl fmt::Debug for CoordinateTransform {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CoordinateTransform")
    }
}

/// Stacks per-point columns into a (n, ncols) matrix, columns of length 1 being broadcast
pub(crate) fn stack_columns(n: usize, cols: Vec<Array1<f64>>) -> Result<Array2<f64>> {
    let mut res = Array2::zeros((n, cols.len()));
    for (k, col) in cols.iter().enumerate() {
        match col.len() {
            1 => res.column_mut(k).fill(col[0]),
            l if l == n => res.column_mut(k).assign(col),
            l => {
                return Err(GpError::InvalidValueError(format!(
                    "Column {k} has {l} values, expected {n} or 1"
                )))
            }
        }
    }
    Ok(res)
}

/// Squared distance nodes
#[derive(Clone, Debug)]
pub enum Metric {
    /// `sum_c scale[c]^2 * (x1[c] - x2[c])^2`
    Euclidean {
        /// One scale per axis, a null literal scale discards the axis
        scale: Vec<ParamRef>,
    },
    /// Hyperbolic distance of the upper half-space model. With `z = x'[0] + zoff`
    /// where `x'` are the transformed (and scaled) coordinates:
    /// `d2 = (2 * zoff * asinh(0.5 * sqrt(|x1' - x2'|^2 / (z1 * z2))))^2`
    Poincare {
        /// Coordinate transform
        xform: CoordinateTransform,
        /// Offset of the first transformed axis
        zoff: ParamRef,
        /// Optional per-axis scale of transformed coordinates
        scale: Option<Vec<ParamRef>>,
    },
}

impl Metric {
    /// Parameters referenced by this metric
    pub fn parameters(&self) -> Vec<Parameter> {
        match self {
            Metric::Euclidean { scale } => scale
                .iter()
                .filter_map(|s| s.declare(Bound::positive()))
                .collect(),
            Metric::Poincare { zoff, scale, .. } => zoff
                .declare(Bound::positive())
                .into_iter()
                .chain(
                    scale
                        .iter()
                        .flatten()
                        .filter_map(|s| s.declare(Bound::positive())),
                )
                .collect(),
        }
    }

    pub(crate) fn evaluate(&self, ev: &Evaluator) -> Result<Dual2> {
        match self {
            Metric::Euclidean { scale } => {
                let scale = resolve_scale(ev, scale)?;
                scaled_sum(ev.per_axis_dist2(), &scale)
            }
            Metric::Poincare { xform, zoff, scale } => {
                let x1 = xform.apply(&ev.locs1())?;
                let x2 = xform.apply(&ev.locs2())?;
                if x1.ncols() == 0 {
                    return Err(GpError::InvalidValueError(
                        "Poincare transform returned no coordinate".to_string(),
                    ));
                }
                let scale = match scale {
                    Some(scale) => resolve_scale(ev, scale)?,
                    None => vec![Scalar::constant(1.); x1.ncols()],
                };
                let zoff = ev.param(zoff)?;
                poincare(&x1, &x2, &zoff, &scale)
            }
        }
    }
}

fn resolve_scale(ev: &Evaluator, scale: &[ParamRef]) -> Result<Vec<Scalar>> {
    scale.iter().map(|s| ev.param(s)).collect()
}

/// `sum_c scale[c]^2 * pa_d2[.., .., c]`
fn scaled_sum(pa_d2: &Array3<f64>, scale: &[Scalar]) -> Result<Dual2> {
    let (n1, n2, ndim) = pa_d2.dim();
    if scale.len() != ndim {
        return Err(GpError::InvalidValueError(format!(
            "Metric scale has {} components but locations have {ndim} dimensions",
            scale.len()
        )));
    }
    let mut d2 = Dual::constant(Array2::zeros((n1, n2)));
    for (c, s) in scale.iter().enumerate() {
        let pa_c = pa_d2.index_axis(Axis(2), c);
        d2.value.scaled_add(s.value * s.value, &pa_c);
        if !s.tangents.is_empty() {
            d2.accumulate_scalar(&pa_c.mapv(|v| 2. * s.value * v), s);
        }
    }
    Ok(d2)
}

fn poincare(x1: &Array2<f64>, x2: &Array2<f64>, zoff: &Scalar, scale: &[Scalar]) -> Result<Dual2> {
    let d2 = scaled_sum(&per_axis_dist2(x1, x2), scale)?;

    // z = scale[0] * (x'[0] + zoff)
    let s0 = &scale[0];
    let u1: Dual1 = Dual::constant(x1.column(0).to_owned()).shift(zoff);
    let u2: Dual1 = Dual::constant(x2.column(0).to_owned()).shift(zoff);
    let zz = u1.outer(&u2).scale(&s0.mul(s0));

    let q = d2.div(&zz);
    let h = q.map(
        |q| (0.5 * q.max(0.).sqrt()).asinh(),
        |q| {
            if q > 0. {
                0.25 / (q.sqrt() * (1. + 0.25 * q).sqrt())
            } else {
                0.
            }
        },
    );
    let zs = zoff.mul(s0);
    Ok(h.mul(&h).scale(&zs.mul(&zs).scale(4.)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use ndarray::array;

    fn is_distance_matrix(d: &Array2<f64>) -> bool {
        let n = d.nrows();
        (0..n).all(|i| {
            (0..n).all(|j| (0..n).all(|k| d[[i, j]] <= d[[i, k]] + d[[k, j]] + 1e-9))
        })
    }

    #[test]
    fn test_scaled_sum() {
        let pa = per_axis_dist2(&array![[0., 0.], [1., 2.]], &array![[0., 0.], [1., 2.]]);
        let scale = vec![Scalar::constant(2.), Scalar::variable("zscale", 0.5)];
        let d2 = scaled_sum(&pa, &scale).unwrap();
        assert_abs_diff_eq!(d2.value, array![[0., 5.], [5., 0.]]);
        assert_abs_diff_eq!(d2.tangents["zscale"], array![[0., 4.], [4., 0.]]);
        assert!(scaled_sum(&pa, &scale[..1]).is_err());
    }

    #[test]
    fn test_poincare_is_a_distance() {
        let x = array![[0.1, 0.], [0.5, 0.3], [1.2, -0.4], [2.0, 1.0], [0.3, 2.5]];
        let zoff = Scalar::constant(1.);
        let scale = vec![Scalar::constant(1.); 2];
        let d2 = poincare(&x, &x, &zoff, &scale).unwrap().value;
        for i in 0..x.nrows() {
            assert_abs_diff_eq!(d2[[i, i]], 0.);
        }
        assert_abs_diff_eq!(d2, d2.t(), epsilon = 1e-12);
        assert!(is_distance_matrix(&d2.mapv(f64::sqrt)));
    }

    #[test]
    fn test_poincare_vertical_distance() {
        // Along the vertical axis the hyperbolic distance is zoff * ln(z2 / z1)
        let x1 = array![[0., 0.]];
        let x2 = array![[1., 0.]];
        let zoff = Scalar::constant(2.);
        let d2 = poincare(&x1, &x2, &zoff, &vec![Scalar::constant(1.); 2]).unwrap();
        let expected = 2. * (3f64 / 2.).ln();
        assert_abs_diff_eq!(d2.value[[0, 0]].sqrt(), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_poincare_derivative() {
        let x1 = array![[0.2, 0.1], [1.0, -0.5]];
        let x2 = array![[0.4, 0.3], [0.1, 0.9], [1.5, 0.0]];
        let scale = |s: f64| vec![Scalar::variable("s0", s), Scalar::constant(1.3)];
        let (z, s) = (1.5, 0.8);
        let d = poincare(&x1, &x2, &Scalar::variable("zoff", z), &scale(s)).unwrap();
        for i in 0..2 {
            for j in 0..3 {
                let entry = |p: &Array1<f64>| {
                    poincare(&x1, &x2, &Scalar::constant(p[0]), &scale(p[1]))
                        .unwrap()
                        .value[[i, j]]
                };
                let grad = array![z, s].central_diff(&entry);
                assert_abs_diff_eq!(d.tangents["zoff"][[i, j]], grad[0], epsilon = 1e-5);
                assert_abs_diff_eq!(d.tangents["s0"][[i, j]], grad[1], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_coordinate_transform() {
        let xform = CoordinateTransform::new(|cols: &[ArrayView1<f64>]| {
            vec![cols[1].mapv(|v| v * 2.), Array1::from_elem(1, 7.)]
        });
        let locs = array![[1., 2.], [3., 4.]];
        let out = xform.apply(&locs.view()).unwrap();
        assert_abs_diff_eq!(out, array![[4., 7.], [8., 7.]]);
        let id = CoordinateTransform::identity().apply(&locs.view()).unwrap();
        assert_abs_diff_eq!(id, locs);
    }
}
