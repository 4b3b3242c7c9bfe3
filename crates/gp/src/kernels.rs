//! A module for covariance functions (kernels) of gaussian processes.
//!
//! The following kernels are implemented:
//! * squared exponential,
//! * gamma exponential,
//! * wiener (brownian motion),
//! * integrated squared exponential,
//! * integrated exponential,
//! * noise,
//! * delta,
//! * trend prior,
//!
//! together with combinators: sum, product, mixture and per-category block diagonal (mux).
//!
//! Every kernel evaluates to a matrix of shape (n1, n2) for two location batches
//! of sizes n1 and n2, derivatives with respect to the parameters it references
//! being propagated when the evaluation requests them.

use crate::assembly::Evaluator;
use crate::dual::{Dual, Dual1, Dual2, Scalar};
use crate::errors::{GpError, Result};
use crate::graph::{resolve, Graph, KernelId, MetricId, NodeId};
use crate::mean_models::{check_categories, check_sorted_categories, resolve_weights, Featurizer};
use crate::param::{Bound, ParamRef, ParamValues, Parameter};
use crate::utils::{bincount, start_indices};
use ndarray::{s, Array1, Array2, Axis, Zip};
use std::f64::consts::PI;

/// Covariance function nodes
#[derive(Clone, Debug)]
pub enum Kernel {
    /// `sill * exp(-0.5 * d2 / range^2)`
    SquaredExponential {
        /// Variance
        sill: ParamRef,
        /// Correlation length
        range: ParamRef,
        /// Squared distance, unscaled euclidean if none
        metric: Option<MetricId>,
    },
    /// `sill * exp(-(d2 / range^2)^(gamma / 2))`
    GammaExponential {
        /// Variance
        sill: ParamRef,
        /// Correlation length
        range: ParamRef,
        /// Shape exponent in `(0, 2]`
        gamma: ParamRef,
        /// Squared distance, unscaled euclidean if none
        metric: Option<MetricId>,
    },
    /// `min(x1, x2) - start` along `axis`
    Wiener {
        /// Axis of the process
        axis: usize,
        /// Origin of the process
        start: f64,
    },
    /// Covariance of `t -> int_start^t f` where `f` has a unit sill squared exponential covariance along `axis`
    IntSquaredExponential {
        /// Axis of integration
        axis: usize,
        /// Origin of integration
        start: f64,
        /// Correlation length of the integrand
        range: ParamRef,
    },
    /// Covariance of `t -> int_start^t f` where `f` has a unit sill exponential covariance along `axis`
    IntExponential {
        /// Axis of integration
        axis: usize,
        /// Origin of integration
        start: f64,
        /// Correlation length of the integrand
        range: ParamRef,
    },
    /// `nugget` between a point and itself
    Noise {
        /// Noise variance
        nugget: ParamRef,
    },
    /// `dsill` between points with identical coordinates along `axes`
    Delta {
        /// Variance
        dsill: ParamRef,
        /// Compared axes, all axes if none
        axes: Option<Vec<usize>>,
    },
    /// `alpha * F(x1) . F(x2)`
    TrendPrior {
        /// Computes `F(x)`
        featurizer: Featurizer,
        /// Prior variance of trend coefficients
        alpha: ParamRef,
    },
    /// Sum of kernels
    Sum(Vec<KernelId>),
    /// Elementwise product of kernels
    Product(Vec<KernelId>),
    /// `sum_h C_h(x_i, x_j) * weights[cat_i][h] * weights[cat_j][h]`
    Mix {
        /// Latent kernels
        inputs: Vec<KernelId>,
        /// One row per category, one column per input
        weights: Vec<Vec<ParamRef>>,
    },
    /// Block diagonal covariance, category `c` being modeled by `inputs[c]`
    Mux(Vec<KernelId>),
}

impl Kernel {
    /// Parameters referenced by the formal arguments of this node
    pub fn parameters(&self) -> Vec<Parameter> {
        let positive = |p: &ParamRef| p.declare(Bound::positive());
        match self {
            Kernel::SquaredExponential { sill, range, .. } => {
                [sill, range].into_iter().filter_map(positive).collect()
            }
            Kernel::GammaExponential {
                sill, range, gamma, ..
            } => [sill, range]
                .into_iter()
                .filter_map(positive)
                .chain(gamma.declare(Bound::new(0., 2.)))
                .collect(),
            Kernel::IntSquaredExponential { range, .. } | Kernel::IntExponential { range, .. } => {
                positive(range).into_iter().collect()
            }
            Kernel::Noise { nugget } => positive(nugget).into_iter().collect(),
            Kernel::Delta { dsill, .. } => positive(dsill).into_iter().collect(),
            Kernel::TrendPrior { alpha, .. } => positive(alpha).into_iter().collect(),
            Kernel::Mix { weights, .. } => weights
                .iter()
                .flatten()
                .filter_map(|w| w.declare(Bound::unbounded()))
                .collect(),
            Kernel::Wiener { .. } | Kernel::Sum(_) | Kernel::Product(_) | Kernel::Mux(_) => {
                vec![]
            }
        }
    }

    /// Metric node used by this kernel if any
    pub fn metric(&self) -> Option<MetricId> {
        match self {
            Kernel::SquaredExponential { metric, .. } | Kernel::GammaExponential { metric, .. } => {
                *metric
            }
            _ => None,
        }
    }

    /// Input kernels
    pub fn inputs(&self) -> Vec<KernelId> {
        match self {
            Kernel::Sum(parts) | Kernel::Product(parts) | Kernel::Mux(parts) => parts.clone(),
            Kernel::Mix { inputs, .. } => inputs.clone(),
            _ => vec![],
        }
    }

    /// Input nodes: metric and kernels
    pub fn children(&self) -> Vec<NodeId> {
        self.metric()
            .map(|m| m.0)
            .into_iter()
            .chain(self.inputs().into_iter().map(|k| k.0))
            .collect()
    }

    /// Regularization penalty: range of stationary kernels, summed over combinators
    pub fn reg(&self, graph: &Graph, params: &ParamValues, with_grad: bool) -> Result<Scalar> {
        match self {
            Kernel::SquaredExponential { range, .. } | Kernel::GammaExponential { range, .. } => {
                resolve(range, params, with_grad)
            }
            Kernel::Sum(_) | Kernel::Product(_) | Kernel::Mix { .. } | Kernel::Mux(_) => {
                self.inputs()
                    .into_iter()
                    .try_fold(Scalar::constant(0.), |acc, k| -> Result<Scalar> {
                        Ok(acc.add(&graph.regularization(k, params, with_grad)?))
                    })
            }
            _ => Ok(Scalar::constant(0.)),
        }
    }

    pub(crate) fn evaluate(&self, ev: &Evaluator) -> Result<Dual2> {
        let (n1, n2) = (ev.locs1().nrows(), ev.locs2().nrows());
        match self {
            Kernel::SquaredExponential {
                sill,
                range,
                metric,
            } => {
                let d2 = ev.distance(*metric)?;
                Ok(squared_exponential(
                    &d2,
                    &ev.param(sill)?,
                    &ev.param(range)?,
                ))
            }
            Kernel::GammaExponential {
                sill,
                range,
                gamma,
                metric,
            } => {
                let d2 = ev.distance(*metric)?;
                Ok(gamma_exponential(
                    &d2,
                    &ev.param(sill)?,
                    &ev.param(range)?,
                    &ev.param(gamma)?,
                ))
            }
            Kernel::Wiener { axis, start } => {
                let (x1, x2) = axis_columns(ev, *axis)?;
                let k = Array2::from_shape_fn((n1, n2), |(i, j)| x1[i].min(x2[j]) - start);
                Ok(Dual::constant(k))
            }
            Kernel::IntSquaredExponential { axis, start, range } => {
                let (x1, x2) = axis_columns(ev, *axis)?;
                let r = ev.param(range)?;
                Ok(integrated(&x1, &x2, *start, &r, int_squared_exponential))
            }
            Kernel::IntExponential { axis, start, range } => {
                let (x1, x2) = axis_columns(ev, *axis)?;
                let r = ev.param(range)?;
                Ok(integrated(&x1, &x2, *start, &r, int_exponential))
            }
            Kernel::Noise { nugget } => {
                let offset = ev.offset();
                let mask = Array2::from_shape_fn((n1, n2), |(i, j)| {
                    if i as isize == j as isize + offset {
                        1.
                    } else {
                        0.
                    }
                });
                Ok(Dual::constant(mask).scale(&ev.param(nugget)?))
            }
            Kernel::Delta { dsill, axes } => {
                let pa_d2 = ev.per_axis_dist2();
                let ndim = pa_d2.dim().2;
                let axes: Vec<usize> = match axes {
                    Some(axes) => axes.clone(),
                    None => (0..ndim).collect(),
                };
                if let Some(a) = axes.iter().find(|&&a| a >= ndim) {
                    return Err(GpError::InvalidValueError(format!(
                        "Delta kernel axis {a} out of range for {ndim} dimensions"
                    )));
                }
                let mut d2 = Array2::<f64>::zeros((n1, n2));
                for &a in axes.iter() {
                    d2 += &pa_d2.index_axis(Axis(2), a);
                }
                let mask = d2.mapv(|v| if v == 0. { 1. } else { 0. });
                Ok(Dual::constant(mask).scale(&ev.param(dsill)?))
            }
            Kernel::TrendPrior { featurizer, alpha } => {
                let f1 = featurizer.apply(&ev.locs1())?;
                let f2 = featurizer.apply(&ev.locs2())?;
                if f1.ncols() != f2.ncols() {
                    return Err(GpError::InvalidValueError(format!(
                        "Featurizer returned {} and {} features",
                        f1.ncols(),
                        f2.ncols()
                    )));
                }
                Ok(Dual::constant(f1.dot(&f2.t())).scale(&ev.param(alpha)?))
            }
            Kernel::Sum(parts) => {
                let mut res = Dual2::zeros(n1, n2);
                for part in parts {
                    res = res.add(&*ev.kernel(*part)?);
                }
                Ok(res)
            }
            Kernel::Product(parts) => {
                let mut res = Dual::constant(Array2::ones((n1, n2)));
                for part in parts {
                    res = res.mul(&*ev.kernel(*part)?);
                }
                Ok(res)
            }
            Kernel::Mix { inputs, weights } => {
                let weights = resolve_weights(ev, weights)?;
                check_categories(&ev.cats1(), weights.len())?;
                check_categories(&ev.cats2(), weights.len())?;
                let mut res = Dual2::zeros(n1, n2);
                for (h, input) in inputs.iter().enumerate() {
                    let column: Vec<Scalar> = weights.iter().map(|row| row[h].clone()).collect();
                    let w1 = Dual1::gather(&column, ev.cats1().iter().copied());
                    let w2 = Dual1::gather(&column, ev.cats2().iter().copied());
                    res = res.add(&ev.kernel(*input)?.mul(&w1.outer(&w2)));
                }
                Ok(res)
            }
            Kernel::Mux(inputs) => {
                let n = inputs.len();
                check_sorted_categories(&ev.cats1(), n)?;
                check_sorted_categories(&ev.cats2(), n)?;
                let counts1 = bincount(&ev.cats1(), n);
                let counts2 = bincount(&ev.cats2(), n);
                let starts1 = start_indices(&counts1);
                let starts2 = start_indices(&counts2);
                let mut res = Dual2::zeros(n1, n2);
                for (c, input) in inputs.iter().enumerate() {
                    if counts1[c] == 0 || counts2[c] == 0 {
                        continue;
                    }
                    let sub = ev.segment(
                        starts1[c]..starts1[c] + counts1[c],
                        starts2[c]..starts2[c] + counts2[c],
                        ev.offset() + starts2[c] as isize - starts1[c] as isize,
                    );
                    res.assign_block(starts1[c], starts2[c], &*sub.kernel(*input)?);
                }
                Ok(res)
            }
        }
    }
}

fn axis_columns(ev: &Evaluator, axis: usize) -> Result<(Array1<f64>, Array1<f64>)> {
    let ndim = ev.locs1().ncols();
    if axis >= ndim {
        return Err(GpError::InvalidValueError(format!(
            "Kernel axis {axis} out of range for {ndim} dimensions"
        )));
    }
    Ok((
        ev.locs1().column(axis).to_owned(),
        ev.locs2().column(axis).to_owned(),
    ))
}

fn squared_exponential(d2: &Dual2, sill: &Scalar, range: &Scalar) -> Dual2 {
    let (s, r) = (sill.value, range.value);
    let e = d2.value.mapv(|d| (-0.5 * d / (r * r)).exp());
    let mut k = Dual::constant(&e * s);
    k.accumulate_scalar(&e, sill);
    if !range.tangents.is_empty() {
        let dr = Zip::from(&e)
            .and(&d2.value)
            .map_collect(|&e, &d| s * e * d / (r * r * r));
        k.accumulate_scalar(&dr, range);
    }
    if d2.has_tangents() {
        k.accumulate(&e.mapv(|e| -0.5 * s * e / (r * r)), d2);
    }
    k
}

fn gamma_exponential(d2: &Dual2, sill: &Scalar, range: &Scalar, gamma: &Scalar) -> Dual2 {
    let (s, r, a) = (sill.value, range.value, 0.5 * gamma.value);
    let x = d2.value.mapv(|d| d.max(0.) / (r * r));
    let y = x.mapv(|x| x.powf(a));
    let e = y.mapv(|y| (-y).exp());
    let mut k = Dual::constant(&e * s);
    k.accumulate_scalar(&e, sill);
    if !range.tangents.is_empty() {
        let dr = Zip::from(&e)
            .and(&y)
            .map_collect(|&e, &y| 2. * s * e * a * y / r);
        k.accumulate_scalar(&dr, range);
    }
    if !gamma.tangents.is_empty() {
        let dg = Zip::from(&e).and(&y).and(&x).map_collect(|&e, &y, &x| {
            if x > 0. {
                -0.5 * s * e * y * x.ln()
            } else {
                0.
            }
        });
        k.accumulate_scalar(&dg, gamma);
    }
    if d2.has_tangents() {
        let dd = Zip::from(&e).and(&x).map_collect(|&e, &x| {
            if x > 0. {
                -s * e * a * x.powf(a - 1.) / (r * r)
            } else {
                0.
            }
        });
        k.accumulate(&dd, d2);
    }
    k
}

/// Second antiderivative (up to sign) of the unit squared exponential covariance
/// and its derivative with respect to the range
fn int_squared_exponential(delta: f64, range: f64) -> (f64, f64) {
    let s = delta / (2f64.sqrt() * range);
    let f = PI.sqrt() * s * libm::erf(s) + (-s * s).exp();
    (
        -range * range * f,
        -2. * range * f + range * PI.sqrt() * s * libm::erf(s),
    )
}

/// Second antiderivative (up to sign) of the unit exponential covariance
/// and its derivative with respect to the range
fn int_exponential(delta: f64, range: f64) -> (f64, f64) {
    let s = delta.abs() / range;
    let f = s + (-s).exp();
    (
        -range * range * f,
        -2. * range * f + range * s * (1. - (-s).exp()),
    )
}

/// Covariance of integrated processes from an antiderivative `g` of the integrand
/// covariance, `g(delta, range)` returning the value and its derivative with respect to the range.
/// Coordinates are taken relative to `start`, the origin being pinned to zero variance.
fn integrated(
    x1: &Array1<f64>,
    x2: &Array1<f64>,
    start: f64,
    range: &Scalar,
    g: impl Fn(f64, f64) -> (f64, f64),
) -> Dual2 {
    let pad = |x: &Array1<f64>| {
        let mut p = Array1::zeros(x.len() + 1);
        p.slice_mut(s![1..]).assign(&x.mapv(|v| v - start));
        p
    };
    let (p1, p2) = (pad(x1), pad(x2));
    let mut raw = Array2::<f64>::zeros((p1.len(), p2.len()));
    let mut draw = Array2::<f64>::zeros((p1.len(), p2.len()));
    Zip::indexed(&mut raw)
        .and(&mut draw)
        .for_each(|(i, j), k, dk| {
            let (v, dv) = g(p1[i] - p2[j], range.value);
            *k = v;
            *dk = dv;
        });
    let mut k = Dual::constant(pin_origin(&raw));
    k.accumulate_scalar(&pin_origin(&draw), range);
    k
}

/// `raw[i, j] - raw[0, j] - raw[i, 0] + raw[0, 0]` for `i, j >= 1`
fn pin_origin(raw: &Array2<f64>) -> Array2<f64> {
    let row0 = raw.slice(s![0..1, 1..]);
    let col0 = raw.slice(s![1.., 0..1]);
    &raw.slice(s![1.., 1..]) - &row0 - &col0 + raw[[0, 0]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use ndarray::array;

    /// Entrywise central differences of `f` at `x`
    fn fd<F: Fn(f64) -> Dual2>(f: F, x: f64) -> Array2<f64> {
        let dim = f(x).value.dim();
        Array2::from_shape_fn(dim, |(i, j)| {
            array![x].central_diff(&|p: &Array1<f64>| f(p[0]).value[[i, j]])[0]
        })
    }

    fn d2_var(value: Array2<f64>) -> Dual2 {
        let mut d = Dual::constant(value.clone());
        d.tangents.insert("d2".to_string(), Array2::ones(value.dim()));
        d
    }

    #[test]
    fn test_squared_exponential_derivatives() {
        let d2 = array![[0., 0.5], [1.3, 4.]];
        let k = squared_exponential(
            &d2_var(d2.clone()),
            &Scalar::variable("sill", 2.),
            &Scalar::variable("range", 1.5),
        );
        assert_abs_diff_eq!(k.value[[0, 0]], 2.);
        let c = |v: f64| Scalar::constant(v);
        let dsill = fd(|s| squared_exponential(&Dual::constant(d2.clone()), &c(s), &c(1.5)), 2.);
        let drange = fd(|r| squared_exponential(&Dual::constant(d2.clone()), &c(2.), &c(r)), 1.5);
        let dd2 = fd(
            |h| squared_exponential(&Dual::constant(d2.mapv(|d| d + h)), &c(2.), &c(1.5)),
            0.,
        );
        assert_abs_diff_eq!(k.tangents["sill"], dsill, epsilon = 1e-6);
        assert_abs_diff_eq!(k.tangents["range"], drange, epsilon = 1e-6);
        assert_abs_diff_eq!(k.tangents["d2"], dd2, epsilon = 1e-6);
    }

    #[test]
    fn test_gamma_exponential_derivatives() {
        let d2 = array![[0.2, 0.5], [1.3, 4.]];
        let c = |v: f64| Scalar::constant(v);
        let k = gamma_exponential(
            &d2_var(d2.clone()),
            &Scalar::variable("sill", 2.),
            &Scalar::variable("range", 1.5),
            &Scalar::variable("gamma", 1.2),
        );
        let ge = |d2: &Array2<f64>, s: f64, r: f64, g: f64| {
            gamma_exponential(&Dual::constant(d2.clone()), &c(s), &c(r), &c(g))
        };
        assert_abs_diff_eq!(k.tangents["sill"], fd(|s| ge(&d2, s, 1.5, 1.2), 2.), epsilon = 1e-6);
        assert_abs_diff_eq!(k.tangents["range"], fd(|r| ge(&d2, 2., r, 1.2), 1.5), epsilon = 1e-6);
        assert_abs_diff_eq!(k.tangents["gamma"], fd(|g| ge(&d2, 2., 1.5, g), 1.2), epsilon = 1e-6);
        assert_abs_diff_eq!(
            k.tangents["d2"],
            fd(|h| ge(&d2.mapv(|d| d + h), 2., 1.5, 1.2), 0.),
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_gamma_two_is_squared_exponential() {
        let d2 = Dual::constant(array![[0., 0.3], [2., 5.]]);
        let one = Scalar::constant(1.);
        let r = Scalar::constant(0.8);
        let se = squared_exponential(&d2, &one, &Scalar::constant(0.8 / 2f64.sqrt()));
        let ge = gamma_exponential(&d2, &one, &r, &Scalar::constant(2.));
        assert_abs_diff_eq!(se.value, ge.value, epsilon = 1e-12);
    }

    #[test]
    fn test_pin_origin() {
        let raw = array![[1., 2., 3.], [4., 5., 6.], [7., 8., 10.]];
        assert_abs_diff_eq!(pin_origin(&raw), array![[0., 0.], [0., 1.]]);
    }

    #[test]
    fn test_integrated_exponential_variance() {
        // Var(int_0^t f) = 2 r^2 (t / r - 1 + exp(-t / r)) for a unit exponential covariance
        let x = array![0., 0.5, 2.];
        let r = 0.7;
        let k = integrated(&x, &x, 0., &Scalar::constant(r), int_exponential);
        for (i, &t) in x.iter().enumerate() {
            let expected = 2. * r * r * (t / r - 1. + (-t / r).exp());
            assert_abs_diff_eq!(k.value[[i, i]], expected, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(k.value.row(0), Array1::<f64>::zeros(3));
    }

    #[test]
    fn test_integrated_squared_exponential_variance() {
        // Var(int_0^t f) = 2 r^2 (sqrt(pi) u erf(u) + exp(-u^2) - 1) with u = t / (r sqrt(2))
        let x = array![1., 3.];
        let r = 1.3;
        let k = integrated(&x, &x, -1., &Scalar::constant(r), int_squared_exponential);
        for (i, &t) in x.iter().enumerate() {
            let u = (t + 1.) / (r * 2f64.sqrt());
            let expected = 2. * r * r * (PI.sqrt() * u * libm::erf(u) + (-u * u).exp() - 1.);
            assert_abs_diff_eq!(k.value[[i, i]], expected, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(k.value, k.value.t(), epsilon = 1e-12);
    }

    #[test]
    fn test_integrated_range_derivatives() {
        let x1 = array![0.3, 1.2, 2.5];
        let x2 = array![-0.4, 0.8];
        for g in [int_squared_exponential, int_exponential] {
            let k = integrated(&x1, &x2, -1., &Scalar::variable("range", 0.9), g);
            let dr = fd(|r| integrated(&x1, &x2, -1., &Scalar::constant(r), g), 0.9);
            assert_abs_diff_eq!(k.tangents["range"], dr, epsilon = 1e-5);
        }
    }
}
