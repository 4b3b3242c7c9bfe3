//! A module for mean functions (trends) of gaussian processes.
//!
//! The following mean functions are implemented:
//! * zero,
//! * linear trend on user features,
//! * sum of means,
//! * mixture of means with per-category weights,
//! * per-category selection of means.

use crate::assembly::Evaluator;
use crate::dual::{Dual, Dual1, Scalar};
use crate::errors::{GpError, Result};
use crate::graph::{MeanId, NodeId};
use crate::metrics::{stack_columns, AxisFn};
use crate::param::{Bound, ParamRef, Parameter};
use crate::utils::{bincount, is_sorted, normalization_factors, start_indices};
use log::warn;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::fmt;
use std::sync::Arc;

/// User function computing trend features from coordinate columns.
///
/// Each returned feature has one value per location or a single value
/// which is broadcast to every location.
#[derive(Clone)]
pub struct Featurizer(Arc<AxisFn>);

impl Featurizer {
    /// Wraps a function mapping coordinate columns to feature columns
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[ArrayView1<f64>]) -> Vec<Array1<f64>> + Send + Sync + 'static,
    {
        Featurizer(Arc::new(f))
    }

    /// No feature at all
    pub fn none() -> Self {
        Featurizer::new(|_: &[ArrayView1<f64>]| vec![])
    }

    /// Features of `f` standardized with their mean and standard deviation over `locs`,
    /// preceded by a constant feature
    pub fn normalizing<F>(f: F, locs: &ArrayView2<f64>) -> Result<Self>
    where
        F: Fn(&[ArrayView1<f64>]) -> Vec<Array1<f64>> + Send + Sync + 'static,
    {
        let raw = Featurizer::new(f);
        let feats = raw.apply(locs)?;
        if feats.nrows() > 0 && feats.std_axis(Axis(0), 0.).iter().any(|&s| s == 0.) {
            warn!("Constant feature left unscaled in trend normalization");
        }
        let (mean, std) = normalization_factors(&feats);
        Ok(Featurizer::new(move |cols: &[ArrayView1<f64>]| {
            let n = cols.first().map(|c| c.len()).unwrap_or(1);
            let mut out = vec![Array1::ones(n)];
            for (k, feat) in (raw.0)(cols).into_iter().enumerate() {
                out.push(feat.mapv(|v| (v - mean[k]) / std[k]));
            }
            out
        }))
    }

    /// Features of `locs` as a (n, nfeatures) matrix
    pub fn apply(&self, locs: &ArrayView2<f64>) -> Result<Array2<f64>> {
        let cols: Vec<ArrayView1<f64>> = locs.columns().into_iter().collect();
        stack_columns(locs.nrows(), (self.0)(&cols))
    }
}

impl fmt::Debug for Featurizer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Featurizer")
    }
}

/// Mean function nodes
#[derive(Clone, Debug)]
pub enum Mean {
    /// Null mean
    Zero,
    /// `F(x) . beta`
    Trend {
        /// Computes `F(x)`
        featurizer: Featurizer,
        /// One coefficient per feature
        beta: Vec<ParamRef>,
    },
    /// Sum of means
    Sum(Vec<MeanId>),
    /// `sum_h weights[cat][h] * inputs[h](x)`
    Mix {
        /// Latent means
        inputs: Vec<MeanId>,
        /// One row per category, one column per input
        weights: Vec<Vec<ParamRef>>,
    },
    /// Category `c` mean is `inputs[c]`
    Mux(Vec<MeanId>),
}

impl Mean {
    /// Parameters referenced by the formal arguments of this node
    pub fn parameters(&self) -> Vec<Parameter> {
        match self {
            Mean::Trend { beta, .. } => beta
                .iter()
                .filter_map(|b| b.declare(Bound::unbounded()))
                .collect(),
            Mean::Mix { weights, .. } => weights
                .iter()
                .flatten()
                .filter_map(|w| w.declare(Bound::unbounded()))
                .collect(),
            _ => vec![],
        }
    }

    /// Input means
    pub fn inputs(&self) -> Vec<MeanId> {
        match self {
            Mean::Zero | Mean::Trend { .. } => vec![],
            Mean::Sum(parts) | Mean::Mux(parts) => parts.clone(),
            Mean::Mix { inputs, .. } => inputs.clone(),
        }
    }

    /// Input nodes
    pub fn children(&self) -> Vec<NodeId> {
        self.inputs().into_iter().map(|m| m.0).collect()
    }

    /// Mean of the first location batch of the evaluator
    pub(crate) fn evaluate(&self, ev: &Evaluator) -> Result<Dual1> {
        let n = ev.locs1().nrows();
        match self {
            Mean::Zero => Ok(Dual::constant(Array1::zeros(n))),
            Mean::Trend { featurizer, beta } => {
                let feats = featurizer.apply(&ev.locs1())?;
                let beta = beta
                    .iter()
                    .map(|b| ev.param(b))
                    .collect::<Result<Vec<_>>>()?;
                trend(&feats, &beta)
            }
            Mean::Sum(parts) => {
                let mut res = Dual::constant(Array1::zeros(n));
                for part in parts {
                    res = res.add(&*ev.mean(*part)?);
                }
                Ok(res)
            }
            Mean::Mix { inputs, weights } => {
                let weights = resolve_weights(ev, weights)?;
                check_categories(&ev.cats1(), weights.len())?;
                let mut res = Dual::constant(Array1::zeros(n));
                for (h, input) in inputs.iter().enumerate() {
                    let column: Vec<Scalar> = weights.iter().map(|row| row[h].clone()).collect();
                    let w = Dual1::gather(&column, ev.cats1().iter().copied());
                    res = res.add(&w.mul(&*ev.mean(*input)?));
                }
                Ok(res)
            }
            Mean::Mux(inputs) => {
                let cats = ev.cats1();
                check_sorted_categories(&cats, inputs.len())?;
                let counts = bincount(&cats, inputs.len());
                let starts = start_indices(&counts);
                let mut res = Dual::constant(Array1::zeros(n));
                for (c, input) in inputs.iter().enumerate() {
                    if counts[c] == 0 {
                        continue;
                    }
                    let sub = ev.segment(starts[c]..starts[c] + counts[c], 0..0, 0);
                    res.assign_segment(starts[c], &*sub.mean(*input)?);
                }
                Ok(res)
            }
        }
    }
}

fn trend(feats: &Array2<f64>, beta: &[Scalar]) -> Result<Dual1> {
    if feats.ncols() != beta.len() {
        return Err(GpError::InvalidValueError(format!(
            "Trend has {} coefficients for {} features",
            beta.len(),
            feats.ncols()
        )));
    }
    let coefs = Array1::from_iter(beta.iter().map(|b| b.value));
    let mut res = Dual::constant(feats.dot(&coefs));
    for (k, b) in beta.iter().enumerate() {
        res.accumulate_scalar(&feats.column(k).to_owned(), b);
    }
    Ok(res)
}

pub(crate) fn resolve_weights(
    ev: &Evaluator,
    weights: &[Vec<ParamRef>],
) -> Result<Vec<Vec<Scalar>>> {
    weights
        .iter()
        .map(|row| row.iter().map(|w| ev.param(w)).collect())
        .collect()
}

/// Checks that every category indexes one of `n` rows or inputs
pub(crate) fn check_categories(cats: &ArrayView1<usize>, n: usize) -> Result<()> {
    match cats.iter().find(|&&c| c >= n) {
        Some(c) => Err(GpError::InvalidValueError(format!(
            "Category {c} out of range, only {n} categories are modeled"
        ))),
        None => Ok(()),
    }
}

/// Checks categories are sorted and in range
pub(crate) fn check_sorted_categories(cats: &ArrayView1<usize>, n: usize) -> Result<()> {
    if !is_sorted(cats) {
        return Err(GpError::InvalidValueError(
            "Categories must be sorted to evaluate a per-category node".to_string(),
        ));
    }
    check_categories(cats, n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_featurizer_broadcast() {
        let f = Featurizer::new(|cols: &[ArrayView1<f64>]| {
            vec![Array1::from_elem(1, 1.), cols[0].to_owned(), cols[1].mapv(|v| v * v)]
        });
        let locs = array![[1., 2.], [3., 4.]];
        assert_abs_diff_eq!(
            f.apply(&locs.view()).unwrap(),
            array![[1., 1., 4.], [1., 3., 16.]]
        );
        let bad = Featurizer::new(|_: &[ArrayView1<f64>]| vec![Array1::zeros(3)]);
        assert!(bad.apply(&locs.view()).is_err());
        assert_eq!(Featurizer::none().apply(&locs.view()).unwrap().ncols(), 0);
    }

    #[test]
    fn test_normalizing_featurizer() {
        let locs = array![[0.], [2.], [4.]];
        let f = Featurizer::normalizing(
            |cols: &[ArrayView1<f64>]| vec![cols[0].to_owned(), Array1::from_elem(1, 5.)],
            &locs.view(),
        )
        .unwrap();
        let feats = f.apply(&locs.view()).unwrap();
        let s = (8f64 / 3.).sqrt();
        assert_abs_diff_eq!(
            feats,
            array![[1., -2. / s, 0.], [1., 0., 0.], [1., 2. / s, 0.]],
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_trend() {
        let feats = array![[1., 2.], [1., -1.]];
        let beta = vec![Scalar::variable("b0", 0.5), Scalar::constant(2.)];
        let m = trend(&feats, &beta).unwrap();
        assert_abs_diff_eq!(m.value, array![4.5, -1.5]);
        assert_abs_diff_eq!(m.tangents["b0"], array![1., 1.]);
        assert!(trend(&feats, &beta[..1]).is_err());
    }

    #[test]
    fn test_categories_checks() {
        let cats = array![0, 0, 2];
        assert!(check_categories(&cats.view(), 3).is_ok());
        assert!(check_categories(&cats.view(), 2).is_err());
        let unsorted = array![1, 0];
        assert!(check_sorted_categories(&unsorted.view(), 2).is_err());
    }
}
