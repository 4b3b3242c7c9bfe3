//! Gaussian log-likelihood of observations and its gradient with respect to
//! the parameters referenced by the mean and the covariance.

use crate::assembly::assemble_self;
use crate::dual::{Dual1, Dual2, Scalar};
use crate::errors::{GpError, Result};
use crate::graph::Gp;
use crate::param::ParamValues;
use crate::utils::is_diagonal;
use linfa_linalg::cholesky::Cholesky;
use linfa_linalg::triangular::{SolveTriangular, UPLO};
use log::debug;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use std::collections::BTreeSet;
use std::f64::consts::PI;

/// `-0.5 * (n ln(2 pi) + ln det(cov) + r^T cov^-1 r)` with `r = vals - mean`.
///
/// Tangents of the result are computed from the tangents of `mean` and `cov`:
/// `dll = 0.5 * sum((alpha alpha^T - cov^-1) * dcov) + alpha . dmean`
/// with `alpha = cov^-1 r`.
///
/// A diagonal covariance value is inverted entrywise, its tangents may still be dense.
pub fn gaussian_log_likelihood(mean: &Dual1, cov: &Dual2, vals: &ArrayView1<f64>) -> Result<Scalar> {
    let n = vals.len();
    if n == 0 {
        return Ok(Scalar::constant(0.));
    }
    if mean.value.len() != n || cov.value.dim() != (n, n) {
        return Err(GpError::InvalidValueError(format!(
            "Likelihood of {n} values with a mean of length {} and a covariance of shape {:?}",
            mean.value.len(),
            cov.value.dim()
        )));
    }
    let resid = vals - &mean.value;
    let with_grad = mean.has_tangents() || cov.has_tangents();

    if is_diagonal(&cov.value) {
        let d = cov.value.diag().to_owned();
        if d.iter().any(|&v| v <= 0. || v.is_nan()) {
            return Err(GpError::LikelihoodComputationError(
                "Diagonal covariance is not positive definite".to_string(),
            ));
        }
        let alpha = &resid / &d;
        let logdet = d.mapv(f64::ln).sum();
        let quad = resid.dot(&alpha);
        let ll = finite_log_likelihood(n, logdet, quad)?;
        if !with_grad {
            return Ok(Scalar::constant(ll));
        }
        return with_tangents(ll, mean, cov, &alpha, |dcov| {
            let trace = Zip::from(dcov.diag()).and(&d).fold(0., |acc, &dc, &v| acc + dc / v);
            0.5 * (alpha.dot(&dcov.dot(&alpha)) - trace)
        });
    }

    // Sigma = L L^T
    let l = cov.value.cholesky()?;
    let z = l.solve_triangular(&resid.view().insert_axis(Axis(1)), UPLO::Lower)?;
    let logdet = 2. * l.diag().mapv(f64::ln).sum();
    let quad = z.mapv(|v| v * v).sum();
    let ll = finite_log_likelihood(n, logdet, quad)?;
    if !with_grad {
        return Ok(Scalar::constant(ll));
    }

    let l_inv = l.solve_triangular(&Array2::eye(n), UPLO::Lower)?;
    let cov_inv = l_inv.t().dot(&l_inv);
    let alpha = l_inv.t().dot(&z).remove_axis(Axis(1));
    let mut w = &alpha.view().insert_axis(Axis(1)) * &alpha.view().insert_axis(Axis(0));
    w -= &cov_inv;
    with_tangents(ll, mean, cov, &alpha, |dcov| {
        0.5 * Zip::from(&w).and(dcov).fold(0., |acc, &w, &dc| acc + w * dc)
    })
}

fn finite_log_likelihood(n: usize, logdet: f64, quad: f64) -> Result<f64> {
    let ll = -0.5 * (n as f64 * (2. * PI).ln() + logdet + quad);
    if !ll.is_finite() {
        return Err(GpError::LikelihoodComputationError(format!(
            "Non finite log-likelihood (log det {logdet}, quadratic form {quad})"
        )));
    }
    Ok(ll)
}

/// Attaches to `ll` its derivatives given `alpha = cov^-1 r` and the
/// contribution `cov_term(dcov)` of a covariance tangent
fn with_tangents(
    ll: f64,
    mean: &Dual1,
    cov: &Dual2,
    alpha: &Array1<f64>,
    cov_term: impl Fn(&Array2<f64>) -> f64,
) -> Result<Scalar> {
    let mut res = Scalar::constant(ll);
    let names: BTreeSet<&String> = mean.tangents.keys().chain(cov.tangents.keys()).collect();
    for name in names {
        let mut d = 0.;
        if let Some(dcov) = cov.tangents.get(name) {
            d += cov_term(dcov);
        }
        if let Some(dmean) = mean.tangents.get(name) {
            d += alpha.dot(dmean);
        }
        if !d.is_finite() {
            return Err(GpError::LikelihoodComputationError(format!(
                "Non finite log-likelihood derivative with respect to `{name}`"
            )));
        }
        res.tangents.insert(name.clone(), d);
    }
    Ok(res)
}

/// Log-likelihood of observed `vals` at `locs` under the gaussian process with parameter
/// values `params`, derivatives with respect to every named parameter if `with_grad` is set.
/// Categories must be sorted.
pub fn log_likelihood(
    gp: &Gp,
    locs: &ArrayView2<f64>,
    vals: &ArrayView1<f64>,
    cats: Option<&ArrayView1<usize>>,
    params: &ParamValues,
    with_grad: bool,
) -> Result<Scalar> {
    let (mean, cov) = assemble_self(gp, locs, cats, params, with_grad)?;
    let ll = gaussian_log_likelihood(&mean, &cov, vals)?;
    debug!("Log-likelihood {} for {} observations", ll.value, vals.len());
    Ok(ll)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dual::Dual;
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use ndarray::{array, Array1};

    #[test]
    fn test_independent_values() {
        // Diagonal covariance: sum of independent normal log-densities
        let mean = Dual::constant(array![0., 1.]);
        let cov = Dual::constant(array![[1., 0.], [0., 4.]]);
        let vals = array![1., 3.];
        let ll = gaussian_log_likelihood(&mean, &cov, &vals.view()).unwrap();
        let expected = -0.5 * (2. * (2. * PI).ln() + 4f64.ln() + 1. + 1.);
        assert_abs_diff_eq!(ll.value, expected, epsilon = 1e-12);
    }

    /// Checks tangents `t` (covariance direction `dir`) and `u` (mean shift) at `base`
    /// against central differences of the log-likelihood value
    fn check_derivatives(base: Array2<f64>, dir: Array2<f64>) {
        let vals = array![0.3, -1.2, 0.8];
        let m0 = array![0.1, 0.2, -0.1];
        let ll_at = |p: &Array1<f64>| {
            let mean = Dual::constant(&m0 + p[1]);
            let cov = Dual::constant(&base + &(&dir * p[0]));
            gaussian_log_likelihood(&mean, &cov, &vals.view()).unwrap().value
        };

        let mut cov = Dual::constant(base.clone());
        cov.tangents.insert("t".to_string(), dir.clone());
        let mut mean = Dual::constant(m0.clone());
        mean.tangents.insert("u".to_string(), Array1::ones(3));
        let ll = gaussian_log_likelihood(&mean, &cov, &vals.view()).unwrap();
        assert_abs_diff_eq!(ll.value, ll_at(&array![0., 0.]), epsilon = 1e-12);

        let grad = array![0., 0.].central_diff(&ll_at);
        assert_abs_diff_eq!(ll.tangents["t"], grad[0], epsilon = 1e-6);
        assert_abs_diff_eq!(ll.tangents["u"], grad[1], epsilon = 1e-6);
    }

    #[test]
    fn test_log_likelihood_derivatives() {
        check_derivatives(
            array![[2., 0.5, 0.1], [0.5, 1.5, 0.3], [0.1, 0.3, 1.]],
            array![[1., 0.2, 0.], [0.2, 0.5, 0.1], [0., 0.1, 0.3]],
        );
    }

    #[test]
    fn test_diagonal_log_likelihood_derivatives() {
        // Diagonal value with dense tangent: moving along `dir` leaves the diagonal case
        check_derivatives(
            array![[2., 0., 0.], [0., 1.5, 0.], [0., 0., 1.]],
            array![[1., 0.2, -0.4], [0.2, 0.5, 0.1], [-0.4, 0.1, 0.3]],
        );
    }

    #[test]
    fn test_diagonal_matches_dense() {
        let mean = Dual::constant(array![0.5, -0.2, 0.]);
        let vals = array![1.1, 0.4, -0.7];
        let diag = gaussian_log_likelihood(
            &mean,
            &Dual::constant(array![[0.7, 0., 0.], [0., 2., 0.], [0., 0., 1.3]]),
            &vals.view(),
        )
        .unwrap();
        let nearly = gaussian_log_likelihood(
            &mean,
            &Dual::constant(array![[0.7, 1e-13, 0.], [1e-13, 2., 0.], [0., 0., 1.3]]),
            &vals.view(),
        )
        .unwrap();
        assert_abs_diff_eq!(diag.value, nearly.value, epsilon = 1e-10);

        let zero_variance = Dual::constant(array![[1., 0., 0.], [0., 0., 0.], [0., 0., 1.]]);
        assert!(gaussian_log_likelihood(&mean, &zero_variance, &vals.view()).is_err());
    }

    #[test]
    fn test_not_positive_definite() {
        let mean = Dual::constant(array![0., 0.]);
        let cov = Dual::constant(array![[1., 2.], [2., 1.]]);
        let vals = array![1., 1.];
        assert!(gaussian_log_likelihood(&mean, &cov, &vals.view()).is_err());
    }
}
