use crate::errors::{GpError, Result};
use ndarray::{Array1, Array2, Array3, ArrayBase, Axis, Data, Ix1, Ix2, Zip};
use ndarray_stats::{interpolate::Linear, QuantileExt};
use noisy_float::types::n64;

/// Computes squared differences between each row of x1 and each row of x2, axis by axis,
/// resulting in a 3d array of shape (nrows(x1), nrows(x2), ncols(x1)).
/// *Panics* if x1 and x2 have not the same column numbers
pub fn per_axis_dist2(
    x1: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    x2: &ArrayBase<impl Data<Elem = f64>, Ix2>,
) -> Array3<f64> {
    assert!(x1.ncols() == x2.ncols());

    let n1 = x1.nrows();
    let n2 = x2.nrows();
    let ncols = x1.ncols();
    let mut result = Array3::zeros((n1, n2, ncols));

    Zip::from(result.outer_iter_mut())
        .and(x1.rows())
        .for_each(|mut block, x1_row| {
            Zip::from(block.outer_iter_mut())
                .and(x2.rows())
                .for_each(|mut d2, x2_row| {
                    Zip::from(&mut d2)
                        .and(&x1_row)
                        .and(&x2_row)
                        .for_each(|d, a, b| *d = (a - b) * (a - b));
                });
        });

    result
}

/// Computes column mean and (population) standard deviation of `x`.
/// Null standard deviations are replaced by one.
pub fn normalization_factors(x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> (Array1<f64>, Array1<f64>) {
    if x.nrows() == 0 {
        return (Array1::zeros(x.ncols()), Array1::ones(x.ncols()));
    }
    let mean = x.sum_axis(Axis(0)) / x.nrows() as f64;
    let mut std = x.std_axis(Axis(0), 0.);
    std.mapv_inplace(|v| if v == 0. { 1. } else { v });
    (mean, std)
}

/// Returns the permutation which sorts `cats` in non descending order.
/// Sort is stable so points of the same category keep their relative order.
pub fn argsort(cats: &ArrayBase<impl Data<Elem = usize>, Ix1>) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..cats.len()).collect();
    perm.sort_by_key(|&i| cats[i]);
    perm
}

/// Returns the inverse permutation of `perm`
pub fn inverse_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inv[p] = i;
    }
    inv
}

/// Whether `cats` is sorted in non descending order
pub fn is_sorted(cats: &ArrayBase<impl Data<Elem = usize>, Ix1>) -> bool {
    cats.windows(2).into_iter().all(|w| w[0] <= w[1])
}

/// Counts occurrences of each category in `0..n`.
/// Categories greater or equal to `n` are ignored.
pub fn bincount(cats: &ArrayBase<impl Data<Elem = usize>, Ix1>, n: usize) -> Vec<usize> {
    let mut counts = vec![0; n];
    cats.iter().filter(|&&c| c < n).for_each(|&c| counts[c] += 1);
    counts
}

/// Exclusive cumulative sum of `counts`
pub fn start_indices(counts: &[usize]) -> Vec<usize> {
    counts
        .iter()
        .scan(0, |acc, &c| {
            let start = *acc;
            *acc += c;
            Some(start)
        })
        .collect()
}

/// Default categories when none are given: all points belong to category 0
pub fn zero_cats(n: usize) -> Array1<usize> {
    Array1::zeros(n)
}

/// Select rows of `x` in the given order
pub fn select_rows(x: &ArrayBase<impl Data<Elem = f64>, Ix2>, indices: &[usize]) -> Array2<f64> {
    x.select(Axis(0), indices)
}

/// Whether every off-diagonal entry of the square matrix `x` is zero
pub fn is_diagonal(x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> bool {
    x.indexed_iter().all(|((i, j), &v)| i == j || v == 0.)
}

/// Quantile `q` in `[0, 1]` of `x` with linear interpolation, NaN values are skipped
pub fn quantile(x: &ArrayBase<impl Data<Elem = f64>, Ix1>, q: f64) -> Result<f64> {
    let mut x = x.to_owned();
    let res = x
        .quantile_axis_skipnan_mut(Axis(0), n64(q), &Linear)
        .map_err(|err| GpError::InvalidValueError(format!("Quantile {q} computation: {err}")))?;
    Ok(res[()])
}

/// Indices of `s` draws evenly spread among `n`: draw 0 then every draw
/// where `floor(i * s / n)` increments
pub fn thin(n: usize, s: usize) -> Result<Vec<usize>> {
    if s > n {
        return Err(GpError::InvalidValueError(format!(
            "`subsample` ({s}) may not exceed sample size ({n})"
        )));
    }
    Ok((0..n)
        .filter(|&i| i == 0 || (i * s) / n > ((i - 1) * s) / n)
        .take(s)
        .collect())
}
