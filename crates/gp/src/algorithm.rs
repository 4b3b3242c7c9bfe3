use crate::assembly::{assemble, assemble_self};
use crate::dual::Scalar;
use crate::errors::{GpError, Result};
use crate::graph::Gp;
use crate::likelihood::log_likelihood;
use crate::mcmc::ReplicaExchange;
use crate::optimization::Adam;
use crate::param::{check_parameters, ParamDraws, ParamValues, ParameterSpace};
use crate::parameters::{FitParams, McmcParams, PredictParams, PredictValidParams, Reduce};
use crate::report::{LogReporter, Report, Reporter};
use crate::utils::{
    argsort, inverse_permutation, is_diagonal, quantile, select_rows, thin, zero_cats,
};

use linfa::ParamGuard;
use linfa_linalg::cholesky::{Cholesky, InverseC};
use log::debug;
use ndarray::{
    concatenate, s, Array1, Array2, Array3, ArrayBase, ArrayView1, ArrayView2, Axis, Data, Ix1,
    Ix2,
};
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Number of progress reports of a fit
const FIT_BURSTS: usize = 10;

/// Parameter values of a model
#[derive(Clone, Debug, PartialEq)]
pub enum Parameters {
    /// A single value per parameter
    Point(ParamValues),
    /// Posterior draws, the same number for every parameter
    Sampled(ParamDraws),
}

impl Parameters {
    /// Number of posterior draws, none for point values
    pub fn sample_size(&self) -> Option<usize> {
        match self {
            Parameters::Point(_) => None,
            Parameters::Sampled(draws) => Some(sample_size(draws)),
        }
    }
}

fn sample_size(draws: &ParamDraws) -> usize {
    draws.values().next().map_or(0, |d| d.len())
}

fn draw_at(draws: &ParamDraws, i: usize) -> ParamValues {
    draws
        .iter()
        .map(|(name, d)| (name.clone(), d[i]))
        .collect()
}

fn reduce_draws(draws: &ParamDraws, reduce: Reduce) -> Result<ParamValues> {
    draws
        .iter()
        .map(|(name, d)| -> Result<(String, f64)> {
            let v = match reduce {
                Reduce::Mean => d.mean().ok_or_else(|| {
                    GpError::InvalidValueError(format!("No draw for parameter `{name}`"))
                })?,
                Reduce::Median => quantile(d, 0.5)?,
            };
            Ok((name.clone(), v))
        })
        .collect()
}

fn check_categories(n: usize, cats: Option<&Array1<usize>>) -> Result<()> {
    match cats {
        Some(cats) if cats.len() != n => Err(GpError::InvalidValueError(format!(
            "Mismatched shapes in cats ({}) and locs ({n})",
            cats.len()
        ))),
        _ => Ok(()),
    }
}

/// Observed values at locations, with optional category labels
#[derive(Clone, Debug, PartialEq)]
pub struct Observations {
    locs: Array2<f64>,
    vals: Array1<f64>,
    cats: Option<Array1<usize>>,
}

impl Observations {
    /// Checks that `vals` and `cats` have one entry per location row
    pub fn new(locs: Array2<f64>, vals: Array1<f64>, cats: Option<Array1<usize>>) -> Result<Self> {
        if vals.len() != locs.nrows() {
            return Err(GpError::InvalidValueError(format!(
                "Mismatched shapes in vals ({}) and locs ({})",
                vals.len(),
                locs.nrows()
            )));
        }
        check_categories(locs.nrows(), cats.as_ref())?;
        Ok(Observations { locs, vals, cats })
    }

    /// Locations, one row per point
    pub fn locs(&self) -> &Array2<f64> {
        &self.locs
    }

    /// Observed values
    pub fn vals(&self) -> &Array1<f64> {
        &self.vals
    }

    /// Category labels if any
    pub fn cats(&self) -> Option<&Array1<usize>> {
        self.cats.as_ref()
    }

    /// Number of observations
    pub fn len(&self) -> usize {
        self.vals.len()
    }

    /// Whether there is no observation
    pub fn is_empty(&self) -> bool {
        self.vals.is_empty()
    }

    fn cats_view(&self) -> Option<ArrayView1<usize>> {
        self.cats.as_ref().map(|c| c.view())
    }

    /// A copy sorted by category
    fn sorted(&self) -> Observations {
        match &self.cats {
            None => self.clone(),
            Some(cats) => {
                let perm = argsort(cats);
                Observations {
                    locs: select_rows(&self.locs, &perm),
                    vals: self.vals.select(Axis(0), &perm),
                    cats: Some(cats.select(Axis(0), &perm)),
                }
            }
        }
    }
}

/// Joint predictive distribution of `p` aligned query batches
struct Prediction {
    /// `[n, p]`
    mean: Array2<f64>,
    /// `[n, p, p]`
    cov: Array3<f64>,
}

fn outer_rows(m: &Array2<f64>) -> Array3<f64> {
    &m.view().insert_axis(Axis(2)) * &m.view().insert_axis(Axis(1))
}

/// Gaussian mixture of equally weighted predictions, moment matched
fn combine(mut preds: Vec<Prediction>) -> Result<Prediction> {
    if preds.len() <= 1 {
        return preds
            .pop()
            .ok_or_else(|| GpError::InvalidValueError("No prediction to combine".to_string()));
    }
    let s = preds.len() as f64;
    let (n, p) = preds[0].mean.dim();
    let mut mean = Array2::<f64>::zeros((n, p));
    let mut second = Array3::<f64>::zeros((n, p, p));
    for pred in preds.iter() {
        mean += &pred.mean;
        second += &pred.cov;
        second += &outer_rows(&pred.mean);
    }
    mean /= s;
    second /= s;
    let cov = second - outer_rows(&mean);
    Ok(Prediction { mean, cov })
}

/// A gaussian process model: a [`Gp`], values of its parameters and optionally
/// the observations it is conditioned on.
///
/// Models are immutable: [`Model::fit`], [`Model::mcmc`] and [`Model::generate`]
/// return new models, leaving the original untouched.
///
/// Every parameter referenced by the mean and kernel trees must be given a value
/// inside its effective bound, the intersection of the bounds declared by every
/// node referring to it. This is checked at construction.
///
/// # Inference
///
/// * [`Model::fit`] maximizes the log-likelihood with Adam on the unconstrained
///   (underlying) parameters, optionally penalized by the sum of kernel ranges.
/// * [`Model::mcmc`] samples the posterior with a replica exchange random walk
///   and returns a model holding posterior draws.
/// * [`Model::predict`] and [`Model::predict_pairs`] krige at new locations.
///   Models holding draws predict with a gaussian mixture over (a subsample of)
///   the draws, or with a single reduced parameter set.
/// * [`Model::generate`] draws values from the unconditioned process.
///
/// Progress of fitting and sampling is sent to a [`Reporter`], [`LogReporter`] by default.
///
/// # Example
///
/// ```no_run
/// use geostat_gp::{Graph, Model, FitParams, PredictParams};
/// use ndarray::array;
///
/// let mut g = Graph::new();
/// let se = g.squared_exponential("sill", "range", None);
/// let noise = g.noise("nugget");
/// let kernel = g.combine_sum(se, noise);
/// let nodes = g.gp(None, kernel);
/// let gp = g.build(nodes).unwrap();
///
/// let params = [("sill", 1.), ("range", 1.), ("nugget", 0.1)]
///     .into_iter()
///     .map(|(k, v)| (k.to_string(), v))
///     .collect();
/// let model = Model::new(gp, params).unwrap();
///
/// let locs = array![[0.], [1.], [2.], [3.]];
/// let vals = array![0., 0.8, 0.9, 0.1];
/// let fitted = model
///     .fit(&locs, &vals, None, &FitParams::new().iters(50).step_size(0.1))
///     .unwrap();
/// let (mean, var) = fitted
///     .predict(&array![[1.5]], None, &PredictParams::new())
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct Model {
    gp: Gp,
    parameters: Parameters,
    space: ParameterSpace,
    data: Option<Observations>,
    reporter: Arc<dyn Reporter>,
    verbose: bool,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Model")
            .field("gp", &self.gp)
            .field("parameters", &self.parameters)
            .field("space", &self.space)
            .field("data", &self.data)
            .field("verbose", &self.verbose)
            .finish()
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let observations = self.data.as_ref().map_or(0, |d| d.len());
        match &self.parameters {
            Parameters::Point(p) => write!(f, "Model(parameters={p:?}, observations={observations})"),
            Parameters::Sampled(d) => write!(
                f,
                "Model(draws={}, parameters={:?}, observations={observations})",
                sample_size(d),
                d.keys().collect::<Vec<_>>()
            ),
        }
    }
}

impl Model {
    /// Model of `gp` with the given parameter values
    pub fn new(gp: Gp, params: ParamValues) -> Result<Self> {
        let bounds = check_parameters(&gp.gather_free_parameters(), &params)?;
        Ok(Model {
            gp,
            parameters: Parameters::Point(params),
            space: ParameterSpace::new(bounds),
            data: None,
            reporter: Arc::new(LogReporter),
            verbose: true,
        })
    }

    /// Model of `gp` with posterior draws of its parameters, every draw being checked
    pub fn with_draws(gp: Gp, draws: ParamDraws) -> Result<Self> {
        let n = sample_size(&draws);
        if n == 0 || draws.values().any(|d| d.len() != n) {
            return Err(GpError::InvalidValueError(
                "Parameter draws should be non empty and of the same length".to_string(),
            ));
        }
        let declared = gp.gather_free_parameters();
        let bounds = check_parameters(&declared, &draw_at(&draws, 0))?;
        for i in 1..n {
            check_parameters(&declared, &draw_at(&draws, i))?;
        }
        Ok(Model {
            gp,
            parameters: Parameters::Sampled(draws),
            space: ParameterSpace::new(bounds),
            data: None,
            reporter: Arc::new(LogReporter),
            verbose: true,
        })
    }

    /// Conditions the model on observations
    pub fn with_data(
        mut self,
        locs: Array2<f64>,
        vals: Array1<f64>,
        cats: Option<Array1<usize>>,
    ) -> Result<Self> {
        self.data = Some(Observations::new(locs, vals, cats)?);
        Ok(self)
    }

    /// Sets the sink of progress reports
    pub fn with_reporter(mut self, reporter: impl Reporter + 'static) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    /// Enables or disables progress reports
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// The gaussian process
    pub fn gp(&self) -> &Gp {
        &self.gp
    }

    /// Parameter values or draws
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Effective parameter bounds
    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    /// Observations if any
    pub fn data(&self) -> Option<&Observations> {
        self.data.as_ref()
    }

    /// Point parameter values, fails if the model holds posterior draws
    pub fn params(&self) -> Result<&ParamValues> {
        match &self.parameters {
            Parameters::Point(p) => Ok(p),
            Parameters::Sampled(_) => Err(GpError::InvalidValueError(
                "Model holds posterior draws instead of point parameter values".to_string(),
            )),
        }
    }

    /// Posterior draws if any
    pub fn draws(&self) -> Option<&ParamDraws> {
        match &self.parameters {
            Parameters::Point(_) => None,
            Parameters::Sampled(d) => Some(d),
        }
    }

    /// Log-likelihood of the observations under point parameter values
    pub fn log_likelihood(&self) -> Result<f64> {
        let params = self.params()?;
        let data = self.data.as_ref().ok_or_else(|| {
            GpError::InvalidValueError("Log-likelihood needs observations".to_string())
        })?;
        let train = data.sorted();
        let cats = train.cats_view();
        let ll = log_likelihood(
            &self.gp,
            &train.locs.view(),
            &train.vals.view(),
            cats.as_ref(),
            params,
            false,
        )?;
        Ok(ll.value)
    }

    /// Fits parameter values to the observations by maximizing the (penalized) log-likelihood.
    ///
    /// Returns a model holding the fitted values and the observations.
    pub fn fit(
        &self,
        locs: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        vals: &ArrayBase<impl Data<Elem = f64>, Ix1>,
        cats: Option<&Array1<usize>>,
        params: &FitParams,
    ) -> Result<Model> {
        let fp = params.check_ref()?;
        let init = self.params()?;
        let data = Observations::new(locs.to_owned(), vals.to_owned(), cats.cloned())?;
        let train = data.sorted();
        let train_cats = train.cats_view();
        let space = &self.space;
        let names = space.names();

        // Loss and its gradient with respect to underlying values
        let objective = |x: &Array1<f64>| -> Result<(f64, f64, Array1<f64>)> {
            let underlying = space.from_vec(x);
            let surface = space.surface(&underlying)?;
            let dsurface = space.surface_derivative(&underlying)?;
            let ll = log_likelihood(
                &self.gp,
                &train.locs.view(),
                &train.vals.view(),
                train_cats.as_ref(),
                &surface,
                true,
            )?;
            let penalty = match fp.reg() {
                Some(w) => self.gp.reg(&surface, true)?.scale(w),
                None => Scalar::constant(0.),
            };
            let loss = ll.scale(-1.).add(&penalty);
            let grad = names
                .iter()
                .map(|name| {
                    loss.tangents.get(name).copied().unwrap_or(0.)
                        * dsurface.get(name).copied().unwrap_or(0.)
                })
                .collect::<Array1<f64>>();
            Ok((ll.value, penalty.value, grad))
        };

        let mut x = space.to_vec(&space.underlying(init)?)?;
        let mut adam = Adam::new(x.len(), fp.step_size());
        let mut j = 0;
        let mut last = (f64::NAN, f64::NAN);
        for i in 0..FIT_BURSTS {
            let now = Instant::now();
            while j * FIT_BURSTS < (i + 1) * fp.iters() {
                let (ll, penalty, grad) = objective(&x)?;
                adam.step(&mut x, &grad);
                last = (ll, penalty);
                j += 1;
            }
            // A burst without steps repeats the latest values
            let (ll, penalty) = last;
            debug!("Fit iteration {j}: log-likelihood {ll}");
            if self.verbose {
                let surface = space.surface(&space.from_vec(&x))?;
                self.reporter.report(
                    &Report::new()
                        .int("iter", j)
                        .float("ll", ll)
                        .float("time", now.elapsed().as_secs_f64())
                        .float("reg", penalty)
                        .params(&surface),
                );
            }
        }

        let fitted = space.surface(&space.from_vec(&x))?;
        Ok(Model {
            parameters: Parameters::Point(fitted),
            data: Some(data),
            ..self.clone()
        })
    }

    /// Samples the posterior of the parameters given the observations with replica exchange MCMC.
    ///
    /// Returns a model holding the post burn-in draws and the observations.
    pub fn mcmc(
        &self,
        locs: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        vals: &ArrayBase<impl Data<Elem = f64>, Ix1>,
        cats: Option<&Array1<usize>>,
        params: &McmcParams,
    ) -> Result<Model> {
        let mp = params.check_ref()?;
        let init = self.params()?;
        if self.space.is_empty() {
            return Err(GpError::InvalidValueError(
                "Model has no parameter to sample".to_string(),
            ));
        }
        let data = Observations::new(locs.to_owned(), vals.to_owned(), cats.cloned())?;
        let train = data.sorted();
        let train_cats = train.cats_view();
        let space = &self.space;
        let gp = &self.gp;
        let names = space.names();

        let log_prob = |x: &Array1<f64>| -> Result<f64> {
            let surface = space.surface(&space.from_vec(x))?;
            let ll = log_likelihood(
                gp,
                &train.locs.view(),
                &train.vals.view(),
                train_cats.as_ref(),
                &surface,
                false,
            )?;
            Ok(ll.value)
        };

        let rng = match mp.seed() {
            Some(seed) => Xoshiro256Plus::seed_from_u64(seed),
            None => Xoshiro256Plus::from_entropy(),
        };
        let x0 = space.to_vec(&space.underlying(init)?)?;
        let mut sampler = ReplicaExchange::new(log_prob, &x0, mp, rng)?;

        let interval = mp.report_interval();
        let burnin_bursts = mp.burnin() / interval;
        let sampling_bursts = mp.samples() / interval;
        let mut kept = Array2::<f64>::zeros((0, names.len()));
        let now = Instant::now();
        for i in 0..burnin_bursts + sampling_bursts {
            if self.verbose {
                if i == 0 && burnin_bursts > 0 {
                    self.reporter.banner("BURNIN");
                }
                if i == burnin_bursts {
                    self.reporter.banner("SAMPLING");
                }
            }

            let burst = sampler.burst(interval);
            let k = if i < burnin_bursts { i } else { i - burnin_bursts };
            debug!("MCMC burst {i}: {} swaps", burst.swaps);
            if self.verbose {
                self.reporter.report(
                    &Report::new()
                        .int("iter", (k + 1) * interval)
                        .float("time", now.elapsed().as_secs_f64())
                        .array("accept", burst.accept_rates.to_vec())
                        .int("swaps", burst.swaps),
                );
            }

            if i >= burnin_bursts {
                let merged = concatenate(Axis(0), &[kept.view(), burst.draws.view()])?;
                kept = merged;
                if self.verbose {
                    let draws = surface_draws(space, &names, &kept)?;
                    for p in [5, 50, 95] {
                        let values = draws
                            .iter()
                            .map(|(name, d)| -> Result<(String, f64)> {
                                Ok((name.clone(), quantile(d, p as f64 / 100.)?))
                            })
                            .collect::<Result<ParamValues>>()?;
                        self.reporter
                            .report(&Report::new().prefix(&format!("{p:02}%ile")).params(&values));
                    }
                }
            }
        }

        let draws = surface_draws(space, &names, &kept)?;
        Ok(Model {
            parameters: Parameters::Sampled(draws),
            data: Some(data),
            ..self.clone()
        })
    }

    /// Kriging mean and variance at `locs`.
    pub fn predict(
        &self,
        locs: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        cats: Option<&Array1<usize>>,
        params: &PredictParams,
    ) -> Result<(Array1<f64>, Array1<f64>)> {
        let pred = self.predict_queries(&[locs.view()], cats, params)?;
        let mean = pred.mean.index_axis_move(Axis(1), 0);
        let var = pred.cov.slice_move(s![.., 0, 0]);
        Ok((mean, var))
    }

    /// Joint kriging of pairs of locations, the `i`-th pair being `(locs_a[i], locs_b[i])`
    /// with category `cats[i]`.
    ///
    /// Returns `[n, 2]` means and `[n, 2, 2]` covariances.
    pub fn predict_pairs(
        &self,
        locs_a: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        locs_b: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        cats: Option<&Array1<usize>>,
        params: &PredictParams,
    ) -> Result<(Array2<f64>, Array3<f64>)> {
        if locs_a.dim() != locs_b.dim() {
            return Err(GpError::InvalidValueError(format!(
                "Mismatched shapes of pair locations {:?} and {:?}",
                locs_a.dim(),
                locs_b.dim()
            )));
        }
        let pred = self.predict_queries(&[locs_a.view(), locs_b.view()], cats, params)?;
        Ok((pred.mean, pred.cov))
    }

    fn parameter_sets(&self, pp: &PredictValidParams) -> Result<Vec<ParamValues>> {
        match &self.parameters {
            Parameters::Point(p) => {
                if pp.subsample().is_some() || pp.reduce().is_some() {
                    return Err(GpError::InvalidValueError(
                        "`subsample` and `reduce` are only valid with sampled parameters"
                            .to_string(),
                    ));
                }
                Ok(vec![p.clone()])
            }
            Parameters::Sampled(draws) => {
                if let Some(reduce) = pp.reduce() {
                    return Ok(vec![reduce_draws(draws, reduce)?]);
                }
                let n = sample_size(draws);
                let picks = thin(n, pp.subsample().unwrap_or(n))?;
                Ok(picks.into_iter().map(|i| draw_at(draws, i)).collect())
            }
        }
    }

    fn predict_queries(
        &self,
        queries: &[ArrayView2<f64>],
        cats: Option<&Array1<usize>>,
        params: &PredictParams,
    ) -> Result<Prediction> {
        let pp = params.check_ref()?;
        let data = match &self.data {
            Some(data) if !data.is_empty() => data,
            _ => {
                return Err(GpError::InvalidValueError(
                    "Prediction needs observations".to_string(),
                ))
            }
        };
        let n2 = queries[0].nrows();
        for q in queries {
            if q.ncols() != data.locs.ncols() {
                return Err(GpError::InvalidValueError(format!(
                    "Mismatch in location dimensions: {} for observations, {} for queries",
                    data.locs.ncols(),
                    q.ncols()
                )));
            }
        }
        check_categories(n2, cats)?;
        let sets = self.parameter_sets(pp)?;

        let cats = cats.cloned().unwrap_or_else(|| zero_cats(n2));
        let perm = argsort(&cats);
        let sorted_cats = cats.select(Axis(0), &perm);
        let sorted_queries: Vec<Array2<f64>> =
            queries.iter().map(|q| select_rows(q, &perm)).collect();
        let train = data.sorted();

        let total = sets.len();
        let preds = sets
            .par_iter()
            .enumerate()
            .map(|(i, p)| {
                debug!("Kriging with parameter set {}/{total}", i + 1);
                self.krige(&train, &sorted_queries, &sorted_cats, p)
            })
            .collect::<Result<Vec<Prediction>>>()?;
        let pred = combine(preds)?;

        let inv = inverse_permutation(&perm);
        Ok(Prediction {
            mean: pred.mean.select(Axis(0), &inv),
            cov: pred.cov.select(Axis(0), &inv),
        })
    }

    /// Conditional gaussian of aligned query batches sorted by category given sorted observations
    fn krige(
        &self,
        train: &Observations,
        queries: &[Array2<f64>],
        cats: &Array1<usize>,
        params: &ParamValues,
    ) -> Result<Prediction> {
        let gp = &self.gp;
        let train_cats = train.cats_view();
        let train_locs = train.locs.view();
        let n1 = train.len();
        let (m1, a11) = assemble_self(gp, &train_locs, train_cats.as_ref(), params, false)?;
        let a11_inv = a11.value.invc()?;
        let weights = a11_inv.dot(&(&train.vals - &m1.value));

        let p = queries.len();
        let n2 = cats.len();
        let batch_size = (n1 / 2).max(1);
        debug!("Kriging {n2} queries in batches of {batch_size} against {n1} observations");
        let mut mean = Array2::<f64>::zeros((n2, p));
        let mut cov = Array3::<f64>::zeros((n2, p, p));
        for start in (0..n2).step_by(batch_size) {
            let end = (start + batch_size).min(n2);
            let bcats = cats.slice(s![start..end]);
            let blocks: Vec<ArrayView2<f64>> =
                queries.iter().map(|q| q.slice(s![start..end, ..])).collect();

            let mut cross = Vec::with_capacity(p);
            let mut solved = Vec::with_capacity(p);
            for (u, block) in blocks.iter().enumerate() {
                let (_, a1u) = assemble(
                    gp,
                    &train_locs,
                    train_cats.as_ref(),
                    block,
                    Some(&bcats),
                    n1 as isize,
                    params,
                    false,
                )?;
                let (mu, auu) = assemble_self(gp, block, Some(&bcats), params, false)?;
                mean.slice_mut(s![start..end, u])
                    .assign(&(&mu.value + &a1u.value.t().dot(&weights)));
                cov.slice_mut(s![start..end, u, u]).assign(&auu.value.diag());
                solved.push(a11_inv.dot(&a1u.value));
                cross.push(a1u.value);
            }
            for u in 0..p {
                for v in (u + 1)..p {
                    let (_, auv) = assemble(
                        gp,
                        &blocks[u],
                        Some(&bcats),
                        &blocks[v],
                        Some(&bcats),
                        (end - start) as isize,
                        params,
                        false,
                    )?;
                    cov.slice_mut(s![start..end, u, v]).assign(&auv.value.diag());
                    cov.slice_mut(s![start..end, v, u]).assign(&auv.value.diag());
                }
            }
            for u in 0..p {
                for v in 0..p {
                    let explained = (&cross[u] * &solved[v]).sum_axis(Axis(0));
                    let mut block = cov.slice_mut(s![start..end, u, v]);
                    block -= &explained;
                }
            }
        }
        Ok(Prediction { mean, cov })
    }

    /// Draws values at `locs` from the unconditioned process, seeded from entropy if no seed
    /// is given. Returns a model holding the generated observations.
    pub fn generate(
        &self,
        locs: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        cats: Option<&Array1<usize>>,
        seed: Option<u64>,
    ) -> Result<Model> {
        let mut rng = match seed {
            Some(seed) => Xoshiro256Plus::seed_from_u64(seed),
            None => Xoshiro256Plus::from_entropy(),
        };
        self.generate_with_rng(locs, cats, &mut rng)
    }

    /// Same as [`Model::generate`] with a given random generator
    pub fn generate_with_rng<R: Rng>(
        &self,
        locs: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        cats: Option<&Array1<usize>>,
        rng: &mut R,
    ) -> Result<Model> {
        if self.data.is_some() {
            return Err(GpError::InvalidValueError(
                "Conditional generation is not supported: model already holds observations"
                    .to_string(),
            ));
        }
        let params = match &self.parameters {
            Parameters::Point(p) => p,
            Parameters::Sampled(_) => {
                return Err(GpError::InvalidValueError(
                    "Generation needs point parameter values, not posterior draws".to_string(),
                ))
            }
        };
        let n = locs.nrows();
        check_categories(n, cats)?;

        let perm: Vec<usize> = cats.map_or_else(|| (0..n).collect(), |c| argsort(c));
        let sorted_locs = select_rows(locs, &perm);
        let sorted_cats = cats.map(|c| c.select(Axis(0), &perm));
        let sorted_vals = if n == 0 {
            Array1::zeros(0)
        } else {
            let cats_view = sorted_cats.as_ref().map(|c| c.view());
            let (m, c) =
                assemble_self(&self.gp, &sorted_locs.view(), cats_view.as_ref(), params, false)?;
            let z: Array1<f64> = Array1::random_using(n, StandardNormal, rng);
            if is_diagonal(&c.value) {
                let d = c.value.diag();
                if d.iter().any(|&v| v < 0. || v.is_nan()) {
                    return Err(GpError::InvalidValueError(
                        "Generation from a covariance with negative variances".to_string(),
                    ));
                }
                m.value + d.mapv(f64::sqrt) * z
            } else {
                let l = c.value.cholesky()?;
                m.value + l.dot(&z)
            }
        };
        let vals = sorted_vals.select(Axis(0), &inverse_permutation(&perm));

        Ok(Model {
            data: Some(Observations::new(locs.to_owned(), vals, cats.cloned())?),
            ..self.clone()
        })
    }
}

fn surface_draws(space: &ParameterSpace, names: &[String], rows: &Array2<f64>) -> Result<ParamDraws> {
    let underlying: ParamDraws = names
        .iter()
        .cloned()
        .zip(rows.columns().into_iter().map(|c| c.to_owned()))
        .collect();
    space.surface_draws(&underlying)
}
