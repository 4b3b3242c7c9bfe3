use crate::errors::{GpError, Result};
use linfa::ParamGuard;

/// A set of validated fitting parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct FitValidParams {
    /// Learning rate of the gradient descent
    pub(crate) step_size: f64,
    /// Number of gradient steps
    pub(crate) iters: usize,
    /// Weight of the regularization penalty if any
    pub(crate) reg: Option<f64>,
}

impl Default for FitValidParams {
    fn default() -> FitValidParams {
        FitValidParams {
            step_size: 0.01,
            iters: 100,
            reg: None,
        }
    }
}

impl FitValidParams {
    /// Get learning rate
    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    /// Get number of gradient steps
    pub fn iters(&self) -> usize {
        self.iters
    }

    /// Get regularization weight
    pub fn reg(&self) -> Option<f64> {
        self.reg
    }
}

#[derive(Clone, Debug, Default)]
/// The set of hyperparameters that can be specified for [`crate::Model::fit`].
pub struct FitParams(FitValidParams);

impl FitParams {
    /// Default fitting parameters
    pub fn new() -> FitParams {
        Self::default()
    }

    /// Set learning rate
    pub fn step_size(mut self, step_size: f64) -> Self {
        self.0.step_size = step_size;
        self
    }

    /// Set number of gradient steps
    pub fn iters(mut self, iters: usize) -> Self {
        self.0.iters = iters;
        self
    }

    /// Set regularization weight: `reg * sum(ranges)` is added to the negative log-likelihood
    pub fn reg(mut self, reg: Option<f64>) -> Self {
        self.0.reg = reg;
        self
    }
}

impl From<FitValidParams> for FitParams {
    fn from(valid: FitValidParams) -> Self {
        FitParams(valid)
    }
}

impl ParamGuard for FitParams {
    type Checked = FitValidParams;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        if !(self.0.step_size > 0.) {
            return Err(GpError::InvalidValueError(format!(
                "`step_size` should be positive, got {}",
                self.0.step_size
            )));
        }
        if self.0.iters == 0 {
            return Err(GpError::InvalidValueError(
                "`iters` cannot be 0".to_string(),
            ));
        }
        if let Some(reg) = self.0.reg {
            if !reg.is_finite() {
                return Err(GpError::InvalidValueError(format!(
                    "`reg` should be finite, got {reg}"
                )));
            }
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

/// A set of validated replica exchange MCMC parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct McmcValidParams {
    /// Number of tempered chains, chain `k` targets the posterior to the power `0.5^k`
    pub(crate) chains: usize,
    /// Scale of proposal steps
    pub(crate) step_size: f64,
    /// Probability of moving each parameter in a proposal
    pub(crate) move_prob: f64,
    /// Number of kept draws
    pub(crate) samples: usize,
    /// Number of discarded draws
    pub(crate) burnin: usize,
    /// Number of steps between reports
    pub(crate) report_interval: usize,
    /// Random generator seed, entropy if none
    pub(crate) seed: Option<u64>,
}

impl Default for McmcValidParams {
    fn default() -> McmcValidParams {
        McmcValidParams {
            chains: 4,
            step_size: 0.1,
            move_prob: 0.5,
            samples: 1000,
            burnin: 500,
            report_interval: 100,
            seed: None,
        }
    }
}

impl McmcValidParams {
    /// Get number of chains
    pub fn chains(&self) -> usize {
        self.chains
    }

    /// Get proposal scale
    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    /// Get per-parameter move probability
    pub fn move_prob(&self) -> f64 {
        self.move_prob
    }

    /// Get number of kept draws
    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Get number of discarded draws
    pub fn burnin(&self) -> usize {
        self.burnin
    }

    /// Get report interval
    pub fn report_interval(&self) -> usize {
        self.report_interval
    }

    /// Get seed
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }
}

#[derive(Clone, Debug, Default)]
/// The set of hyperparameters that can be specified for [`crate::Model::mcmc`].
pub struct McmcParams(McmcValidParams);

impl McmcParams {
    /// Default sampling parameters
    pub fn new() -> McmcParams {
        Self::default()
    }

    /// Set number of tempered chains
    pub fn chains(mut self, chains: usize) -> Self {
        self.0.chains = chains;
        self
    }

    /// Set proposal scale
    pub fn step_size(mut self, step_size: f64) -> Self {
        self.0.step_size = step_size;
        self
    }

    /// Set per-parameter move probability
    pub fn move_prob(mut self, move_prob: f64) -> Self {
        self.0.move_prob = move_prob;
        self
    }

    /// Set number of kept draws, a multiple of the report interval
    pub fn samples(mut self, samples: usize) -> Self {
        self.0.samples = samples;
        self
    }

    /// Set number of discarded draws, a multiple of the report interval
    pub fn burnin(mut self, burnin: usize) -> Self {
        self.0.burnin = burnin;
        self
    }

    /// Set report interval
    pub fn report_interval(mut self, report_interval: usize) -> Self {
        self.0.report_interval = report_interval;
        self
    }

    /// Set random generator seed
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.0.seed = seed;
        self
    }
}

impl From<McmcValidParams> for McmcParams {
    fn from(valid: McmcValidParams) -> Self {
        McmcParams(valid)
    }
}

impl ParamGuard for McmcParams {
    type Checked = McmcValidParams;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        let p = &self.0;
        if p.chains == 0 {
            return Err(GpError::InvalidValueError(
                "`chains` cannot be 0".to_string(),
            ));
        }
        if !(p.step_size > 0.) {
            return Err(GpError::InvalidValueError(format!(
                "`step_size` should be positive, got {}",
                p.step_size
            )));
        }
        if !(p.move_prob > 0. && p.move_prob <= 1.) {
            return Err(GpError::InvalidValueError(format!(
                "`move_prob` should be in (0, 1], got {}",
                p.move_prob
            )));
        }
        if p.report_interval == 0 || p.samples == 0 {
            return Err(GpError::InvalidValueError(
                "`report_interval` and `samples` cannot be 0".to_string(),
            ));
        }
        if p.samples % p.report_interval != 0 || p.burnin % p.report_interval != 0 {
            return Err(GpError::InvalidValueError(format!(
                "`samples` ({}) and `burnin` ({}) should be multiples of `report_interval` ({})",
                p.samples, p.burnin, p.report_interval
            )));
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

/// Reduction of posterior draws to a single parameter set
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reduce {
    /// Mean of the draws
    Mean,
    /// Median of the draws
    Median,
}

/// A set of validated prediction parameters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PredictValidParams {
    /// Number of evenly thinned posterior draws to predict with, all draws if none
    pub(crate) subsample: Option<usize>,
    /// Predict with a single reduced parameter set
    pub(crate) reduce: Option<Reduce>,
}

impl PredictValidParams {
    /// Get number of thinned draws
    pub fn subsample(&self) -> Option<usize> {
        self.subsample
    }

    /// Get posterior reduction
    pub fn reduce(&self) -> Option<Reduce> {
        self.reduce
    }
}

#[derive(Clone, Debug, Default)]
/// The set of hyperparameters that can be specified for [`crate::Model::predict`].
/// They only apply to models holding posterior draws.
pub struct PredictParams(PredictValidParams);

impl PredictParams {
    /// Default prediction parameters: a gaussian mixture over every draw
    pub fn new() -> PredictParams {
        Self::default()
    }

    /// Set number of evenly thinned draws
    pub fn subsample(mut self, subsample: Option<usize>) -> Self {
        self.0.subsample = subsample;
        self
    }

    /// Set posterior reduction
    pub fn reduce(mut self, reduce: Option<Reduce>) -> Self {
        self.0.reduce = reduce;
        self
    }
}

impl From<PredictValidParams> for PredictParams {
    fn from(valid: PredictValidParams) -> Self {
        PredictParams(valid)
    }
}

impl ParamGuard for PredictParams {
    type Checked = PredictValidParams;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        if self.0.subsample.is_some() && self.0.reduce.is_some() {
            return Err(GpError::InvalidValueError(
                "`subsample` and `reduce` cannot both be given".to_string(),
            ));
        }
        if self.0.subsample == Some(0) {
            return Err(GpError::InvalidValueError(
                "`subsample` cannot be 0".to_string(),
            ));
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}
