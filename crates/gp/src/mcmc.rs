//! Replica exchange (parallel tempering) random walk Metropolis sampler.
//!
//! Chain `k` targets the posterior raised to the inverse temperature `0.5^k`;
//! only the draws of the untempered chain `0` are returned. Each step proposes
//! a move in every chain, accepts it with the Metropolis rule at the chain
//! temperature, then attempts swaps between adjacent temperatures, alternating
//! even and odd pairs from one step to the next.
//!
//! A proposal moves each parameter with probability `move_prob` by
//! `N(0, 1) * e` where `e` is drawn once per chain from an exponential
//! distribution of mean `step_size / sqrt(inverse temperature)`.

use crate::errors::Result;
use crate::parameters::McmcValidParams;
use log::debug;
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, Axis};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::{Exp1, StandardNormal};

/// Draws and diagnostics of a burst of steps
#[derive(Clone, Debug)]
pub(crate) struct Burst {
    /// Untempered chain states, one row per step
    pub draws: Array2<f64>,
    /// Fraction of accepted moves per chain
    pub accept_rates: Array1<f64>,
    /// Number of accepted swaps
    pub swaps: usize,
}

pub(crate) struct ReplicaExchange<F, R> {
    log_prob: F,
    rng: R,
    inv_temps: Array1<f64>,
    scales: Array1<f64>,
    move_prob: f64,
    states: Array2<f64>,
    log_probs: Array1<f64>,
    steps: usize,
}

impl<F, R> ReplicaExchange<F, R>
where
    F: Fn(&Array1<f64>) -> Result<f64> + Sync,
    R: Rng,
{
    /// Every chain starts from `init`, whose log probability must be computable
    pub fn new(log_prob: F, init: &Array1<f64>, params: &McmcValidParams, rng: R) -> Result<Self> {
        let chains = params.chains();
        let inv_temps = Array1::from_shape_fn(chains, |k| 0.5f64.powi(k as i32));
        let scales = inv_temps.mapv(|b| params.step_size() / b.sqrt());
        let lp = log_prob(init)?;
        let mut states = Array2::zeros((chains, init.len()));
        states.rows_mut().into_iter().for_each(|mut row| row.assign(init));
        Ok(ReplicaExchange {
            log_prob,
            rng,
            inv_temps,
            scales,
            move_prob: params.move_prob(),
            states,
            log_probs: Array1::from_elem(chains, lp),
            steps: 0,
        })
    }

    fn propose(&mut self) -> Array2<f64> {
        let mut proposals = self.states.clone();
        for (mut row, &scale) in proposals.rows_mut().into_iter().zip(self.scales.iter()) {
            let e: f64 = self.rng.sample(Exp1);
            for x in row.iter_mut() {
                let pick = self.rng.gen_bool(self.move_prob);
                let direction: f64 = self.rng.sample(StandardNormal);
                if pick {
                    *x += direction * e * scale;
                }
            }
        }
        proposals
    }

    /// Log probability of proposals evaluated in parallel, failed evaluations being rejected
    fn evaluate(&self, proposals: &Array2<f64>) -> Array1<f64> {
        let log_prob = &self.log_prob;
        let lps: Vec<f64> = proposals
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|p| match log_prob(&p.to_owned()) {
                Ok(lp) if !lp.is_nan() => lp,
                Ok(_) => f64::NEG_INFINITY,
                Err(err) => {
                    debug!("Proposal rejected: {err}");
                    f64::NEG_INFINITY
                }
            })
            .collect();
        Array1::from(lps)
    }

    /// One Metropolis step per chain followed by swap attempts, returns acceptances
    fn step(&mut self) -> (Vec<bool>, usize) {
        let proposals = self.propose();
        let lps = self.evaluate(&proposals);
        let mut accepted = vec![false; self.inv_temps.len()];
        for k in 0..self.inv_temps.len() {
            let log_ratio = self.inv_temps[k] * (lps[k] - self.log_probs[k]);
            let u: f64 = self.rng.gen();
            if lps[k].is_finite() && u.ln() < log_ratio {
                self.states.row_mut(k).assign(&proposals.row(k));
                self.log_probs[k] = lps[k];
                accepted[k] = true;
            }
        }

        let mut swaps = 0;
        let mut k = self.steps % 2;
        while k + 1 < self.inv_temps.len() {
            let log_ratio = (self.inv_temps[k] - self.inv_temps[k + 1])
                * (self.log_probs[k + 1] - self.log_probs[k]);
            let u: f64 = self.rng.gen();
            if u.ln() < log_ratio {
                let (a, b) = (self.states.row(k).to_owned(), self.states.row(k + 1).to_owned());
                self.states.row_mut(k).assign(&b);
                self.states.row_mut(k + 1).assign(&a);
                self.log_probs.swap(k, k + 1);
                swaps += 1;
            }
            k += 2;
        }
        self.steps += 1;
        (accepted, swaps)
    }

    /// Runs `n` steps
    pub fn burst(&mut self, n: usize) -> Burst {
        let chains = self.inv_temps.len();
        let mut draws = Array2::zeros((n, self.states.ncols()));
        let mut accepts = Array1::<f64>::zeros(chains);
        let mut swaps = 0;
        for i in 0..n {
            let (accepted, s) = self.step();
            accepted
                .iter()
                .zip(accepts.iter_mut())
                .for_each(|(&a, acc)| *acc += if a { 1. } else { 0. });
            swaps += s;
            draws.row_mut(i).assign(&self.states.row(0));
        }
        Burst {
            draws,
            accept_rates: accepts / n.max(1) as f64,
            swaps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::McmcParams;
    use approx::assert_abs_diff_eq;
    use linfa::ParamGuard;
    use ndarray::array;
    use ndarray_rand::rand::SeedableRng;
    use rand_xoshiro::Xoshiro256Plus;

    #[test]
    fn test_standard_normal_target() {
        let params = McmcParams::new()
            .chains(3)
            .step_size(1.)
            .move_prob(1.)
            .check()
            .unwrap();
        let target = |x: &Array1<f64>| -> Result<f64> { Ok(-0.5 * x.dot(x)) };
        let mut sampler = ReplicaExchange::new(
            target,
            &array![3., -3.],
            &params,
            Xoshiro256Plus::seed_from_u64(42),
        )
        .unwrap();
        assert_abs_diff_eq!(sampler.inv_temps, array![1., 0.5, 0.25]);
        let _ = sampler.burst(1000);
        let burst = sampler.burst(20000);
        let mean = burst.draws.mean_axis(Axis(0)).unwrap();
        let var = burst.draws.var_axis(Axis(0), 0.);
        assert_abs_diff_eq!(mean, array![0., 0.], epsilon = 0.15);
        assert_abs_diff_eq!(var, array![1., 1.], epsilon = 0.2);
        assert!(burst.accept_rates.iter().all(|&r| r > 0.05 && r < 0.95));
        assert!(burst.swaps > 0);
    }

    #[test]
    fn test_failed_proposals_are_rejected() {
        let params = McmcParams::new().chains(1).check().unwrap();
        // Support is x > 0
        let target = |x: &Array1<f64>| -> Result<f64> {
            if x[0] > 0. {
                Ok(-x[0])
            } else {
                Err(crate::errors::GpError::InvalidValueError("outside".to_string()))
            }
        };
        let mut sampler =
            ReplicaExchange::new(target, &array![1.], &params, Xoshiro256Plus::seed_from_u64(0))
                .unwrap();
        let burst = sampler.burst(500);
        assert!(burst.draws.iter().all(|&x| x > 0.));
    }
}
