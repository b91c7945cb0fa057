/*!
Sequential Monte Carlo with adaptive tempering.

The particles start as flow draws, which exactly target `q` at `β = 0`, and move along the
path `p_β ∝ q^(1-β) (L π)^β` until `β = 1`. Each iteration

1. picks the next `β` by bisection so that the effective sample size of the incremental
   weights is `target_efficiency * n` (or jumps straight to 1 when that is already enough),
2. adds the log mean incremental weight to the running log evidence,
3. resamples multinomially,
4. mutates the particles with t-pCN steps targeting `p_β` in a preconditioned space.
*/

use ndarray::{Array1, ArrayView2};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::{progress_bar, run_kernel, Population};
use crate::error::{PoppyError, Result};
use crate::flows::Flow;
use crate::model::Model;
use crate::samplers::pcn::{PcnKernel, StepFn};
use crate::samplers::Sampler;
use crate::samples::{Samples, SmcSamples};
use crate::transforms::{AffineTransform, DataTransform};

const BISECTION_TOLERANCE: f64 = 1e-8;
const MAX_BISECTION_STEPS: usize = 100;
const TARGET_ACCEPTANCE_RATE: f64 = 0.234;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmcConfig {
    /// Fraction of the particles that should remain effective after each reweighting.
    pub target_efficiency: f64,
    /// MCMC steps per temperature.
    pub n_mcmc_steps: usize,
    pub step_fn: StepFn,
    pub rho: f64,
    pub nu: f64,
    pub max_iterations: usize,
    pub progress: bool,
}

impl Default for SmcConfig {
    fn default() -> Self {
        Self {
            target_efficiency: 0.5,
            n_mcmc_steps: 10,
            step_fn: StepFn::Tpcn,
            rho: 0.5,
            nu: 5.0,
            max_iterations: 1000,
            progress: false,
        }
    }
}

/// Tempered SMC from the flow to the posterior.
#[derive(Debug)]
pub struct SmcSampler {
    config: SmcConfig,
    transform: Box<dyn DataTransform>,
    rng: SmallRng,
    betas: Vec<f64>,
}

impl SmcSampler {
    pub fn new(config: SmcConfig) -> Self {
        Self {
            config,
            transform: Box::new(AffineTransform::new()),
            rng: SmallRng::from_entropy(),
            betas: Vec::new(),
        }
    }

    pub fn with_preconditioning(mut self, transform: Box<dyn DataTransform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Inverse temperatures visited during the last run, starting at 0.
    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    /// Next inverse temperature: the largest `β ≤ 1` whose incremental weights keep
    /// `target_efficiency * n` effective samples.
    pub fn next_beta(&self, samples: &SmcSamples) -> Result<f64> {
        let target = self.config.target_efficiency * samples.len() as f64;
        if samples.effective_sample_size(1.0)? >= target {
            return Ok(1.0);
        }
        let (mut lo, mut hi) = (samples.beta, 1.0);
        for _ in 0..MAX_BISECTION_STEPS {
            if hi - lo < BISECTION_TOLERANCE {
                break;
            }
            let mid = 0.5 * (lo + hi);
            if samples.effective_sample_size(mid)? >= target {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        // Always make progress, even when a single step is too aggressive.
        Ok(if lo > samples.beta { lo } else { hi })
    }

    /// Moves the particles with `n_mcmc_steps` kernel steps targeting `p_β`, returning them
    /// with fresh log-likelihood, log-prior and flow density.
    fn mutate<M, F>(
        &mut self,
        model: &M,
        flow: &F,
        samples: SmcSamples,
        kernel: &mut PcnKernel,
    ) -> Result<SmcSamples>
    where
        M: Model + ?Sized,
        F: Flow + ?Sized,
    {
        let beta = samples.beta;
        let z0 = self.transform.fit(samples.x.view())?;
        let transform = self.transform.as_ref();
        let target = |z: ArrayView2<f64>| -> Result<Array1<f64>> {
            let (x, log_abs_det_jacobian) = transform.inverse(z)?;
            let log_q = flow.log_prob(x.view())?;
            let log_target = model.log_likelihood(x.view()) + model.log_prior(x.view());
            Ok(log_q * (1.0 - beta) + log_target * beta + log_abs_det_jacobian)
        };
        let mut population = Population::evaluate(z0, &target)?;
        let chain = run_kernel(kernel, &mut population, &target, self.config.n_mcmc_steps)?;
        debug!(
            beta,
            acceptance = chain.acceptance_rate(),
            rho = kernel.rho(),
            "SMC mutation"
        );

        let (x, _) = transform.inverse(population.positions.view())?;
        let log_likelihood = model.log_likelihood(x.view());
        let log_prior = model.log_prior(x.view());
        let log_q = flow.log_prob(x.view())?;
        let mut out = SmcSamples::new(x, log_likelihood, log_prior, log_q, beta)?;
        out.parameters = samples.parameters;
        out.log_evidence = samples.log_evidence;
        out.log_evidence_error = samples.log_evidence_error;
        Ok(out)
    }
}

impl Default for SmcSampler {
    fn default() -> Self {
        Self::new(SmcConfig::default())
    }
}

impl Sampler for SmcSampler {
    fn sample<M, F>(&mut self, model: &M, flow: &mut F, n_samples: usize) -> Result<Samples>
    where
        M: Model + ?Sized,
        F: Flow + ?Sized,
    {
        if !(self.config.target_efficiency > 0.0 && self.config.target_efficiency < 1.0) {
            return Err(PoppyError::invalid("target_efficiency must lie in (0, 1)"));
        }
        if n_samples < 2 {
            return Err(PoppyError::invalid("SMC needs at least two particles"));
        }
        let mut kernel = PcnKernel::new(
            self.config.step_fn,
            self.config.rho,
            TARGET_ACCEPTANCE_RATE,
            self.config.nu,
        )?
        .set_seed(self.rng.gen());

        let (x, log_q) = flow.sample_and_log_prob(n_samples)?;
        let log_likelihood = model.log_likelihood(x.view());
        let log_prior = model.log_prior(x.view());
        let mut samples = SmcSamples::new(x, log_likelihood, log_prior, log_q, 0.0)?;
        samples.parameters = model.parameters();
        samples.log_evidence = Some(0.0);

        let mut log_evidence = 0.0;
        let mut relative_variance = 0.0;
        self.betas = vec![0.0];
        info!(n_samples, "running SMC sampler");
        let pb = progress_bar("SMC", 100, self.config.progress);

        let mut iteration = 0;
        while samples.beta < 1.0 {
            if iteration >= self.config.max_iterations {
                return Err(PoppyError::invalid(format!(
                    "SMC reached beta={} after {iteration} iterations",
                    samples.beta
                )));
            }
            iteration += 1;

            let beta = self.next_beta(&samples)?;
            log_evidence += samples.log_evidence_ratio(beta);
            let log_w = samples.log_weights(beta)?;
            let w = log_w.mapv(f64::exp);
            relative_variance += w.mapv(|v| (v - 1.0).powi(2)).sum()
                / (n_samples as f64 * (n_samples as f64 - 1.0));

            let mut resampled = samples.resample(beta, None, &mut self.rng)?;
            resampled.log_evidence = Some(log_evidence);
            resampled.log_evidence_error = Some(relative_variance.sqrt());
            samples = self.mutate(model, &*flow, resampled, &mut kernel)?;
            self.betas.push(beta);

            pb.set_position((100.0 * beta) as u64);
            pb.set_message(format!("beta={beta:.3} log Z≈{log_evidence:.2}"));
            info!(iteration, beta, log_evidence, "SMC iteration");
        }
        pb.finish_with_message("Done!");

        samples.to_standard_samples()
    }
}
