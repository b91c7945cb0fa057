/*!
Affine-invariant ensemble sampler (Goodman & Weare stretch move).

The walkers are split into two halves; each walker of one half proposes
`y = x_k + z (x_j - x_k)` towards a random walker `x_k` of the other half, with the stretch
factor `z` drawn from `g(z) ∝ 1/sqrt(z)` on `[1/a, a]`. The proposal is accepted with
probability `min(1, z^(d-1) p(y) / p(x_j))`.
*/

use ndarray::{Array1, Array2, ArrayView2};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{progress_bar, run_kernel_with_progress, Chain, Kernel, Population};
use crate::error::{PoppyError, Result};
use crate::flows::Flow;
use crate::model::Model;
use crate::samplers::{evaluate, initial_walkers, log_prob, Sampler};
use crate::samples::Samples;
use crate::stats::integrated_autocorr_time;
use crate::transforms::{AffineTransform, DataTransform};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Number of walkers; defaults to the number of requested samples.
    pub n_walkers: Option<usize>,
    pub n_steps: usize,
    /// Steps dropped from the start of the chain.
    pub discard: usize,
    /// Stretch scale `a`.
    pub stretch: f64,
    pub progress: bool,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            n_walkers: None,
            n_steps: 500,
            discard: 0,
            stretch: 2.0,
            progress: false,
        }
    }
}

/// The stretch move as a population [`Kernel`].
#[derive(Debug, Clone)]
pub struct StretchMove {
    a: f64,
    rng: SmallRng,
}

impl StretchMove {
    pub fn new(a: f64, seed: u64) -> Result<Self> {
        if a <= 1.0 {
            return Err(PoppyError::invalid("stretch scale must exceed 1"));
        }
        Ok(Self {
            a,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    fn draw_z(&mut self) -> f64 {
        let u: f64 = self.rng.gen();
        ((self.a - 1.0) * u + 1.0).powi(2) / self.a
    }

    /// Updates the walkers in `active` using the walkers in `complement` as anchors.
    fn half_step<F>(
        &mut self,
        population: &mut Population,
        active: &[usize],
        complement: &[usize],
        log_prob: &F,
    ) -> Result<usize>
    where
        F: Fn(ArrayView2<f64>) -> Result<Array1<f64>>,
    {
        let dims = population.dims();
        let mut proposals = Array2::<f64>::zeros((active.len(), dims));
        let mut zs = Vec::with_capacity(active.len());
        for (row, &j) in active.iter().enumerate() {
            let k = complement[self.rng.gen_range(0..complement.len())];
            let z = self.draw_z();
            let xj = population.positions.row(j);
            let xk = population.positions.row(k);
            proposals.row_mut(row).assign(&(&xk + &((&xj - &xk) * z)));
            zs.push(z);
        }
        let lp_new = log_prob(proposals.view())?;

        let mut n_accepted = 0;
        for (row, &j) in active.iter().enumerate() {
            let log_ratio =
                (dims as f64 - 1.0) * zs[row].ln() + lp_new[row] - population.log_prob[j];
            let u: f64 = self.rng.gen();
            if log_ratio > u.ln() {
                population
                    .positions
                    .row_mut(j)
                    .assign(&proposals.row(row));
                population.log_prob[j] = lp_new[row];
                n_accepted += 1;
            }
        }
        Ok(n_accepted)
    }
}

impl Kernel for StretchMove {
    fn step<F>(&mut self, population: &mut Population, log_prob: &F) -> Result<f64>
    where
        F: Fn(ArrayView2<f64>) -> Result<Array1<f64>>,
    {
        let n = population.n_walkers();
        if n < 2 {
            return Err(PoppyError::invalid("the stretch move needs at least two walkers"));
        }
        let half = n / 2;
        let first: Vec<usize> = (0..half).collect();
        let second: Vec<usize> = (half..n).collect();
        let accepted = self.half_step(population, &first, &second, log_prob)?
            + self.half_step(population, &second, &first, log_prob)?;
        Ok(accepted as f64 / n as f64)
    }
}

/// Ensemble MCMC in the preconditioned space, initialised from the flow.
///
/// The returned samples are the flattened chain after `discard`. Since MCMC samples carry no
/// proposal density, the evidence is estimated by a separate importance pass of `n_samples`
/// flow draws and attached to the result.
#[derive(Debug)]
pub struct EnsembleSampler {
    config: EnsembleConfig,
    transform: Box<dyn DataTransform>,
    rng: SmallRng,
    chain: Option<Chain>,
}

impl EnsembleSampler {
    pub fn new(config: EnsembleConfig) -> Self {
        Self {
            config,
            transform: Box::new(AffineTransform::new()),
            rng: SmallRng::from_entropy(),
            chain: None,
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

    /// Chain of the last run, in the preconditioned space.
    pub fn chain(&self) -> Option<&Chain> {
        self.chain.as_ref()
    }
}

impl Default for EnsembleSampler {
    fn default() -> Self {
        Self::new(EnsembleConfig::default())
    }
}

impl Sampler for EnsembleSampler {
    fn sample<M, F>(&mut self, model: &M, flow: &mut F, n_samples: usize) -> Result<Samples>
    where
        M: Model + ?Sized,
        F: Flow + ?Sized,
    {
        let n_walkers = self.config.n_walkers.unwrap_or(n_samples);
        let dims = model.dims();
        if n_walkers < 2 * dims {
            warn!(n_walkers, dims, "fewer than 2 * dims walkers");
        }
        if self.config.discard >= self.config.n_steps {
            return Err(PoppyError::invalid(format!(
                "cannot discard {} of {} steps",
                self.config.discard, self.config.n_steps
            )));
        }

        let z0 = initial_walkers(flow, self.transform.as_mut(), n_walkers)?;
        let transform = self.transform.as_ref();
        let target = |z: ArrayView2<f64>| log_prob(model, transform, z);
        let mut population = Population::evaluate(z0, &target)?;
        let mut kernel = StretchMove::new(self.config.stretch, self.rng.gen())?;

        info!(n_walkers, n_steps = self.config.n_steps, "running ensemble sampler");
        let pb = progress_bar("Ensemble", self.config.n_steps, self.config.progress);
        let chain = run_kernel_with_progress(
            &mut kernel,
            &mut population,
            &target,
            self.config.n_steps,
            &pb,
        )?;
        if let Ok(tau) = integrated_autocorr_time(chain.samples.view(), 5.0) {
            debug!(?tau, "integrated autocorrelation time");
        }

        let (z, _) = chain.flat(self.config.discard, 1)?;
        let (x, _) = transform.inverse(z.view())?;
        self.chain = Some(chain);

        let (x_evidence, log_q) = flow.sample_and_log_prob(n_samples)?;
        let evidence_samples = evaluate(model, x_evidence, Some(log_q))?;

        let samples = evaluate(model, x, None)?;
        match evidence_samples.log_evidence {
            Some(log_z) => {
                Ok(samples.with_log_evidence(log_z, evidence_samples.log_evidence_error))
            }
            None => Ok(samples),
        }
    }
}
