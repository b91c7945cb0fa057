/*!
Preconditioned Crank-Nicolson samplers.

[`StepFn::Pcn`] proposes `z' = sqrt(1 - ρ²) z + ρ ξ` with `ξ ~ N(0, I)`, which leaves the
standard normal invariant, so proposals are accepted with the ratio of `p / N(0, I)`.

[`StepFn::Tpcn`] is the Student-t variant. The walkers' mean `μ` and per-dimension scale `σ`
define a multivariate t with `ν` degrees of freedom; each walker first draws a latent scale
`W ~ InvGamma((ν + d)/2, (ν + Q(z))/2)` with `Q(z) = |(z - μ)/σ|²` and then proposes
`z' = μ + sqrt(1 - ρ²)(z - μ) + ρ sqrt(W) σ ξ`. Acceptance uses the ratio of `p / t`.

In both cases the step size `ρ` is adapted after every step towards a target acceptance
rate.
*/

use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use rand::prelude::*;
use rand_distr::{Gamma, StandardNormal};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::{progress_bar, run_kernel_with_progress, Chain, Kernel, Population};
use crate::error::{PoppyError, Result};
use crate::flows::Flow;
use crate::model::Model;
use crate::samplers::{evaluate, initial_walkers, log_prob, Sampler};
use crate::samples::Samples;
use crate::transforms::{AffineTransform, DataTransform};

const MIN_RHO: f64 = 1e-3;
const MAX_RHO: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepFn {
    Pcn,
    Tpcn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcnConfig {
    pub n_steps: usize,
    pub thin: usize,
    pub burnin: usize,
    /// Keep only the final position of every walker.
    pub last_step_only: bool,
    pub step_fn: StepFn,
    pub target_acceptance_rate: f64,
    /// Initial step size `ρ`.
    pub rho: f64,
    /// Degrees of freedom of the t-pCN reference distribution.
    pub nu: f64,
    pub progress: bool,
}

impl Default for PcnConfig {
    fn default() -> Self {
        Self {
            n_steps: 100,
            thin: 1,
            burnin: 0,
            last_step_only: false,
            step_fn: StepFn::Tpcn,
            target_acceptance_rate: 0.234,
            rho: 0.5,
            nu: 5.0,
            progress: false,
        }
    }
}

/// A (t-)pCN transition with an adaptive step size.
#[derive(Debug, Clone)]
pub struct PcnKernel {
    step_fn: StepFn,
    rho: f64,
    target_acceptance_rate: f64,
    nu: f64,
    rng: SmallRng,
    rho_history: Vec<f64>,
}

impl PcnKernel {
    pub fn new(step_fn: StepFn, rho: f64, target_acceptance_rate: f64, nu: f64) -> Result<Self> {
        if !(rho > 0.0 && rho <= MAX_RHO) {
            return Err(PoppyError::invalid(format!("rho must lie in (0, 1], got {rho}")));
        }
        if !(0.0..1.0).contains(&target_acceptance_rate) {
            return Err(PoppyError::invalid("target acceptance rate must lie in [0, 1)"));
        }
        if nu <= 0.0 {
            return Err(PoppyError::invalid("nu must be positive"));
        }
        Ok(Self {
            step_fn,
            rho,
            target_acceptance_rate,
            nu,
            rng: SmallRng::from_entropy(),
            rho_history: Vec::new(),
        })
    }

    pub fn from_config(config: &PcnConfig) -> Result<Self> {
        Self::new(
            config.step_fn,
            config.rho,
            config.target_acceptance_rate,
            config.nu,
        )
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Current step size.
    pub fn rho(&self) -> f64 {
        self.rho
    }

    /// Step size after each completed step.
    pub fn rho_history(&self) -> &[f64] {
        &self.rho_history
    }

    fn adapt(&mut self, acceptance: f64) {
        self.rho = (self.rho * (acceptance - self.target_acceptance_rate).exp())
            .clamp(MIN_RHO, MAX_RHO);
        self.rho_history.push(self.rho);
    }

    fn noise(&mut self, n: usize, dims: usize) -> Array2<f64> {
        Array2::from_shape_simple_fn((n, dims), || self.rng.sample::<f64, _>(StandardNormal))
    }

    /// Proposals and the log density of the reference measure at the current and proposed
    /// points.
    fn propose(
        &mut self,
        z: ArrayView2<f64>,
    ) -> Result<(Array2<f64>, Array1<f64>, Array1<f64>)> {
        let (n, dims) = z.dim();
        let xi = self.noise(n, dims);
        let c = (1.0 - self.rho * self.rho).sqrt();
        match self.step_fn {
            StepFn::Pcn => {
                let proposals = &z * c + &xi * self.rho;
                let log_ref = |x: ArrayView2<f64>| x.map_axis(Axis(1), |r| -0.5 * r.dot(&r));
                let ref_old = log_ref(z);
                let ref_new = log_ref(proposals.view());
                Ok((proposals, ref_old, ref_new))
            }
            StepFn::Tpcn => {
                let mu = z
                    .mean_axis(Axis(0))
                    .ok_or_else(|| PoppyError::invalid("t-pCN needs at least one walker"))?;
                let ddof = if n > 1 { 1.0 } else { 0.0 };
                let sigma = z
                    .std_axis(Axis(0), ddof)
                    .mapv(|s| if s.is_finite() && s > 0.0 { s } else { 1.0 });
                let alpha = 0.5 * (self.nu + dims as f64);
                let nu = self.nu;
                let quad = |x: ArrayView2<f64>| {
                    let u = (&x - &mu) / &sigma;
                    u.map_axis(Axis(1), |r| r.dot(&r))
                };
                let log_t = |q: &Array1<f64>| q.mapv(|q| -alpha * (q / nu).ln_1p());

                let q_old = quad(z);
                let mut proposals = Array2::<f64>::zeros((n, dims));
                for (i, mut row) in proposals.axis_iter_mut(Axis(0)).enumerate() {
                    let scale = 2.0 / (nu + q_old[i]);
                    let gamma = Gamma::new(alpha, scale)
                        .map_err(|e| PoppyError::invalid(format!("t-pCN latent scale: {e}")))?;
                    let w = 1.0 / self.rng.sample(gamma);
                    let spread = self.rho * w.sqrt();
                    Zip::from(&mut row)
                        .and(z.row(i))
                        .and(&mu)
                        .and(&sigma)
                        .and(xi.row(i))
                        .for_each(|p, &zi, &m, &s, &e| *p = m + c * (zi - m) + spread * s * e);
                }
                let ref_old = log_t(&q_old);
                let ref_new = log_t(&quad(proposals.view()));
                Ok((proposals, ref_old, ref_new))
            }
        }
    }
}

impl Kernel for PcnKernel {
    fn step<F>(&mut self, population: &mut Population, log_prob: &F) -> Result<f64>
    where
        F: Fn(ArrayView2<f64>) -> Result<Array1<f64>>,
    {
        let n = population.n_walkers();
        if n == 0 {
            return Err(PoppyError::invalid("cannot step an empty population"));
        }
        let (proposals, ref_old, ref_new) = self.propose(population.positions.view())?;
        let lp_new = log_prob(proposals.view())?;

        let mut n_accepted = 0;
        for i in 0..n {
            let log_ratio = (lp_new[i] - ref_new[i]) - (population.log_prob[i] - ref_old[i]);
            let u: f64 = self.rng.gen();
            if log_ratio > u.ln() {
                population
                    .positions
                    .row_mut(i)
                    .assign(&proposals.row(i));
                population.log_prob[i] = lp_new[i];
                n_accepted += 1;
            }
        }
        let acceptance = n_accepted as f64 / n as f64;
        self.adapt(acceptance);
        Ok(acceptance)
    }
}

/// pCN / t-pCN walkers in the preconditioned space, one per requested sample, initialised
/// from the flow.
#[derive(Debug)]
pub struct PcnSampler {
    config: PcnConfig,
    transform: Box<dyn DataTransform>,
    rng: SmallRng,
    chain: Option<Chain>,
    rho_history: Vec<f64>,
}

impl PcnSampler {
    pub fn new(config: PcnConfig) -> Self {
        Self {
            config,
            transform: Box::new(AffineTransform::new()),
            rng: SmallRng::from_entropy(),
            chain: None,
            rho_history: Vec::new(),
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

    /// Step sizes used during the last run.
    pub fn rho_history(&self) -> &[f64] {
        &self.rho_history
    }
}

impl Default for PcnSampler {
    fn default() -> Self {
        Self::new(PcnConfig::default())
    }
}

impl Sampler for PcnSampler {
    fn sample<M, F>(&mut self, model: &M, flow: &mut F, n_samples: usize) -> Result<Samples>
    where
        M: Model + ?Sized,
        F: Flow + ?Sized,
    {
        let mut kernel = PcnKernel::from_config(&self.config)?.set_seed(self.rng.gen());
        let z0 = initial_walkers(flow, self.transform.as_mut(), n_samples)?;
        let transform = self.transform.as_ref();
        let target = |z: ArrayView2<f64>| log_prob(model, transform, z);
        let mut population = Population::evaluate(z0, &target)?;

        info!(
            n_walkers = n_samples,
            n_steps = self.config.n_steps,
            step_fn = ?self.config.step_fn,
            "running pCN sampler"
        );
        let pb = progress_bar("pCN", self.config.n_steps, self.config.progress);
        let chain = run_kernel_with_progress(
            &mut kernel,
            &mut population,
            &target,
            self.config.n_steps,
            &pb,
        )?;
        debug!(rho = kernel.rho(), "final pCN step size");

        let z = if self.config.last_step_only {
            chain
                .last()
                .ok_or_else(|| PoppyError::invalid("n_steps must be positive"))?
                .0
        } else {
            chain.flat(self.config.burnin, self.config.thin)?.0
        };
        let (x, _) = transform.inverse(z.view())?;
        self.chain = Some(chain);
        self.rho_history = kernel.rho_history().to_vec();
        evaluate(model, x, None)
    }
}
