/*!
Samplers that turn a fitted [`Flow`] into posterior samples.

- [`ImportanceSampler`] draws from the flow and weights every draw by `L π / q`.
- [`EnsembleSampler`] runs the affine-invariant stretch move in a preconditioned space.
- [`PcnSampler`] runs (t-)preconditioned Crank-Nicolson walkers started from the flow.
- [`SmcSampler`] tempers from the flow to the posterior with sequential Monte Carlo.

The MCMC samplers work in the space of a preconditioning [`DataTransform`] fitted to the
initial walkers, so their target is [`log_prob`], the posterior density of `z` including the
Jacobian of the inverse transform.
*/

pub mod ensemble;
pub mod importance;
pub mod pcn;
pub mod smc;

pub use ensemble::{EnsembleConfig, EnsembleSampler};
pub use importance::{ImportanceConfig, ImportanceSampler};
pub use pcn::{PcnConfig, PcnKernel, PcnSampler, StepFn};
pub use smc::{SmcConfig, SmcSampler};

use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::{PoppyError, Result};
use crate::flows::Flow;
use crate::model::Model;
use crate::samples::Samples;
use crate::transforms::DataTransform;

/// Produces [`Samples`] of a model's posterior with the help of a fitted flow.
pub trait Sampler {
    fn sample<M, F>(&mut self, model: &M, flow: &mut F, n_samples: usize) -> Result<Samples>
    where
        M: Model + ?Sized,
        F: Flow + ?Sized;
}

/// Sampler selection for [`crate::poppy::Poppy::sample_posterior`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "sampler", rename_all = "snake_case")]
pub enum SamplerConfig {
    Importance(ImportanceConfig),
    Ensemble(EnsembleConfig),
    Pcn(PcnConfig),
    Smc(SmcConfig),
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self::Importance(ImportanceConfig::default())
    }
}

/// Evaluates the model on `x` and packs everything into [`Samples`].
///
/// When `log_q` is given the importance weights and the evidence are computed as well.
pub fn evaluate<M>(model: &M, x: Array2<f64>, log_q: Option<Array1<f64>>) -> Result<Samples>
where
    M: Model + ?Sized,
{
    if x.ncols() != model.dims() {
        return Err(PoppyError::shape(format!(
            "model has {} dimensions, samples have {}",
            model.dims(),
            x.ncols()
        )));
    }
    let log_likelihood = model.log_likelihood(x.view());
    let log_prior = model.log_prior(x.view());
    let samples = Samples::new(x)
        .with_parameters(model.parameters())?
        .with_log_likelihood(log_likelihood)?
        .with_log_prior(log_prior)?;
    match log_q {
        Some(log_q) => samples.with_log_q(log_q),
        None => Ok(samples),
    }
}

/// Posterior log density of preconditioned points `z`.
///
/// `x, log|dx/dz| = transform.inverse(z)` and the result is
/// `log L(x) + log π(x) + log|dx/dz|`.
pub fn log_prob<M>(
    model: &M,
    transform: &dyn DataTransform,
    z: ArrayView2<f64>,
) -> Result<Array1<f64>>
where
    M: Model + ?Sized,
{
    let (x, log_abs_det_jacobian) = transform.inverse(z)?;
    let ll = model.log_likelihood(x.view());
    let lp = model.log_prior(x.view());
    Ok(ll + lp + log_abs_det_jacobian)
}

/// Draws `n_walkers` points from the flow and fits `transform` on them, returning the walkers
/// in the preconditioned space.
pub(crate) fn initial_walkers<F>(
    flow: &mut F,
    transform: &mut dyn DataTransform,
    n_walkers: usize,
) -> Result<Array2<f64>>
where
    F: Flow + ?Sized,
{
    let p0 = flow.sample(n_walkers)?;
    transform.fit(p0.view())
}
