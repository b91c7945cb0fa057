//! Importance sampling with the flow as proposal.

use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::flows::Flow;
use crate::model::Model;
use crate::samplers::{evaluate, Sampler};
use crate::samples::Samples;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportanceConfig {
    /// Return an unweighted subset drawn by rejection sampling instead of weighted samples.
    pub rejection_sample: bool,
}

/// Draws from the flow and weights each draw by `L π / q`.
///
/// The evidence is the mean weight; with `rejection_sample` the returned unweighted subset
/// still carries that evidence estimate.
#[derive(Debug, Clone)]
pub struct ImportanceSampler {
    config: ImportanceConfig,
    rng: SmallRng,
}

impl ImportanceSampler {
    pub fn new(config: ImportanceConfig) -> Self {
        Self {
            config,
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }
}

impl Default for ImportanceSampler {
    fn default() -> Self {
        Self::new(ImportanceConfig::default())
    }
}

impl Sampler for ImportanceSampler {
    fn sample<M, F>(&mut self, model: &M, flow: &mut F, n_samples: usize) -> Result<Samples>
    where
        M: Model + ?Sized,
        F: Flow + ?Sized,
    {
        let (x, log_q) = flow.sample_and_log_prob(n_samples)?;
        let samples = evaluate(model, x, Some(log_q))?;
        info!(
            n_samples,
            log_evidence = samples.log_evidence,
            ess = samples.effective_sample_size,
            "importance sampling finished"
        );
        if !self.config.rejection_sample {
            return Ok(samples);
        }
        let accepted = samples.rejection_sample(&mut self.rng)?;
        info!(n_accepted = accepted.len(), "rejection sampling finished");
        match samples.log_evidence {
            Some(log_z) => Ok(accepted.with_log_evidence(log_z, samples.log_evidence_error)),
            None => Ok(accepted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::{FitConfig, GaussianFlow};
    use crate::samplers::test_utils::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use rand_distr::StandardNormal;

    fn fitted_flow(seed: u64) -> GaussianFlow {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mean = default_mean();
        let x = Array2::from_shape_fn((2_000, 2), |(_, j)| {
            mean[j] + 1.2 * rng.sample::<f64, _>(StandardNormal)
        });
        let mut flow = GaussianFlow::new(2).set_seed(seed);
        flow.fit(x.view(), &FitConfig::default()).unwrap();
        flow
    }

    #[test]
    fn recovers_analytic_evidence() {
        let model = gaussian_model(default_mean());
        let mut flow = fitted_flow(0);
        let mut sampler = ImportanceSampler::default().set_seed(1);
        let samples = sampler.sample(&model, &mut flow, 5_000).unwrap();
        let expected = -2.0 * (2.0 * PRIOR_WIDTH).ln();
        assert_abs_diff_eq!(samples.log_evidence.unwrap(), expected, epsilon = 0.05);
        assert!(samples.log_evidence_error.unwrap() < 0.05);
        assert!(samples.efficiency().unwrap() > 0.5);
    }

    #[test]
    fn rejection_sampling_keeps_evidence() {
        let model = gaussian_model(default_mean());
        let mut flow = fitted_flow(2);
        let config = ImportanceConfig {
            rejection_sample: true,
        };
        let mut sampler = ImportanceSampler::new(config).set_seed(3);
        let samples = sampler.sample(&model, &mut flow, 2_000).unwrap();
        assert!(samples.len() < 2_000);
        assert!(!samples.is_empty());
        assert!(samples.log_q.is_none());
        assert!(samples.log_evidence.is_some());
    }
}
