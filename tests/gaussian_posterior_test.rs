//! End-to-end checks against a correlated 2D Gaussian posterior whose evidence and moments are
//! known in closed form.
//!
//! Likelihood: `N(x; μ, Σ)` with `Σ = [[2, 1], [1, 1]]` (unit determinant). Prior: uniform on
//! `[-10, 10]^2`, so `log Z = -2 ln 20` up to negligible truncation.

use approx::assert_abs_diff_eq;
use ndarray::{arr1, arr2, Array1, Array2, ArrayView1, ArrayView2, Axis};
use poppy::flows::realnvp::DefaultBackend;
use poppy::flows::{
    FitConfig, Flow, FlowMatchingConfig, FlowMatchingFlow, GaussianFlow, RealNvpConfig, RealNvpFlow,
};
use poppy::model::Model;
use poppy::samplers::{
    EnsembleConfig, ImportanceConfig, PcnConfig, SamplerConfig, SmcConfig, StepFn,
};
use poppy::{Poppy, Samples};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

const SEED: u64 = 42;

struct CorrelatedGaussian {
    mean: Array1<f64>,
    precision: Array2<f64>,
}

impl CorrelatedGaussian {
    fn new() -> Self {
        Self {
            mean: arr1(&[0.5, -1.0]),
            precision: arr2(&[[1.0, -1.0], [-1.0, 2.0]]),
        }
    }

    fn covariance() -> Array2<f64> {
        arr2(&[[2.0, 1.0], [1.0, 1.0]])
    }

    fn log_evidence() -> f64 {
        -2.0 * 20f64.ln()
    }

    fn row_log_likelihood(&self, x: ArrayView1<f64>) -> f64 {
        let d = &x - &self.mean;
        -(2.0 * std::f64::consts::PI).ln() - 0.5 * d.dot(&self.precision.dot(&d))
    }
}

impl Model for CorrelatedGaussian {
    fn dims(&self) -> usize {
        2
    }

    fn parameters(&self) -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    fn log_likelihood(&self, x: ArrayView2<f64>) -> Array1<f64> {
        x.map_axis(Axis(1), |r| self.row_log_likelihood(r))
    }

    fn log_prior(&self, x: ArrayView2<f64>) -> Array1<f64> {
        x.map_axis(Axis(1), |r| {
            if r.iter().all(|v| v.abs() <= 10.0) {
                -2.0 * 20f64.ln()
            } else {
                f64::NEG_INFINITY
            }
        })
    }
}

/// Inflated, uncorrelated samples around the posterior mean.
fn rough_samples(n: usize) -> Array2<f64> {
    let mut rng = SmallRng::seed_from_u64(SEED);
    Array2::from_shape_fn((n, 2), |(_, j)| {
        [0.5, -1.0][j] + 1.8 * rng.sample::<f64, _>(StandardNormal)
    })
}

fn fitted_poppy() -> Poppy<CorrelatedGaussian, GaussianFlow> {
    let mut poppy =
        Poppy::new(CorrelatedGaussian::new(), GaussianFlow::new(2).set_seed(SEED)).set_seed(SEED);
    poppy
        .fit(rough_samples(2_000).view(), &FitConfig::default())
        .expect("Expected fitting the Gaussian flow to succeed");
    poppy
}

fn moments(samples: &Samples) -> (Array1<f64>, Array2<f64>) {
    let mean = samples.x.mean_axis(Axis(0)).unwrap();
    let centred = &samples.x - &mean;
    let cov = centred.t().dot(&centred) / (samples.len() as f64 - 1.0);
    (mean, cov)
}

#[test]
fn importance_sampling_recovers_evidence() {
    let mut poppy = fitted_poppy();
    let samples = poppy
        .sample_posterior(10_000, &SamplerConfig::Importance(ImportanceConfig::default()))
        .unwrap();
    assert_eq!(samples.parameters, vec!["a", "b"]);
    assert_abs_diff_eq!(
        samples.log_evidence.unwrap(),
        CorrelatedGaussian::log_evidence(),
        epsilon = 0.05
    );
    let eff = samples.efficiency().unwrap();
    assert!(eff > 0.2 && eff <= 1.0, "efficiency {eff}");
}

#[test]
fn rejection_sampled_moments_match_posterior() {
    let mut poppy = fitted_poppy();
    let config = SamplerConfig::Importance(ImportanceConfig {
        rejection_sample: true,
    });
    let samples = poppy.sample_posterior(20_000, &config).unwrap();
    assert!(samples.len() > 2_000);
    let (mean, cov) = moments(&samples);
    assert_abs_diff_eq!(mean, arr1(&[0.5, -1.0]), epsilon = 0.1);
    assert_abs_diff_eq!(cov, CorrelatedGaussian::covariance(), epsilon = 0.2);
}

#[test]
fn ensemble_moments_match_posterior() {
    let mut poppy = fitted_poppy();
    let config = SamplerConfig::Ensemble(EnsembleConfig {
        n_walkers: Some(32),
        n_steps: 1_000,
        discard: 200,
        ..Default::default()
    });
    let samples = poppy.sample_posterior(2_000, &config).unwrap();
    assert_eq!(samples.len(), 800 * 32);
    let (mean, cov) = moments(&samples);
    assert_abs_diff_eq!(mean, arr1(&[0.5, -1.0]), epsilon = 0.15);
    assert_abs_diff_eq!(cov, CorrelatedGaussian::covariance(), epsilon = 0.3);
    assert_abs_diff_eq!(
        samples.log_evidence.unwrap(),
        CorrelatedGaussian::log_evidence(),
        epsilon = 0.1
    );
}

#[test]
fn pcn_and_tpcn_moments_match_posterior() {
    for step_fn in [StepFn::Pcn, StepFn::Tpcn] {
        let mut poppy = fitted_poppy();
        let config = SamplerConfig::Pcn(PcnConfig {
            n_steps: 200,
            burnin: 50,
            step_fn,
            ..Default::default()
        });
        let samples = poppy.sample_posterior(500, &config).unwrap();
        assert_eq!(samples.len(), 150 * 500);
        let (mean, cov) = moments(&samples);
        assert_abs_diff_eq!(mean, arr1(&[0.5, -1.0]), epsilon = 0.1);
        assert_abs_diff_eq!(cov, CorrelatedGaussian::covariance(), epsilon = 0.25);
    }
}

#[test]
fn smc_recovers_evidence_from_poor_flow() {
    // Deliberately mismatched flow so that several tempering steps are needed.
    let mut flow = GaussianFlow::new(2).set_seed(SEED);
    let broad = rough_samples(2_000).mapv(|v| 3.0 * v);
    flow.fit(broad.view(), &FitConfig::default()).unwrap();
    let mut poppy = Poppy::new(CorrelatedGaussian::new(), flow).set_seed(SEED);

    let samples = poppy
        .sample_posterior(2_000, &SamplerConfig::Smc(SmcConfig::default()))
        .unwrap();
    assert_abs_diff_eq!(
        samples.log_evidence.unwrap(),
        CorrelatedGaussian::log_evidence(),
        epsilon = 0.2
    );
    let (mean, _) = moments(&samples);
    assert_abs_diff_eq!(mean, arr1(&[0.5, -1.0]), epsilon = 0.15);
}

#[test]
fn realnvp_flow_supports_importance_sampling() {
    let flow = RealNvpFlow::<DefaultBackend>::new(2, RealNvpConfig::default()).set_seed(SEED);
    let mut poppy = Poppy::new(CorrelatedGaussian::new(), flow).set_seed(SEED);
    let config = FitConfig {
        n_epochs: 30,
        lr: 5e-3,
        batch_size: 250,
        ..Default::default()
    };
    let history = poppy.fit(rough_samples(2_000).view(), &config).unwrap();
    assert_eq!(history.n_epochs(), 30);

    let (x, log_q) = poppy.flow_mut().sample_and_log_prob(100).unwrap();
    let lp = poppy.flow().log_prob(x.view()).unwrap();
    assert_abs_diff_eq!(lp, log_q, epsilon = 1e-2);

    let samples = poppy
        .sample_posterior(5_000, &SamplerConfig::default())
        .unwrap();
    assert_abs_diff_eq!(
        samples.log_evidence.unwrap(),
        CorrelatedGaussian::log_evidence(),
        epsilon = 0.2
    );
}

#[test]
fn flow_matching_supports_importance_sampling() {
    let config = FlowMatchingConfig {
        hidden_features: 32,
        n_layers: 2,
        n_ode_steps: 8,
        ..Default::default()
    };
    let flow = FlowMatchingFlow::<DefaultBackend>::new(2, config).set_seed(SEED);
    let mut poppy = Poppy::new(CorrelatedGaussian::new(), flow).set_seed(SEED);
    let fit = FitConfig {
        n_epochs: 20,
        lr: 5e-3,
        batch_size: 250,
        ..Default::default()
    };
    poppy.fit(rough_samples(2_000).view(), &fit).unwrap();

    let samples = poppy
        .sample_posterior(2_000, &SamplerConfig::default())
        .unwrap();
    assert!(samples.efficiency().unwrap() > 0.1);
    assert_abs_diff_eq!(
        samples.log_evidence.unwrap(),
        CorrelatedGaussian::log_evidence(),
        epsilon = 0.3
    );
}
