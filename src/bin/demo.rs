//! Post-processes rough samples of a correlated 2D Gaussian posterior: fits a RealNVP flow,
//! then reweights flow draws by importance sampling and refines them with the ensemble sampler.

use ndarray::{arr1, arr2, Array2, ArrayView1};
use poppy::flows::realnvp::DefaultBackend;
use poppy::flows::{FitConfig, RealNvpConfig, RealNvpFlow};
use poppy::model::PointwiseModel;
use poppy::samplers::{EnsembleConfig, ImportanceConfig, SamplerConfig};
use poppy::Poppy;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::error::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .try_init()
        .ok();
}

/// Sets up the target, fits the flow, runs both samplers and writes a JSON summary.
fn main() -> Result<(), Box<dyn Error>> {
    const N_INITIAL: usize = 2_000;
    const N_SAMPLES: usize = 2_000;
    const SEED: u64 = 42;

    setup_logging();

    // Unit-determinant covariance [[2, 1], [1, 1]] and a uniform prior on [-10, 10]^2.
    let mean = arr1(&[0.5, -1.0]);
    let precision = arr2(&[[1.0, -1.0], [-1.0, 2.0]]);
    let norm = -(2.0 * std::f64::consts::PI).ln();
    let log_prior = -2.0 * 20f64.ln();
    let model = PointwiseModel::new(
        2,
        move |x: ArrayView1<f64>| {
            let d = &x - &mean;
            norm - 0.5 * d.dot(&precision.dot(&d))
        },
        move |x: ArrayView1<f64>| {
            if x.iter().all(|v| v.abs() <= 10.0) {
                log_prior
            } else {
                f64::NEG_INFINITY
            }
        },
    )
    .with_parameters(vec!["a".into(), "b".into()]);

    // Rough initial samples: right location, inflated and uncorrelated.
    let mut rng = SmallRng::seed_from_u64(SEED);
    let initial = Array2::from_shape_fn((N_INITIAL, 2), |(_, j)| {
        [0.5, -1.0][j] + 2.0 * rng.sample::<f64, _>(StandardNormal)
    });

    let flow = RealNvpFlow::<DefaultBackend>::new(2, RealNvpConfig::default()).set_seed(SEED);
    let mut poppy = Poppy::new(model, flow).set_seed(SEED);
    let fit_config = FitConfig {
        n_epochs: 50,
        lr: 5e-3,
        batch_size: 250,
        lr_annealing: true,
        progress: true,
        ..Default::default()
    };
    let history = poppy.fit(initial.view(), &fit_config)?.clone();

    let importance = poppy.sample_posterior(
        N_SAMPLES,
        &SamplerConfig::Importance(ImportanceConfig::default()),
    )?;
    println!("Importance sampling\n{importance}");

    let ensemble = poppy.sample_posterior(
        N_SAMPLES,
        &SamplerConfig::Ensemble(EnsembleConfig {
            n_walkers: Some(64),
            n_steps: 400,
            discard: 100,
            progress: true,
            ..Default::default()
        }),
    )?;
    println!("Ensemble sampling\n{ensemble}");

    let means = ensemble.x.mean_axis(ndarray::Axis(0)).ok_or("no samples")?;
    info!(a = means[0], b = means[1], "posterior mean");
    println!("True log evidence: {:.2}", log_prior);

    let path = std::env::temp_dir().join("poppy_demo_samples.json");
    poppy::io::save_json(&ensemble, &path)?;
    println!("Saved samples to {}", path.display());

    #[cfg(feature = "plot")]
    {
        let dir = std::env::temp_dir();
        history.plot(dir.join("poppy_demo_loss.png"))?;
        importance.plot_corner(dir.join("poppy_demo_corner.png"), true)?;
        println!("Saved plots to {}", dir.display());
    }
    #[cfg(not(feature = "plot"))]
    info!(
        n_epochs = history.n_epochs(),
        final_loss = ?history.final_loss(),
        "flow trained"
    );
    Ok(())
}

#[test]
fn test_main() {
    main().expect("Expected main to not return an error.");
    assert!(
        std::env::temp_dir()
            .join("poppy_demo_samples.json")
            .exists(),
        "Expected the JSON summary to exist."
    );
}
