/*!
Density estimators used as proposals and preconditioners.

A [`Flow`] is fitted to samples in a rescaled space (its data transform) and keeps track of
the Jacobian of that rescaling, so `log_prob` and `sample_and_log_prob` always refer to the
density in the original parameter space.

- [`GaussianFlow`] fits a full-covariance Gaussian in closed form.
- [`RealNvpFlow`] trains a RealNVP normalizing flow with `burn`.
- [`FlowMatchingFlow`] trains the velocity field of a continuous flow by flow matching.
*/

pub mod flow_matching;
pub mod gaussian;
pub mod realnvp;

pub use flow_matching::{FlowMatchingConfig, FlowMatchingFlow, VelocityField};
pub use gaussian::GaussianFlow;
pub use realnvp::{RealNvp, RealNvpConfig, RealNvpFlow};

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{PoppyError, Result};
use crate::history::History;
use crate::transforms::DataTransform;

/// Training options for [`Flow::fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub n_epochs: usize,
    pub lr: f64,
    pub batch_size: usize,
    /// Fraction of the samples held out to compute the validation loss.
    pub validation_fraction: f64,
    /// Cosine annealing of the learning rate over `n_epochs`.
    pub lr_annealing: bool,
    /// Show a progress bar while training.
    pub progress: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            n_epochs: 100,
            lr: 1e-3,
            batch_size: 500,
            validation_fraction: 0.2,
            lr_annealing: false,
            progress: false,
        }
    }
}

impl FitConfig {
    /// Learning rate for `epoch`, following a cosine schedule when annealing is enabled.
    pub fn lr_at(&self, epoch: usize) -> f64 {
        if self.lr_annealing && self.n_epochs > 0 {
            let frac = epoch as f64 / self.n_epochs as f64;
            0.5 * self.lr * (1.0 + (std::f64::consts::PI * frac).cos())
        } else {
            self.lr
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(PoppyError::invalid("batch_size must be positive"));
        }
        if !(0.0..1.0).contains(&self.validation_fraction) {
            return Err(PoppyError::invalid("validation_fraction must lie in [0, 1)"));
        }
        Ok(())
    }
}

/// Shuffles the rows of `x` and holds out `validation_fraction` of them.
///
/// Returns `(training, validation)`; the validation set may be empty.
pub(crate) fn split_validation<R: Rng>(
    x: ArrayView2<f64>,
    validation_fraction: f64,
    rng: &mut R,
) -> Result<(Array2<f64>, Array2<f64>)> {
    let n = x.nrows();
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(rng);
    let n_val = (validation_fraction * n as f64) as usize;
    if n_val >= n {
        return Err(PoppyError::invalid("no samples left for training"));
    }
    Ok((
        x.select(Axis(0), &order[..n - n_val]),
        x.select(Axis(0), &order[n - n_val..]),
    ))
}

/// A normalized density over `dims` parameters that can be sampled and fitted.
pub trait Flow {
    fn dims(&self) -> usize;

    fn data_transform(&self) -> &dyn DataTransform;

    fn data_transform_mut(&mut self) -> &mut dyn DataTransform;

    /// Log density of each row of `x`.
    fn log_prob(&self, x: ArrayView2<f64>) -> Result<Array1<f64>>;

    /// Draws `n_samples` points and returns them with their log density.
    fn sample_and_log_prob(&mut self, n_samples: usize) -> Result<(Array2<f64>, Array1<f64>)>;

    fn sample(&mut self, n_samples: usize) -> Result<Array2<f64>> {
        Ok(self.sample_and_log_prob(n_samples)?.0)
    }

    /// Fits the flow to the rows of `x`.
    fn fit(&mut self, x: ArrayView2<f64>, config: &FitConfig) -> Result<History>;

    fn fit_data_transform(&mut self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        self.data_transform_mut().fit(x)
    }

    /// Data space to flow space, with `log|dx'/dx|`.
    fn rescale(&self, x: ArrayView2<f64>) -> Result<(Array2<f64>, Array1<f64>)> {
        self.data_transform().forward(x)
    }

    /// Flow space to data space, with `log|dx/dx'|`.
    fn inverse_rescale(&self, x_prime: ArrayView2<f64>) -> Result<(Array2<f64>, Array1<f64>)> {
        self.data_transform().inverse(x_prime)
    }
}
