//! Full-covariance Gaussian density fitted in closed form.

use nalgebra as na;
use ndarray::{Array1, Array2, ArrayView2};
use rand::prelude::*;
use rand_distr::StandardNormal;
use tracing::debug;

use crate::error::{PoppyError, Result};
use crate::flows::{FitConfig, Flow};
use crate::history::History;
use crate::transforms::{AffineTransform, DataTransform};
use crate::utils::{mean_cov, standard_normal_log_prob};

#[derive(Debug, Clone)]
struct Fitted {
    mean: Array1<f64>,
    /// Lower Cholesky factor of the covariance.
    l: na::DMatrix<f64>,
    log_det: f64,
}

/// Rows of `x` as the columns of a `(d, n)` matrix.
fn rows_as_columns(x: ArrayView2<f64>) -> na::DMatrix<f64> {
    let (n, d) = x.dim();
    na::DMatrix::from_fn(d, n, |i, j| x[(j, i)])
}

fn columns_as_rows(m: &na::DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.ncols(), m.nrows()), |(i, j)| m[(j, i)])
}

/// Multivariate normal fitted to the (rescaled) samples by maximum likelihood.
///
/// # Examples
///
/// ```rust
/// use ndarray::arr2;
/// use poppy::flows::{FitConfig, Flow, GaussianFlow};
///
/// let x = arr2(&[[0.0, 1.0], [1.0, 0.5], [2.0, 2.5], [1.5, 1.0]]);
/// let mut flow = GaussianFlow::new(2).set_seed(42);
/// flow.fit(x.view(), &FitConfig::default())?;
/// let (samples, log_q) = flow.sample_and_log_prob(10)?;
/// assert_eq!(samples.dim(), (10, 2));
/// assert_eq!(log_q.len(), 10);
/// # Ok::<(), poppy::error::PoppyError>(())
/// ```
#[derive(Debug)]
pub struct GaussianFlow {
    dims: usize,
    transform: Box<dyn DataTransform>,
    fitted: Option<Fitted>,
    rng: SmallRng,
}

impl GaussianFlow {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            transform: Box::new(AffineTransform::new()),
            fitted: None,
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn with_data_transform(mut self, transform: Box<dyn DataTransform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    fn fitted(&self) -> Result<&Fitted> {
        self.fitted
            .as_ref()
            .ok_or_else(|| PoppyError::invalid("GaussianFlow used before fit"))
    }

    fn check_dims(&self, x: ArrayView2<f64>) -> Result<()> {
        if x.ncols() != self.dims {
            return Err(PoppyError::shape(format!(
                "flow has {} dimensions, got {}",
                self.dims,
                x.ncols()
            )));
        }
        Ok(())
    }

    /// Log density in the rescaled space.
    fn log_prob_prime(fitted: &Fitted, x_prime: ArrayView2<f64>) -> Result<Array1<f64>> {
        let centred = &x_prime - &fitted.mean;
        let z = fitted
            .l
            .solve_lower_triangular(&rows_as_columns(centred.view()))
            .ok_or_else(|| PoppyError::invalid("singular Cholesky factor"))?;
        Ok(standard_normal_log_prob(columns_as_rows(&z).view()) - fitted.log_det)
    }
}

impl Flow for GaussianFlow {
    fn dims(&self) -> usize {
        self.dims
    }

    fn data_transform(&self) -> &dyn DataTransform {
        self.transform.as_ref()
    }

    fn data_transform_mut(&mut self) -> &mut dyn DataTransform {
        self.transform.as_mut()
    }

    fn log_prob(&self, x: ArrayView2<f64>) -> Result<Array1<f64>> {
        self.check_dims(x)?;
        let fitted = self.fitted()?;
        let (x_prime, log_abs_det_jacobian) = self.rescale(x)?;
        Ok(Self::log_prob_prime(fitted, x_prime.view())? + log_abs_det_jacobian)
    }

    fn sample_and_log_prob(&mut self, n_samples: usize) -> Result<(Array2<f64>, Array1<f64>)> {
        let fitted = self.fitted()?.clone();
        let z = na::DMatrix::from_fn(self.dims, n_samples, |_, _| {
            self.rng.sample::<f64, _>(StandardNormal)
        });
        let x_prime = columns_as_rows(&(&fitted.l * &z)) + &fitted.mean;
        let log_q_prime = standard_normal_log_prob(columns_as_rows(&z).view()) - fitted.log_det;
        let (x, log_abs_det_jacobian) = self.inverse_rescale(x_prime.view())?;
        Ok((x, log_q_prime - log_abs_det_jacobian))
    }

    fn fit(&mut self, x: ArrayView2<f64>, _config: &FitConfig) -> Result<History> {
        self.check_dims(x)?;
        let x_prime = self.fit_data_transform(x)?;
        let (mean, mut cov) = mean_cov(x_prime.view())?;
        // Jitter keeps nearly degenerate sample sets usable.
        let jitter = 1e-10 * cov.diag().iter().copied().fold(1.0, f64::max);
        cov.diag_mut().mapv_inplace(|v| v + jitter);
        let (d, _) = cov.dim();
        let chol = na::Cholesky::new(na::DMatrix::from_row_iterator(d, d, cov.iter().copied()))
            .ok_or_else(|| PoppyError::invalid("sample covariance is not positive definite"))?;
        let l = chol.l();
        let log_det: f64 = l.diagonal().iter().map(|v| v.ln()).sum();
        let fitted = Fitted { mean, l, log_det };
        let nll = -Self::log_prob_prime(&fitted, x_prime.view())?
            .mean()
            .unwrap_or(f64::NAN);
        debug!(nll, dims = self.dims, "fitted Gaussian flow");
        self.fitted = Some(fitted);

        let mut history = History::new();
        history.training_loss.push(nll);
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transforms::IdentityTransform;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};
    use std::f64::consts::PI;

    fn correlated(n: usize, seed: u64) -> Array2<f64> {
        let mut rng = SmallRng::seed_from_u64(seed);
        Array2::from_shape_fn((n, 2), |_| rng.sample::<f64, _>(StandardNormal))
            .dot(&arr2(&[[2.0, 0.0], [1.0, 0.5]]).t())
            + &arr1(&[3.0, -1.0])
    }

    #[test]
    fn unfitted_flow_errors() {
        let mut flow = GaussianFlow::new(2);
        assert!(flow.sample(3).is_err());
        assert!(flow.log_prob(arr2(&[[0.0, 0.0]]).view()).is_err());
    }

    #[test]
    fn recovers_mean_and_covariance() {
        let x = correlated(20_000, 1);
        let mut flow = GaussianFlow::new(2).set_seed(2);
        let history = flow.fit(x.view(), &FitConfig::default()).unwrap();
        assert_eq!(history.n_epochs(), 1);

        let s = flow.sample(20_000).unwrap();
        let (mean, cov) = mean_cov(s.view()).unwrap();
        assert_abs_diff_eq!(mean, arr1(&[3.0, -1.0]), epsilon = 0.1);
        assert_abs_diff_eq!(cov, arr2(&[[4.0, 2.0], [2.0, 1.25]]), epsilon = 0.2);
    }

    #[test]
    fn sampled_log_q_matches_log_prob() {
        let x = correlated(500, 3);
        let mut flow = GaussianFlow::new(2).set_seed(4);
        flow.fit(x.view(), &FitConfig::default()).unwrap();
        let (s, log_q) = flow.sample_and_log_prob(50).unwrap();
        let lp = flow.log_prob(s.view()).unwrap();
        assert_abs_diff_eq!(lp, log_q, epsilon = 1e-9);
    }

    #[test]
    fn standard_normal_density_is_exact() {
        // Symmetric sample with unit variance in every direction.
        let x = arr2(&[[1.0, 0.0], [-1.0, 0.0], [0.0, 1.0], [0.0, -1.0]]);
        let mut flow = GaussianFlow::new(2);
        flow.fit(x.view(), &FitConfig::default()).unwrap();
        let lp = flow.log_prob(arr2(&[[0.0, 0.0]]).view()).unwrap();
        // Per-dimension std of the fit is sqrt(2/3).
        let var: f64 = 2.0 / 3.0;
        let expected = -(2.0 * PI).ln() - var.ln();
        assert_abs_diff_eq!(lp[0], expected, epsilon = 1e-6);
    }

    #[test]
    fn log_prob_matches_closed_form_density() {
        let x = correlated(300, 5);
        let mut flow = GaussianFlow::new(2).with_data_transform(Box::new(IdentityTransform));
        flow.fit(x.view(), &FitConfig::default()).unwrap();

        let (mean, cov) = mean_cov(x.view()).unwrap();
        let det = cov[(0, 0)] * cov[(1, 1)] - cov[(0, 1)] * cov[(1, 0)];
        let inv = arr2(&[[cov[(1, 1)], -cov[(0, 1)]], [-cov[(1, 0)], cov[(0, 0)]]]) / det;
        let point = arr1(&[2.5, 0.0]);
        let d = &point - &mean;
        let expected = -(2.0 * PI).ln() - 0.5 * det.ln() - 0.5 * d.dot(&inv.dot(&d));

        let lp = flow.log_prob(point.insert_axis(ndarray::Axis(0)).view()).unwrap();
        assert_abs_diff_eq!(lp[0], expected, epsilon = 1e-7);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut flow = GaussianFlow::new(3);
        let res = flow.fit(arr2(&[[0.0, 1.0], [1.0, 0.0]]).view(), &FitConfig::default());
        assert!(matches!(res, Err(PoppyError::Shape(_))));
    }
}
