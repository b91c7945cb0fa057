//! Convergence diagnostics for populations of MCMC walkers.

use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use rustfft::{num_complex::Complex, FftPlanner};

use crate::error::{PoppyError, Result};

/// Running potential scale reduction factor (R-hat) over several chains.
///
/// Per-chain first and second moments are updated online, so the full chain never needs
/// to be kept in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningRhat {
    n_steps: usize,
    chain_means: Array2<f64>,
    chain_second_moments: Array2<f64>,
}

impl RunningRhat {
    pub fn new(n_chains: usize, n_params: usize) -> Self {
        Self {
            n_steps: 0,
            chain_means: Array2::zeros((n_chains, n_params)),
            chain_second_moments: Array2::zeros((n_chains, n_params)),
        }
    }

    /// Adds one draw per chain; `x` has shape `(n_chains, n_params)`.
    pub fn step(&mut self, x: ArrayView2<f64>) -> Result<()> {
        if x.dim() != self.chain_means.dim() {
            return Err(PoppyError::shape(format!(
                "expected a {:?} step, got {:?}",
                self.chain_means.dim(),
                x.dim()
            )));
        }
        self.n_steps += 1;
        let w = 1.0 / self.n_steps as f64;
        self.chain_means.zip_mut_with(&x, |m, &v| *m += w * (v - *m));
        self.chain_second_moments
            .zip_mut_with(&x, |m, &v| *m += w * (v * v - *m));
        Ok(())
    }

    pub fn n_steps(&self) -> usize {
        self.n_steps
    }

    /// R-hat for every parameter. Needs at least two chains and two steps.
    pub fn all(&self) -> Result<Array1<f64>> {
        let n_chains = self.chain_means.nrows();
        if n_chains < 2 || self.n_steps < 2 {
            return Err(PoppyError::invalid(
                "R-hat needs at least two chains and two steps",
            ));
        }
        let grand_mean = self
            .chain_means
            .mean_axis(Axis(0))
            .ok_or_else(|| PoppyError::invalid("mean across chains failed"))?;
        let n = self.n_steps as f64;
        // B / n, the variance of the chain means.
        let between = (&self.chain_means - &grand_mean.insert_axis(Axis(0)))
            .pow2()
            .sum_axis(Axis(0))
            / (n_chains as f64 - 1.0);
        let chain_vars =
            (&self.chain_second_moments - &self.chain_means.pow2()) * (n / (n - 1.0));
        let within = chain_vars
            .mean_axis(Axis(0))
            .ok_or_else(|| PoppyError::invalid("mean of within-chain variances failed"))?;
        let pooled = &within * ((n - 1.0) / n) + between;
        Ok((pooled / within).sqrt())
    }

    pub fn max(&self) -> Result<f64> {
        let all = self.all()?;
        let max = all
            .max()
            .map_err(|e| PoppyError::invalid(format!("R-hat maximum: {e}")))?;
        Ok(*max)
    }
}

/// Normalised autocorrelation function of a one-dimensional series, computed with an FFT.
///
/// Returns an array of the same length as `x` with `acf[0] == 1`. Constant series give all
/// zeros after lag 0 is set to one.
pub fn autocorrelation(x: ArrayView1<f64>) -> Array1<f64> {
    let n = x.len();
    if n == 0 {
        return Array1::zeros(0);
    }
    let mean = x.mean().unwrap_or(0.0);
    let size = (2 * n).next_power_of_two();
    let mut buffer: Vec<Complex<f64>> = x
        .iter()
        .map(|&v| Complex::new(v - mean, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(size)
        .collect();

    let mut planner = FftPlanner::<f64>::new();
    planner.plan_fft_forward(size).process(&mut buffer);
    for c in buffer.iter_mut() {
        *c = Complex::new(c.norm_sqr(), 0.0);
    }
    planner.plan_fft_inverse(size).process(&mut buffer);

    let acf0 = buffer[0].re;
    let mut acf = Array1::from_iter(buffer.iter().take(n).map(|c| c.re));
    if acf0 > 0.0 {
        acf /= acf0;
    } else {
        acf.fill(0.0);
        acf[0] = 1.0;
    }
    acf
}

/// Integrated autocorrelation time per parameter of a `[n_steps, n_walkers, dims]` chain.
///
/// The autocorrelation functions of all walkers are averaged and the sum is truncated with
/// Sokal's automatic window of size `c * tau`.
pub fn integrated_autocorr_time(chain: ArrayView3<f64>, c: f64) -> Result<Array1<f64>> {
    let (n_steps, n_walkers, dims) = chain.dim();
    if n_steps == 0 || n_walkers == 0 {
        return Err(PoppyError::invalid("empty chain"));
    }
    let mut tau = Array1::<f64>::zeros(dims);
    for d in 0..dims {
        let mut f = Array1::<f64>::zeros(n_steps);
        for w in 0..n_walkers {
            f += &autocorrelation(chain.slice(s![.., w, d]));
        }
        f /= n_walkers as f64;

        let mut taus = Array1::<f64>::zeros(n_steps);
        let mut acc = 0.0;
        for (i, v) in f.iter().enumerate() {
            acc += v;
            taus[i] = 2.0 * acc - 1.0;
        }
        let window = taus
            .iter()
            .enumerate()
            .position(|(i, &t)| (i as f64) >= c * t)
            .unwrap_or(n_steps - 1);
        tau[d] = taus[window];
    }
    Ok(tau)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::prelude::*;
    use rand_distr::StandardNormal;
    use std::f64;

    fn rhat_after(steps: &[Array2<f64>]) -> Array1<f64> {
        let (n_chains, n_params) = steps[0].dim();
        let mut rhat = RunningRhat::new(n_chains, n_params);
        for x in steps {
            rhat.step(x.view()).unwrap();
        }
        rhat.all().unwrap()
    }

    #[test]
    fn rhat_of_three_short_chains() {
        let first = arr2(&[
            [0.0, 1.0, 0.0, 1.0],
            [1.0, 2.0, 0.0, 2.0],
            [0.0, 0.0, 0.0, 2.0],
        ]);
        let second = arr2(&[
            [1.0, 2.0, 2.0, 0.0],
            [1.0, 1.0, 1.0, 1.0],
            [0.0, 1.0, 0.0, 0.0],
        ]);
        let expected = array![f64::consts::SQRT_2, 1.08012345, 0.89442719, 0.8660254];
        assert_abs_diff_eq!(rhat_after(&[first, second]), expected, epsilon = 1e-7);
    }

    #[test]
    fn rhat_per_parameter_matches_reference() {
        let first = arr2(&[
            [1.0, 0.0, 0.0, 1.0],
            [1.0, 0.0, 0.0, 1.0],
            [0.0, 1.0, 0.0, 2.0],
        ]);
        let second = arr2(&[
            [1.0, 2.0, 0.0, 2.0],
            [1.0, 2.0, 0.0, 0.0],
            [2.0, 0.0, 1.0, 2.0],
        ]);
        let expected = array![f64::consts::FRAC_1_SQRT_2, 0.74535599, 1.0, 1.5];
        assert_abs_diff_eq!(rhat_after(&[first, second]), expected, epsilon = 1e-7);
    }

    #[test]
    fn rhat_rejects_bad_shapes_and_short_chains() {
        let mut rhat = RunningRhat::new(2, 1);
        assert!(rhat.step(arr2(&[[0.0, 1.0]]).view()).is_err());
        rhat.step(arr2(&[[0.0], [1.0]]).view()).unwrap();
        assert!(rhat.all().is_err());
    }

    #[test]
    fn autocorrelation_of_white_noise_drops_to_zero() {
        let mut rng = SmallRng::seed_from_u64(0);
        let x = Array1::from_shape_simple_fn(4096, || rng.sample::<f64, _>(StandardNormal));
        let acf = autocorrelation(x.view());
        assert_abs_diff_eq!(acf[0], 1.0, epsilon = 1e-12);
        assert!(acf[1].abs() < 0.1);
        assert!(acf[10].abs() < 0.1);
    }

    #[test]
    fn autocorrelation_of_constant_series() {
        let acf = autocorrelation(Array1::from_elem(5, 2.0).view());
        assert_eq!(acf, array![1.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn ar1_autocorr_time_matches_theory() {
        // For an AR(1) process with coefficient phi, tau = (1 + phi) / (1 - phi).
        let phi: f64 = 0.5;
        let mut rng = SmallRng::seed_from_u64(1);
        let (n_steps, n_walkers) = (20_000, 4);
        let mut chain = Array3::<f64>::zeros((n_steps, n_walkers, 1));
        for w in 0..n_walkers {
            let mut v = 0.0;
            for t in 0..n_steps {
                let e: f64 = rng.sample(StandardNormal);
                v = phi * v + (1.0 - phi * phi).sqrt() * e;
                chain[[t, w, 0]] = v;
            }
        }
        let tau = integrated_autocorr_time(chain.view(), 5.0).unwrap();
        assert_abs_diff_eq!(tau[0], 3.0, epsilon = 0.5);
    }
}
