/*!
Population MCMC plumbing shared by the samplers.

A [`Population`] holds the current position and log density of every walker. A [`Kernel`]
advances the whole population by one step, and [`run_kernel`] / [`run_kernel_with_progress`]
repeat that step to record a [`Chain`].
*/

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{s, Array1, Array2, Array3, ArrayView2, Axis};
use tracing::{debug, warn};

use crate::error::{PoppyError, Result};
use crate::stats::RunningRhat;

/// Current state of a set of walkers.
#[derive(Debug, Clone, PartialEq)]
pub struct Population {
    /// `(n_walkers, dims)`.
    pub positions: Array2<f64>,
    pub log_prob: Array1<f64>,
}

impl Population {
    pub fn new(positions: Array2<f64>, log_prob: Array1<f64>) -> Result<Self> {
        if positions.nrows() != log_prob.len() {
            return Err(PoppyError::shape(format!(
                "{} walkers but {} log densities",
                positions.nrows(),
                log_prob.len()
            )));
        }
        Ok(Self {
            positions,
            log_prob,
        })
    }

    /// Evaluates `log_prob` at `positions` to build the population.
    pub fn evaluate<F>(positions: Array2<f64>, log_prob: &F) -> Result<Self>
    where
        F: Fn(ArrayView2<f64>) -> Result<Array1<f64>>,
    {
        let lp = log_prob(positions.view())?;
        Self::new(positions, lp)
    }

    pub fn n_walkers(&self) -> usize {
        self.positions.nrows()
    }

    pub fn dims(&self) -> usize {
        self.positions.ncols()
    }
}

/// A transition kernel acting on a whole population.
pub trait Kernel {
    /// Advances every walker by one step and returns the fraction of accepted proposals.
    fn step<F>(&mut self, population: &mut Population, log_prob: &F) -> Result<f64>
    where
        F: Fn(ArrayView2<f64>) -> Result<Array1<f64>>;
}

/// Recorded positions of a population run.
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    /// `[n_steps, n_walkers, dims]`.
    pub samples: Array3<f64>,
    /// `[n_steps, n_walkers]`.
    pub log_prob: Array2<f64>,
    /// Fraction of accepted proposals at each step.
    pub acceptance: Array1<f64>,
}

impl Chain {
    pub fn n_steps(&self) -> usize {
        self.samples.dim().0
    }

    pub fn acceptance_rate(&self) -> f64 {
        self.acceptance.mean().unwrap_or(f64::NAN)
    }

    /// Flattens the steps after `discard`, keeping every `thin`-th one, into
    /// `(n_kept * n_walkers, dims)` positions and their log densities.
    pub fn flat(&self, discard: usize, thin: usize) -> Result<(Array2<f64>, Array1<f64>)> {
        if thin == 0 {
            return Err(PoppyError::invalid("thin must be positive"));
        }
        if discard >= self.n_steps() {
            return Err(PoppyError::invalid(format!(
                "cannot discard {discard} of {} steps",
                self.n_steps()
            )));
        }
        let (_, n_walkers, dims) = self.samples.dim();
        let kept = self.samples.slice(s![discard..;thin as isize, .., ..]);
        let n_kept = kept.dim().0;
        let x = kept
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((n_kept * n_walkers, dims))?;
        let lp = self
            .log_prob
            .slice(s![discard..;thin as isize, ..])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order(n_kept * n_walkers)?;
        Ok((x, lp))
    }

    /// The positions of the final step.
    pub fn last(&self) -> Option<(Array2<f64>, Array1<f64>)> {
        let n = self.n_steps();
        if n == 0 {
            return None;
        }
        Some((
            self.samples.index_axis(Axis(0), n - 1).to_owned(),
            self.log_prob.index_axis(Axis(0), n - 1).to_owned(),
        ))
    }
}

/// Runs `kernel` for `n_steps`, recording every step.
pub fn run_kernel<K, F>(
    kernel: &mut K,
    population: &mut Population,
    log_prob: &F,
    n_steps: usize,
) -> Result<Chain>
where
    K: Kernel,
    F: Fn(ArrayView2<f64>) -> Result<Array1<f64>>,
{
    run_kernel_with_progress(kernel, population, log_prob, n_steps, &ProgressBar::hidden())
}

/// Like [`run_kernel`], reporting the acceptance rate and the maximum R-hat across walkers on
/// `pb`.
pub fn run_kernel_with_progress<K, F>(
    kernel: &mut K,
    population: &mut Population,
    log_prob: &F,
    n_steps: usize,
    pb: &ProgressBar,
) -> Result<Chain>
where
    K: Kernel,
    F: Fn(ArrayView2<f64>) -> Result<Array1<f64>>,
{
    let (n_walkers, dims) = population.positions.dim();
    let mut samples = Array3::<f64>::zeros((n_steps, n_walkers, dims));
    let mut log_probs = Array2::<f64>::zeros((n_steps, n_walkers));
    let mut acceptance = Array1::<f64>::zeros(n_steps);
    let mut rhat = RunningRhat::new(n_walkers, dims);

    pb.set_length(n_steps as u64);
    for i in 0..n_steps {
        let acc = kernel.step(population, log_prob)?;
        samples
            .index_axis_mut(Axis(0), i)
            .assign(&population.positions);
        log_probs
            .index_axis_mut(Axis(0), i)
            .assign(&population.log_prob);
        acceptance[i] = acc;
        rhat.step(population.positions.view())?;

        pb.inc(1);
        if i % 10 == 9 || i + 1 == n_steps {
            let mean_acc = acceptance.slice(s![..=i]).mean().unwrap_or(f64::NAN);
            match rhat.max() {
                Ok(r) => pb.set_message(format!("p(accept)≈{mean_acc:.2} max(rhat)≈{r:.2}")),
                Err(_) => pb.set_message(format!("p(accept)≈{mean_acc:.2}")),
            }
        }
    }
    pb.finish_with_message("Done!");

    let chain = Chain {
        samples,
        log_prob: log_probs,
        acceptance,
    };
    let rate = chain.acceptance_rate();
    debug!(n_steps, n_walkers, acceptance = rate, "finished population run");
    if n_steps > 0 && rate < 0.01 {
        warn!(acceptance = rate, "very low acceptance rate");
    }
    Ok(chain)
}

/// Progress bar in the crate's usual style, hidden when `show` is false.
pub(crate) fn progress_bar(prefix: &str, len: usize, show: bool) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) =
        ProgressStyle::default_bar().template("{prefix:8} {bar:40.white} ETA {eta:3} | {msg}")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb.set_prefix(prefix.to_string());
    pb
}
