/*!
The [`Poppy`] orchestrator: fit a flow to initial samples, then sample the posterior with it.

# Examples

```rust
use ndarray::{Array2, ArrayView1};
use poppy::flows::{FitConfig, GaussianFlow};
use poppy::model::PointwiseModel;
use poppy::poppy::Poppy;
use poppy::samplers::{ImportanceConfig, SamplerConfig};

let model = PointwiseModel::new(
    1,
    |x: ArrayView1<f64>| -0.5 * x[0] * x[0],
    |_x: ArrayView1<f64>| 0.0,
);
let initial = Array2::from_shape_fn((100, 1), |(i, _)| (i as f64 - 50.0) / 25.0);
let mut poppy = Poppy::new(model, GaussianFlow::new(1)).set_seed(42);
poppy.fit(initial.view(), &FitConfig::default())?;
let config = SamplerConfig::Importance(ImportanceConfig::default());
let samples = poppy.sample_posterior(200, &config)?;
assert_eq!(samples.len(), 200);
assert!(samples.log_evidence.is_some());
# Ok::<(), poppy::error::PoppyError>(())
```
*/

use ndarray::ArrayView2;
use rand::prelude::*;
use tracing::info;

use crate::error::{PoppyError, Result};
use crate::flows::{FitConfig, Flow};
use crate::history::History;
use crate::model::Model;
use crate::samplers::{
    EnsembleSampler, ImportanceSampler, PcnSampler, Sampler, SamplerConfig, SmcSampler,
};
use crate::samples::Samples;

/// Owns a [`Model`] and a [`Flow`] and runs the fit-then-sample workflow.
pub struct Poppy<M, F> {
    model: M,
    flow: F,
    history: Option<History>,
    rng: SmallRng,
}

impl<M: Model, F: Flow> Poppy<M, F> {
    pub fn new(model: M, flow: F) -> Self {
        Self {
            model,
            flow,
            history: None,
            rng: SmallRng::from_entropy(),
        }
    }

    /// Seeds the samplers created by [`Poppy::sample_posterior`]. Flows are seeded separately.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn flow(&self) -> &F {
        &self.flow
    }

    pub fn flow_mut(&mut self) -> &mut F {
        &mut self.flow
    }

    /// Training history of the last [`Poppy::fit`].
    pub fn history(&self) -> Option<&History> {
        self.history.as_ref()
    }

    /// Fits the flow to initial samples `x` of shape `[n, dims]`.
    pub fn fit(&mut self, x: ArrayView2<f64>, config: &FitConfig) -> Result<&History> {
        if x.ncols() != self.model.dims() {
            return Err(PoppyError::shape(format!(
                "model has {} dimensions, samples have {}",
                self.model.dims(),
                x.ncols()
            )));
        }
        info!(n_samples = x.nrows(), dims = x.ncols(), "fitting flow");
        let history = self.flow.fit(x, config)?;
        if let Some(loss) = history.final_loss() {
            info!(loss, n_epochs = history.n_epochs(), "flow fitted");
        }
        Ok(self.history.insert(history))
    }

    /// Draws `n_samples` posterior samples with the sampler selected by `config`.
    pub fn sample_posterior(
        &mut self,
        n_samples: usize,
        config: &SamplerConfig,
    ) -> Result<Samples> {
        let seed: u64 = self.rng.gen();
        let samples = match config {
            SamplerConfig::Importance(c) => ImportanceSampler::new(c.clone())
                .set_seed(seed)
                .sample(&self.model, &mut self.flow, n_samples)?,
            SamplerConfig::Ensemble(c) => EnsembleSampler::new(c.clone())
                .set_seed(seed)
                .sample(&self.model, &mut self.flow, n_samples)?,
            SamplerConfig::Pcn(c) => PcnSampler::new(c.clone())
                .set_seed(seed)
                .sample(&self.model, &mut self.flow, n_samples)?,
            SamplerConfig::Smc(c) => SmcSampler::new(c.clone())
                .set_seed(seed)
                .sample(&self.model, &mut self.flow, n_samples)?,
        };
        info!(
            n_samples = samples.len(),
            log_evidence = samples.log_evidence,
            "sampling finished"
        );
        Ok(samples)
    }
}
