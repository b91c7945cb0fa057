//! Continuous normalizing flow trained by flow matching.
//!
//! Points move along `dx/dt = v(t, x)` from the data at `t = 0` to a standard normal at
//! `t = 1`. Training draws `t ~ U(0, 1)` and `eps ~ N(0, I)` for every sample `x`, forms
//! `x_t = (1 - t) x + (t + eta) eps` and regresses `v(t, x_t)` onto `eps - x`. Densities follow
//! from the instantaneous change of variables, `log p_0(x_0) = log p_1(x_1) + ∫ div v dt`,
//! integrated with fixed-step RK4. The divergence is exact, one backward pass per dimension.

use burn::module::AutodiffModule;
use burn::nn::{Linear, LinearConfig};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::activation::silu;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::cast::ToElement;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::prelude::*;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::{debug, info};

use crate::core::progress_bar;
use crate::error::{PoppyError, Result};
use crate::flows::{split_validation, FitConfig, Flow};
use crate::history::History;
use crate::transforms::{AffineTransform, DataTransform};
use crate::utils::{array_to_tensor, standard_normal_log_prob, tensor_to_array};

/// Architecture and integration settings of a [`FlowMatchingFlow`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowMatchingConfig {
    pub hidden_features: usize,
    pub n_layers: usize,
    /// Noise floor added to the weight of `eps` in the interpolation.
    pub eta: f64,
    /// Number of cosine/sine frequencies embedding the time.
    pub n_frequencies: usize,
    /// RK4 steps between `t = 0` and `t = 1`.
    pub n_ode_steps: usize,
}

impl Default for FlowMatchingConfig {
    fn default() -> Self {
        Self {
            hidden_features: 100,
            n_layers: 4,
            eta: 1e-3,
            n_frequencies: 3,
            n_ode_steps: 20,
        }
    }
}

/// `[cos(πkt), sin(πkt)]` for `k = 1..=n_frequencies`, one row per entry of `t`.
pub fn time_features(t: ArrayView1<f64>, n_frequencies: usize) -> Array2<f64> {
    Array2::from_shape_fn((t.len(), 2 * n_frequencies), |(i, j)| {
        let k = (j % n_frequencies + 1) as f64;
        let angle = PI * k * t[i];
        if j < n_frequencies {
            angle.cos()
        } else {
            angle.sin()
        }
    })
}

/// MLP velocity field `v(t, x)` with SiLU activations.
#[derive(Module, Debug)]
pub struct VelocityField<B: Backend> {
    hidden: Vec<Linear<B>>,
    output: Linear<B>,
}

impl<B: Backend> VelocityField<B> {
    pub fn new(dims: usize, config: &FlowMatchingConfig, device: &B::Device) -> Self {
        let mut width = dims + 2 * config.n_frequencies;
        let mut hidden = Vec::with_capacity(config.n_layers);
        for _ in 0..config.n_layers {
            hidden.push(LinearConfig::new(width, config.hidden_features).init(device));
            width = config.hidden_features;
        }
        Self {
            hidden,
            output: LinearConfig::new(width, dims).init(device),
        }
    }

    /// `time` holds the [`time_features`] of every row of `x`.
    pub fn forward(&self, time: Tensor<B, 2>, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut h = Tensor::cat(vec![time, x], 1);
        for layer in self.hidden.iter() {
            h = silu(layer.forward(h));
        }
        self.output.forward(h)
    }

    /// Mean squared error between the predicted and the target velocity.
    pub fn loss(&self, time: Tensor<B, 2>, x_t: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
        self.forward(time, x_t).sub(target).powi_scalar(2).mean()
    }
}

/// One regression batch: embedded times, interpolated points and target velocities.
struct RegressionBatch {
    time: Array2<f64>,
    x_t: Array2<f64>,
    target: Array2<f64>,
}

impl RegressionBatch {
    fn tensors<B: Backend>(&self, device: &B::Device) -> (Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) {
        (
            array_to_tensor::<B>(self.time.view(), device),
            array_to_tensor::<B>(self.x_t.view(), device),
            array_to_tensor::<B>(self.target.view(), device),
        )
    }
}

/**
A continuous normalizing flow over `dims` parameters, trained by flow matching.

Density evaluation and sampling integrate the learned ODE, so both are slower than for
[`RealNvpFlow`](crate::flows::RealNvpFlow).

# Examples

```rust
use ndarray::Array2;
use poppy::flows::{FitConfig, Flow, FlowMatchingConfig, FlowMatchingFlow};
use poppy::flows::realnvp::DefaultBackend;

let x = Array2::from_shape_fn((100, 2), |(i, j)| ((i * 7 + j * 3) % 11) as f64);
let config = FlowMatchingConfig { hidden_features: 16, n_layers: 2, n_ode_steps: 4, ..Default::default() };
let mut flow = FlowMatchingFlow::<DefaultBackend>::new(2, config).set_seed(1);
let fit = FitConfig { n_epochs: 2, batch_size: 50, ..Default::default() };
flow.fit(x.view(), &fit)?;
let (samples, log_q) = flow.sample_and_log_prob(5)?;
assert_eq!(samples.dim(), (5, 2));
assert_eq!(log_q.len(), 5);
# Ok::<(), poppy::error::PoppyError>(())
```
*/
pub struct FlowMatchingFlow<B: AutodiffBackend> {
    dims: usize,
    model: VelocityField<B>,
    config: FlowMatchingConfig,
    device: B::Device,
    transform: Box<dyn DataTransform>,
    rng: SmallRng,
}

impl<B: AutodiffBackend> FlowMatchingFlow<B> {
    pub fn new(dims: usize, config: FlowMatchingConfig) -> Self {
        let device = B::Device::default();
        Self {
            dims,
            model: VelocityField::new(dims, &config, &device),
            config,
            device,
            transform: Box::new(AffineTransform::new()),
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn with_data_transform(mut self, transform: Box<dyn DataTransform>) -> Self {
        self.transform = transform;
        self
    }

    /// Seeds the backend and reinitialises the network so that training is reproducible.
    pub fn set_seed(mut self, seed: u64) -> Self {
        B::seed(seed);
        self.model = VelocityField::new(self.dims, &self.config, &self.device);
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn model(&self) -> &VelocityField<B> {
        &self.model
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

    fn regression_batch(&mut self, x: ArrayView2<f64>) -> RegressionBatch {
        let n = x.nrows();
        let t = Array1::from_shape_simple_fn(n, || self.rng.gen::<f64>());
        let eps = Array2::from_shape_simple_fn((n, self.dims), || {
            self.rng.sample::<f64, _>(StandardNormal)
        });
        let keep = t.mapv(|t| 1.0 - t).insert_axis(Axis(1));
        let noise = t.mapv(|t| t + self.config.eta).insert_axis(Axis(1));
        RegressionBatch {
            time: time_features(t.view(), self.config.n_frequencies),
            x_t: &x * &keep + &eps * &noise,
            target: eps - &x,
        }
    }

    /// Velocity at time `t` for every row of `x`, and its divergence with respect to `x`.
    pub fn velocity_and_divergence(
        &self,
        t: f64,
        x: ArrayView2<f64>,
    ) -> Result<(Array2<f64>, Array1<f64>)> {
        let n = x.nrows();
        let mut velocity = Array2::<f64>::zeros((n, self.dims));
        let mut divergence = Array1::<f64>::zeros(n);
        if n == 0 {
            return Ok((velocity, divergence));
        }
        let time = time_features(Array1::from_elem(n, t).view(), self.config.n_frequencies);
        let time = array_to_tensor::<B>(time.view(), &self.device);
        let input = array_to_tensor::<B>(x, &self.device).require_grad();
        for i in 0..self.dims {
            let v = self.model.forward(time.clone(), input.clone());
            if i == 0 {
                velocity = tensor_to_array(v.clone().inner())?;
            }
            let grads = v.slice([0..n, i..i + 1]).sum().backward();
            let grad = input
                .grad(&grads)
                .ok_or_else(|| PoppyError::Backend("no gradient for the flow input".into()))?;
            divergence += &tensor_to_array(grad.slice([0..n, i..i + 1]))?.column(0);
        }
        Ok((velocity, divergence))
    }

    /// Integrates the flow from `t0` to `t1`, returning the end points and `∫ div v dt`.
    fn integrate(&self, x: Array2<f64>, t0: f64, t1: f64) -> Result<(Array2<f64>, Array1<f64>)> {
        let n_steps = self.config.n_ode_steps.max(1);
        let h = (t1 - t0) / n_steps as f64;
        let mut x = x;
        let mut integral = Array1::<f64>::zeros(x.nrows());
        for step in 0..n_steps {
            let t = t0 + step as f64 * h;
            let (k1, d1) = self.velocity_and_divergence(t, x.view())?;
            let (k2, d2) = self.velocity_and_divergence(t + 0.5 * h, (&x + &(&k1 * (0.5 * h))).view())?;
            let (k3, d3) = self.velocity_and_divergence(t + 0.5 * h, (&x + &(&k2 * (0.5 * h))).view())?;
            let (k4, d4) = self.velocity_and_divergence(t + h, (&x + &(&k3 * h)).view())?;
            x = x + (k1 + k2 * 2.0 + k3 * 2.0 + k4) * (h / 6.0);
            integral = integral + (d1 + d2 * 2.0 + d3 * 2.0 + d4) * (h / 6.0);
        }
        Ok((x, integral))
    }
}

impl<B: AutodiffBackend> Flow for FlowMatchingFlow<B> {
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
        let (x_prime, log_abs_det_jacobian) = self.rescale(x)?;
        let (z, integral) = self.integrate(x_prime, 0.0, 1.0)?;
        Ok(standard_normal_log_prob(z.view()) + integral + log_abs_det_jacobian)
    }

    fn sample_and_log_prob(&mut self, n_samples: usize) -> Result<(Array2<f64>, Array1<f64>)> {
        let z = Array2::from_shape_simple_fn((n_samples, self.dims), || {
            self.rng.sample::<f64, _>(StandardNormal)
        });
        let log_p_z = standard_normal_log_prob(z.view());
        // Backwards in time, so the integral carries the opposite sign.
        let (x_prime, integral) = self.integrate(z, 1.0, 0.0)?;
        let (x, log_abs_det_jacobian) = self.inverse_rescale(x_prime.view())?;
        Ok((x, log_p_z - integral - log_abs_det_jacobian))
    }

    fn fit(&mut self, x: ArrayView2<f64>, config: &FitConfig) -> Result<History> {
        self.check_dims(x)?;
        config.validate()?;
        let x_prime = self.fit_data_transform(x)?;
        let (x_train, x_val) =
            split_validation(x_prime.view(), config.validation_fraction, &mut self.rng)?;
        info!(
            n_train = x_train.nrows(),
            n_val = x_val.nrows(),
            n_epochs = config.n_epochs,
            "training flow matching"
        );

        let mut model = self.model.clone();
        let mut optim = AdamConfig::new().init::<B, VelocityField<B>>();
        let mut history = History::new();
        let pb = progress_bar("Flow matching", config.n_epochs, config.progress);

        let mut train_idx: Vec<usize> = (0..x_train.nrows()).collect();
        for epoch in 0..config.n_epochs {
            let lr = config.lr_at(epoch);
            train_idx.shuffle(&mut self.rng);
            let mut loss_epoch = 0.0;
            let mut n_batches = 0usize;
            for chunk in train_idx.chunks(config.batch_size) {
                let batch = self.regression_batch(x_train.select(Axis(0), chunk).view());
                let (time, x_t, target) = batch.tensors::<B>(&self.device);
                let loss = model.loss(time, x_t, target);
                loss_epoch += loss.clone().into_scalar().to_f64();
                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(lr, model, grads);
                n_batches += 1;
            }
            let train_loss = loss_epoch / n_batches.max(1) as f64;
            history.training_loss.push(train_loss);

            if x_val.nrows() > 0 {
                let valid = model.valid();
                let mut val_loss = 0.0;
                let mut n_val_batches = 0usize;
                for chunk in x_val.axis_chunks_iter(Axis(0), config.batch_size) {
                    let batch = self.regression_batch(chunk);
                    let (time, x_t, target) = batch.tensors::<B::InnerBackend>(&self.device);
                    val_loss += valid.loss(time, x_t, target).into_scalar().to_f64();
                    n_val_batches += 1;
                }
                history
                    .validation_loss
                    .push(val_loss / n_val_batches.max(1) as f64);
            }

            debug!(epoch, train_loss, lr, "flow matching epoch");
            pb.inc(1);
            pb.set_message(format!("loss≈{:.3}", train_loss));
        }
        pb.finish_with_message("Done!");

        self.model = model;
        Ok(history)
    }
}
