//! RealNVP normalizing flow trained with the `burn` crate.
//!
//! The flow maps data to a standard normal latent space through a learned element-wise affine
//! layer followed by a stack of affine coupling layers. Each coupling layer transforms one half
//! of the coordinates conditioned on the other half; consecutive layers alternate the halves by
//! reversing the coordinate order. Training maximizes the log-likelihood of the (rescaled)
//! samples with Adam.

use burn::backend::{Autodiff, NdArray};
use burn::module::{AutodiffModule, Param};
use burn::nn::{Initializer, Linear, LinearConfig};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::activation::{relu, tanh};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::cast::ToElement;
use ndarray::{Array1, Array2, ArrayView2, Axis};
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
use crate::utils::{array_to_tensor, tensor1_to_array, tensor_to_array};

/// CPU backend with autodiff, the default for [`RealNvpFlow`].
pub type DefaultBackend = Autodiff<NdArray>;

/// Architecture of a [`RealNvpFlow`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealNvpConfig {
    pub n_layers: usize,
    pub hidden_features: usize,
}

impl Default for RealNvpConfig {
    fn default() -> Self {
        Self {
            n_layers: 4,
            hidden_features: 64,
        }
    }
}

/// Learned per-dimension shift and log-scale: `z = (x - loc) * exp(-log_scale)`.
#[derive(Module, Debug)]
pub struct ElementwiseAffine<B: Backend> {
    loc: Param<Tensor<B, 1>>,
    log_scale: Param<Tensor<B, 1>>,
}

impl<B: Backend> ElementwiseAffine<B> {
    pub fn new(dims: usize, device: &B::Device) -> Self {
        Self {
            loc: Param::from_tensor(Tensor::zeros([dims], device)),
            log_scale: Param::from_tensor(Tensor::zeros([dims], device)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let n = x.dims()[0];
        let loc = self.loc.val().unsqueeze::<2>();
        let inv_scale = self.log_scale.val().neg().exp().unsqueeze::<2>();
        let z = x.sub(loc).mul(inv_scale);
        let log_det = self.log_scale.val().sum().neg().expand([n]);
        (z, log_det)
    }

    /// Returns the data-space point and the log-determinant of the forward map.
    pub fn inverse(&self, z: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let n = z.dims()[0];
        let loc = self.loc.val().unsqueeze::<2>();
        let scale = self.log_scale.val().exp().unsqueeze::<2>();
        let x = z.mul(scale).add(loc);
        let log_det = self.log_scale.val().sum().neg().expand([n]);
        (x, log_det)
    }
}

/// Affine coupling layer acting on the trailing `dims - split` coordinates.
#[derive(Module, Debug)]
pub struct Coupling<B: Backend> {
    input: Linear<B>,
    hidden: Linear<B>,
    output: Linear<B>,
    split: usize,
    flip: bool,
}

impl<B: Backend> Coupling<B> {
    pub fn new(dims: usize, hidden_features: usize, flip: bool, device: &B::Device) -> Self {
        let split = dims / 2;
        let rest = dims - split;
        Self {
            input: LinearConfig::new(split, hidden_features).init(device),
            hidden: LinearConfig::new(hidden_features, hidden_features).init(device),
            // Zero output weights start the layer at the identity.
            output: LinearConfig::new(hidden_features, 2 * rest)
                .with_initializer(Initializer::Zeros)
                .init(device),
            split,
            flip,
        }
    }

    fn conditioner(&self, x1: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let h = relu(self.input.forward(x1));
        let h = relu(self.hidden.forward(h));
        let out = self.output.forward(h);
        let [n, width] = out.dims();
        let rest = width / 2;
        let log_scale = tanh(out.clone().slice([0..n, 0..rest]));
        let shift = out.slice([0..n, rest..width]);
        (log_scale, shift)
    }

    fn orient(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        if self.flip {
            x.flip([1])
        } else {
            x
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let x = self.orient(x);
        let [n, d] = x.dims();
        let x1 = x.clone().slice([0..n, 0..self.split]);
        let x2 = x.slice([0..n, self.split..d]);
        let (log_scale, shift) = self.conditioner(x1.clone());
        let y2 = x2.mul(log_scale.clone().exp()).add(shift);
        let log_det = log_scale.sum_dim(1).squeeze(1);
        (self.orient(Tensor::cat(vec![x1, y2], 1)), log_det)
    }

    /// Returns the input of [`Coupling::forward`] and that call's log-determinant.
    pub fn inverse(&self, y: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let y = self.orient(y);
        let [n, d] = y.dims();
        let y1 = y.clone().slice([0..n, 0..self.split]);
        let y2 = y.slice([0..n, self.split..d]);
        let (log_scale, shift) = self.conditioner(y1.clone());
        let x2 = y2.sub(shift).mul(log_scale.clone().neg().exp());
        let log_det = log_scale.sum_dim(1).squeeze(1);
        (self.orient(Tensor::cat(vec![y1, x2], 1)), log_det)
    }
}

/// The RealNVP network: element-wise affine layer followed by coupling layers.
#[derive(Module, Debug)]
pub struct RealNvp<B: Backend> {
    affine: ElementwiseAffine<B>,
    couplings: Vec<Coupling<B>>,
    dims: usize,
}

impl<B: Backend> RealNvp<B> {
    /// One-dimensional flows have no coupling layers.
    pub fn new(dims: usize, config: &RealNvpConfig, device: &B::Device) -> Self {
        let couplings = if dims >= 2 {
            (0..config.n_layers)
                .map(|i| Coupling::new(dims, config.hidden_features, i % 2 == 1, device))
                .collect()
        } else {
            Vec::new()
        };
        Self {
            affine: ElementwiseAffine::new(dims, device),
            couplings,
            dims,
        }
    }

    /// Maps data to latent space, returning `(z, log|dz/dx|)`.
    pub fn forward(&self, x: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let (mut z, mut log_det) = self.affine.forward(x);
        for layer in self.couplings.iter() {
            let (next, ld) = layer.forward(z);
            z = next;
            log_det = log_det.add(ld);
        }
        (z, log_det)
    }

    /// Maps latent points to data space, returning `(x, log|dz/dx|)` evaluated at `x`.
    pub fn inverse(&self, z: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let mut x = z;
        let mut log_det: Option<Tensor<B, 1>> = None;
        for layer in self.couplings.iter().rev() {
            let (prev, ld) = layer.inverse(x);
            x = prev;
            log_det = Some(match log_det {
                Some(acc) => acc.add(ld),
                None => ld,
            });
        }
        let (x, ld) = self.affine.inverse(x);
        let log_det = match log_det {
            Some(acc) => acc.add(ld),
            None => ld,
        };
        (x, log_det)
    }

    /// Row-wise log density under the flow.
    pub fn log_prob(&self, x: Tensor<B, 2>) -> Tensor<B, 1> {
        let (z, log_det) = self.forward(x);
        standard_normal_log_prob_tensor(z, self.dims).add(log_det)
    }

    /// Mean negative log-likelihood, the training loss.
    pub fn nll(&self, x: Tensor<B, 2>) -> Tensor<B, 1> {
        self.log_prob(x).mean().neg()
    }
}

fn standard_normal_log_prob_tensor<B: Backend>(z: Tensor<B, 2>, dims: usize) -> Tensor<B, 1> {
    let norm = 0.5 * dims as f64 * (2.0 * PI).ln();
    z.powi_scalar(2)
        .sum_dim(1)
        .squeeze(1)
        .mul_scalar(-0.5)
        .sub_scalar(norm)
}

/**
A RealNVP normalizing flow over `dims` parameters.

# Examples

```rust
use ndarray::Array2;
use poppy::flows::{FitConfig, Flow, RealNvpConfig, RealNvpFlow};
use poppy::flows::realnvp::DefaultBackend;

let x = Array2::from_shape_fn((200, 2), |(i, j)| ((i * 7 + j * 3) % 11) as f64);
let mut flow = RealNvpFlow::<DefaultBackend>::new(2, RealNvpConfig::default()).set_seed(1);
let config = FitConfig { n_epochs: 2, batch_size: 50, ..Default::default() };
let history = flow.fit(x.view(), &config)?;
assert_eq!(history.training_loss.len(), 2);
let (samples, log_q) = flow.sample_and_log_prob(5)?;
assert_eq!(samples.dim(), (5, 2));
assert_eq!(log_q.len(), 5);
# Ok::<(), poppy::error::PoppyError>(())
```
*/
pub struct RealNvpFlow<B: AutodiffBackend> {
    dims: usize,
    model: RealNvp<B>,
    config: RealNvpConfig,
    device: B::Device,
    transform: Box<dyn DataTransform>,
    rng: SmallRng,
}

impl<B: AutodiffBackend> RealNvpFlow<B> {
    pub fn new(dims: usize, config: RealNvpConfig) -> Self {
        let device = B::Device::default();
        Self {
            dims,
            model: RealNvp::new(dims, &config, &device),
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
        self.model = RealNvp::new(self.dims, &self.config, &self.device);
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn model(&self) -> &RealNvp<B> {
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
}

impl<B: AutodiffBackend> Flow for RealNvpFlow<B> {
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
        let model = self.model.valid();
        let input = array_to_tensor::<B::InnerBackend>(x_prime.view(), &self.device);
        let log_q_prime = tensor1_to_array(model.log_prob(input))?;
        Ok(log_q_prime + log_abs_det_jacobian)
    }

    fn sample_and_log_prob(&mut self, n_samples: usize) -> Result<(Array2<f64>, Array1<f64>)> {
        let z = Array2::from_shape_simple_fn((n_samples, self.dims), || {
            self.rng.sample::<f64, _>(StandardNormal)
        });
        let model = self.model.valid();
        let z = array_to_tensor::<B::InnerBackend>(z.view(), &self.device);
        let (x_prime, log_det) = model.inverse(z.clone());
        let log_q_prime = standard_normal_log_prob_tensor(z, self.dims).add(log_det);
        let x_prime = tensor_to_array(x_prime)?;
        let log_q_prime = tensor1_to_array(log_q_prime)?;
        let (x, log_abs_det_jacobian) = self.inverse_rescale(x_prime.view())?;
        Ok((x, log_q_prime - log_abs_det_jacobian))
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
            "training RealNVP flow"
        );

        let mut model = self.model.clone();
        let mut optim = AdamConfig::new().init::<B, RealNvp<B>>();
        let mut history = History::new();
        let pb = progress_bar("RealNVP", config.n_epochs, config.progress);

        let mut train_idx: Vec<usize> = (0..x_train.nrows()).collect();
        for epoch in 0..config.n_epochs {
            let lr = config.lr_at(epoch);
            train_idx.shuffle(&mut self.rng);
            let mut loss_epoch = 0.0;
            let mut n_batches = 0usize;
            for chunk in train_idx.chunks(config.batch_size) {
                let batch = x_train.select(Axis(0), chunk);
                let batch = array_to_tensor::<B>(batch.view(), &self.device);
                let loss = model.nll(batch);
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
                    let batch = array_to_tensor::<B::InnerBackend>(chunk, &self.device);
                    val_loss += valid.nll(batch).into_scalar().to_f64();
                    n_val_batches += 1;
                }
                history
                    .validation_loss
                    .push(val_loss / n_val_batches.max(1) as f64);
            }

            debug!(epoch, train_loss, lr, "RealNVP epoch");
            pb.inc(1);
            pb.set_message(format!("loss≈{:.3}", train_loss));
        }
        pb.finish_with_message("Done!");

        self.model = model;
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::NdArray;

    type TestBackend = Autodiff<NdArray>;

    fn banana(n: usize, seed: u64) -> Array2<f64> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut x = Array2::<f64>::zeros((n, 2));
        for mut row in x.axis_iter_mut(Axis(0)) {
            let a: f64 = rng.sample(StandardNormal);
            let b: f64 = rng.sample(StandardNormal);
            row[0] = a;
            row[1] = 0.5 * b + 0.5 * a * a;
        }
        x
    }

    #[test]
    fn untrained_layers_start_at_identity() {
        let device = Default::default();
        let model = RealNvp::<NdArray>::new(3, &RealNvpConfig::default(), &device);
        let x = Tensor::<NdArray, 2>::from_floats([[0.5, -1.0, 2.0], [1.0, 0.0, -0.3]], &device);
        let (z, log_det) = model.forward(x.clone());
        let z = tensor_to_array(z).unwrap();
        let x_arr = tensor_to_array(x).unwrap();
        assert_abs_diff_eq!(z, x_arr, epsilon = 1e-6);
        let log_det = tensor1_to_array(log_det).unwrap();
        assert_abs_diff_eq!(log_det, Array1::zeros(2), epsilon = 1e-6);
    }

    #[test]
    fn inverse_undoes_forward_after_training() {
        let x = banana(400, 0);
        let mut flow = RealNvpFlow::<TestBackend>::new(2, RealNvpConfig::default()).set_seed(0);
        let config = FitConfig {
            n_epochs: 5,
            lr: 1e-2,
            batch_size: 100,
            ..Default::default()
        };
        flow.fit(x.view(), &config).unwrap();

        let device = Default::default();
        let model = flow.model().valid();
        let input = array_to_tensor::<NdArray>(x.slice(ndarray::s![..10, ..]), &device);
        let (z, fwd) = model.forward(input.clone());
        let (back, inv) = model.inverse(z);
        assert_abs_diff_eq!(
            tensor_to_array(back).unwrap(),
            tensor_to_array(input).unwrap(),
            epsilon = 1e-3
        );
        assert_abs_diff_eq!(
            tensor1_to_array(fwd).unwrap(),
            tensor1_to_array(inv).unwrap(),
            epsilon = 1e-3
        );
    }

    #[test]
    fn training_reduces_loss() {
        let x = banana(1_000, 1);
        let mut flow = RealNvpFlow::<TestBackend>::new(2, RealNvpConfig::default()).set_seed(1);
        let config = FitConfig {
            n_epochs: 30,
            lr: 5e-3,
            batch_size: 200,
            ..Default::default()
        };
        let history = flow.fit(x.view(), &config).unwrap();
        assert_eq!(history.training_loss.len(), 30);
        assert_eq!(history.validation_loss.len(), 30);
        assert!(history.training_loss[29] < history.training_loss[0]);
        assert!(history.training_loss.iter().all(|l| l.is_finite()));
    }

    #[test]
    fn sampled_log_q_matches_log_prob() {
        let x = banana(500, 2);
        let mut flow = RealNvpFlow::<TestBackend>::new(2, RealNvpConfig::default()).set_seed(2);
        let config = FitConfig {
            n_epochs: 5,
            lr: 1e-2,
            batch_size: 100,
            validation_fraction: 0.0,
            ..Default::default()
        };
        let history = flow.fit(x.view(), &config).unwrap();
        assert!(history.validation_loss.is_empty());
        let (s, log_q) = flow.sample_and_log_prob(20).unwrap();
        let lp = flow.log_prob(s.view()).unwrap();
        assert_abs_diff_eq!(lp, log_q, epsilon = 1e-2);
    }

    #[test]
    fn one_dimensional_flow_is_affine() {
        let x = Array2::from_shape_fn((300, 1), |(i, _)| (i % 17) as f64);
        let mut flow = RealNvpFlow::<TestBackend>::new(1, RealNvpConfig::default()).set_seed(3);
        assert!(flow.model().couplings.is_empty());
        let config = FitConfig {
            n_epochs: 2,
            batch_size: 64,
            ..Default::default()
        };
        flow.fit(x.view(), &config).unwrap();
        let s = flow.sample(7).unwrap();
        assert_eq!(s.dim(), (7, 1));
    }

    #[test]
    fn invalid_fit_options_are_rejected() {
        let x = banana(10, 4);
        let mut flow = RealNvpFlow::<TestBackend>::new(2, RealNvpConfig::default());
        let bad = FitConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(flow.fit(x.view(), &bad).is_err());
        let bad = FitConfig {
            validation_fraction: 1.0,
            ..Default::default()
        };
        assert!(flow.fit(x.view(), &bad).is_err());
    }
}
