/*!
The posterior being post-processed: a batched log-likelihood and log-prior.

Every sampler in this crate evaluates the model on a whole batch of points at once,
stored as a `[n, dims]` array with one sample per row.

# Examples

```rust
use ndarray::{Array1, ArrayView1};
use poppy::model::{Model, PointwiseModel};

let model = PointwiseModel::new(
    2,
    |x: ArrayView1<f64>| -0.5 * x.dot(&x),
    |_x: ArrayView1<f64>| 0.0,
);
let x = ndarray::arr2(&[[0.0, 0.0], [1.0, 1.0]]);
let ll: Array1<f64> = model.log_likelihood(x.view());
assert_eq!(ll[0], 0.0);
assert_eq!(ll[1], -1.0);
```
*/

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

/// A posterior specified by its batched log-likelihood and log-prior.
pub trait Model {
    /// Number of parameters.
    fn dims(&self) -> usize;

    /// Parameter names, `x_0 .. x_{d-1}` unless overridden.
    fn parameters(&self) -> Vec<String> {
        default_parameters(self.dims())
    }

    /// Log-likelihood of each row of `x`.
    fn log_likelihood(&self, x: ArrayView2<f64>) -> Array1<f64>;

    /// Log-prior of each row of `x`.
    fn log_prior(&self, x: ArrayView2<f64>) -> Array1<f64>;
}

/// Default parameter labels for `dims` parameters.
pub fn default_parameters(dims: usize) -> Vec<String> {
    (0..dims).map(|i| format!("x_{i}")).collect()
}

/// A [`Model`] built from per-sample closures, evaluated over the rows in parallel.
#[derive(Clone)]
pub struct PointwiseModel<L, P> {
    dims: usize,
    parameters: Option<Vec<String>>,
    log_likelihood: L,
    log_prior: P,
}

impl<L, P> PointwiseModel<L, P>
where
    L: Fn(ArrayView1<f64>) -> f64 + Sync,
    P: Fn(ArrayView1<f64>) -> f64 + Sync,
{
    pub fn new(dims: usize, log_likelihood: L, log_prior: P) -> Self {
        Self {
            dims,
            parameters: None,
            log_likelihood,
            log_prior,
        }
    }

    /// Overrides the default `x_i` parameter names.
    pub fn with_parameters(mut self, parameters: Vec<String>) -> Self {
        self.parameters = Some(parameters);
        self
    }

    fn eval_rows<F>(&self, x: ArrayView2<f64>, f: &F) -> Array1<f64>
    where
        F: Fn(ArrayView1<f64>) -> f64 + Sync,
    {
        let rows: Vec<ArrayView1<f64>> = x.axis_iter(Axis(0)).collect();
        let out: Vec<f64> = rows.into_par_iter().map(f).collect();
        Array1::from(out)
    }
}

impl<L, P> Model for PointwiseModel<L, P>
where
    L: Fn(ArrayView1<f64>) -> f64 + Sync,
    P: Fn(ArrayView1<f64>) -> f64 + Sync,
{
    fn dims(&self) -> usize {
        self.dims
    }

    fn parameters(&self) -> Vec<String> {
        self.parameters
            .clone()
            .unwrap_or_else(|| default_parameters(self.dims))
    }

    fn log_likelihood(&self, x: ArrayView2<f64>) -> Array1<f64> {
        self.eval_rows(x, &self.log_likelihood)
    }

    fn log_prior(&self, x: ArrayView2<f64>) -> Array1<f64> {
        self.eval_rows(x, &self.log_prior)
    }
}
