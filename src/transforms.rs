/*!
Invertible, element-wise data transforms with log-Jacobian bookkeeping.

Flows are trained in a rescaled space and MCMC samplers run in a preconditioned space; both
go through a [`DataTransform`]. `forward` maps data `x` to the transformed space and returns
`log|dy/dx|` per row, `inverse` maps back and returns `log|dx/dy|` per row.
*/

use std::fmt;

use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::error::{PoppyError, Result};

/// An invertible transform applied to `[n, dims]` sample matrices.
pub trait DataTransform: fmt::Debug + Send + Sync {
    /// Fits the transform to `x` and returns the transformed samples.
    fn fit(&mut self, x: ArrayView2<f64>) -> Result<Array2<f64>>;

    /// Maps `x` to the transformed space, returning `(y, log|dy/dx|)`.
    fn forward(&self, x: ArrayView2<f64>) -> Result<(Array2<f64>, Array1<f64>)>;

    /// Maps `y` back to data space, returning `(x, log|dx/dy|)`.
    fn inverse(&self, y: ArrayView2<f64>) -> Result<(Array2<f64>, Array1<f64>)>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityTransform;

impl DataTransform for IdentityTransform {
    fn fit(&mut self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        Ok(x.to_owned())
    }

    fn forward(&self, x: ArrayView2<f64>) -> Result<(Array2<f64>, Array1<f64>)> {
        Ok((x.to_owned(), Array1::zeros(x.nrows())))
    }

    fn inverse(&self, y: ArrayView2<f64>) -> Result<(Array2<f64>, Array1<f64>)> {
        Ok((y.to_owned(), Array1::zeros(y.nrows())))
    }
}

/// Per-dimension standardisation `y = (x - shift) / scale`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AffineTransform {
    shift: Option<Array1<f64>>,
    scale: Option<Array1<f64>>,
}

impl AffineTransform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an already fitted transform.
    pub fn from_parts(shift: Array1<f64>, scale: Array1<f64>) -> Result<Self> {
        if shift.len() != scale.len() {
            return Err(PoppyError::shape("shift and scale must have equal length"));
        }
        if scale.iter().any(|s| *s <= 0.0 || !s.is_finite()) {
            return Err(PoppyError::invalid("scale must be positive and finite"));
        }
        Ok(Self {
            shift: Some(shift),
            scale: Some(scale),
        })
    }

    pub fn is_fitted(&self) -> bool {
        self.shift.is_some()
    }

    fn parts(&self, dims: usize) -> Result<(&Array1<f64>, &Array1<f64>)> {
        match (&self.shift, &self.scale) {
            (Some(shift), Some(scale)) if shift.len() == dims => Ok((shift, scale)),
            (Some(shift), Some(_)) => Err(PoppyError::shape(format!(
                "transform fitted on {} dimensions, got {dims}",
                shift.len()
            ))),
            _ => Err(PoppyError::invalid("AffineTransform used before fit")),
        }
    }

    fn log_scale_sum(scale: &Array1<f64>) -> f64 {
        scale.iter().map(|s| s.ln()).sum()
    }
}

impl DataTransform for AffineTransform {
    fn fit(&mut self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        if x.nrows() == 0 {
            return Err(PoppyError::invalid("cannot fit a transform to zero samples"));
        }
        let shift = x
            .mean_axis(Axis(0))
            .ok_or_else(|| PoppyError::invalid("empty sample matrix"))?;
        let ddof = if x.nrows() > 1 { 1.0 } else { 0.0 };
        // Constant dimensions keep unit scale.
        let scale = x
            .std_axis(Axis(0), ddof)
            .mapv(|s| if s > 0.0 && s.is_finite() { s } else { 1.0 });
        self.shift = Some(shift);
        self.scale = Some(scale);
        Ok(self.forward(x)?.0)
    }

    fn forward(&self, x: ArrayView2<f64>) -> Result<(Array2<f64>, Array1<f64>)> {
        let (shift, scale) = self.parts(x.ncols())?;
        let y = (&x - shift) / scale;
        let ladj = Array1::from_elem(x.nrows(), -Self::log_scale_sum(scale));
        Ok((y, ladj))
    }

    fn inverse(&self, y: ArrayView2<f64>) -> Result<(Array2<f64>, Array1<f64>)> {
        let (shift, scale) = self.parts(y.ncols())?;
        let x = &y * scale + shift;
        let ladj = Array1::from_elem(y.nrows(), Self::log_scale_sum(scale));
        Ok((x, ladj))
    }
}

fn softplus(z: f64) -> f64 {
    z.max(0.0) + (-z.abs()).exp().ln_1p()
}

/// Maps bounded parameters onto the real line.
///
/// Dimensions with two finite bounds use a scaled logit, one-sided bounds use a log, and
/// unbounded dimensions pass through unchanged. Points outside the bounds map to NaN.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedTransform {
    lower: Array1<f64>,
    upper: Array1<f64>,
}

impl BoundedTransform {
    pub fn new(lower: Array1<f64>, upper: Array1<f64>) -> Result<Self> {
        if lower.len() != upper.len() {
            return Err(PoppyError::shape("lower and upper bounds must have equal length"));
        }
        if lower.iter().zip(upper.iter()).any(|(l, u)| l >= u) {
            return Err(PoppyError::invalid("every lower bound must be below its upper bound"));
        }
        Ok(Self { lower, upper })
    }

    fn check_dims(&self, dims: usize) -> Result<()> {
        if dims != self.lower.len() {
            return Err(PoppyError::shape(format!(
                "bounds given for {} dimensions, got {dims}",
                self.lower.len()
            )));
        }
        Ok(())
    }

    /// Returns `(y, log|dy/dx|)` for one coordinate.
    fn forward_scalar(x: f64, lower: f64, upper: f64) -> (f64, f64) {
        match (lower.is_finite(), upper.is_finite()) {
            (true, true) => {
                let width = upper - lower;
                let p = (x - lower) / width;
                let y = p.ln() - (1.0 - p).ln();
                (y, -p.ln() - (1.0 - p).ln() - width.ln())
            }
            (true, false) => {
                let y = (x - lower).ln();
                (y, -y)
            }
            (false, true) => {
                let y = (upper - x).ln();
                (y, -y)
            }
            (false, false) => (x, 0.0),
        }
    }

    /// Returns `(x, log|dx/dy|)` for one coordinate.
    fn inverse_scalar(y: f64, lower: f64, upper: f64) -> (f64, f64) {
        match (lower.is_finite(), upper.is_finite()) {
            (true, true) => {
                let width = upper - lower;
                let log_p = -softplus(-y);
                let log_1mp = -softplus(y);
                (lower + width * log_p.exp(), width.ln() + log_p + log_1mp)
            }
            (true, false) => (lower + y.exp(), y),
            (false, true) => (upper - y.exp(), y),
            (false, false) => (y, 0.0),
        }
    }

    fn apply(
        &self,
        v: ArrayView2<f64>,
        f: fn(f64, f64, f64) -> (f64, f64),
    ) -> (Array2<f64>, Array1<f64>) {
        let mut out = Array2::<f64>::zeros(v.raw_dim());
        let mut ladj = Array1::<f64>::zeros(v.nrows());
        for ((mut out_row, row), l) in out
            .axis_iter_mut(Axis(0))
            .zip(v.axis_iter(Axis(0)))
            .zip(ladj.iter_mut())
        {
            for (j, &value) in row.iter().enumerate() {
                let (t, j_ladj) = f(value, self.lower[j], self.upper[j]);
                out_row[j] = t;
                *l += j_ladj;
            }
        }
        (out, ladj)
    }
}

impl DataTransform for BoundedTransform {
    fn fit(&mut self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        Ok(self.forward(x)?.0)
    }

    fn forward(&self, x: ArrayView2<f64>) -> Result<(Array2<f64>, Array1<f64>)> {
        self.check_dims(x.ncols())?;
        Ok(self.apply(x, Self::forward_scalar))
    }

    fn inverse(&self, y: ArrayView2<f64>) -> Result<(Array2<f64>, Array1<f64>)> {
        self.check_dims(y.ncols())?;
        Ok(self.apply(y, Self::inverse_scalar))
    }
}

/// Applies transforms in order on `forward`, and in reverse order on `inverse`.
#[derive(Debug, Default)]
pub struct ChainTransform {
    transforms: Vec<Box<dyn DataTransform>>,
}

impl ChainTransform {
    pub fn new(transforms: Vec<Box<dyn DataTransform>>) -> Self {
        Self { transforms }
    }

    /// Bounded parameters mapped to the real line and then standardised.
    pub fn bounded_affine(lower: Array1<f64>, upper: Array1<f64>) -> Result<Self> {
        Ok(Self::new(vec![
            Box::new(BoundedTransform::new(lower, upper)?),
            Box::new(AffineTransform::new()),
        ]))
    }
}

impl DataTransform for ChainTransform {
    fn fit(&mut self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        let mut current = x.to_owned();
        for t in self.transforms.iter_mut() {
            current = t.fit(current.view())?;
        }
        Ok(current)
    }

    fn forward(&self, x: ArrayView2<f64>) -> Result<(Array2<f64>, Array1<f64>)> {
        let mut current = x.to_owned();
        let mut total = Array1::<f64>::zeros(x.nrows());
        for t in self.transforms.iter() {
            let (next, ladj) = t.forward(current.view())?;
            total += &ladj;
            current = next;
        }
        Ok((current, total))
    }

    fn inverse(&self, y: ArrayView2<f64>) -> Result<(Array2<f64>, Array1<f64>)> {
        let mut current = y.to_owned();
        let mut total = Array1::<f64>::zeros(y.nrows());
        for t in self.transforms.iter().rev() {
            let (next, ladj) = t.inverse(current.view())?;
            total += &ladj;
            current = next;
        }
        Ok((current, total))
    }
}
