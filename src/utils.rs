//! Numerical helpers shared by the rest of the crate, and the bridge between
//! `ndarray` arrays and `burn` tensors.

use burn::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_stats::CorrelationExt;
use num_traits::Float;
use std::f64::consts::PI;

use crate::error::{PoppyError, Result};

/// Numerically stable `log(sum(exp(values)))`.
///
/// Returns `-inf` for an empty input or when every entry is `-inf`. NaN entries propagate.
///
/// # Examples
///
/// ```rust
/// use ndarray::arr1;
/// use poppy::utils::logsumexp;
///
/// let lse = logsumexp(arr1(&[0.0_f64, 0.0]).view());
/// assert!((lse - 2.0_f64.ln()).abs() < 1e-12);
/// ```
pub fn logsumexp<T: Float>(values: ArrayView1<T>) -> T {
    let max = values
        .iter()
        .fold(T::neg_infinity(), |acc, &v| if v > acc { v } else { acc });
    if max == T::neg_infinity() {
        return T::neg_infinity();
    }
    if max == T::infinity() {
        return T::infinity();
    }
    let sum = values
        .iter()
        .fold(T::zero(), |acc, &v| acc + (v - max).exp());
    max + sum.ln()
}

/// Maximum of a 1D array, `-inf` when empty.
pub fn max_of(values: ArrayView1<f64>) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

/// Row-wise log density of the standard normal `N(0, I)`.
pub fn standard_normal_log_prob(z: ArrayView2<f64>) -> Array1<f64> {
    let d = z.ncols() as f64;
    let norm = -0.5 * d * (2.0 * PI).ln();
    z.map_axis(Axis(1), |row| norm - 0.5 * row.dot(&row))
}

/// Sample mean (per column) and covariance of a `[n, d]` sample matrix.
pub fn mean_cov(x: ArrayView2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
    if x.nrows() < 2 {
        return Err(PoppyError::invalid(
            "at least two samples are required to estimate a covariance",
        ));
    }
    let mean = x
        .mean_axis(Axis(0))
        .ok_or_else(|| PoppyError::invalid("empty sample matrix"))?;
    let cov = x
        .t()
        .cov(1.0)
        .map_err(|e| PoppyError::invalid(e.to_string()))?;
    Ok((mean, cov))
}

/// Converts a `[n, d]` array into a 2D burn tensor on `device`.
pub fn array_to_tensor<B: Backend>(x: ArrayView2<f64>, device: &B::Device) -> Tensor<B, 2> {
    let (n, d) = x.dim();
    let data: Vec<f64> = x.iter().copied().collect();
    let td = TensorData::new(data, [n, d]).convert::<B::FloatElem>();
    Tensor::<B, 2>::from_data(td, device)
}

/// Converts a 2D burn tensor back into a `[n, d]` array of `f64`.
pub fn tensor_to_array<B: Backend>(tensor: Tensor<B, 2>) -> Result<Array2<f64>> {
    let [n, d] = tensor.dims();
    let data = tensor
        .into_data()
        .convert::<f64>()
        .to_vec::<f64>()
        .map_err(|e| PoppyError::Backend(format!("{e:?}")))?;
    Ok(Array2::from_shape_vec((n, d), data)?)
}

/// Converts a 1D burn tensor into an array of `f64`.
pub fn tensor1_to_array<B: Backend>(tensor: Tensor<B, 1>) -> Result<Array1<f64>> {
    let data = tensor
        .into_data()
        .convert::<f64>()
        .to_vec::<f64>()
        .map_err(|e| PoppyError::Backend(format!("{e:?}")))?;
    Ok(Array1::from(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::NdArray;
    use ndarray::{arr1, arr2};

    #[test]
    fn logsumexp_matches_naive_sum() {
        let v = arr1(&[-1.0, 0.5, 2.0]);
        let naive = v.iter().map(|x: &f64| x.exp()).sum::<f64>().ln();
        assert_abs_diff_eq!(logsumexp(v.view()), naive, epsilon = 1e-12);
    }

    #[test]
    fn logsumexp_is_stable_for_large_values() {
        let v = arr1(&[1000.0, 1000.0]);
        assert_abs_diff_eq!(logsumexp(v.view()), 1000.0 + 2.0_f64.ln(), epsilon = 1e-9);
    }

    #[test]
    fn logsumexp_of_empty_or_neg_inf_is_neg_inf() {
        let empty = Array1::<f64>::zeros(0);
        assert_eq!(logsumexp(empty.view()), f64::NEG_INFINITY);
        let v = arr1(&[f64::NEG_INFINITY, f64::NEG_INFINITY]);
        assert_eq!(logsumexp(v.view()), f64::NEG_INFINITY);
    }

    #[test]
    fn logsumexp_propagates_nan() {
        let v = arr1(&[0.0, f64::NAN]);
        assert!(logsumexp(v.view()).is_nan());
    }

    #[test]
    fn standard_normal_at_origin() {
        let z = Array2::<f64>::zeros((1, 2));
        let lp = standard_normal_log_prob(z.view());
        assert_abs_diff_eq!(lp[0], -(2.0 * PI).ln(), epsilon = 1e-12);
    }

    #[test]
    fn tensor_round_trip_preserves_layout() {
        let x = arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let t = array_to_tensor::<NdArray>(x.view(), &Default::default());
        assert_eq!(t.dims(), [2, 3]);
        let back = tensor_to_array(t).unwrap();
        assert_abs_diff_eq!(back, x, epsilon = 1e-6);
    }
}
