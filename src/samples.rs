/*!
Containers for posterior samples.

[`Samples`] stores a batch of points together with (optionally) their log-likelihood,
log-prior and the log-density `log_q` of the distribution they were drawn from. As soon as
all three are known the importance weights `w = L π / q`, the evidence estimate
`Z = mean(w)` with its error, and the effective sample size are derived.

[`SmcSamples`] is the tempered variant used by sequential Monte Carlo: the points
target `q^(1-β) (L π)^β` at inverse temperature `β`.

# Examples

```rust
use ndarray::{arr1, arr2};
use poppy::samples::Samples;

let samples = Samples::new(arr2(&[[0.0], [1.0], [2.0]]))
    .with_log_likelihood(arr1(&[0.0, 0.0, 0.0]))?
    .with_log_prior(arr1(&[-1.0, -1.0, -1.0]))?
    .with_log_q(arr1(&[-1.0, -1.0, -1.0]))?;

// Weights are all one, so the evidence is one and every sample counts.
assert!((samples.evidence.unwrap() - 1.0).abs() < 1e-12);
assert!((samples.effective_sample_size.unwrap() - 3.0).abs() < 1e-9);
# Ok::<(), poppy::error::PoppyError>(())
```
*/

use std::fmt;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::error::{PoppyError, Result};
use crate::model::default_parameters;
use crate::utils::{logsumexp, max_of};

/// Samples with optional likelihood, prior and proposal densities, plus the importance
/// weights and evidence derived from them.
#[derive(Debug, Clone, PartialEq)]
pub struct Samples {
    /// Sample matrix of shape `[n, dims]`.
    pub x: Array2<f64>,
    pub log_likelihood: Option<Array1<f64>>,
    pub log_prior: Option<Array1<f64>>,
    /// Log-density of the distribution the samples were drawn from.
    pub log_q: Option<Array1<f64>>,
    pub parameters: Vec<String>,
    pub log_w: Option<Array1<f64>>,
    pub weights: Option<Array1<f64>>,
    pub evidence: Option<f64>,
    pub evidence_error: Option<f64>,
    pub log_evidence: Option<f64>,
    pub log_evidence_error: Option<f64>,
    pub effective_sample_size: Option<f64>,
}

/// Serializable overview of a [`Samples`] instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub n_samples: usize,
    pub parameters: Vec<String>,
    pub log_evidence: Option<f64>,
    pub log_evidence_error: Option<f64>,
    pub effective_sample_size: Option<f64>,
    pub efficiency: Option<f64>,
}

fn check_len(name: &str, values: &Array1<f64>, n: usize) -> Result<()> {
    if values.len() != n {
        return Err(PoppyError::shape(format!(
            "{name} has {} entries but there are {n} samples",
            values.len()
        )));
    }
    Ok(())
}

fn column_to_value(values: Option<&Array1<f64>>) -> Value {
    match values {
        Some(v) => json!(v.to_vec()),
        None => Value::Null,
    }
}

impl Samples {
    /// Creates unweighted samples with default parameter names `x_0 .. x_{d-1}`.
    pub fn new(x: Array2<f64>) -> Self {
        let parameters = default_parameters(x.ncols());
        Self {
            x,
            log_likelihood: None,
            log_prior: None,
            log_q: None,
            parameters,
            log_w: None,
            weights: None,
            evidence: None,
            evidence_error: None,
            log_evidence: None,
            log_evidence_error: None,
            effective_sample_size: None,
        }
    }

    /// Creates samples of a one-dimensional parameter from a flat array.
    pub fn from_1d(x: Array1<f64>) -> Self {
        Self::new(x.insert_axis(Axis(1)))
    }

    pub fn with_parameters(mut self, parameters: Vec<String>) -> Result<Self> {
        if parameters.len() != self.dims() {
            return Err(PoppyError::shape(format!(
                "{} parameter names given for {} dimensions",
                parameters.len(),
                self.dims()
            )));
        }
        self.parameters = parameters;
        Ok(self)
    }

    pub fn with_log_likelihood(mut self, log_likelihood: Array1<f64>) -> Result<Self> {
        check_len("log_likelihood", &log_likelihood, self.len())?;
        self.log_likelihood = Some(log_likelihood);
        self.refresh_weights()?;
        Ok(self)
    }

    pub fn with_log_prior(mut self, log_prior: Array1<f64>) -> Result<Self> {
        check_len("log_prior", &log_prior, self.len())?;
        self.log_prior = Some(log_prior);
        self.refresh_weights()?;
        Ok(self)
    }

    pub fn with_log_q(mut self, log_q: Array1<f64>) -> Result<Self> {
        check_len("log_q", &log_q, self.len())?;
        self.log_q = Some(log_q);
        self.refresh_weights()?;
        Ok(self)
    }

    /// Attaches an externally computed evidence estimate (e.g. from an importance pass).
    pub fn with_log_evidence(mut self, log_evidence: f64, log_evidence_error: Option<f64>) -> Self {
        self.log_evidence = Some(log_evidence);
        self.log_evidence_error = log_evidence_error;
        self
    }

    /// Number of parameters, also for a set without any rows.
    pub fn dims(&self) -> usize {
        self.x.ncols()
    }

    pub fn len(&self) -> usize {
        self.x.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.x.nrows() == 0
    }

    fn refresh_weights(&mut self) -> Result<()> {
        let complete =
            self.log_likelihood.is_some() && self.log_prior.is_some() && self.log_q.is_some();
        if complete && !self.is_empty() {
            self.compute_weights()
        } else {
            self.log_w = None;
            self.weights = None;
            self.evidence = None;
            self.evidence_error = None;
            self.effective_sample_size = None;
            Ok(())
        }
    }

    /// Computes the importance weights `log_w = log L + log π - log q`, the evidence
    /// estimate and its error, and the effective sample size.
    ///
    /// With a single sample the evidence error is undefined and stored as NaN.
    pub fn compute_weights(&mut self) -> Result<()> {
        let (ll, lp, lq) = match (&self.log_likelihood, &self.log_prior, &self.log_q) {
            (Some(ll), Some(lp), Some(lq)) => (ll, lp, lq),
            _ => {
                return Err(PoppyError::invalid(
                    "computing weights requires log_likelihood, log_prior and log_q",
                ))
            }
        };
        let n = self.x.nrows();
        if n == 0 {
            return Err(PoppyError::invalid("cannot compute weights of zero samples"));
        }
        let n_f = n as f64;

        let log_w = ll + lp - lq;
        let log_evidence = logsumexp(log_w.view()) - n_f.ln();
        let weights = log_w.mapv(f64::exp);
        let evidence = log_evidence.exp();
        let evidence_error =
            (weights.mapv(|w| (w - evidence).powi(2)).sum() / (n_f * (n_f - 1.0))).sqrt();
        let log_evidence_error = (evidence_error / evidence).abs();

        let max = max_of(log_w.view());
        let shifted = log_w.mapv(|w| w - max);
        let doubled = shifted.mapv(|w| 2.0 * w);
        let ess = (2.0 * logsumexp(shifted.view()) - logsumexp(doubled.view())).exp();

        self.log_w = Some(log_w);
        self.weights = Some(weights);
        self.log_evidence = Some(log_evidence);
        self.evidence = Some(evidence);
        self.evidence_error = Some(evidence_error);
        self.log_evidence_error = Some(log_evidence_error);
        self.effective_sample_size = Some(ess);
        Ok(())
    }

    /// Effective sample size divided by the number of samples.
    pub fn efficiency(&self) -> Result<f64> {
        match self.effective_sample_size {
            Some(ess) if self.log_w.is_some() => Ok(ess / self.len() as f64),
            _ => Err(PoppyError::MissingWeights),
        }
    }

    /// Weights rescaled so that the largest equals one.
    pub fn scaled_weights(&self) -> Result<Array1<f64>> {
        let log_w = self.log_w.as_ref().ok_or(PoppyError::MissingWeights)?;
        let max = max_of(log_w.view());
        Ok(log_w.mapv(|w| (w - max).exp()))
    }

    /// Selects the given rows, keeping every per-sample quantity aligned.
    pub fn select(&self, indices: &[usize]) -> Result<Self> {
        if let Some(&i) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(PoppyError::invalid(format!(
                "index {i} out of range for {} samples",
                self.len()
            )));
        }
        let pick = |v: &Option<Array1<f64>>| v.as_ref().map(|a| a.select(Axis(0), indices));
        let mut out = Samples::new(self.x.select(Axis(0), indices));
        out.parameters.clone_from(&self.parameters);
        out.log_likelihood = pick(&self.log_likelihood);
        out.log_prior = pick(&self.log_prior);
        out.log_q = pick(&self.log_q);
        out.refresh_weights()?;
        Ok(out)
    }

    /// Draws an unweighted subset: sample `i` is kept when `log_w_i - max(log_w) > ln u_i`.
    ///
    /// The result keeps the likelihood and prior but not `log_q`, so it carries no weights.
    pub fn rejection_sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Self> {
        let log_w = self.log_w.as_ref().ok_or(PoppyError::MissingWeights)?;
        let max = max_of(log_w.view());
        let keep: Vec<usize> = log_w
            .iter()
            .enumerate()
            .filter(|&(_, &w)| {
                let u: f64 = rng.gen();
                w - max > u.ln()
            })
            .map(|(i, _)| i)
            .collect();

        let mut out = Samples::new(self.x.select(Axis(0), &keep));
        out.parameters.clone_from(&self.parameters);
        out.log_likelihood = self.log_likelihood.as_ref().map(|a| a.select(Axis(0), &keep));
        out.log_prior = self.log_prior.as_ref().map(|a| a.select(Axis(0), &keep));
        Ok(out)
    }

    fn parameter_columns(&self) -> Map<String, Value> {
        self.parameters
            .iter()
            .zip(self.x.axis_iter(Axis(1)))
            .map(|(name, col)| (name.clone(), json!(col.to_vec())))
            .collect()
    }

    /// Dictionary view of the samples.
    ///
    /// With `flat` the parameter columns sit next to the other quantities, otherwise they are
    /// nested under `"samples"`. Non-finite numbers become `null`.
    pub fn to_json(&self, flat: bool) -> Value {
        let mut out = Map::new();
        out.insert("log_likelihood".into(), column_to_value(self.log_likelihood.as_ref()));
        out.insert("log_prior".into(), column_to_value(self.log_prior.as_ref()));
        out.insert("log_q".into(), column_to_value(self.log_q.as_ref()));
        out.insert("log_w".into(), column_to_value(self.log_w.as_ref()));
        out.insert("weights".into(), column_to_value(self.weights.as_ref()));
        out.insert("evidence".into(), json!(self.evidence));
        out.insert("log_evidence".into(), json!(self.log_evidence));
        out.insert("evidence_error".into(), json!(self.evidence_error));
        out.insert("log_evidence_error".into(), json!(self.log_evidence_error));
        out.insert("effective_sample_size".into(), json!(self.effective_sample_size));
        let columns = self.parameter_columns();
        if flat {
            out.extend(columns);
        } else {
            out.insert("samples".into(), Value::Object(columns));
        }
        Value::Object(out)
    }

    pub fn summary(&self) -> Summary {
        Summary {
            n_samples: self.len(),
            parameters: self.parameters.clone(),
            log_evidence: self.log_evidence,
            log_evidence_error: self.log_evidence_error,
            effective_sample_size: self.effective_sample_size,
            efficiency: self.efficiency().ok(),
        }
    }

    /// Per-sample columns in output order: parameters, then whichever of
    /// `log_likelihood`, `log_prior`, `log_q`, `log_w` are present.
    pub fn columns(&self) -> Vec<(String, ArrayView1<'_, f64>)> {
        let mut out: Vec<(String, ArrayView1<'_, f64>)> = self
            .parameters
            .iter()
            .cloned()
            .zip(self.x.axis_iter(Axis(1)))
            .collect();
        let extra = [
            ("log_likelihood", &self.log_likelihood),
            ("log_prior", &self.log_prior),
            ("log_q", &self.log_q),
            ("log_w", &self.log_w),
        ];
        for (name, values) in extra {
            if let Some(v) = values {
                out.push((name.to_string(), v.view()));
            }
        }
        out
    }
}

impl fmt::Display for Samples {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "No. samples: {}", self.len())?;
        writeln!(f, "No. parameters: {}", self.parameters.len())?;
        if let Some(log_z) = self.log_evidence {
            match self.log_evidence_error {
                Some(err) => writeln!(f, "Log evidence: {log_z:.2} +/- {err:.2}")?,
                None => writeln!(f, "Log evidence: {log_z:.2}")?,
            }
        }
        if let (Some(ess), Ok(eff)) = (self.effective_sample_size, self.efficiency()) {
            writeln!(f, "Effective sample size: {ess:.1}")?;
            writeln!(f, "Efficiency: {eff:.2}")?;
        }
        Ok(())
    }
}

/// Samples at inverse temperature `beta` of the path `q^(1-β) (L π)^β`.
#[derive(Debug, Clone, PartialEq)]
pub struct SmcSamples {
    pub x: Array2<f64>,
    pub log_likelihood: Array1<f64>,
    pub log_prior: Array1<f64>,
    pub log_q: Array1<f64>,
    pub parameters: Vec<String>,
    /// Inverse temperature the samples currently target.
    pub beta: f64,
    /// Running log evidence `log Z_β` accumulated along the path.
    pub log_evidence: Option<f64>,
    pub log_evidence_error: Option<f64>,
}

impl SmcSamples {
    pub fn new(
        x: Array2<f64>,
        log_likelihood: Array1<f64>,
        log_prior: Array1<f64>,
        log_q: Array1<f64>,
        beta: f64,
    ) -> Result<Self> {
        let n = x.nrows();
        check_len("log_likelihood", &log_likelihood, n)?;
        check_len("log_prior", &log_prior, n)?;
        check_len("log_q", &log_q, n)?;
        let parameters = default_parameters(x.ncols());
        Ok(Self {
            x,
            log_likelihood,
            log_prior,
            log_q,
            parameters,
            beta,
            log_evidence: None,
            log_evidence_error: None,
        })
    }

    pub fn len(&self) -> usize {
        self.x.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.x.nrows() == 0
    }

    /// Unnormalized log density of the tempered target at `beta`.
    pub fn log_p_t(&self, beta: f64) -> Array1<f64> {
        let log_target = &self.log_likelihood + &self.log_prior;
        (1.0 - beta) * &self.log_q + beta * log_target
    }

    /// Incremental log weights for moving the samples from `self.beta` to `beta`.
    pub fn unnormalized_log_weights(&self, beta: f64) -> Array1<f64> {
        let delta = beta - self.beta;
        if delta == 0.0 {
            return Array1::zeros(self.len());
        }
        let log_target = &self.log_likelihood + &self.log_prior;
        -delta * &self.log_q + delta * log_target
    }

    /// Log of `Z_beta / Z_self.beta`, the mean incremental weight.
    pub fn log_evidence_ratio(&self, beta: f64) -> f64 {
        let log_w = self.unnormalized_log_weights(beta);
        logsumexp(log_w.view()) - (self.len() as f64).ln()
    }

    /// Incremental log weights normalized to unit mean.
    pub fn log_weights(&self, beta: f64) -> Result<Array1<f64>> {
        let log_w = self.unnormalized_log_weights(beta);
        if log_w.iter().any(|w| w.is_nan()) {
            return Err(PoppyError::NanWeights { beta });
        }
        let ratio = logsumexp(log_w.view()) - (self.len() as f64).ln();
        Ok(log_w - ratio)
    }

    /// Effective sample size of the incremental weights towards `beta`.
    pub fn effective_sample_size(&self, beta: f64) -> Result<f64> {
        let log_w = self.log_weights(beta)?;
        let doubled = log_w.mapv(|w| 2.0 * w);
        Ok((2.0 * logsumexp(log_w.view()) - logsumexp(doubled.view())).exp())
    }

    /// Multinomial resampling with the incremental weights towards `beta`.
    ///
    /// Resampling at the current temperature is a no-op and returns a copy.
    pub fn resample<R: Rng + ?Sized>(
        &self,
        beta: f64,
        n_samples: Option<usize>,
        rng: &mut R,
    ) -> Result<Self> {
        if beta == self.beta {
            warn!("Resampling with the same beta value");
            return Ok(self.clone());
        }
        let n_samples = n_samples.unwrap_or(self.len());
        let log_w = self.log_weights(beta)?;
        let norm = logsumexp(log_w.view());
        let w: Vec<f64> = log_w.iter().map(|lw| (lw - norm).exp()).collect();
        let dist = WeightedIndex::new(&w).map_err(|e| PoppyError::invalid(e.to_string()))?;
        let idx: Vec<usize> = (0..n_samples).map(|_| dist.sample(rng)).collect();
        Ok(Self {
            x: self.x.select(Axis(0), &idx),
            log_likelihood: self.log_likelihood.select(Axis(0), &idx),
            log_prior: self.log_prior.select(Axis(0), &idx),
            log_q: self.log_q.select(Axis(0), &idx),
            parameters: self.parameters.clone(),
            beta,
            log_evidence: self.log_evidence,
            log_evidence_error: self.log_evidence_error,
        })
    }

    /// Plain posterior samples carrying the accumulated evidence.
    pub fn to_standard_samples(&self) -> Result<Samples> {
        let mut samples = Samples::new(self.x.clone())
            .with_parameters(self.parameters.clone())?
            .with_log_likelihood(self.log_likelihood.clone())?
            .with_log_prior(self.log_prior.clone())?;
        samples.log_evidence = self.log_evidence;
        samples.log_evidence_error = self.log_evidence_error;
        Ok(samples)
    }
}

impl fmt::Display for SmcSamples {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "No. samples: {}", self.len())?;
        writeln!(f, "No. parameters: {}", self.parameters.len())?;
        if let Some(log_z) = self.log_evidence {
            writeln!(f, "Log evidence: {log_z:.2}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};
    use rand::rngs::SmallRng;

    fn weighted(log_w: &[f64]) -> Samples {
        let n = log_w.len();
        let x = Array2::from_shape_fn((n, 2), |(i, j)| (i * 2 + j) as f64);
        Samples::new(x)
            .with_log_likelihood(arr1(log_w))
            .unwrap()
            .with_log_prior(Array1::zeros(n))
            .unwrap()
            .with_log_q(Array1::zeros(n))
            .unwrap()
    }

    #[test]
    fn weights_require_all_three_densities() {
        let s = Samples::new(arr2(&[[1.0], [2.0]]))
            .with_log_likelihood(arr1(&[0.0, 0.0]))
            .unwrap();
        assert!(s.log_w.is_none());
        assert!(matches!(s.efficiency(), Err(PoppyError::MissingWeights)));
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let res = Samples::new(arr2(&[[1.0], [2.0]])).with_log_prior(arr1(&[0.0]));
        assert!(matches!(res, Err(PoppyError::Shape(_))));
    }

    #[test]
    fn evidence_and_ess_for_known_weights() {
        let log_w = [0.0, 2.0_f64.ln(), 3.0_f64.ln()];
        let s = weighted(&log_w);
        // Mean of weights 1, 2, 3.
        assert_abs_diff_eq!(s.evidence.unwrap(), 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s.log_evidence.unwrap(), 2.0_f64.ln(), epsilon = 1e-12);
        // sqrt(((1-2)^2 + 0 + (3-2)^2) / (3 * 2))
        let err = (2.0_f64 / 6.0).sqrt();
        assert_abs_diff_eq!(s.evidence_error.unwrap(), err, epsilon = 1e-12);
        assert_abs_diff_eq!(s.log_evidence_error.unwrap(), err / 2.0, epsilon = 1e-12);
        // Kish ESS: (1 + 2 + 3)^2 / (1 + 4 + 9)
        assert_abs_diff_eq!(s.effective_sample_size.unwrap(), 36.0 / 14.0, epsilon = 1e-9);
        assert_abs_diff_eq!(s.efficiency().unwrap(), 12.0 / 14.0, epsilon = 1e-9);
    }

    #[test]
    fn scaled_weights_peak_at_one() {
        let s = weighted(&[-3.0, 5.0, 1.0]);
        let sw = s.scaled_weights().unwrap();
        assert_abs_diff_eq!(sw[1], 1.0);
        assert_abs_diff_eq!(sw[0], (-8.0_f64).exp(), epsilon = 1e-15);
    }

    #[test]
    fn rejection_sample_keeps_max_weight_and_drops_q() {
        let s = weighted(&[0.0, -1000.0, -1000.0, -1000.0]);
        let mut rng = SmallRng::seed_from_u64(42);
        let r = s.rejection_sample(&mut rng).unwrap();
        assert_eq!(r.len(), 1);
        assert_eq!(r.x.row(0).to_vec(), vec![0.0, 1.0]);
        assert!(r.log_q.is_none());
        assert!(r.log_w.is_none());
        assert!(r.log_likelihood.is_some());
    }

    #[test]
    fn json_layout_flat_and_nested() {
        let s = weighted(&[0.0, 0.0]).with_parameters(vec!["a".into(), "b".into()]).unwrap();
        let flat = s.to_json(true);
        assert_eq!(flat["a"], json!([0.0, 2.0]));
        assert!(flat.get("samples").is_none());
        let nested = s.to_json(false);
        assert_eq!(nested["samples"]["b"], json!([1.0, 3.0]));
        assert!(nested.get("a").is_none());
    }

    #[test]
    fn display_reports_evidence_and_efficiency() {
        let s = weighted(&[0.0, 0.0]);
        let text = s.to_string();
        assert!(text.contains("No. samples: 2"));
        assert!(text.contains("No. parameters: 2"));
        assert!(text.contains("Log evidence: 0.00 +/- 0.00"));
        assert!(text.contains("Efficiency: 1.00"));
    }

    #[test]
    fn empty_samples_keep_their_columns() {
        let s = Samples::new(Array2::zeros((0, 3)));
        assert_eq!(s.dims(), 3);
        assert!(s.is_empty());
        let s = s
            .with_parameters(vec!["a".into(), "b".into(), "c".into()])
            .unwrap()
            .with_log_likelihood(Array1::zeros(0))
            .unwrap()
            .with_log_prior(Array1::zeros(0))
            .unwrap()
            .with_log_q(Array1::zeros(0))
            .unwrap();
        assert_eq!(s.parameters, vec!["a", "b", "c"]);
        assert!(s.log_w.is_none());
    }

    #[test]
    fn explicit_evidence_survives_until_weights_exist() {
        let s = Samples::new(arr2(&[[0.0], [1.0]]))
            .with_log_evidence(-3.0, Some(0.1))
            .with_log_likelihood(arr1(&[0.0, 0.0]))
            .unwrap()
            .with_log_prior(arr1(&[0.0, 0.0]))
            .unwrap();
        assert_eq!(s.log_evidence, Some(-3.0));
        assert_eq!(s.log_evidence_error, Some(0.1));

        let s = s.with_log_q(arr1(&[0.0, 0.0])).unwrap();
        assert_abs_diff_eq!(s.log_evidence.unwrap(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s.log_evidence_error.unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn single_sample_has_nan_evidence_error() {
        let s = weighted(&[0.5]);
        assert_abs_diff_eq!(s.log_evidence.unwrap(), 0.5, epsilon = 1e-12);
        assert!(s.evidence_error.unwrap().is_nan());
        assert!(s.log_evidence_error.unwrap().is_nan());
        assert_abs_diff_eq!(s.effective_sample_size.unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn select_rejects_out_of_range_indices() {
        let s = weighted(&[0.0, 1.0]);
        assert!(matches!(s.select(&[0, 2]), Err(PoppyError::InvalidInput(_))));
    }

    #[test]
    fn select_recomputes_weights() {
        let s = weighted(&[0.0, 1.0, 2.0]);
        let sub = s.select(&[2, 2]).unwrap();
        assert_eq!(sub.len(), 2);
        assert_abs_diff_eq!(sub.log_evidence.unwrap(), 2.0, epsilon = 1e-12);
    }

    fn smc() -> SmcSamples {
        SmcSamples::new(
            arr2(&[[0.0], [1.0], [2.0], [3.0]]),
            arr1(&[-1.0, -2.0, -3.0, -4.0]),
            arr1(&[0.0, 0.0, 0.0, 0.0]),
            arr1(&[-0.5, -0.5, -0.5, -0.5]),
            0.0,
        )
        .unwrap()
    }

    #[test]
    fn log_p_t_interpolates_between_q_and_target() {
        let s = smc();
        assert_eq!(s.log_p_t(0.0), s.log_q);
        assert_eq!(s.log_p_t(1.0), &s.log_likelihood + &s.log_prior);
    }

    #[test]
    fn incremental_weights_and_ratio() {
        let s = smc();
        let w = s.unnormalized_log_weights(0.5);
        assert_abs_diff_eq!(w, arr1(&[-0.25, -0.75, -1.25, -1.75]), epsilon = 1e-12);
        let expected = (w.mapv(f64::exp).sum() / 4.0).ln();
        assert_abs_diff_eq!(s.log_evidence_ratio(0.5), expected, epsilon = 1e-12);
        let lw = s.log_weights(0.5).unwrap();
        assert_abs_diff_eq!(lw.mapv(f64::exp).mean().unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn nan_weights_are_an_error() {
        let mut s = smc();
        s.log_likelihood[0] = f64::NAN;
        assert!(matches!(s.log_weights(1.0), Err(PoppyError::NanWeights { .. })));
    }

    #[test]
    fn resample_same_beta_is_identity() {
        let s = smc();
        let mut rng = SmallRng::seed_from_u64(0);
        assert_eq!(s.resample(0.0, None, &mut rng).unwrap(), s);
    }

    #[test]
    fn resample_favours_heavy_samples() {
        let mut s = smc();
        s.log_likelihood = arr1(&[0.0, -50.0, -50.0, -50.0]);
        let mut rng = SmallRng::seed_from_u64(0);
        let r = s.resample(1.0, Some(10), &mut rng).unwrap();
        assert_eq!(r.len(), 10);
        assert_eq!(r.beta, 1.0);
        assert!(r.x.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn standard_samples_keep_evidence() {
        let mut s = smc();
        s.log_evidence = Some(-1.5);
        let std = s.to_standard_samples().unwrap();
        assert_eq!(std.log_evidence, Some(-1.5));
        assert!(std.log_w.is_none());
        assert_eq!(std.len(), 4);
    }
}
