//! Corner plots of [`Samples`] and loss curves of [`History`], drawn with `plotters`.
//!
//! Both write a PNG bitmap to the given path.

use ndarray::{Array1, ArrayView1};
use plotters::coord::Shift;
use plotters::prelude::*;
use std::ops::Range;
use std::path::Path;

use crate::error::{PoppyError, Result};
use crate::history::History;
use crate::samples::Samples;

const PANEL_SIZE: u32 = 300;
const N_BINS: usize = 30;
const STEEL_BLUE: RGBColor = RGBColor(70, 130, 180);

fn plot_err<E: std::fmt::Display>(e: E) -> PoppyError {
    PoppyError::Plot(e.to_string())
}

/// Finite range of `values`, widened when it collapses to a point.
fn finite_range<'a>(values: impl Iterator<Item = &'a f64>) -> Result<Range<f64>> {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if lo > hi {
        return Err(PoppyError::invalid("no finite values to plot"));
    }
    let pad = if hi > lo { 0.05 * (hi - lo) } else { 0.5 };
    Ok(lo - pad..hi + pad)
}

/// Weighted histogram of `values` on `range`, normalised to a density.
fn histogram(values: ArrayView1<f64>, weights: ArrayView1<f64>, range: &Range<f64>) -> Vec<f64> {
    let width = (range.end - range.start) / N_BINS as f64;
    let mut counts = vec![0.0; N_BINS];
    for (&v, &w) in values.iter().zip(weights.iter()) {
        if v.is_finite() && range.contains(&v) {
            let bin = (((v - range.start) / width) as usize).min(N_BINS - 1);
            counts[bin] += w;
        }
    }
    let total: f64 = counts.iter().sum::<f64>() * width;
    if total > 0.0 {
        counts.iter_mut().for_each(|c| *c /= total);
    }
    counts
}

fn draw_marginal<DB: DrawingBackend>(
    area: &DrawingArea<DB, Shift>,
    name: &str,
    values: ArrayView1<f64>,
    weights: ArrayView1<f64>,
    range: &Range<f64>,
) -> Result<()> {
    let counts = histogram(values, weights, range);
    let top = counts.iter().copied().fold(0.0, f64::max).max(f64::MIN_POSITIVE) * 1.1;
    let width = (range.end - range.start) / N_BINS as f64;
    let mut chart = ChartBuilder::on(area)
        .caption(name, ("sans-serif", 20))
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(range.clone(), 0.0..top)
        .map_err(plot_err)?;
    chart
        .configure_mesh()
        .x_labels(5)
        .y_labels(5)
        .light_line_style(WHITE.mix(0.8))
        .bold_line_style(BLACK.mix(0.5))
        .draw()
        .map_err(plot_err)?;
    chart
        .draw_series(counts.iter().enumerate().map(|(i, &c)| {
            let x0 = range.start + i as f64 * width;
            Rectangle::new([(x0, 0.0), (x0 + width, c)], STEEL_BLUE.mix(0.7).filled())
        }))
        .map_err(plot_err)?;
    Ok(())
}

fn draw_pair<DB: DrawingBackend>(
    area: &DrawingArea<DB, Shift>,
    (x, x_range): (ArrayView1<f64>, &Range<f64>),
    (y, y_range): (ArrayView1<f64>, &Range<f64>),
    alpha: ArrayView1<f64>,
) -> Result<()> {
    let mut chart = ChartBuilder::on(area)
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(x_range.clone(), y_range.clone())
        .map_err(plot_err)?;
    chart
        .configure_mesh()
        .x_labels(5)
        .y_labels(5)
        .light_line_style(WHITE.mix(0.8))
        .bold_line_style(BLACK.mix(0.5))
        .draw()
        .map_err(plot_err)?;
    chart
        .draw_series(
            x.iter()
                .zip(y.iter())
                .zip(alpha.iter())
                .filter(|((x, y), a)| x.is_finite() && y.is_finite() && **a > 0.0)
                .map(|((&x, &y), &a)| Circle::new((x, y), 2, STEEL_BLUE.mix(0.5 * a).filled())),
        )
        .map_err(plot_err)?;
    Ok(())
}

impl Samples {
    /**
    Draws a corner plot: marginal histograms on the diagonal and pairwise scatter plots below.

    With `include_weights` the histograms are weighted and the scatter points are shaded by
    the importance weights scaled to a maximum of one; this requires weights to be present.
    */
    pub fn plot_corner(&self, path: impl AsRef<Path>, include_weights: bool) -> Result<()> {
        let d = self.dims();
        if self.is_empty() || d == 0 {
            return Err(PoppyError::invalid("cannot plot an empty sample set"));
        }
        let weights = if include_weights {
            self.scaled_weights()?
        } else {
            Array1::ones(self.len())
        };
        let ranges = self
            .x
            .columns()
            .into_iter()
            .map(|c| finite_range(c.iter()))
            .collect::<Result<Vec<_>>>()?;

        let size = PANEL_SIZE * d as u32;
        let root = BitMapBackend::new(path.as_ref(), (size, size)).into_drawing_area();
        root.fill(&WHITE).map_err(plot_err)?;
        let panels = root.split_evenly((d, d));
        for (k, panel) in panels.iter().enumerate() {
            let (row, col) = (k / d, k % d);
            if col > row {
                continue;
            }
            if row == col {
                draw_marginal(
                    panel,
                    &self.parameters[col],
                    self.x.column(col),
                    weights.view(),
                    &ranges[col],
                )?;
            } else {
                draw_pair(
                    panel,
                    (self.x.column(col), &ranges[col]),
                    (self.x.column(row), &ranges[row]),
                    weights.view(),
                )?;
            }
        }
        root.present().map_err(plot_err)?;
        Ok(())
    }
}

impl History {
    /// Plots the training loss, and the validation loss when present, against the epoch.
    pub fn plot(&self, path: impl AsRef<Path>) -> Result<()> {
        if self.n_epochs() == 0 {
            return Err(PoppyError::invalid("no epochs to plot"));
        }
        let y_range = finite_range(self.training_loss.iter().chain(&self.validation_loss))?;
        let x_end = (self.n_epochs().max(2) - 1) as f64;

        let root = BitMapBackend::new(path.as_ref(), (900, 600)).into_drawing_area();
        root.fill(&WHITE).map_err(plot_err)?;
        let mut chart = ChartBuilder::on(&root)
            .caption("Loss", ("sans-serif", 30))
            .margin(10)
            .x_label_area_size(40)
            .y_label_area_size(60)
            .build_cartesian_2d(0.0..x_end, y_range)
            .map_err(plot_err)?;
        chart
            .configure_mesh()
            .x_desc("epoch")
            .y_desc("loss")
            .light_line_style(WHITE.mix(0.8))
            .bold_line_style(BLACK.mix(0.5))
            .draw()
            .map_err(plot_err)?;

        let curves = [
            ("training", &self.training_loss, BLUE),
            ("validation", &self.validation_loss, RED),
        ];
        for (label, loss, color) in curves {
            if loss.is_empty() {
                continue;
            }
            chart
                .draw_series(LineSeries::new(
                    loss.iter().enumerate().map(|(i, &l)| (i as f64, l)),
                    &color,
                ))
                .map_err(plot_err)?
                .label(label)
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &color));
        }
        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()
            .map_err(plot_err)?;
        root.present().map_err(plot_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array2};
    use tempfile::tempdir;

    fn weighted_samples() -> Samples {
        let x = Array2::from_shape_fn((200, 3), |(i, j)| ((i * (j + 3)) % 17) as f64 * 0.1);
        let log_w = Array1::from_shape_fn(200, |i| -((i % 7) as f64));
        Samples::new(x)
            .with_log_likelihood(log_w)
            .unwrap()
            .with_log_prior(Array1::zeros(200))
            .unwrap()
            .with_log_q(Array1::zeros(200))
            .unwrap()
    }

    #[test]
    fn weighted_histogram_is_a_density() {
        let values = arr1(&[0.1, 0.2, 0.9, 0.95]);
        let weights = arr1(&[1.0, 1.0, 0.5, 0.5]);
        let range = 0.0..1.0;
        let counts = histogram(values.view(), weights.view(), &range);
        let area: f64 = counts.iter().sum::<f64>() / N_BINS as f64;
        assert!((area - 1.0).abs() < 1e-12);
        assert!(counts[3] > counts[27]);
    }

    #[test]
    fn degenerate_range_is_widened() {
        let r = finite_range([2.0, 2.0, f64::NAN].iter()).unwrap();
        assert_eq!(r, 1.5..2.5);
        assert!(finite_range([f64::NAN].iter()).is_err());
    }

    #[test]
    fn corner_plot_writes_a_png() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corner.png");
        weighted_samples().plot_corner(&path, true).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn weighted_corner_plot_needs_weights() {
        let dir = tempdir().unwrap();
        let samples = Samples::new(Array2::zeros((5, 2)));
        assert!(matches!(
            samples.plot_corner(dir.path().join("c.png"), true),
            Err(PoppyError::MissingWeights)
        ));
        assert!(Samples::new(Array2::zeros((0, 2)))
            .plot_corner(dir.path().join("e.png"), false)
            .is_err());
    }

    #[test]
    fn loss_plot_writes_a_png() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loss.png");
        let history = History {
            training_loss: vec![3.0, 2.0, 1.5, 1.2],
            validation_loss: vec![3.2, 2.3, 1.9, 1.8],
        };
        history.plot(&path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
        assert!(History::new().plot(dir.path().join("none.png")).is_err());
    }
}
