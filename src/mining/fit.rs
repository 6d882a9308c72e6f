//! This module contains the small numeric routines behind the fitted
//! relation kinds: ordinary least squares for the linear model and a
//! constant-product check for the inverse model.
//!
//! The fits are search heuristics, not statistical claims; a fitted model is
//! only kept when every individual sample satisfies it exactly (up to
//! floating point noise).

use crate::constant::FIT_MIN_SLOPE;

/// A fitted linear model `y = slope * x + intercept`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,

    /// The coefficient of determination over the fitted samples.
    pub r_squared: f64,
}

/// Fits `y = slope * x + intercept` by least squares.
///
/// Returns `None` for fewer than two samples, mismatched series, degenerate
/// `x` variance, non-finite inputs, or a near-zero slope; a flat `y` is a
/// constant, not a model over `x`.
#[must_use]
pub fn linear_fit(xs: &[f64], ys: &[f64]) -> Option<LinearFit> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }
    if xs.iter().chain(ys).any(|v| !v.is_finite()) {
        return None;
    }

    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut covariance = 0.0;
    let mut variance_x = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        covariance += (x - mean_x) * (y - mean_y);
        variance_x += (x - mean_x) * (x - mean_x);
    }
    if variance_x == 0.0 {
        return None;
    }

    let slope = covariance / variance_x;
    if slope.abs() <= FIT_MIN_SLOPE {
        return None;
    }
    let intercept = mean_y - slope * mean_x;

    let mut residual = 0.0;
    let mut total = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let predicted = slope * x + intercept;
        residual += (y - predicted) * (y - predicted);
        total += (y - mean_y) * (y - mean_y);
    }
    // A flat y cannot reach here; the slope guard already rejected it.
    if total == 0.0 {
        return None;
    }
    let r_squared = 1.0 - residual / total;

    Some(LinearFit {
        slope,
        intercept,
        r_squared,
    })
}

/// Checks whether `x * y` is the same non-zero constant across every sample
/// and returns it.
#[must_use]
pub fn constant_product(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }

    let first = xs[0] * ys[0];
    if !first.is_finite() || nearly_equal(first, 0.0) {
        return None;
    }
    for (x, y) in xs.iter().zip(ys).skip(1) {
        if !nearly_equal(x * y, first) {
            return None;
        }
    }
    Some(first)
}

/// Approximate floating point equality with a relative tolerance.
#[must_use]
pub fn nearly_equal(a: f64, b: f64) -> bool {
    if !a.is_finite() || !b.is_finite() {
        return false;
    }
    (a - b).abs() <= 1e-6 * a.abs().max(b.abs()).max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_an_exact_line() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        let ys = [5.0, 7.0, 9.0, 11.0];
        let fit = linear_fit(&xs, &ys).unwrap();

        assert!(nearly_equal(fit.slope, 2.0));
        assert!(nearly_equal(fit.intercept, 3.0));
        assert!(nearly_equal(fit.r_squared, 1.0));
    }

    #[test]
    fn noise_lowers_the_goodness_of_fit() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        let ys = [5.0, 8.0, 8.5, 12.0];
        let fit = linear_fit(&xs, &ys).unwrap();
        assert!(fit.r_squared < 1.0);
    }

    #[test]
    fn rejects_degenerate_series() {
        assert!(linear_fit(&[1.0], &[2.0]).is_none());
        assert!(linear_fit(&[3.0, 3.0, 3.0], &[1.0, 2.0, 3.0]).is_none());
    }

    #[test]
    fn a_flat_y_is_not_a_linear_model() {
        assert!(linear_fit(&[1.0, 2.0, 3.0, 4.0], &[7.0, 7.0, 7.0, 7.0]).is_none());
    }

    #[test]
    fn finds_constant_products() {
        let xs = [2.0, 4.0, 8.0];
        let ys = [12.0, 6.0, 3.0];
        assert!(nearly_equal(constant_product(&xs, &ys).unwrap(), 24.0));

        let broken = [12.0, 6.0, 4.0];
        assert!(constant_product(&xs, &broken).is_none());
    }
}
