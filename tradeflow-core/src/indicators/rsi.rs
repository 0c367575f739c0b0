//! Relative Strength Index.
//!
//! Gains and losses over the last `period` price changes are averaged with
//! Wilder smoothing. The smoothing used here is the simple-mean form rather
//! than the textbook recursive average; the two converge but differ on
//! short windows. See DESIGN.md for the rationale behind keeping this form.

/// Wilder smoothing, simple-mean form: the arithmetic mean of the first
/// `period` values (or of all values when fewer are available). Returns 0
/// on empty input.
pub fn wilder_smoothing(values: &[f64], period: usize) -> f64 {
    if values.is_empty() || period == 0 {
        return 0.0;
    }
    let count = period.min(values.len());
    values[..count].iter().sum::<f64>() / count as f64
}

/// RSI over the last `period` + 1 closes. Returns the neutral sentinel
/// `50.0` when the series is too short, and `100.0` when the window has no
/// losses.
pub fn rsi(values: &[f64], period: usize) -> f64 {
    if period == 0 || values.len() < period + 1 {
        return 50.0;
    }

    let mut gains = Vec::with_capacity(period);
    let mut losses = Vec::with_capacity(period);
    for i in values.len() - period..values.len() {
        let change = values[i] - values[i - 1];
        gains.push(change.max(0.0));
        losses.push((-change).max(0.0));
    }

    let avg_gain = wilder_smoothing(&gains, period);
    let avg_loss = wilder_smoothing(&losses, period);

    if avg_loss == 0.0 {
        return 100.0;
    }

    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{assert_approx, DEFAULT_EPSILON};

    #[test]
    fn sentinel_when_short() {
        assert_eq!(rsi(&[100.0, 101.0], 14), 50.0);
    }

    #[test]
    fn all_gains_returns_100() {
        let values: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        assert_eq!(rsi(&values, 14), 100.0);
    }

    #[test]
    fn all_losses_returns_0() {
        let values: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        assert_approx(rsi(&values, 14), 0.0, DEFAULT_EPSILON);
    }

    #[test]
    fn balanced_gains_and_losses_near_50() {
        // Alternating +1/-1: avg_gain == avg_loss.
        let mut values = vec![100.0];
        for i in 0..20 {
            let last = *values.last().unwrap();
            values.push(if i % 2 == 0 { last + 1.0 } else { last - 1.0 });
        }
        assert_approx(rsi(&values, 14), 50.0, 1e-6);
    }

    #[test]
    fn known_window() {
        // period 2 over closes [.., 10, 12, 11]: changes +2, -1.
        // avg_gain = 1.0, avg_loss = 0.5, rs = 2, rsi = 100 - 100/3.
        let values = [10.0, 12.0, 11.0];
        assert_approx(rsi(&values, 2), 100.0 - 100.0 / 3.0, DEFAULT_EPSILON);
    }

    #[test]
    fn wilder_smoothing_means_prefix() {
        assert_approx(wilder_smoothing(&[1.0, 2.0, 3.0, 4.0], 2), 1.5, DEFAULT_EPSILON);
        assert_approx(wilder_smoothing(&[1.0, 2.0], 4), 1.5, DEFAULT_EPSILON);
        assert_eq!(wilder_smoothing(&[], 3), 0.0);
    }
}
