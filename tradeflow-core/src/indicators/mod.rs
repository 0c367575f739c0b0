//! Pure indicator kernels.
//!
//! Stateless functions over an ordered value sequence. Each kernel fails
//! silently by returning a neutral sentinel when the input is too short
//! (50 for RSI, 0 otherwise); strategies hold the rolling state and decide
//! when enough data has accumulated.

pub mod ema;
pub mod rsi;
pub mod slope;
pub mod sma;

pub use ema::ema;
pub use rsi::{rsi, wilder_smoothing};
pub use slope::linreg_slope;
pub use sma::sma;

/// Assert two f64 values are approximately equal (within epsilon).
#[cfg(test)]
pub fn assert_approx(actual: f64, expected: f64, epsilon: f64) {
    assert!(
        (actual - expected).abs() < epsilon,
        "assert_approx failed: actual={actual}, expected={expected}, diff={}, epsilon={epsilon}",
        (actual - expected).abs()
    );
}

/// Default epsilon for kernel tests.
#[cfg(test)]
pub const DEFAULT_EPSILON: f64 = 1e-9;
