//! Traffic analysis: RTT estimation from TCP timestamp options.

pub mod rtt;

pub use rtt::{correlate, Correlation, RttEstimator, SmoothingMode};
