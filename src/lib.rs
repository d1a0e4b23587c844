//! tcprtt library crate: re-exports modules for the binary, benchmarks and
//! tests.

pub mod analysis;
pub mod capture;
pub mod config;
pub mod display;
pub mod flow;
pub mod metrics;
pub mod pipeline;
pub mod protocol;
