//! Command-line host services driving the cache engine.

pub mod capture;
pub mod error;
pub mod simulate;
pub mod workload;
