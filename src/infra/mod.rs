//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod output;
pub mod telemetry;
