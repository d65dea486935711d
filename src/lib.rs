//! Stampede: a key-addressed async cache with request coalescing.
//!
//! The engine lives in [`cache`]; [`application`], [`config`] and [`infra`]
//! make up the command-line host that drives it.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
