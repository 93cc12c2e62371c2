//! Shared foundation for the forgecache build cache
//!
//! This crate holds the pieces every other forgecache crate depends on:
//! - The content-addressed [`Digest`] model and instance-name validation
//! - The error taxonomy shared across the storage, cache, and RPC layers
//! - The frozen, environment-sourced [`Config`] record
//! - The process-wide [`MetricsCollector`]
//!
//! Nothing in this crate performs I/O beyond reading the environment at
//! startup; transport and storage concerns live in the downstream crates.

mod config;
mod digest;
mod error;
pub mod metrics;

pub use config::Config;
pub use digest::{validate_instance, Digest};
pub use error::{Error, Result};
pub use metrics::MetricsCollector;
