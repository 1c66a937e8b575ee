//! Shared library for the opuscast server.
//!
//! This crate is the **public gateway** for shared functionality. Downstream
//! crates should import through `opuscast_common::*` exports and should not
//! drill into internal module structure.

mod cli;
mod observability;

pub use cli::ColorWhen;
pub use observability::{init_tracing, MetricsContext};
