//! CLI-related shared utilities.
//!
//! Centralizes CLI policy (currently just color handling) so entry points
//! don't duplicate behavior.

mod color;

pub use color::ColorWhen;
