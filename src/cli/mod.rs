//! Command handlers for the `overlay` binary

pub mod commands;

pub use commands::*;
