//! Command handlers for the `switchd` binary

pub mod commands;

pub use commands::*;
