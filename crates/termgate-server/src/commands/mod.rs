//! CLI subcommand implementations.

pub mod audit;
pub mod probe;
