//! Subcommand implementations

pub mod candidate;
pub mod filter;
pub mod simulate;
