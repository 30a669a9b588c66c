//! CLI subcommand implementations.

pub mod digest;
pub mod fetch;
