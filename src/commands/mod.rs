//! # CLI Command Implementations
//!
//! Each subcommand of the `ci-replay` tool lives in its own file and exposes
//! an `Args` struct derived with `clap` plus an `execute` function that
//! orchestrates the library's engine.

pub mod run;
