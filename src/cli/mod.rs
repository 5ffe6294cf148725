//! Command line interface module
//!
//! Argument parsing and the runner that drives `push` and `pull` through the
//! transfer engine.

pub mod args;
pub mod runner;

pub use args::{Args, Command, TargetArgs};
pub use runner::Runner;
