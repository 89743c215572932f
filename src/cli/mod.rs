//! Command-line interface for neuropipe.
//!
//! Provides commands to run one session or a batch, inspect recorded task
//! state and preview a session's classification and task graph.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
