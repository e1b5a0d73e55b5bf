//! Command-line interface for nugs.
//!
//! This module owns argument parsing, alias normalization, dispatch, and
//! the `--json` output mode. The engine below it only ever sees typed
//! arguments and returns typed errors.

mod commands;
pub mod json_out;

pub use commands::{Cli, Commands, normalize_args, run_command};
