//! CLI layer for lectern.
//!
//! Provides the command-line interface using clap, with commands for
//! initializing storage, building embeddings, classifying questions,
//! driving batch jobs, and applying job results.

pub mod commands;
pub mod parser;

pub use commands::execute;
pub use parser::{Cli, Commands};
