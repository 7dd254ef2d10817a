//! Command-line argument parsing.
//!
//! Defines the CLI structure using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// lectern: classify exam questions to the lectures that teach them.
///
/// A hybrid lexical+dense retrieval engine over chunked lecture notes with a
/// rule gate, an LLM judge, and persisted batch jobs.
#[derive(Parser, Debug)]
#[command(name = "lectern")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the lectern database file.
    ///
    /// Defaults to `.lectern/lectern.db` in the current directory.
    #[arg(short, long, env = "LECTERN_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Scope filter flags shared by classify and batch commands.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ScopeArgs {
    /// Restrict retrieval to one block.
    #[arg(long)]
    pub block: Option<i64>,

    /// Restrict retrieval to one folder subtree.
    #[arg(long)]
    pub folder: Option<i64>,

    /// Explicit lecture ids (comma-separated); wins over block/folder.
    #[arg(long, value_delimiter = ',')]
    pub lectures: Option<Vec<i64>>,

    /// Do not descend into child folders.
    #[arg(long)]
    pub no_descendants: bool,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize the lectern database.
    ///
    /// Creates the database file and schema if they don't exist.
    Init,

    /// Show storage statistics.
    Status,

    /// Build passage embeddings for every chunk with the configured model.
    ///
    /// Only the in-process `hashing-*` model family can be built here;
    /// sentence-encoder vectors come from the ingestion tooling.
    EmbedPassages,

    /// Classify one question and print the decision.
    Classify {
        /// Question id.
        question_id: i64,

        /// Scope filter.
        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Start a batch classification job.
    Batch {
        /// Question ids (comma-separated).
        #[arg(value_delimiter = ',')]
        question_ids: Vec<i64>,

        /// Scope filter.
        #[command(flatten)]
        scope: ScopeArgs,

        /// Block until the job reaches a terminal state.
        #[arg(long)]
        wait: bool,
    },

    /// Show a job's state and progress.
    #[command(name = "job-status")]
    JobStatus {
        /// Job id.
        job_id: i64,
    },

    /// List recent jobs.
    Jobs {
        /// Maximum number of jobs to list.
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },

    /// Apply a completed job's results to questions.
    Apply {
        /// Job id.
        job_id: i64,

        /// Question ids (comma-separated).
        #[arg(value_delimiter = ',')]
        question_ids: Vec<i64>,

        /// Apply mode (all, only_unclassified, only_changes).
        #[arg(long, default_value = "all")]
        mode: String,
    },

    /// Invalidate the cached HyDE artifact for a question.
    #[command(name = "hyde-invalidate")]
    HydeInvalidate {
        /// Question id.
        question_id: i64,

        /// Prompt version to invalidate (defaults to the configured one).
        #[arg(long)]
        prompt_version: Option<String>,
    },
}

impl Cli {
    /// Returns the database path, using the default if not specified.
    #[must_use]
    pub fn get_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(crate::storage::DEFAULT_DB_PATH))
    }
}

impl ScopeArgs {
    /// Converts the flags to a request scope.
    #[must_use]
    pub fn to_request_meta(&self) -> crate::core::RequestMeta {
        crate::core::RequestMeta {
            block_id: self.block,
            folder_id: self.folder,
            lecture_ids: self.lectures.clone(),
            include_descendants: !self.no_descendants,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parse() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_db_path() {
        let cli = Cli {
            db_path: None,
            verbose: false,
            command: Commands::Status,
        };
        assert_eq!(
            cli.get_db_path(),
            PathBuf::from(crate::storage::DEFAULT_DB_PATH)
        );
    }

    #[test]
    fn test_scope_args_to_meta() {
        let scope = ScopeArgs {
            block: Some(3),
            folder: Some(11),
            lectures: None,
            no_descendants: false,
        };
        let meta = scope.to_request_meta();
        assert_eq!(meta.block_id, Some(3));
        assert_eq!(meta.folder_id, Some(11));
        assert!(meta.include_descendants);
    }

    #[test]
    fn test_batch_id_list_parsing() {
        let cli = Cli::try_parse_from(["lectern", "batch", "1,2,3", "--wait"]).unwrap();
        match cli.command {
            Commands::Batch {
                question_ids, wait, ..
            } => {
                assert_eq!(question_ids, vec![1, 2, 3]);
                assert!(wait);
            }
            _ => panic!("expected batch command"),
        }
    }
}
