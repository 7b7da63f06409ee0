//! CLI command definitions for the `skillforge` binary.
//!
//! Uses clap derive macros for argument parsing. Skill management lives under
//! `skillforge skill ...`; execution control is top-level
//! (`skillforge run`, `skillforge input`, `skillforge rollback`).

pub mod execution;
pub mod intent;
pub mod skill;
pub mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run declarative business skills from free text.
#[derive(Parser)]
#[command(name = "skillforge", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true, env = "SKILLFORGE_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage skills (load, list, show, activate, deprecate, remove, stats).
    Skill {
        #[command(subcommand)]
        action: skill::SkillCommand,
    },

    /// Rank active skills against free text.
    Match {
        /// The user's request, e.g. "create a quote for Acme".
        text: String,

        /// Only consider skills of this category.
        #[arg(long)]
        category: Option<String>,

        /// Minimum score (0.0 - 1.0); defaults to `match_threshold` in config.toml.
        #[arg(long)]
        threshold: Option<f64>,

        /// Maximum number of matches.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Start an execution and answer its prompts interactively.
    Run {
        /// Skill technical name or UUID. Omit to pick the best match for --text.
        skill: Option<String>,

        /// Free text that triggered the run; parameters are extracted from it.
        #[arg(long)]
        text: Option<String>,

        /// Initial parameter as key=value (value parsed as JSON when possible).
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,

        /// Run inside one workspace transaction so savepoint rollback applies.
        #[arg(long)]
        transaction: bool,

        /// Return as soon as the execution waits for input.
        #[arg(long)]
        no_interactive: bool,
    },

    /// Answer the pending prompt of a waiting execution.
    Input {
        /// Execution UUID.
        execution_id: String,

        /// The answer (parsed as JSON when possible).
        value: String,
    },

    /// Cancel a pending, running or waiting execution.
    Cancel {
        /// Execution UUID.
        execution_id: String,

        /// Reason recorded on the execution.
        #[arg(long)]
        reason: Option<String>,
    },

    /// Roll back the business changes of an execution.
    Rollback {
        /// Execution UUID.
        execution_id: String,
    },

    /// Discard the rollback point of a finished execution.
    Release {
        /// Execution UUID.
        execution_id: String,
    },

    /// Show one execution, or a dashboard of recent activity.
    Status {
        /// Execution UUID.
        execution_id: Option<String>,

        /// Number of recent executions in the dashboard.
        #[arg(long, default_value = "10")]
        recent: u32,
    },

    /// Start the REST API server.
    Serve {
        /// Port to listen on.
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Load skills from this directory before serving.
        #[arg(long)]
        skills: Option<PathBuf>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_inputs() {
        let cli = Cli::try_parse_from([
            "skillforge",
            "run",
            "create_sales_quote",
            "-i",
            "partner=Acme",
            "--input",
            "amount=12",
            "--transaction",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                skill,
                inputs,
                transaction,
                ..
            } => {
                assert_eq!(skill.as_deref(), Some("create_sales_quote"));
                assert_eq!(inputs, vec!["partner=Acme", "amount=12"]);
                assert!(transaction);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["skillforge", "match", "new quote", "-vv", "--json"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.json);
    }
}
