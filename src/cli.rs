//! clap-based command-line interface.
//!
//! Defines the [`Cli`] struct with the [`Command`] subcommands and global
//! flags (`--max-attempts`, `--verbose`).

use clap::{Parser, Subcommand};

/// jobrun — run external executables under timeout, retry and cancellation.
#[derive(Debug, Parser)]
#[command(name = "jobrun", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Maximum launch attempts per job, including the first.
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    /// Enable verbose output.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run an executable as a job and wait for its terminal status.
    Run {
        /// Path to the executable.
        program: String,

        /// Arguments passed verbatim to the executable.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Per-attempt timeout in seconds.
        #[arg(long, default_value_t = 60)]
        timeout: u64,

        /// Working directory for the child process.
        #[arg(long)]
        cwd: Option<String>,

        /// Environment overrides as KEY=VALUE pairs.
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// Do not capture the child's standard output.
        #[arg(long, default_value_t = false)]
        no_stdout: bool,

        /// Do not capture the child's standard error.
        #[arg(long, default_value_t = false)]
        no_stderr: bool,
    },
}

/// Split a `KEY=VALUE` argument into its parts.
pub fn parse_env_pair(pair: &str) -> Option<(String, String)> {
    pair.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
}
