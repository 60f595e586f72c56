//! CLI command definitions for the `folio` binary.
//!
//! Uses clap derive macros for argument parsing. Every command reads from the
//! local data directory; none of them drive an LLM.

pub mod checkpoint;
pub mod config;
pub mod plan;
pub mod session;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Inspect and recover Folio workflow sessions.
#[derive(Parser)]
#[command(name = "folio", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Write logs to stderr as newline-delimited JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Also export spans as OpenTelemetry JSON on stdout (debugging aid).
    #[arg(long, global = true, hide = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate an outline file and print its layered execution plan.
    Plan {
        /// Outline in JSON or YAML (`.json`, `.yaml`, `.yml`).
        file: PathBuf,
    },

    /// List the checkpoint history of a session.
    #[command(alias = "cp")]
    Checkpoints {
        /// Session ID.
        session: String,
    },

    /// Rebuild a session's state from its latest checkpoint.
    Recover {
        /// Session ID.
        session: String,
    },

    /// Show one session, or list recent sessions when no ID is given.
    Session {
        /// Session ID (omit to list).
        session: Option<String>,

        /// Maximum number of sessions to list.
        #[arg(long, default_value = "20")]
        limit: i64,
    },

    /// Show the effective engine configuration.
    Config,

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

/// Log filter directive for the given verbosity flags.
pub fn filter_directive(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "warn",
        1 => "info,folio_core=debug,folio_infra=debug",
        _ => "trace",
    }
}

/// Shorten `text` to at most `max` characters, appending `...` when cut.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["folio", "session", "s1", "--json", "-vv"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Session { session, limit } => {
                assert_eq!(session.as_deref(), Some("s1"));
                assert_eq!(limit, 20);
            }
            _ => panic!("expected session command"),
        }
    }

    #[test]
    fn verbosity_maps_to_filter() {
        assert_eq!(filter_directive(0, true), "error");
        assert_eq!(filter_directive(0, false), "warn");
        assert!(filter_directive(1, false).starts_with("info"));
        assert_eq!(filter_directive(3, false), "trace");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééééééé", 6), "ééé...");
    }
}
