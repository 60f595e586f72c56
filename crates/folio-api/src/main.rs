//! Folio CLI entry point.
//!
//! Binary name: `folio`
//!
//! Parses CLI arguments, sets up tracing, opens the local database and
//! dispatches to the matching command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use folio_observe::tracing_setup::{init_tracing, shutdown_tracing, TracingOptions};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = TracingOptions {
        otel: cli.otel,
        json: cli.log_json,
        default_directive: Some(cli::filter_directive(cli.verbose, cli.quiet).to_string()),
    };
    if let Err(e) = init_tracing(&options) {
        eprintln!("failed to initialize tracing: {e}");
    }

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Neither completions nor planning touch the data directory.
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "folio", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Plan { file } => return cli::plan::show_plan(file, cli.json).await,
        _ => {}
    }

    let state = AppState::init().await?;

    match cli.command {
        Commands::Checkpoints { session } => {
            cli::checkpoint::list_checkpoints(&state, &session, cli.json).await?;
        }
        Commands::Recover { session } => {
            cli::checkpoint::recover(&state, &session, cli.json).await?;
        }
        Commands::Session { session: Some(id), .. } => {
            cli::session::show_session(&state, &id, cli.json).await?;
        }
        Commands::Session { session: None, limit } => {
            cli::session::list_sessions(&state, limit, cli.json).await?;
        }
        Commands::Config => {
            cli::config::show_config(&state, cli.json).await?;
        }
        Commands::Completions { .. } | Commands::Plan { .. } => unreachable!("handled above"),
    }

    Ok(())
}
