//! `folio session`: inspect stored workflow sessions.

use anyhow::{Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use folio_core::repository::workflow::WorkflowRepository;
use folio_types::workflow::{SessionStatus, UnitStatus, WorkflowState};

use crate::state::AppState;

fn status_color(status: SessionStatus) -> Color {
    match status {
        SessionStatus::Active => Color::Green,
        SessionStatus::Completed => Color::Cyan,
        SessionStatus::Paused => Color::Yellow,
        SessionStatus::Failed => Color::Red,
    }
}

/// List recent sessions, most recently updated first.
pub async fn list_sessions(state: &AppState, limit: i64, json: bool) -> Result<()> {
    let sessions = state.repo.list_sessions(Some(limit)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!();
        println!("  No sessions yet.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Session").fg(Color::White),
        Cell::new("Stage").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Progress").fg(Color::White),
        Cell::new("Updated").fg(Color::White),
    ]);

    for session in &sessions {
        table.add_row(vec![
            Cell::new(&session.session_id).fg(Color::Cyan),
            Cell::new(session.current_stage),
            Cell::new(session.status).fg(status_color(session.status)),
            Cell::new(format!("{}%", session.overall_progress)),
            Cell::new(session.updated_at.format("%Y-%m-%d %H:%M:%S")).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

/// Show the stored state of one session along with its unit results.
pub async fn show_session(state: &AppState, session_id: &str, json: bool) -> Result<()> {
    let mut session = state
        .repo
        .get_session(session_id)
        .await?
        .with_context(|| format!("Session '{session_id}' not found"))?;

    // Unit rows are written as units finish, so they can be ahead of the session row.
    let stored_units = state.repo.list_unit_results(session_id).await?;
    for unit in stored_units {
        if session.unit(unit.unit_number).is_none_or(|u| !u.is_completed()) {
            session.record_unit(unit);
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&session)?);
        return Ok(());
    }

    println!();
    println!("  Session '{}'", style(&session.session_id).cyan());
    print_state(&session);
    Ok(())
}

/// Styled summary of a workflow state, shared with `folio recover`.
pub fn print_state(state: &WorkflowState) {
    println!();
    println!("  Stage:    {}", style(state.current_stage).bold());
    let status = match state.status {
        SessionStatus::Active | SessionStatus::Completed => style(state.status.to_string()).green(),
        SessionStatus::Paused => style(state.status.to_string()).yellow(),
        SessionStatus::Failed => style(state.status.to_string()).red(),
    };
    println!("  Status:   {status}");
    println!(
        "  Progress: {}% overall, {}% of stage",
        state.progress.overall_progress, state.progress.current_stage_progress
    );
    if state.progress.total_units > 0 {
        println!(
            "  Units:    {}/{} completed",
            state.progress.units_completed, state.progress.total_units
        );
    }
    if state.retry_count > 0 {
        println!("  Retries:  {}", state.retry_count);
    }
    if let Some(error) = &state.error {
        println!("  Error:    {}", style(error).red());
        if state.needs_retry {
            println!("  {}", style("Stage can be retried.").dim());
        }
    }
    println!();

    if state.units.is_empty() {
        return;
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Unit").fg(Color::White),
        Cell::new("Title").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Words").fg(Color::White),
        Cell::new("Attempts").fg(Color::White),
        Cell::new("Error").fg(Color::White),
    ]);

    for unit in &state.units {
        let status_cell = match unit.status {
            UnitStatus::Completed => Cell::new("completed").fg(Color::Green),
            UnitStatus::Failed => Cell::new("failed").fg(Color::Red),
        };
        table.add_row(vec![
            Cell::new(unit.unit_number).fg(Color::Cyan),
            Cell::new(super::truncate(&unit.title, 40)),
            status_cell,
            Cell::new(unit.word_count),
            Cell::new(unit.attempts),
            Cell::new(super::truncate(unit.error.as_deref().unwrap_or(""), 60)).fg(Color::DarkGrey),
        ]);
    }

    println!("{table}");
    println!();
}
