//! `folio checkpoints` and `folio recover`.

use anyhow::{bail, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use folio_types::checkpoint::Checkpoint;

use crate::state::AppState;

/// Stage and progress recorded inside a checkpoint snapshot.
fn snapshot_summary(checkpoint: &Checkpoint) -> (String, String) {
    let snapshot = &checkpoint.state_snapshot;
    let stage = snapshot["current_stage"].as_str().unwrap_or("?").to_string();
    let progress = snapshot["progress"]["overall_progress"]
        .as_u64()
        .map(|p| format!("{p}%"))
        .unwrap_or_else(|| "-".to_string());
    (stage, progress)
}

/// List every checkpoint written for a session, oldest first.
pub async fn list_checkpoints(state: &AppState, session_id: &str, json: bool) -> Result<()> {
    let checkpoints = state.checkpoints.list_checkpoints(session_id).await?;

    if json {
        let rows: Vec<_> = checkpoints
            .iter()
            .map(|cp| {
                let (stage, _) = snapshot_summary(cp);
                serde_json::json!({
                    "node_name": cp.node_name,
                    "timestamp": cp.timestamp.to_rfc3339(),
                    "stage": stage,
                    "overall_progress": cp.state_snapshot["progress"]["overall_progress"],
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if checkpoints.is_empty() {
        println!();
        println!("  No checkpoints for session '{}'.", style(session_id).cyan());
        println!();
        return Ok(());
    }

    println!();
    println!(
        "  Checkpoints for '{}' ({} entries)",
        style(session_id).cyan(),
        checkpoints.len()
    );
    println!();

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("#").fg(Color::White),
        Cell::new("Node").fg(Color::White),
        Cell::new("Stage").fg(Color::White),
        Cell::new("Progress").fg(Color::White),
        Cell::new("Saved At").fg(Color::White),
    ]);

    for (index, cp) in checkpoints.iter().enumerate() {
        let (stage, progress) = snapshot_summary(cp);
        table.add_row(vec![
            Cell::new(index + 1).fg(Color::DarkGrey),
            Cell::new(&cp.node_name).fg(Color::Cyan),
            Cell::new(stage),
            Cell::new(progress),
            Cell::new(cp.timestamp.format("%Y-%m-%d %H:%M:%S%.3f")).fg(Color::DarkGrey),
        ]);
    }

    println!("{table}");
    println!();
    Ok(())
}

/// Rebuild a session from its latest checkpoint and print the result.
///
/// Read-only: nothing is persisted, so running it twice shows the same state.
pub async fn recover(state: &AppState, session_id: &str, json: bool) -> Result<()> {
    let Some(recovered) = state.checkpoints.recover_workflow(session_id).await? else {
        bail!("No checkpoint found for session '{session_id}'");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&recovered)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Recovered session '{}'",
        style("*").green().bold(),
        style(&recovered.session_id).cyan()
    );
    super::session::print_state(&recovered);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn checkpoint(snapshot: serde_json::Value) -> Checkpoint {
        Checkpoint {
            session_id: "s1".to_string(),
            node_name: "outline".to_string(),
            timestamp: Utc::now(),
            state_snapshot: snapshot,
        }
    }

    #[test]
    fn summary_reads_stage_and_progress() {
        let cp = checkpoint(json!({
            "current_stage": "unit_spawning",
            "progress": {"overall_progress": 30}
        }));
        assert_eq!(snapshot_summary(&cp), ("unit_spawning".to_string(), "30%".to_string()));
    }

    #[test]
    fn summary_tolerates_sparse_snapshot() {
        let cp = checkpoint(json!({}));
        assert_eq!(snapshot_summary(&cp), ("?".to_string(), "-".to_string()));
    }
}
