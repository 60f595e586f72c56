//! `folio plan`: validate an outline file and show its execution layers.

use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use serde::Deserialize;

use folio_core::workflow::planner::build_execution_plan;
use folio_types::workflow::WorkUnit;

/// Outline files hold either a bare unit list or `{ units: [...] }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum OutlineFile {
    Units(Vec<WorkUnit>),
    Wrapped { units: Vec<WorkUnit> },
}

impl OutlineFile {
    fn into_units(self) -> Vec<WorkUnit> {
        match self {
            OutlineFile::Units(units) | OutlineFile::Wrapped { units } => units,
        }
    }
}

/// Parse an outline, picking the format from the file extension.
///
/// Anything other than `.json` is read as YAML (a superset of JSON).
pub fn parse_outline(path: &Path, content: &str) -> Result<Vec<WorkUnit>> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let outline: OutlineFile = if is_json {
        serde_json::from_str(content)
            .with_context(|| format!("Failed to parse JSON outline {}", path.display()))?
    } else {
        serde_yaml_ng::from_str(content)
            .with_context(|| format!("Failed to parse YAML outline {}", path.display()))?
    };
    Ok(outline.into_units())
}

/// Print the execution plan for the outline at `file`.
pub async fn show_plan(file: &Path, json: bool) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let units = parse_outline(file, &content)?;
    let plan = build_execution_plan(&units)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} units in {} layers (parallelism {})",
        style("*").green().bold(),
        style(plan.total_units).bold(),
        plan.layers.len(),
        plan.parallelism_factor,
    );
    println!(
        "  Estimated duration: {}s",
        plan.estimated_total_duration().as_secs()
    );
    println!();

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Layer").fg(Color::White),
        Cell::new("Unit").fg(Color::White),
        Cell::new("Title").fg(Color::White),
        Cell::new("Depends On").fg(Color::White),
        Cell::new("Size").fg(Color::White),
    ]);

    for (index, layer) in plan.layers.iter().enumerate() {
        for unit_number in layer {
            let Some(unit) = units.iter().find(|u| u.unit_number == *unit_number) else {
                continue;
            };
            let deps = if unit.dependencies.is_empty() {
                "-".to_string()
            } else {
                unit.dependencies
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            table.add_row(vec![
                Cell::new(index + 1).fg(Color::DarkGrey),
                Cell::new(unit.unit_number).fg(Color::Cyan),
                Cell::new(super::truncate(&unit.title, 48)),
                Cell::new(deps).fg(Color::DarkGrey),
                Cell::new(unit.estimated_size),
            ]);
        }
    }

    println!("{table}");
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parses_bare_json_list() {
        let content = r#"[
            {"unit_number": 1, "title": "Intro"},
            {"unit_number": 2, "title": "Body", "dependencies": [1], "estimated_size": 900}
        ]"#;
        let units = parse_outline(&PathBuf::from("outline.json"), content).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].dependencies, vec![1]);
        assert_eq!(units[1].estimated_size, 900);
    }

    #[test]
    fn parses_wrapped_yaml() {
        let content = "units:\n  - unit_number: 1\n    title: Intro\n  - unit_number: 2\n    dependencies: [1]\n";
        let units = parse_outline(&PathBuf::from("outline.yaml"), content).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].title, "Intro");
        assert!(units[1].title.is_empty());
    }

    #[test]
    fn malformed_json_reports_path() {
        let err = parse_outline(&PathBuf::from("broken.json"), "{not json").unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }

    #[tokio::test]
    async fn show_plan_rejects_cyclic_outline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cycle.json");
        tokio::fs::write(
            &path,
            r#"[{"unit_number": 1, "dependencies": [2]}, {"unit_number": 2, "dependencies": [1]}]"#,
        )
        .await
        .unwrap();

        assert!(show_plan(&path, true).await.is_err());
    }

    #[tokio::test]
    async fn show_plan_accepts_valid_outline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outline.yml");
        tokio::fs::write(&path, "- unit_number: 1\n- unit_number: 2\n  dependencies: [1]\n")
            .await
            .unwrap();

        show_plan(&path, true).await.unwrap();
    }
}
