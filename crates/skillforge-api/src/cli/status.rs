//! System status dashboard command.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use skillforge_core::repository::execution::ExecutionFilter;
use skillforge_types::execution::ExecutionState;
use skillforge_types::skill::SkillState;

use crate::state::AppState;

/// Display the status dashboard: skills by state and the most recent executions.
pub async fn status(state: &AppState, recent: u32, json: bool) -> Result<()> {
    let skills = state.skill_service.list_skills(None).await?;
    let count = |s: SkillState| skills.iter().filter(|k| k.state == s).count();
    let (active, draft, deprecated) = (
        count(SkillState::Active),
        count(SkillState::Draft),
        count(SkillState::Deprecated),
    );

    let filter = ExecutionFilter {
        limit: Some(recent),
        ..ExecutionFilter::default()
    };
    let executions = state.skill_service.list_executions(&filter).await?;
    let waiting = executions
        .iter()
        .filter(|e| e.state == ExecutionState::WaitingInput)
        .count();

    if json {
        let status = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "data_dir": state.data_dir.display().to_string(),
            "snapshots_enabled": state.config.snapshot.enabled,
            "skills": {
                "total": skills.len(),
                "active": active,
                "draft": draft,
                "deprecated": deprecated,
            },
            "recent_executions": executions,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} SkillForge v{}",
        style("⚡").bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!();

    println!("  {}", style("── Skills ──").dim());
    println!("  Total:      {}", style(skills.len()).bold());
    println!("  Active:     {}", style(active).green());
    if draft > 0 {
        println!("  Draft:      {}", style(draft).yellow());
    }
    if deprecated > 0 {
        println!("  Deprecated: {}", style(deprecated).dim());
    }
    println!();

    println!("  {}", style("── Storage ──").dim());
    println!("  Data dir:  {}", state.data_dir.display());
    println!(
        "  Rollback:  {}",
        if state.config.snapshot.enabled { "snapshots + savepoints" } else { "savepoints" }
    );
    println!();

    if executions.is_empty() {
        println!("  No executions yet.");
        println!();
        return Ok(());
    }

    println!("  {}", style("── Recent executions ──").dim());
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Id"),
            Cell::new("Skill").fg(Color::Cyan),
            Cell::new("State"),
            Cell::new("Steps"),
            Cell::new("Started"),
        ]);
    for e in &executions {
        let color = match e.state {
            ExecutionState::Completed => Color::Green,
            ExecutionState::Failed => Color::Red,
            ExecutionState::WaitingInput => Color::Yellow,
            _ => Color::Reset,
        };
        table.add_row(vec![
            Cell::new(e.id),
            Cell::new(&e.skill_name),
            Cell::new(e.state.to_string()).fg(color),
            Cell::new(e.steps_completed),
            Cell::new(e.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }
    println!("{table}");
    if waiting > 0 {
        println!(
            "  {} execution(s) waiting for input; see {}",
            style(waiting).yellow(),
            style("skillforge status <id>").yellow()
        );
    }
    println!();
    Ok(())
}
