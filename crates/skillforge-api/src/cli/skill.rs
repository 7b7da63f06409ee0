//! CLI skill management subcommands.
//!
//! Provides load, list, show, activate, deprecate, remove and stats for
//! skills registered in the engine database.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use dialoguer::Confirm;

use skillforge_core::skill::CompiledSkill;
use skillforge_types::skill::{Skill, SkillState};

use crate::state::AppState;

/// Skill management subcommands.
#[derive(Subcommand)]
pub enum SkillCommand {
    /// Register skills from a YAML file or a directory (searched recursively).
    Load {
        /// Path to a `.yaml` file or a directory of skill files.
        path: PathBuf,

        /// Activate the loaded skills right away.
        #[arg(long)]
        activate: bool,
    },

    /// List registered skills.
    #[command(alias = "ls")]
    List {
        /// Filter by state (draft, active, deprecated).
        #[arg(long)]
        state: Option<String>,
    },

    /// Show a skill's definition: triggers, parameters and steps.
    Show {
        /// Technical name or UUID.
        name: String,
    },

    /// Make a skill executable and eligible for intent matching.
    Activate {
        /// Technical name.
        name: String,
    },

    /// Withdraw a skill from intent matching.
    Deprecate {
        /// Technical name.
        name: String,
    },

    /// Remove a skill that no other skill references.
    #[command(alias = "rm")]
    Remove {
        /// Technical name.
        name: String,

        /// Skip the confirmation prompt.
        #[arg(long)]
        force: bool,
    },

    /// Execution statistics of a skill.
    Stats {
        /// Technical name.
        name: String,
    },
}

/// Dispatch a skill subcommand.
pub async fn handle_skill_command(cmd: SkillCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        SkillCommand::Load { path, activate } => load_skills(state, &path, activate, json).await,
        SkillCommand::List { state: filter } => list_skills(state, filter.as_deref(), json).await,
        SkillCommand::Show { name } => show_skill(state, &name, json).await,
        SkillCommand::Activate { name } => set_state(state, &name, SkillState::Active, json).await,
        SkillCommand::Deprecate { name } => {
            set_state(state, &name, SkillState::Deprecated, json).await
        }
        SkillCommand::Remove { name, force } => remove_skill(state, &name, force, json).await,
        SkillCommand::Stats { name } => skill_stats(state, &name, json).await,
    }
}

/// Register skills from `path`. Shared with `serve --skills`.
pub async fn load_path(state: &AppState, path: &Path) -> Result<Vec<std::sync::Arc<CompiledSkill>>> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;

    if metadata.is_dir() {
        Ok(state.skill_service.load_directory(path).await?)
    } else {
        let yaml = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        let skill = state
            .skill_service
            .register_yaml(&yaml)
            .await
            .with_context(|| format!("invalid skill file {}", path.display()))?;
        Ok(vec![skill])
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

async fn load_skills(state: &AppState, path: &Path, activate: bool, json: bool) -> Result<()> {
    let loaded = load_path(state, path).await?;

    let mut names = Vec::with_capacity(loaded.len());
    for skill in &loaded {
        if activate {
            state.skill_service.activate(skill.technical_name()).await?;
        }
        names.push(skill.technical_name().to_string());
    }

    if json {
        let out = serde_json::json!({ "loaded": names, "activated": activate });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    if names.is_empty() {
        println!("  No skill files found under {}.", path.display());
    } else {
        for name in &names {
            println!("  {} {}", style("✓").green(), style(name).cyan());
        }
        println!();
        let verb = if activate { "Loaded and activated" } else { "Loaded" };
        println!("  {verb} {} skill(s).", names.len());
        if !activate {
            println!(
                "  New skills start as drafts; run {} to enable them.",
                style("skillforge skill activate <name>").yellow()
            );
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

fn state_color(state: SkillState) -> Color {
    match state {
        SkillState::Active => Color::Green,
        SkillState::Draft => Color::Yellow,
        SkillState::Deprecated => Color::DarkGrey,
    }
}

async fn list_skills(state: &AppState, filter: Option<&str>, json: bool) -> Result<()> {
    let filter = match filter {
        Some(s) => Some(s.parse::<SkillState>().map_err(anyhow::Error::msg)?),
        None => None,
    };
    let skills = state.skill_service.list_skills(filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&skills)?);
        return Ok(());
    }

    if skills.is_empty() {
        println!();
        println!("  No skills registered. Use 'skillforge skill load <path>' to add skills.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Technical name").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Version"),
            Cell::new("Category"),
            Cell::new("State"),
            Cell::new("Steps"),
        ]);

    for skill in &skills {
        table.add_row(vec![
            Cell::new(&skill.technical_name),
            Cell::new(&skill.name),
            Cell::new(&skill.version),
            Cell::new(skill.category.as_deref().unwrap_or("-")),
            Cell::new(skill.state.to_string()).fg(state_color(skill.state)),
            Cell::new(skill.steps.len()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

async fn show_skill(state: &AppState, name: &str, json: bool) -> Result<()> {
    let compiled = state.skill_service.get_skill(name).await?;
    let skill: &Skill = compiled.skill();

    if json {
        println!("{}", serde_json::to_string_pretty(skill)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} {}",
        style(&skill.name).bold(),
        style(format!("({})", skill.technical_name)).dim(),
        style(format!("v{}", skill.version)).dim()
    );
    if let Some(description) = &skill.description {
        println!("  {description}");
    }
    println!();
    println!("  State:    {}", skill.state);
    println!("  Category: {}", skill.category.as_deref().unwrap_or("-"));
    println!("  Sequence: {}", skill.sequence);
    println!(
        "  Rollback: {}",
        if skill.wants_rollback_point() { "on failure" } else { "none" }
    );

    if !skill.trigger_phrases.is_empty() {
        println!();
        println!("  {}", style("── Triggers ──").dim());
        for phrase in &skill.trigger_phrases {
            println!("  \"{phrase}\"");
        }
    }

    println!();
    println!("  {}", style("── Steps ──").dim());
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Seq"),
            Cell::new("Id").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Output"),
            Cell::new("Critical"),
            Cell::new("Retries"),
        ]);
    for step in &skill.steps {
        table.add_row(vec![
            Cell::new(step.sequence),
            Cell::new(&step.id),
            Cell::new(step.step_type().to_string()),
            Cell::new(step.output_variable.as_deref().unwrap_or("-")),
            Cell::new(if step.is_critical { "yes" } else { "no" }),
            Cell::new(step.retry_count),
        ]);
    }
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// State changes
// ---------------------------------------------------------------------------

async fn set_state(state: &AppState, name: &str, target: SkillState, json: bool) -> Result<()> {
    let skill = match target {
        SkillState::Active => state.skill_service.activate(name).await?,
        SkillState::Deprecated => state.skill_service.deprecate(name).await?,
        SkillState::Draft => bail!("skills cannot be moved back to draft"),
    };

    if json {
        let out = serde_json::json!({
            "technical_name": skill.technical_name(),
            "state": skill.skill().state,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} {} is now {}",
            style("✓").green(),
            style(skill.technical_name()).cyan(),
            style(skill.skill().state).bold()
        );
        println!();
    }
    Ok(())
}

async fn remove_skill(state: &AppState, name: &str, force: bool, json: bool) -> Result<()> {
    if !force && !json {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Remove skill '{}' and its statistics?",
                style(name).red().bold()
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("  Cancelled.");
            return Ok(());
        }
    }

    let removed = state.skill_service.remove_skill(name).await?;
    if json {
        let out = serde_json::json!({ "technical_name": name, "removed": removed });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if removed {
        println!("  {} Removed {}", style("✓").green(), style(name).cyan());
    } else {
        println!("  Skill '{name}' was not registered.");
    }
    Ok(())
}

async fn skill_stats(state: &AppState, name: &str, json: bool) -> Result<()> {
    let stats = state.skill_service.skill_stats(name).await?;

    if json {
        let out = serde_json::json!({
            "technical_name": name,
            "execution_count": stats.execution_count,
            "success_count": stats.success_count,
            "failure_count": stats.failure_count,
            "success_rate": stats.success_rate(),
            "avg_duration_ms": stats.avg_duration_ms,
            "last_executed_at": stats.last_executed_at,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  {}", style(name).bold());
    println!("  Executions:   {}", stats.execution_count);
    println!("  Succeeded:    {}", style(stats.success_count).green());
    println!("  Failed:       {}", style(stats.failure_count).red());
    println!("  Success rate: {:.0}%", stats.success_rate() * 100.0);
    println!("  Avg duration: {:.0} ms", stats.avg_duration_ms);
    if let Some(at) = stats.last_executed_at {
        println!("  Last run:     {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!();
    Ok(())
}
