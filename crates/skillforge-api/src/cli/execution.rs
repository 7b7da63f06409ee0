//! Execution control commands: run, input, cancel, rollback, release.
//!
//! `run` drives an execution to completion in the foreground, asking each
//! pending prompt with dialoguer. With `--transaction` the whole run happens
//! inside one workspace transaction: savepoint rollback points become
//! available, and the transaction commits only if the execution completes.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use dialoguer::{Confirm, Input, Select};
use serde_json::Value;
use uuid::Uuid;

use skillforge_core::engine::StartRequest;
use skillforge_infra::sqlite::SqliteTransactionHandle;
use skillforge_types::execution::{Execution, ExecutionState, OperationState, PendingInput};
use skillforge_types::skill::InputType;

use crate::state::AppState;

/// Arguments of `skillforge run`.
pub struct RunArgs {
    pub skill: Option<String>,
    pub text: Option<String>,
    pub inputs: Vec<String>,
    pub transaction: bool,
    pub interactive: bool,
}

/// Parse `key=value`; the value is JSON when it parses, otherwise a string.
pub fn parse_input_pair(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        bail!("empty parameter name in '{raw}'");
    }
    Ok((key.to_string(), parse_value(value)))
}

/// JSON when it parses, otherwise the raw string.
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse()
        .with_context(|| format!("'{raw}' is not an execution id"))
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn run(state: &AppState, args: RunArgs, json: bool) -> Result<()> {
    if args.transaction && !args.interactive {
        bail!("--transaction needs an interactive run: the transaction ends with this process");
    }

    let (skill, mut input_data) = resolve_target(state, &args).await?;
    for raw in &args.inputs {
        let (key, value) = parse_input_pair(raw)?;
        input_data.insert(key, value);
    }

    let transaction = if args.transaction {
        let tx = SqliteTransactionHandle::begin(&state.workspace)
            .await
            .context("failed to open workspace transaction")?;
        Some(Arc::new(tx))
    } else {
        None
    };
    let mut env = state.local_env();
    if let Some(tx) = &transaction {
        env = env.with_transaction(tx.clone());
    }

    let mut request = StartRequest::new(skill);
    request.input_data = input_data;
    if let Some(text) = &args.text {
        request = request.with_trigger_text(text.clone());
    }

    let mut execution = state.skill_service.start_execution(request, &env).await?;
    if !json {
        println!();
        println!(
            "  {} Started {} {}",
            style("▶").cyan(),
            style(&execution.skill_name).bold(),
            style(execution.id).dim()
        );
    }

    while args.interactive && execution.state == ExecutionState::WaitingInput {
        let Some(pending) = execution.pending_input.clone() else {
            break;
        };
        let value = ask(&pending)?;
        execution = state
            .skill_service
            .provide_input(execution.id, value, &env)
            .await?;
    }

    if let Some(tx) = transaction {
        if execution.state == ExecutionState::Completed {
            tx.commit().await?;
            tracing::debug!(execution_id = %execution.id, "workspace transaction committed");
        } else {
            tx.rollback().await?;
            if !json {
                println!(
                    "  {} Workspace transaction rolled back",
                    style("↺").yellow()
                );
            }
        }
    }

    render_execution(&execution, json)
}

/// Pick the skill and any parameters extracted from `--text`.
async fn resolve_target(
    state: &AppState,
    args: &RunArgs,
) -> Result<(String, HashMap<String, Value>)> {
    let Some(text) = &args.text else {
        let skill = args
            .skill
            .clone()
            .ok_or_else(|| anyhow!("give a skill name or --text to match one"))?;
        return Ok((skill, HashMap::new()));
    };

    // A named skill is looked up among all candidates, not just those above the threshold
    let threshold = if args.skill.is_some() { Some(0.0) } else { None };
    let matches = state
        .skill_service
        .match_intent(text, None, threshold, Some(usize::MAX))
        .await?;

    match &args.skill {
        Some(skill) => {
            let params = matches
                .into_iter()
                .find(|m| &m.skill_name == skill || m.skill_id.to_string() == *skill)
                .map(|m| m.parameters)
                .unwrap_or_default();
            Ok((skill.clone(), params))
        }
        None => {
            let best = matches
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("no active skill matches \"{text}\""))?;
            tracing::info!(skill = %best.skill_name, score = best.score, "matched skill from text");
            Ok((best.skill_name, best.parameters))
        }
    }
}

/// Ask one pending prompt on the terminal.
fn ask(pending: &PendingInput) -> Result<Value> {
    let prompt = format!("  {}", pending.prompt);
    let value = match pending.input_type {
        InputType::Selection if !pending.options.is_empty() => {
            let index = Select::new()
                .with_prompt(prompt)
                .items(&pending.options)
                .default(0)
                .interact()?;
            Value::String(pending.options[index].clone())
        }
        InputType::Boolean => Value::Bool(Confirm::new().with_prompt(prompt).interact()?),
        InputType::Json => {
            let raw: String = Input::new().with_prompt(prompt).interact_text()?;
            parse_value(&raw)
        }
        _ => {
            let raw: String = Input::new().with_prompt(prompt).interact_text()?;
            Value::String(raw)
        }
    };
    Ok(value)
}

// ---------------------------------------------------------------------------
// Input / cancel / rollback / release
// ---------------------------------------------------------------------------

pub async fn provide_input(state: &AppState, id: &str, raw: &str, json: bool) -> Result<()> {
    let id = parse_id(id)?;
    let execution = state
        .skill_service
        .provide_input(id, parse_value(raw), &state.local_env())
        .await?;
    render_execution(&execution, json)
}

pub async fn cancel(state: &AppState, id: &str, reason: Option<String>, json: bool) -> Result<()> {
    let execution = state.skill_service.cancel(parse_id(id)?, reason).await?;
    render_execution(&execution, json)
}

pub async fn rollback(state: &AppState, id: &str, json: bool) -> Result<()> {
    let execution = state.skill_service.rollback(parse_id(id)?).await?;
    render_execution(&execution, json)
}

pub async fn release(state: &AppState, id: &str, json: bool) -> Result<()> {
    let execution = state.skill_service.release(parse_id(id)?).await?;
    render_execution(&execution, json)
}

pub async fn show(state: &AppState, id: &str, json: bool) -> Result<()> {
    let id = parse_id(id)?;
    let execution = state.skill_service.get_execution(id).await?;
    let operations = state.skill_service.operations(id).await?;

    if json {
        let out = serde_json::json!({ "execution": execution, "operations": operations });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    render_execution(&execution, false)?;
    if operations.is_empty() {
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step"),
            Cell::new("Tool").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Attempt"),
            Cell::new("State"),
            Cell::new("ms"),
        ]);
    for op in &operations {
        let color = match op.state {
            OperationState::Success => Color::Green,
            OperationState::Failed => Color::Red,
        };
        table.add_row(vec![
            Cell::new(&op.step_id),
            Cell::new(&op.tool_name),
            Cell::new(op.operation_type.to_string()),
            Cell::new(op.attempt),
            Cell::new(op.state.to_string()).fg(color),
            Cell::new(op.duration_ms),
        ]);
    }
    println!("  {}", style("── Operations ──").dim());
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn styled_state(state: ExecutionState) -> console::StyledObject<String> {
    let text = state.to_string();
    match state {
        ExecutionState::Completed => style(text).green(),
        ExecutionState::Failed => style(text).red(),
        ExecutionState::WaitingInput => style(text).yellow(),
        ExecutionState::Cancelled | ExecutionState::RolledBack => style(text).dim(),
        ExecutionState::Pending | ExecutionState::Running => style(text).cyan(),
    }
}

pub fn render_execution(execution: &Execution, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(execution)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}  {}",
        style(&execution.skill_name).bold(),
        style(execution.id).dim(),
        styled_state(execution.state)
    );
    println!("  Steps completed: {}", execution.steps_completed);
    if let Some(mode) = execution.rollback_mode {
        println!("  Rollback mode:   {mode}");
    }

    match execution.state {
        ExecutionState::WaitingInput => {
            if let Some(pending) = &execution.pending_input {
                println!();
                println!("  {} {}", style("?").yellow().bold(), pending.prompt);
                if !pending.options.is_empty() {
                    println!("    options: {}", pending.options.join(", "));
                }
                println!(
                    "  Answer with {}",
                    style(format!("skillforge input {} <value>", execution.id)).yellow()
                );
            }
        }
        ExecutionState::Failed => {
            println!(
                "  {} {}{}",
                style("✗").red(),
                execution.error_message.as_deref().unwrap_or("failed"),
                execution
                    .error_step_id
                    .as_deref()
                    .map(|s| format!(" (step '{s}')"))
                    .unwrap_or_default()
            );
        }
        ExecutionState::Completed => {
            if let Some(summary) = &execution.result_summary {
                println!("  {} {summary}", style("✓").green());
            }
        }
        _ => {}
    }

    for failure in &execution.step_errors {
        println!(
            "  {} step '{}': {}",
            style("!").yellow(),
            failure.step_id,
            failure.message
        );
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_input_pairs_parse_json_values() {
        assert_eq!(parse_input_pair("amount=12").unwrap(), ("amount".into(), json!(12)));
        assert_eq!(
            parse_input_pair("partner=Acme Corp").unwrap(),
            ("partner".into(), json!("Acme Corp"))
        );
        assert_eq!(
            parse_input_pair("lines=[1,2]").unwrap(),
            ("lines".into(), json!([1, 2]))
        );
        assert_eq!(parse_input_pair("note=a=b").unwrap().1, json!("a=b"));
    }

    #[test]
    fn test_input_pairs_reject_malformed() {
        assert!(parse_input_pair("no-equals").is_err());
        assert!(parse_input_pair("=value").is_err());
    }
}
