//! `skillforge match`: rank active skills against free text.

use anyhow::{Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use skillforge_core::skill::MatchContext;

use crate::state::AppState;

pub async fn match_intent(
    state: &AppState,
    text: &str,
    category: Option<String>,
    threshold: Option<f64>,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    if let Some(t) = threshold {
        if !(0.0..=1.0).contains(&t) {
            bail!("--threshold must be between 0 and 1, got {t}");
        }
    }

    let context = MatchContext { category };
    let matches = state
        .skill_service
        .match_intent(text, Some(&context), threshold, limit)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&matches)?);
        return Ok(());
    }

    println!();
    if matches.is_empty() {
        println!("  No active skill matches \"{text}\".");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Score"),
            Cell::new("Skill").fg(Color::Cyan),
            Cell::new("Matched phrase"),
            Cell::new("Parameters"),
        ]);

    for m in &matches {
        let score_color = if m.score >= 0.8 {
            Color::Green
        } else if m.score >= 0.5 {
            Color::Yellow
        } else {
            Color::Reset
        };
        let mut params: Vec<String> = m
            .parameters
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        params.sort();

        table.add_row(vec![
            Cell::new(format!("{:.2}", m.score)).fg(score_color),
            Cell::new(format!("{} ({})", m.display_name, m.skill_name)),
            Cell::new(&m.matched_phrase),
            Cell::new(if params.is_empty() { "-".to_string() } else { params.join(", ") }),
        ]);
    }

    println!("{table}");
    println!();
    println!(
        "  Run the top match with {}",
        style(format!(
            "skillforge run {} --text \"{text}\"",
            matches[0].skill_name
        ))
        .yellow()
    );
    println!();
    Ok(())
}
