//! Intent matching: rank active skills against free text.
//!
//! Trigger phrases are tokenized into normalized word sets and compared with
//! the input using Jaccard similarity. Phrases may carry `{slot}`
//! placeholders; those compile to a case-insensitive pattern whose captures
//! become initiating parameters, coerced to the skill's context schema.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skillforge_types::skill::{ContextSchema, PropertyType, SkillId, SkillState};

use super::definition::CompiledSkill;

// ---------------------------------------------------------------------------
// Tokenization
// ---------------------------------------------------------------------------

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "to", "for", "of", "in", "on", "at", "with", "and", "or", "please", "i",
    "me", "my", "we", "our", "you", "your", "is", "are", "be", "it", "this", "that", "want",
    "would", "like", "need", "can", "could", "some", "let", "us", "do",
];

/// Suffixes folded away so inflections share one token. Longest first.
const SUFFIXES: &[(&str, &str)] = &[
    ("ations", ""),
    ("ation", ""),
    ("ings", ""),
    ("ing", ""),
    ("ies", "y"),
    ("ed", ""),
    ("es", ""),
    ("s", ""),
];

const MIN_STEM_LEN: usize = 3;

/// Light suffix normalization: "quote", "quotes" and "quotation" all map to
/// "quot".
fn normalize(word: &str) -> String {
    let mut stem = word.to_string();
    for (suffix, replacement) in SUFFIXES {
        if let Some(base) = stem.strip_suffix(suffix) {
            if base.chars().count() >= MIN_STEM_LEN && !(*suffix == "s" && base.ends_with('s')) {
                stem = format!("{base}{replacement}");
                break;
            }
        }
    }
    if let Some(base) = stem.strip_suffix('e') {
        if base.chars().count() >= MIN_STEM_LEN {
            stem = base.to_string();
        }
    }
    stem
}

/// Case-fold, split on non-letters, drop stop words, normalize suffixes.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphabetic())
        .filter(|w| !w.is_empty() && !STOP_WORDS.contains(w))
        .map(normalize)
        .collect()
}

/// `|A ∩ B| / |A ∪ B|`; two empty sets are identical (1.0).
pub fn jaccard_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

// ---------------------------------------------------------------------------
// TriggerPattern
// ---------------------------------------------------------------------------

/// A trigger phrase compiled for matching and slot extraction.
#[derive(Debug, Clone)]
pub struct TriggerPattern {
    phrase: String,
    /// Tokens of the literal parts of the phrase.
    tokens: HashSet<String>,
    /// Slot names in order of appearance.
    slots: Vec<String>,
    /// Present only for phrases with slots.
    pattern: Option<Regex>,
}

impl TriggerPattern {
    pub fn compile(phrase: &str) -> Result<Self, regex::Error> {
        let mut slots = Vec::new();
        let mut literal_text = String::new();
        let mut pattern = String::from("(?i)");
        let mut last = 0;

        for caps in SLOT_RE.captures_iter(phrase) {
            let Some(whole) = caps.get(0) else { continue };
            let literal = &phrase[last..whole.start()];
            literal_text.push_str(literal);
            literal_text.push(' ');
            pattern.push_str(&literal_pattern(literal));
            pattern.push_str(&format!("(?P<s{}>.+?)", slots.len()));
            slots.push(caps[1].to_string());
            last = whole.end();
        }
        let tail = &phrase[last..];
        literal_text.push_str(tail);

        let pattern = if slots.is_empty() {
            None
        } else {
            pattern.push_str(&literal_pattern(tail));
            pattern.push_str(r"\s*[.!?]*\s*$");
            Some(Regex::new(&pattern)?)
        };

        Ok(Self {
            phrase: phrase.to_string(),
            tokens: tokenize(&literal_text),
            slots,
            pattern,
        })
    }

    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    pub fn slots(&self) -> &[String] {
        &self.slots
    }

    /// Score the input against this phrase, returning captured slot text
    /// when the slot pattern matched.
    fn score(&self, input: &str) -> (f64, Vec<(usize, String)>) {
        let Some(caps) = self.pattern.as_ref().and_then(|re| re.captures(input)) else {
            return (jaccard_similarity(&tokenize(input), &self.tokens), Vec::new());
        };

        let mut captured = Vec::new();
        let mut remainder = String::with_capacity(input.len());
        let mut last = 0;
        for i in 0..self.slots.len() {
            if let Some(m) = caps.name(&format!("s{i}")) {
                remainder.push_str(&input[last..m.start()]);
                remainder.push(' ');
                last = m.end();
                captured.push((i, m.as_str().trim().to_string()));
            }
        }
        remainder.push_str(&input[last..]);

        (jaccard_similarity(&tokenize(&remainder), &self.tokens), captured)
    }
}

static SLOT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Escape a literal phrase segment; whitespace runs match any whitespace.
fn literal_pattern(literal: &str) -> String {
    let mut out = String::new();
    let mut pending_space = false;
    for word in literal.split_whitespace() {
        if pending_space || (out.is_empty() && literal.starts_with(char::is_whitespace)) {
            out.push_str(r"\s+");
        }
        out.push_str(&regex::escape(word));
        pending_space = true;
    }
    if literal.ends_with(char::is_whitespace) && !literal.trim().is_empty() {
        out.push_str(r"\s+");
    } else if literal.trim().is_empty() && !literal.is_empty() {
        out.push_str(r"\s+");
    }
    out
}

// ---------------------------------------------------------------------------
// Parameter extraction
// ---------------------------------------------------------------------------

/// Key captures by slot name when it is a declared property, otherwise by
/// the property at the same position, and coerce to the declared type.
/// A positional property that another slot names is left to that slot.
fn extract_parameters(
    schema: &ContextSchema,
    slots: &[String],
    captured: Vec<(usize, String)>,
) -> HashMap<String, Value> {
    let named: HashSet<&str> = slots
        .iter()
        .filter(|slot| schema.property(slot).is_some())
        .map(String::as_str)
        .collect();
    let mut params = HashMap::new();
    for (position, text) in captured {
        let slot = &slots[position];
        let property = schema.property(slot).or_else(|| {
            schema
                .properties
                .get(position)
                .filter(|p| !named.contains(p.name.as_str()))
        });
        let (key, value) = match property {
            Some(p) => (p.name.clone(), coerce(&text, p.property_type)),
            None => (slot.clone(), Value::String(text)),
        };
        params.insert(key, value);
    }
    params
}

/// Best-effort conversion of captured text; falls back to the raw string.
pub fn coerce(text: &str, ty: PropertyType) -> Value {
    let trimmed = text.trim();
    let converted = match ty {
        PropertyType::String => None,
        PropertyType::Integer => trimmed.replace(',', "").parse::<i64>().ok().map(Value::from),
        PropertyType::Number => trimmed
            .replace(',', "")
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        PropertyType::Boolean => match trimmed.to_lowercase().as_str() {
            "true" | "yes" | "y" | "1" | "on" => Some(Value::Bool(true)),
            "false" | "no" | "n" | "0" | "off" => Some(Value::Bool(false)),
            _ => None,
        },
        PropertyType::Array => Some(Value::Array(
            trimmed
                .split(|c| c == ',')
                .flat_map(|part| part.split(" and "))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(s.to_string()))
                .collect(),
        )),
        PropertyType::Object => serde_json::from_str::<Value>(trimmed)
            .ok()
            .filter(Value::is_object),
    };
    converted.unwrap_or_else(|| Value::String(trimmed.to_string()))
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// Narrowing hints supplied with the text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// One ranked candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentMatch {
    pub skill_id: SkillId,
    /// Technical name.
    pub skill_name: String,
    pub display_name: String,
    pub score: f64,
    pub matched_phrase: String,
    pub parameters: HashMap<String, Value>,
    #[serde(skip)]
    sequence: i32,
}

/// Rank `candidates` against `text`, highest score first.
///
/// Only active skills are considered. Ties are broken by skill sequence and
/// then by technical name. Scores below `threshold` are dropped and at most
/// `limit` matches are returned. Never fails.
pub fn match_intent<'a>(
    text: &str,
    candidates: impl IntoIterator<Item = &'a CompiledSkill>,
    context: &MatchContext,
    threshold: f64,
    limit: usize,
) -> Vec<IntentMatch> {
    if tokenize(text).is_empty() {
        return Vec::new();
    }

    let mut matches: Vec<IntentMatch> = candidates
        .into_iter()
        .filter(|c| c.skill().state == SkillState::Active)
        .filter(|c| match &context.category {
            Some(category) => c.skill().category.as_deref() == Some(category.as_str()),
            None => true,
        })
        .filter_map(|c| best_match(text, c))
        .filter(|m| m.score >= threshold)
        .collect();

    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.sequence.cmp(&b.sequence))
            .then_with(|| a.skill_name.cmp(&b.skill_name))
    });
    matches.truncate(limit);
    matches
}

fn best_match(text: &str, compiled: &CompiledSkill) -> Option<IntentMatch> {
    let skill = compiled.skill();
    let mut best: Option<(f64, &TriggerPattern, Vec<(usize, String)>)> = None;

    for trigger in compiled.triggers() {
        let (score, captured) = trigger.score(text);
        // Prefer a phrase whose slots matched when scores tie
        let better = match &best {
            None => true,
            Some((s, _, c)) => score > *s || (score == *s && c.is_empty() && !captured.is_empty()),
        };
        if better {
            best = Some((score, trigger, captured));
        }
    }

    let (score, trigger, captured) = best?;
    Some(IntentMatch {
        skill_id: skill.id,
        skill_name: skill.technical_name.clone(),
        display_name: skill.name.clone(),
        score,
        matched_phrase: trigger.phrase().to_string(),
        parameters: extract_parameters(&skill.context_schema, trigger.slots(), captured),
        sequence: skill.sequence,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
