//! Skill definition parsing, validation, compilation, and filesystem operations.
//!
//! Converts YAML files into `Skill` values, validates the structural
//! invariants a skill must satisfy before it can be registered, and compiles
//! it into a `CompiledSkill`: the step arena plus its top-level order and the
//! pre-parsed expressions of every step.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use skillforge_types::error::RepositoryError;
use skillforge_types::skill::{InputType, Skill, StepDefinition, StepKind};
use thiserror::Error;

use crate::engine::expression::{CompiledExpression, ExpressionError};

use super::intent::TriggerPattern;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading, validating or registering skills.
#[derive(Debug, Error)]
pub enum SkillError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure (definition time only).
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Loop nesting or subskill references form a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    #[error("skill not found: {0}")]
    NotFound(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl SkillError {
    fn expression(step_id: &str, field: &str, err: ExpressionError) -> Self {
        SkillError::ValidationError(format!("step '{step_id}' has an invalid {field}: {err}"))
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `Skill`.
///
/// Runs `validate_skill` after deserialization, so the returned value is
/// guaranteed to be structurally valid on its own (cross-skill references
/// are checked at registration).
pub fn parse_skill_yaml(yaml: &str) -> Result<Skill, SkillError> {
    let skill: Skill =
        serde_yaml_ng::from_str(yaml).map_err(|e| SkillError::ParseError(e.to_string()))?;
    validate_skill(&skill)?;
    Ok(skill)
}

/// Serialize a `Skill` to a YAML string.
pub fn serialize_skill_yaml(skill: &Skill) -> Result<String, SkillError> {
    serde_yaml_ng::to_string(skill).map_err(|e| SkillError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a single skill.
///
/// Checks:
/// - Technical name is non-empty lowercase snake case (dots allowed)
/// - Version is a semantic version
/// - At least one step exists and all step IDs are unique
/// - Required context keys are declared properties
/// - Step type invariants (non-empty expressions, tool reference, options)
/// - Jump targets and loop bodies reference existing steps in scope
/// - A step belongs to at most one loop body and loop nesting is acyclic
/// - Every expression compiles
pub fn validate_skill(skill: &Skill) -> Result<(), SkillError> {
    validate_header(skill)?;

    let ids: HashSet<&str> = skill.steps.iter().map(|s| s.id.as_str()).collect();
    if ids.len() != skill.steps.len() {
        let mut seen = HashSet::new();
        for step in &skill.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(SkillError::ValidationError(format!(
                    "duplicate step ID: '{}'",
                    step.id
                )));
            }
        }
    }

    for step in &skill.steps {
        validate_step(step)?;
    }

    let parent_loop = loop_membership(skill, &ids)?;
    check_loop_nesting(skill)?;
    check_jump_targets(skill, &ids, &parent_loop)?;
    Ok(())
}

fn validate_header(skill: &Skill) -> Result<(), SkillError> {
    let name = &skill.technical_name;
    if name.is_empty() {
        return Err(SkillError::ValidationError(
            "technical name must not be empty".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.')
    {
        return Err(SkillError::ValidationError(format!(
            "technical name '{name}' contains invalid characters (only lowercase letters, digits, '_' and '.' allowed)"
        )));
    }
    if skill.name.trim().is_empty() {
        return Err(SkillError::ValidationError(format!(
            "skill '{name}' must have a display name"
        )));
    }
    if semver::Version::parse(&skill.version).is_err() {
        return Err(SkillError::ValidationError(format!(
            "skill '{name}' has invalid version '{}'",
            skill.version
        )));
    }
    if skill.steps.is_empty() {
        return Err(SkillError::ValidationError(format!(
            "skill '{name}' must have at least one step"
        )));
    }
    for key in &skill.context_schema.required {
        if skill.context_schema.property(key).is_none() {
            return Err(SkillError::ValidationError(format!(
                "required context key '{key}' is not a declared property"
            )));
        }
    }
    if skill.limits.timeout_secs == Some(0) {
        return Err(SkillError::ValidationError("timeout must be > 0".to_string()));
    }
    if skill.limits.max_operations == Some(0) {
        return Err(SkillError::ValidationError(
            "max_operations must be > 0".to_string(),
        ));
    }
    Ok(())
}

fn validate_step(step: &StepDefinition) -> Result<(), SkillError> {
    let id = step.id.as_str();
    if id.trim().is_empty() {
        return Err(SkillError::ValidationError(
            "step ID must not be empty".to_string(),
        ));
    }

    match &step.kind {
        StepKind::ToolCall {
            tool_id, tool_name, ..
        } => {
            let has_ref = tool_id.as_deref().is_some_and(|t| !t.trim().is_empty())
                || tool_name.as_deref().is_some_and(|t| !t.trim().is_empty());
            if !has_ref {
                return Err(SkillError::ValidationError(format!(
                    "tool_call step '{id}' must reference a tool by tool_id or tool_name"
                )));
            }
        }
        StepKind::Condition { expression, .. } | StepKind::Validation { expression, .. } => {
            if expression.trim().is_empty() {
                return Err(SkillError::ValidationError(format!(
                    "{} step '{id}' must have a non-empty expression",
                    step.step_type()
                )));
            }
            CompiledExpression::compile(expression)
                .map_err(|e| SkillError::expression(id, "expression", e))?;
        }
        StepKind::Loop {
            collection,
            item_variable,
            body,
        } => {
            if collection.trim().is_empty() {
                return Err(SkillError::ValidationError(format!(
                    "loop step '{id}' must have a non-empty collection expression"
                )));
            }
            CompiledExpression::compile(collection)
                .map_err(|e| SkillError::expression(id, "collection", e))?;
            if item_variable.trim().is_empty() {
                return Err(SkillError::ValidationError(format!(
                    "loop step '{id}' must name its item variable"
                )));
            }
            if body.is_empty() {
                return Err(SkillError::ValidationError(format!(
                    "loop step '{id}' must have at least one body step"
                )));
            }
        }
        StepKind::UserInput {
            input_type,
            options,
            variable,
            ..
        } => {
            if variable.trim().is_empty() {
                return Err(SkillError::ValidationError(format!(
                    "user_input step '{id}' must name its target variable"
                )));
            }
            if *input_type == InputType::Selection && options.is_empty() {
                return Err(SkillError::ValidationError(format!(
                    "selection step '{id}' must list its options"
                )));
            }
        }
        StepKind::Confirmation { variable, .. } => {
            if variable.trim().is_empty() {
                return Err(SkillError::ValidationError(format!(
                    "confirmation step '{id}' must name its target variable"
                )));
            }
        }
        StepKind::Subskill {
            skill,
            context_mapping,
            ..
        } => {
            if skill.trim().is_empty() {
                return Err(SkillError::ValidationError(format!(
                    "subskill step '{id}' must reference a skill"
                )));
            }
            for (key, expr) in context_mapping {
                CompiledExpression::compile(expr).map_err(|e| {
                    SkillError::expression(id, &format!("context_mapping for '{key}'"), e)
                })?;
            }
        }
        StepKind::Action { action, .. } => {
            if action.trim().is_empty() {
                return Err(SkillError::ValidationError(format!(
                    "action step '{id}' must name its action"
                )));
            }
        }
        StepKind::AiDecision { .. } => {}
    }

    if let Some(transform) = &step.output_transform {
        CompiledExpression::compile(transform)
            .map_err(|e| SkillError::expression(id, "output_transform", e))?;
    }
    Ok(())
}

/// Map each loop body step to the loop that owns it.
fn loop_membership<'a>(
    skill: &'a Skill,
    ids: &HashSet<&str>,
) -> Result<HashMap<&'a str, &'a str>, SkillError> {
    let mut parent: HashMap<&str, &str> = HashMap::new();
    for step in &skill.steps {
        let StepKind::Loop { body, .. } = &step.kind else {
            continue;
        };
        for member in body {
            if !ids.contains(member.as_str()) {
                return Err(SkillError::ValidationError(format!(
                    "loop step '{}' references unknown step '{member}'",
                    step.id
                )));
            }
            if member == &step.id {
                return Err(SkillError::CycleDetected(format!(
                    "loop step '{}' contains itself",
                    step.id
                )));
            }
            if let Some(owner) = parent.insert(member.as_str(), step.id.as_str()) {
                return Err(SkillError::ValidationError(format!(
                    "step '{member}' belongs to both loop '{owner}' and loop '{}'",
                    step.id
                )));
            }
        }
    }
    Ok(parent)
}

/// Loops nested in loop bodies must form a forest.
fn check_loop_nesting(skill: &Skill) -> Result<(), SkillError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut nodes = HashMap::new();
    for step in &skill.steps {
        if matches!(step.kind, StepKind::Loop { .. }) {
            nodes.insert(step.id.as_str(), graph.add_node(step.id.as_str()));
        }
    }
    for step in &skill.steps {
        let StepKind::Loop { body, .. } = &step.kind else {
            continue;
        };
        for member in body {
            if let Some(&inner) = nodes.get(member.as_str()) {
                graph.add_edge(nodes[step.id.as_str()], inner, ());
            }
        }
    }
    toposort(&graph, None).map_err(|cycle| {
        SkillError::CycleDetected(format!(
            "loop nesting cycle involving step '{}'",
            graph[cycle.node_id()]
        ))
    })?;
    Ok(())
}

/// Jump targets must exist and stay within the condition's own scope: the
/// top level for top-level conditions, the same loop body otherwise.
fn check_jump_targets(
    skill: &Skill,
    ids: &HashSet<&str>,
    parent_loop: &HashMap<&str, &str>,
) -> Result<(), SkillError> {
    for step in &skill.steps {
        let StepKind::Condition {
            on_success_step,
            on_failure_step,
            ..
        } = &step.kind
        else {
            continue;
        };
        for target in [on_success_step, on_failure_step].into_iter().flatten() {
            if !ids.contains(target.as_str()) {
                return Err(SkillError::ValidationError(format!(
                    "condition step '{}' jumps to unknown step '{target}'",
                    step.id
                )));
            }
            let own_scope = parent_loop.get(step.id.as_str());
            let target_scope = parent_loop.get(target.as_str());
            if own_scope != target_scope {
                return Err(SkillError::ValidationError(format!(
                    "condition step '{}' jumps to step '{target}' outside its scope",
                    step.id
                )));
            }
        }
    }
    Ok(())
}

/// Validate subskill references across a set of skills: every reference must
/// resolve within the set and the reference graph must be acyclic.
pub fn validate_subskill_graph<'a>(
    skills: impl IntoIterator<Item = &'a Skill>,
) -> Result<(), SkillError> {
    let skills: Vec<&Skill> = skills.into_iter().collect();
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: HashMap<&str, _> = skills
        .iter()
        .map(|s| (s.technical_name.as_str(), graph.add_node(s.technical_name.as_str())))
        .collect();

    for skill in &skills {
        for step in &skill.steps {
            let StepKind::Subskill { skill: target, .. } = &step.kind else {
                continue;
            };
            let Some(&to) = nodes.get(target.as_str()) else {
                return Err(SkillError::ValidationError(format!(
                    "subskill step '{}' in '{}' references unknown skill '{target}'",
                    step.id, skill.technical_name
                )));
            };
            graph.add_edge(nodes[skill.technical_name.as_str()], to, ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        SkillError::CycleDetected(format!(
            "subskill reference cycle involving '{}'",
            graph[cycle.node_id()]
        ))
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Pre-parsed expressions of one step.
#[derive(Debug, Clone, Default)]
pub struct StepProgram {
    /// Condition or validation expression.
    pub predicate: Option<CompiledExpression>,
    /// Loop collection.
    pub collection: Option<CompiledExpression>,
    pub output_transform: Option<CompiledExpression>,
    /// Subskill child key -> parent expression, sorted by key.
    pub context_mapping: Vec<(String, CompiledExpression)>,
}

/// An immutable, validated skill ready for interpretation.
#[derive(Debug, Clone)]
pub struct CompiledSkill {
    skill: Skill,
    /// Step handle -> arena index.
    index: HashMap<String, usize>,
    /// Arena indices of top-level steps, in execution order.
    order: Vec<usize>,
    programs: Vec<StepProgram>,
    triggers: Vec<TriggerPattern>,
}

impl CompiledSkill {
    /// Validate and compile a skill.
    pub fn compile(skill: Skill) -> Result<Self, SkillError> {
        validate_skill(&skill)?;

        let index: HashMap<String, usize> = skill
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();

        let in_body: HashSet<&str> = skill
            .steps
            .iter()
            .filter_map(|s| match &s.kind {
                StepKind::Loop { body, .. } => Some(body.iter().map(String::as_str)),
                _ => None,
            })
            .flatten()
            .collect();

        let mut order: Vec<usize> = (0..skill.steps.len())
            .filter(|&i| !in_body.contains(skill.steps[i].id.as_str()))
            .collect();
        // Stable: ties keep declaration order
        order.sort_by_key(|&i| skill.steps[i].sequence);

        let programs = skill
            .steps
            .iter()
            .map(compile_program)
            .collect::<Result<Vec<_>, _>>()?;

        // A skill without trigger phrases is matched by its display name
        let phrases: Vec<&str> = if skill.trigger_phrases.is_empty() {
            vec![skill.name.as_str()]
        } else {
            skill.trigger_phrases.iter().map(String::as_str).collect()
        };
        let triggers = phrases
            .into_iter()
            .map(|phrase| {
                TriggerPattern::compile(phrase).map_err(|e| {
                    SkillError::ValidationError(format!("invalid trigger phrase '{phrase}': {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            skill,
            index,
            order,
            programs,
            triggers,
        })
    }

    pub fn skill(&self) -> &Skill {
        &self.skill
    }

    pub fn triggers(&self) -> &[TriggerPattern] {
        &self.triggers
    }

    pub fn technical_name(&self) -> &str {
        &self.skill.technical_name
    }

    /// Number of top-level steps.
    pub fn top_level_len(&self) -> usize {
        self.order.len()
    }

    /// The top-level step at `position`.
    pub fn top_level_step(&self, position: usize) -> Option<&StepDefinition> {
        self.order.get(position).map(|&i| &self.skill.steps[i])
    }

    /// Position of a top-level step in execution order.
    pub fn top_level_position(&self, step_id: &str) -> Option<usize> {
        let arena = *self.index.get(step_id)?;
        self.order.iter().position(|&i| i == arena)
    }

    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.index.get(step_id).map(|&i| &self.skill.steps[i])
    }

    pub fn program(&self, step_id: &str) -> Option<&StepProgram> {
        self.index.get(step_id).map(|&i| &self.programs[i])
    }

    /// Body step handles of a loop step.
    pub fn loop_body(&self, loop_id: &str) -> &[String] {
        match self.step(loop_id).map(|s| &s.kind) {
            Some(StepKind::Loop { body, .. }) => body,
            _ => &[],
        }
    }
}

fn compile_program(step: &StepDefinition) -> Result<StepProgram, SkillError> {
    let id = step.id.as_str();
    let mut program = StepProgram::default();

    match &step.kind {
        StepKind::Condition { expression, .. } | StepKind::Validation { expression, .. } => {
            program.predicate = Some(
                CompiledExpression::compile(expression)
                    .map_err(|e| SkillError::expression(id, "expression", e))?,
            );
        }
        StepKind::Loop { collection, .. } => {
            program.collection = Some(
                CompiledExpression::compile(collection)
                    .map_err(|e| SkillError::expression(id, "collection", e))?,
            );
        }
        StepKind::Subskill {
            context_mapping, ..
        } => {
            let mut mapping = context_mapping
                .iter()
                .map(|(key, expr)| {
                    CompiledExpression::compile(expr)
                        .map(|compiled| (key.clone(), compiled))
                        .map_err(|e| SkillError::expression(id, "context_mapping", e))
                })
                .collect::<Result<Vec<_>, _>>()?;
            mapping.sort_by(|a, b| a.0.cmp(&b.0));
            program.context_mapping = mapping;
        }
        _ => {}
    }

    if let Some(transform) = &step.output_transform {
        program.output_transform = Some(
            CompiledExpression::compile(transform)
                .map_err(|e| SkillError::expression(id, "output_transform", e))?,
        );
    }
    Ok(program)
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a skill definition from a YAML file.
pub fn load_skill_file(path: &Path) -> Result<Skill, SkillError> {
    let content = std::fs::read_to_string(path)?;
    parse_skill_yaml(&content)
}

/// Save a skill definition to a YAML file.
///
/// Creates parent directories if they don't exist.
pub fn save_skill_file(path: &Path, skill: &Skill) -> Result<(), SkillError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_skill_yaml(skill)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all skill YAML files under `base_dir`.
///
/// Scans for `.yaml` and `.yml` files recursively. Files that fail to parse
/// are skipped with a warning.
pub fn discover_skills(base_dir: &Path) -> Result<Vec<(PathBuf, Skill)>, SkillError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(dir: &Path, results: &mut Vec<(PathBuf, Skill)>) -> Result<(), SkillError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            match load_skill_file(&path) {
                Ok(skill) => results.push((path, skill)),
                Err(e) => tracing::warn!(?path, error = %e, "skipping invalid skill file"),
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
