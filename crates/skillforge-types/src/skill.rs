//! Skill domain types.
//!
//! A `Skill` is the canonical, declarative definition of an automation: an
//! arena of `StepDefinition`s plus the metadata the intent matcher and the
//! execution engine need (trigger phrases, context schema, limits). YAML files
//! and the REST API both convert to and from this struct.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// SkillId
// ---------------------------------------------------------------------------

/// Unique identifier for a skill, wrapping a UUID v7 (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SkillId(pub Uuid);

impl SkillId {
    /// Create a new SkillId using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SkillId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SkillId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SkillId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Skill
// ---------------------------------------------------------------------------

/// A named, versioned workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    /// Assigned on first registration when absent from the YAML.
    #[serde(default)]
    pub id: SkillId,
    /// Unique machine name (e.g. "create_sales_quote").
    pub technical_name: String,
    /// Human-readable name (e.g. "Create Sales Quote").
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Semantic version string.
    #[serde(default = "default_version")]
    pub version: String,
    /// Free-form grouping used to narrow intent matching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Ordering among skills; lower wins intent-matching ties.
    #[serde(default = "default_sequence")]
    pub sequence: i32,
    #[serde(default)]
    pub state: SkillState,
    /// Creator of the skill.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Phrases compared against free text by the intent matcher. May contain
    /// `{placeholder}` slots for parameter extraction.
    #[serde(default)]
    pub trigger_phrases: Vec<String>,
    /// Declared initiating parameters.
    #[serde(default)]
    pub context_schema: ContextSchema,
    /// Step arena. Default execution order is by `sequence`.
    pub steps: Vec<StepDefinition>,
    /// Take a rollback point when an execution starts, even without
    /// `rollback_on_failure`.
    #[serde(default)]
    pub auto_snapshot: bool,
    /// Roll back automatically when a critical step fails.
    #[serde(default)]
    pub rollback_on_failure: bool,
    #[serde(default)]
    pub limits: SkillLimits,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_sequence() -> i32 {
    10
}

impl Skill {
    /// Whether a rollback point should be opened when an execution starts.
    pub fn wants_rollback_point(&self) -> bool {
        self.auto_snapshot
            || self.rollback_on_failure
            || self.steps.iter().any(|s| s.rollback_on_failure)
    }

    /// Look up a step by its handle.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Skill lifecycle.
///
/// - Draft: editable, not matched, not executable
/// - Active: matched and executable
/// - Deprecated: executable by ID, never matched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillState {
    #[default]
    Draft,
    Active,
    Deprecated,
}

impl fmt::Display for SkillState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Active => write!(f, "active"),
            Self::Deprecated => write!(f, "deprecated"),
        }
    }
}

impl FromStr for SkillState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "deprecated" => Ok(Self::Deprecated),
            other => Err(format!("invalid skill state: '{other}'")),
        }
    }
}

/// Operation and wall-clock limits for one execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillLimits {
    /// Maximum number of tool/action invocations per execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_operations: Option<u32>,
    /// Total wall-clock budget across suspensions (falls back to the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Context schema
// ---------------------------------------------------------------------------

/// Declared initiating parameters of a skill.
///
/// Property order is significant: slot captures that don't name a property
/// are keyed by position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSchema {
    #[serde(default)]
    pub properties: Vec<PropertySpec>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl ContextSchema {
    pub fn property(&self, name: &str) -> Option<&PropertySpec> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// One declared context property.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub property_type: PropertyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Value type of a context property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

// ---------------------------------------------------------------------------
// Step definition
// ---------------------------------------------------------------------------

/// One instruction inside a skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Stable handle, unique within the skill. Jump targets and loop bodies
    /// refer to steps by this handle.
    pub id: String,
    pub name: String,
    /// Default ordering among top-level steps.
    #[serde(default)]
    pub sequence: i32,
    /// Type-specific configuration.
    #[serde(flatten)]
    pub kind: StepKind,
    /// Context key receiving the step result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
    /// Expression over `output` and the context, applied before binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_transform: Option<String>,
    /// Failure aborts the execution (true) or is recorded and skipped (false).
    #[serde(default = "default_true")]
    pub is_critical: bool,
    /// Extra attempts after the first failure.
    #[serde(default)]
    pub retry_count: u32,
    /// Delay between attempts in milliseconds.
    #[serde(default)]
    pub retry_delay_ms: u64,
    /// Roll the execution back when this step fails critically.
    #[serde(default)]
    pub rollback_on_failure: bool,
}

fn default_true() -> bool {
    true
}

impl StepDefinition {
    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }
}

/// The kind of a step, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    ToolCall,
    UserInput,
    Condition,
    Loop,
    Validation,
    Confirmation,
    Subskill,
    Action,
    AiDecision,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ToolCall => "tool_call",
            Self::UserInput => "user_input",
            Self::Condition => "condition",
            Self::Loop => "loop",
            Self::Validation => "validation",
            Self::Confirmation => "confirmation",
            Self::Subskill => "subskill",
            Self::Action => "action",
            Self::AiDecision => "ai_decision",
        };
        f.write_str(s)
    }
}

/// Step-specific configuration, internally tagged by `type`:
///
/// ```yaml
/// - id: create
///   name: Create quote
///   type: tool_call
///   tool_name: sale.create_quote
///   params_template: '{"partner": {partner_id}}'
///   output_variable: quote_id
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke a named tool through the tool invoker.
    ToolCall {
        /// Stable tool handle (takes precedence over `tool_name`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        /// JSON object text with `{var}` placeholders.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params_template: Option<String>,
    },
    /// Ask the user for a value.
    UserInput {
        prompt: String,
        #[serde(default)]
        input_type: InputType,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        options: Vec<String>,
        variable: String,
    },
    /// Branch on a boolean expression.
    Condition {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_success_step: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_failure_step: Option<String>,
    },
    /// Run `body` once per element of `collection`.
    Loop {
        collection: String,
        #[serde(default = "default_item_variable")]
        item_variable: String,
        body: Vec<String>,
    },
    /// Assert a boolean expression; a false result is a step failure.
    Validation {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Ask the user to confirm before continuing.
    Confirmation {
        prompt: String,
        #[serde(default = "default_confirm_variable")]
        variable: String,
    },
    /// Run another skill as a nested execution.
    Subskill {
        skill: String,
        /// Child key -> expression over the parent context.
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        context_mapping: HashMap<String, String>,
        /// Parent key -> child context key, merged back on completion.
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        output_mapping: HashMap<String, String>,
    },
    /// Opaque action handled by the step resolver.
    Action {
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params_template: Option<String>,
    },
    /// Opaque decision handled by the step resolver.
    AiDecision {
        prompt: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        options: Vec<String>,
    },
}

fn default_item_variable() -> String {
    "item".to_string()
}

fn default_confirm_variable() -> String {
    "confirmed".to_string()
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            Self::ToolCall { .. } => StepType::ToolCall,
            Self::UserInput { .. } => StepType::UserInput,
            Self::Condition { .. } => StepType::Condition,
            Self::Loop { .. } => StepType::Loop,
            Self::Validation { .. } => StepType::Validation,
            Self::Confirmation { .. } => StepType::Confirmation,
            Self::Subskill { .. } => StepType::Subskill,
            Self::Action { .. } => StepType::Action,
            Self::AiDecision { .. } => StepType::AiDecision,
        }
    }
}

/// Expected type of a user-provided value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    #[default]
    Text,
    Number,
    Boolean,
    Selection,
    Date,
    Json,
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Selection => "selection",
            Self::Date => "date",
            Self::Json => "json",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Aggregated execution outcomes of one skill.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillStats {
    pub execution_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Running mean over successful executions.
    pub avg_duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<DateTime<Utc>>,
}

impl SkillStats {
    /// Fold one outcome into the aggregate.
    pub fn record(&mut self, success: bool, duration_ms: u64, at: DateTime<Utc>) {
        self.execution_count += 1;
        if success {
            self.success_count += 1;
            let n = self.success_count as f64;
            self.avg_duration_ms += (duration_ms as f64 - self.avg_duration_ms) / n;
        } else {
            self.failure_count += 1;
        }
        self.last_executed_at = Some(at);
    }

    pub fn success_rate(&self) -> f64 {
        if self.execution_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.execution_count as f64
    }
}
