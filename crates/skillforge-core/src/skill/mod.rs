//! Skill definitions, registry and intent matching.
//!
//! YAML skill parsing, structural validation and compilation into an
//! executable step arena, the repository-backed registry, and the
//! free-text intent matcher that selects which skill to run. The domain
//! types live in `skillforge-types::skill`.

pub mod definition;
pub mod intent;
pub mod registry;

pub use definition::{CompiledSkill, SkillError};
pub use intent::{IntentMatch, MatchContext, match_intent};
pub use registry::SkillRegistry;
