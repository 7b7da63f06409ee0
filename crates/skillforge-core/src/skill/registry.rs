//! Skill registry: validated, compiled skills backed by a repository.
//!
//! The registry is the only writer of skill definitions. Registration
//! compiles each skill and checks subskill references against everything
//! already stored, so a skill can never point at a missing or cyclic
//! subskill. Compiled skills are cached by technical name and shared as
//! `Arc<CompiledSkill>`, which keeps a running execution's definition
//! immutable even if the skill is replaced meanwhile.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use skillforge_types::event::SkillEvent;
use skillforge_types::skill::{Skill, SkillId, SkillState, SkillStats, StepKind};

use crate::event::EventBus;
use crate::repository::skill::SkillRepository;

use super::definition::{CompiledSkill, SkillError, validate_subskill_graph};

/// Registry of skill definitions.
///
/// Generic over `S: SkillRepository` for storage flexibility.
pub struct SkillRegistry<S: SkillRepository> {
    repo: S,
    cache: DashMap<String, Arc<CompiledSkill>>,
    event_bus: EventBus,
}

impl<S: SkillRepository> SkillRegistry<S> {
    pub fn new(repo: S, event_bus: EventBus) -> Self {
        Self {
            repo,
            cache: DashMap::new(),
            event_bus,
        }
    }

    pub fn repo(&self) -> &S {
        &self.repo
    }

    /// Register (or replace) a single skill.
    pub async fn register(&self, skill: Skill) -> Result<Arc<CompiledSkill>, SkillError> {
        let name = skill.technical_name.clone();
        self.register_all(vec![skill])
            .await?
            .into_iter()
            .next()
            .ok_or(SkillError::NotFound(name))
    }

    /// Register a batch of skills that may reference each other.
    ///
    /// The whole batch is validated before anything is stored. A skill that
    /// replaces an existing one keeps the existing identity.
    pub async fn register_all(
        &self,
        skills: Vec<Skill>,
    ) -> Result<Vec<Arc<CompiledSkill>>, SkillError> {
        let mut seen = HashSet::new();
        for skill in &skills {
            if !seen.insert(skill.technical_name.as_str()) {
                return Err(SkillError::ValidationError(format!(
                    "skill '{}' appears twice in the batch",
                    skill.technical_name
                )));
            }
        }

        let existing: HashMap<String, Skill> = self
            .repo
            .list_skills(None)
            .await?
            .into_iter()
            .map(|s| (s.technical_name.clone(), s))
            .collect();

        let mut compiled = Vec::with_capacity(skills.len());
        for mut skill in skills {
            if let Some(previous) = existing.get(&skill.technical_name) {
                skill.id = previous.id;
                skill.created_at = previous.created_at;
            }
            compiled.push(CompiledSkill::compile(skill)?);
        }

        let incoming: HashSet<&str> = compiled.iter().map(|c| c.technical_name()).collect();
        let union = existing
            .values()
            .filter(|s| !incoming.contains(s.technical_name.as_str()))
            .chain(compiled.iter().map(|c| c.skill()));
        validate_subskill_graph(union)?;

        let mut registered = Vec::with_capacity(compiled.len());
        for compiled in compiled {
            self.repo.save_skill(compiled.skill()).await?;
            let compiled = Arc::new(compiled);
            self.cache
                .insert(compiled.technical_name().to_string(), Arc::clone(&compiled));

            tracing::info!(
                skill = compiled.technical_name(),
                version = %compiled.skill().version,
                state = %compiled.skill().state,
                steps = compiled.skill().steps.len(),
                "skill registered"
            );
            self.event_bus.publish(SkillEvent::SkillRegistered {
                skill_name: compiled.technical_name().to_string(),
                version: compiled.skill().version.clone(),
            });
            registered.push(compiled);
        }
        Ok(registered)
    }

    /// Fetch a compiled skill by technical name.
    pub async fn get(&self, technical_name: &str) -> Result<Arc<CompiledSkill>, SkillError> {
        let cached = self
            .cache
            .get(technical_name)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(cached) = cached {
            return Ok(cached);
        }
        let skill = self
            .repo
            .get_skill(technical_name)
            .await?
            .ok_or_else(|| SkillError::NotFound(technical_name.to_string()))?;
        self.cache_compiled(skill)
    }

    pub async fn get_by_id(&self, id: &SkillId) -> Result<Arc<CompiledSkill>, SkillError> {
        let cached = self
            .cache
            .iter()
            .find(|entry| entry.skill().id == *id)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(cached) = cached {
            return Ok(cached);
        }
        let skill = self
            .repo
            .get_skill_by_id(id)
            .await?
            .ok_or_else(|| SkillError::NotFound(id.to_string()))?;
        self.cache_compiled(skill)
    }

    /// Resolve a reference that is either a skill UUID or a technical name.
    pub async fn resolve(&self, reference: &str) -> Result<Arc<CompiledSkill>, SkillError> {
        match reference.parse::<SkillId>() {
            Ok(id) => self.get_by_id(&id).await,
            Err(_) => self.get(reference).await,
        }
    }

    pub async fn list(&self, state: Option<SkillState>) -> Result<Vec<Skill>, SkillError> {
        Ok(self.repo.list_skills(state).await?)
    }

    /// All active skills, compiled. Used as intent-matching candidates.
    pub async fn active(&self) -> Result<Vec<Arc<CompiledSkill>>, SkillError> {
        let skills = self.repo.list_skills(Some(SkillState::Active)).await?;
        let mut compiled = Vec::with_capacity(skills.len());
        for skill in skills {
            let cached = self
                .cache
                .get(&skill.technical_name)
                .map(|entry| Arc::clone(entry.value()))
                .filter(|c| c.skill().state == SkillState::Active);
            match cached {
                Some(cached) => compiled.push(cached),
                None => compiled.push(self.cache_compiled(skill)?),
            }
        }
        Ok(compiled)
    }

    /// Move a skill through its lifecycle.
    ///
    /// Allowed: draft -> active, active -> deprecated, deprecated -> active.
    pub async fn set_state(
        &self,
        technical_name: &str,
        state: SkillState,
    ) -> Result<Arc<CompiledSkill>, SkillError> {
        let current = self.get(technical_name).await?;
        let from = current.skill().state;
        let allowed = matches!(
            (from, state),
            (SkillState::Draft, SkillState::Active)
                | (SkillState::Active, SkillState::Deprecated)
                | (SkillState::Deprecated, SkillState::Active)
        );
        if from == state {
            return Ok(current);
        }
        if !allowed {
            return Err(SkillError::ValidationError(format!(
                "skill '{technical_name}' cannot move from {from} to {state}"
            )));
        }

        self.repo.set_state(technical_name, state).await?;
        let mut skill = current.skill().clone();
        skill.state = state;
        let compiled = self.cache_compiled(skill)?;
        tracing::info!(skill = technical_name, %from, to = %state, "skill state changed");
        Ok(compiled)
    }

    /// Delete a skill that no other skill references.
    pub async fn remove(&self, technical_name: &str) -> Result<bool, SkillError> {
        let skills = self.repo.list_skills(None).await?;
        let referrer = skills.iter().find(|s| {
            s.technical_name != technical_name
                && s.steps.iter().any(|step| {
                    matches!(&step.kind, StepKind::Subskill { skill, .. } if skill == technical_name)
                })
        });
        if let Some(referrer) = referrer {
            return Err(SkillError::ValidationError(format!(
                "skill '{technical_name}' is used as a subskill by '{}'",
                referrer.technical_name
            )));
        }

        self.cache.remove(technical_name);
        Ok(self.repo.delete_skill(technical_name).await?)
    }

    /// Fold an execution outcome into the skill's statistics.
    pub async fn record_outcome(
        &self,
        technical_name: &str,
        success: bool,
        duration_ms: u64,
    ) -> Result<(), SkillError> {
        self.repo
            .record_outcome(technical_name, success, duration_ms, Utc::now())
            .await?;
        Ok(())
    }

    pub async fn stats(&self, technical_name: &str) -> Result<SkillStats, SkillError> {
        Ok(self.repo.get_stats(technical_name).await?)
    }

    fn cache_compiled(&self, skill: Skill) -> Result<Arc<CompiledSkill>, SkillError> {
        let compiled = Arc::new(CompiledSkill::compile(skill)?);
        self.cache
            .insert(compiled.technical_name().to_string(), Arc::clone(&compiled));
        Ok(compiled)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skill::definition::parse_skill_yaml;
    use crate::testing::InMemorySkillRepository;

    fn skill(yaml: &str) -> Skill {
        parse_skill_yaml(yaml).unwrap()
    }

    fn leaf(name: &str) -> Skill {
        skill(&format!(
            "technical_name: {name}\nname: {name}\nsteps:\n  - {{ id: a, name: A, type: action, action: noop }}\n"
        ))
    }

    fn parent_of(name: &str, child: &str) -> Skill {
        skill(&format!(
            "technical_name: {name}\nname: {name}\nsteps:\n  - {{ id: s, name: S, type: subskill, skill: {child} }}\n"
        ))
    }

    fn registry() -> SkillRegistry<InMemorySkillRepository> {
        SkillRegistry::new(InMemorySkillRepository::new(), EventBus::new(16))
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = registry();
        let mut rx = registry.event_bus.subscribe();

        let compiled = registry.register(leaf("demo")).await.unwrap();
        assert_eq!(compiled.skill().state, SkillState::Draft);
        assert!(matches!(
            rx.recv().await.unwrap(),
            SkillEvent::SkillRegistered { ref skill_name, .. } if skill_name == "demo"
        ));

        let by_name = registry.get("demo").await.unwrap();
        let by_id = registry.resolve(&compiled.skill().id.to_string()).await.unwrap();
        assert_eq!(by_name.skill().id, by_id.skill().id);
        assert!(matches!(
            registry.get("missing").await,
            Err(SkillError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_replacement_keeps_identity() {
        let registry = registry();
        let first = registry.register(leaf("demo")).await.unwrap();
        let second = registry.register(leaf("demo")).await.unwrap();
        assert_eq!(first.skill().id, second.skill().id);
        assert_eq!(registry.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_subskill_must_exist() {
        let registry = registry();
        assert!(matches!(
            registry.register(parent_of("parent", "child")).await,
            Err(SkillError::ValidationError(_))
        ));

        registry
            .register_all(vec![parent_of("parent", "child"), leaf("child")])
            .await
            .unwrap();
        assert!(matches!(
            registry.register(parent_of("child", "parent")).await,
            Err(SkillError::CycleDetected(_))
        ));
        assert!(matches!(
            registry.remove("child").await,
            Err(SkillError::ValidationError(_))
        ));
        assert!(registry.remove("parent").await.unwrap());
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let registry = registry();
        registry.register(leaf("demo")).await.unwrap();
        assert!(registry.active().await.unwrap().is_empty());

        registry.set_state("demo", SkillState::Active).await.unwrap();
        assert_eq!(registry.active().await.unwrap().len(), 1);

        registry.set_state("demo", SkillState::Deprecated).await.unwrap();
        assert!(registry.active().await.unwrap().is_empty());
        assert!(matches!(
            registry.set_state("demo", SkillState::Draft).await,
            Err(SkillError::ValidationError(_))
        ));
        assert_eq!(
            registry.get("demo").await.unwrap().skill().state,
            SkillState::Deprecated
        );
    }

    #[tokio::test]
    async fn test_record_outcome() {
        let registry = registry();
        registry.register(leaf("demo")).await.unwrap();
        registry.record_outcome("demo", true, 100).await.unwrap();
        registry.record_outcome("demo", false, 0).await.unwrap();
        let stats = registry.stats("demo").await.unwrap();
        assert_eq!(stats.execution_count, 2);
        assert_eq!(stats.success_count, 1);
        assert!((stats.avg_duration_ms - 100.0).abs() < f64::EPSILON);
    }
}
