//! Skill service: the control surface over registry, matcher and engine.
//!
//! Front ends (CLI, REST) talk to this service only. It owns no state of its
//! own beyond the engine and forwards to the component that implements each
//! use case.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use skillforge_types::execution::{Execution, OperationLogEntry};
use skillforge_types::skill::{Skill, SkillState, SkillStats};
use uuid::Uuid;

use crate::engine::executor::{EngineError, ExecutionEngine, StartRequest};
use crate::repository::execution::{ExecutionFilter, ExecutionRepository};
use crate::repository::skill::SkillRepository;
use crate::rollback::ExecutionEnv;
use crate::skill::definition::{CompiledSkill, SkillError, discover_skills, parse_skill_yaml};
use crate::skill::intent::{IntentMatch, MatchContext, match_intent};
use crate::skill::registry::SkillRegistry;

/// Use cases of the skill engine.
///
/// Generic over the repositories so that it runs on SQLite in production and
/// on the in-memory adapters in tests.
pub struct SkillService<E: ExecutionRepository, S: SkillRepository> {
    engine: Arc<ExecutionEngine<E, S>>,
}

impl<E: ExecutionRepository, S: SkillRepository> Clone for SkillService<E, S> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<E: ExecutionRepository, S: SkillRepository> SkillService<E, S> {
    pub fn new(engine: ExecutionEngine<E, S>) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    pub fn engine(&self) -> &ExecutionEngine<E, S> {
        &self.engine
    }

    fn registry(&self) -> &SkillRegistry<S> {
        self.engine.registry()
    }

    // -----------------------------------------------------------------------
    // Skills
    // -----------------------------------------------------------------------

    /// Parse, validate and register a YAML skill definition.
    pub async fn register_yaml(&self, yaml: &str) -> Result<Arc<CompiledSkill>, SkillError> {
        self.registry().register(parse_skill_yaml(yaml)?).await
    }

    pub async fn register(&self, skill: Skill) -> Result<Arc<CompiledSkill>, SkillError> {
        self.registry().register(skill).await
    }

    /// Register every skill file under `dir` as one batch, so skills may
    /// reference each other as subskills regardless of file order.
    pub async fn load_directory(&self, dir: &Path) -> Result<Vec<Arc<CompiledSkill>>, SkillError> {
        let skills: Vec<Skill> = discover_skills(dir)?
            .into_iter()
            .map(|(_, skill)| skill)
            .collect();
        tracing::info!(dir = %dir.display(), count = skills.len(), "loading skills");
        self.registry().register_all(skills).await
    }

    pub async fn list_skills(&self, state: Option<SkillState>) -> Result<Vec<Skill>, SkillError> {
        self.registry().list(state).await
    }

    pub async fn get_skill(&self, reference: &str) -> Result<Arc<CompiledSkill>, SkillError> {
        self.registry().resolve(reference).await
    }

    pub async fn activate(&self, technical_name: &str) -> Result<Arc<CompiledSkill>, SkillError> {
        self.registry().set_state(technical_name, SkillState::Active).await
    }

    pub async fn deprecate(&self, technical_name: &str) -> Result<Arc<CompiledSkill>, SkillError> {
        self.registry()
            .set_state(technical_name, SkillState::Deprecated)
            .await
    }

    pub async fn remove_skill(&self, technical_name: &str) -> Result<bool, SkillError> {
        self.registry().remove(technical_name).await
    }

    pub async fn skill_stats(&self, technical_name: &str) -> Result<SkillStats, SkillError> {
        self.registry().stats(technical_name).await
    }

    // -----------------------------------------------------------------------
    // Intent matching
    // -----------------------------------------------------------------------

    /// Rank active skills against free text. Omitted arguments fall back to
    /// the engine configuration.
    pub async fn match_intent(
        &self,
        text: &str,
        context: Option<&MatchContext>,
        threshold: Option<f64>,
        limit: Option<usize>,
    ) -> Result<Vec<IntentMatch>, SkillError> {
        let config = self.engine.config();
        let candidates = self.registry().active().await?;
        let default_context = MatchContext::default();
        let matches = match_intent(
            text,
            candidates.iter().map(Arc::as_ref),
            context.unwrap_or(&default_context),
            threshold.unwrap_or(config.match_threshold),
            limit.unwrap_or(config.match_limit),
        );
        tracing::debug!(
            text,
            candidates = candidates.len(),
            matches = matches.len(),
            "intent matched"
        );
        Ok(matches)
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    pub async fn start_execution(
        &self,
        request: StartRequest,
        env: &ExecutionEnv,
    ) -> Result<Execution, EngineError> {
        self.engine.start_execution(request, env).await
    }

    /// Answer the pending prompt. The returned record carries the updated
    /// context in `current_context`.
    pub async fn provide_input(
        &self,
        id: Uuid,
        value: Value,
        env: &ExecutionEnv,
    ) -> Result<Execution, EngineError> {
        self.engine.provide_input(id, value, env).await
    }

    pub async fn resume(&self, id: Uuid, env: &ExecutionEnv) -> Result<Execution, EngineError> {
        self.engine.resume(id, env).await
    }

    pub async fn cancel(&self, id: Uuid, reason: Option<String>) -> Result<Execution, EngineError> {
        self.engine.cancel(id, reason).await
    }

    pub async fn rollback(&self, id: Uuid) -> Result<Execution, EngineError> {
        self.engine.rollback(id).await
    }

    pub async fn release(&self, id: Uuid) -> Result<Execution, EngineError> {
        self.engine.release(id).await
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<Execution, EngineError> {
        self.engine.get_execution(id).await
    }

    pub async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>, EngineError> {
        self.engine.list_executions(filter).await
    }

    pub async fn operations(&self, id: Uuid) -> Result<Vec<OperationLogEntry>, EngineError> {
        self.engine.operations(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tool::ToolRouter;
    use crate::event::bus::EventBus;
    use crate::rollback::RollbackManager;
    use crate::testing::{InMemoryExecutionRepository, InMemorySkillRepository};
    use serde_json::json;
    use skillforge_types::config::EngineConfig;
    use skillforge_types::execution::ExecutionState;

    fn service() -> SkillService<InMemoryExecutionRepository, InMemorySkillRepository> {
        let bus = EventBus::default();
        let registry = Arc::new(SkillRegistry::new(InMemorySkillRepository::new(), bus.clone()));
        SkillService::new(ExecutionEngine::new(
            InMemoryExecutionRepository::new(),
            registry,
            Arc::new(ToolRouter::with_builtins()),
            Arc::new(RollbackManager::new()),
            bus,
            EngineConfig::default(),
        ))
    }

    const TOTAL: &str = r#"
technical_name: order_total
name: Order Total
category: sales
trigger_phrases: ["total of order {order}", "sum order lines"]
context_schema:
  properties: [{ name: order, type: string }]
steps:
  - { id: sum, name: Sum, type: tool_call, tool_name: util.sum, params_template: '{"values": {amounts}}', output_variable: total }
"#;

    #[tokio::test]
    async fn test_only_active_skills_match() {
        let service = service();
        service.register_yaml(TOTAL).await.unwrap();
        assert!(service.match_intent("sum order lines", None, None, None).await.unwrap().is_empty());

        service.activate("order_total").await.unwrap();
        let matches = service
            .match_intent("Total of order SO42", None, None, None)
            .await
            .unwrap();
        assert_eq!(matches[0].skill_name, "order_total");
        assert_eq!(matches[0].parameters["order"], json!("SO42"));

        let other = MatchContext {
            category: Some("hr".to_string()),
        };
        assert!(service.match_intent("sum order lines", Some(&other), None, None).await.unwrap().is_empty());

        service.deprecate("order_total").await.unwrap();
        assert!(service.match_intent("sum order lines", None, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_execution_with_builtin_tools() {
        let service = service();
        service.register_yaml(TOTAL).await.unwrap();
        service.activate("order_total").await.unwrap();

        let exec = service
            .start_execution(
                StartRequest::new("order_total").with_input("amounts", json!([1, 2, 3.5])),
                &ExecutionEnv::default(),
            )
            .await
            .unwrap();
        assert_eq!(exec.state, ExecutionState::Completed);
        assert_eq!(exec.current_context["total"], json!(6.5));

        let listed = service.list_executions(&ExecutionFilter::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        let stats = service.skill_stats("order_total").await.unwrap();
        assert_eq!(stats.success_count, 1);
    }
}
