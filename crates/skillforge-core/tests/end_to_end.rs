//! Drives a skill from free text to a terminal state through the service,
//! using the in-memory adapters.

use std::sync::Arc;

use serde_json::json;
use skillforge_core::engine::{EngineError, ExecutionEngine, StartRequest};
use skillforge_core::event::bus::EventBus;
use skillforge_core::rollback::{ExecutionEnv, RollbackError, RollbackManager};
use skillforge_core::service::SkillService;
use skillforge_core::skill::registry::SkillRegistry;
use skillforge_core::testing::{
    InMemoryExecutionRepository, InMemorySkillRepository, InMemoryTransaction,
    ScriptedToolInvoker,
};
use skillforge_types::config::EngineConfig;
use skillforge_types::event::SkillEvent;
use skillforge_types::execution::{ExecutionState, RollbackMode};

const SALES_QUOTE: &str = r#"
technical_name: create_sales_quote
name: Create Sales Quote
category: sales
trigger_phrases: ["create a quote", "new quote for {partner}"]
rollback_on_failure: true
context_schema:
  properties:
    - { name: partner, type: string }
steps:
  - { id: ask, name: Ask partner, sequence: 10, type: user_input, prompt: "Which customer?", variable: partner }
  - { id: create, name: Create, sequence: 20, type: tool_call, tool_name: sale.create_quote, params_template: '{"partner": "{partner}"}', output_variable: quote_id }
  - { id: check, name: Check, sequence: 30, type: condition, expression: quote_id != null, on_failure_step: ask }
"#;

struct World {
    service: SkillService<InMemoryExecutionRepository, InMemorySkillRepository>,
    tools: Arc<ScriptedToolInvoker>,
    bus: EventBus,
}

async fn world() -> World {
    let bus = EventBus::default();
    let registry = Arc::new(SkillRegistry::new(InMemorySkillRepository::new(), bus.clone()));
    let tools = Arc::new(ScriptedToolInvoker::new());
    let service = SkillService::new(ExecutionEngine::new(
        InMemoryExecutionRepository::new(),
        registry,
        tools.clone(),
        Arc::new(RollbackManager::new()),
        bus.clone(),
        EngineConfig::default(),
    ));
    service.register_yaml(SALES_QUOTE).await.unwrap();
    service.activate("create_sales_quote").await.unwrap();
    World { service, tools, bus }
}

#[tokio::test]
async fn quote_from_free_text_to_completion() {
    let w = world().await;
    w.tools.respond("sale.create_quote", json!(42));
    let mut events = w.bus.subscribe();

    let matches = w
        .service
        .match_intent("Create a quotation", None, None, None)
        .await
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].skill_name, "create_sales_quote");
    assert!(matches[0].score > 0.8);

    let transaction = Arc::new(InMemoryTransaction::new());
    let env = ExecutionEnv::for_user("alice").with_transaction(transaction.clone());
    let request = StartRequest::new(matches[0].skill_name.clone())
        .with_trigger_text("Create a quotation");

    let suspended = w.service.start_execution(request, &env).await.unwrap();
    assert_eq!(suspended.state, ExecutionState::WaitingInput);
    let pending = suspended.pending_input.clone().unwrap();
    assert_eq!(pending.step_id, "ask");
    assert_eq!(pending.prompt, "Which customer?");
    assert!(suspended.savepoint_token.as_deref().unwrap().starts_with("sp_"));

    let done = w
        .service
        .provide_input(suspended.id, json!("Acme"), &env)
        .await
        .unwrap();
    assert_eq!(done.state, ExecutionState::Completed);
    assert_eq!(done.current_context["partner"], json!("Acme"));
    assert_eq!(done.current_context["quote_id"], json!(42));
    assert!(done.error_message.is_none());

    let calls = w.tools.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1["partner"], json!("Acme"));

    let ops = w.service.operations(done.id).await.unwrap();
    assert_eq!(ops.len(), 1);

    let mut saw_completed = false;
    while let Ok(event) = events.try_recv() {
        if let SkillEvent::ExecutionCompleted { execution_id, .. } = event {
            saw_completed = execution_id == done.id;
        }
    }
    assert!(saw_completed);

    // Savepoints do not survive the commit of their transaction
    transaction.commit();
    let err = w.service.rollback(done.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Rollback(RollbackError::TransactionClosed(_))
    ));
    let record = w.service.get_execution(done.id).await.unwrap();
    assert_eq!(record.state, ExecutionState::Completed);
}

#[tokio::test]
async fn manual_rollback_inside_open_transaction() {
    let w = world().await;
    w.tools.respond("sale.create_quote", json!(7));

    let transaction = Arc::new(InMemoryTransaction::new());
    let env = ExecutionEnv::for_user("bob").with_transaction(transaction.clone());
    let matches = w
        .service
        .match_intent("new quote for Initech", None, None, None)
        .await
        .unwrap();
    let mut request = StartRequest::new(matches[0].skill_name.clone());
    request.input_data = matches[0].parameters.clone();
    let suspended = w.service.start_execution(request, &env).await.unwrap();
    let done = w
        .service
        .provide_input(suspended.id, json!("Initech"), &env)
        .await
        .unwrap();
    assert_eq!(done.state, ExecutionState::Completed);

    let rolled = w.service.rollback(done.id).await.unwrap();
    assert_eq!(rolled.state, ExecutionState::RolledBack);
    assert_eq!(rolled.rollback_mode, Some(RollbackMode::Savepoint));
    assert_eq!(transaction.rolled_back_to().len(), 1);

    let again = w.service.rollback(done.id).await.unwrap_err();
    assert!(matches!(
        again,
        EngineError::Rollback(RollbackError::AlreadyConsumed(_))
    ));
}

#[tokio::test]
async fn cancel_waiting_execution() {
    let w = world().await;
    let env = ExecutionEnv::default().with_transaction(Arc::new(InMemoryTransaction::new()));
    let suspended = w
        .service
        .start_execution(StartRequest::new("create_sales_quote"), &env)
        .await
        .unwrap();

    let cancelled = w
        .service
        .cancel(suspended.id, Some("customer hung up".to_string()))
        .await
        .unwrap();
    assert_eq!(cancelled.state, ExecutionState::Cancelled);
    assert!(w.tools.calls().is_empty());

    let err = w
        .service
        .provide_input(suspended.id, json!("Acme"), &env)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Transition(_)));
}
