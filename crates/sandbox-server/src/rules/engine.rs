//! Rule action execution.
//!
//! Selected rules run in firing order; actions within a rule run
//! sequentially. State reads through the template context observe writes
//! made earlier in the same action list. Any store or template error
//! aborts the remaining actions and surfaces as a 500-class problem.

use super::{Action, EmitLevel, Rule, RespondAction, Scope};
use crate::error::EngineError;
use crate::schema::{GenerateOptions, SchemaEngine};
use crate::spec::Operation;
use crate::store::{NamespacedStore, StateStore};
use crate::template::{TemplateContext, TemplateEngine};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::Arc;
use tracing::{error, info, warn};

/// The response a rule publishes; the pipeline finalizes and emits it.
#[derive(Debug, Clone)]
pub struct ResponseDraft {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

/// Everything one request's rule execution needs, wired by the pipeline.
pub struct ActionContext<'a> {
    pub engine: &'a TemplateEngine,
    pub tmpl: TemplateContext,
    /// The shared, un-namespaced store; actions pick their scope per call.
    pub store: Arc<dyn StateStore>,
    pub session_id: String,
    pub schemas: &'a SchemaEngine,
    pub generate: GenerateOptions,
    pub operation: &'a Operation,
    pub request_id: String,
    pub response: Option<ResponseDraft>,
}

impl ActionContext<'_> {
    fn scoped(&self, scope: Option<Scope>) -> NamespacedStore {
        match scope {
            Some(Scope::Global) => NamespacedStore::global(Arc::clone(&self.store)),
            _ => NamespacedStore::for_session(Arc::clone(&self.store), &self.session_id),
        }
    }
}

/// Run every selected rule's actions in order.
pub async fn execute_rules(
    rules: &[Arc<Rule>],
    ctx: &mut ActionContext<'_>,
) -> Result<(), EngineError> {
    for rule in rules {
        execute_actions(&rule.actions, ctx).await?;
    }
    Ok(())
}

fn execute_actions<'a, 'b>(
    actions: &'a [Action],
    ctx: &'a mut ActionContext<'b>,
) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + 'a>>
where
    'b: 'a,
{
    Box::pin(async move {
        for action in actions {
            match action {
                Action::Respond(respond) => apply_respond(respond, ctx)?,
                Action::StateSet(set) => {
                    let key = ctx.engine.render(&set.key, &ctx.tmpl);
                    let value = ctx.engine.deep_render(&set.value, &ctx.tmpl);
                    ctx.scoped(set.scope).set(&key, value, set.ttl)?;
                }
                Action::StatePatch(patch) => {
                    let key = ctx.engine.render(&patch.key, &ctx.tmpl);
                    let value = ctx.engine.deep_render(&patch.value, &ctx.tmpl);
                    ctx.scoped(patch.scope).patch(&key, value)?;
                }
                Action::StateIncrement(increment) => {
                    let key = ctx.engine.render(&increment.key, &ctx.tmpl);
                    let result = ctx.scoped(increment.scope).increment(&key, increment.by)?;
                    if let Some(name) = &increment.as_var {
                        ctx.tmpl.vars.insert(name.clone(), result);
                    }
                }
                Action::StateDel(del) => {
                    let key = ctx.engine.render(&del.key, &ctx.tmpl);
                    ctx.scoped(del.scope).del(&key)?;
                }
                Action::Delay(spec) => {
                    let duration = ctx.engine.with_rng(|rng| spec.sample(rng));
                    tokio::time::sleep(duration).await;
                }
                Action::If(branch) => {
                    let condition = ctx.engine.evaluate(&branch.when, &ctx.tmpl)?;
                    if crate::template::truthy(&condition) {
                        execute_actions(&branch.then, ctx).await?;
                    } else {
                        execute_actions(&branch.else_, ctx).await?;
                    }
                }
                Action::Proxy(_) => {
                    warn!(
                        request_id = %ctx.request_id,
                        operation = %ctx.operation.id,
                        "proxy action is not implemented, skipping"
                    );
                }
                Action::Emit(emit) => {
                    let message = ctx.engine.render(&emit.message, &ctx.tmpl);
                    match emit.level {
                        EmitLevel::Info => info!(
                            request_id = %ctx.request_id,
                            operation = %ctx.operation.id,
                            "{message}"
                        ),
                        EmitLevel::Warn => warn!(
                            request_id = %ctx.request_id,
                            operation = %ctx.operation.id,
                            "{message}"
                        ),
                        EmitLevel::Error => error!(
                            request_id = %ctx.request_id,
                            operation = %ctx.operation.id,
                            "{message}"
                        ),
                    }
                }
            }
        }
        Ok(())
    })
}

fn apply_respond(
    respond: &RespondAction,
    ctx: &mut ActionContext<'_>,
) -> Result<(), EngineError> {
    let status = respond
        .status
        .unwrap_or_else(|| ctx.operation.default_success_status());

    let mut headers = Vec::with_capacity(respond.headers.len());
    for (name, value) in &respond.headers {
        headers.push((name.clone(), ctx.engine.render(value, &ctx.tmpl)));
    }

    // A bare string body always renders; composite bodies template only
    // when the `$template: true` marker is present.
    let mut body = respond.body.as_ref().map(|b| match b {
        Value::String(s) => ctx.engine.render_value(s, &ctx.tmpl),
        other => ctx.engine.process_template(other, &ctx.tmpl),
    });

    if let Some(schema) = &respond.schema {
        match &body {
            Some(rendered) => {
                let issues =
                    ctx.schemas
                        .validate(&schema_cache_id(schema), schema, rendered, false);
                if !issues.is_empty() {
                    return Err(EngineError::RuleFailure(format!(
                        "respond body failed schema validation: {}",
                        issues
                            .iter()
                            .map(|i| format!("{}: {}", i.instance_path, i.message))
                            .collect::<Vec<_>>()
                            .join("; ")
                    )));
                }
            }
            None => {
                let now_ms = ctx.tmpl.now_ms;
                let generated = ctx.engine.with_rng(|rng| {
                    ctx.schemas.generate(schema, rng, &ctx.generate, now_ms)
                });
                body = Some(generated);
            }
        }
    }

    ctx.response = Some(ResponseDraft {
        status,
        headers,
        body,
    });
    Ok(())
}

/// Validator-cache identifier for a rule-supplied schema: a fingerprint of
/// the schema content.
fn schema_cache_id(schema: &Value) -> String {
    let mut hasher = DefaultHasher::new();
    schema.to_string().hash(&mut hasher);
    format!("rule-schema:{:x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryStoreConfig;
    use crate::rules::RuleSet;
    use crate::spec::PathTemplate;
    use crate::store::MemoryStore;
    use crate::template::SeededRng;
    use serde_json::json;

    fn operation() -> Operation {
        Operation {
            id: "createUser".into(),
            method: "POST".into(),
            path: "/users".into(),
            matcher: PathTemplate::compile("/users").unwrap(),
            parameters: vec![],
            request_body: None,
            responses: Default::default(),
        }
    }

    fn context<'a>(
        op: &'a Operation,
        engine: &'a TemplateEngine,
        schemas: &'a SchemaEngine,
        store: Arc<dyn StateStore>,
        session_id: &str,
    ) -> ActionContext<'a> {
        let session_store: Arc<dyn StateStore> =
            Arc::new(NamespacedStore::for_session(Arc::clone(&store), session_id));
        let req = json!({
            "method": "POST",
            "path": "/users",
            "query": {},
            "headers": {},
            "cookies": {},
            "pathParams": {},
            "body": {"id": "42", "name": "Ada"},
        });
        let session = json!({"id": session_id, "scope": "session"});
        let tmpl = TemplateContext::new(req, session, 1_700_000_000_000, Some(session_store));
        ActionContext {
            engine,
            tmpl,
            store,
            session_id: session_id.to_string(),
            schemas,
            generate: GenerateOptions::default(),
            operation: op,
            request_id: "req-test".into(),
            response: None,
        }
    }

    fn rules_for(doc: serde_json::Value) -> Vec<Arc<Rule>> {
        let set = RuleSet::from_value(&doc).unwrap();
        let op = operation();
        set.select(&op, &Default::default(), &Default::default())
    }

    #[tokio::test]
    async fn test_stateful_create_flow() {
        let op = operation();
        let engine = TemplateEngine::new(SeededRng::from_seed_str("t"));
        let schemas = SchemaEngine::new(Arc::new(Value::Null));
        let store: Arc<dyn StateStore> =
            Arc::new(MemoryStore::new(MemoryStoreConfig::default()));
        let mut ctx = context(&op, &engine, &schemas, Arc::clone(&store), "s-1");

        let rules = rules_for(json!({"scenarios": [{
            "when": {"operationId": "createUser"},
            "do": [
                {"state.set": {"key": "user:{{req.body.id}}",
                               "value": {"id": "{{req.body.id}}", "name": "{{req.body.name}}"}}},
                {"respond": {"status": 201,
                             "body": {"$template": true,
                                      "id": "{{req.body.id}}",
                                      "name": "{{req.body.name}}"}}},
            ],
        }]}));
        execute_rules(&rules, &mut ctx).await.unwrap();

        let draft = ctx.response.unwrap();
        assert_eq!(draft.status, 201);
        assert_eq!(draft.body.unwrap(), json!({"id": "42", "name": "Ada"}));
        // the write went through the session namespace
        assert_eq!(
            store.get("session:s-1:user:42").unwrap(),
            Some(json!({"id": "42", "name": "Ada"}))
        );
    }

    #[tokio::test]
    async fn test_increment_binds_vars() {
        let op = operation();
        let engine = TemplateEngine::new(SeededRng::from_seed_str("t"));
        let schemas = SchemaEngine::new(Arc::new(Value::Null));
        let store: Arc<dyn StateStore> =
            Arc::new(MemoryStore::new(MemoryStoreConfig::default()));

        let rules = rules_for(json!({"scenarios": [{
            "when": {"operationId": "createUser"},
            "do": [
                {"state.increment": {"key": "c", "by": 1, "as": "n"}},
                {"respond": {"body": {"$template": true, "count": "{{vars.n}}"}}},
            ],
        }]}));

        for expected in 1..=3 {
            let mut ctx = context(&op, &engine, &schemas, Arc::clone(&store), "s-1");
            execute_rules(&rules, &mut ctx).await.unwrap();
            let body = ctx.response.unwrap().body.unwrap();
            assert_eq!(body, json!({"count": expected}));
        }
    }

    #[tokio::test]
    async fn test_if_branches_on_state() {
        let op = operation();
        let engine = TemplateEngine::new(SeededRng::from_seed_str("t"));
        let schemas = SchemaEngine::new(Arc::new(Value::Null));
        let store: Arc<dyn StateStore> =
            Arc::new(MemoryStore::new(MemoryStoreConfig::default()));

        let rules = rules_for(json!({"scenarios": [{
            "when": {"operationId": "createUser"},
            "do": [{"if": {
                "when": "state['flag']",
                "then": [{"respond": {"status": 200}}],
                "else": [{"respond": {"status": 404}}],
            }}],
        }]}));

        let mut ctx = context(&op, &engine, &schemas, Arc::clone(&store), "s-1");
        execute_rules(&rules, &mut ctx).await.unwrap();
        assert_eq!(ctx.response.as_ref().unwrap().status, 404);

        store.set("session:s-1:flag", json!(true), None).unwrap();
        let mut ctx = context(&op, &engine, &schemas, Arc::clone(&store), "s-1");
        execute_rules(&rules, &mut ctx).await.unwrap();
        assert_eq!(ctx.response.as_ref().unwrap().status, 200);
    }

    #[tokio::test]
    async fn test_read_your_writes_within_action_list() {
        let op = operation();
        let engine = TemplateEngine::new(SeededRng::from_seed_str("t"));
        let schemas = SchemaEngine::new(Arc::new(Value::Null));
        let store: Arc<dyn StateStore> =
            Arc::new(MemoryStore::new(MemoryStoreConfig::default()));
        let mut ctx = context(&op, &engine, &schemas, Arc::clone(&store), "s-1");

        let rules = rules_for(json!({"scenarios": [{
            "when": {"operationId": "createUser"},
            "do": [
                {"state.set": {"key": "greeting", "value": "hello"}},
                {"respond": {"body": {"$template": true, "msg": "{{state['greeting']}}"}}},
            ],
        }]}));
        execute_rules(&rules, &mut ctx).await.unwrap();
        assert_eq!(
            ctx.response.unwrap().body.unwrap(),
            json!({"msg": "hello"})
        );
    }

    #[tokio::test]
    async fn test_global_scope_writes_global_namespace() {
        let op = operation();
        let engine = TemplateEngine::new(SeededRng::from_seed_str("t"));
        let schemas = SchemaEngine::new(Arc::new(Value::Null));
        let store: Arc<dyn StateStore> =
            Arc::new(MemoryStore::new(MemoryStoreConfig::default()));
        let mut ctx = context(&op, &engine, &schemas, Arc::clone(&store), "s-1");

        let rules = rules_for(json!({"scenarios": [{
            "when": {"operationId": "createUser"},
            "do": [{"state.set": {"key": "k", "value": 1, "scope": "global"}}],
        }]}));
        execute_rules(&rules, &mut ctx).await.unwrap();
        assert_eq!(store.get("global:k").unwrap(), Some(json!(1)));
        assert_eq!(store.get("session:s-1:k").unwrap(), None);
    }

    #[tokio::test]
    async fn test_respond_schema_generates_absent_body() {
        let op = operation();
        let engine = TemplateEngine::new(SeededRng::from_seed_str("t"));
        let schemas = SchemaEngine::new(Arc::new(Value::Null));
        let store: Arc<dyn StateStore> =
            Arc::new(MemoryStore::new(MemoryStoreConfig::default()));
        let mut ctx = context(&op, &engine, &schemas, store, "s-1");

        let rules = rules_for(json!({"scenarios": [{
            "when": {"operationId": "createUser"},
            "do": [{"respond": {"$schema": {
                "type": "object",
                "required": ["id"],
                "properties": {"id": {"type": "string", "format": "uuid"}},
            }}}],
        }]}));
        execute_rules(&rules, &mut ctx).await.unwrap();
        let body = ctx.response.unwrap().body.unwrap();
        assert_eq!(body["id"].as_str().unwrap().len(), 36);
    }

    #[tokio::test]
    async fn test_respond_schema_rejects_invalid_body() {
        let op = operation();
        let engine = TemplateEngine::new(SeededRng::from_seed_str("t"));
        let schemas = SchemaEngine::new(Arc::new(Value::Null));
        let store: Arc<dyn StateStore> =
            Arc::new(MemoryStore::new(MemoryStoreConfig::default()));
        let mut ctx = context(&op, &engine, &schemas, store, "s-1");

        let rules = rules_for(json!({"scenarios": [{
            "when": {"operationId": "createUser"},
            "do": [{"respond": {
                "body": {"id": 7},
                "$schema": {"type": "object", "properties": {"id": {"type": "string"}}},
            }}],
        }]}));
        let result = execute_rules(&rules, &mut ctx).await;
        assert!(matches!(result, Err(EngineError::RuleFailure(_))));
    }

    #[tokio::test]
    async fn test_delay_action_sleeps() {
        let op = operation();
        let engine = TemplateEngine::new(SeededRng::from_seed_str("t"));
        let schemas = SchemaEngine::new(Arc::new(Value::Null));
        let store: Arc<dyn StateStore> =
            Arc::new(MemoryStore::new(MemoryStoreConfig::default()));
        let mut ctx = context(&op, &engine, &schemas, store, "s-1");

        let rules = rules_for(json!({"scenarios": [{
            "when": {"operationId": "createUser"},
            "do": [{"delay": 30}, {"respond": {"status": 204}}],
        }]}));
        let started = std::time::Instant::now();
        execute_rules(&rules, &mut ctx).await.unwrap();
        assert!(started.elapsed() >= std::time::Duration::from_millis(30));
        assert_eq!(ctx.response.unwrap().status, 204);
    }

    #[tokio::test]
    async fn test_proxy_is_noop() {
        let op = operation();
        let engine = TemplateEngine::new(SeededRng::from_seed_str("t"));
        let schemas = SchemaEngine::new(Arc::new(Value::Null));
        let store: Arc<dyn StateStore> =
            Arc::new(MemoryStore::new(MemoryStoreConfig::default()));
        let mut ctx = context(&op, &engine, &schemas, store, "s-1");

        let rules = rules_for(json!({"scenarios": [{
            "when": {"operationId": "createUser"},
            "do": [{"proxy": {"to": "https://upstream.example"}},
                   {"respond": {"status": 200}}],
        }]}));
        execute_rules(&rules, &mut ctx).await.unwrap();
        assert_eq!(ctx.response.unwrap().status, 200);
    }
}
