//! End-to-end scenarios through the full pipeline: stateful create/read,
//! counters with TTL, session isolation, evaluator safety, and response
//! validation strictness.

use sandbox_server::config::{DocumentSource, SandboxConfig};
use sandbox_server::pipeline::{ResponseBody, Sandbox, SandboxRequest};
use serde_json::{json, Value};

fn users_spec() -> Value {
    json!({
        "openapi": "3.0.3",
        "info": {"title": "users", "version": "1.0.0"},
        "paths": {
            "/users": {
                "post": {
                    "operationId": "createUser",
                    "requestBody": {"content": {"application/json": {"schema": {
                        "type": "object",
                        "required": ["id", "name"],
                        "properties": {
                            "id": {"type": "string"},
                            "name": {"type": "string"},
                        },
                    }}}},
                    "responses": {"201": {"description": "created"}},
                },
            },
            "/users/{id}": {
                "get": {
                    "operationId": "getUser",
                    "parameters": [
                        {"name": "id", "in": "path", "required": true,
                         "schema": {"type": "string"}},
                    ],
                    "responses": {
                        "200": {"description": "found"},
                        "404": {"description": "missing"},
                    },
                },
            },
            "/counter": {
                "post": {
                    "operationId": "incr",
                    "responses": {"200": {"description": "counted"}},
                },
            },
            "/counter/reset": {
                "post": {
                    "operationId": "resetCounter",
                    "responses": {"200": {"description": "reset"}},
                },
            },
            "/kv": {
                "put": {
                    "operationId": "putItem",
                    "requestBody": {"content": {"application/json": {"schema": {
                        "type": "object",
                    }}}},
                    "responses": {"200": {"description": "stored"}},
                },
                "get": {
                    "operationId": "getItem",
                    "responses": {"200": {"description": "fetched"}},
                },
            },
            "/strict": {
                "get": {
                    "operationId": "strictOp",
                    "responses": {"200": {"content": {"application/json": {"schema": {
                        "type": "object",
                        "required": ["ok"],
                        "properties": {"ok": {"type": "boolean"}},
                    }}}}},
                },
            },
            "/generated": {
                "get": {
                    "operationId": "generatedOp",
                    "responses": {"200": {"content": {"application/json": {"schema": {
                        "type": "object",
                        "required": ["id", "color"],
                        "properties": {
                            "id": {"type": "string", "format": "uuid"},
                            "color": {"type": "string", "enum": ["red", "green", "blue"]},
                        },
                    }}}}},
                },
            },
        },
    })
}

fn scenarios() -> Value {
    json!({"scenarios": [
        {"when": {"operationId": "createUser"},
         "do": [
             {"state.set": {"key": "user:{{req.body.id}}",
                            "value": {"id": "{{req.body.id}}", "name": "{{req.body.name}}"}}},
             {"respond": {"status": 201,
                          "body": {"$template": true,
                                   "id": "{{req.body.id}}",
                                   "name": "{{req.body.name}}"}}},
         ]},
        {"when": {"operationId": "getUser"},
         "do": [{"if": {
             "when": "state['user:' + req.pathParams.id]",
             "then": [{"respond": {"status": 200,
                                   "body": "{{state['user:' + req.pathParams.id]}}"}}],
             "else": [{"respond": {"status": 404,
                                   "body": {"error": "User not found"}}}],
         }}]},
        {"when": {"operationId": "incr"},
         "do": [
             {"state.increment": {"key": "c", "by": 1, "as": "n"}},
             {"respond": {"body": {"$template": true, "count": "{{vars.n}}"}}},
         ]},
        {"when": {"operationId": "resetCounter"},
         "do": [
             {"state.set": {"key": "c", "value": 0, "ttl": 1}},
             {"respond": {"status": 200, "body": {"reset": true}}},
         ]},
        {"when": {"operationId": "putItem"},
         "do": [
             {"state.set": {"key": "k", "value": "{{req.body.v}}"}},
             {"respond": {"status": 200, "body": {"stored": true}}},
         ]},
        {"when": {"operationId": "getItem"},
         "do": [{"respond": {"status": 200,
                             "body": {"$template": true, "value": "{{state['k']}}"}}}]},
        {"when": {"operationId": "strictOp"},
         "do": [{"respond": {"status": 200, "body": {"bad": "shape"}}}]},
    ]})
}

fn build_sandbox(responses_mode: &str) -> Sandbox {
    let config: SandboxConfig = serde_json::from_value(json!({
        "oas": users_spec(),
        "scenarios": scenarios(),
        "seed": "scenario-seed",
        "validate": {"requests": true, "responses": responses_mode},
    }))
    .unwrap();
    Sandbox::from_config(config).unwrap()
}

fn request(method: &str, target: &str, session: Option<&str>, body: Option<Value>) -> SandboxRequest {
    let mut headers: Vec<(String, String)> = Vec::new();
    if let Some(session) = session {
        headers.push(("X-Sandbox-Session".into(), session.into()));
    }
    let bytes = match &body {
        Some(value) => {
            headers.push(("Content-Type".into(), "application/json".into()));
            serde_json::to_vec(value).unwrap()
        }
        None => Vec::new(),
    };
    SandboxRequest::new(method, target, headers, &bytes)
}

#[tokio::test]
async fn stateful_create_then_read() {
    let sandbox = build_sandbox("warn");

    let created = sandbox
        .handle(request(
            "POST",
            "/users",
            Some("s1"),
            Some(json!({"id": "42", "name": "Ada"})),
        ))
        .await;
    assert_eq!(created.status, 201);
    assert_eq!(
        created.json_body().unwrap(),
        &json!({"id": "42", "name": "Ada"})
    );

    let found = sandbox
        .handle(request("GET", "/users/42", Some("s1"), None))
        .await;
    assert_eq!(found.status, 200);
    assert_eq!(
        found.json_body().unwrap(),
        &json!({"id": "42", "name": "Ada"})
    );

    let missing = sandbox
        .handle(request("GET", "/users/99", Some("s1"), None))
        .await;
    assert_eq!(missing.status, 404);
    assert_eq!(
        missing.json_body().unwrap(),
        &json!({"error": "User not found"})
    );
}

#[tokio::test]
async fn counter_increments_and_expires() {
    let sandbox = build_sandbox("warn");
    let session = Some("s2");

    for expected in 1..=3 {
        let response = sandbox
            .handle(request("POST", "/counter", session, None))
            .await;
        assert_eq!(response.status, 200);
        assert_eq!(
            response.json_body().unwrap(),
            &json!({"count": expected}),
            "call {expected}"
        );
    }

    // reinstall the key with a one-second TTL and let it lapse
    let reset = sandbox
        .handle(request("POST", "/counter/reset", session, None))
        .await;
    assert_eq!(reset.status, 200);
    tokio::time::sleep(std::time::Duration::from_millis(1_300)).await;

    let after = sandbox
        .handle(request("POST", "/counter", session, None))
        .await;
    assert_eq!(after.json_body().unwrap(), &json!({"count": 1}));
}

#[tokio::test]
async fn sessions_are_isolated() {
    let sandbox = build_sandbox("warn");

    sandbox
        .handle(request("PUT", "/kv", Some("alice"), Some(json!({"v": "from-alice"}))))
        .await;
    sandbox
        .handle(request("PUT", "/kv", Some("bob"), Some(json!({"v": "from-bob"}))))
        .await;
    sandbox
        .handle(request("PUT", "/kv", None, Some(json!({"v": "from-global"}))))
        .await;

    let alice = sandbox.handle(request("GET", "/kv", Some("alice"), None)).await;
    assert_eq!(alice.json_body().unwrap(), &json!({"value": "from-alice"}));

    let bob = sandbox.handle(request("GET", "/kv", Some("bob"), None)).await;
    assert_eq!(bob.json_body().unwrap(), &json!({"value": "from-bob"}));

    // no header, no cookie, no Authorization: the GLOBAL scope
    let global = sandbox.handle(request("GET", "/kv", None, None)).await;
    assert_eq!(global.json_body().unwrap(), &json!({"value": "from-global"}));
}

#[tokio::test]
async fn unmatched_request_is_problem_404() {
    let sandbox = build_sandbox("warn");
    let response = sandbox
        .handle(request("GET", "/not-a-route", None, None))
        .await;
    assert_eq!(response.status, 404);
    assert_eq!(
        response.header("content-type"),
        Some("application/problem+json")
    );
    let body = response.json_body().unwrap();
    assert_eq!(body["status"], 404);
    assert_eq!(body["title"], "Not Found");
    assert!(response.header("x-request-id").is_some());
}

#[tokio::test]
async fn invalid_request_body_is_problem_400_with_details() {
    let sandbox = build_sandbox("warn");
    // name is required by the createUser body schema
    let response = sandbox
        .handle(request("POST", "/users", Some("s1"), Some(json!({"id": "1"}))))
        .await;
    assert_eq!(response.status, 400);
    let body = response.json_body().unwrap();
    assert_eq!(body["status"], 400);
    let details = body["details"].as_array().unwrap();
    assert!(!details.is_empty());
    assert!(details
        .iter()
        .any(|d| d["instancePath"].as_str().unwrap().starts_with("/body")));
}

#[tokio::test]
async fn malformed_json_is_problem_400() {
    let sandbox = build_sandbox("warn");
    let req = SandboxRequest::new(
        "POST",
        "/users",
        vec![("Content-Type".to_string(), "application/json".to_string())],
        b"{broken",
    );
    let response = sandbox.handle(req).await;
    assert_eq!(response.status, 400);
}

#[tokio::test]
async fn strict_response_validation_rejects_bad_body() {
    let strict = build_sandbox("strict");
    let response = strict.handle(request("GET", "/strict", None, None)).await;
    assert_eq!(response.status, 500);
    assert_eq!(
        response.header("content-type"),
        Some("application/problem+json")
    );

    // warn mode sends the mismatching body as-is
    let warn = build_sandbox("warn");
    let response = warn.handle(request("GET", "/strict", None, None)).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.json_body().unwrap(), &json!({"bad": "shape"}));
}

#[tokio::test]
async fn default_response_is_generated_from_schema() {
    let sandbox = build_sandbox("warn");
    let response = sandbox.handle(request("GET", "/generated", None, None)).await;
    assert_eq!(response.status, 200);
    let body = response.json_body().unwrap();
    assert_eq!(body["id"].as_str().unwrap().len(), 36);
    assert!(["red", "green", "blue"].contains(&body["color"].as_str().unwrap()));
}

#[tokio::test]
async fn template_failure_emits_placeholder_verbatim() {
    // a denied expression inside a rendered string must not leak evaluator
    // internals; the source placeholder comes through untouched
    let config: SandboxConfig = serde_json::from_value(json!({
        "oas": users_spec(),
        "scenarios": {"scenarios": [
            {"when": {"operationId": "getItem"},
             "do": [{"respond": {"status": 200,
                                 "body": {"$template": true,
                                          "leak": "{{process.exit(1)}}"}}}]},
        ]},
        "seed": "s",
    }))
    .unwrap();
    let sandbox = Sandbox::from_config(config).unwrap();
    let response = sandbox.handle(request("GET", "/kv", None, None)).await;
    assert_eq!(response.status, 200);
    assert_eq!(
        response.json_body().unwrap(),
        &json!({"leak": "{{process.exit(1)}}"})
    );
}

#[tokio::test]
async fn chaos_error_rate_replaces_response() {
    let config: SandboxConfig = serde_json::from_value(json!({
        "oas": users_spec(),
        "scenarios": scenarios(),
        "seed": "chaos-seed",
        "chaos": {"errorRate": 1.0},
    }))
    .unwrap();
    let sandbox = Sandbox::from_config(config).unwrap();
    let response = sandbox.handle(request("GET", "/generated", None, None)).await;
    assert_eq!(response.status, 500);
    assert_eq!(response.json_body().unwrap()["title"], "Chaos error injected");

    let config: SandboxConfig = serde_json::from_value(json!({
        "oas": users_spec(),
        "scenarios": scenarios(),
        "seed": "chaos-seed",
        "chaos": {"errorRate": 0.0},
    }))
    .unwrap();
    let sandbox = Sandbox::from_config(config).unwrap();
    let response = sandbox.handle(request("GET", "/generated", None, None)).await;
    assert_eq!(response.status, 200);
    assert!(matches!(response.body, ResponseBody::Json(_)));
}

#[tokio::test]
async fn correlation_id_present_on_success_and_failure() {
    let sandbox = build_sandbox("warn");
    let ok = sandbox.handle(request("GET", "/generated", None, None)).await;
    assert!(ok.header("x-request-id").is_some());
    let missing = sandbox.handle(request("GET", "/nope", None, None)).await;
    assert!(missing.header("x-request-id").is_some());
}
