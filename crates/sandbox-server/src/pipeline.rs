//! Request pipeline.
//!
//! Orchestrates the loader, router, validator, rule engine, and schema
//! engine for one request: parse the raw parts, resolve the operation,
//! validate the request, run the matching rules (or fall back to
//! schema-generated data), validate the rendered response, and shape
//! every failure as an `application/problem+json` document. Runtime
//! errors never escape `handle`.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{
    ChaosConfig, DocumentSource, ResponseValidation, SandboxConfig, ValidateConfig,
};
use crate::error::{EngineError, Problem};
use crate::rules::{execute_rules, ActionContext, ResponseDraft, RuleSet};
use crate::schema::{GenerateOptions, SchemaEngine, ValidationIssue};
use crate::spec::{ApiSpec, Operation, ParamLocation};
use crate::store::{create_store, NamespacedStore, StateStore, StoreError, GLOBAL_SESSION};
use crate::template::{EvalLimits, SeededRng, TemplateContext, TemplateEngine};

/// Session-identifying header.
pub const SESSION_HEADER: &str = "x-sandbox-session";
/// Session-identifying cookie.
pub const SESSION_COOKIE: &str = "sandbox_session";
/// Correlation identifier stamped on every response.
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Decoded request body.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Text(String),
    /// JSON content type whose payload did not parse.
    Malformed(String),
}

/// Parsed request value object.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    /// Uppercase method.
    pub method: String,
    /// Percent-decoded path, query string stripped.
    pub path: String,
    /// First value wins for repeated keys.
    pub query: HashMap<String, String>,
    /// Keys lowercased.
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub body: RequestBody,
    /// Filled in after the router matches.
    pub path_params: HashMap<String, String>,
}

impl SandboxRequest {
    /// Parse the raw parts of a request. `target` is the request target
    /// (`/path?query`); `headers` are name/value pairs in wire order.
    pub fn new<I, K, V>(method: &str, target: &str, headers: I, body: &[u8]) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let (raw_path, raw_query) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (target, None),
        };
        let path = urlencoding::decode(raw_path)
            .map(|d| d.into_owned())
            .unwrap_or_else(|_| raw_path.to_string());
        let query = parse_query(raw_query);

        let mut header_map = HashMap::new();
        for (name, value) in headers {
            let name = name.as_ref().to_lowercase();
            // first value wins, matching query semantics
            header_map
                .entry(name)
                .or_insert_with(|| value.as_ref().to_string());
        }
        let cookies = header_map
            .get("cookie")
            .map(|raw| parse_cookies(raw))
            .unwrap_or_default();

        let body = decode_body(&header_map, body);

        SandboxRequest {
            method: method.to_uppercase(),
            path,
            query,
            headers: header_map,
            cookies,
            body,
            path_params: HashMap::new(),
        }
    }

    /// Resolution order: session header, session cookie, opaque
    /// `Authorization` value, the `GLOBAL` sentinel. A present-but-empty
    /// value falls through to the next source like an absent one.
    pub fn session_id(&self) -> String {
        self.headers
            .get(SESSION_HEADER)
            .filter(|s| !s.is_empty())
            .or_else(|| self.cookies.get(SESSION_COOKIE).filter(|s| !s.is_empty()))
            .or_else(|| self.headers.get("authorization").filter(|s| !s.is_empty()))
            .cloned()
            .unwrap_or_else(|| GLOBAL_SESSION.to_string())
    }
}

fn parse_query(raw: Option<&str>) -> HashMap<String, String> {
    let mut query = HashMap::new();
    let Some(raw) = raw else {
        return query;
    };
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = urlencoding::decode(key)
            .map(|d| d.into_owned())
            .unwrap_or_else(|_| key.to_string());
        let value = urlencoding::decode(value)
            .map(|d| d.into_owned())
            .unwrap_or_else(|_| value.to_string());
        query.entry(key).or_insert(value);
    }
    query
}

fn parse_cookies(raw: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for part in raw.split(';') {
        if let Some((name, value)) = part.trim().split_once('=') {
            cookies
                .entry(name.trim().to_string())
                .or_insert_with(|| value.trim().to_string());
        }
    }
    cookies
}

fn decode_body(headers: &HashMap<String, String>, body: &[u8]) -> RequestBody {
    if body.is_empty() {
        return RequestBody::Empty;
    }
    let content_type = headers
        .get("content-type")
        .map(String::as_str)
        .unwrap_or("");
    if content_type.contains("json") {
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => RequestBody::Json(value),
            Err(e) => RequestBody::Malformed(e.to_string()),
        }
    } else {
        RequestBody::Text(String::from_utf8_lossy(body).into_owned())
    }
}

/// Response body: JSON-shaped value or opaque text.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    Json(Value),
    Text(String),
}

/// Response value object with a case-insensitive header map.
#[derive(Debug, Clone)]
pub struct SandboxResponse {
    pub status: u16,
    headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

impl SandboxResponse {
    pub fn new(status: u16, body: ResponseBody) -> Self {
        let mut response = SandboxResponse {
            status,
            headers: Vec::new(),
            body: ResponseBody::Empty,
        };
        match &body {
            ResponseBody::Json(_) => response.set_header("Content-Type", "application/json"),
            ResponseBody::Text(_) => {
                response.set_header("Content-Type", "text/plain; charset=utf-8")
            }
            ResponseBody::Empty => {}
        }
        response.body = body;
        response
    }

    pub fn from_problem(problem: Problem) -> Self {
        let mut response =
            SandboxResponse::new(problem.status, ResponseBody::Json(problem.to_value()));
        response.set_header("Content-Type", "application/problem+json");
        response
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some(slot) = self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            slot.1 = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn body_bytes(&self) -> Vec<u8> {
        match &self.body {
            ResponseBody::Empty => Vec::new(),
            ResponseBody::Json(v) => serde_json::to_vec(v).unwrap_or_default(),
            ResponseBody::Text(s) => s.as_bytes().to_vec(),
        }
    }
}

/// The assembled mock server: spec, rules, store, and engines behind one
/// `handle` entry point.
pub struct Sandbox {
    spec: ApiSpec,
    rules: RuleSet,
    store: Arc<dyn StateStore>,
    schemas: SchemaEngine,
    validate: ValidateConfig,
    seed: String,
    chaos: Option<ChaosConfig>,
    limits: EvalLimits,
    request_timeout: Duration,
}

impl Sandbox {
    pub fn from_config(config: SandboxConfig) -> anyhow::Result<Self> {
        let spec = match &config.oas {
            Some(DocumentSource::Path(path)) => ApiSpec::from_file(path)?,
            Some(DocumentSource::Inline(doc)) => ApiSpec::from_value(doc.clone())?,
            None => anyhow::bail!("configuration is missing the `oas` document"),
        };
        let rules = match &config.scenarios {
            Some(DocumentSource::Path(path)) => RuleSet::from_file(path)?,
            Some(DocumentSource::Inline(doc)) => RuleSet::from_value(doc)?,
            None => RuleSet::default(),
        };
        let store = create_store(&config.store)?;
        Ok(Sandbox::assemble(spec, rules, store, &config))
    }

    /// Assemble from pre-built parts; embedders and tests use this to
    /// supply their own store.
    pub fn with_parts(
        spec: ApiSpec,
        rules: RuleSet,
        store: Arc<dyn StateStore>,
        config: &SandboxConfig,
    ) -> Self {
        Sandbox::assemble(spec, rules, store, config)
    }

    fn assemble(
        spec: ApiSpec,
        rules: RuleSet,
        store: Arc<dyn StateStore>,
        config: &SandboxConfig,
    ) -> Self {
        let schemas = SchemaEngine::new(Arc::clone(&spec.document));
        Sandbox {
            spec,
            rules,
            store,
            schemas,
            validate: config.validate.clone(),
            seed: config.seed.clone().unwrap_or_else(|| "sandbox".to_string()),
            chaos: config.chaos.clone(),
            limits: EvalLimits::default(),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn spec(&self) -> &ApiSpec {
        &self.spec
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.store)
    }

    /// Flush and release the shared store.
    pub fn close(&self) -> Result<(), StoreError> {
        self.store.close()
    }

    /// Serve one request. Runtime failures become problem documents; this
    /// never panics and never returns an error.
    pub async fn handle(&self, mut req: SandboxRequest) -> SandboxResponse {
        let request_id = uuid::Uuid::new_v4().to_string();
        let now_ms = Utc::now().timestamp_millis();
        let session_id = req.session_id();
        debug!(
            request_id = %request_id,
            method = %req.method,
            path = %req.path,
            session = %session_id,
            "request received"
        );

        let outcome = tokio::time::timeout(
            self.request_timeout,
            self.process(&mut req, &request_id, now_ms, &session_id),
        )
        .await
        .unwrap_or(Err(EngineError::Deadline));

        let mut response = match outcome {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    request_id = %request_id,
                    category = err.category(),
                    error = %err,
                    "request failed"
                );
                SandboxResponse::from_problem(err.into_problem(Some(req.path.clone())))
            }
        };
        response.set_header(REQUEST_ID_HEADER, &request_id);
        response
    }

    async fn process(
        &self,
        req: &mut SandboxRequest,
        request_id: &str,
        now_ms: i64,
        session_id: &str,
    ) -> Result<SandboxResponse, EngineError> {
        let (op, path_vars) =
            self.spec
                .resolve(&req.method, &req.path)
                .ok_or_else(|| EngineError::MatchMiss {
                    method: req.method.clone(),
                    path: req.path.clone(),
                })?;
        req.path_params = path_vars;

        if let RequestBody::Malformed(reason) = &req.body {
            return Err(EngineError::RequestInvalid(vec![ValidationIssue {
                instance_path: "/body".into(),
                schema_path: "#".into(),
                keyword: "parse".into(),
                message: format!("request body is not valid JSON: {reason}"),
                params: Value::Object(Map::new()),
            }]));
        }

        if self.validate.requests {
            let issues = self.validate_request(&op, req);
            if !issues.is_empty() {
                return Err(EngineError::RequestInvalid(issues));
            }
        }

        let engine = TemplateEngine::with_limits(
            SeededRng::derive(&self.seed, request_id),
            self.limits.clone(),
        );
        let session_store: Arc<dyn StateStore> = Arc::new(NamespacedStore::for_session(
            Arc::clone(&self.store),
            session_id,
        ));
        let scope = if session_id == GLOBAL_SESSION {
            "global"
        } else {
            "session"
        };
        let tmpl = TemplateContext::new(
            request_value(req),
            json!({"id": session_id, "scope": scope}),
            now_ms,
            Some(session_store),
        );

        if let Some(chaos) = &self.chaos {
            if let Some(latency) = &chaos.latency {
                let delay = engine.with_rng(|rng| latency.sample(rng));
                tokio::time::sleep(delay).await;
            }
            if chaos.error_rate > 0.0 && engine.with_rng(|rng| rng.chance(chaos.error_rate)) {
                info!(request_id = %request_id, operation = %op.id, "chaos error injected");
                return Ok(SandboxResponse::from_problem(
                    Problem::new(500, "urn:sandbox:chaos", "Chaos error injected")
                        .with_instance(req.path.clone()),
                ));
            }
        }

        let selected = self.rules.select(&op, &req.query, &req.headers);
        debug!(
            request_id = %request_id,
            operation = %op.id,
            rules = selected.len(),
            "rules selected"
        );

        let mut ctx = ActionContext {
            engine: &engine,
            tmpl,
            store: Arc::clone(&self.store),
            session_id: session_id.to_string(),
            schemas: &self.schemas,
            generate: GenerateOptions::default(),
            operation: &op,
            request_id: request_id.to_string(),
            response: None,
        };
        execute_rules(&selected, &mut ctx).await?;

        let draft = match ctx.response.take() {
            Some(draft) => draft,
            None => self.default_response(&op, &engine, now_ms),
        };
        let response = finalize(draft);

        if self.validate.responses != ResponseValidation::Off {
            if let Some(issues) = self.validate_response(&op, &response) {
                match self.validate.responses {
                    ResponseValidation::Strict => {
                        return Err(EngineError::ResponseInvalid(issues));
                    }
                    _ => warn!(
                        request_id = %request_id,
                        operation = %op.id,
                        category = "response-invalid",
                        issues = issues.len(),
                        "response does not match the declared schema"
                    ),
                }
            }
        }

        info!(
            request_id = %request_id,
            operation = %op.id,
            status = response.status,
            "request served"
        );
        Ok(response)
    }

    fn validate_request(&self, op: &Operation, req: &SandboxRequest) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        for param in &op.parameters {
            let slot = param.location.slot();
            let actual = match param.location {
                ParamLocation::Path => req.path_params.get(&param.name),
                ParamLocation::Query => req.query.get(&param.name),
                ParamLocation::Header => req.headers.get(&param.name.to_lowercase()),
                ParamLocation::Cookie => req.cookies.get(&param.name),
            };
            match actual {
                None => {
                    if param.required {
                        issues.push(ValidationIssue {
                            instance_path: format!("/{slot}/{}", param.name),
                            schema_path: "#/required".into(),
                            keyword: "required".into(),
                            message: format!(
                                "required {slot} parameter '{}' is missing",
                                param.name
                            ),
                            params: json!({"missingProperty": param.name}),
                        });
                    }
                }
                Some(value) => {
                    if let Some(schema) = &param.schema {
                        let id = format!("{}:{slot}:{}", op.id, param.name);
                        let prefix = format!("/{slot}/{}", param.name);
                        for issue in self.schemas.validate(
                            &id,
                            schema,
                            &Value::String(value.clone()),
                            true,
                        ) {
                            issues.push(issue.prefixed(&prefix));
                        }
                    }
                }
            }
        }

        if let (Some(schema), RequestBody::Json(body)) = (&op.request_body, &req.body) {
            let id = format!("{}:body", op.id);
            for issue in self.schemas.validate(&id, schema, body, false) {
                issues.push(issue.prefixed("/body"));
            }
        }

        issues
    }

    /// When no rule publishes a response: the lexicographically first 2xx
    /// descriptor (preferring `200`), with a body generated from its JSON
    /// schema.
    fn default_response(
        &self,
        op: &Operation,
        engine: &TemplateEngine,
        now_ms: i64,
    ) -> ResponseDraft {
        let opts = GenerateOptions::default();
        match op.default_success_response() {
            Some((status, response_spec)) => {
                let body = response_spec.json_schema().map(|schema| {
                    engine.with_rng(|rng| self.schemas.generate(schema, rng, &opts, now_ms))
                });
                ResponseDraft {
                    status,
                    headers: Vec::new(),
                    body,
                }
            }
            None => ResponseDraft {
                status: 200,
                headers: Vec::new(),
                body: None,
            },
        }
    }

    fn validate_response(
        &self,
        op: &Operation,
        response: &SandboxResponse,
    ) -> Option<Vec<ValidationIssue>> {
        let body = response.json_body()?;
        let response_spec = op.response_for_status(response.status)?;
        let schema = response_spec.json_schema()?;
        let id = format!("{}:response:{}", op.id, response.status);
        let issues: Vec<ValidationIssue> = self
            .schemas
            .validate(&id, schema, body, false)
            .into_iter()
            .map(|issue| issue.prefixed("/body"))
            .collect();
        if issues.is_empty() {
            None
        } else {
            Some(issues)
        }
    }
}

fn request_value(req: &SandboxRequest) -> Value {
    let body = match &req.body {
        RequestBody::Json(v) => v.clone(),
        RequestBody::Text(s) => Value::String(s.clone()),
        _ => Value::Null,
    };
    json!({
        "method": &req.method,
        "path": &req.path,
        "query": &req.query,
        "headers": &req.headers,
        "cookies": &req.cookies,
        "pathParams": &req.path_params,
        "body": body,
    })
}

fn finalize(draft: ResponseDraft) -> SandboxResponse {
    let body = match draft.body {
        None => ResponseBody::Empty,
        Some(Value::String(s)) => ResponseBody::Text(s),
        Some(value) => ResponseBody::Json(value),
    };
    let mut response = SandboxResponse::new(draft.status, body);
    for (name, value) in draft.headers {
        response.set_header(&name, &value);
    }
    response
}
