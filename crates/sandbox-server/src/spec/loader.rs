//! OpenAPI document loading and operation indexing.
//!
//! Accepts a file path (JSON or YAML) or an in-memory document. One pass
//! inlines local `#/` references into a deeply cloned tree; dangling and
//! non-local references are load-time errors, while reference cycles are
//! left in place for the schema engine to break at runtime. The operation
//! table is built by iterating every `(path, method)` pair across the
//! eight recognized methods.

use super::operation::{
    select_json_media, synthesize_operation_id, Operation, ParamLocation, ParameterSpec,
    ResponseSpec,
};
use super::path::PathTemplate;
use crate::error::SpecError;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

const METHODS: &[&str] = &[
    "get", "put", "post", "delete", "options", "head", "patch", "trace",
];

/// The loaded specification: resolved document plus the operation index.
pub struct ApiSpec {
    pub document: Arc<Value>,
    operations: Vec<Arc<Operation>>,
    by_id: HashMap<String, usize>,
}

impl ApiSpec {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SpecError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| SpecError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let doc = parse_document(&raw)?;
        Self::from_value(doc)
    }

    pub fn from_value(doc: Value) -> Result<Self, SpecError> {
        if !doc.is_object() {
            return Err(SpecError::Invalid("document is not an object".into()));
        }
        let resolved = inline_local_refs(&doc)?;
        let operations = build_operations(&resolved)?;
        let by_id = operations
            .iter()
            .enumerate()
            .map(|(i, op)| (op.id.clone(), i))
            .collect();
        Ok(ApiSpec {
            document: Arc::new(resolved),
            operations,
            by_id,
        })
    }

    pub fn operations(&self) -> &[Arc<Operation>] {
        &self.operations
    }

    pub fn operation_by_id(&self, id: &str) -> Option<&Arc<Operation>> {
        self.by_id.get(id).map(|i| &self.operations[*i])
    }

    /// Dispatch `(method, path)` to the most specific matching operation
    /// and extract its path variables. Ambiguity resolves to the matcher
    /// with fewer capture variables, then the longer literal template.
    pub fn resolve(
        &self,
        method: &str,
        path: &str,
    ) -> Option<(Arc<Operation>, HashMap<String, String>)> {
        let method = method.to_uppercase();
        let mut best: Option<(&Arc<Operation>, HashMap<String, String>)> = None;
        for op in &self.operations {
            if op.method != method {
                continue;
            }
            let Some(vars) = op.matcher.match_path(path) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((current, _)) => {
                    let lhs = (op.matcher.var_names.len(), std::cmp::Reverse(op.matcher.literal_len));
                    let rhs = (
                        current.matcher.var_names.len(),
                        std::cmp::Reverse(current.matcher.literal_len),
                    );
                    lhs < rhs
                }
            };
            if better {
                best = Some((op, vars));
            }
        }
        best.map(|(op, vars)| (Arc::clone(op), vars))
    }
}

fn parse_document(raw: &str) -> Result<Value, SpecError> {
    // JSON first (it is also valid YAML, but serde_json gives better errors)
    match serde_json::from_str::<Value>(raw) {
        Ok(doc) => Ok(doc),
        Err(json_err) => serde_yaml::from_str::<Value>(raw)
            .map_err(|yaml_err| SpecError::Parse(format!("{json_err}; as YAML: {yaml_err}"))),
    }
}

/// Deep-clone the tree with every local `$ref` inlined. A reference that
/// participates in a cycle is kept as-is; the schema engine carries a
/// per-call stack for those.
fn inline_local_refs(doc: &Value) -> Result<Value, SpecError> {
    let mut stack = Vec::new();
    inline(doc, doc, &mut stack)
}

fn inline(node: &Value, doc: &Value, stack: &mut Vec<String>) -> Result<Value, SpecError> {
    match node {
        Value::Object(map) => {
            if let Some(Value::String(reference)) = map.get("$ref") {
                if !reference.starts_with('#') {
                    return Err(SpecError::NonLocalRef(reference.clone()));
                }
                if stack.iter().any(|r| r == reference) {
                    return Ok(node.clone());
                }
                let target = crate::schema::resolve_pointer(doc, reference)
                    .ok_or_else(|| SpecError::DanglingRef(reference.clone()))?;
                stack.push(reference.clone());
                let resolved = inline(&target.clone(), doc, stack)?;
                stack.pop();
                return Ok(resolved);
            }
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), inline(v, doc, stack)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(inline(item, doc, stack)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

fn build_operations(doc: &Value) -> Result<Vec<Arc<Operation>>, SpecError> {
    let paths = match doc.get("paths") {
        Some(Value::Object(paths)) => paths,
        Some(_) => return Err(SpecError::Invalid("`paths` is not an object".into())),
        None => return Err(SpecError::Invalid("document has no `paths`".into())),
    };

    let mut operations = Vec::new();
    for (path, item) in paths {
        let Some(item) = item.as_object() else {
            continue;
        };
        let path_level_params = item
            .get("parameters")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for method in METHODS {
            let Some(op_node) = item.get(*method).and_then(Value::as_object) else {
                continue;
            };
            let id = op_node
                .get("operationId")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| synthesize_operation_id(method, path));

            let matcher = PathTemplate::compile(path)?;
            let parameters = merge_parameters(
                &path_level_params,
                op_node.get("parameters").and_then(Value::as_array),
            );
            let request_body = op_node
                .get("requestBody")
                .and_then(|rb| rb.get("content"))
                .and_then(Value::as_object)
                .and_then(|content| {
                    let content: BTreeMap<String, Value> = content
                        .iter()
                        .filter_map(|(media, entry)| {
                            entry.get("schema").map(|s| (media.clone(), s.clone()))
                        })
                        .collect();
                    select_json_media(&content).cloned()
                });
            let responses = build_responses(op_node.get("responses"));

            operations.push(Arc::new(Operation {
                id,
                method: method.to_uppercase(),
                path: path.clone(),
                matcher,
                parameters,
                request_body,
                responses,
            }));
        }
    }
    Ok(operations)
}

/// Merge path-level and operation-level parameters; operation-level wins
/// on `(name, location)` collisions.
fn merge_parameters(
    path_level: &[Value],
    op_level: Option<&Vec<Value>>,
) -> Vec<ParameterSpec> {
    let mut merged: Vec<ParameterSpec> = Vec::new();
    let push = |node: &Value, out: &mut Vec<ParameterSpec>| {
        let Some(map) = node.as_object() else {
            return;
        };
        let Some(name) = map.get("name").and_then(Value::as_str) else {
            return;
        };
        let Some(location) = map
            .get("in")
            .and_then(Value::as_str)
            .and_then(ParamLocation::parse)
        else {
            return;
        };
        let required =
            location == ParamLocation::Path || map.get("required") == Some(&Value::Bool(true));
        let spec = ParameterSpec {
            name: name.to_string(),
            location,
            required,
            schema: map.get("schema").cloned(),
        };
        if let Some(existing) = out
            .iter_mut()
            .find(|p| p.name == spec.name && p.location == spec.location)
        {
            *existing = spec;
        } else {
            out.push(spec);
        }
    };

    for node in path_level {
        push(node, &mut merged);
    }
    if let Some(op_level) = op_level {
        for node in op_level {
            push(node, &mut merged);
        }
    }
    merged
}

fn build_responses(node: Option<&Value>) -> BTreeMap<String, ResponseSpec> {
    let mut responses = BTreeMap::new();
    let Some(Value::Object(entries)) = node else {
        return responses;
    };
    for (status, descriptor) in entries {
        let mut spec = ResponseSpec::default();
        if let Some(Value::Object(headers)) = descriptor.get("headers") {
            for (name, header) in headers {
                if let Some(schema) = header.get("schema") {
                    spec.headers.insert(name.clone(), schema.clone());
                }
            }
        }
        if let Some(Value::Object(content)) = descriptor.get("content") {
            for (media, entry) in content {
                if let Some(schema) = entry.get("schema") {
                    spec.content.insert(media.clone(), schema.clone());
                }
            }
        }
        responses.insert(status.clone(), spec);
    }
    responses
}
