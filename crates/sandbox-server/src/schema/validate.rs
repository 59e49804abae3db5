//! Permissive JSON Schema validation.
//!
//! Covers the subset of JSON Schema that OpenAPI documents use and accepts
//! OpenAPI-specific keywords (`nullable`, `example`, format names like
//! `int32` or `password`) without complaint. Unknown keywords are ignored.
//! String-valued numerics coerce when validating query/header/cookie slots.
//! Errors flatten to `(instancePath, schemaPath, keyword, message, params)`
//! tuples.

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// One flattened validation error.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub instance_path: String,
    pub schema_path: String,
    pub keyword: String,
    pub message: String,
    pub params: Value,
}

impl ValidationIssue {
    fn new(
        instance_path: &str,
        schema_path: &str,
        keyword: &str,
        message: impl Into<String>,
        params: Value,
    ) -> Self {
        ValidationIssue {
            instance_path: instance_path.to_string(),
            schema_path: schema_path.to_string(),
            keyword: keyword.to_string(),
            message: message.into(),
            params,
        }
    }

    /// Prefix the instance path with a request/response slot
    /// (`/query/page`, `/body`, ...).
    pub fn prefixed(mut self, prefix: &str) -> Self {
        self.instance_path = format!("{}{}", prefix, self.instance_path);
        self
    }
}

/// A schema with its regex patterns compiled once.
pub struct CompiledSchema {
    pub schema: Value,
    patterns: HashMap<String, Regex>,
}

impl CompiledSchema {
    pub fn compile(schema: Value) -> Self {
        let mut patterns = HashMap::new();
        collect_patterns(&schema, &mut patterns);
        CompiledSchema { schema, patterns }
    }

    /// Validate `value`, optionally coercing string scalars first (used
    /// for parameter slots, where everything arrives as text).
    pub fn validate(&self, doc: &Value, value: &Value, coerce: bool) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let target;
        let value = if coerce {
            target = coerce_scalar(&self.schema, doc, value);
            &target
        } else {
            value
        };
        let mut walker = Walker {
            doc,
            patterns: &self.patterns,
            ref_stack: Vec::new(),
        };
        walker.validate(&self.schema, value, "", "#", &mut issues);
        issues
    }
}

fn collect_patterns(schema: &Value, out: &mut HashMap<String, Regex>) {
    match schema {
        Value::Object(map) => {
            if let Some(Value::String(p)) = map.get("pattern") {
                if !out.contains_key(p) {
                    if let Ok(re) = Regex::new(p) {
                        out.insert(p.clone(), re);
                    }
                }
            }
            for v in map.values() {
                collect_patterns(v, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_patterns(v, out);
            }
        }
        _ => {}
    }
}

/// Coerce a string scalar toward the schema's declared type. Values that
/// do not parse are left as-is so the type keyword reports the mismatch.
pub fn coerce_scalar(schema: &Value, doc: &Value, value: &Value) -> Value {
    let schema = match resolve_ref_once(schema, doc) {
        Some(resolved) => resolved,
        None => return value.clone(),
    };
    let Value::String(s) = value else {
        return value.clone();
    };
    match schema.get("type").and_then(Value::as_str) {
        Some("integer") => s
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| value.clone()),
        Some("number") => s
            .parse::<f64>()
            .ok()
            .and_then(|n| serde_json::Number::from_f64(n).map(Value::Number))
            .unwrap_or_else(|| value.clone()),
        Some("boolean") => match s.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => value.clone(),
        },
        _ => value.clone(),
    }
}

fn resolve_ref_once<'a>(schema: &'a Value, doc: &'a Value) -> Option<&'a Value> {
    match schema.get("$ref").and_then(Value::as_str) {
        Some(reference) => resolve_pointer(doc, reference),
        None => Some(schema),
    }
}

/// Resolve a local `#/...` pointer against the loaded document.
/// serde_json's `pointer()` handles the ~0/~1 escapes.
pub fn resolve_pointer<'a>(doc: &'a Value, reference: &str) -> Option<&'a Value> {
    let pointer = reference.strip_prefix('#')?;
    if pointer.is_empty() {
        return Some(doc);
    }
    doc.pointer(pointer)
}

struct Walker<'a> {
    doc: &'a Value,
    patterns: &'a HashMap<String, Regex>,
    ref_stack: Vec<String>,
}

impl<'a> Walker<'a> {
    fn validate(
        &mut self,
        schema: &Value,
        value: &Value,
        instance_path: &str,
        schema_path: &str,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let map = match schema {
            Value::Bool(true) => return,
            Value::Bool(false) => {
                issues.push(ValidationIssue::new(
                    instance_path,
                    schema_path,
                    "false",
                    "schema forbids any value",
                    Value::Object(Map::new()),
                ));
                return;
            }
            Value::Object(map) => map,
            _ => return,
        };

        if let Some(reference) = map.get("$ref").and_then(Value::as_str) {
            if self.ref_stack.iter().any(|r| r == reference) {
                // cycle: give up on this branch rather than recurse forever
                return;
            }
            match resolve_pointer(self.doc, reference) {
                Some(resolved) => {
                    self.ref_stack.push(reference.to_string());
                    let resolved = resolved.clone();
                    self.validate(&resolved, value, instance_path, schema_path, issues);
                    self.ref_stack.pop();
                }
                None => issues.push(ValidationIssue::new(
                    instance_path,
                    &format!("{schema_path}/$ref"),
                    "$ref",
                    format!("unresolvable reference {reference}"),
                    serde_json::json!({"ref": reference}),
                )),
            }
            return;
        }

        // nullable short-circuits everything else
        if value.is_null() && map.get("nullable") == Some(&Value::Bool(true)) {
            return;
        }

        self.check_type(map, value, instance_path, schema_path, issues);
        self.check_enum_const(map, value, instance_path, schema_path, issues);
        self.check_number(map, value, instance_path, schema_path, issues);
        self.check_string(map, value, instance_path, schema_path, issues);
        self.check_array(map, value, instance_path, schema_path, issues);
        self.check_object(map, value, instance_path, schema_path, issues);
        self.check_composition(map, value, instance_path, schema_path, issues);
    }

    fn check_type(
        &mut self,
        map: &Map<String, Value>,
        value: &Value,
        instance_path: &str,
        schema_path: &str,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let Some(declared) = map.get("type") else {
            return;
        };
        let allowed: Vec<&str> = match declared {
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            _ => return,
        };
        let matches = allowed.iter().any(|t| type_matches(t, value))
            || (value.is_null() && map.get("nullable") == Some(&Value::Bool(true)));
        if !matches {
            issues.push(ValidationIssue::new(
                instance_path,
                &format!("{schema_path}/type"),
                "type",
                format!("must be {}", allowed.join(" or ")),
                serde_json::json!({"type": allowed}),
            ));
        }
    }

    fn check_enum_const(
        &mut self,
        map: &Map<String, Value>,
        value: &Value,
        instance_path: &str,
        schema_path: &str,
        issues: &mut Vec<ValidationIssue>,
    ) {
        if let Some(Value::Array(allowed)) = map.get("enum") {
            if !allowed.contains(value) {
                issues.push(ValidationIssue::new(
                    instance_path,
                    &format!("{schema_path}/enum"),
                    "enum",
                    "must be equal to one of the allowed values",
                    serde_json::json!({"allowedValues": allowed}),
                ));
            }
        }
        if let Some(expected) = map.get("const") {
            if value != expected {
                issues.push(ValidationIssue::new(
                    instance_path,
                    &format!("{schema_path}/const"),
                    "const",
                    "must be equal to constant",
                    serde_json::json!({"allowedValue": expected}),
                ));
            }
        }
    }

    fn check_number(
        &mut self,
        map: &Map<String, Value>,
        value: &Value,
        instance_path: &str,
        schema_path: &str,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let Some(n) = value.as_f64() else {
            return;
        };
        // exclusive bounds come in both the 3.0 boolean form and the
        // 2020-12 numeric form
        let exclusive_min_flag = map.get("exclusiveMinimum") == Some(&Value::Bool(true));
        let exclusive_max_flag = map.get("exclusiveMaximum") == Some(&Value::Bool(true));

        if let Some(min) = map.get("minimum").and_then(Value::as_f64) {
            let failed = if exclusive_min_flag { n <= min } else { n < min };
            if failed {
                let op = if exclusive_min_flag { ">" } else { ">=" };
                issues.push(ValidationIssue::new(
                    instance_path,
                    &format!("{schema_path}/minimum"),
                    "minimum",
                    format!("must be {op} {min}"),
                    serde_json::json!({"limit": min}),
                ));
            }
        }
        if let Some(min) = map.get("exclusiveMinimum").and_then(Value::as_f64) {
            if n <= min {
                issues.push(ValidationIssue::new(
                    instance_path,
                    &format!("{schema_path}/exclusiveMinimum"),
                    "exclusiveMinimum",
                    format!("must be > {min}"),
                    serde_json::json!({"limit": min}),
                ));
            }
        }
        if let Some(max) = map.get("maximum").and_then(Value::as_f64) {
            let failed = if exclusive_max_flag { n >= max } else { n > max };
            if failed {
                let op = if exclusive_max_flag { "<" } else { "<=" };
                issues.push(ValidationIssue::new(
                    instance_path,
                    &format!("{schema_path}/maximum"),
                    "maximum",
                    format!("must be {op} {max}"),
                    serde_json::json!({"limit": max}),
                ));
            }
        }
        if let Some(max) = map.get("exclusiveMaximum").and_then(Value::as_f64) {
            if n >= max {
                issues.push(ValidationIssue::new(
                    instance_path,
                    &format!("{schema_path}/exclusiveMaximum"),
                    "exclusiveMaximum",
                    format!("must be < {max}"),
                    serde_json::json!({"limit": max}),
                ));
            }
        }
        if let Some(divisor) = map.get("multipleOf").and_then(Value::as_f64) {
            if divisor > 0.0 {
                let quotient = n / divisor;
                if (quotient - quotient.round()).abs() > 1e-9 {
                    issues.push(ValidationIssue::new(
                        instance_path,
                        &format!("{schema_path}/multipleOf"),
                        "multipleOf",
                        format!("must be multiple of {divisor}"),
                        serde_json::json!({"multipleOf": divisor}),
                    ));
                }
            }
        }
        if map.get("type").and_then(Value::as_str) == Some("integer") && n.fract() != 0.0 {
            issues.push(ValidationIssue::new(
                instance_path,
                &format!("{schema_path}/type"),
                "type",
                "must be integer",
                serde_json::json!({"type": "integer"}),
            ));
        }
    }

    fn check_string(
        &mut self,
        map: &Map<String, Value>,
        value: &Value,
        instance_path: &str,
        schema_path: &str,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let Some(s) = value.as_str() else {
            return;
        };
        let len = s.chars().count();
        if let Some(min) = map.get("minLength").and_then(Value::as_u64) {
            if (len as u64) < min {
                issues.push(ValidationIssue::new(
                    instance_path,
                    &format!("{schema_path}/minLength"),
                    "minLength",
                    format!("must NOT have fewer than {min} characters"),
                    serde_json::json!({"limit": min}),
                ));
            }
        }
        if let Some(max) = map.get("maxLength").and_then(Value::as_u64) {
            if (len as u64) > max {
                issues.push(ValidationIssue::new(
                    instance_path,
                    &format!("{schema_path}/maxLength"),
                    "maxLength",
                    format!("must NOT have more than {max} characters"),
                    serde_json::json!({"limit": max}),
                ));
            }
        }
        if let Some(pattern) = map.get("pattern").and_then(Value::as_str) {
            let matched = match self.patterns.get(pattern) {
                Some(re) => re.is_match(s),
                None => Regex::new(pattern).map(|re| re.is_match(s)).unwrap_or(true),
            };
            if !matched {
                issues.push(ValidationIssue::new(
                    instance_path,
                    &format!("{schema_path}/pattern"),
                    "pattern",
                    format!("must match pattern \"{pattern}\""),
                    serde_json::json!({"pattern": pattern}),
                ));
            }
        }
    }

    fn check_array(
        &mut self,
        map: &Map<String, Value>,
        value: &Value,
        instance_path: &str,
        schema_path: &str,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let Some(items) = value.as_array() else {
            return;
        };
        if let Some(min) = map.get("minItems").and_then(Value::as_u64) {
            if (items.len() as u64) < min {
                issues.push(ValidationIssue::new(
                    instance_path,
                    &format!("{schema_path}/minItems"),
                    "minItems",
                    format!("must NOT have fewer than {min} items"),
                    serde_json::json!({"limit": min}),
                ));
            }
        }
        if let Some(max) = map.get("maxItems").and_then(Value::as_u64) {
            if (items.len() as u64) > max {
                issues.push(ValidationIssue::new(
                    instance_path,
                    &format!("{schema_path}/maxItems"),
                    "maxItems",
                    format!("must NOT have more than {max} items"),
                    serde_json::json!({"limit": max}),
                ));
            }
        }
        if map.get("uniqueItems") == Some(&Value::Bool(true)) {
            for (i, item) in items.iter().enumerate() {
                if items[..i].contains(item) {
                    issues.push(ValidationIssue::new(
                        instance_path,
                        &format!("{schema_path}/uniqueItems"),
                        "uniqueItems",
                        "must NOT have duplicate items",
                        serde_json::json!({"duplicateIndex": i}),
                    ));
                    break;
                }
            }
        }
        if let Some(item_schema) = map.get("items") {
            let item_schema = item_schema.clone();
            for (i, item) in items.iter().enumerate() {
                self.validate(
                    &item_schema,
                    item,
                    &format!("{instance_path}/{i}"),
                    &format!("{schema_path}/items"),
                    issues,
                );
            }
        }
    }

    fn check_object(
        &mut self,
        map: &Map<String, Value>,
        value: &Value,
        instance_path: &str,
        schema_path: &str,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let Some(obj) = value.as_object() else {
            return;
        };
        if let Some(Value::Array(required)) = map.get("required") {
            for name in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(name) {
                    issues.push(ValidationIssue::new(
                        instance_path,
                        &format!("{schema_path}/required"),
                        "required",
                        format!("must have required property '{name}'"),
                        serde_json::json!({"missingProperty": name}),
                    ));
                }
            }
        }
        if let Some(min) = map.get("minProperties").and_then(Value::as_u64) {
            if (obj.len() as u64) < min {
                issues.push(ValidationIssue::new(
                    instance_path,
                    &format!("{schema_path}/minProperties"),
                    "minProperties",
                    format!("must NOT have fewer than {min} properties"),
                    serde_json::json!({"limit": min}),
                ));
            }
        }
        if let Some(max) = map.get("maxProperties").and_then(Value::as_u64) {
            if (obj.len() as u64) > max {
                issues.push(ValidationIssue::new(
                    instance_path,
                    &format!("{schema_path}/maxProperties"),
                    "maxProperties",
                    format!("must NOT have more than {max} properties"),
                    serde_json::json!({"limit": max}),
                ));
            }
        }
        let properties = map.get("properties").and_then(Value::as_object).cloned();
        if let Some(props) = &properties {
            for (name, prop_schema) in props {
                if let Some(prop_value) = obj.get(name) {
                    self.validate(
                        prop_schema,
                        prop_value,
                        &format!("{instance_path}/{name}"),
                        &format!("{schema_path}/properties/{name}"),
                        issues,
                    );
                }
            }
        }
        match map.get("additionalProperties") {
            Some(Value::Bool(false)) => {
                for name in obj.keys() {
                    let declared = properties
                        .as_ref()
                        .map(|p| p.contains_key(name))
                        .unwrap_or(false);
                    if !declared {
                        issues.push(ValidationIssue::new(
                            instance_path,
                            &format!("{schema_path}/additionalProperties"),
                            "additionalProperties",
                            "must NOT have additional properties",
                            serde_json::json!({"additionalProperty": name}),
                        ));
                    }
                }
            }
            Some(extra_schema @ Value::Object(_)) => {
                let extra_schema = extra_schema.clone();
                for (name, prop_value) in obj {
                    let declared = properties
                        .as_ref()
                        .map(|p| p.contains_key(name))
                        .unwrap_or(false);
                    if !declared {
                        self.validate(
                            &extra_schema,
                            prop_value,
                            &format!("{instance_path}/{name}"),
                            &format!("{schema_path}/additionalProperties"),
                            issues,
                        );
                    }
                }
            }
            _ => {}
        }
    }

    fn check_composition(
        &mut self,
        map: &Map<String, Value>,
        value: &Value,
        instance_path: &str,
        schema_path: &str,
        issues: &mut Vec<ValidationIssue>,
    ) {
        if let Some(Value::Array(subs)) = map.get("allOf") {
            for (i, sub) in subs.iter().enumerate() {
                self.validate(
                    sub,
                    value,
                    instance_path,
                    &format!("{schema_path}/allOf/{i}"),
                    issues,
                );
            }
        }
        for keyword in ["anyOf", "oneOf"] {
            if let Some(Value::Array(subs)) = map.get(keyword) {
                let mut matched = 0usize;
                for sub in subs {
                    let mut sub_issues = Vec::new();
                    self.validate(sub, value, instance_path, schema_path, &mut sub_issues);
                    if sub_issues.is_empty() {
                        matched += 1;
                    }
                }
                // permissive: oneOf tolerates >1 match the way the source
                // validator was configured, so only zero matches fail
                if matched == 0 {
                    issues.push(ValidationIssue::new(
                        instance_path,
                        &format!("{schema_path}/{keyword}"),
                        keyword,
                        format!("must match a schema in {keyword}"),
                        serde_json::json!({"matched": matched}),
                    ));
                }
            }
        }
        if let Some(sub) = map.get("not") {
            let mut sub_issues = Vec::new();
            self.validate(sub, value, instance_path, schema_path, &mut sub_issues);
            if sub_issues.is_empty() {
                issues.push(ValidationIssue::new(
                    instance_path,
                    &format!("{schema_path}/not"),
                    "not",
                    "must NOT be valid against schema in not",
                    Value::Object(Map::new()),
                ));
            }
        }
    }
}

fn type_matches(declared: &str, value: &Value) -> bool {
    match declared {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "integer" => value.as_f64().map(|n| n.fract() == 0.0).unwrap_or(false) && value.is_number(),
        "number" => value.is_number(),
        _ => true,
    }
}
