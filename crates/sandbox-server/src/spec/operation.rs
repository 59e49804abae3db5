//! Operation descriptors built once at load time.

use super::path::PathTemplate;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashMap;

/// Where a parameter lives in the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Cookie,
}

impl ParamLocation {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "path" => Some(ParamLocation::Path),
            "query" => Some(ParamLocation::Query),
            "header" => Some(ParamLocation::Header),
            "cookie" => Some(ParamLocation::Cookie),
            _ => None,
        }
    }

    /// Instance-path prefix segment used by the validator.
    pub fn slot(&self) -> &'static str {
        match self {
            ParamLocation::Path => "path",
            ParamLocation::Query => "query",
            ParamLocation::Header => "headers",
            ParamLocation::Cookie => "cookies",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub name: String,
    pub location: ParamLocation,
    pub required: bool,
    pub schema: Option<Value>,
}

/// One response descriptor, keyed in the operation by status code or class
/// (`200`, `2XX`, `default`).
#[derive(Debug, Clone, Default)]
pub struct ResponseSpec {
    /// Header name → schema.
    pub headers: HashMap<String, Value>,
    /// Media type → schema.
    pub content: BTreeMap<String, Value>,
}

impl ResponseSpec {
    /// The JSON schema for this response, by the media-type precedence
    /// rule: exact `application/json`, then a wildcard, then the first.
    pub fn json_schema(&self) -> Option<&Value> {
        select_json_media(&self.content)
    }
}

/// Immutable descriptor for one `(method, path)` operation.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: String,
    /// Uppercase HTTP method.
    pub method: String,
    /// Literal path template.
    pub path: String,
    pub matcher: PathTemplate,
    pub parameters: Vec<ParameterSpec>,
    pub request_body: Option<Value>,
    /// Keyed by status code or class, ordered for deterministic fallback.
    pub responses: BTreeMap<String, ResponseSpec>,
}

impl Operation {
    /// The first 2xx status declared by the operation, preferring `200`
    /// exactly, else 200.
    pub fn default_success_status(&self) -> u16 {
        if self.responses.contains_key("200") {
            return 200;
        }
        for key in self.responses.keys() {
            if let Ok(code) = key.parse::<u16>() {
                if (200..300).contains(&code) {
                    return code;
                }
            }
        }
        if self.responses.contains_key("2XX") {
            return 200;
        }
        200
    }

    /// The descriptor the pipeline falls back to when no rule fires: the
    /// lexicographically first 2xx descriptor (preferring `200`), else
    /// `default`.
    pub fn default_success_response(&self) -> Option<(u16, &ResponseSpec)> {
        if let Some(spec) = self.responses.get("200") {
            return Some((200, spec));
        }
        for (key, spec) in &self.responses {
            if let Ok(code) = key.parse::<u16>() {
                if (200..300).contains(&code) {
                    return Some((code, spec));
                }
            }
        }
        if let Some(spec) = self.responses.get("2XX") {
            return Some((200, spec));
        }
        self.responses.get("default").map(|spec| (200, spec))
    }

    /// Response descriptor for a concrete status: exact match, then the
    /// `2XX`-style class, then `default`.
    pub fn response_for_status(&self, status: u16) -> Option<&ResponseSpec> {
        if let Some(spec) = self.responses.get(&status.to_string()) {
            return Some(spec);
        }
        let class = format!("{}XX", status / 100);
        if let Some(spec) = self.responses.get(&class) {
            return Some(spec);
        }
        self.responses.get("default")
    }
}

/// Media-type precedence shared by request bodies and responses.
pub fn select_json_media(content: &BTreeMap<String, Value>) -> Option<&Value> {
    if let Some(schema) = content.get("application/json") {
        return Some(schema);
    }
    if let Some((_, schema)) = content.iter().find(|(media, _)| media.contains('*')) {
        return Some(schema);
    }
    content.values().next()
}

/// Synthesize an operation identifier from method and path by replacing
/// non-alphanumerics with underscores.
pub fn synthesize_operation_id(method: &str, path: &str) -> String {
    let mangled: String = path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}{}", method.to_lowercase(), mangled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op_with_responses(keys: &[&str]) -> Operation {
        let mut responses = BTreeMap::new();
        for key in keys {
            responses.insert(key.to_string(), ResponseSpec::default());
        }
        Operation {
            id: "test".into(),
            method: "GET".into(),
            path: "/x".into(),
            matcher: PathTemplate::compile("/x").unwrap(),
            parameters: vec![],
            request_body: None,
            responses,
        }
    }

    #[test]
    fn test_synthesized_operation_id() {
        assert_eq!(synthesize_operation_id("GET", "/users/{id}"), "get_users__id_");
        assert_eq!(synthesize_operation_id("POST", "/users"), "post_users");
    }

    #[test]
    fn test_default_success_prefers_200() {
        let op = op_with_responses(&["201", "200", "404"]);
        assert_eq!(op.default_success_status(), 200);
    }

    #[test]
    fn test_default_success_first_2xx() {
        let op = op_with_responses(&["204", "201", "404"]);
        assert_eq!(op.default_success_status(), 201);
    }

    #[test]
    fn test_response_for_status_precedence() {
        let op = op_with_responses(&["201", "2XX", "default"]);
        assert!(op.response_for_status(201).is_some());
        // 202 falls through to the class entry
        let op2 = op_with_responses(&["2XX", "default"]);
        assert!(op2.response_for_status(202).is_some());
        // 500 falls through to default
        assert!(op2.response_for_status(500).is_some());
        let op3 = op_with_responses(&["200"]);
        assert!(op3.response_for_status(500).is_none());
    }

    #[test]
    fn test_media_type_precedence() {
        let mut content = BTreeMap::new();
        content.insert("text/plain".to_string(), json!({"type": "string"}));
        content.insert("*/*".to_string(), json!({"wildcard": true}));
        content.insert("application/json".to_string(), json!({"exact": true}));
        assert_eq!(select_json_media(&content), Some(&json!({"exact": true})));

        content.remove("application/json");
        assert_eq!(select_json_media(&content), Some(&json!({"wildcard": true})));

        content.remove("*/*");
        assert_eq!(select_json_media(&content), Some(&json!({"type": "string"})));
    }
}
