//! Scenario rules: selectors, actions, and the rules-file loader.
//!
//! A rules document carries a top-level `scenarios` array. Each entry
//! needs `when` (the selector) and `do` (the ordered action list), plus an
//! optional integer `priority` (higher fires first; source order breaks
//! ties). Entries missing either key are rejected at load time with their
//! position in the error.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::RuleError;
use crate::spec::Operation;
use crate::template::rng::SeededRng;

mod engine;

pub use engine::{execute_rules, ActionContext, ResponseDraft};

/// State scope an action writes to. Defaults to the request's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Session,
    Global,
}

#[derive(Debug, Clone, Deserialize)]
pub enum Action {
    #[serde(rename = "respond")]
    Respond(RespondAction),
    #[serde(rename = "state.set")]
    StateSet(StateSetAction),
    #[serde(rename = "state.patch")]
    StatePatch(StatePatchAction),
    #[serde(rename = "state.increment")]
    StateIncrement(StateIncrementAction),
    #[serde(rename = "state.del")]
    StateDel(StateDelAction),
    #[serde(rename = "delay")]
    Delay(DelaySpec),
    #[serde(rename = "if")]
    If(IfAction),
    /// Accepted by the loader, not implemented: executes as a logged no-op.
    #[serde(rename = "proxy")]
    Proxy(Value),
    #[serde(rename = "emit")]
    Emit(EmitAction),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RespondAction {
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    /// Validates a present body, or synthesizes an absent one.
    #[serde(rename = "$schema")]
    pub schema: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateSetAction {
    pub key: String,
    pub value: Value,
    pub ttl: Option<u64>,
    pub scope: Option<Scope>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatePatchAction {
    pub key: String,
    pub value: Value,
    pub scope: Option<Scope>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateIncrementAction {
    pub key: String,
    #[serde(default = "default_by")]
    pub by: f64,
    /// Bind the numeric result into `vars.<as>` for later expressions.
    #[serde(rename = "as")]
    pub as_var: Option<String>,
    pub scope: Option<Scope>,
}

fn default_by() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateDelAction {
    pub key: String,
    pub scope: Option<Scope>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IfAction {
    pub when: String,
    pub then: Vec<Action>,
    #[serde(rename = "else", default)]
    pub else_: Vec<Action>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmitAction {
    #[serde(default)]
    pub level: EmitLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmitLevel {
    #[default]
    Info,
    Warn,
    Error,
}

/// Delay specification: plain milliseconds, a suffixed literal, a
/// mean-with-jitter distribution, or a percentile form treated as the
/// scalar value.
#[derive(Debug, Clone, PartialEq)]
pub enum DelaySpec {
    Fixed(Duration),
    Jitter { mean: Duration, jitter: Duration },
}

impl DelaySpec {
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        if let Ok(ms) = text.parse::<u64>() {
            return Ok(DelaySpec::Fixed(Duration::from_millis(ms)));
        }
        let text = match text.split_once('=') {
            // percentile form: p95=200ms is treated as its scalar value
            Some((percentile, rest))
                if percentile.starts_with('p')
                    && percentile[1..].chars().all(|c| c.is_ascii_digit()) =>
            {
                rest.trim()
            }
            _ => text,
        };
        if let Some((mean, jitter)) = text.split_once('±').or_else(|| text.split_once("+-")) {
            let (jitter_n, unit) = split_unit(jitter)?;
            let mean_n = mean
                .trim()
                .parse::<f64>()
                .map_err(|_| format!("invalid delay mean `{mean}`"))?;
            return Ok(DelaySpec::Jitter {
                mean: to_duration(mean_n, unit),
                jitter: to_duration(jitter_n, unit),
            });
        }
        let (n, unit) = split_unit(text)?;
        Ok(DelaySpec::Fixed(to_duration(n, unit)))
    }

    /// Sample a concrete duration; jitter draws uniformly from
    /// `[-jitter, +jitter]`, clamped at zero.
    pub fn sample(&self, rng: &mut SeededRng) -> Duration {
        match self {
            DelaySpec::Fixed(d) => *d,
            DelaySpec::Jitter { mean, jitter } => {
                let jitter_ms = jitter.as_millis() as f64;
                let offset = rng.float_between(-jitter_ms, jitter_ms);
                let ms = (mean.as_millis() as f64 + offset).max(0.0);
                Duration::from_millis(ms as u64)
            }
        }
    }
}

fn split_unit(text: &str) -> Result<(f64, &str), String> {
    let text = text.trim();
    let unit_start = text
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| format!("missing unit in delay `{text}`"))?;
    let n = text[..unit_start]
        .parse::<f64>()
        .map_err(|_| format!("invalid delay value `{text}`"))?;
    let unit = &text[unit_start..];
    match unit {
        "ms" | "s" | "m" | "h" => Ok((n, unit)),
        other => Err(format!("unknown delay unit `{other}`")),
    }
}

fn to_duration(n: f64, unit: &str) -> Duration {
    let ms = match unit {
        "s" => n * 1_000.0,
        "m" => n * 60_000.0,
        "h" => n * 3_600_000.0,
        _ => n,
    };
    Duration::from_millis(ms.max(0.0) as u64)
}

impl<'de> Deserialize<'de> for DelaySpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(DelaySpec::Fixed(Duration::from_millis(ms))),
            Raw::Text(text) => DelaySpec::parse(&text).map_err(D::Error::custom),
        }
    }
}

/// Rule selector: an operation identifier or a (method, path) pair, with
/// optional query/header conditions and a negation flag.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    pub operation_id: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub negate: bool,
}

impl Selector {
    fn from_value(when: &Value, index: usize) -> Result<Self, RuleError> {
        let map = when.as_object().ok_or_else(|| RuleError::Malformed {
            index,
            message: "`when` must be an object".into(),
        })?;
        let operation_id = map
            .get("operationId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let method = map
            .get("method")
            .and_then(Value::as_str)
            .map(|m| m.to_uppercase());
        let path = map.get("path").and_then(Value::as_str).map(str::to_string);
        if operation_id.is_none() && (method.is_none() || path.is_none()) {
            return Err(RuleError::Malformed {
                index,
                message: "`when` needs `operationId` or both `method` and `path`".into(),
            });
        }
        let mut selector = Selector {
            operation_id,
            method,
            path,
            negate: map.get("negate") == Some(&Value::Bool(true)),
            ..Selector::default()
        };
        if let Some(Value::Object(block)) = map.get("match") {
            if let Some(Value::Object(query)) = block.get("query") {
                for (k, v) in query {
                    selector.query.insert(k.clone(), condition_string(v));
                }
            }
            if let Some(Value::Object(headers)) = block.get("headers") {
                for (k, v) in headers {
                    selector.headers.insert(k.to_lowercase(), condition_string(v));
                }
            }
        }
        Ok(selector)
    }

    /// Does this selector target the given operation?
    fn matches_operation(&self, op: &Operation) -> bool {
        if let Some(id) = &self.operation_id {
            return id == &op.id;
        }
        match (&self.method, &self.path) {
            (Some(method), Some(path)) => method == &op.method && path == &op.path,
            _ => false,
        }
    }

    /// Full match: operation plus the query/header conditions, with the
    /// negate flag flipping the outcome.
    pub fn matches(
        &self,
        op: &Operation,
        query: &HashMap<String, String>,
        headers: &HashMap<String, String>,
    ) -> bool {
        let matched = self.matches_operation(op)
            && self
                .query
                .iter()
                .all(|(k, expected)| condition_holds(query.get(k), expected))
            && self
                .headers
                .iter()
                .all(|(k, expected)| condition_holds(headers.get(k), expected));
        if self.negate {
            !matched
        } else {
            matched
        }
    }
}

fn condition_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => crate::template::display_string(other),
    }
}

/// A condition value is an exact string or the `$regex:<pattern>`
/// sentinel. Absent actual values never match.
fn condition_holds(actual: Option<&String>, expected: &str) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    if let Some(pattern) = expected.strip_prefix("$regex:") {
        return regex::Regex::new(pattern)
            .map(|re| re.is_match(actual))
            .unwrap_or(false);
    }
    actual == expected
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub selector: Selector,
    pub actions: Vec<Action>,
    pub priority: i64,
    pub source_index: usize,
}

/// All rules, sorted once at load by `(priority DESC, source_order ASC)`.
#[derive(Default, Debug)]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
}

impl RuleSet {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let doc: Value = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(_) => serde_yaml::from_str(&raw).map_err(|e| RuleError::Parse(e.to_string()))?,
        };
        Self::from_value(&doc)
    }

    /// Accepts either a `{scenarios: [...]}` document or a bare list.
    pub fn from_value(doc: &Value) -> Result<Self, RuleError> {
        let entries = match doc {
            Value::Object(map) => map
                .get("scenarios")
                .and_then(Value::as_array)
                .ok_or_else(|| RuleError::Parse("missing `scenarios` array".into()))?,
            Value::Array(entries) => entries,
            _ => return Err(RuleError::Parse("rules document must be a mapping".into())),
        };

        let mut rules = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let map = entry.as_object().ok_or_else(|| RuleError::Malformed {
                index,
                message: "scenario must be an object".into(),
            })?;
            let when = map.get("when").ok_or_else(|| RuleError::Malformed {
                index,
                message: "missing `when`".into(),
            })?;
            let actions_value = map.get("do").ok_or_else(|| RuleError::Malformed {
                index,
                message: "missing `do`".into(),
            })?;
            let selector = Selector::from_value(when, index)?;
            let actions: Vec<Action> = serde_json::from_value(actions_value.clone())
                .map_err(|e| RuleError::Malformed {
                    index,
                    message: format!("invalid `do` list: {e}"),
                })?;
            let priority = map
                .get("priority")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            rules.push(Arc::new(Rule {
                selector,
                actions,
                priority,
                source_index: index,
            }));
        }

        // stable sort keeps source order among equal priorities
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
        Ok(RuleSet { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Rules matching the operation and request conditions, already in
    /// firing order.
    pub fn select(
        &self,
        op: &Operation,
        query: &HashMap<String, String>,
        headers: &HashMap<String, String>,
    ) -> Vec<Arc<Rule>> {
        self.rules
            .iter()
            .filter(|r| r.selector.matches(op, query, headers))
            .cloned()
            .collect()
    }
}
