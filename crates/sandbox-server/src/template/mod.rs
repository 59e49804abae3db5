//! Template engine: `{{ … }}` interpolation, raw expression evaluation,
//! and deep-templating of marked subtrees.
//!
//! Each engine owns one seeded stream; the pipeline binds an engine per
//! request seeded from `(global_seed, request_id)`, which keeps draws
//! deterministic regardless of how concurrent requests interleave.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

mod eval;
pub mod faker;
mod lexer;
mod parser;
pub mod rng;

pub use eval::{display_string, truthy};
pub use rng::SeededRng;

use crate::store::StateStore;
use eval::Evaluator;

/// Marker property that makes a subtree eligible for deep-templating.
pub const TEMPLATE_MARKER: &str = "$template";

/// Placeholder scanner permitting balanced single braces inside the
/// expression (`{{ util.json.stringify({}) }}` stays one placeholder).
static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{((?:[^{}]|\{[^{}]*\})*)\}\}").unwrap());

/// Fixed deny-list applied before parsing. Matching is plain substring
/// search over the raw expression text.
const DENY_TOKENS: &[&str] = &[
    "process",
    "require",
    "child_process",
    "globalThis",
    "eval(",
    "Function",
    "constructor",
    "__proto__",
    "prototype",
    "import",
    "fs.",
    "net.",
    "http.",
    "https.",
    "../",
];

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("expression too long ({len} > {max} chars)")]
    TooLong { len: usize, max: usize },
    #[error("expression rejected: contains forbidden token `{0}`")]
    Forbidden(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("evaluation error: {0}")]
    Eval(String),
    #[error("evaluation exceeded {0} ms")]
    Timeout(u64),
}

/// Evaluation guard limits.
#[derive(Debug, Clone)]
pub struct EvalLimits {
    pub max_expr_len: usize,
    pub time_cap: Duration,
}

impl Default for EvalLimits {
    fn default() -> Self {
        EvalLimits {
            max_expr_len: 1000,
            time_cap: Duration::from_millis(100),
        }
    }
}

/// Per-render environment. `now_ms` is fixed at context creation so every
/// render within one request observes the same clock.
pub struct TemplateContext {
    pub req: Value,
    pub session: Value,
    pub vars: Map<String, Value>,
    pub now_ms: i64,
    pub state: Option<Arc<dyn StateStore>>,
}

impl TemplateContext {
    pub fn new(req: Value, session: Value, now_ms: i64, state: Option<Arc<dyn StateStore>>) -> Self {
        TemplateContext {
            req,
            session,
            vars: Map::new(),
            now_ms,
            state,
        }
    }

    /// A bare context for expressions that touch neither request nor state.
    pub fn detached(now_ms: i64) -> Self {
        TemplateContext::new(Value::Null, Value::Null, now_ms, None)
    }
}

pub struct TemplateEngine {
    rng: Mutex<SeededRng>,
    limits: EvalLimits,
}

impl TemplateEngine {
    pub fn new(rng: SeededRng) -> Self {
        TemplateEngine {
            rng: Mutex::new(rng),
            limits: EvalLimits::default(),
        }
    }

    pub fn with_limits(rng: SeededRng, limits: EvalLimits) -> Self {
        TemplateEngine {
            rng: Mutex::new(rng),
            limits,
        }
    }

    /// Draw from the engine's stream outside expression evaluation (schema
    /// generation and chaos sampling share the per-request stream).
    pub fn with_rng<T>(&self, f: impl FnOnce(&mut SeededRng) -> T) -> T {
        f(&mut self.rng.lock())
    }

    /// Interpolate every `{{ expr }}` in `template`. Failed expressions
    /// emit the source placeholder verbatim; evaluator internals never
    /// leak into output.
    pub fn render(&self, template: &str, ctx: &TemplateContext) -> String {
        PLACEHOLDER
            .replace_all(template, |caps: &regex::Captures| {
                let expr = caps[1].trim();
                match self.evaluate(expr, ctx) {
                    Ok(value) => display_string(&value),
                    Err(e) => {
                        tracing::debug!(expr, error = %e, "template placeholder failed");
                        caps[0].to_string()
                    }
                }
            })
            .to_string()
    }

    /// Evaluate one expression with no surrounding interpolation.
    pub fn evaluate(&self, expr: &str, ctx: &TemplateContext) -> Result<Value, TemplateError> {
        self.guard(expr)?;
        let ast = parser::parse(expr)?;
        let mut rng = self.rng.lock();
        let mut evaluator = Evaluator::new(ctx, &mut rng, self.limits.time_cap);
        evaluator.eval_to_value(&ast)
    }

    /// Walk a data tree and render every marked subtree. A subtree is
    /// eligible only when it is an object carrying `"$template": true`;
    /// the marker is removed and every string beneath it (keys included)
    /// is rendered.
    pub fn process_template(&self, tree: &Value, ctx: &TemplateContext) -> Value {
        match tree {
            Value::Object(map) => {
                if map.get(TEMPLATE_MARKER) == Some(&Value::Bool(true)) {
                    let mut unmarked = map.clone();
                    unmarked.remove(TEMPLATE_MARKER);
                    self.render_subtree(&Value::Object(unmarked), ctx)
                } else {
                    Value::Object(
                        map.iter()
                            .map(|(k, v)| (k.clone(), self.process_template(v, ctx)))
                            .collect(),
                    )
                }
            }
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.process_template(v, ctx)).collect())
            }
            other => other.clone(),
        }
    }

    /// Render every string (keys included) in a tree, regardless of
    /// markers. State actions template their values this way; response
    /// bodies require the explicit marker.
    pub fn deep_render(&self, tree: &Value, ctx: &TemplateContext) -> Value {
        self.render_subtree(tree, ctx)
    }

    fn render_subtree(&self, tree: &Value, ctx: &TemplateContext) -> Value {
        match tree {
            Value::String(s) => self.render_scalar(s, ctx),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (self.render(k, ctx), self.render_subtree(v, ctx)))
                    .collect(),
            ),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.render_subtree(v, ctx)).collect())
            }
            other => other.clone(),
        }
    }

    /// Render a string into a value. A string that is exactly one
    /// placeholder keeps the evaluated value's type (so
    /// `"{{state['user:1']}}"` can produce an object); mixed content
    /// renders to a string.
    pub fn render_value(&self, s: &str, ctx: &TemplateContext) -> Value {
        self.render_scalar(s, ctx)
    }

    fn render_scalar(&self, s: &str, ctx: &TemplateContext) -> Value {
        if let Some(caps) = PLACEHOLDER.captures(s) {
            if caps[0].len() == s.len() {
                if let Ok(value) = self.evaluate(caps[1].trim(), ctx) {
                    return value;
                }
                return Value::String(s.to_string());
            }
        }
        Value::String(self.render(s, ctx))
    }

    fn guard(&self, expr: &str) -> Result<(), TemplateError> {
        if expr.len() > self.limits.max_expr_len {
            return Err(TemplateError::TooLong {
                len: expr.len(),
                max: self.limits.max_expr_len,
            });
        }
        for token in DENY_TOKENS {
            if expr.contains(token) {
                return Err(TemplateError::Forbidden((*token).to_string()));
            }
        }
        Ok(())
    }
}
