//! Tree-walking evaluator over the enumerated environment.
//!
//! Only the bindings listed in the context are in scope; there are no
//! ambient globals. `state` is a lazy projection that reads the namespaced
//! store on member access or indexing, so expressions observe writes made
//! earlier in the same action list.

use super::parser::{BinOp, Expr};
use super::{faker, rng::SeededRng, TemplateContext, TemplateError};
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Evaluation result. Most expressions produce plain JSON values; the
/// remaining variants exist so callables and namespaces can flow through
/// member access before application.
pub enum Val {
    Json(Value),
    Re(Arc<Regex>),
    Fn(Builtin),
    Ns(String),
    State,
}

#[derive(Clone)]
pub enum Builtin {
    Uuid,
    Rand,
    /// Builtin addressed by dotted path (`math.floor`, `util.string.upper`,
    /// `faker.name.firstName`).
    Path(String),
    /// `.test(s)` bound to a regex literal.
    ReTest(Arc<Regex>),
}

pub struct Evaluator<'a> {
    ctx: &'a TemplateContext,
    rng: &'a mut SeededRng,
    deadline: Instant,
    time_cap: Duration,
}

impl<'a> Evaluator<'a> {
    pub fn new(ctx: &'a TemplateContext, rng: &'a mut SeededRng, time_cap: Duration) -> Self {
        Evaluator {
            ctx,
            rng,
            deadline: Instant::now() + time_cap,
            time_cap,
        }
    }

    pub fn eval_to_value(&mut self, expr: &Expr) -> Result<Value, TemplateError> {
        match self.eval(expr)? {
            Val::Json(v) => Ok(v),
            Val::Re(_) => Err(TemplateError::Eval("regex is not a value".into())),
            Val::Fn(_) => Err(TemplateError::Eval("function was not called".into())),
            Val::Ns(name) => Err(TemplateError::Eval(format!("`{name}` is not a value"))),
            Val::State => Err(TemplateError::Eval("`state` must be indexed".into())),
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Val, TemplateError> {
        if Instant::now() > self.deadline {
            return Err(TemplateError::Timeout(self.time_cap.as_millis() as u64));
        }
        match expr {
            Expr::Null => Ok(Val::Json(Value::Null)),
            Expr::Bool(b) => Ok(Val::Json(Value::Bool(*b))),
            Expr::Num(n) => Ok(Val::Json(number(*n))),
            Expr::Str(s) => Ok(Val::Json(Value::String(s.clone()))),
            Expr::Regex(pattern, flags) => {
                let translated = if flags.contains('i') {
                    format!("(?i){pattern}")
                } else {
                    pattern.clone()
                };
                let re = Regex::new(&translated)
                    .map_err(|e| TemplateError::Eval(format!("invalid regex: {e}")))?;
                Ok(Val::Re(Arc::new(re)))
            }
            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval_to_value(item)?);
                }
                Ok(Val::Json(Value::Array(out)))
            }
            Expr::Ident(name) => self.lookup(name),
            Expr::Member(target, name) => {
                let target = self.eval(target)?;
                self.member(target, name)
            }
            Expr::Index(target, index) => {
                let target = self.eval(target)?;
                let index = self.eval_to_value(index)?;
                self.index(target, &index)
            }
            Expr::Not(inner) => {
                let v = self.eval_to_value(inner)?;
                Ok(Val::Json(Value::Bool(!truthy(&v))))
            }
            Expr::Neg(inner) => {
                let v = self.eval_to_value(inner)?;
                let n = as_number(&v)
                    .ok_or_else(|| TemplateError::Eval("cannot negate non-number".into()))?;
                Ok(Val::Json(number(-n)))
            }
            Expr::Bin(op, left, right) => self.binary(*op, left, right),
            Expr::Ternary(cond, then, otherwise) => {
                let cond = self.eval_to_value(cond)?;
                if truthy(&cond) {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Call(callee, args) => {
                let callee = self.eval(callee)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_to_value(arg)?);
                }
                self.call(callee, values)
            }
        }
    }

    fn lookup(&mut self, name: &str) -> Result<Val, TemplateError> {
        match name {
            "req" => Ok(Val::Json(self.ctx.req.clone())),
            "session" => Ok(Val::Json(self.ctx.session.clone())),
            "vars" => Ok(Val::Json(Value::Object(self.ctx.vars.clone()))),
            "now" => Ok(Val::Json(Value::from(self.ctx.now_ms))),
            "state" => Ok(Val::State),
            "uuid" => Ok(Val::Fn(Builtin::Uuid)),
            "rand" => Ok(Val::Fn(Builtin::Rand)),
            "math" | "util" | "faker" => Ok(Val::Ns(name.to_string())),
            other => Err(TemplateError::Eval(format!("`{other}` is not defined"))),
        }
    }

    fn member(&mut self, target: Val, name: &str) -> Result<Val, TemplateError> {
        match target {
            Val::State => self.state_read(name),
            Val::Ns(prefix) => self.namespace_member(&prefix, name),
            Val::Re(re) => match name {
                "test" => Ok(Val::Fn(Builtin::ReTest(re))),
                "source" => Ok(Val::Json(Value::String(re.as_str().to_string()))),
                other => Err(TemplateError::Eval(format!("regex has no member `{other}`"))),
            },
            Val::Json(Value::Object(map)) => {
                Ok(Val::Json(map.get(name).cloned().unwrap_or(Value::Null)))
            }
            Val::Json(Value::Array(items)) => match name {
                "length" => Ok(Val::Json(Value::from(items.len()))),
                other => Err(TemplateError::Eval(format!("array has no member `{other}`"))),
            },
            Val::Json(Value::String(s)) => match name {
                "length" => Ok(Val::Json(Value::from(s.chars().count()))),
                other => Err(TemplateError::Eval(format!(
                    "string has no member `{other}`"
                ))),
            },
            Val::Json(Value::Null) => Err(TemplateError::Eval(format!(
                "cannot read `{name}` of null"
            ))),
            Val::Json(_) => Err(TemplateError::Eval(format!(
                "cannot read member `{name}` of a scalar"
            ))),
            Val::Fn(_) => Err(TemplateError::Eval("functions have no members".into())),
        }
    }

    fn namespace_member(&mut self, prefix: &str, name: &str) -> Result<Val, TemplateError> {
        let path = format!("{prefix}.{name}");
        match (prefix, name) {
            ("math", "PI") => return Ok(Val::Json(number(std::f64::consts::PI))),
            ("math", "E") => return Ok(Val::Json(number(std::f64::consts::E))),
            _ => {}
        }
        // Two-level namespaces keep flowing (`util.string`, `faker.name`);
        // leaves become callables, checked at application time.
        let is_intermediate = matches!(
            (prefix, name),
            ("util", "json" | "string" | "array" | "object")
                | (
                    "faker",
                    "name" | "internet" | "address" | "company" | "commerce" | "random" | "date"
                )
        );
        if is_intermediate {
            Ok(Val::Ns(path))
        } else {
            Ok(Val::Fn(Builtin::Path(path)))
        }
    }

    fn index(&mut self, target: Val, index: &Value) -> Result<Val, TemplateError> {
        match target {
            Val::State => {
                let key = index
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| display_string(index));
                self.state_read(&key)
            }
            Val::Json(Value::Object(map)) => {
                let key = index
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| display_string(index));
                Ok(Val::Json(map.get(&key).cloned().unwrap_or(Value::Null)))
            }
            Val::Json(Value::Array(items)) => {
                let idx = as_number(index)
                    .ok_or_else(|| TemplateError::Eval("array index must be a number".into()))?;
                let idx = idx as i64;
                if idx < 0 || idx as usize >= items.len() {
                    Ok(Val::Json(Value::Null))
                } else {
                    Ok(Val::Json(items[idx as usize].clone()))
                }
            }
            Val::Json(Value::String(s)) => {
                let idx = as_number(index)
                    .ok_or_else(|| TemplateError::Eval("string index must be a number".into()))?;
                Ok(Val::Json(
                    s.chars()
                        .nth(idx as usize)
                        .map(|c| Value::String(c.to_string()))
                        .unwrap_or(Value::Null),
                ))
            }
            _ => Err(TemplateError::Eval("value cannot be indexed".into())),
        }
    }

    fn state_read(&self, key: &str) -> Result<Val, TemplateError> {
        let store = self
            .ctx
            .state
            .as_ref()
            .ok_or_else(|| TemplateError::Eval("`state` is not available here".into()))?;
        let value = store
            .get(key)
            .map_err(|e| TemplateError::Eval(format!("state read failed: {e}")))?;
        Ok(Val::Json(value.unwrap_or(Value::Null)))
    }

    fn call(&mut self, callee: Val, args: Vec<Value>) -> Result<Val, TemplateError> {
        let builtin = match callee {
            Val::Fn(b) => b,
            _ => return Err(TemplateError::Eval("value is not callable".into())),
        };
        let result = match builtin {
            Builtin::Uuid => Value::String(self.rng.uuid()),
            Builtin::Rand => {
                let lo = args
                    .first()
                    .and_then(as_number)
                    .ok_or_else(|| TemplateError::Eval("rand(lo, hi) needs numbers".into()))?;
                let hi = args
                    .get(1)
                    .and_then(as_number)
                    .ok_or_else(|| TemplateError::Eval("rand(lo, hi) needs numbers".into()))?;
                Value::from(self.rng.int_between(lo as i64, hi as i64))
            }
            Builtin::ReTest(re) => {
                let subject = args
                    .first()
                    .map(display_string)
                    .unwrap_or_default();
                Value::Bool(re.is_match(&subject))
            }
            Builtin::Path(path) => self.call_path(&path, args)?,
        };
        Ok(Val::Json(result))
    }

    fn call_path(&mut self, path: &str, args: Vec<Value>) -> Result<Value, TemplateError> {
        if let Some(faker_path) = path.strip_prefix("faker.") {
            return faker::invoke(self.rng, faker_path, self.ctx.now_ms)
                .ok_or_else(|| TemplateError::Eval(format!("unknown faker generator `{path}`")));
        }

        let num = |i: usize| -> Result<f64, TemplateError> {
            args.get(i)
                .and_then(as_number)
                .ok_or_else(|| TemplateError::Eval(format!("`{path}` expects a number")))
        };
        let text = |i: usize| -> Result<String, TemplateError> {
            args.get(i)
                .map(display_string)
                .ok_or_else(|| TemplateError::Eval(format!("`{path}` expects a string")))
        };
        let arg = |i: usize| -> Result<&Value, TemplateError> {
            args.get(i)
                .ok_or_else(|| TemplateError::Eval(format!("`{path}` missing argument")))
        };

        let value = match path {
            "math.floor" => number(num(0)?.floor()),
            "math.ceil" => number(num(0)?.ceil()),
            "math.round" => number(num(0)?.round()),
            "math.abs" => number(num(0)?.abs()),
            "math.sqrt" => number(num(0)?.sqrt()),
            "math.min" => number(num(0)?.min(num(1)?)),
            "math.max" => number(num(0)?.max(num(1)?)),
            "math.pow" => number(num(0)?.powf(num(1)?)),
            "util.json.parse" => serde_json::from_str(&text(0)?)
                .map_err(|e| TemplateError::Eval(format!("json parse: {e}")))?,
            "util.json.stringify" => Value::String(
                serde_json::to_string(arg(0)?)
                    .map_err(|e| TemplateError::Eval(format!("json stringify: {e}")))?,
            ),
            "util.string.upper" => Value::String(text(0)?.to_uppercase()),
            "util.string.lower" => Value::String(text(0)?.to_lowercase()),
            "util.string.trim" => Value::String(text(0)?.trim().to_string()),
            "util.string.replace" => {
                Value::String(text(0)?.replace(&text(1)?, &text(2)?))
            }
            "util.array.length" => match arg(0)? {
                Value::Array(items) => Value::from(items.len()),
                Value::String(s) => Value::from(s.chars().count()),
                _ => return Err(TemplateError::Eval("length expects an array".into())),
            },
            "util.array.join" => match arg(0)? {
                Value::Array(items) => {
                    let sep = args.get(1).map(display_string).unwrap_or_else(|| ",".into());
                    let joined: Vec<String> = items.iter().map(display_string).collect();
                    Value::String(joined.join(&sep))
                }
                _ => return Err(TemplateError::Eval("join expects an array".into())),
            },
            "util.array.slice" => match arg(0)? {
                Value::Array(items) => {
                    let len = items.len() as i64;
                    let clamp = |n: f64| -> usize {
                        let n = n as i64;
                        let n = if n < 0 { len + n } else { n };
                        n.clamp(0, len) as usize
                    };
                    let start = clamp(num(1)?);
                    let end = args.get(2).and_then(as_number).map(clamp).unwrap_or(len as usize);
                    Value::Array(items[start..end.max(start)].to_vec())
                }
                _ => return Err(TemplateError::Eval("slice expects an array".into())),
            },
            "util.object.keys" => match arg(0)? {
                Value::Object(map) => {
                    Value::Array(map.keys().map(|k| Value::String(k.clone())).collect())
                }
                _ => return Err(TemplateError::Eval("keys expects an object".into())),
            },
            "util.object.values" => match arg(0)? {
                Value::Object(map) => Value::Array(map.values().cloned().collect()),
                _ => return Err(TemplateError::Eval("values expects an object".into())),
            },
            "util.object.entries" => match arg(0)? {
                Value::Object(map) => Value::Array(
                    map.iter()
                        .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), v.clone()]))
                        .collect(),
                ),
                _ => return Err(TemplateError::Eval("entries expects an object".into())),
            },
            other => return Err(TemplateError::Eval(format!("unknown function `{other}`"))),
        };
        Ok(value)
    }

    fn binary(&mut self, op: BinOp, left: &Expr, right: &Expr) -> Result<Val, TemplateError> {
        // Short-circuit forms return operand values, not coerced booleans.
        match op {
            BinOp::And => {
                let l = self.eval_to_value(left)?;
                if !truthy(&l) {
                    return Ok(Val::Json(l));
                }
                return Ok(Val::Json(self.eval_to_value(right)?));
            }
            BinOp::Or => {
                let l = self.eval_to_value(left)?;
                if truthy(&l) {
                    return Ok(Val::Json(l));
                }
                return Ok(Val::Json(self.eval_to_value(right)?));
            }
            _ => {}
        }

        let l = self.eval_to_value(left)?;
        let r = self.eval_to_value(right)?;
        let value = match op {
            BinOp::Add => {
                if l.is_string() || r.is_string() {
                    Value::String(format!("{}{}", display_string(&l), display_string(&r)))
                } else {
                    number(numeric(&l, "+")? + numeric(&r, "+")?)
                }
            }
            BinOp::Sub => number(numeric(&l, "-")? - numeric(&r, "-")?),
            BinOp::Mul => number(numeric(&l, "*")? * numeric(&r, "*")?),
            BinOp::Div => number(numeric(&l, "/")? / numeric(&r, "/")?),
            BinOp::Rem => number(numeric(&l, "%")? % numeric(&r, "%")?),
            BinOp::Lt => Value::Bool(compare(&l, &r)? == std::cmp::Ordering::Less),
            BinOp::Le => Value::Bool(compare(&l, &r)? != std::cmp::Ordering::Greater),
            BinOp::Gt => Value::Bool(compare(&l, &r)? == std::cmp::Ordering::Greater),
            BinOp::Ge => Value::Bool(compare(&l, &r)? != std::cmp::Ordering::Less),
            BinOp::Eq => Value::Bool(loose_eq(&l, &r)),
            BinOp::Ne => Value::Bool(!loose_eq(&l, &r)),
            BinOp::StrictEq => Value::Bool(l == r),
            BinOp::StrictNe => Value::Bool(l != r),
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        };
        Ok(Val::Json(value))
    }
}

/// Coerce the JSON number, collapsing whole floats to integers.
pub fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 9e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// The substituted string form: empty for null, bare text for strings,
/// compact JSON for composites.
pub fn display_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(true) => Some(1.0),
        Value::Bool(false) | Value::Null => Some(0.0),
        _ => None,
    }
}

fn numeric(value: &Value, op: &str) -> Result<f64, TemplateError> {
    as_number(value).ok_or_else(|| TemplateError::Eval(format!("`{op}` expects numbers")))
}

fn compare(l: &Value, r: &Value) -> Result<std::cmp::Ordering, TemplateError> {
    if let (Value::String(a), Value::String(b)) = (l, r) {
        return Ok(a.cmp(b));
    }
    let (a, b) = (
        as_number(l).ok_or_else(|| TemplateError::Eval("cannot compare values".into()))?,
        as_number(r).ok_or_else(|| TemplateError::Eval("cannot compare values".into()))?,
    );
    a.partial_cmp(&b)
        .ok_or_else(|| TemplateError::Eval("cannot compare values".into()))
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    if l == r {
        return true;
    }
    match (l, r) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            matches!((as_number(l), as_number(r)), (Some(a), Some(b)) if a == b)
        }
        (Value::Bool(_), _) | (_, Value::Bool(_)) => {
            matches!((as_number(l), as_number(r)), (Some(a), Some(b)) if a == b)
        }
        _ => false,
    }
}
