//! Deterministic schema-driven data synthesis.
//!
//! Given the same seed the generator produces the same value for the same
//! schema, across runs and platforms. Failures are contained: a subtree
//! that cannot be generated yields null instead of propagating an error.

use super::validate::resolve_pointer;
use crate::template::faker;
use crate::template::rng::SeededRng;
use chrono::{TimeZone, Utc};
use serde_json::{Map, Value};

const LOREM: &[&str] = &[
    "lorem", "ipsum", "dolor", "sit", "amet", "consectetur", "adipiscing", "elit", "sed", "do",
    "eiusmod", "tempor", "incididunt", "labore", "dolore", "magna", "aliqua",
];

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub use_examples: bool,
    pub max_depth: usize,
    /// Upper bound for generated string lengths when the schema allows more.
    pub string_cap: usize,
    /// Upper bound for generated array lengths when the schema allows more.
    pub array_cap: usize,
    /// Upper bound for `additionalProperties` entries.
    pub extra_props_cap: usize,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        GenerateOptions {
            use_examples: true,
            max_depth: 10,
            string_cap: 40,
            array_cap: 5,
            extra_props_cap: 3,
        }
    }
}

pub struct Generator<'a> {
    doc: &'a Value,
    rng: &'a mut SeededRng,
    opts: &'a GenerateOptions,
    now_ms: i64,
    ref_stack: Vec<String>,
}

impl<'a> Generator<'a> {
    pub fn new(
        doc: &'a Value,
        rng: &'a mut SeededRng,
        opts: &'a GenerateOptions,
        now_ms: i64,
    ) -> Self {
        Generator {
            doc,
            rng,
            opts,
            now_ms,
            ref_stack: Vec::new(),
        }
    }

    pub fn generate(&mut self, schema: &Value) -> Value {
        self.gen(schema, 0)
    }

    fn gen(&mut self, schema: &Value, depth: usize) -> Value {
        if depth >= self.opts.max_depth {
            return Value::Null;
        }
        let map = match schema {
            Value::Object(map) => map,
            Value::Bool(true) => return Value::Null,
            _ => return Value::Null,
        };

        if self.opts.use_examples {
            if let Some(example) = map.get("example") {
                return example.clone();
            }
            if let Some(Value::Array(examples)) = map.get("examples") {
                if let Some(first) = examples.first() {
                    return first.clone();
                }
            }
        }

        if let Some(path) = sandbox_ext(map, "faker").and_then(Value::as_str) {
            if let Some(value) = faker::invoke(self.rng, path, self.now_ms) {
                return value;
            }
        }

        if let Some(Value::Array(choices)) = map.get("enum") {
            if choices.is_empty() {
                return Value::Null;
            }
            return self.pick_enum(map, choices);
        }

        if let Some(reference) = map.get("$ref").and_then(Value::as_str) {
            if self.ref_stack.iter().any(|r| r == reference) {
                return Value::Null;
            }
            let resolved = match resolve_pointer(self.doc, reference) {
                Some(v) => v.clone(),
                None => return Value::Null,
            };
            self.ref_stack.push(reference.to_string());
            let value = self.gen(&resolved, depth + 1);
            self.ref_stack.pop();
            return value;
        }

        if let Some(Value::Array(subs)) = map.get("allOf") {
            let merged = merge_all_of(subs, self.doc);
            return self.gen(&merged, depth + 1);
        }
        for keyword in ["anyOf", "oneOf"] {
            if let Some(Value::Array(subs)) = map.get(keyword) {
                if subs.is_empty() {
                    return Value::Null;
                }
                let choice = self.rng.int_between(0, subs.len() as i64 - 1) as usize;
                let sub = subs[choice].clone();
                return self.gen(&sub, depth + 1);
            }
        }

        let declared = map
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| infer_type(map));
        match declared.as_str() {
            "string" => self.gen_string(map),
            "integer" => self.gen_number(map, true),
            "number" => self.gen_number(map, false),
            "boolean" => Value::Bool(self.rng.chance(0.5)),
            "array" => self.gen_array(map, depth),
            "object" => self.gen_object(map, depth),
            _ => Value::Null,
        }
    }

    fn pick_enum(&mut self, map: &Map<String, Value>, choices: &[Value]) -> Value {
        if let Some(Value::Object(weights)) = sandbox_ext(map, "enumWeights") {
            let weighted: Vec<(usize, f64)> = choices
                .iter()
                .enumerate()
                .map(|(i, choice)| {
                    let key = choice.as_str().map(str::to_string).unwrap_or_else(|| {
                        serde_json::to_string(choice).unwrap_or_default()
                    });
                    let w = weights.get(&key).and_then(Value::as_f64).unwrap_or(0.0);
                    (i, w.max(0.0))
                })
                .collect();
            let total: f64 = weighted.iter().map(|(_, w)| w).sum();
            if total > 0.0 {
                let mut draw = self.rng.next_f64() * total;
                for (i, w) in &weighted {
                    draw -= w;
                    if draw < 0.0 {
                        return choices[*i].clone();
                    }
                }
                return choices[choices.len() - 1].clone();
            }
        }
        self.rng.pick(choices).clone()
    }

    fn gen_string(&mut self, map: &Map<String, Value>) -> Value {
        match map.get("format").and_then(Value::as_str) {
            Some("uuid") => return Value::from(self.rng.uuid()),
            Some("email") => {
                return faker::invoke(self.rng, "internet.email", self.now_ms)
                    .unwrap_or(Value::Null)
            }
            Some("uri") | Some("url") => {
                return faker::invoke(self.rng, "internet.url", self.now_ms)
                    .unwrap_or(Value::Null)
            }
            Some("hostname") => {
                let word = *self.rng.pick(LOREM);
                return Value::from(format!("{word}.example.com"));
            }
            Some("ipv4") => {
                let octets: Vec<String> = (0..4)
                    .map(|_| self.rng.int_between(1, 254).to_string())
                    .collect();
                return Value::from(octets.join("."));
            }
            Some("ipv6") => {
                let groups: Vec<String> = (0..8)
                    .map(|_| format!("{:04x}", self.rng.int_between(0, 0xffff)))
                    .collect();
                return Value::from(groups.join(":"));
            }
            Some("date") => {
                return self
                    .timestamp_near_now()
                    .map(|dt| Value::from(dt.format("%Y-%m-%d").to_string()))
                    .unwrap_or(Value::Null);
            }
            Some("date-time") => {
                return self
                    .timestamp_near_now()
                    .map(|dt| Value::from(dt.to_rfc3339()))
                    .unwrap_or(Value::Null);
            }
            Some("time") => {
                let h = self.rng.int_between(0, 23);
                let m = self.rng.int_between(0, 59);
                let s = self.rng.int_between(0, 59);
                return Value::from(format!("{h:02}:{m:02}:{s:02}"));
            }
            Some("password") => {
                let n = self.rng.int_between(10_000_000, 99_999_999);
                return Value::from(format!("pw-{n}"));
            }
            Some("byte") => {
                use base64::Engine as _;
                let bytes: Vec<u8> = (0..12).map(|_| self.rng.next_u32() as u8).collect();
                return Value::from(base64::engine::general_purpose::STANDARD.encode(bytes));
            }
            Some("binary") => {
                let bytes: Vec<String> = (0..8)
                    .map(|_| format!("{:02x}", self.rng.next_u32() as u8))
                    .collect();
                return Value::from(bytes.concat());
            }
            _ => {}
        }

        let min = map.get("minLength").and_then(Value::as_u64).unwrap_or(0) as usize;
        let max = map
            .get("maxLength")
            .and_then(Value::as_u64)
            .map(|m| m as usize)
            .unwrap_or(self.opts.string_cap)
            .min(self.opts.string_cap.max(min));
        let max = max.max(min);
        let target = self.rng.int_between(min as i64, max as i64) as usize;

        let mut text = String::new();
        while text.len() < target {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(*self.rng.pick(LOREM));
        }
        // pad or truncate to fit the bounds exactly
        text.truncate(target.max(min));
        while text.len() < min {
            text.push('x');
        }
        Value::from(text)
    }

    fn gen_number(&mut self, map: &Map<String, Value>, integer: bool) -> Value {
        let mut min = map
            .get("minimum")
            .and_then(Value::as_f64)
            .unwrap_or(-1_000_000.0);
        let mut max = map
            .get("maximum")
            .and_then(Value::as_f64)
            .unwrap_or(1_000_000.0);
        let multiple = map.get("multipleOf").and_then(Value::as_f64).filter(|m| *m > 0.0);
        let step = multiple.unwrap_or(if integer { 1.0 } else { 0.0 });

        // adjust for both exclusive-bound forms
        if map.get("exclusiveMinimum") == Some(&Value::Bool(true)) {
            min += step.max(f64::EPSILON);
        }
        if let Some(x) = map.get("exclusiveMinimum").and_then(Value::as_f64) {
            min = min.max(x + step.max(f64::EPSILON));
        }
        if map.get("exclusiveMaximum") == Some(&Value::Bool(true)) {
            max -= step.max(f64::EPSILON);
        }
        if let Some(x) = map.get("exclusiveMaximum").and_then(Value::as_f64) {
            max = max.min(x - step.max(f64::EPSILON));
        }
        if min > max {
            return Value::Null;
        }

        let mut n = self.rng.float_between(min, max);
        if let Some(m) = multiple {
            n = (n / m).round() * m;
            if n < min {
                n += m;
            }
            if n > max {
                n -= m;
            }
        }
        if integer {
            let (lo, hi) = (min.ceil(), max.floor());
            if lo > hi {
                return Value::Null;
            }
            n = n.round().clamp(lo, hi);
            Value::from(n as i64)
        } else {
            serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
    }

    fn gen_array(&mut self, map: &Map<String, Value>, depth: usize) -> Value {
        let min = map.get("minItems").and_then(Value::as_u64).unwrap_or(1) as usize;
        let max = map
            .get("maxItems")
            .and_then(Value::as_u64)
            .map(|m| m as usize)
            .unwrap_or(self.opts.array_cap)
            .min(self.opts.array_cap.max(min))
            .max(min);
        let len = self.rng.int_between(min as i64, max as i64) as usize;
        let item_schema = map.get("items").cloned().unwrap_or(Value::Bool(true));

        let mut items: Vec<Value> = (0..len)
            .map(|_| self.gen(&item_schema, depth + 1))
            .collect();
        if map.get("uniqueItems") == Some(&Value::Bool(true)) {
            // one-shot dedupe; no retries to refill
            let mut seen = Vec::new();
            items.retain(|item| {
                if seen.contains(item) {
                    false
                } else {
                    seen.push(item.clone());
                    true
                }
            });
        }
        Value::Array(items)
    }

    fn gen_object(&mut self, map: &Map<String, Value>, depth: usize) -> Value {
        let properties = map.get("properties").and_then(Value::as_object);
        let required: Vec<&str> = map
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let max_props = map
            .get("maxProperties")
            .and_then(Value::as_u64)
            .map(|m| m as usize);

        let mut out = Map::new();
        if let Some(props) = properties {
            for (name, prop_schema) in props {
                let include = required.contains(&name.as_str()) || self.rng.chance(0.7);
                if !include {
                    continue;
                }
                if let Some(cap) = max_props {
                    if out.len() >= cap {
                        break;
                    }
                }
                out.insert(name.clone(), self.gen(prop_schema, depth + 1));
            }
        }

        if let Some(extra_schema @ Value::Object(_)) = map.get("additionalProperties") {
            let extra_schema = extra_schema.clone();
            let count = self.rng.int_between(1, self.opts.extra_props_cap as i64) as usize;
            for i in 0..count {
                if let Some(cap) = max_props {
                    if out.len() >= cap {
                        break;
                    }
                }
                let word = *self.rng.pick(LOREM);
                out.insert(format!("{word}{i}"), self.gen(&extra_schema, depth + 1));
            }
        }

        Value::Object(out)
    }

    fn timestamp_near_now(&mut self) -> Option<chrono::DateTime<Utc>> {
        let offset = self.rng.int_between(-30 * 86_400_000, 30 * 86_400_000);
        match Utc.timestamp_millis_opt(self.now_ms + offset) {
            chrono::LocalResult::Single(dt) => Some(dt),
            _ => None,
        }
    }
}

/// Read `x-sandbox.<key>`, the vendor extension namespace.
fn sandbox_ext<'v>(map: &'v Map<String, Value>, key: &str) -> Option<&'v Value> {
    map.get("x-sandbox").and_then(|ext| ext.get(key))
}

/// Merge `allOf` subschemas: property union, required union, scalar
/// keywords from later subschemas override earlier ones.
fn merge_all_of(subs: &[Value], doc: &Value) -> Value {
    let mut merged = Map::new();
    let mut properties = Map::new();
    let mut required: Vec<Value> = Vec::new();

    for sub in subs {
        let resolved = match sub.get("$ref").and_then(Value::as_str) {
            Some(reference) => match resolve_pointer(doc, reference) {
                Some(v) => v.clone(),
                None => continue,
            },
            None => sub.clone(),
        };
        let Value::Object(sub_map) = resolved else {
            continue;
        };
        for (k, v) in sub_map {
            match k.as_str() {
                "properties" => {
                    if let Value::Object(props) = v {
                        for (name, schema) in props {
                            properties.insert(name, schema);
                        }
                    }
                }
                "required" => {
                    if let Value::Array(names) = v {
                        for name in names {
                            if !required.contains(&name) {
                                required.push(name);
                            }
                        }
                    }
                }
                _ => {
                    merged.insert(k, v);
                }
            }
        }
    }

    if !properties.is_empty() {
        merged.insert("properties".into(), Value::Object(properties));
    }
    if !required.is_empty() {
        merged.insert("required".into(), Value::Array(required));
    }
    merged.entry("type").or_insert(Value::from("object"));
    Value::Object(merged)
}

fn infer_type(map: &Map<String, Value>) -> String {
    if map.contains_key("properties") || map.contains_key("additionalProperties") {
        "object".to_string()
    } else if map.contains_key("items") {
        "array".to_string()
    } else if map.contains_key("minimum") || map.contains_key("maximum") {
        "number".to_string()
    } else if map.contains_key("minLength")
        || map.contains_key("maxLength")
        || map.contains_key("pattern")
        || map.contains_key("format")
    {
        "string".to_string()
    } else {
        "null".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000_000;

    fn generate_seeded(schema: &Value, seed: &str) -> Value {
        let opts = GenerateOptions::default();
        let mut rng = SeededRng::from_seed_str(seed);
        Generator::new(&Value::Null, &mut rng, &opts, NOW).generate(schema)
    }

    #[test]
    fn test_example_takes_precedence() {
        let schema = json!({"type": "string", "example": "fixed"});
        assert_eq!(generate_seeded(&schema, "a"), json!("fixed"));
        assert_eq!(generate_seeded(&schema, "b"), json!("fixed"));
    }

    #[test]
    fn test_examples_disabled_generates() {
        let schema = json!({"type": "integer", "example": 7, "minimum": 100, "maximum": 200});
        let opts = GenerateOptions {
            use_examples: false,
            ..GenerateOptions::default()
        };
        let mut rng = SeededRng::from_seed_str("x");
        let value = Generator::new(&Value::Null, &mut rng, &opts, NOW).generate(&schema);
        let n = value.as_i64().unwrap();
        assert!((100..=200).contains(&n));
    }

    #[test]
    fn test_deterministic_across_generators() {
        let schema = json!({
            "type": "object",
            "required": ["id", "tags", "score"],
            "properties": {
                "id": {"type": "string", "format": "uuid"},
                "tags": {"type": "array", "items": {"type": "string"}},
                "score": {"type": "number", "minimum": 0, "maximum": 1},
            },
        });
        assert_eq!(generate_seeded(&schema, "s"), generate_seeded(&schema, "s"));
    }

    #[test]
    fn test_integer_bounds() {
        let schema = json!({"type": "integer", "minimum": 5, "maximum": 10});
        for seed in ["a", "b", "c", "d", "e"] {
            let n = generate_seeded(&schema, seed).as_i64().unwrap();
            assert!((5..=10).contains(&n), "{n} out of range");
        }
    }

    #[test]
    fn test_multiple_of_snapping() {
        let schema = json!({"type": "integer", "minimum": 0, "maximum": 100, "multipleOf": 5});
        for seed in ["a", "b", "c"] {
            let n = generate_seeded(&schema, seed).as_i64().unwrap();
            assert_eq!(n % 5, 0);
        }
    }

    #[test]
    fn test_string_length_bounds() {
        let schema = json!({"type": "string", "minLength": 8, "maxLength": 12});
        for seed in ["a", "b", "c"] {
            let s = generate_seeded(&schema, seed);
            let len = s.as_str().unwrap().len();
            assert!((8..=12).contains(&len), "bad length {len}");
        }
    }

    #[test]
    fn test_uuid_format() {
        let schema = json!({"type": "string", "format": "uuid"});
        let s = generate_seeded(&schema, "u");
        assert_eq!(s.as_str().unwrap().len(), 36);
    }

    #[test]
    fn test_required_properties_always_present() {
        let schema = json!({
            "type": "object",
            "required": ["must"],
            "properties": {
                "must": {"type": "integer"},
                "maybe": {"type": "integer"},
            },
        });
        for seed in ["a", "b", "c", "d"] {
            let obj = generate_seeded(&schema, seed);
            assert!(obj.get("must").is_some());
        }
    }

    #[test]
    fn test_ref_cycle_yields_null() {
        let doc = json!({
            "components": {"schemas": {"Node": {
                "type": "object",
                "required": ["next"],
                "properties": {"next": {"$ref": "#/components/schemas/Node"}},
            }}},
        });
        let schema = json!({"$ref": "#/components/schemas/Node"});
        let opts = GenerateOptions::default();
        let mut rng = SeededRng::from_seed_str("n");
        let value = Generator::new(&doc, &mut rng, &opts, NOW).generate(&schema);
        // the inner revisit breaks the cycle with null
        assert_eq!(value.pointer("/next"), Some(&Value::Null));
    }

    #[test]
    fn test_all_of_union() {
        let schema = json!({
            "allOf": [
                {"type": "object", "required": ["a"], "properties": {"a": {"type": "integer"}}},
                {"type": "object", "required": ["b"], "properties": {"b": {"type": "string"}}},
            ],
        });
        let obj = generate_seeded(&schema, "m");
        assert!(obj.get("a").unwrap().is_i64() || obj.get("a").unwrap().is_u64());
        assert!(obj.get("b").unwrap().is_string());
    }

    #[test]
    fn test_faker_hint() {
        let schema = json!({"type": "string", "x-sandbox": {"faker": "internet.email"}});
        let s = generate_seeded(&schema, "f");
        assert!(s.as_str().unwrap().contains('@'));
    }

    #[test]
    fn test_weighted_enum_distribution() {
        // S3: weights red:5 green:2 blue:1 over 8000 draws within 2%
        let schema = json!({
            "type": "string",
            "enum": ["red", "green", "blue"],
            "x-sandbox": {"enumWeights": {"red": 5, "green": 2, "blue": 1}},
        });
        let opts = GenerateOptions::default();
        let mut rng = SeededRng::from_seed_str("t");
        let mut counts = std::collections::HashMap::new();
        for _ in 0..8000 {
            let v = Generator::new(&Value::Null, &mut rng, &opts, NOW).generate(&schema);
            *counts.entry(v.as_str().unwrap().to_string()).or_insert(0usize) += 1;
        }
        let frac = |color: &str| counts.get(color).copied().unwrap_or(0) as f64 / 8000.0;
        assert!((frac("red") - 5.0 / 8.0).abs() < 0.02, "red {}", frac("red"));
        assert!((frac("green") - 2.0 / 8.0).abs() < 0.02, "green {}", frac("green"));
        assert!((frac("blue") - 1.0 / 8.0).abs() < 0.02, "blue {}", frac("blue"));
    }

    #[test]
    fn test_max_depth_yields_null() {
        let schema = json!({"type": "string"});
        let opts = GenerateOptions {
            max_depth: 0,
            ..GenerateOptions::default()
        };
        let mut rng = SeededRng::from_seed_str("d");
        let value = Generator::new(&Value::Null, &mut rng, &opts, NOW).generate(&schema);
        assert_eq!(value, Value::Null);
    }

    #[test]
    fn test_unique_items_one_shot_dedupe() {
        let schema = json!({
            "type": "array",
            "minItems": 4,
            "maxItems": 4,
            "uniqueItems": true,
            "items": {"type": "boolean"},
        });
        let arr = generate_seeded(&schema, "q");
        let arr = arr.as_array().unwrap();
        // after dedupe at most the two distinct booleans remain
        assert!(arr.len() <= 2);
    }
}
