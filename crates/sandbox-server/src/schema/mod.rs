//! Schema-aware validation and deterministic data generation.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

mod generate;
mod validate;

pub use generate::{GenerateOptions, Generator};
pub use validate::{coerce_scalar, resolve_pointer, CompiledSchema, ValidationIssue};

use crate::template::rng::SeededRng;

/// Shared entry point: compiles validators once and caches them by
/// identifier, and drives the seeded generator against the loaded document.
pub struct SchemaEngine {
    doc: Arc<Value>,
    cache: Mutex<HashMap<String, Arc<CompiledSchema>>>,
}

impl SchemaEngine {
    pub fn new(doc: Arc<Value>) -> Self {
        SchemaEngine {
            doc,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The resolved document schemas validate and `$ref` against.
    pub fn document(&self) -> &Value {
        &self.doc
    }

    /// Compile (or fetch) the validator cached under `id`.
    pub fn validator(&self, id: &str, schema: &Value) -> Arc<CompiledSchema> {
        let mut cache = self.cache.lock();
        if let Some(compiled) = cache.get(id) {
            return Arc::clone(compiled);
        }
        let compiled = Arc::new(CompiledSchema::compile(schema.clone()));
        cache.insert(id.to_string(), Arc::clone(&compiled));
        compiled
    }

    /// Validate `value` against `schema`, caching the compiled validator
    /// under `id`. `coerce` enables string coercion for parameter slots.
    pub fn validate(
        &self,
        id: &str,
        schema: &Value,
        value: &Value,
        coerce: bool,
    ) -> Vec<ValidationIssue> {
        self.validator(id, schema).validate(&self.doc, value, coerce)
    }

    /// Synthesize a value for `schema` from the given stream.
    pub fn generate(
        &self,
        schema: &Value,
        rng: &mut SeededRng,
        opts: &GenerateOptions,
        now_ms: i64,
    ) -> Value {
        Generator::new(&self.doc, rng, opts, now_ms).generate(schema)
    }
}
