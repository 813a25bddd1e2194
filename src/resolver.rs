//! Expression resolution seam.
//!
//! The executor treats expressions (`condition`, `items`, input templates,
//! state-write values) as opaque strings resolved against a
//! [`ContextSnapshot`]. Hosts plug in whatever expression language they use;
//! [`KeyPathResolver`] is the built-in reference implementation covering JSON
//! literals and dotted context paths, which is enough for most graphs and for
//! the test suite.

use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

use crate::context::ContextSnapshot;

#[derive(Debug, Error, Diagnostic)]
pub enum ResolveError {
    #[error("empty expression")]
    #[diagnostic(code(weftflow::resolver::empty))]
    Empty,

    #[error("unresolvable expression: `{expr}`")]
    #[diagnostic(
        code(weftflow::resolver::unresolvable),
        help(
            "Expected a JSON literal or a dotted path rooted at input, state, steps, meta, item, index, items, output, or error."
        )
    )]
    Unresolvable { expr: String },
}

/// Resolves an expression against the current context into a concrete value.
pub trait ExpressionResolver: Send + Sync {
    fn resolve(&self, expr: &str, ctx: &ContextSnapshot) -> Result<Value, ResolveError>;
}

/// Reference resolver: JSON literals and dotted key paths.
///
/// An expression is first parsed as a JSON literal (`true`, `3.5`,
/// `"text"`, `[1,2]`, `{"k":1}`). Anything else is a dotted path whose head
/// selects a context root:
///
/// - `input` — the workflow input payload
/// - `state` — workflow-scoped mutable state
/// - `steps` — prior step outputs by node id
/// - `meta`  — workflow metadata
/// - `item`, `index`, `items`, `output`, `error` — scope locals
///
/// Remaining segments index into objects by key and arrays by position.
/// Missing members resolve to `null` so conditions on absent keys are simply
/// false rather than hard errors.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyPathResolver;

impl KeyPathResolver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

const LOCAL_ROOTS: &[&str] = &["item", "index", "items", "output", "error"];

impl ExpressionResolver for KeyPathResolver {
    fn resolve(&self, expr: &str, ctx: &ContextSnapshot) -> Result<Value, ResolveError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(ResolveError::Empty);
        }
        if let Ok(literal) = serde_json::from_str::<Value>(expr) {
            return Ok(literal);
        }

        let mut parts = expr.split('.');
        let head = parts.next().unwrap_or_default();
        let mut current = match head {
            "input" => ctx.input.clone(),
            "state" => map_to_object(&ctx.state),
            "steps" => map_to_object(&ctx.steps),
            "meta" => map_to_object(&ctx.metadata),
            local if LOCAL_ROOTS.contains(&local) => {
                ctx.locals.get(local).cloned().unwrap_or(Value::Null)
            }
            _ => {
                return Err(ResolveError::Unresolvable {
                    expr: expr.to_string(),
                });
            }
        };
        for segment in parts {
            current = descend(current, segment);
        }
        Ok(current)
    }
}

fn map_to_object(map: &rustc_hash::FxHashMap<String, Value>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<serde_json::Map<_, _>>(),
    )
}

fn descend(value: Value, segment: &str) -> Value {
    match value {
        Value::Object(mut map) => map.remove(segment).unwrap_or(Value::Null),
        Value::Array(mut items) => match segment.parse::<usize>() {
            Ok(i) if i < items.len() => items.swap_remove(i),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}
