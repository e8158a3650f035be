/// Condition rule evaluation
///
/// The engine only consumes the boolean a condition produces. Where that boolean
/// comes from is pluggable through [`ConditionEvaluator`]; the default
/// [`RuleEvaluator`] understands the two config shapes the editor writes:
///
/// - structured: `{ "field": "$.task.priority", "operator": "equals", "value": "urgent" }`
/// - expression: `{ "expression": "task.priority == 'urgent'" }` (or the editor's
///   `condition` key), evaluated as a sandboxed Lua boolean expression

use crate::error::NodeError;
use crate::flow::types::{Context, FlowNode};
use mlua::{HookTriggers, Lua, LuaSerdeExt, VmState};
use serde_json::Value;
use std::time::{Duration, Instant};

/// Wall-clock budget for one expression
const EXPRESSION_TIME_LIMIT: Duration = Duration::from_secs(2);
/// Instructions between deadline checks
const HOOK_INTERVAL: u32 = 10_000;
const MEMORY_LIMIT: usize = 16 * 1024 * 1024;

/// Produces the boolean outcome of a condition node
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, node: &FlowNode, context: &Context) -> Result<bool, NodeError>;
}

/// Comparison operators offered by the editor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
}

impl Operator {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "equals" | "==" => Some(Operator::Equals),
            "not_equals" | "!=" => Some(Operator::NotEquals),
            "contains" => Some(Operator::Contains),
            "greater_than" | ">" => Some(Operator::GreaterThan),
            "less_than" | "<" => Some(Operator::LessThan),
            _ => None,
        }
    }
}

/// Default evaluator: JSONPath comparisons and sandboxed Lua expressions
#[derive(Debug, Default, Clone)]
pub struct RuleEvaluator;

impl ConditionEvaluator for RuleEvaluator {
    fn evaluate(&self, node: &FlowNode, context: &Context) -> Result<bool, NodeError> {
        if let Some(field) = node.config_str("field") {
            let operator = match node.config_str("operator") {
                Some(raw) => Operator::parse(raw).ok_or_else(|| {
                    NodeError::invalid(
                        &node.id,
                        "operator",
                        format!("unknown operator '{}'", raw),
                    )
                })?,
                None => Operator::Equals,
            };
            let expected = node.config().get("value").cloned().unwrap_or(Value::Null);
            return compare_field(node, context, field, operator, &expected);
        }

        let expression = node
            .config_str("expression")
            .or_else(|| node.config_str("condition"))
            .ok_or_else(|| NodeError::missing(&node.id, "expression"))?;

        evaluate_expression(expression, context, EXPRESSION_TIME_LIMIT).map_err(|reason| NodeError::Condition {
            node: node.id.clone(),
            reason,
        })
    }
}

/// Resolve `field` against the context and apply the operator
fn compare_field(
    node: &FlowNode,
    context: &Context,
    field: &str,
    operator: Operator,
    expected: &Value,
) -> Result<bool, NodeError> {
    let path = if field.starts_with('$') {
        field.to_string()
    } else {
        format!("$.{}", field)
    };

    let document = Value::Object(context.clone());
    let matches = jsonpath_lib::select(&document, &path)
        .map_err(|e| NodeError::invalid(&node.id, "field", format!("{:?}", e)))?;
    let actual = matches.first().copied().unwrap_or(&Value::Null);

    tracing::debug!("🔍 Condition '{}': {} {:?} {} (actual: {})", node.id, path, operator, expected, actual);

    let outcome = match operator {
        Operator::Equals => loosely_equal(actual, expected),
        Operator::NotEquals => !loosely_equal(actual, expected),
        Operator::Contains => match actual {
            Value::String(s) => s.contains(&as_text(expected)),
            Value::Array(items) => items.iter().any(|item| loosely_equal(item, expected)),
            Value::Object(map) => map.contains_key(&as_text(expected)),
            _ => false,
        },
        Operator::GreaterThan | Operator::LessThan => {
            if actual.is_null() {
                return Ok(false);
            }
            let (Some(left), Some(right)) = (as_number(actual), as_number(expected)) else {
                return Err(NodeError::Condition {
                    node: node.id.clone(),
                    reason: format!("cannot order {} and {}", actual, expected),
                });
            };
            if operator == Operator::GreaterThan {
                left > right
            } else {
                left < right
            }
        }
    };
    Ok(outcome)
}

/// Equality that tolerates the editor storing every value as text
fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => !a.is_null() && !b.is_null() && as_text(a) == as_text(b),
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Translate the JavaScript-flavoured operators the editor suggests into Lua
fn normalize_expression(expr: &str) -> String {
    expr.replace("!==", "~=")
        .replace("===", "==")
        .replace("!=", "~=")
        .replace("&&", " and ")
        .replace("||", " or ")
}

/// Evaluate a boolean Lua expression with the context bound as globals
///
/// Every top-level context key becomes a global, and the whole context is
/// available as `ctx`. Dangerous libraries are removed before evaluation.
/// The script is aborted once `limit` has elapsed or it outgrows `MEMORY_LIMIT`.
fn evaluate_expression(expr: &str, context: &Context, limit: Duration) -> Result<bool, String> {
    let lua = Lua::new();
    lua.set_memory_limit(MEMORY_LIMIT)
        .map_err(|e| format!("failed to limit memory: {}", e))?;
    let deadline = Instant::now() + limit;
    lua.set_hook(HookTriggers::new().every_nth_instruction(HOOK_INTERVAL), move |_, _| {
        if Instant::now() >= deadline {
            Err(mlua::Error::runtime("condition exceeded its time limit"))
        } else {
            Ok(VmState::Continue)
        }
    })
    .map_err(|e| format!("failed to install time limit: {}", e))?;

    let globals = lua.globals();

    for name in [
        "os", "io", "debug", "package", "require", "load", "loadfile", "dofile",
        "collectgarbage", "rawget", "rawset", "setmetatable", "getmetatable",
    ] {
        globals
            .set(name, mlua::Nil)
            .map_err(|e| format!("failed to sandbox '{}': {}", name, e))?;
    }

    for (key, value) in context {
        let lua_value = lua
            .to_value(value)
            .map_err(|e| format!("failed to expose '{}': {}", key, e))?;
        globals
            .set(key.as_str(), lua_value)
            .map_err(|e| format!("failed to expose '{}': {}", key, e))?;
    }
    let ctx = lua
        .to_value(context)
        .map_err(|e| format!("failed to expose context: {}", e))?;
    globals
        .set("ctx", ctx)
        .map_err(|e| format!("failed to expose context: {}", e))?;

    let source = normalize_expression(expr);
    lua.load(source.as_str())
        .set_name("condition")
        .eval::<bool>()
        .map_err(|e| e.to_string())
}
