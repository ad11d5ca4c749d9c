//! Outgoing argument coercion for Postgres.
//!
//! Arguments targeting `json`/`jsonb` placeholders are normalized to a single
//! JSON text value, and primitive arrays are rewritten to Postgres array
//! literals (`{"a","b"}`) so they bind to array-typed columns.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::models::Value;

static JSON_CAST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\d+)\s*::\s*jsonb?").expect("valid regex"));
static JSON_CAST_FN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"cast\s*\(\s*\$(\d+)\s+as\s+jsonb?\s*\)").expect("valid regex")
});
static ARRAY_ANY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"any\s*\(\s*\$(\d+)\s*\)").expect("valid regex"));
static ARRAY_CAST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\d+)\s*::\s*[a-z0-9_]+\[\]").expect("valid regex"));
static JSON_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?\d+(?:\.\d+)?$").expect("valid regex"));

/// 1-based parameter indexes that the SQL casts to `json`/`jsonb`.
pub fn json_param_indexes(sql: &str) -> HashSet<usize> {
    let lower = sql.to_lowercase();
    capture_indexes(&lower, &[&JSON_CAST, &JSON_CAST_FN])
}

/// 1-based parameter indexes the SQL uses as native arrays (`ANY($n)`, `$n::type[]`).
pub fn array_param_indexes(sql: &str) -> HashSet<usize> {
    let lower = sql.to_lowercase();
    capture_indexes(&lower, &[&ARRAY_ANY, &ARRAY_CAST])
}

fn capture_indexes(sql: &str, patterns: &[&Regex]) -> HashSet<usize> {
    patterns
        .iter()
        .flat_map(|re| re.captures_iter(sql))
        .filter_map(|caps| caps.get(1).and_then(|m| m.as_str().parse().ok()))
        .collect()
}

/// Coerce `args` (in caller order) for the statement `sql`.
///
/// Returns `args` untouched when no argument is an array and no JSON cast is
/// present.
pub fn coerce_args(sql: &str, args: Vec<Value>) -> Vec<Value> {
    let json_indexes = json_param_indexes(sql);
    if json_indexes.is_empty() && !args.iter().any(|v| matches!(v, Value::Array(_))) {
        return args;
    }

    let array_indexes = array_param_indexes(sql);
    args.into_iter()
        .enumerate()
        .map(|(idx, value)| {
            let position = idx + 1;
            if json_indexes.contains(&position) {
                return ensure_json_text(value);
            }
            match value {
                Value::Array(items) if is_primitive_array(&items) => {
                    if array_indexes.contains(&position) {
                        tracing::trace!(position, "Binding array parameter as array literal");
                    }
                    Value::Text(to_array_literal(&items))
                }
                other => other,
            }
        })
        .collect()
}

/// Normalize a value bound to a JSON placeholder to JSON text.
///
/// Strings that already look like JSON (object, array, `null`, booleans,
/// numbers) pass through so they are not double-encoded. SQL NULL stays NULL.
pub fn ensure_json_text(value: Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Text(s) => {
            if looks_like_json_text(&s) {
                Value::Text(s)
            } else {
                Value::Text(serde_json::Value::String(s).to_string())
            }
        }
        other => Value::Text(other.to_json().to_string()),
    }
}

fn looks_like_json_text(s: &str) -> bool {
    let t = s.trim();
    t.starts_with('{')
        || t.starts_with('[')
        || matches!(t, "null" | "true" | "false")
        || JSON_NUMBER.is_match(t)
}

fn is_primitive_array(items: &[Value]) -> bool {
    items.iter().all(Value::is_plain_primitive)
}

/// Postgres array literal for a primitive array.
pub fn to_array_literal(items: &[Value]) -> String {
    let encoded: Vec<String> = items.iter().map(encode_array_item).collect();
    format!("{{{}}}", encoded.join(","))
}

fn encode_array_item(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::BigInt(i) => i.to_string(),
        Value::Float(f) if f.is_finite() => format_number(*f),
        Value::Float(_) => "NULL".to_string(),
        Value::Text(s) => quote_element(s),
        other => quote_element(&other.to_json().to_string()),
    }
}

/// Integral floats print without a fractional part.
fn format_number(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e21 {
        format!("{:.0}", f)
    } else {
        f.to_string()
    }
}

fn quote_element(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}
