//! Result shaping and column type inference.
//!
//! # Architecture
//!
//! Shaping works on a whole result set at once:
//! 1. [`infer_column_types`] scans every row of each column and assigns one
//!    [`ColumnType`], promoting heterogeneous columns to `Json`
//! 2. Each value is converted for transport: `Json` columns through
//!    [`ensure_json_string`], everything else through [`serialize_value`]

use regex::Regex;
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::db::client::NativeResult;
use crate::models::{ColumnType, PrimitiveClass, SqlResultSet, Value, iso_string};

static DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("valid regex"));
static DATETIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}").expect("valid regex"));
static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("valid regex")
});

// =============================================================================
// Type Inference
// =============================================================================

/// Column type suggested by a single value.
pub fn infer_value_type(value: &Value) -> ColumnType {
    match value {
        Value::Null => ColumnType::UnknownNumber,
        Value::Bool(_) => ColumnType::Boolean,
        Value::Int(i) => {
            if i32::try_from(*i).is_ok() {
                ColumnType::Int32
            } else {
                ColumnType::Int64
            }
        }
        Value::Float(f) => {
            if f.is_finite() && f.fract() == 0.0 {
                ColumnType::Int32
            } else {
                ColumnType::Double
            }
        }
        Value::BigInt(_) => ColumnType::Int64,
        Value::Text(s) => infer_text_type(s),
        Value::DateTime(_) => ColumnType::DateTime,
        Value::Bytes(_) => ColumnType::Bytes,
        Value::Array(_) | Value::Json(_) => ColumnType::Json,
    }
}

fn infer_text_type(s: &str) -> ColumnType {
    if DATETIME_RE.is_match(s) {
        ColumnType::DateTime
    } else if DATE_RE.is_match(s) {
        ColumnType::Date
    } else if UUID_RE.is_match(s) {
        ColumnType::Uuid
    } else {
        ColumnType::Text
    }
}

/// Per-column observations gathered in one pass over the rows.
#[derive(Debug, Default)]
struct ColumnScan {
    has_array: bool,
    has_non_array: bool,
    has_object: bool,
    array_element: Option<ColumnType>,
    classes: HashSet<PrimitiveClass>,
    representative: Option<ColumnType>,
}

impl ColumnScan {
    fn observe(&mut self, value: &Value) {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                self.has_array = true;
                if self.array_element.is_none() {
                    self.array_element = items
                        .iter()
                        .find(|item| !item.is_null())
                        .map(infer_value_type);
                }
            }
            Value::Json(_) => {
                self.has_object = true;
                self.has_non_array = true;
            }
            scalar => {
                self.has_non_array = true;
                if let Some(class) = scalar.primitive_class() {
                    self.classes.insert(class);
                }
                if self.representative.is_none() {
                    self.representative = Some(infer_value_type(scalar));
                }
            }
        }
    }

    fn resolve(self) -> ColumnType {
        if self.has_object || self.classes.len() > 1 || (self.has_array && self.has_non_array) {
            return ColumnType::Json;
        }
        if self.has_array {
            return self
                .array_element
                .and_then(ColumnType::array_of)
                .unwrap_or(ColumnType::JsonArray);
        }
        self.representative.unwrap_or(ColumnType::UnknownNumber)
    }
}

/// Infer one type per column by scanning every row.
///
/// Nulls are ignored. A column holding structured objects, more than one
/// primitive class, or both arrays and scalars is promoted to `Json`.
pub fn infer_column_types(rows: &[Vec<Value>], column_count: usize) -> Vec<ColumnType> {
    (0..column_count)
        .map(|col| {
            let mut scan = ColumnScan::default();
            for row in rows {
                if let Some(value) = row.get(col) {
                    scan.observe(value);
                }
            }
            scan.resolve()
        })
        .collect()
}

// =============================================================================
// Value Serialization
// =============================================================================

/// Convert a row value for transport.
///
/// Big integers become decimal text, date-times ISO-8601 text and structured
/// objects JSON text. Arrays pass through unchanged so array-typed columns
/// keep their element values.
pub fn serialize_value(value: Value) -> Value {
    match value {
        Value::BigInt(i) => Value::Text(i.to_string()),
        Value::DateTime(dt) => Value::Text(iso_string(&dt)),
        Value::Json(v) => Value::Text(v.to_string()),
        other => other,
    }
}

/// Render a value of a `Json` column as JSON text.
pub fn ensure_json_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Text(s) => {
            let t = s.trim();
            if !is_jsonish(t) {
                return JsonValue::String(t.to_string()).to_string();
            }
            if serde_json::from_str::<JsonValue>(t).is_ok() {
                return t.to_string();
            }
            let unwrapped = t.trim_start_matches('"').trim_end_matches('"');
            JsonValue::String(unwrapped.to_string()).to_string()
        }
        Value::Bytes(bytes) => {
            JsonValue::Array(bytes.iter().map(|b| JsonValue::from(*b)).collect()).to_string()
        }
        other => other.to_json().to_string(),
    }
}

fn is_jsonish(t: &str) -> bool {
    t.starts_with('{') || t.starts_with('[') || (t.starts_with('"') && t.ends_with('"'))
}

/// Shape a raw native result into a transport result set.
pub fn shape_result(result: NativeResult) -> SqlResultSet {
    if result.rows.is_empty() {
        return SqlResultSet::empty();
    }

    let column_names = result.columns;
    let column_types = infer_column_types(&result.rows, column_names.len());
    let rows = result
        .rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .zip(&column_types)
                .map(|(value, ty)| match ty {
                    ColumnType::Json => Value::Text(ensure_json_string(&value)),
                    _ => serialize_value(value),
                })
                .collect()
        })
        .collect();

    SqlResultSet {
        column_names,
        column_types,
        rows,
    }
}
