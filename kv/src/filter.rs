//! Compiles a structured predicate tree into parameterized SQL over the
//! JSON-extracted value column.
//!
//! The input is a JSON tree: logical nodes (`and`, `or`, `not`) and field
//! nodes keyed by a dot/bracket path (`profile.verified`, `items[0].price`)
//! whose value is either an operator map or a bare primitive (shorthand for
//! `eq`). Every user-supplied value is bound as a parameter, including the
//! JSON paths themselves; no input ever lands in the SQL text.

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use crate::error::{CResult, Error};

/// A compiled predicate: SQL fragment plus bind parameters, in order.
#[derive(Debug)]
pub struct CompiledFilter {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Marker string resolved to the current wall clock (epoch milliseconds) at
/// compile time. Keeps filters portable through JSON serialization.
const NOW_MARKER: &str = "$now";

const OPERATORS: &[&str] = &[
    "eq", "ne", "gt", "gte", "lt", "lte", "between", "in", "nin", "contains", "notContains",
    "startsWith", "endsWith", "containsi", "notContainsi", "startsWithi", "endsWithi", "null",
    "empty", "notEmpty",
];

/// Compiles `filter` against `column` (the SQL expression holding the stored
/// JSON value, e.g. `value` or `e.value`). `None` and empty trees compile to
/// `1=1`.
pub fn compile_where(filter: Option<&Value>, column: &str) -> CResult<CompiledFilter> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let mut params = Vec::new();
    let sql = match filter {
        None | Some(Value::Null) => "1=1".to_string(),
        Some(node) => {
            let sql = compile_node(node, column, now_ms, &mut params)?;
            if sql.is_empty() {
                "1=1".to_string()
            } else {
                sql
            }
        }
    };
    Ok(CompiledFilter { sql, params })
}

fn compile_node(
    node: &Value,
    column: &str,
    now_ms: i64,
    params: &mut Vec<SqlValue>,
) -> CResult<String> {
    let map = node
        .as_object()
        .ok_or_else(|| Error::InvalidArgument("filter node must be an object".into()))?;
    let mut clauses = Vec::new();
    for (key, value) in map {
        match key.as_str() {
            "and" | "or" => {
                let children = value.as_array().ok_or_else(|| {
                    Error::InvalidArgument(format!("`{}` expects an array of filters", key))
                })?;
                if children.is_empty() {
                    continue;
                }
                let joined = children
                    .iter()
                    .map(|c| compile_node(c, column, now_ms, params))
                    .collect::<CResult<Vec<_>>>()?
                    .join(&format!(" {} ", key.to_uppercase()));
                clauses.push(format!("({})", joined));
            }
            "not" => {
                let inner = compile_node(value, column, now_ms, params)?;
                clauses.push(format!("NOT ({})", inner));
            }
            path => clauses.push(compile_field(path, value, column, now_ms, params)?),
        }
    }
    Ok(clauses.join(" AND "))
}

/// One field reference: `json_extract(<column>, '$.<path>')` with the path
/// bound as a parameter.
fn field_expr(path: &str, column: &str, params: &mut Vec<SqlValue>) -> String {
    params.push(SqlValue::Text(format!("$.{}", path)));
    format!("json_extract({}, ?)", column)
}

fn compile_field(
    path: &str,
    spec: &Value,
    column: &str,
    now_ms: i64,
    params: &mut Vec<SqlValue>,
) -> CResult<String> {
    // Bare primitive is shorthand for eq.
    let ops: Vec<(String, Value)> = match spec {
        Value::Object(map) if map.keys().any(|k| OPERATORS.contains(&k.as_str())) => {
            if let Some(bad) = map.keys().find(|k| !OPERATORS.contains(&k.as_str())) {
                return Err(Error::InvalidArgument(format!(
                    "unknown operator `{}` on field `{}`",
                    bad, path
                )));
            }
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        }
        Value::Object(_) | Value::Array(_) => {
            return Err(Error::InvalidArgument(format!(
                "field `{}` needs an operator map or a primitive",
                path
            )))
        }
        primitive => vec![("eq".to_string(), primitive.clone())],
    };

    let mut clauses = Vec::new();
    for (op, operand) in ops {
        clauses.push(compile_op(path, &op, &operand, column, now_ms, params)?);
    }
    Ok(clauses.join(" AND "))
}

fn compile_op(
    path: &str,
    op: &str,
    operand: &Value,
    column: &str,
    now_ms: i64,
    params: &mut Vec<SqlValue>,
) -> CResult<String> {
    let sql = match op {
        "eq" if operand.is_null() => format!("{} IS NULL", field_expr(path, column, params)),
        "ne" if operand.is_null() => format!("{} IS NOT NULL", field_expr(path, column, params)),
        "eq" | "ne" | "gt" | "gte" | "lt" | "lte" => {
            let cmp = match op {
                "eq" => "=",
                "ne" => "<>",
                "gt" => ">",
                "gte" => ">=",
                "lt" => "<",
                _ => "<=",
            };
            let expr = field_expr(path, column, params);
            params.push(bind_scalar(operand, now_ms)?);
            format!("{} {} ?", expr, cmp)
        }
        "between" => {
            let bounds = operand.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                Error::InvalidArgument(format!("`between` on `{}` needs [low, high]", path))
            })?;
            let expr = field_expr(path, column, params);
            params.push(bind_scalar(&bounds[0], now_ms)?);
            params.push(bind_scalar(&bounds[1], now_ms)?);
            format!("{} BETWEEN ? AND ?", expr)
        }
        "in" | "nin" => {
            let items = operand.as_array().ok_or_else(|| {
                Error::InvalidArgument(format!("`{}` on `{}` needs an array", op, path))
            })?;
            if items.is_empty() {
                // IN () matches nothing; NOT IN () matches everything.
                return Ok(if op == "in" { "0=1".into() } else { "1=1".into() });
            }
            let expr = field_expr(path, column, params);
            let placeholders = vec!["?"; items.len()].join(", ");
            for item in items {
                params.push(bind_scalar(item, now_ms)?);
            }
            let not = if op == "nin" { "NOT " } else { "" };
            format!("{} {}IN ({})", expr, not, placeholders)
        }
        "contains" => {
            let expr = field_expr(path, column, params);
            params.push(bind_text(op, path, operand)?);
            format!("instr({}, ?) > 0", expr)
        }
        "notContains" => {
            let a = field_expr(path, column, params);
            let b = field_expr(path, column, params);
            params.push(bind_text(op, path, operand)?);
            format!("({} IS NULL OR instr({}, ?) = 0)", a, b)
        }
        "startsWith" => {
            let expr = field_expr(path, column, params);
            let text = text_operand(op, path, operand)?;
            params.push(SqlValue::Text(text.clone()));
            params.push(SqlValue::Text(text));
            format!("substr({}, 1, length(?)) = ?", expr)
        }
        "endsWith" => {
            let expr = field_expr(path, column, params);
            let text = text_operand(op, path, operand)?;
            params.push(SqlValue::Text(text.clone()));
            params.push(SqlValue::Text(text));
            format!("substr({}, -length(?)) = ?", expr)
        }
        "containsi" | "notContainsi" | "startsWithi" | "endsWithi" => {
            let text = text_operand(op, path, operand)?.to_lowercase();
            let escaped = escape_like(&text);
            let pattern = match op {
                "containsi" | "notContainsi" => format!("%{}%", escaped),
                "startsWithi" => format!("{}%", escaped),
                _ => format!("%{}", escaped),
            };
            if op == "notContainsi" {
                let a = field_expr(path, column, params);
                let b = field_expr(path, column, params);
                params.push(SqlValue::Text(pattern));
                format!("({} IS NULL OR LOWER({}) NOT LIKE ? ESCAPE '\\')", a, b)
            } else {
                let expr = field_expr(path, column, params);
                params.push(SqlValue::Text(pattern));
                format!("LOWER({}) LIKE ? ESCAPE '\\'", expr)
            }
        }
        "null" => {
            let expr = field_expr(path, column, params);
            if operand.as_bool().unwrap_or(true) {
                format!("{} IS NULL", expr)
            } else {
                format!("{} IS NOT NULL", expr)
            }
        }
        "empty" | "notEmpty" => {
            let a = field_expr(path, column, params);
            let b = field_expr(path, column, params);
            let c = field_expr(path, column, params);
            let d = field_expr(path, column, params);
            let e = field_expr(path, column, params);
            let empty = format!(
                "({a} IS NULL OR {b} = '' OR (json_valid({c}) AND json_type({d}) = 'array' AND json_array_length({e}) = 0))",
            );
            if op == "empty" {
                empty
            } else {
                format!("NOT {}", empty)
            }
        }
        other => {
            return Err(Error::InvalidArgument(format!(
                "unknown operator `{}` on field `{}`",
                other, path
            )))
        }
    };
    Ok(sql)
}

fn bind_scalar(operand: &Value, now_ms: i64) -> CResult<SqlValue> {
    match operand {
        Value::String(s) if s == NOW_MARKER => Ok(SqlValue::Integer(now_ms)),
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(SqlValue::Integer(i))
            } else {
                Ok(SqlValue::Real(n.as_f64().ok_or_else(|| {
                    Error::InvalidArgument(format!("unrepresentable number {}", n))
                })?))
            }
        }
        Value::Bool(b) => Ok(SqlValue::Integer(*b as i64)),
        Value::Null => Ok(SqlValue::Null),
        other => Err(Error::InvalidArgument(format!(
            "filter operand must be a scalar, got {}",
            other
        ))),
    }
}

fn text_operand(op: &str, path: &str, operand: &Value) -> CResult<String> {
    operand
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidArgument(format!("`{}` on `{}` needs a string", op, path)))
}

fn bind_text(op: &str, path: &str, operand: &Value) -> CResult<SqlValue> {
    Ok(SqlValue::Text(text_operand(op, path, operand)?))
}

/// Escapes LIKE metacharacters for use with `ESCAPE '\'`.
fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
