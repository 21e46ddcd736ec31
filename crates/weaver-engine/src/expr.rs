//! Path lookup, `{{ path }}` templates and condition expressions.
//!
//! Supported condition forms:
//! - `path`: truthiness of the resolved value
//! - `!expr`: negation
//! - `path exists`
//! - `lhs == rhs`, `lhs != rhs`
//! - `lhs > rhs`, `>=`, `<`, `<=`: numbers, or strings lexically
//! - `lhs contains rhs`: substring, array element, or object key
//!
//! Operands are quoted strings, numbers, `true`/`false`/`null`, or paths.
//! Unknown paths resolve to `null`; an expression never fails to evaluate.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Walk a dot-separated path below `root`. Numeric segments index arrays.
pub fn lookup<'a>(root: &'a Value, path: Option<&str>) -> Option<&'a Value> {
    let Some(path) = path.filter(|p| !p.is_empty()) else {
        return Some(root);
    };
    path.split('.').try_fold(root, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Plain-text rendering: strings unquoted, everything else as JSON.
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("placeholder pattern is valid"))
}

/// Replace each `{{ path }}` with the resolved value. Missing paths render empty.
pub fn render(template: &str, resolve: impl Fn(&str) -> Option<Value>) -> String {
    placeholder()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            resolve(&caps[1]).map(|v| display(&v)).unwrap_or_default()
        })
        .into_owned()
}

/// Render every string leaf of `template`. A string that is exactly one
/// placeholder is replaced by the resolved value itself, keeping its type.
pub fn render_value(template: &Value, resolve: &dyn Fn(&str) -> Option<Value>) -> Value {
    match template {
        Value::String(s) => {
            let re = placeholder();
            if let Some(caps) = re.captures(s) {
                if caps.get(0).is_some_and(|m| m.as_str() == s.trim()) {
                    return resolve(&caps[1]).unwrap_or(Value::Null);
                }
            }
            Value::String(render(s, resolve))
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| render_value(v, resolve)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, resolve)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

const SYMBOLS: [(&str, Op); 6] = [
    (">=", Op::Ge),
    ("<=", Op::Le),
    ("==", Op::Eq),
    ("!=", Op::Ne),
    (">", Op::Gt),
    ("<", Op::Lt),
];

/// Evaluate a condition expression.
pub fn evaluate(expr: &str, resolve: impl Fn(&str) -> Option<Value>) -> bool {
    eval(expr, &resolve)
}

fn eval(expr: &str, resolve: &dyn Fn(&str) -> Option<Value>) -> bool {
    let expr = expr.trim();

    if let Some(rest) = expr.strip_prefix('!') {
        if !rest.starts_with('=') {
            return !eval(rest, resolve);
        }
    }

    if let Some(path) = expr.strip_suffix(" exists") {
        return resolve(path.trim()).is_some();
    }

    match split_operator(expr) {
        Some((lhs, op, rhs)) => compare(&operand(lhs, resolve), op, &operand(rhs, resolve)),
        None => is_truthy(&operand(expr, resolve)),
    }
}

/// Find the first operator outside quotes.
fn split_operator(expr: &str) -> Option<(&str, Op, &str)> {
    let mut quote: Option<char> = None;
    for (i, c) in expr.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None => {
                let rest = &expr[i..];
                if rest.starts_with(" contains ") {
                    return Some((&expr[..i], Op::Contains, &rest[" contains ".len()..]));
                }
                for (symbol, op) in SYMBOLS {
                    if rest.starts_with(symbol) {
                        return Some((&expr[..i], op, &rest[symbol.len()..]));
                    }
                }
            }
        }
    }
    None
}

fn operand(token: &str, resolve: &dyn Fn(&str) -> Option<Value>) -> Value {
    let token = token.trim();
    for q in ['"', '\''] {
        if token.len() >= 2 && token.starts_with(q) && token.ends_with(q) {
            return Value::String(token[1..token.len() - 1].to_string());
        }
    }
    match token {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = serde_json::from_str::<serde_json::Number>(token) {
        return Value::Number(n);
    }
    resolve(token).unwrap_or(Value::Null)
}

fn compare(lhs: &Value, op: Op, rhs: &Value) -> bool {
    match op {
        Op::Eq => matches(lhs, rhs),
        Op::Ne => !matches(lhs, rhs),
        Op::Contains => match (lhs, rhs) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|i| matches(i, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        },
        Op::Gt | Op::Ge | Op::Lt | Op::Le => {
            let ordering = match (lhs, rhs) {
                (Value::Number(a), Value::Number(b)) => {
                    a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b))
                }
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                Op::Gt => ordering.is_gt(),
                Op::Ge => ordering.is_ge(),
                Op::Lt => ordering.is_lt(),
                _ => ordering.is_le(),
            }
        }
    }
}

/// JSON equality, treating `1` and `1.0` as equal.
pub fn matches(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}
