//! `{{...}}` variable substitution.
//!
//! Grammar: `{{var}}`, `{{var|default}}`, dotted paths with array indices
//! (`{{obj.items.0}}`), `{{$}}` for the whole context, `{{_ksi_context.x}}`
//! for caller-supplied context, and `{{func(arg)}}` for the built-in
//! functions. Complex values render as JSON. Strict mode fails fast on a
//! missing variable, naming it and the names that were available.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("missing variable `{name}` (available: {})", available.join(", "))]
    MissingVariable {
        name: String,
        available: Vec<String>,
    },

    #[error("unknown template function `{0}`")]
    UnknownFunction(String),
}

fn pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^{}]+)\}\}").expect("static regex"))
}

/// Substitute every `{{...}}` in `template` from `context`.
///
/// `strict` controls missing-variable handling: fail fast versus leaving the
/// placeholder in place.
pub fn substitute(template: &str, context: &Value, strict: bool) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0usize;
    for captures in pattern().captures_iter(template) {
        let whole = captures.get(0).expect("match always has group 0");
        let expr = captures
            .get(1)
            .map(|m| m.as_str().trim())
            .unwrap_or_default();
        out.push_str(&template[last..whole.start()]);
        match evaluate(expr, context)? {
            Some(value) => out.push_str(&render_value(&value)),
            None if strict => {
                return Err(TemplateError::MissingVariable {
                    name: expr.split('|').next().unwrap_or(expr).trim().to_string(),
                    available: available_names(context),
                });
            }
            None => out.push_str(whole.as_str()),
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Evaluate one expression. `Ok(None)` means the variable was missing and no
/// default applied.
fn evaluate(expr: &str, context: &Value) -> Result<Option<Value>, TemplateError> {
    if expr == "$" {
        return Ok(Some(context.clone()));
    }

    // Function call form: name(arg) with an optional single argument.
    if let Some((name, arg)) = parse_call(expr) {
        let arg_value = if arg.is_empty() {
            None
        } else {
            // Argument is a path first, then a literal.
            match resolve_path(arg, context) {
                Some(v) => Some(v),
                None => Some(Value::String(arg.to_string())),
            }
        };
        return apply_function(name, arg_value).map(Some);
    }

    // `var|default` — the default is everything after the first pipe.
    let (path, default) = match expr.split_once('|') {
        Some((path, default)) => (path.trim(), Some(default.trim())),
        None => (expr, None),
    };

    match resolve_path(path, context) {
        Some(value) => Ok(Some(value)),
        None => Ok(default.map(|d| Value::String(d.to_string()))),
    }
}

fn parse_call(expr: &str) -> Option<(&str, &str)> {
    let open = expr.find('(')?;
    if !expr.ends_with(')') {
        return None;
    }
    let name = &expr[..open];
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((name, expr[open + 1..expr.len() - 1].trim()))
}

fn apply_function(name: &str, arg: Option<Value>) -> Result<Value, TemplateError> {
    let arg_ref = arg.as_ref();
    let value = match name {
        "timestamp_utc" => Value::String(ksi_protocol::timestamp_utc()),
        "time" => Value::String(chrono::Utc::now().format("%H:%M:%S").to_string()),
        "len" => match arg_ref {
            Some(Value::Array(a)) => Value::from(a.len()),
            Some(Value::Object(o)) => Value::from(o.len()),
            Some(Value::String(s)) => Value::from(s.chars().count()),
            _ => Value::from(0),
        },
        "str" => Value::String(arg_ref.map(render_value).unwrap_or_default()),
        "int" => {
            let parsed = match arg_ref {
                Some(Value::Number(n)) => n.as_f64().map(|f| f as i64),
                Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
                Some(Value::Bool(b)) => Some(*b as i64),
                _ => None,
            };
            parsed.map(Value::from).unwrap_or(Value::from(0))
        }
        "float" => {
            let parsed = match arg_ref {
                Some(Value::Number(n)) => n.as_f64(),
                Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            parsed.map(Value::from).unwrap_or(Value::from(0.0))
        }
        "json" => Value::String(
            arg_ref
                .map(|v| serde_json::to_string(v).unwrap_or_default())
                .unwrap_or_default(),
        ),
        "upper" => Value::String(arg_ref.map(render_value).unwrap_or_default().to_uppercase()),
        "lower" => Value::String(arg_ref.map(render_value).unwrap_or_default().to_lowercase()),
        other => return Err(TemplateError::UnknownFunction(other.to_string())),
    };
    Ok(value)
}

/// Walk a dotted path through objects and arrays.
pub fn resolve_path(path: &str, context: &Value) -> Option<Value> {
    let mut current = context;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Strings render bare; everything else renders as JSON.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn available_names(context: &Value) -> Vec<String> {
    match context {
        Value::Object(map) => {
            let mut names: Vec<String> = map.keys().cloned().collect();
            names.sort();
            names
        }
        _ => Vec::new(),
    }
}

/// Minimal condition evaluator for composition `condition` expressions.
///
/// Supports `var == literal`, `var != literal`, and bare-variable
/// truthiness. Unknown expressions evaluate false and log, never panic.
pub fn evaluate_condition(expr: &str, context: &Value) -> bool {
    let expr = expr.trim();
    if expr.is_empty() {
        return false;
    }
    if let Some((lhs, rhs)) = expr.split_once("==") {
        return compare(lhs, rhs, context).unwrap_or(false);
    }
    if let Some((lhs, rhs)) = expr.split_once("!=") {
        return !compare(lhs, rhs, context).unwrap_or(true);
    }
    if let Some(negated) = expr.strip_prefix('!') {
        return !truthy(resolve_path(negated.trim(), context));
    }
    truthy(resolve_path(expr, context))
}

fn compare(lhs: &str, rhs: &str, context: &Value) -> Option<bool> {
    let left = resolve_path(lhs.trim(), context)?;
    let right_raw = rhs.trim().trim_matches('\'').trim_matches('"');
    let right = resolve_path(right_raw, context)
        .unwrap_or_else(|| literal_value(right_raw));
    Some(loose_eq(&left, &right))
}

fn literal_value(raw: &str) -> Value {
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::from(f);
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" | "None" => Value::Null,
        _ => Value::String(raw.to_string()),
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    // Numbers and their string forms compare equal, which is what YAML
    // frontmatter authors expect.
    render_value(a) == render_value(b)
}

fn truthy(value: Option<Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
        Some(Value::Number(n)) => n.as_f64() != Some(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "name": "world",
            "user": {"name": "Ada", "id": 7},
            "items": ["a", "b", "c"],
            "empty": "",
            "_ksi_context": {"request_id": "r-1"},
        })
    }

    #[test]
    fn simple_and_nested_paths() {
        assert_eq!(
            substitute("Hello {{name}}", &ctx(), true).unwrap(),
            "Hello world"
        );
        assert_eq!(
            substitute("{{user.name}} (ID: {{user.id}})", &ctx(), true).unwrap(),
            "Ada (ID: 7)"
        );
        assert_eq!(substitute("{{items.1}}", &ctx(), true).unwrap(), "b");
        assert_eq!(
            substitute("{{_ksi_context.request_id}}", &ctx(), true).unwrap(),
            "r-1"
        );
    }

    #[test]
    fn defaults_apply_only_when_missing() {
        assert_eq!(
            substitute("{{missing|fallback}}", &ctx(), true).unwrap(),
            "fallback"
        );
        assert_eq!(substitute("{{name|fallback}}", &ctx(), true).unwrap(), "world");
        // An empty string is present, not missing.
        assert_eq!(substitute("{{empty|fallback}}", &ctx(), true).unwrap(), "");
    }

    #[test]
    fn strict_mode_names_the_missing_variable() {
        let err = substitute("{{nope}}", &ctx(), true).unwrap_err();
        match err {
            TemplateError::MissingVariable { name, available } => {
                assert_eq!(name, "nope");
                assert!(available.contains(&"name".to_string()));
                assert!(available.contains(&"user".to_string()));
            }
            other => panic!("unexpected error {other:?}"),
        }

        // Lenient mode leaves the placeholder alone.
        assert_eq!(substitute("{{nope}}", &ctx(), false).unwrap(), "{{nope}}");
    }

    #[test]
    fn whole_context_passthrough_serialises_json() {
        let rendered = substitute("{{$}}", &ctx(), true).unwrap();
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["user"]["name"], "Ada");
    }

    #[test]
    fn functions_apply() {
        assert_eq!(substitute("{{len(items)}}", &ctx(), true).unwrap(), "3");
        assert_eq!(substitute("{{upper(name)}}", &ctx(), true).unwrap(), "WORLD");
        assert_eq!(substitute("{{lower(user.name)}}", &ctx(), true).unwrap(), "ada");
        assert_eq!(substitute("{{int(user.id)}}", &ctx(), true).unwrap(), "7");
        let ts = substitute("{{timestamp_utc()}}", &ctx(), true).unwrap();
        assert!(ts.ends_with('Z'), "timestamp should be UTC Z-suffixed: {ts}");
        let as_json = substitute("{{json(user)}}", &ctx(), true).unwrap();
        assert!(as_json.contains("\"name\":\"Ada\""));
    }

    #[test]
    fn unknown_function_is_an_error() {
        assert!(matches!(
            substitute("{{frobnicate(name)}}", &ctx(), true),
            Err(TemplateError::UnknownFunction(_))
        ));
    }

    #[test]
    fn complex_values_render_as_json() {
        assert_eq!(
            substitute("{{user}}", &ctx(), true).unwrap(),
            r#"{"id":7,"name":"Ada"}"#
        );
    }

    #[test]
    fn conditions_evaluate() {
        let ctx = json!({"enable_tools": true, "role": "researcher", "count": 0});
        assert!(evaluate_condition("enable_tools", &ctx));
        assert!(evaluate_condition("role == 'researcher'", &ctx));
        assert!(!evaluate_condition("role == 'coder'", &ctx));
        assert!(evaluate_condition("role != 'coder'", &ctx));
        assert!(!evaluate_condition("count", &ctx));
        assert!(evaluate_condition("!count", &ctx));
        assert!(!evaluate_condition("missing_var", &ctx));
        assert!(!evaluate_condition("", &ctx));
    }
}
