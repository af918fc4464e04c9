//! Template Renderer (C1, `spec.md` §4.1).
//!
//! Sandboxed `{{ expr }}` substitution plus minimal `{% if %}`/`{% for %}`
//! control flow over dotted/indexed attribute access against a `Context`.
//! Filters are a closed whitelist; everything else — dunder attribute
//! access, arbitrary function calls, unknown filter names — is a
//! `RenderError::SecurityViolation`. Undefined variables are strict: no
//! silent empty-string substitution (`spec.md` §4.1).
//!
//! Grammar kept deliberately small (no generic expression engine, per
//! `spec.md` §9 design notes): a dotted/indexed path, an optional pipeline
//! of whitelisted filters, or a literal. `{% if %}` conditions are a path
//! (truthy test, optionally negated with a leading `not `) or a single
//! `==`/`!=` comparison against a literal or another path; `{% for x in
//! path %}` iterates an array, binding `x` for the body only. There is no
//! elif — nest another `{% if %}` inside the `{% else %}` branch instead.

use crate::context::Context;
use crate::error::{EngineError, RenderErrorKind, Result};
use serde_json::Value;

const WHITELISTED_FILTERS: &[&str] = &["truncate", "title", "tojson", "default", "replace", "lower", "upper"];

/// A binding introduced by `{% for %}`, visible only to its body. Cloned
/// rather than borrowed to sidestep threading a lifetime through the
/// recursive-descent parser's owned `Node` tree.
#[derive(Clone, Default)]
struct Scope {
    vars: Vec<(String, Value)>,
}

impl Scope {
    fn get(&self, name: &str) -> Option<&Value> {
        self.vars.iter().rev().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    fn child(&self, name: &str, value: Value) -> Scope {
        let mut vars = self.vars.clone();
        vars.push((name.to_string(), value));
        Scope { vars }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Text(String),
    Expr(String),
    If { cond: String, then_branch: Vec<Node>, else_branch: Vec<Node> },
    For { var: String, iter_path: String, body: Vec<Node> },
}

enum EndTag {
    Eof,
    Else,
    EndIf,
    EndFor,
}

/// Render `template` against `ctx`. `stage` is used only for error
/// attribution (`steps[2]`, `tasks.analysis`, ...).
pub fn render(template: &str, ctx: &Context, stage: &str) -> Result<String> {
    let (nodes, end, _) = parse_block(template, stage)?;
    if !matches!(end, EndTag::Eof) {
        return Err(EngineError::render(stage, RenderErrorKind::Syntax { message: "unmatched '{% else %}'/'{% endif %}'/'{% endfor %}'".into() }));
    }
    render_nodes(&nodes, ctx, &Scope::default(), stage)
}

/// Parses until end-of-input or a bare `{% else|endif|endfor %}`, returning
/// the nodes collected so far, which closing tag stopped the scan, and the
/// remaining unparsed source (the caller resumes parsing from there).
fn parse_block<'a>(mut src: &'a str, stage: &str) -> Result<(Vec<Node>, EndTag, &'a str)> {
    let mut nodes = Vec::new();
    loop {
        let next_expr = src.find("{{");
        let next_tag = src.find("{%");
        let tag_is_next = match (next_expr, next_tag) {
            (None, None) => {
                nodes.push(Node::Text(src.to_string()));
                return Ok((nodes, EndTag::Eof, ""));
            }
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (Some(e), Some(t)) => t < e,
        };
        if tag_is_next {
            let t = next_tag.unwrap();
            if !src[..t].is_empty() {
                nodes.push(Node::Text(src[..t].to_string()));
            }
            let after = &src[t + 2..];
            let close = after
                .find("%}")
                .ok_or_else(|| EngineError::render(stage, RenderErrorKind::Syntax { message: "unterminated '{%'".into() }))?;
            let body = after[..close].trim();
            let remainder = &after[close + 2..];

            if let Some(cond) = body.strip_prefix("if ") {
                let (then_branch, end, rest) = parse_block(remainder, stage)?;
                match end {
                    EndTag::EndIf => {
                        nodes.push(Node::If { cond: cond.trim().to_string(), then_branch, else_branch: vec![] });
                        src = rest;
                    }
                    EndTag::Else => {
                        let (else_branch, end2, rest2) = parse_block(rest, stage)?;
                        if !matches!(end2, EndTag::EndIf) {
                            return Err(EngineError::render(stage, RenderErrorKind::Syntax { message: "expected '{% endif %}' after '{% else %}'".into() }));
                        }
                        nodes.push(Node::If { cond: cond.trim().to_string(), then_branch, else_branch });
                        src = rest2;
                    }
                    EndTag::EndFor | EndTag::Eof => {
                        return Err(EngineError::render(stage, RenderErrorKind::Syntax { message: "unterminated '{% if %}'".into() }));
                    }
                }
            } else if let Some(clause) = body.strip_prefix("for ") {
                let mut parts = clause.splitn(2, " in ");
                let var = parts
                    .next()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| EngineError::render(stage, RenderErrorKind::Syntax { message: "expected '{% for x in path %}'".into() }))?
                    .to_string();
                let iter_path = parts
                    .next()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| EngineError::render(stage, RenderErrorKind::Syntax { message: "'{% for %}' missing 'in <path>'".into() }))?
                    .to_string();
                let (body_nodes, end, rest) = parse_block(remainder, stage)?;
                if !matches!(end, EndTag::EndFor) {
                    return Err(EngineError::render(stage, RenderErrorKind::Syntax { message: "unterminated '{% for %}'".into() }));
                }
                nodes.push(Node::For { var, iter_path, body: body_nodes });
                src = rest;
            } else if body == "else" {
                return Ok((nodes, EndTag::Else, remainder));
            } else if body == "endif" {
                return Ok((nodes, EndTag::EndIf, remainder));
            } else if body == "endfor" {
                return Ok((nodes, EndTag::EndFor, remainder));
            } else {
                return Err(EngineError::render(stage, RenderErrorKind::Syntax { message: format!("unknown tag '{{% {body} %}}'") }));
            }
        } else {
            let e = next_expr.unwrap();
            if !src[..e].is_empty() {
                nodes.push(Node::Text(src[..e].to_string()));
            }
            let after = &src[e + 2..];
            let close = after
                .find("}}")
                .ok_or_else(|| EngineError::render(stage, RenderErrorKind::Syntax { message: "unterminated '{{'".into() }))?;
            nodes.push(Node::Expr(after[..close].trim().to_string()));
            src = &after[close + 2..];
        }
    }
}

fn render_nodes(nodes: &[Node], ctx: &Context, scope: &Scope, stage: &str) -> Result<String> {
    let mut out = String::new();
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Expr(expr) => {
                let value = eval_expr(expr, ctx, scope, stage)?;
                out.push_str(&value_to_display_string(&value));
            }
            Node::If { cond, then_branch, else_branch } => {
                if eval_condition(cond, ctx, scope, stage)? {
                    out.push_str(&render_nodes(then_branch, ctx, scope, stage)?);
                } else {
                    out.push_str(&render_nodes(else_branch, ctx, scope, stage)?);
                }
            }
            Node::For { var, iter_path, body } => {
                let iterable = resolve_path(iter_path, ctx, scope, stage)?;
                let items = iterable.as_array().cloned().ok_or_else(|| {
                    EngineError::render(stage, RenderErrorKind::Syntax { message: format!("'{iter_path}' is not an array") })
                })?;
                for item in items {
                    let child = scope.child(var, item);
                    out.push_str(&render_nodes(body, ctx, &child, stage)?);
                }
            }
        }
    }
    Ok(out)
}

/// `{% if %}` condition: `[not] EXPR` or `EXPR (==|!=) (EXPR|"literal")`.
fn eval_condition(cond: &str, ctx: &Context, scope: &Scope, stage: &str) -> Result<bool> {
    for (op, negate_eq) in [(" == ", false), (" != ", true)] {
        if let Some(idx) = cond.find(op) {
            let lhs = eval_expr(cond[..idx].trim(), ctx, scope, stage)?;
            let rhs_raw = cond[idx + op.len()..].trim();
            let rhs = if let Some(lit) = strip_quotes_checked(rhs_raw) {
                Value::String(lit)
            } else {
                eval_expr(rhs_raw, ctx, scope, stage)?
            };
            let equal = value_to_display_string(&lhs) == value_to_display_string(&rhs);
            return Ok(equal != negate_eq);
        }
    }
    let (negate, expr) = match cond.strip_prefix("not ") {
        Some(rest) => (true, rest.trim()),
        None => (false, cond.trim()),
    };
    let truthy = is_truthy(&eval_expr(expr, ctx, scope, stage)?);
    Ok(truthy != negate)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Returns `Some` only if `s` is a fully quoted literal (`"x"`/`'x'`),
/// distinguishing `"billing"` from a bare path like `router.chosen_route`.
fn strip_quotes_checked(s: &str) -> Option<String> {
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        let quote = bytes[0];
        if (quote == b'"' || quote == b'\'') && bytes[s.len() - 1] == quote {
            return Some(s[1..s.len() - 1].to_string());
        }
    }
    None
}

fn value_to_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Evaluate a `{{ ... }}` expression: `path | filter1 | filter2(args)`.
fn eval_expr(expr: &str, ctx: &Context, scope: &Scope, stage: &str) -> Result<Value> {
    let mut parts = expr.split('|');
    let path = parts.next().unwrap_or("").trim();
    let mut value = resolve_path(path, ctx, scope, stage)?;
    for filter_expr in parts {
        value = apply_filter(filter_expr.trim(), value, stage)?;
    }
    Ok(value)
}

/// Resolve a dotted/indexed path like `steps[0].response` or `variables.topic`
/// against `scope` (innermost `{% for %}` bindings first) then the
/// context's flattened root map. Any path that references a dunder-prefixed
/// segment (`__class__`, `__import__`, ...) is rejected as a sandbox
/// violation regardless of whether it would otherwise resolve.
fn resolve_path(path: &str, ctx: &Context, scope: &Scope, stage: &str) -> Result<Value> {
    if path.is_empty() {
        return Err(EngineError::render(
            stage,
            RenderErrorKind::Syntax { message: "empty expression".into() },
        ));
    }
    let segments = tokenize_path(path, stage)?;
    let root_key = match &segments[0] {
        PathSegment::Name(n) => n.clone(),
        PathSegment::Index(_) => {
            return Err(EngineError::render(
                stage,
                RenderErrorKind::Syntax { message: "path cannot start with an index".into() },
            ))
        }
    };
    let mut current: Value = scope
        .get(&root_key)
        .cloned()
        .or_else(|| ctx.get(&root_key).cloned())
        .ok_or_else(|| EngineError::render(stage, RenderErrorKind::UndefinedVariable { name: path.to_string() }))?;
    for segment in &segments[1..] {
        current = match segment {
            PathSegment::Name(name) => {
                if name.starts_with("__") {
                    return Err(EngineError::render(
                        stage,
                        RenderErrorKind::SecurityViolation {
                            violation_type: "dunder_attribute".into(),
                            template_preview: path.chars().take(60).collect(),
                        },
                    ));
                }
                current
                    .as_object()
                    .and_then(|o| o.get(name))
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::render(stage, RenderErrorKind::UndefinedVariable { name: path.to_string() })
                    })?
            }
            PathSegment::Index(i) => current
                .as_array()
                .and_then(|a| a.get(*i))
                .cloned()
                .ok_or_else(|| {
                    EngineError::render(stage, RenderErrorKind::UndefinedVariable { name: path.to_string() })
                })?,
        };
    }
    Ok(current)
}

enum PathSegment {
    Name(String),
    Index(usize),
}

fn tokenize_path(path: &str, stage: &str) -> Result<Vec<PathSegment>> {
    let mut segments = Vec::new();
    for dotted in path.split('.') {
        let mut remaining = dotted;
        loop {
            if let Some(bracket) = remaining.find('[') {
                let (name, tail) = remaining.split_at(bracket);
                if !name.is_empty() {
                    segments.push(PathSegment::Name(name.to_string()));
                }
                let close = tail.find(']').ok_or_else(|| {
                    EngineError::render(stage, RenderErrorKind::Syntax { message: "unterminated '['".into() })
                })?;
                let idx_str = &tail[1..close];
                let idx: usize = idx_str.parse().map_err(|_| {
                    EngineError::render(
                        stage,
                        RenderErrorKind::Syntax { message: format!("non-numeric index '{idx_str}'") },
                    )
                })?;
                segments.push(PathSegment::Index(idx));
                remaining = &tail[close + 1..];
            } else {
                if !remaining.is_empty() {
                    segments.push(PathSegment::Name(remaining.to_string()));
                }
                break;
            }
        }
    }
    Ok(segments)
}

fn apply_filter(filter_expr: &str, value: Value, stage: &str) -> Result<Value> {
    let (name, arg_str) = match filter_expr.find('(') {
        Some(open) => {
            let close = filter_expr.rfind(')').unwrap_or(filter_expr.len());
            (&filter_expr[..open], Some(filter_expr[open + 1..close].trim()))
        }
        None => (filter_expr, None),
    };
    if !WHITELISTED_FILTERS.contains(&name) {
        return Err(EngineError::render(
            stage,
            RenderErrorKind::SecurityViolation {
                violation_type: "unknown_filter".into(),
                template_preview: filter_expr.chars().take(60).collect(),
            },
        ));
    }
    let as_str = value_to_display_string(&value);
    let result = match name {
        "truncate" => {
            let n: usize = arg_str.and_then(|a| a.parse().ok()).unwrap_or(as_str.len());
            as_str.chars().take(n).collect::<String>()
        }
        "title" => as_str
            .split_whitespace()
            .map(|w| {
                let mut c = w.chars();
                match c.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + c.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" "),
        "tojson" => serde_json::to_string(&value).unwrap_or_default(),
        "default" => {
            if matches!(value, Value::Null) {
                strip_quotes(arg_str.unwrap_or(""))
            } else {
                as_str
            }
        }
        "replace" => {
            let mut args = arg_str.unwrap_or("").splitn(2, ',');
            let a = strip_quotes(args.next().unwrap_or("").trim());
            let b = strip_quotes(args.next().unwrap_or("").trim());
            as_str.replace(&a, &b)
        }
        "lower" => as_str.to_lowercase(),
        "upper" => as_str.to_uppercase(),
        _ => unreachable!("checked against whitelist above"),
    };
    Ok(Value::String(result))
}

fn strip_quotes(s: &str) -> String {
    let s = s.trim();
    if (s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')) {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}
