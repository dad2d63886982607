//! Template expansion for pipeline and action configuration strings.
//!
//! Three delimiter pairs are recognized, in this precedence order:
//!
//! - `${# ... #}` comments: stripped entirely, evaluated first so a
//!   comment can never accidentally contain an expression or a block tag.
//! - `${% if <expr> %} ... ${% endif %}` blocks: the enclosed text is kept
//!   only when `<expr>` resolves to a JSON-truthy value.
//! - `${{ <expr> }}` expressions: replaced with the resolved value's
//!   string form.
//!
//! Expressions are dotted variable paths only (`steps.build.outputs.path`),
//! not a general expression language; that covers every expression shape
//! a pipeline definition actually needs. An identifier that doesn't resolve
//! (missing, or a dotted path that runs off the end of the JSON tree)
//! renders as an empty string rather than failing the whole render.

use agent_types::Variables;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unterminated `${{{{` expression")]
    UnterminatedExpression,
    #[error("unterminated `${{%` block tag")]
    UnterminatedBlockTag,
    #[error("unterminated `${{#` comment")]
    UnterminatedComment,
    #[error("`${{% endif %}}` without a matching `${{% if %}}`")]
    DanglingEndif,
    #[error("`${{% if %}}` block was never closed with `${{% endif %}}`")]
    UnclosedIf,
    #[error("unknown block tag `{0}`, only `if`/`endif` are supported")]
    UnknownTag(String),
}

/// Renders `template` against `vars`, expanding all three delimiter kinds.
pub fn render(template: &str, vars: &Variables) -> Result<String, TemplateError> {
    let without_comments = strip_comments(template)?;
    let without_blocks = eval_if_blocks(&without_comments, vars)?;
    eval_expressions(&without_blocks, vars)
}

fn strip_comments(input: &str) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    loop {
        match rest.find("${#") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                let after = &rest[start + 3..];
                let end = after
                    .find("#}")
                    .ok_or(TemplateError::UnterminatedComment)?;
                rest = &after[end + 2..];
            }
        }
    }
    Ok(out)
}

/// A single `${% if ... %}...${% endif %}` pass. Blocks do not nest; the
/// original agent's pipeline configs never needed nested conditionals, and
/// disallowing it keeps this evaluator a single linear scan.
fn eval_if_blocks(input: &str, vars: &Variables) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    loop {
        match rest.find("${%") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                let before = &rest[..start];
                let after_open = &rest[start + 3..];
                let tag_end = after_open
                    .find("%}")
                    .ok_or(TemplateError::UnterminatedBlockTag)?;
                let tag = after_open[..tag_end].trim();

                if let Some(expr) = tag.strip_prefix("if ").map(str::trim) {
                    out.push_str(before);
                    let body_start = &after_open[tag_end + 2..];
                    let endif_pos = body_start
                        .find("${% endif %}")
                        .ok_or(TemplateError::UnclosedIf)?;
                    let body = &body_start[..endif_pos];
                    if is_truthy(resolve(expr, vars)) {
                        out.push_str(body);
                    }
                    rest = &body_start[endif_pos + "${% endif %}".len()..];
                } else if tag == "endif" {
                    return Err(TemplateError::DanglingEndif);
                } else {
                    return Err(TemplateError::UnknownTag(tag.to_string()));
                }
            }
        }
    }

    Ok(out)
}

fn eval_expressions(input: &str, vars: &Variables) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    loop {
        match rest.find("${{") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                let after = &rest[start + 3..];
                let end = after
                    .find("}}")
                    .ok_or(TemplateError::UnterminatedExpression)?;
                let expr = after[..end].trim();
                let value = resolve(expr, vars);
                out.push_str(&value_to_string(value));
                rest = &after[end + 2..];
            }
        }
    }

    Ok(out)
}

/// An unresolved identifier renders to this rather than erroring: a pipeline
/// referencing a variable that happens not to be set should still render,
/// the same way Jinja2's default undefined silently stringifies to empty.
static UNRESOLVED: serde_json::Value = serde_json::Value::Null;

/// Resolves a dotted path such as `steps.build.outputs.path` against the
/// flattened variable set. The first segment names a top-level variable;
/// remaining segments index into nested JSON objects. A path that can't be
/// followed to the end, at any segment, resolves to [`UNRESOLVED`].
fn resolve<'a>(path: &str, vars: &'a Variables) -> &'a serde_json::Value {
    let mut segments = path.split('.');
    let head = segments.next().unwrap_or("");
    let Some(mut current) = vars.get(head) else {
        return &UNRESOLVED;
    };

    for segment in segments {
        match current.get(segment) {
            Some(next) => current = next,
            None => return &UNRESOLVED,
        }
    }
    current
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
