//! `{{ expression }}` placeholder handling

use crate::engine::ExpressionEngine;
use crate::error::{ExprError, ExprResult};
use crate::scope::Scope;
use crate::value::{is_truthy, to_display};
use serde_json::{Map, Value};
use tracing::trace;

/// A piece of a template
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Segment {
    Text(String),
    Expr { source: String, position: usize },
}

/// Check if a string contains a placeholder
pub fn is_template(s: &str) -> bool {
    s.contains("{{")
}

/// Split a template into text and expression segments
///
/// The closing `}}` is matched outside quotes and nested braces, so map
/// literals can appear inside placeholders.
pub(crate) fn split(template: &str) -> ExprResult<Vec<Segment>> {
    let chars: Vec<char> = template.chars().collect();
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '{' && chars.get(i + 1) == Some(&'{') {
            let open = i;
            let mut j = i + 2;
            let mut depth = 0usize;
            let mut quote: Option<char> = None;
            let mut close = None;

            while j < chars.len() {
                let c = chars[j];
                match quote {
                    Some(q) => {
                        if c == '\\' {
                            j += 1;
                        } else if c == q {
                            quote = None;
                        }
                    }
                    None => match c {
                        '\'' | '"' => quote = Some(c),
                        '{' => depth += 1,
                        '}' if depth > 0 => depth -= 1,
                        '}' if chars.get(j + 1) == Some(&'}') => {
                            close = Some(j);
                            break;
                        }
                        _ => {}
                    },
                }
                j += 1;
            }

            let Some(close) = close else {
                return Err(ExprError::syntax("unclosed '{{' placeholder", open));
            };

            if !text.is_empty() {
                segments.push(Segment::Text(std::mem::take(&mut text)));
            }
            let source: String = chars[open + 2..close].iter().collect();
            segments.push(Segment::Expr {
                source: source.trim().to_string(),
                position: open + 2,
            });
            i = close + 2;
        } else {
            text.push(chars[i]);
            i += 1;
        }
    }

    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    Ok(segments)
}

fn eval_segment(source: &str, position: usize, scope: &dyn Scope) -> ExprResult<Value> {
    ExpressionEngine::global()
        .evaluate(source, scope)
        .map_err(|e| shift(e, position))
}

/// Re-base a syntax error position from the placeholder onto the template
fn shift(err: ExprError, offset: usize) -> ExprError {
    match err {
        ExprError::Syntax { message, position } => ExprError::Syntax {
            message,
            position: position + offset,
        },
        other => other,
    }
}

/// Render a template against a scope
///
/// A template consisting of exactly one placeholder (surrounding whitespace
/// ignored) yields the expression's native value; anything else yields the
/// substituted string.
pub fn render(template: &str, scope: &dyn Scope) -> ExprResult<Value> {
    let segments = split(template)?;

    let exprs = segments
        .iter()
        .filter(|s| matches!(s, Segment::Expr { .. }))
        .count();
    let only_whitespace_text = segments
        .iter()
        .all(|s| !matches!(s, Segment::Text(t) if !t.trim().is_empty()));

    if exprs == 1 && only_whitespace_text {
        if let Some(Segment::Expr { source, position }) = segments
            .iter()
            .find(|s| matches!(s, Segment::Expr { .. }))
        {
            return eval_segment(source, *position, scope);
        }
    }

    let mut out = String::new();
    for segment in &segments {
        match segment {
            Segment::Text(t) => out.push_str(t),
            Segment::Expr { source, position } => {
                out.push_str(&to_display(&eval_segment(source, *position, scope)?))
            }
        }
    }
    trace!(template = %template, rendered = %out, "Rendered template");
    Ok(Value::String(out))
}

/// Render every string inside a value, recursing through lists and maps
pub fn render_value(value: &Value, scope: &dyn Scope) -> ExprResult<Value> {
    match value {
        Value::String(s) if is_template(s) => render(s, scope),
        Value::Object(obj) => {
            let mut rendered = Map::new();
            for (k, v) in obj {
                rendered.insert(k.clone(), render_value(v, scope)?);
            }
            Ok(Value::Object(rendered))
        }
        Value::Array(arr) => Ok(Value::Array(
            arr.iter()
                .map(|v| render_value(v, scope))
                .collect::<ExprResult<Vec<_>>>()?,
        )),
        _ => Ok(value.clone()),
    }
}

/// Check that a template is well-formed and every placeholder compiles
pub fn validate_template(template: &str) -> ExprResult<()> {
    let engine = ExpressionEngine::global();
    for segment in split(template)? {
        if let Segment::Expr { source, position } = segment {
            engine.validate(&source).map_err(|e| shift(e, position))?;
        }
    }
    Ok(())
}

/// Evaluate a condition written either as a template or a bare expression
pub fn evaluate_condition(src: &str, scope: &dyn Scope) -> ExprResult<bool> {
    let value = if is_template(src) {
        render(src, scope)?
    } else {
        ExpressionEngine::global().evaluate(src, scope)?
    };
    Ok(is_truthy(&value))
}

/// Evaluate the right-hand side of an assignment
///
/// Placeholders act as parenthesised sub-expressions, so `{{x}} + {{i}}`
/// evaluates like `(x) + (i)`. A source that does not parse as an expression
/// is rendered as a text template instead (`Hello {{ name }}` stays a string,
/// and bare text such as `Welcome page` is kept literally). Only a syntax
/// error triggers the fallback; evaluation errors are returned.
pub fn evaluate_rhs(src: &str, scope: &dyn Scope) -> ExprResult<Value> {
    let segments = split(src)?;

    let mut expression = String::new();
    for segment in &segments {
        match segment {
            Segment::Text(t) => expression.push_str(t),
            Segment::Expr { source, .. } => {
                // `word {{x}}` would otherwise read as a call to `word`
                if ends_with_word(&expression) {
                    return render(src, scope);
                }
                expression.push('(');
                expression.push_str(source);
                expression.push(')');
            }
        }
    }

    match ExpressionEngine::global().evaluate(&expression, scope) {
        Err(ExprError::Syntax { .. }) if is_template(src) => render(src, scope),
        Err(ExprError::Syntax { .. }) => Ok(Value::String(src.to_string())),
        result => result,
    }
}

/// True when the text ends with an identifier that is not an operator keyword
fn ends_with_word(text: &str) -> bool {
    let trimmed = text.trim_end();
    let word: String = trimmed
        .chars()
        .rev()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    match word.chars().next() {
        Some(c) if c.is_alphabetic() || c == '_' => {
            !matches!(word.as_str(), "and" | "or" | "not" | "in" | "is")
        }
        _ => false,
    }
}
