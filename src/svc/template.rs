//! # Template module
//!
//! This module provides the text renderer for `{{ .dotted.path }}`
//! expressions resolved against the evaluation context

use serde_json::{Map, Value};

use crate::svc::context::EvaluationContext;

// -----------------------------------------------------------------------------
// Constants

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse template, unterminated expression at offset {0}")]
    Unterminated(usize),
    #[error("failed to parse template, expression '{0}' does not reference a context path")]
    Path(String),
    #[error("failed to render template, path '{0}' is not present in the context")]
    MissingField(String),
}

// -----------------------------------------------------------------------------
// Mode enumeration

/// Lenient rendering substitutes an empty string for absent paths, strict
/// rendering refuses them. Strict mode is used for required payload fields.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Mode {
    Lenient,
    Strict,
}

// -----------------------------------------------------------------------------
// Helper functions

/// renders the given template against the context. Rendering is purely
/// substitutional, expressions are dotted context paths and nothing else.
pub fn render(input: &str, ctx: &EvaluationContext, mode: Mode) -> Result<String, Error> {
    // fast path, the identity render
    if !input.contains(OPEN) {
        return Ok(input.to_owned());
    }

    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    let mut offset = 0;

    while let Some(start) = rest.find(OPEN) {
        output.push_str(&rest[..start]);

        let after = &rest[start + OPEN.len()..];
        let end = match after.find(CLOSE) {
            Some(end) => end,
            None => return Err(Error::Unterminated(offset + start)),
        };

        let expression = after[..end].trim();
        let path = expression
            .strip_prefix('.')
            .filter(|path| !path.is_empty())
            .ok_or_else(|| Error::Path(expression.to_owned()))?;

        match ctx.get_nested(path) {
            Some(value) => output.push_str(&stringify(value)),
            None if Mode::Strict == mode => return Err(Error::MissingField(path.to_owned())),
            None => {}
        }

        offset += start + OPEN.len() + end + CLOSE.len();
        rest = &after[end + CLOSE.len()..];
    }

    output.push_str(rest);
    Ok(output)
}

/// renders every string of the given json tree, leaving the structure and
/// the non-string scalars untouched
pub fn render_value(input: &Value, ctx: &EvaluationContext, mode: Mode) -> Result<Value, Error> {
    Ok(match input {
        Value::String(s) => Value::from(render(s, ctx, mode)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_value(item, ctx, mode))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut rendered = Map::with_capacity(map.len());

            for (key, value) in map {
                rendered.insert(key.to_owned(), render_value(value, ctx, mode)?);
            }

            Value::Object(rendered)
        }
        value => value.to_owned(),
    })
}

/// turns a context value into its textual form, scalars render bare and
/// structured values render as compact json
fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.to_owned(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        value => value.to_string(),
    }
}
