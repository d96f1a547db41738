use futures::stream::BoxStream;
use regex::Regex;
use serde_json::{json, Value};

use weft_core::error::{Result, WeftError};
use weft_core::traits::NodeHandler;
use weft_core::types::{output, NodeInvocation, OutputSnapshot};
use weft_core::ExecutionContext;

use super::emit_once;

/// Renders `{{name}}` placeholders from inputs, falling back to the
/// execution context's value bag.
pub struct TemplateNode;

impl NodeHandler for TemplateNode {
    fn node_type(&self) -> &str {
        "template"
    }

    fn description(&self) -> &str {
        "Render the `template` parameter, replacing {{name}} with inputs or context values."
    }

    fn run(
        &self,
        invocation: NodeInvocation,
        ctx: ExecutionContext,
    ) -> BoxStream<'static, Result<OutputSnapshot>> {
        emit_once(async move {
            let template = invocation.param_str("template").ok_or_else(|| {
                WeftError::handler(invocation.node_type.as_str(), "missing `template` parameter")
            })?;
            let text = render(template, |name| {
                invocation.input(name).cloned().or_else(|| ctx.get(name))
            })
            .map_err(|e| WeftError::handler(invocation.node_type.as_str(), e))?;
            Ok(output([("text", Value::String(text))]))
        })
    }
}

fn render(template: &str, lookup: impl Fn(&str) -> Option<Value>) -> std::result::Result<String, String> {
    let placeholder =
        Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}").map_err(|e| e.to_string())?;
    let mut missing = None;
    let rendered = placeholder.replace_all(template, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match lookup(name) {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(format!("no value for placeholder '{name}'")),
        None => Ok(rendered.into_owned()),
    }
}

/// Extracts every match of `pattern` from `text`. With a capture group, the
/// first group is extracted instead of the whole match.
pub struct RegexExtractNode;

impl NodeHandler for RegexExtractNode {
    fn node_type(&self) -> &str {
        "regex_extract"
    }

    fn description(&self) -> &str {
        "Extract all matches of the `pattern` parameter from `text` into `matches`."
    }

    fn run(
        &self,
        invocation: NodeInvocation,
        _ctx: ExecutionContext,
    ) -> BoxStream<'static, Result<OutputSnapshot>> {
        emit_once(async move {
            let node_type = invocation.node_type.as_str();
            let pattern = invocation
                .param_str("pattern")
                .ok_or_else(|| WeftError::handler(node_type, "missing `pattern` parameter"))?;
            let re = Regex::new(pattern)
                .map_err(|e| WeftError::handler(node_type, format!("invalid pattern: {e}")))?;
            let text = match invocation.require_input("text")? {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };

            let matches: Vec<Value> = re
                .captures_iter(&text)
                .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
                .map(|m| Value::String(m.as_str().to_string()))
                .collect();
            let count = matches.len();
            Ok(output([("matches", Value::Array(matches)), ("count", json!(count))]))
        })
    }
}

/// Reads a JSON pointer (`/a/0/b`) out of `value`.
pub struct JsonGetNode;

impl NodeHandler for JsonGetNode {
    fn node_type(&self) -> &str {
        "json_get"
    }

    fn description(&self) -> &str {
        "Select the `pointer` parameter (RFC 6901) from `value`; `required` fails when absent."
    }

    fn run(
        &self,
        invocation: NodeInvocation,
        _ctx: ExecutionContext,
    ) -> BoxStream<'static, Result<OutputSnapshot>> {
        emit_once(async move {
            let pointer = invocation.param_str("pointer").unwrap_or("");
            let required = invocation
                .param("required")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let value = invocation.require_input("value")?;
            let selected = match value.pointer(pointer) {
                Some(v) => v.clone(),
                None if required => {
                    return Err(WeftError::handler(
                        invocation.node_type.as_str(),
                        format!("pointer '{pointer}' not found"),
                    ))
                }
                None => Value::Null,
            };
            Ok(output([("value", selected)]))
        })
    }
}
