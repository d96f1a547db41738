use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::{json, Value};

use weft_core::error::{Result, WeftError};
use weft_core::traits::NodeHandler;
use weft_core::types::{output, NodeInvocation, OutputSnapshot};
use weft_core::ExecutionContext;

use super::emit_once;

/// Emits its `value` parameter once on `out`.
pub struct ConstantNode;

impl NodeHandler for ConstantNode {
    fn node_type(&self) -> &str {
        "constant"
    }

    fn description(&self) -> &str {
        "Emit the `value` parameter on `out`."
    }

    fn run(
        &self,
        invocation: NodeInvocation,
        _ctx: ExecutionContext,
    ) -> BoxStream<'static, Result<OutputSnapshot>> {
        let value = invocation.param("value").cloned().unwrap_or(Value::Null);
        emit_once(async move { Ok(output([("out", value)])) })
    }
}

/// Emits each entry of `items` (input or parameter) as a separate emission on `item`.
pub struct SequenceNode;

impl NodeHandler for SequenceNode {
    fn node_type(&self) -> &str {
        "sequence"
    }

    fn description(&self) -> &str {
        "Emit every entry of `items` on `item`, optionally `interval_ms` apart."
    }

    fn run(
        &self,
        invocation: NodeInvocation,
        _ctx: ExecutionContext,
    ) -> BoxStream<'static, Result<OutputSnapshot>> {
        let interval = invocation.param_u64("interval_ms").map(Duration::from_millis);
        let items = invocation
            .input("items")
            .or_else(|| invocation.param("items"))
            .cloned();
        let items = match items {
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
            None => {
                let err = WeftError::MissingInput {
                    node_type: invocation.node_type,
                    slot: "items".to_string(),
                };
                return stream::once(async move { Err(err) }).boxed();
            }
        };

        stream::iter(items)
            .then(move |item| async move {
                if let Some(interval) = interval {
                    tokio::time::sleep(interval).await;
                }
                Ok::<_, WeftError>(output([("item", item)]))
            })
            .boxed()
    }
}

/// Forwards `in` to `out`.
pub struct PassthroughNode;

impl NodeHandler for PassthroughNode {
    fn node_type(&self) -> &str {
        "passthrough"
    }

    fn description(&self) -> &str {
        "Forward `in` to `out` unchanged."
    }

    fn run(
        &self,
        invocation: NodeInvocation,
        _ctx: ExecutionContext,
    ) -> BoxStream<'static, Result<OutputSnapshot>> {
        emit_once(async move {
            let value = invocation.require_input("in")?.clone();
            Ok(output([("out", value)]))
        })
    }
}

/// Waits `ms` milliseconds, then forwards `in` to `out`.
pub struct DelayNode;

impl NodeHandler for DelayNode {
    fn node_type(&self) -> &str {
        "delay"
    }

    fn description(&self) -> &str {
        "Wait `ms` milliseconds, then forward `in` to `out`."
    }

    fn run(
        &self,
        invocation: NodeInvocation,
        _ctx: ExecutionContext,
    ) -> BoxStream<'static, Result<OutputSnapshot>> {
        let delay = Duration::from_millis(invocation.param_u64("ms").unwrap_or(100));
        emit_once(async move {
            tokio::time::sleep(delay).await;
            let value = invocation.input("in").cloned().unwrap_or(Value::Null);
            Ok(output([("out", value)]))
        })
    }
}

/// Always fails with its `message` parameter.
pub struct FailNode;

impl NodeHandler for FailNode {
    fn node_type(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "Fail with the `message` parameter."
    }

    fn run(
        &self,
        invocation: NodeInvocation,
        _ctx: ExecutionContext,
    ) -> BoxStream<'static, Result<OutputSnapshot>> {
        let message = invocation.param_str("message").unwrap_or("failed").to_string();
        let node_type = invocation.node_type;
        emit_once(async move { Err(WeftError::handler(node_type, message)) })
    }
}

/// Loop body: adds `step` to `value` and emits on `next` while below `limit`,
/// otherwise on `done`. Wire `next` back into `value` to iterate.
pub struct IterateNode;

impl NodeHandler for IterateNode {
    fn node_type(&self) -> &str {
        "iterate"
    }

    fn description(&self) -> &str {
        "Count `value` up by `step`; emit `next` below `limit`, else `done`."
    }

    fn run(
        &self,
        invocation: NodeInvocation,
        _ctx: ExecutionContext,
    ) -> BoxStream<'static, Result<OutputSnapshot>> {
        emit_once(async move {
            let value = invocation.require_input("value")?;
            let current = value.as_i64().ok_or_else(|| {
                WeftError::handler(
                    invocation.node_type.as_str(),
                    format!("`value` must be an integer, got {value}"),
                )
            })?;
            let step = invocation.param("step").and_then(|v| v.as_i64()).unwrap_or(1);
            let limit = invocation.param("limit").and_then(|v| v.as_i64()).unwrap_or(10);

            let next = current + step;
            if next < limit {
                Ok(output([("next", json!(next))]))
            } else {
                Ok(output([("done", json!(next))]))
            }
        })
    }
}

/// Normalizes `items` to an array and reports its length.
pub struct CollectNode;

impl NodeHandler for CollectNode {
    fn node_type(&self) -> &str {
        "collect"
    }

    fn description(&self) -> &str {
        "Emit `items` as an array on `items` with its length on `count`."
    }

    fn run(
        &self,
        invocation: NodeInvocation,
        _ctx: ExecutionContext,
    ) -> BoxStream<'static, Result<OutputSnapshot>> {
        emit_once(async move {
            let items = match invocation.require_input("items")? {
                Value::Array(items) => items.clone(),
                Value::Null => vec![],
                other => vec![other.clone()],
            };
            let count = items.len();
            Ok(output([("items", Value::Array(items)), ("count", json!(count))]))
        })
    }
}
