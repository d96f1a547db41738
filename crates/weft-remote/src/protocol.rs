use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use weft_core::types::{CorrelationId, NodeInvocation, Value};
use weft_core::ExecutionContext;

/// SSE event name carrying one `NodeUpdate`.
pub const EVENT_UPDATE: &str = "update";

pub const EXECUTIONS_PATH: &str = "/api/executions";

/// Body of `POST /api/executions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    /// Caller-chosen id, used by `DELETE /api/executions/{id}`.
    pub execution_id: String,
    pub correlation_id: CorrelationId,
    pub invocation: NodeInvocation,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
}

impl ExecuteRequest {
    pub fn new(execution_id: String, invocation: NodeInvocation, ctx: &ExecutionContext) -> Self {
        Self {
            execution_id,
            correlation_id: ctx.correlation_id().clone(),
            invocation,
            context: ctx.snapshot(),
        }
    }

    /// Peer-side context for this execution, cancelled through `cancel`.
    pub fn execution_context(&self, cancel: CancellationToken, verbose_errors: bool) -> ExecutionContext {
        ExecutionContext::new()
            .with_correlation_id(self.correlation_id.clone())
            .with_cancel_token(cancel)
            .with_values(self.context.clone())
            .with_verbose_errors(verbose_errors)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
