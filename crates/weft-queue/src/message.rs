use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use weft_core::error::Result;
use weft_core::types::{CorrelationId, InputSnapshot, JobOutcome, NodeInvocation, Value};
use weft_core::ExecutionContext;

/// One queued firing, as published to the ready list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub job_id: String,
    pub correlation_id: CorrelationId,
    pub node_id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub inputs: InputSnapshot,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    /// Run values at publish time.
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    /// List the worker pushes the `ResultMessage` onto.
    pub reply_to: String,
    /// Failed executions so far.
    #[serde(default)]
    pub deliveries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl JobMessage {
    pub fn new(job_id: String, invocation: NodeInvocation, ctx: &ExecutionContext, reply_to: String) -> Self {
        Self {
            job_id,
            correlation_id: ctx.correlation_id().clone(),
            node_id: invocation.node_id,
            node_type: invocation.node_type,
            inputs: invocation.inputs,
            metadata: invocation.metadata,
            context: ctx.snapshot(),
            reply_to,
            deliveries: 0,
            last_error: None,
            enqueued_at: Utc::now(),
        }
    }

    pub fn invocation(&self) -> NodeInvocation {
        NodeInvocation {
            node_id: self.node_id.clone(),
            node_type: self.node_type.clone(),
            inputs: self.inputs.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Worker-side context carrying the run's correlation id and values.
    pub fn execution_context(&self) -> ExecutionContext {
        ExecutionContext::new()
            .with_correlation_id(self.correlation_id.clone())
            .with_values(self.context.clone())
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Final answer for a job, pushed onto its `reply_to` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub job_id: String,
    pub correlation_id: CorrelationId,
    pub outcome: JobOutcome,
}

impl ResultMessage {
    pub fn for_job(job: &JobMessage, outcome: JobOutcome) -> Self {
        Self {
            job_id: job.job_id.clone(),
            correlation_id: job.correlation_id.clone(),
            outcome,
        }
    }

    /// Whether this result answers `job`.
    pub fn answers(&self, job: &JobMessage) -> bool {
        self.job_id == job.job_id && self.correlation_id == job.correlation_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_message_wire_shape() {
        let ctx = ExecutionContext::new().with_correlation_id(CorrelationId::from_str("run-7"));
        ctx.set("tenant", json!("acme"));
        let invocation = NodeInvocation::new("resize", "image.resize")
            .with_input("image", json!("a.png"))
            .with_metadata("width", json!(64));
        let job = JobMessage::new("job-1".into(), invocation, &ctx, "weft:jobs:reply:job-1".into());

        let wire: Value = serde_json::from_str(&job.encode().unwrap()).unwrap();
        assert_eq!(wire["jobId"], "job-1");
        assert_eq!(wire["correlationId"], "run-7");
        assert_eq!(wire["type"], "image.resize");
        assert_eq!(wire["inputs"]["image"], "a.png");
        assert_eq!(wire["context"]["tenant"], "acme");
        assert_eq!(wire["replyTo"], "weft:jobs:reply:job-1");
        assert!(wire.get("lastError").is_none());

        let back = JobMessage::decode(&job.encode().unwrap()).unwrap();
        assert_eq!(back.invocation().param_u64("width"), Some(64));
        let worker_ctx = back.execution_context();
        assert_eq!(worker_ctx.correlation_id().0, "run-7");
        assert_eq!(worker_ctx.get("tenant"), Some(json!("acme")));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = JobMessage::decode("{not json").unwrap_err();
        assert!(matches!(err, weft_core::WeftError::Json(_)));
    }

    #[test]
    fn test_result_matches_job_and_run() {
        let ctx = ExecutionContext::new();
        let job = JobMessage::new("job-1".into(), NodeInvocation::new("n", "t"), &ctx, "r".into());
        let result = ResultMessage::for_job(&job, JobOutcome::Fail { error: "x".into() });
        assert!(result.answers(&job));

        let wire: Value = serde_json::to_value(&result).unwrap();
        assert_eq!(wire["outcome"]["status"], "fail");

        let mut other = job.clone();
        other.correlation_id = CorrelationId::from_str("someone-else");
        assert!(!result.answers(&other));
    }
}
