use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use weft_core::error::{Result, WeftError};
use weft_core::types::JobOutcome;
use weft_nodes::HandlerRegistry;

use crate::bridge::QueueBridge;
use crate::message::JobMessage;

const IDLE_BACKOFF: Duration = Duration::from_millis(500);

/// What a worker did with one claimed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    /// Handler succeeded and the result was published.
    Completed,
    /// Handler failed; the job went back to the ready list.
    Requeued,
    /// Moved to the dead-letter list.
    DeadLettered,
    /// The job was cancelled before it ran.
    Skipped,
}

/// Consumes jobs from one queue and runs them on local handlers.
///
/// Each worker owns a processing list named after it. A claimed message
/// stays there until it is acknowledged, so a crashed worker's jobs are
/// returned to the queue by `recover` when it restarts under the same name.
pub struct QueueWorker {
    bridge: QueueBridge,
    registry: Arc<HandlerRegistry>,
    name: String,
    processing: String,
}

impl QueueWorker {
    pub fn new(bridge: QueueBridge, registry: Arc<HandlerRegistry>, name: impl Into<String>) -> Self {
        let name = name.into();
        let processing = bridge.keys().processing(&name);
        Self {
            bridge,
            registry,
            name,
            processing,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return messages left in this worker's processing list to the queue.
    #[instrument(skip(self), fields(worker = %self.name))]
    pub async fn recover(&self) -> Result<usize> {
        let moved = self
            .bridge
            .backend()
            .move_all(&self.processing, &self.bridge.keys().ready)
            .await?;
        if moved > 0 {
            info!(moved, "Requeued unacknowledged jobs");
        }
        Ok(moved)
    }

    /// Claim and process one message. `None` when the queue stayed empty
    /// for the blocking timeout.
    #[instrument(skip(self), fields(worker = %self.name))]
    pub async fn process_next(&self) -> Result<Option<JobDisposition>> {
        let claimed = self
            .bridge
            .backend()
            .claim(
                &self.bridge.keys().ready,
                &self.processing,
                self.bridge.blocking_timeout(),
            )
            .await?;
        match claimed {
            Some(payload) => Ok(Some(self.process(&payload).await?)),
            None => Ok(None),
        }
    }

    async fn process(&self, payload: &str) -> Result<JobDisposition> {
        let mut job = match JobMessage::decode(payload) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "Dead-lettering malformed job payload");
                self.dead_letter_raw(payload).await?;
                return Ok(JobDisposition::DeadLettered);
            }
        };

        if self.bridge.is_cancelled(&job.job_id).await? {
            debug!(job_id = %job.job_id, "Skipping cancelled job");
            self.ack(payload).await?;
            return Ok(JobDisposition::Skipped);
        }

        if self.registry.local(&job.node_type).is_none() {
            let err = WeftError::NoExecutor(job.node_type.clone());
            warn!(job_id = %job.job_id, node_type = %job.node_type, "No local handler for job");
            job.last_error = Some(err.to_string());
            return self.give_up(payload, job).await;
        }

        debug!(job_id = %job.job_id, node_type = %job.node_type, delivery = job.deliveries + 1, "Running job");
        match self
            .registry
            .execute(job.invocation(), job.execution_context())
            .await
        {
            Ok(outputs) => {
                self.bridge
                    .reply(&job, JobOutcome::Success { outputs })
                    .await?;
                self.ack(payload).await?;
                Ok(JobDisposition::Completed)
            }
            Err(e) => {
                job.deliveries += 1;
                job.last_error = Some(e.to_string());
                if job.deliveries >= self.bridge.max_deliveries() {
                    warn!(job_id = %job.job_id, deliveries = job.deliveries, error = %e, "Job exhausted its deliveries");
                    return self.give_up(payload, job).await;
                }
                warn!(job_id = %job.job_id, deliveries = job.deliveries, error = %e, "Job failed, requeueing");
                self.bridge
                    .backend()
                    .push(&self.bridge.keys().ready, job.encode()?)
                    .await?;
                self.ack(payload).await?;
                Ok(JobDisposition::Requeued)
            }
        }
    }

    /// Dead-letter `job`, tell its waiter, and acknowledge the original payload.
    async fn give_up(&self, payload: &str, job: JobMessage) -> Result<JobDisposition> {
        self.bridge
            .backend()
            .push(&self.bridge.keys().dead_letter, job.encode()?)
            .await?;
        let error = job
            .last_error
            .clone()
            .unwrap_or_else(|| "job dead-lettered".to_string());
        self.bridge.reply(&job, JobOutcome::Fail { error }).await?;
        self.ack(payload).await?;
        Ok(JobDisposition::DeadLettered)
    }

    async fn dead_letter_raw(&self, payload: &str) -> Result<()> {
        self.bridge
            .backend()
            .push(&self.bridge.keys().dead_letter, payload.to_string())
            .await?;
        self.ack(payload).await
    }

    async fn ack(&self, payload: &str) -> Result<()> {
        self.bridge.backend().remove(&self.processing, payload).await
    }

    /// Recover, then process jobs until `shutdown` fires. The job in hand
    /// when shutdown is requested is finished first.
    pub async fn run(self, shutdown: CancellationToken) {
        if let Err(e) = self.recover().await {
            error!(worker = %self.name, error = %e, "Recovery of processing list failed");
        }
        info!(worker = %self.name, "Queue worker started");

        while !shutdown.is_cancelled() {
            match self.process_next().await {
                Ok(Some(disposition)) => {
                    debug!(worker = %self.name, ?disposition, "Job handled");
                }
                Ok(None) => {}
                Err(e) => {
                    error!(worker = %self.name, error = %e, "Queue worker error");
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(IDLE_BACKOFF) => {}
                    }
                }
            }
        }
        info!(worker = %self.name, "Queue worker stopped");
    }
}

/// Start `count` workers named `{prefix}-{index}`.
pub fn spawn_workers(
    bridge: &QueueBridge,
    registry: Arc<HandlerRegistry>,
    prefix: &str,
    count: usize,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|index| {
            let worker = QueueWorker::new(
                bridge.clone(),
                registry.clone(),
                format!("{prefix}-{index}"),
            );
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::QueueBackend;
    use crate::memory::MemoryBackend;
    use serde_json::json;
    use weft_core::config::QueueConfig;
    use weft_core::traits::JobQueue;
    use weft_core::types::NodeInvocation;
    use weft_core::ExecutionContext;
    use weft_test_utils::{fast_retry, registry_with, ScriptedHandler};

    fn setup(handlers: Vec<Arc<dyn weft_core::traits::NodeHandler>>) -> (Arc<MemoryBackend>, QueueBridge, QueueWorker) {
        let backend = Arc::new(MemoryBackend::new());
        let bridge = QueueBridge::new(backend.clone(), &QueueConfig::default()).with_retry(fast_retry());
        let worker = QueueWorker::new(bridge.clone(), Arc::new(registry_with(handlers)), "w0");
        (backend, bridge, worker)
    }

    async fn enqueue(bridge: &QueueBridge, invocation: NodeInvocation) -> JobMessage {
        let ctx = ExecutionContext::new();
        let job = bridge.job(invocation, &ctx);
        bridge.publish(&job, &ctx.cancel_token()).await.unwrap();
        job
    }

    async fn reply_of(backend: &MemoryBackend, job: &JobMessage) -> JobOutcome {
        let payload = backend
            .pop(&job.reply_to, Duration::from_millis(10))
            .await
            .unwrap()
            .expect("result published");
        serde_json::from_str::<crate::message::ResultMessage>(&payload)
            .unwrap()
            .outcome
    }

    #[tokio::test]
    async fn test_completed_job_replies_and_acks() {
        let (backend, bridge, worker) = setup(vec![]);
        let job = enqueue(
            &bridge,
            NodeInvocation::new("c", "constant").with_metadata("value", json!(7)),
        )
        .await;

        assert_eq!(worker.process_next().await.unwrap(), Some(JobDisposition::Completed));
        match reply_of(&backend, &job).await {
            JobOutcome::Success { outputs } => assert_eq!(outputs[0]["out"], json!(7)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(backend.len(&bridge.keys().processing("w0")).await, 0);
        assert_eq!(backend.len(&bridge.keys().ready).await, 0);
    }

    #[tokio::test]
    async fn test_failures_requeue_then_dead_letter() {
        let flaky = ScriptedHandler::new("flaky").failing("boom");
        let calls = flaky.calls();
        let (backend, bridge, worker) = setup(vec![Arc::new(flaky)]);
        let job = enqueue(&bridge, NodeInvocation::new("f", "flaky")).await;

        assert_eq!(worker.process_next().await.unwrap(), Some(JobDisposition::Requeued));
        assert_eq!(worker.process_next().await.unwrap(), Some(JobDisposition::Requeued));
        assert_eq!(worker.process_next().await.unwrap(), Some(JobDisposition::DeadLettered));
        assert_eq!(calls.count(), 3);

        match reply_of(&backend, &job).await {
            JobOutcome::Fail { error } => assert!(error.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }
        let dead = bridge.drain_dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        let dead_job = JobMessage::decode(&dead[0]).unwrap();
        assert_eq!(dead_job.deliveries, 3);
        assert_eq!(dead_job.job_id, job.job_id);
        assert_eq!(backend.len(&bridge.keys().processing("w0")).await, 0);
    }

    #[tokio::test]
    async fn test_unknown_type_dead_letters_immediately() {
        let (backend, bridge, worker) = setup(vec![]);
        let job = enqueue(&bridge, NodeInvocation::new("x", "gpu.render")).await;

        assert_eq!(worker.process_next().await.unwrap(), Some(JobDisposition::DeadLettered));
        match reply_of(&backend, &job).await {
            JobOutcome::Fail { error } => assert!(error.contains("gpu.render")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(bridge.drain_dead_letters().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_dead_letters() {
        let (backend, bridge, worker) = setup(vec![]);
        backend.push(&bridge.keys().ready, "{oops".into()).await.unwrap();

        assert_eq!(worker.process_next().await.unwrap(), Some(JobDisposition::DeadLettered));
        assert_eq!(bridge.drain_dead_letters().await.unwrap(), vec!["{oops"]);
        assert_eq!(backend.len(&bridge.keys().processing("w0")).await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_job_is_skipped() {
        let handler = ScriptedHandler::new("work").emit_value("out", json!(1));
        let calls = handler.calls();
        let (backend, bridge, worker) = setup(vec![Arc::new(handler)]);
        let job = enqueue(&bridge, NodeInvocation::new("w", "work")).await;
        bridge.cancel_job(&job.job_id).await.unwrap();

        assert_eq!(worker.process_next().await.unwrap(), Some(JobDisposition::Skipped));
        assert_eq!(calls.count(), 0);
        assert_eq!(backend.len(&job.reply_to).await, 0);
    }

    #[tokio::test]
    async fn test_recover_returns_unacked_jobs() {
        let (backend, bridge, worker) = setup(vec![]);
        backend
            .push(&bridge.keys().processing("w0"), "left-over".into())
            .await
            .unwrap();
        assert_eq!(worker.recover().await.unwrap(), 1);
        assert_eq!(backend.list(&bridge.keys().ready).await, vec!["left-over"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_queue_yields_none() {
        let (_backend, _bridge, worker) = setup(vec![]);
        assert_eq!(worker.process_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_spawned_workers_serve_submissions() {
        let (_backend, bridge, _worker) = setup(vec![]);
        let registry = Arc::new(registry_with(vec![]));
        let shutdown = CancellationToken::new();
        let handles = spawn_workers(&bridge, registry, "pool", 2, shutdown.clone());

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            bridge.submit(
                NodeInvocation::new("p", "passthrough").with_input("in", json!("hi")),
                ExecutionContext::new(),
            ),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Success {
                outputs: vec![weft_core::types::output([("out", json!("hi"))])]
            }
        );

        shutdown.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
