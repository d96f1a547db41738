use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use weft_core::config::{QueueConfig, RetryConfig};
use weft_core::error::{Result, WeftError};
use weft_core::retry::{calculate_backoff, with_retry};
use weft_core::traits::JobQueue;
use weft_core::types::{JobOutcome, NodeInvocation};
use weft_core::ExecutionContext;

use crate::backend::QueueBackend;
use crate::message::{JobMessage, ResultMessage};
use crate::redis_backend::RedisBackend;

/// Key layout of one named queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub ready: String,
    pub dead_letter: String,
    reply_prefix: String,
    cancel_prefix: String,
}

impl QueueKeys {
    pub fn new(namespace: &str, name: &str, dead_letter: &str) -> Self {
        Self {
            ready: format!("{namespace}{name}"),
            dead_letter: format!("{namespace}{dead_letter}"),
            reply_prefix: format!("{namespace}{name}:reply:"),
            cancel_prefix: format!("{namespace}{name}:cancel:"),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(&config.namespace, &config.name, &config.dead_letter_name())
    }

    pub fn reply(&self, job_id: &str) -> String {
        format!("{}{}", self.reply_prefix, job_id)
    }

    pub fn cancel(&self, job_id: &str) -> String {
        format!("{}{}", self.cancel_prefix, job_id)
    }

    /// In-flight list of one worker.
    pub fn processing(&self, worker: &str) -> String {
        format!("{}:processing:{}", self.ready, worker)
    }
}

/// Publishes jobs to a queue and waits for their results.
///
/// Shared by the scheduler side (`JobQueue::submit`) and by workers, which
/// use it to answer and to check cancel flags.
#[derive(Clone)]
pub struct QueueBridge {
    backend: Arc<dyn QueueBackend>,
    keys: Arc<QueueKeys>,
    retry: RetryConfig,
    blocking_timeout: Duration,
    cancel_ttl: Duration,
    max_deliveries: u32,
}

impl QueueBridge {
    pub fn new(backend: Arc<dyn QueueBackend>, config: &QueueConfig) -> Self {
        Self {
            backend,
            keys: Arc::new(QueueKeys::from_config(config)),
            retry: RetryConfig::default(),
            blocking_timeout: Duration::from_secs(config.blocking_timeout_secs),
            cancel_ttl: Duration::from_secs(config.cancel_ttl_secs),
            max_deliveries: config.max_deliveries.max(1),
        }
    }

    /// Bridge over the Redis server named in `config`.
    pub fn connect(config: &QueueConfig) -> Result<Self> {
        let backend = RedisBackend::from_config(config)?;
        info!(url = %config.url, queue = %config.name, "Queue bridge configured");
        Ok(Self::new(Arc::new(backend), config))
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub fn blocking_timeout(&self) -> Duration {
        self.blocking_timeout
    }

    pub fn max_deliveries(&self) -> u32 {
        self.max_deliveries
    }

    /// Build the job message for one firing.
    pub fn job(&self, invocation: NodeInvocation, ctx: &ExecutionContext) -> JobMessage {
        let job_id = Uuid::new_v4().to_string();
        let reply_to = self.keys.reply(&job_id);
        JobMessage::new(job_id, invocation, ctx, reply_to)
    }

    /// Push `job` onto the ready list, retrying transport failures.
    #[instrument(skip_all, fields(job_id = %job.job_id, node_type = %job.node_type))]
    pub async fn publish(&self, job: &JobMessage, cancel: &CancellationToken) -> Result<()> {
        let payload = job.encode()?;
        let ready = self.keys.ready.as_str();
        let result = with_retry(&self.retry, cancel, "queue_publish", |_| {
            self.backend.push(ready, payload.clone())
        })
        .await;
        match result {
            Ok(()) => {
                debug!("Job published");
                Ok(())
            }
            Err(WeftError::Transport(message)) => Err(WeftError::Delivery {
                attempts: self.retry.max_retries + 1,
                message,
            }),
            Err(e) => Err(e),
        }
    }

    /// Wait for the result of `job`.
    ///
    /// Cancelling `ctx` sets the job's cancel flag and returns `Cancelled`.
    /// Results that answer a different job or run are dropped.
    #[instrument(skip_all, fields(job_id = %job.job_id))]
    pub async fn await_result(&self, job: &JobMessage, ctx: &ExecutionContext) -> Result<JobOutcome> {
        let mut failures = 0;
        loop {
            let popped = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    if let Err(e) = self.cancel_job(&job.job_id).await {
                        warn!(error = %e, "Failed to flag cancelled job");
                    }
                    return Err(WeftError::Cancelled);
                }
                popped = self.backend.pop(&job.reply_to, self.blocking_timeout) => popped,
            };

            match popped {
                Ok(Some(payload)) => {
                    failures = 0;
                    match serde_json::from_str::<ResultMessage>(&payload) {
                        Ok(result) if result.answers(job) => return Ok(result.outcome),
                        Ok(result) => {
                            warn!(other_job = %result.job_id, "Dropping result for another job");
                        }
                        Err(e) => warn!(error = %e, "Dropping malformed result message"),
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_transport() && failures < self.retry.max_retries => {
                    let backoff = calculate_backoff(failures, &self.retry);
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Reply wait failed, retrying");
                    failures += 1;
                    tokio::select! {
                        _ = ctx.cancelled() => {}
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Flag `job_id` so workers skip it.
    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        debug!(job_id, "Flagging job as cancelled");
        self.backend
            .set_flag(&self.keys.cancel(job_id), self.cancel_ttl)
            .await
    }

    pub async fn is_cancelled(&self, job_id: &str) -> Result<bool> {
        self.backend.has_flag(&self.keys.cancel(job_id)).await
    }

    /// Answer `job` on its reply list.
    pub async fn reply(&self, job: &JobMessage, outcome: JobOutcome) -> Result<()> {
        let payload = serde_json::to_string(&ResultMessage::for_job(job, outcome))?;
        let cancel = CancellationToken::new();
        with_retry(&self.retry, &cancel, "queue_reply", |_| {
            self.backend.push(&job.reply_to, payload.clone())
        })
        .await
    }

    /// Remove and return every dead-lettered payload, oldest first.
    pub async fn drain_dead_letters(&self) -> Result<Vec<String>> {
        self.backend.drain(&self.keys.dead_letter).await
    }
}

impl JobQueue for QueueBridge {
    fn submit(
        &self,
        invocation: NodeInvocation,
        ctx: ExecutionContext,
    ) -> BoxFuture<'_, Result<JobOutcome>> {
        Box::pin(async move {
            let job = self.job(invocation, &ctx);
            self.publish(&job, &ctx.cancel_token()).await?;
            self.await_result(&job, &ctx).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use serde_json::json;
    use weft_test_utils::fast_retry;

    fn bridge_over(backend: Arc<dyn QueueBackend>) -> QueueBridge {
        QueueBridge::new(backend, &QueueConfig::default()).with_retry(fast_retry())
    }

    struct DownBackend;

    impl QueueBackend for DownBackend {
        fn push<'a>(&'a self, _: &'a str, _: String) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Err(WeftError::Transport("connection refused".into())) })
        }
        fn claim<'a>(&'a self, _: &'a str, _: &'a str, _: Duration) -> BoxFuture<'a, Result<Option<String>>> {
            Box::pin(async { Err(WeftError::Transport("connection refused".into())) })
        }
        fn pop<'a>(&'a self, _: &'a str, _: Duration) -> BoxFuture<'a, Result<Option<String>>> {
            Box::pin(async { Err(WeftError::Transport("connection refused".into())) })
        }
        fn remove<'a>(&'a self, _: &'a str, _: &'a str) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }
        fn move_all<'a>(&'a self, _: &'a str, _: &'a str) -> BoxFuture<'a, Result<usize>> {
            Box::pin(async { Ok(0) })
        }
        fn drain<'a>(&'a self, _: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
            Box::pin(async { Ok(Vec::new()) })
        }
        fn set_flag<'a>(&'a self, _: &'a str, _: Duration) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }
        fn has_flag<'a>(&'a self, _: &'a str) -> BoxFuture<'a, Result<bool>> {
            Box::pin(async { Ok(false) })
        }
    }

    #[test]
    fn test_key_layout() {
        let keys = QueueKeys::new("weft:", "jobs", "jobs:dead");
        assert_eq!(keys.ready, "weft:jobs");
        assert_eq!(keys.dead_letter, "weft:jobs:dead");
        assert_eq!(keys.reply("j1"), "weft:jobs:reply:j1");
        assert_eq!(keys.cancel("j1"), "weft:jobs:cancel:j1");
        assert_eq!(keys.processing("w0"), "weft:jobs:processing:w0");
    }

    #[tokio::test]
    async fn test_submit_publishes_and_waits_for_reply() {
        let backend = Arc::new(MemoryBackend::new());
        let bridge = bridge_over(backend.clone());

        let answering = {
            let bridge = bridge.clone();
            let backend = backend.clone();
            tokio::spawn(async move {
                let payload = backend
                    .pop(&bridge.keys().ready, Duration::from_secs(5))
                    .await
                    .unwrap()
                    .expect("job published");
                let job = JobMessage::decode(&payload).unwrap();
                assert_eq!(job.inputs["x"], json!(2));
                bridge
                    .reply(
                        &job,
                        JobOutcome::Success {
                            outputs: vec![weft_core::types::output([("y", json!(4))])],
                        },
                    )
                    .await
                    .unwrap();
            })
        };

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            bridge.submit(
                NodeInvocation::new("sq", "math.square").with_input("x", json!(2)),
                ExecutionContext::new(),
            ),
        )
        .await
        .unwrap()
        .unwrap();
        answering.await.unwrap();
        match outcome {
            JobOutcome::Success { outputs } => assert_eq!(outputs[0]["y"], json!(4)),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_foreign_results_are_ignored() {
        let backend = Arc::new(MemoryBackend::new());
        let bridge = bridge_over(backend.clone());
        let ctx = ExecutionContext::new();
        let job = bridge.job(NodeInvocation::new("n", "t"), &ctx);

        let mut stranger = job.clone();
        stranger.job_id = "other".into();
        backend
            .push(&job.reply_to, serde_json::to_string(&ResultMessage::for_job(&stranger, JobOutcome::Fail { error: "no".into() })).unwrap())
            .await
            .unwrap();
        backend.push(&job.reply_to, "garbage".into()).await.unwrap();
        bridge
            .reply(&job, JobOutcome::Success { outputs: vec![] })
            .await
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), bridge.await_result(&job, &ctx))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, JobOutcome::Success { outputs: vec![] });
    }

    #[tokio::test]
    async fn test_cancel_sets_flag_and_returns_cancelled() {
        let backend = Arc::new(MemoryBackend::new());
        let bridge = bridge_over(backend.clone());
        let ctx = ExecutionContext::new();
        let job = bridge.job(NodeInvocation::new("n", "t"), &ctx);
        bridge.publish(&job, &ctx.cancel_token()).await.unwrap();

        let waiting = {
            let bridge = bridge.clone();
            let job = job.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { bridge.await_result(&job, &ctx).await })
        };
        tokio::task::yield_now().await;
        ctx.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(WeftError::Cancelled)));
        assert!(bridge.is_cancelled(&job.job_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_failure_becomes_delivery_error() {
        let bridge = bridge_over(Arc::new(DownBackend));
        let result = bridge
            .submit(NodeInvocation::new("n", "t"), ExecutionContext::new())
            .await;
        match result {
            Err(WeftError::Delivery { attempts, message }) => {
                assert_eq!(attempts, 3);
                assert!(message.contains("connection refused"));
            }
            other => panic!("expected delivery error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_drain_dead_letters() {
        let backend = Arc::new(MemoryBackend::new());
        let bridge = bridge_over(backend.clone());
        backend.push(&bridge.keys().dead_letter, "a".into()).await.unwrap();
        backend.push(&bridge.keys().dead_letter, "b".into()).await.unwrap();
        assert_eq!(bridge.drain_dead_letters().await.unwrap(), vec!["a", "b"]);
        assert!(bridge.drain_dead_letters().await.unwrap().is_empty());
    }
}
