//! Scripted handlers, peers and queues for exercising the engine without
//! real workloads or network services.

use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::StreamExt;

use weft_core::config::{AppConfig, RetryConfig};
use weft_core::error::{Result, WeftError};
use weft_core::traits::{JobQueue, NodeHandler, RemotePeer};
use weft_core::types::{
    output, InputSnapshot, JobOutcome, NodeInvocation, NodeUpdate, OutputSnapshot, Value,
};
use weft_core::ExecutionContext;
use weft_nodes::HandlerRegistry;

/// Shared record of the inputs each firing of a handler received.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<InputSnapshot>>>);

impl CallLog {
    fn record(&self, inputs: InputSnapshot) {
        self.0.lock().unwrap().push(inputs);
    }

    pub fn inputs(&self) -> Vec<InputSnapshot> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// Handler that plays back a fixed list of emissions, optionally followed by
/// a failure. `delay` is slept before each emission and before the failure.
pub struct ScriptedHandler {
    node_type: String,
    emissions: Vec<OutputSnapshot>,
    failure: Option<String>,
    delay: Duration,
    timeout_secs: u64,
    calls: CallLog,
}

impl ScriptedHandler {
    pub fn new(node_type: &str) -> Self {
        Self {
            node_type: node_type.to_string(),
            emissions: Vec::new(),
            failure: None,
            delay: Duration::ZERO,
            timeout_secs: 30,
            calls: CallLog::default(),
        }
    }

    pub fn emit(mut self, snapshot: OutputSnapshot) -> Self {
        self.emissions.push(snapshot);
        self
    }

    /// Emit a single-slot snapshot.
    pub fn emit_value(self, slot: &str, value: Value) -> Self {
        self.emit(output([(slot, value)]))
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Handle to the inputs of every firing, usable after registration.
    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }
}

impl NodeHandler for ScriptedHandler {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn description(&self) -> &str {
        "Scripted test handler"
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    fn run(
        &self,
        invocation: NodeInvocation,
        _ctx: ExecutionContext,
    ) -> BoxStream<'static, Result<OutputSnapshot>> {
        self.calls.record(invocation.inputs);

        let mut items: Vec<Result<OutputSnapshot>> =
            self.emissions.iter().cloned().map(Ok).collect();
        if let Some(message) = &self.failure {
            items.push(Err(WeftError::handler(self.node_type.clone(), message.clone())));
        }
        let delay = self.delay;
        stream::iter(items)
            .then(move |item| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed()
    }
}

/// Handler whose firings never emit nor finish.
pub struct StalledHandler {
    node_type: String,
    timeout_secs: u64,
    calls: CallLog,
}

impl StalledHandler {
    pub fn new(node_type: &str) -> Self {
        Self {
            node_type: node_type.to_string(),
            timeout_secs: 300,
            calls: CallLog::default(),
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }
}

impl NodeHandler for StalledHandler {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn description(&self) -> &str {
        "Never completes"
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    fn run(
        &self,
        invocation: NodeInvocation,
        _ctx: ExecutionContext,
    ) -> BoxStream<'static, Result<OutputSnapshot>> {
        self.calls.record(invocation.inputs);
        stream::pending().boxed()
    }
}

/// Remote peer that replays a scripted update sequence.
///
/// The first `fail_first` delegations fail with a transport error.
pub struct ScriptedPeer {
    name: String,
    emissions: Vec<OutputSnapshot>,
    terminal: Option<NodeUpdate>,
    fail_first: u32,
    attempts: AtomicU32,
    received: Mutex<Vec<NodeInvocation>>,
}

impl ScriptedPeer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            emissions: Vec::new(),
            terminal: Some(NodeUpdate::success()),
            fail_first: 0,
            attempts: AtomicU32::new(0),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn emit(mut self, snapshot: OutputSnapshot) -> Self {
        self.emissions.push(snapshot);
        self
    }

    /// End the stream with `fail` instead of `success`.
    pub fn failing(mut self, message: &str) -> Self {
        self.terminal = Some(NodeUpdate::fail(message));
        self
    }

    /// End the stream without any terminal update.
    pub fn truncated(mut self) -> Self {
        self.terminal = None;
        self
    }

    pub fn fail_first(mut self, attempts: u32) -> Self {
        self.fail_first = attempts;
        self
    }

    /// Delegation attempts so far, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Invocations of successful delegations.
    pub fn received(&self) -> Vec<NodeInvocation> {
        self.received.lock().unwrap().clone()
    }
}

impl RemotePeer for ScriptedPeer {
    fn name(&self) -> &str {
        &self.name
    }

    fn delegate(
        &self,
        invocation: NodeInvocation,
        _ctx: ExecutionContext,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<NodeUpdate>>>> {
        Box::pin(async move {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                return Err(WeftError::Transport(format!(
                    "peer '{}' refused connection",
                    self.name
                )));
            }
            self.received.lock().unwrap().push(invocation);

            let mut updates = vec![NodeUpdate::pending(), NodeUpdate::running()];
            updates.extend(self.emissions.iter().cloned().map(NodeUpdate::emitting));
            updates.extend(self.terminal.clone());
            Ok(stream::iter(updates.into_iter().map(Ok)).boxed())
        })
    }
}

/// Job queue that records submissions and answers with a fixed outcome.
pub struct RecordingQueue {
    outcome: JobOutcome,
    delay: Duration,
    jobs: Mutex<Vec<NodeInvocation>>,
}

impl RecordingQueue {
    pub fn new(outcome: JobOutcome) -> Self {
        Self {
            outcome,
            delay: Duration::ZERO,
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding(outputs: Vec<OutputSnapshot>) -> Self {
        Self::new(JobOutcome::Success { outputs })
    }

    pub fn failing(error: &str) -> Self {
        Self::new(JobOutcome::Fail {
            error: error.to_string(),
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn jobs(&self) -> Vec<NodeInvocation> {
        self.jobs.lock().unwrap().clone()
    }
}

impl JobQueue for RecordingQueue {
    fn submit(
        &self,
        invocation: NodeInvocation,
        ctx: ExecutionContext,
    ) -> BoxFuture<'_, Result<JobOutcome>> {
        Box::pin(async move {
            self.jobs.lock().unwrap().push(invocation);
            tokio::select! {
                _ = ctx.cancelled() => Err(WeftError::Cancelled),
                _ = tokio::time::sleep(self.delay) => Ok(self.outcome.clone()),
            }
        })
    }
}

/// Retry policy with millisecond backoff.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
    }
}

/// Registry holding the built-ins plus the given handlers.
pub fn registry_with(handlers: Vec<Arc<dyn NodeHandler>>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::with_builtins();
    for handler in handlers {
        registry
            .register_arc(handler)
            .expect("test handler collides with a built-in");
    }
    registry
}

/// Write `content` to a temporary `.toml` file.
pub fn temp_toml(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp file");
    file.write_all(content.as_bytes()).expect("write temp file");
    file
}

/// Parse a config snippet the way `weft.toml` is parsed, minus env expansion.
pub fn config_from_toml(content: &str) -> AppConfig {
    toml::from_str(content).expect("valid config snippet")
}
