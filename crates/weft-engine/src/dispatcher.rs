use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use weft_core::config::RetryConfig;
use weft_core::error::{Result, WeftError};
use weft_core::graph::Graph;
use weft_core::retry::with_retry;
use weft_core::traits::{JobQueue, NodeHandler, RemotePeer};
use weft_core::types::{JobOutcome, NodeInvocation, NodeState, NodeUpdate, OutputSnapshot};
use weft_core::ExecutionContext;
use weft_nodes::{HandlerRegistry, Registration};

/// Updates buffered per firing before the handler is back-pressured.
const UPDATE_BUFFER: usize = 16;

/// Where a node type is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    Local,
    /// Delegated to the named peer.
    Remote(String),
    Queued,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote(peer) => write!(f, "remote:{peer}"),
            Self::Queued => f.write_str("queue"),
        }
    }
}

enum Route {
    Local(Arc<dyn NodeHandler>),
    Remote(Arc<dyn RemotePeer>),
    Queued(Arc<dyn JobQueue>),
    Unroutable,
}

/// Routes a ready node to its execution strategy and normalizes whatever
/// comes back into `pending → running → (emitting)* → success | fail`.
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    queue: Option<Arc<dyn JobQueue>>,
    retry: RetryConfig,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            queue: None,
            retry: RetryConfig::default(),
        }
    }

    /// Enable queued dispatch for node types with no local handler or peer.
    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Backoff policy for transport failures during remote delegation.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// The strategy a node type would be dispatched with, if any.
    pub fn strategy(&self, node_type: &str) -> Option<Strategy> {
        match self.registry.get(node_type) {
            Some(Registration::Local(_)) => Some(Strategy::Local),
            Some(Registration::Remote(peer)) => Some(Strategy::Remote(peer.name().to_string())),
            None if self.queue.is_some() => Some(Strategy::Queued),
            None => None,
        }
    }

    /// Reject graphs containing node types nothing can execute.
    pub fn check_routable(&self, graph: &Graph) -> Result<()> {
        let mut missing: Vec<&str> = graph
            .nodes
            .iter()
            .filter(|n| self.strategy(&n.node_type).is_none())
            .map(|n| n.node_type.as_str())
            .collect();
        missing.sort_unstable();
        missing.dedup();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(WeftError::NoExecutor(missing.join(", ")))
        }
    }

    fn route(&self, node_type: &str) -> Route {
        match self.registry.get(node_type) {
            Some(Registration::Local(handler)) => Route::Local(Arc::clone(handler)),
            Some(Registration::Remote(peer)) => Route::Remote(Arc::clone(peer)),
            None => match &self.queue {
                Some(queue) => Route::Queued(Arc::clone(queue)),
                None => Route::Unroutable,
            },
        }
    }

    /// Start one firing. The returned stream always ends with exactly one
    /// `success` or `fail` update.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(
        &self,
        invocation: NodeInvocation,
        ctx: ExecutionContext,
    ) -> BoxStream<'static, NodeUpdate> {
        let route = self.route(&invocation.node_type);
        let retry = self.retry.clone();
        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
        tokio::spawn(drive(route, invocation, ctx, retry, tx));
        ReceiverStream::new(rx).boxed()
    }
}

async fn drive(
    route: Route,
    invocation: NodeInvocation,
    ctx: ExecutionContext,
    retry: RetryConfig,
    tx: mpsc::Sender<NodeUpdate>,
) {
    let node_id = invocation.node_id.clone();
    let node_type = invocation.node_type.clone();

    if tx.send(NodeUpdate::pending()).await.is_err() {
        return;
    }
    if ctx.is_cancelled() {
        debug!(node_id = %node_id, "Run cancelled before node start");
        let _ = tx
            .send(NodeUpdate::fail(ctx.render_error(&WeftError::Cancelled)))
            .await;
        return;
    }
    if tx.send(NodeUpdate::running()).await.is_err() {
        return;
    }

    let emitter = Emitter { tx: &tx, ctx: &ctx };
    let result = match route {
        Route::Local(handler) => run_local(handler, invocation, &ctx, &emitter).await,
        Route::Remote(peer) => run_remote(peer, invocation, &ctx, &retry, &emitter).await,
        Route::Queued(queue) => run_queued(queue, invocation, &ctx, &emitter).await,
        Route::Unroutable => Err(WeftError::NoExecutor(node_type.clone())),
    };

    let terminal = match result {
        Ok(()) => NodeUpdate::success(),
        Err(e) => {
            if matches!(e, WeftError::Cancelled) {
                debug!(node_id = %node_id, "Node cancelled");
            } else {
                warn!(node_id = %node_id, node_type = %node_type, error = %e, "Node failed");
            }
            NodeUpdate::fail(ctx.render_error(&e))
        }
    };
    let _ = tx.send(terminal).await;
}

/// Forwards emissions, re-checking cancellation at every transition.
struct Emitter<'a> {
    tx: &'a mpsc::Sender<NodeUpdate>,
    ctx: &'a ExecutionContext,
}

impl Emitter<'_> {
    async fn emit(&self, output: OutputSnapshot) -> Result<()> {
        if self.ctx.is_cancelled() {
            return Err(WeftError::Cancelled);
        }
        // A dropped receiver means nobody is listening to this run anymore
        self.tx
            .send(NodeUpdate::emitting(output))
            .await
            .map_err(|_| WeftError::Cancelled)
    }
}

async fn run_local(
    handler: Arc<dyn NodeHandler>,
    invocation: NodeInvocation,
    ctx: &ExecutionContext,
    emitter: &Emitter<'_>,
) -> Result<()> {
    let timeout_secs = handler.timeout_secs();
    let node_type = invocation.node_type.clone();
    let mut stream = handler.run(invocation, ctx.clone());
    let deadline = tokio::time::sleep(Duration::from_secs(timeout_secs));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(WeftError::Cancelled),
            _ = &mut deadline => {
                return Err(WeftError::HandlerTimeout {
                    node_type: node_type.clone(),
                    timeout_secs,
                });
            }
            item = stream.next() => match item {
                Some(Ok(output)) => emitter.emit(output).await?,
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            },
        }
    }
}

async fn run_remote(
    peer: Arc<dyn RemotePeer>,
    invocation: NodeInvocation,
    ctx: &ExecutionContext,
    retry: &RetryConfig,
    emitter: &Emitter<'_>,
) -> Result<()> {
    let peer = peer.as_ref();
    let cancel = ctx.cancel_token();
    let mut updates = with_retry(retry, &cancel, "remote_delegate", |attempt| {
        if attempt > 0 {
            debug!(peer = peer.name(), node_id = %invocation.node_id, attempt, "Retrying delegation");
        }
        peer.delegate(invocation.clone(), ctx.clone())
    })
    .await?;

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(WeftError::Cancelled),
            update = updates.next() => match update {
                Some(Ok(update)) => match update.state {
                    // Folded into this dispatch's own pending/running
                    NodeState::Pending | NodeState::Running => {}
                    NodeState::Emitting => {
                        if let Some(output) = update.output {
                            emitter.emit(output).await?;
                        }
                    }
                    NodeState::Success => return Ok(()),
                    NodeState::Fail => {
                        return Err(WeftError::Remote {
                            route: format!("peer '{}'", peer.name()),
                            message: update
                                .error
                                .unwrap_or_else(|| "no error reported".to_string()),
                        });
                    }
                },
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(WeftError::Transport(format!(
                        "peer '{}' closed the stream before a terminal state",
                        peer.name()
                    )));
                }
            },
        }
    }
}

async fn run_queued(
    queue: Arc<dyn JobQueue>,
    invocation: NodeInvocation,
    ctx: &ExecutionContext,
    emitter: &Emitter<'_>,
) -> Result<()> {
    match queue.submit(invocation, ctx.clone()).await? {
        JobOutcome::Success { outputs } => {
            for output in outputs {
                emitter.emit(output).await?;
            }
            Ok(())
        }
        JobOutcome::Fail { error } => Err(WeftError::Remote {
            route: "queue".to_string(),
            message: error,
        }),
    }
}
