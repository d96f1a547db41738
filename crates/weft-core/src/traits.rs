use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::types::{JobOutcome, NodeInvocation, NodeUpdate, OutputSnapshot};

/// In-process handler for one node type.
///
/// A firing is a stream of output emissions: each `Ok` item is one
/// `emitting` transition, the end of the stream is `success`, and an `Err`
/// item is `fail`. The stream must own everything it needs.
pub trait NodeHandler: Send + Sync + 'static {
    /// Node type this handler serves.
    fn node_type(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Start one firing of the node.
    fn run(
        &self,
        invocation: NodeInvocation,
        ctx: ExecutionContext,
    ) -> BoxStream<'static, Result<OutputSnapshot>>;

    /// Upper bound on a single firing, in seconds.
    fn timeout_secs(&self) -> u64 {
        300
    }
}

/// A peer process able to run node types this process cannot.
pub trait RemotePeer: Send + Sync + 'static {
    /// Peer name, for logs and route reports.
    fn name(&self) -> &str;

    /// Open a delegated firing and stream back the peer's state updates.
    ///
    /// Implementations forward `ctx` cancellation to the peer when their
    /// transport allows it.
    fn delegate(
        &self,
        invocation: NodeInvocation,
        ctx: ExecutionContext,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<NodeUpdate>>>>;
}

/// Asynchronous worker pool reached through a message broker.
pub trait JobQueue: Send + Sync + 'static {
    /// Publish the firing as a job and wait for its result message.
    ///
    /// Must resolve with `WeftError::Cancelled` soon after `ctx` is
    /// cancelled, after telling workers to skip the job.
    fn submit(
        &self,
        invocation: NodeInvocation,
        ctx: ExecutionContext,
    ) -> BoxFuture<'_, Result<JobOutcome>>;
}
