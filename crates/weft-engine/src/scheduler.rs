//! Reactive graph execution.
//!
//! A run is driven by a single task that owns every node's runtime state and
//! every port buffer. Each firing is a dispatch stream; all in-flight streams
//! are merged and their updates applied one at a time, which re-evaluates
//! readiness of the nodes the update touched.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, BoxStream, SelectAll};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use weft_core::config::EngineConfig;
use weft_core::error::{Result, WeftError};
use weft_core::event::EventBus;
use weft_core::graph::Graph;
use weft_core::types::{
    CorrelationId, EngineEvent, InputSnapshot, NodeInvocation, NodeState, NodeUpdate,
    OutputSnapshot, RunOutcome, StateEvent,
};
use weft_core::ExecutionContext;

use crate::aggregator::{Closure, PortAggregator};
use crate::dispatcher::Dispatcher;

/// Executes graphs against a dispatcher.
pub struct GraphScheduler {
    dispatcher: Arc<Dispatcher>,
    config: EngineConfig,
    event_bus: Option<Arc<EventBus>>,
}

impl GraphScheduler {
    pub fn new(dispatcher: Arc<Dispatcher>, config: EngineConfig) -> Self {
        Self {
            dispatcher,
            config,
            event_bus: None,
        }
    }

    /// Also publish run and node events on `bus` for side observers.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Validate `graph` and start running it.
    ///
    /// The run gets a child of `ctx`: cancelling `ctx` cancels the run, and
    /// a configured run timeout cancels only the run. Validation and routing
    /// errors are returned before anything is dispatched.
    pub fn execute(&self, graph: Graph, ctx: &ExecutionContext) -> Result<RunHandle> {
        graph.validate()?;
        self.dispatcher.check_routable(&graph)?;

        let ctx = match self.config.run_timeout() {
            Some(timeout) => ctx.with_deadline(timeout),
            None => ctx.child(),
        };
        let verbose = ctx.verbose_errors() || self.config.verbose_errors();
        let ctx = ctx.with_verbose_errors(verbose);
        let correlation_id = ctx.correlation_id().clone();

        let (tx, rx) = mpsc::channel(self.config.event_capacity.max(1));
        let run = Run::new(
            graph,
            ctx,
            Arc::clone(&self.dispatcher),
            self.config.clone(),
            self.event_bus.clone(),
            tx,
        );
        let task = tokio::spawn(run.drive());

        Ok(RunHandle {
            correlation_id,
            events: ReceiverStream::new(rx),
            task,
        })
    }
}

/// Per-node summary in a run report.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub id: String,
    pub node_type: String,
    pub state: NodeState,
    pub firings: u32,
    /// Never fired during the run.
    pub stalled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final account of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub correlation_id: CorrelationId,
    pub outcome: RunOutcome,
    pub nodes: Vec<NodeSummary>,
    /// The graph with every node's final state.
    pub graph: Graph,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn node(&self, id: &str) -> Option<&NodeSummary> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Ids of nodes that never fired.
    pub fn stalled(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.stalled)
            .map(|n| n.id.as_str())
            .collect()
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }
}

/// Everything a run produced, for callers that want it all at once.
#[derive(Debug)]
pub struct RunRecord {
    pub events: Vec<StateEvent>,
    /// Run-level errors delivered on the stream, such as a deadlock.
    pub errors: Vec<WeftError>,
    pub report: RunReport,
}

impl RunRecord {
    /// Transitions of one node, in order.
    pub fn node_states(&self, node_id: &str) -> Vec<NodeState> {
        self.events
            .iter()
            .filter(|e| e.node_id == node_id)
            .map(|e| e.state)
            .collect()
    }

    /// Every output emitted by one node, in order.
    pub fn outputs(&self, node_id: &str) -> Vec<&OutputSnapshot> {
        self.events
            .iter()
            .filter(|e| e.node_id == node_id)
            .filter_map(|e| e.output.as_ref())
            .collect()
    }
}

/// A running graph.
///
/// The handle is a single-use stream of node transitions that ends when the
/// run ends. The final report is available once the stream is drained.
pub struct RunHandle {
    correlation_id: CorrelationId,
    events: ReceiverStream<Result<StateEvent>>,
    task: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Split into the event stream and the task producing the report.
    pub fn into_parts(self) -> (ReceiverStream<Result<StateEvent>>, JoinHandle<RunReport>) {
        (self.events, self.task)
    }

    /// Drain the stream and return the report. The first run-level error
    /// seen on the stream is returned instead, once the run has ended.
    pub async fn wait(self) -> Result<RunReport> {
        let record = self.into_record().await?;
        match record.errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(record.report),
        }
    }

    /// Drain the stream and keep every event along with the report.
    pub async fn into_record(mut self) -> Result<RunRecord> {
        let mut events = Vec::new();
        let mut errors = Vec::new();
        while let Some(item) = self.events.next().await {
            match item {
                Ok(event) => events.push(event),
                Err(err) => errors.push(err),
            }
        }
        let report = self
            .task
            .await
            .map_err(|e| WeftError::RunAborted(e.to_string()))?;
        Ok(RunRecord {
            events,
            errors,
            report,
        })
    }
}

impl Stream for RunHandle {
    type Item = Result<StateEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

/// Runtime state of one node, addressed by its index in `Graph::nodes`.
#[derive(Debug, Default)]
struct NodeSlot {
    firings: u32,
    running: bool,
    retired: bool,
    last_failed: bool,
    error: Option<String>,
}

/// Merged update streams, tagged with node index and firing cycle. `None`
/// marks the end of a firing's stream.
type Updates = SelectAll<BoxStream<'static, (usize, u32, Option<NodeUpdate>)>>;

struct Run {
    graph: Graph,
    ctx: ExecutionContext,
    dispatcher: Arc<Dispatcher>,
    config: EngineConfig,
    bus: Option<Arc<EventBus>>,
    tx: mpsc::Sender<Result<StateEvent>>,
    slots: Vec<NodeSlot>,
    aggregators: Vec<PortAggregator>,
    /// Destination node and port of each edge.
    routes: Vec<(usize, usize)>,
    /// Outbound edge indices of each node.
    outbound: Vec<Vec<usize>>,
}

impl Run {
    fn new(
        graph: Graph,
        ctx: ExecutionContext,
        dispatcher: Arc<Dispatcher>,
        config: EngineConfig,
        bus: Option<Arc<EventBus>>,
        tx: mpsc::Sender<Result<StateEvent>>,
    ) -> Self {
        let graph = graph.fresh();
        let index: HashMap<&str, usize> = graph
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();

        let mut inbound: Vec<Vec<usize>> = vec![Vec::new(); graph.nodes.len()];
        let mut outbound: Vec<Vec<usize>> = vec![Vec::new(); graph.nodes.len()];
        let mut routes = Vec::with_capacity(graph.edges.len());
        for (e, edge) in graph.edges.iter().enumerate() {
            // Validation guarantees both endpoints exist
            let (Some(&from), Some(&to)) =
                (index.get(edge.from.node.as_str()), index.get(edge.to.node.as_str()))
            else {
                routes.push((usize::MAX, usize::MAX));
                continue;
            };
            outbound[from].push(e);
            routes.push((to, inbound[to].len()));
            inbound[to].push(e);
        }

        let aggregators = graph
            .nodes
            .iter()
            .zip(&inbound)
            .map(|(node, edges)| PortAggregator::new(node, edges.iter().map(|&e| &graph.edges[e])))
            .collect();
        let slots = graph.nodes.iter().map(|_| NodeSlot::default()).collect();

        Self {
            graph,
            ctx,
            dispatcher,
            config,
            bus,
            tx,
            slots,
            aggregators,
            routes,
            outbound,
        }
    }

    async fn drive(mut self) -> RunReport {
        let started = Instant::now();
        let correlation_id = self.ctx.correlation_id().clone();
        info!(
            correlation_id = %correlation_id,
            nodes = self.graph.nodes.len(),
            edges = self.graph.edges.len(),
            "Run started"
        );
        self.broadcast(EngineEvent::RunStarted {
            correlation_id: correlation_id.clone(),
            nodes: self.graph.nodes.len(),
        });

        let idle = self.config.inactivity_timeout();
        let mut merged: Updates = SelectAll::new();
        let mut dirty: VecDeque<usize> = (0..self.graph.nodes.len()).collect();
        let mut last_activity = Instant::now();
        let mut deadlocked = false;

        loop {
            self.settle(&mut dirty, &mut merged).await;
            if merged.is_empty() {
                // Nothing in flight: nodes waiting on feedback edges can never
                // get input again. Close them out one by one and settle again.
                if self.retire_idle(&mut dirty) {
                    continue;
                }
                break;
            }

            tokio::select! {
                item = merged.next() => {
                    let Some((idx, cycle, update)) = item else { break };
                    last_activity = Instant::now();
                    self.apply(idx, cycle, update, &mut dirty).await;
                }
                _ = tokio::time::sleep_until(last_activity + idle) => {
                    deadlocked = true;
                    self.abort_deadlocked(idle, merged.len()).await;
                    break;
                }
            }
        }
        // Dropping the streams detaches whatever is still in flight
        drop(merged);

        let outcome = self.outcome(deadlocked);
        self.ctx.cancel();

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(correlation_id = %correlation_id, outcome = %outcome, elapsed_ms, "Run finished");
        self.broadcast(EngineEvent::RunFinished {
            correlation_id: correlation_id.clone(),
            outcome,
        });

        let nodes = self
            .graph
            .nodes
            .iter()
            .zip(&self.slots)
            .map(|(node, slot)| NodeSummary {
                id: node.id.clone(),
                node_type: node.node_type.clone(),
                state: node.state,
                firings: slot.firings,
                stalled: slot.firings == 0,
                error: slot.error.clone(),
            })
            .collect();

        RunReport {
            correlation_id,
            outcome,
            nodes,
            graph: self.graph,
            elapsed_ms,
        }
    }

    /// Fire or retire every dirty node until nothing changes.
    async fn settle(&mut self, dirty: &mut VecDeque<usize>, merged: &mut Updates) {
        while let Some(idx) = dirty.pop_front() {
            if self.slots[idx].running || self.slots[idx].retired {
                continue;
            }

            let inputs = if self.aggregators[idx].is_source() {
                (self.slots[idx].firings == 0).then(InputSnapshot::new)
            } else {
                self.aggregators[idx].try_fire()
            };

            match inputs {
                Some(_) if self.slots[idx].firings >= self.config.max_firings_per_node => {
                    let err = WeftError::FiringLimit {
                        node_id: self.graph.nodes[idx].id.clone(),
                        limit: self.config.max_firings_per_node,
                    };
                    warn!(error = %err, "Firing limit reached");
                    let update = NodeUpdate::fail(self.ctx.render_error(&err));
                    self.record_terminal(idx, &update);
                    self.publish(idx, update).await;
                    self.retire(idx, dirty);
                }
                Some(inputs) => self.fire(idx, inputs, merged),
                None => {
                    let exhausted = if self.aggregators[idx].is_source() {
                        self.slots[idx].firings > 0
                    } else {
                        self.aggregators[idx].is_exhausted()
                    };
                    if exhausted {
                        self.retire(idx, dirty);
                    }
                }
            }
        }
    }

    fn fire(&mut self, idx: usize, inputs: InputSnapshot, merged: &mut Updates) {
        let slot = &mut self.slots[idx];
        slot.running = true;
        slot.firings += 1;
        let cycle = slot.firings;

        let node = &self.graph.nodes[idx];
        debug!(node_id = %node.id, cycle, "Dispatching node");
        let invocation = NodeInvocation {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            inputs,
            metadata: node.metadata.clone(),
        };

        let updates = self
            .dispatcher
            .dispatch(invocation, self.ctx.clone())
            .map(move |update| (idx, cycle, Some(update)))
            .chain(stream::once(async move { (idx, cycle, None) }))
            .boxed();
        merged.push(updates);
    }

    async fn apply(
        &mut self,
        idx: usize,
        cycle: u32,
        update: Option<NodeUpdate>,
        dirty: &mut VecDeque<usize>,
    ) {
        // Only the node's current firing may change its state; anything else
        // is the tail of a firing that already reached a terminal state.
        let slot = &self.slots[idx];
        if !slot.running || cycle != slot.firings {
            return;
        }
        let update = update
            .unwrap_or_else(|| NodeUpdate::fail("Dispatch ended without a terminal state"));

        if update.state.is_terminal() {
            self.record_terminal(idx, &update);
            dirty.push_back(idx);
        }
        let routed = match (&update.state, &update.output) {
            (NodeState::Emitting, Some(output)) => Some(output.clone()),
            _ => None,
        };
        self.publish(idx, update).await;

        if let Some(output) = routed {
            self.route_output(idx, &output, dirty);
        }
    }

    fn record_terminal(&mut self, idx: usize, update: &NodeUpdate) {
        let slot = &mut self.slots[idx];
        slot.running = false;
        slot.last_failed = update.state == NodeState::Fail;
        slot.error = update.error.clone();
    }

    /// Deliver one emission to every edge reading from the emitting slots.
    fn route_output(&mut self, idx: usize, output: &OutputSnapshot, dirty: &mut VecDeque<usize>) {
        for &e in &self.outbound[idx] {
            let edge = &self.graph.edges[e];
            let Some(value) = output.get(&edge.from.port) else {
                continue;
            };
            let (target, port) = self.routes[e];
            if self.aggregators[target].push(port, value.clone()) {
                dirty.push_back(target);
            }
        }
    }

    /// Close every outbound edge of a node that will never fire again.
    fn retire(&mut self, idx: usize, dirty: &mut VecDeque<usize>) {
        let slot = &mut self.slots[idx];
        slot.retired = true;
        let closure = if slot.firings == 0 || slot.last_failed {
            Closure::Failed
        } else {
            Closure::Completed
        };
        debug!(node_id = %self.graph.nodes[idx].id, firings = slot.firings, ?closure, "Node retired");

        for &e in &self.outbound[idx] {
            let (target, port) = self.routes[e];
            self.aggregators[target].close(port, closure);
            dirty.push_back(target);
        }
    }

    /// Retire one idle node that is still open, taking nodes on a feedback
    /// cycle first so nodes downstream of a loop see its edges close before
    /// they are considered. `false` when every idle node is already retired.
    fn retire_idle(&mut self, dirty: &mut VecDeque<usize>) -> bool {
        let idle: Vec<usize> = (0..self.slots.len())
            .filter(|&i| !self.slots[i].running && !self.slots[i].retired)
            .collect();
        let pick = idle
            .iter()
            .copied()
            .find(|&i| self.on_open_cycle(i))
            .or_else(|| idle.first().copied());
        match pick {
            Some(idx) => {
                self.retire(idx, dirty);
                true
            }
            None => false,
        }
    }

    /// `start` reaches itself through edges between unretired nodes.
    fn on_open_cycle(&self, start: usize) -> bool {
        let mut seen = vec![false; self.slots.len()];
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            for &e in &self.outbound[idx] {
                let (target, _) = self.routes[e];
                if target == start {
                    return true;
                }
                if target < seen.len() && !seen[target] && !self.slots[target].retired {
                    seen[target] = true;
                    stack.push(target);
                }
            }
        }
        false
    }

    async fn abort_deadlocked(&mut self, idle: Duration, in_flight: usize) {
        let idle_ms = idle.as_millis() as u64;
        warn!(
            correlation_id = %self.ctx.correlation_id(),
            idle_ms,
            in_flight,
            "No progress within the inactivity window, aborting run"
        );

        let err = WeftError::Deadlock { idle_ms, in_flight };
        let running: Vec<usize> = (0..self.slots.len())
            .filter(|&i| self.slots[i].running)
            .collect();
        for idx in running {
            let update = NodeUpdate::fail(self.ctx.render_error(&err));
            self.record_terminal(idx, &update);
            self.publish(idx, update).await;
        }
        let _ = self.tx.send(Err(err)).await;
        self.ctx.cancel();
    }

    fn outcome(&self, deadlocked: bool) -> RunOutcome {
        if deadlocked {
            return RunOutcome::Deadlocked;
        }
        if self.ctx.is_cancelled() {
            return RunOutcome::Cancelled;
        }
        let any_failed = self.graph.nodes.iter().any(|n| n.state == NodeState::Fail);
        let sink_succeeded = self.graph.sinks().any(|n| n.state == NodeState::Success);
        if any_failed && !sink_succeeded {
            RunOutcome::Failed
        } else {
            RunOutcome::Succeeded
        }
    }

    /// Record a transition on the graph and hand it to observers.
    async fn publish(&mut self, idx: usize, update: NodeUpdate) {
        let node = &mut self.graph.nodes[idx];
        node.state = update.state;
        let event = StateEvent {
            node_id: node.id.clone(),
            state: update.state,
            cycle: self.slots[idx].firings.max(1),
            output: update.output,
            error: update.error,
            timestamp: Utc::now(),
        };
        debug!(node_id = %event.node_id, state = %event.state, cycle = event.cycle, "Node transition");

        self.broadcast(EngineEvent::NodeState {
            correlation_id: self.ctx.correlation_id().clone(),
            event: event.clone(),
        });
        // The consumer may have dropped the stream; the run still completes
        let _ = self.tx.send(Ok(event)).await;
    }

    fn broadcast(&self, event: EngineEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::graph::{Edge, Mode, Node, ValueType};
    use weft_core::types::{output, Value};
    use weft_nodes::HandlerRegistry;
    use weft_test_utils::{RecordingQueue, ScriptedHandler, StalledHandler};

    fn scheduler_with(registry: HandlerRegistry, config: EngineConfig) -> GraphScheduler {
        GraphScheduler::new(Arc::new(Dispatcher::new(Arc::new(registry))), config)
    }

    fn scheduler(build: impl FnOnce(&mut HandlerRegistry)) -> GraphScheduler {
        let mut registry = HandlerRegistry::new();
        build(&mut registry);
        scheduler_with(registry, EngineConfig::default())
    }

    async fn run(scheduler: &GraphScheduler, graph: Graph) -> RunRecord {
        let handle = scheduler.execute(graph, &ExecutionContext::new()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.into_record())
            .await
            .expect("run did not finish")
            .unwrap()
    }

    /// A node emitting on `out`.
    fn source(id: &str, node_type: &str, ty: ValueType) -> Node {
        Node::new(id, node_type).with_output("out", ty)
    }

    /// Seed 0 into an `iterate` node wired back onto itself.
    fn counting_loop(limit: u64) -> Graph {
        Graph::new()
            .with_node(
                source("seed", "constant", ValueType::Number).with_metadata("value", json!(0)),
            )
            .with_node(
                Node::new("loop", "iterate")
                    .with_input("value", ValueType::Number)
                    .with_output("next", ValueType::Number)
                    .with_output("done", ValueType::Number)
                    .with_metadata("limit", json!(limit)),
            )
            .with_edge(Edge::new("init", ("seed", "out"), ("loop", "value")))
            .with_edge(Edge::new("back", ("loop", "next"), ("loop", "value")))
    }

    fn stalled_scheduler(config: EngineConfig) -> GraphScheduler {
        let mut registry = HandlerRegistry::new();
        registry.register(StalledHandler::new("hang")).unwrap();
        scheduler_with(registry, config)
    }

    #[tokio::test]
    async fn test_edgeless_graph_fires_each_node_once() {
        let sched = scheduler(|r| {
            r.register(ScriptedHandler::new("ok").emit_value("out", json!(1))).unwrap();
            r.register(ScriptedHandler::new("bad").failing("nope")).unwrap();
        });
        let graph = Graph::new()
            .with_node(Node::new("a", "ok"))
            .with_node(Node::new("b", "ok"))
            .with_node(Node::new("c", "bad"));
        let record = run(&sched, graph).await;

        for id in ["a", "b"] {
            assert_eq!(
                record.node_states(id),
                vec![
                    NodeState::Pending,
                    NodeState::Running,
                    NodeState::Emitting,
                    NodeState::Success
                ]
            );
            assert_eq!(record.report.node(id).unwrap().firings, 1);
        }
        assert_eq!(
            record.node_states("c"),
            vec![NodeState::Pending, NodeState::Running, NodeState::Fail]
        );
        // A sink succeeded, so the run did too
        assert_eq!(record.report.outcome, RunOutcome::Succeeded);
        assert!(record.report.stalled().is_empty());
    }

    #[tokio::test]
    async fn test_plain_edge_delivers_latest_value() {
        let burst = ScriptedHandler::new("burst")
            .emit_value("out", json!(1))
            .emit_value("out", json!(2))
            .emit_value("out", json!(3));
        let slow = ScriptedHandler::new("slow")
            .emit_value("done", json!(true))
            .with_delay(Duration::from_millis(50));
        let calls = slow.calls();
        let sched = scheduler(|r| {
            r.register(burst).unwrap();
            r.register(slow).unwrap();
        });
        let graph = Graph::new()
            .with_node(source("a", "burst", ValueType::Number))
            .with_node(Node::new("b", "slow").with_input("in", ValueType::Number))
            .with_edge(Edge::new("e", ("a", "out"), ("b", "in")));
        let record = run(&sched, graph).await;

        // b is busy with 1 while 2 and 3 arrive; 2 is overwritten unread
        let seen: Vec<Value> = calls.inputs().into_iter().map(|i| i["in"].clone()).collect();
        assert_eq!(seen, vec![json!(1), json!(3)]);
        assert_eq!(record.report.node("b").unwrap().firings, 2);
        assert!(record.report.succeeded());
    }

    #[tokio::test]
    async fn test_buffered_edge_collects_all_emissions() {
        let mut registry = HandlerRegistry::with_builtins();
        registry
            .register(
                ScriptedHandler::new("src")
                    .emit_value("out", json!("x"))
                    .emit_value("out", json!("y")),
            )
            .unwrap();
        let sched = scheduler_with(registry, EngineConfig::default());
        let graph = Graph::new()
            .with_node(source("a", "src", ValueType::String))
            .with_node(Node::new("b", "collect").with_input("items", ValueType::Array))
            .with_edge(Edge::new("e", ("a", "out"), ("b", "items")).with_mode(Mode::BUFFER));
        let record = run(&sched, graph).await;

        assert_eq!(record.report.node("b").unwrap().state, NodeState::Success);
        let outputs = record.outputs("b");
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0]["items"], json!(["x", "y"]));
        assert_eq!(outputs[0]["count"], json!(2));
    }

    #[tokio::test]
    async fn test_multi_join_waits_for_both_sources() {
        let fast = ScriptedHandler::new("fast").emit_value("out", json!("f"));
        let slow = ScriptedHandler::new("slow")
            .emit_value("out", json!("s"))
            .with_delay(Duration::from_millis(30));
        let join = ScriptedHandler::new("join").emit_value("ok", json!(true));
        let calls = join.calls();
        let sched = scheduler(|r| {
            r.register(fast).unwrap();
            r.register(slow).unwrap();
            r.register(join).unwrap();
        });
        let graph = Graph::new()
            .with_node(source("a", "fast", ValueType::String))
            .with_node(source("b", "slow", ValueType::String))
            .with_node(Node::new("j", "join").with_input("in", ValueType::Array))
            .with_edge(Edge::new("e1", ("a", "out"), ("j", "in")).with_mode(Mode::MULTI))
            .with_edge(Edge::new("e2", ("b", "out"), ("j", "in")).with_mode(Mode::MULTI));
        let record = run(&sched, graph).await;

        assert_eq!(calls.count(), 1);
        assert_eq!(calls.inputs()[0]["in"], json!(["f", "s"]));
        assert!(record.report.succeeded());
    }

    #[tokio::test]
    async fn test_zip_pairs_and_drops_leftovers() {
        let left = ScriptedHandler::new("left")
            .emit_value("out", json!("a1"))
            .emit_value("out", json!("a2"))
            .emit_value("out", json!("a3"));
        let right = ScriptedHandler::new("right")
            .emit_value("out", json!("b1"))
            .emit_value("out", json!("b2"));
        let pair = ScriptedHandler::new("pair").emit_value("ok", json!(true));
        let calls = pair.calls();
        let sched = scheduler(|r| {
            r.register(left).unwrap();
            r.register(right).unwrap();
            r.register(pair).unwrap();
        });
        let graph = Graph::new()
            .with_node(source("a", "left", ValueType::String))
            .with_node(source("b", "right", ValueType::String))
            .with_node(
                Node::new("z", "pair")
                    .with_input("l", ValueType::String)
                    .with_input("r", ValueType::String),
            )
            .with_edge(Edge::new("e1", ("a", "out"), ("z", "l")).with_mode(Mode::ZIP))
            .with_edge(Edge::new("e2", ("b", "out"), ("z", "r")).with_mode(Mode::ZIP));
        let record = run(&sched, graph).await;

        let pairs: Vec<(Value, Value)> = calls
            .inputs()
            .into_iter()
            .map(|i| (i["l"].clone(), i["r"].clone()))
            .collect();
        assert_eq!(
            pairs,
            vec![(json!("a1"), json!("b1")), (json!("a2"), json!("b2"))]
        );
        assert_eq!(record.report.node("z").unwrap().firings, 2);
    }

    #[tokio::test]
    async fn test_failed_source_stalls_strict_dependents() {
        let sched = scheduler(|r| {
            r.register(ScriptedHandler::new("bad").failing("boom")).unwrap();
            r.register(ScriptedHandler::new("ok")).unwrap();
        });
        let graph = Graph::new()
            .with_node(source("a", "bad", ValueType::Any))
            .with_node(Node::new("c", "ok").with_input("in", ValueType::Any))
            .with_edge(Edge::new("e", ("a", "out"), ("c", "in")));
        let record = run(&sched, graph).await;

        let a = record.report.node("a").unwrap();
        assert_eq!(a.state, NodeState::Fail);
        assert_eq!(a.error.as_deref(), Some("Node handler failed: bad: boom"));
        let c = record.report.node("c").unwrap();
        assert_eq!(c.state, NodeState::Pending);
        assert!(c.stalled);
        assert_eq!(record.report.stalled(), vec!["c"]);
        assert!(record.node_states("c").is_empty());
        assert_eq!(record.report.outcome, RunOutcome::Failed);
    }

    #[tokio::test]
    async fn test_cancellation_mid_run() {
        let sched = scheduler(|r| {
            r.register(StalledHandler::new("hang")).unwrap();
            r.register(ScriptedHandler::new("next")).unwrap();
        });
        let graph = Graph::new()
            .with_node(source("a", "hang", ValueType::Any))
            .with_node(Node::new("b", "next").with_input("in", ValueType::Any))
            .with_edge(Edge::new("e", ("a", "out"), ("b", "in")));
        let ctx = ExecutionContext::new();
        let handle = sched.execute(graph, &ctx).unwrap();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });
        let record = tokio::time::timeout(Duration::from_secs(5), handle.into_record())
            .await
            .expect("cancelled run did not finish")
            .unwrap();

        assert_eq!(
            record.node_states("a"),
            vec![NodeState::Pending, NodeState::Running, NodeState::Fail]
        );
        let error = record.report.node("a").unwrap().error.clone().unwrap();
        assert!(error.contains("cancelled"));
        assert!(record.node_states("b").is_empty());
        assert_eq!(record.report.outcome, RunOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_feedback_loop_refires_until_handler_stops() {
        let sched = scheduler_with(HandlerRegistry::with_builtins(), EngineConfig::default());
        let record = run(&sched, counting_loop(3)).await;

        let summary = record.report.node("loop").unwrap();
        assert_eq!(summary.firings, 3);
        assert_eq!(summary.state, NodeState::Success);
        let one_firing = [
            NodeState::Pending,
            NodeState::Running,
            NodeState::Emitting,
            NodeState::Success,
        ];
        assert_eq!(record.node_states("loop"), one_firing.repeat(3));
        let outputs = record.outputs("loop");
        assert_eq!(outputs.last().unwrap().get("done"), Some(&json!(3)));
        let cycles: Vec<u32> = record
            .events
            .iter()
            .filter(|e| e.node_id == "loop" && e.state == NodeState::Running)
            .map(|e| e.cycle)
            .collect();
        assert_eq!(cycles, vec![1, 2, 3]);
        assert!(record.report.succeeded());
    }

    #[tokio::test]
    async fn test_firing_limit_fails_runaway_loop() {
        let config = EngineConfig {
            max_firings_per_node: 4,
            ..EngineConfig::default()
        };
        let sched = scheduler_with(HandlerRegistry::with_builtins(), config);
        let record = run(&sched, counting_loop(1000)).await;

        let summary = record.report.node("loop").unwrap();
        assert_eq!(summary.firings, 4);
        assert_eq!(summary.state, NodeState::Fail);
        assert!(summary.error.as_deref().unwrap().contains("limit of 4 firings"));
        assert_eq!(record.report.outcome, RunOutcome::Failed);

        // Four clean firings, then the refused fifth
        let states = record.node_states("loop");
        assert_eq!(states.len(), 17);
        assert_eq!(states.iter().filter(|s| **s == NodeState::Fail).count(), 1);
        assert_eq!(states.last(), Some(&NodeState::Fail));
        let cycles: Vec<u32> = record
            .events
            .iter()
            .filter(|e| e.node_id == "loop" && e.state == NodeState::Running)
            .map(|e| e.cycle)
            .collect();
        assert_eq!(cycles, vec![1, 2, 3, 4]);
    }

    fn collector() -> Node {
        Node::new("all", "collect")
            .with_input("items", ValueType::Array)
            .with_output("items", ValueType::Array)
            .with_output("count", ValueType::Number)
    }

    #[tokio::test]
    async fn test_buffered_edge_out_of_a_loop_closes_when_the_loop_settles() {
        let sched = scheduler_with(HandlerRegistry::with_builtins(), EngineConfig::default());
        let graph = counting_loop(3)
            .with_node(collector())
            .with_edge(Edge::new("out", ("loop", "next"), ("all", "items")).with_mode(Mode::BUFFER));
        let record = run(&sched, graph).await;

        assert!(!record.node_states("loop").contains(&NodeState::Fail));
        assert_eq!(record.report.node("loop").unwrap().firings, 3);
        let all = record.report.node("all").unwrap();
        assert_eq!(all.state, NodeState::Success);
        assert!(!all.stalled);
        let outputs = record.outputs("all");
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0]["items"], json!([1, 2]));
        assert_eq!(outputs[0]["count"], json!(2));
        assert_eq!(record.report.outcome, RunOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_two_node_cycle_feeds_downstream_collector() {
        let sched = scheduler_with(HandlerRegistry::with_builtins(), EngineConfig::default());
        let graph = Graph::new()
            .with_node(
                source("seed", "constant", ValueType::Number).with_metadata("value", json!(0)),
            )
            .with_node(
                Node::new("loop", "iterate")
                    .with_input("value", ValueType::Number)
                    .with_output("next", ValueType::Number)
                    .with_output("done", ValueType::Number)
                    .with_metadata("limit", json!(4)),
            )
            .with_node(
                Node::new("relay", "passthrough")
                    .with_input("in", ValueType::Any)
                    .with_output("out", ValueType::Any),
            )
            .with_node(collector())
            .with_edge(Edge::new("init", ("seed", "out"), ("loop", "value")))
            .with_edge(Edge::new("fwd", ("loop", "next"), ("relay", "in")))
            .with_edge(Edge::new("back", ("relay", "out"), ("loop", "value")))
            .with_edge(Edge::new("tap", ("relay", "out"), ("all", "items")).with_mode(Mode::BUFFER));
        let record = run(&sched, graph).await;

        assert_eq!(record.report.node("loop").unwrap().firings, 4);
        assert_eq!(record.report.node("relay").unwrap().firings, 3);
        assert_eq!(record.outputs("all")[0]["items"], json!([1, 2, 3]));
        assert_eq!(record.report.node("all").unwrap().firings, 1);
        assert!(record.report.stalled().is_empty());
        assert!(record.report.succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_window_reports_deadlock() {
        let sched = stalled_scheduler(EngineConfig {
            inactivity_timeout_ms: 500,
            ..EngineConfig::default()
        });
        let record = sched
            .execute(Graph::new().with_node(Node::new("a", "hang")), &ExecutionContext::new())
            .unwrap()
            .into_record()
            .await
            .unwrap();

        assert_eq!(record.report.outcome, RunOutcome::Deadlocked);
        assert!(matches!(
            record.errors.as_slice(),
            [WeftError::Deadlock {
                idle_ms: 500,
                in_flight: 1
            }]
        ));
        assert_eq!(record.node_states("a").last(), Some(&NodeState::Fail));
    }

    #[tokio::test]
    async fn test_wait_returns_deadlock_error() {
        let sched = stalled_scheduler(EngineConfig {
            inactivity_timeout_ms: 20,
            ..EngineConfig::default()
        });
        let handle = sched
            .execute(Graph::new().with_node(Node::new("a", "hang")), &ExecutionContext::new())
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert!(matches!(result, Err(WeftError::Deadlock { .. })));
    }

    #[tokio::test]
    async fn test_run_timeout_cancels_only_the_run() {
        let sched = stalled_scheduler(EngineConfig {
            run_timeout_ms: Some(30),
            ..EngineConfig::default()
        });
        let ctx = ExecutionContext::new();
        let handle = sched
            .execute(Graph::new().with_node(Node::new("a", "hang")), &ctx)
            .unwrap();
        let record = tokio::time::timeout(Duration::from_secs(5), handle.into_record())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.report.outcome, RunOutcome::Cancelled);
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_queued_nodes_receive_upstream_values() {
        let queue = Arc::new(RecordingQueue::succeeding(vec![output([("n", json!(42))])]));
        let dispatcher =
            Dispatcher::new(Arc::new(HandlerRegistry::with_builtins())).with_queue(queue.clone());
        let sched = GraphScheduler::new(Arc::new(dispatcher), EngineConfig::default());
        let graph = Graph::new()
            .with_node(
                source("seed", "constant", ValueType::String)
                    .with_metadata("value", json!("https://a")),
            )
            .with_node(Node::new("crawl", "remote_crawl").with_input("url", ValueType::String))
            .with_edge(Edge::new("e", ("seed", "out"), ("crawl", "url")));
        let record = run(&sched, graph).await;

        let jobs = queue.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].inputs["url"], json!("https://a"));
        assert_eq!(record.outputs("crawl")[0]["n"], json!(42));
    }

    #[test]
    fn test_validation_and_routing_errors_precede_run() {
        let sched = scheduler(|r| r.register(ScriptedHandler::new("ok")).unwrap());
        let invalid = Graph::new()
            .with_node(source("a", "ok", ValueType::Any))
            .with_edge(Edge::new("e", ("a", "out"), ("ghost", "in")));
        assert!(matches!(
            sched.execute(invalid, &ExecutionContext::new()),
            Err(WeftError::Validation(_))
        ));

        let unroutable = Graph::new().with_node(Node::new("a", "mystery"));
        assert!(matches!(
            sched.execute(unroutable, &ExecutionContext::new()),
            Err(WeftError::NoExecutor(_))
        ));
    }

    #[tokio::test]
    async fn test_events_are_mirrored_on_the_bus() {
        let bus = Arc::new(EventBus::new(64));
        let mut rx = bus.subscribe();
        let sched = scheduler(|r| r.register(ScriptedHandler::new("ok")).unwrap())
            .with_event_bus(bus.clone());
        let record = run(&sched, Graph::new().with_node(Node::new("a", "ok"))).await;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(matches!(
            seen.first(),
            Some(EngineEvent::RunStarted { nodes: 1, .. })
        ));
        assert!(matches!(
            seen.last(),
            Some(EngineEvent::RunFinished {
                outcome: RunOutcome::Succeeded,
                ..
            })
        ));
        assert_eq!(seen.len(), record.events.len() + 2);
    }
}
